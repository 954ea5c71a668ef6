use crate::{
    db::DbPool,
    entities::{order, processed_payment},
    errors::{is_unique_violation, ServiceError},
    events::{outbox, Event, EventSender, NotificationRequest, OrderCreatedPayload, ORDER_CREATED},
    services::{
        catalog::find_product, devices::reserve_device, non_blank,
        notifications::ORDER_CREATED_KIND, plans::find_plan,
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const DELIVERY_LEAD_DAYS: i64 = 5;

/// Promised delivery date for an order created at `created_at`.
pub fn delivery_date_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::days(DELIVERY_LEAD_DAYS)
}

/// Input of one fulfillment: reserve a device and record the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentRequest {
    pub product_id: Uuid,
    pub plan_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub delivery_address: Option<String>,
    /// Provider transaction id; when set it is recorded as processed in the
    /// same transaction.
    #[serde(default)]
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentOutcome {
    Created(order::Model),
    /// The payment id already has a marker; nothing was written.
    AlreadyProcessed,
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    default_delivery_address: String,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        default_delivery_address: String,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            default_delivery_address,
        }
    }

    /// Whether a marker exists for `payment_id`.
    pub async fn is_payment_processed(&self, payment_id: &str) -> Result<bool, ServiceError> {
        let marker = processed_payment::Entity::find_by_id(payment_id.to_string())
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(marker.is_some())
    }

    /// Marker, catalog lookup, device reservation, order insert and outbox
    /// row, all in one transaction. Any failure rolls everything back.
    #[instrument(skip(self, request), fields(product_id = %request.product_id, plan_id = %request.plan_id, user_id = %request.user_id, payment_id = ?request.payment_id))]
    pub async fn fulfill(
        &self,
        request: FulfillmentRequest,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for fulfillment");
            ServiceError::db_error(e)
        })?;

        if let Some(payment_id) = &request.payment_id {
            let marker = processed_payment::ActiveModel {
                id: Set(payment_id.clone()),
                processed_at: Set(Utc::now()),
            };
            if let Err(e) = marker.insert(&txn).await {
                if is_unique_violation(&e) {
                    info!(%payment_id, "Payment already processed");
                    rollback(txn).await;
                    return Ok(FulfillmentOutcome::AlreadyProcessed);
                }
                rollback(txn).await;
                return Err(ServiceError::db_error(e));
            }
        }

        match self.fulfill_in(&txn, &request).await {
            Ok(created) => {
                txn.commit().await.map_err(|e| {
                    error!(error = %e, "Failed to commit fulfillment");
                    ServiceError::db_error(e)
                })?;
                counter!("arfind.orders.created", 1);
                info!(order_id = %created.id, device_id = %created.device_id, "Order created");
                Ok(FulfillmentOutcome::Created(created))
            }
            Err(e) => {
                rollback(txn).await;
                Err(e)
            }
        }
    }

    async fn fulfill_in(
        &self,
        txn: &DatabaseTransaction,
        request: &FulfillmentRequest,
    ) -> Result<order::Model, ServiceError> {
        let product = find_product(txn, request.product_id).await?;
        let plan = find_plan(txn, request.plan_id).await?;
        let device = reserve_device(txn, product.id, plan.id, &request.user_id).await?;

        let created_at = Utc::now();
        let delivery_date = delivery_date_for(created_at);
        let address = non_blank(request.delivery_address.clone())
            .unwrap_or_else(|| self.default_delivery_address.clone());

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(request.user_id.clone()),
            product_id: Set(product.id),
            device_id: Set(device.id),
            plan_id: Set(plan.id),
            delivered: Set(false),
            created_at: Set(created_at),
            delivery_date: Set(Some(delivery_date)),
            delivered_at: Set(None),
            delivery_address: Set(address),
            payment_id: Set(request.payment_id.clone()),
        }
        .insert(txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut params = BTreeMap::new();
        params.insert("producto".to_string(), product.title.clone());
        params.insert("plan".to_string(), plan.name.clone());
        params.insert(
            "fecha_entrega".to_string(),
            delivery_date.format("%d/%m/%Y").to_string(),
        );
        params.insert("telefono".to_string(), device.phone_number.clone());

        let payload = OrderCreatedPayload {
            order_id: order.id,
            notification: NotificationRequest {
                user_id: request.user_id.clone(),
                device_id: Some(device.id),
                kind: ORDER_CREATED_KIND.to_string(),
                params,
            },
        };
        outbox::enqueue(txn, "order", Some(order.id), ORDER_CREATED, &payload).await?;

        Ok(order)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<order::Model>, ServiceError> {
        order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn list_all(&self) -> Result<Vec<order::Model>, ServiceError> {
        order::Entity::find()
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    /// Flips `delivered` once; a second call is a conflict.
    #[instrument(skip(self))]
    pub async fn mark_delivered(&self, id: Uuid) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let result = order::Entity::update_many()
            .col_expr(order::Column::Delivered, Expr::value(true))
            .col_expr(order::Column::DeliveredAt, Expr::value(now))
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::Delivered.eq(false))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let order = self.get_order(id).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Order {} was already delivered",
                id
            )));
        }

        if let Err(e) = self.event_sender.send(Event::OrderDelivered(id)).await {
            warn!(error = %e, "Failed to publish OrderDelivered");
        }
        Ok(order)
    }
}

async fn rollback(txn: DatabaseTransaction) {
    if let Err(e) = txn.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delivery_is_exactly_five_days_later() {
        let created = Utc.with_ymd_and_hms(2024, 2, 26, 23, 59, 59).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 2, 23, 59, 59).unwrap();
        assert_eq!(delivery_date_for(created), expected);
        assert_eq!((delivery_date_for(created) - created).num_seconds(), 5 * 86_400);
    }

    #[test]
    fn fulfillment_request_defaults_optional_fields() {
        let request: FulfillmentRequest = serde_json::from_value(serde_json::json!({
            "product_id": Uuid::nil(),
            "plan_id": Uuid::nil(),
            "user_id": "u1"
        }))
        .unwrap();
        assert!(request.delivery_address.is_none());
        assert!(request.payment_id.is_none());
    }
}
