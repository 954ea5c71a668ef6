use crate::{
    db::DbPool,
    entities::{notification, notification_type},
    errors::{is_unique_violation, ServiceError},
    events::{outbox::OutboxDispatcher, Event, EventSender, NotificationRequest, OrderCreatedPayload, ORDER_CREATED},
    services::{non_blank, require_any_field},
};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Notification type kind sent when an order is created
pub const ORDER_CREATED_KIND: &str = "pedido_creado";

/// Replaces every `{{key}}` in `template` with its value. Unknown markers stay.
pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> String {
    params.iter().fold(template.to_string(), |message, (key, value)| {
        message.replace(&format!("{{{{{}}}}}", key), value)
    })
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateNotificationTypeRequest {
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    #[validate(length(min = 1, max = 64))]
    pub kind: String,
    #[validate(length(min = 1))]
    pub message_template: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateNotificationTypeRequest {
    pub kind: Option<String>,
    pub message_template: Option<String>,
}

/// Admin request to render and store a notification
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateNotificationRequest {
    #[validate(length(min = 1))]
    pub user_id: String,
    pub device_id: Option<Uuid>,
    #[validate(length(min = 1))]
    pub notification_type_id: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct NotificationService {
    db_pool: Arc<DbPool>,
}

impl NotificationService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request), fields(id = %request.id, kind = %request.kind))]
    pub async fn create_type(
        &self,
        request: CreateNotificationTypeRequest,
    ) -> Result<notification_type::Model, ServiceError> {
        request.validate()?;
        let model = notification_type::ActiveModel {
            id: Set(request.id.trim().to_string()),
            kind: Set(request.kind.trim().to_string()),
            message_template: Set(request.message_template),
        };
        model.insert(&*self.db_pool).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict("Notification type id or kind already exists".to_string())
            } else {
                ServiceError::db_error(e)
            }
        })
    }

    pub async fn list_types(&self) -> Result<Vec<notification_type::Model>, ServiceError> {
        notification_type::Entity::find()
            .order_by_asc(notification_type::Column::Id)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn get_type(&self, id: &str) -> Result<notification_type::Model, ServiceError> {
        notification_type::Entity::find_by_id(id.to_string())
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Notification type {} not found", id)))
    }

    #[instrument(skip(self, request))]
    pub async fn update_type(
        &self,
        id: &str,
        request: UpdateNotificationTypeRequest,
    ) -> Result<notification_type::Model, ServiceError> {
        let kind = non_blank(request.kind);
        let template = non_blank(request.message_template);
        require_any_field(kind.is_some() || template.is_some())?;

        let existing = self.get_type(id).await?;
        let mut active: notification_type::ActiveModel = existing.into();
        if let Some(kind) = kind {
            active.kind = Set(kind);
        }
        if let Some(template) = template {
            active.message_template = Set(template);
        }
        active.update(&*self.db_pool).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict("Notification kind already exists".to_string())
            } else {
                ServiceError::db_error(e)
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_type(&self, id: &str) -> Result<(), ServiceError> {
        let result = notification_type::Entity::delete_by_id(id.to_string())
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Notification type {} not found", id)));
        }
        Ok(())
    }

    /// Renders the template of `notification_type_id` and stores the message.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, type_id = %request.notification_type_id))]
    pub async fn create_notification(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<notification::Model, ServiceError> {
        request.validate()?;
        let kind = self.get_type(&request.notification_type_id).await?;
        self.persist(&kind, &request.user_id, request.device_id, &request.params)
            .await
    }

    /// Same as [`Self::create_notification`] but resolves the type by `kind`.
    pub async fn notify_by_kind(
        &self,
        request: &NotificationRequest,
    ) -> Result<notification::Model, ServiceError> {
        let kind = notification_type::Entity::find()
            .filter(notification_type::Column::Kind.eq(request.kind.as_str()))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Notification kind {} not found", request.kind))
            })?;
        self.persist(&kind, &request.user_id, request.device_id, &request.params)
            .await
    }

    async fn persist(
        &self,
        kind: &notification_type::Model,
        user_id: &str,
        device_id: Option<Uuid>,
        params: &BTreeMap<String, String>,
    ) -> Result<notification::Model, ServiceError> {
        let model = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id.to_string()),
            device_id: Set(device_id),
            notification_type_id: Set(kind.id.clone()),
            message: Set(render_template(&kind.message_template, params)),
            sent_at: Set(Utc::now()),
        };
        let stored = model
            .insert(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        debug!(notification_id = %stored.id, kind = %kind.kind, "Notification stored");
        Ok(stored)
    }

    /// Newest first; an empty inbox is reported as not found.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        let items = notification::Entity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .order_by_desc(notification::Column::SentAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if items.is_empty() {
            return Err(ServiceError::NotFound(
                "No notifications for this user".to_string(),
            ));
        }
        Ok(items)
    }
}

/// Turns drained outbox rows into stored notifications and in-process events.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifications: Arc<NotificationService>,
    event_sender: EventSender,
}

impl NotificationDispatcher {
    pub fn new(notifications: Arc<NotificationService>, event_sender: EventSender) -> Self {
        Self {
            notifications,
            event_sender,
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl OutboxDispatcher for NotificationDispatcher {
    async fn dispatch(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        match event_type {
            ORDER_CREATED => {
                let payload: OrderCreatedPayload = serde_json::from_value(payload.clone())?;
                let stored = self.notifications.notify_by_kind(&payload.notification).await?;
                info!(order_id = %payload.order_id, notification_id = %stored.id, "Order notification dispatched");

                if let Some(device_id) = payload.notification.device_id {
                    self.publish(Event::OrderCreated {
                        order_id: payload.order_id,
                        user_id: payload.notification.user_id.clone(),
                        device_id,
                    })
                    .await;
                }
                self.publish(Event::NotificationCreated {
                    notification_id: stored.id,
                    user_id: stored.user_id,
                })
                .await;
                Ok(())
            }
            other => {
                warn!(event_type = other, "No dispatcher for outbox event type");
                Ok(())
            }
        }
    }
}
