use crate::{
    db::DbPool,
    entities::plan,
    errors::ServiceError,
    services::{catalog::validate_price, non_blank, require_any_field},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(custom = "validate_price")]
    pub price: Decimal,
    pub description: String,
    #[validate(range(min = 1, message = "Refresh rate must be at least one second"))]
    pub refresh_rate: i32,
    #[validate(range(min = 0))]
    pub shared_user_quota: i32,
    pub image_key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdatePlanRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: Option<String>,
    #[validate(custom = "validate_price")]
    pub price: Option<Decimal>,
    pub description: Option<String>,
    #[validate(range(min = 1))]
    pub refresh_rate: Option<i32>,
    #[validate(range(min = 0))]
    pub shared_user_quota: Option<i32>,
    pub image_key: Option<String>,
}

impl UpdatePlanRequest {
    fn has_any_field(&self) -> bool {
        self.name.is_some()
            || self.price.is_some()
            || self.description.is_some()
            || self.refresh_rate.is_some()
            || self.shared_user_quota.is_some()
            || self.image_key.is_some()
    }
}

pub async fn find_plan<C: ConnectionTrait>(db: &C, id: Uuid) -> Result<plan::Model, ServiceError> {
    plan::Entity::find_by_id(id)
        .one(db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Plan {} not found", id)))
}

#[derive(Clone)]
pub struct PlanService {
    db_pool: Arc<DbPool>,
}

impl PlanService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    pub async fn list_plans(&self) -> Result<Vec<plan::Model>, ServiceError> {
        plan::Entity::find()
            .order_by_asc(plan::Column::Price)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<plan::Model, ServiceError> {
        find_plan(&*self.db_pool, id).await
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_plan(&self, request: CreatePlanRequest) -> Result<plan::Model, ServiceError> {
        request.validate()?;
        let model = plan::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            price: Set(request.price),
            description: Set(request.description),
            refresh_rate: Set(request.refresh_rate),
            shared_user_quota: Set(request.shared_user_quota),
            image_key: Set(non_blank(request.image_key)),
            created_at: Set(Utc::now()),
        };
        let created = model
            .insert(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        info!(plan_id = %created.id, "Plan created");
        Ok(created)
    }

    #[instrument(skip(self, request))]
    pub async fn update_plan(
        &self,
        id: Uuid,
        request: UpdatePlanRequest,
    ) -> Result<plan::Model, ServiceError> {
        require_any_field(request.has_any_field())?;
        request.validate()?;

        let existing = self.get_plan(id).await?;
        let mut active: plan::ActiveModel = existing.into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if let Some(price) = request.price {
            active.price = Set(price);
        }
        if let Some(description) = request.description {
            active.description = Set(description);
        }
        if let Some(refresh_rate) = request.refresh_rate {
            active.refresh_rate = Set(refresh_rate);
        }
        if let Some(quota) = request.shared_user_quota {
            active.shared_user_quota = Set(quota);
        }
        if let Some(image_key) = request.image_key {
            active.image_key = Set(non_blank(Some(image_key)));
        }

        active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn delete_plan(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = plan::Entity::delete_by_id(id)
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Plan {} not found", id)));
        }
        info!(plan_id = %id, "Plan deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_is_detected() {
        assert!(!UpdatePlanRequest::default().has_any_field());
        let update = UpdatePlanRequest {
            refresh_rate: Some(30),
            ..Default::default()
        };
        assert!(update.has_any_field());
    }

    #[test]
    fn zero_refresh_rate_is_rejected() {
        let update = UpdatePlanRequest {
            refresh_rate: Some(0),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }
}
