use crate::{
    db::DbPool,
    entities::customer,
    errors::{is_unique_violation, ServiceError},
    services::{non_blank, require_any_field},
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    #[validate(length(max = 80))]
    pub first_name: Option<String>,
    #[validate(length(max = 80))]
    pub last_name: Option<String>,
    #[validate(length(min = 6, max = 32))]
    pub phone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateCustomerRequest {
    #[validate(length(max = 80))]
    pub first_name: Option<String>,
    #[validate(length(max = 80))]
    pub last_name: Option<String>,
    #[validate(length(min = 6, max = 32))]
    pub phone: Option<String>,
}

/// Profiles keyed by the caller's uid
#[derive(Clone)]
pub struct CustomerService {
    db_pool: Arc<DbPool>,
}

impl CustomerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request))]
    pub async fn create_profile(
        &self,
        user_id: &str,
        email: Option<String>,
        request: CreateCustomerRequest,
    ) -> Result<customer::Model, ServiceError> {
        request.validate()?;
        let now = Utc::now();
        let model = customer::ActiveModel {
            id: Set(user_id.to_string()),
            email: Set(email),
            first_name: Set(non_blank(request.first_name)),
            last_name: Set(non_blank(request.last_name)),
            phone: Set(non_blank(request.phone)),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let created = model.insert(&*self.db_pool).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict("Profile already exists".to_string())
            } else {
                ServiceError::db_error(e)
            }
        })?;
        info!(customer_id = %created.id, "Customer profile created");
        Ok(created)
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<customer::Model, ServiceError> {
        customer::Entity::find_by_id(user_id.to_string())
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Customer profile not found".to_string()))
    }

    #[instrument(skip(self, request))]
    pub async fn update_profile(
        &self,
        user_id: &str,
        request: UpdateCustomerRequest,
    ) -> Result<customer::Model, ServiceError> {
        request.validate()?;
        let first_name = non_blank(request.first_name);
        let last_name = non_blank(request.last_name);
        let phone = non_blank(request.phone);
        require_any_field(first_name.is_some() || last_name.is_some() || phone.is_some())?;

        let existing = self.get_profile(user_id).await?;
        let mut active: customer::ActiveModel = existing.into();
        if first_name.is_some() {
            active.first_name = Set(first_name);
        }
        if last_name.is_some() {
            active.last_name = Set(last_name);
        }
        if phone.is_some() {
            active.phone = Set(phone);
        }
        active.updated_at = Set(Utc::now());
        active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}
