use crate::{
    db::DbPool,
    entities::employee,
    errors::{is_unique_violation, ServiceError},
    services::{non_blank, require_any_field},
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateEmployeeRequest {
    /// Identity provider uid
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateEmployeeRequest {
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 120))]
    pub name: Option<String>,
    pub is_admin: Option<bool>,
}

#[derive(Clone)]
pub struct EmployeeService {
    db_pool: Arc<DbPool>,
}

impl EmployeeService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn create_employee(
        &self,
        request: CreateEmployeeRequest,
    ) -> Result<employee::Model, ServiceError> {
        request.validate()?;
        let model = employee::ActiveModel {
            id: Set(request.id),
            email: Set(request.email.to_lowercase()),
            name: Set(request.name),
            is_admin: Set(request.is_admin),
            created_at: Set(Utc::now()),
        };
        let created = model.insert(&*self.db_pool).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict("Employee id or email already registered".to_string())
            } else {
                ServiceError::db_error(e)
            }
        })?;
        info!(employee_id = %created.id, "Employee created");
        Ok(created)
    }

    pub async fn list_employees(&self) -> Result<Vec<employee::Model>, ServiceError> {
        employee::Entity::find()
            .order_by_asc(employee::Column::Name)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn get_employee(&self, id: &str) -> Result<employee::Model, ServiceError> {
        employee::Entity::find_by_id(id.to_string())
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Employee {} not found", id)))
    }

    #[instrument(skip(self, request))]
    pub async fn update_employee(
        &self,
        id: &str,
        request: UpdateEmployeeRequest,
    ) -> Result<employee::Model, ServiceError> {
        let email = non_blank(request.email.clone());
        let name = non_blank(request.name.clone());
        require_any_field(email.is_some() || name.is_some() || request.is_admin.is_some())?;
        request.validate()?;

        let existing = self.get_employee(id).await?;
        let mut active: employee::ActiveModel = existing.into();
        if let Some(email) = email {
            active.email = Set(email.to_lowercase());
        }
        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(is_admin) = request.is_admin {
            active.is_admin = Set(is_admin);
        }
        active.update(&*self.db_pool).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict("Email already registered".to_string())
            } else {
                ServiceError::db_error(e)
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_employee(&self, id: &str) -> Result<(), ServiceError> {
        let result = employee::Entity::delete_by_id(id.to_string())
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Employee {} not found", id)));
        }
        info!(employee_id = %id, "Employee deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_email() {
        let request = CreateEmployeeRequest {
            id: "uid-9".into(),
            email: "not-an-email".into(),
            name: "Ana".into(),
            is_admin: false,
        };
        assert!(request.validate().is_err());
    }
}
