use crate::{
    db::DbPool,
    entities::{order, product},
    errors::ServiceError,
    services::{non_blank, require_any_field, storage::ObjectStore},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,
    #[validate(custom = "validate_price")]
    pub price: Decimal,
    #[validate(length(min = 1, message = "Description is required"))]
    pub description: String,
    pub short_description: Option<String>,
}

/// Partial update; absent or blank fields are left alone.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateProductRequest {
    #[validate(length(max = 200))]
    pub title: Option<String>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub image_key: Option<String>,
}

pub(crate) fn validate_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() {
        return Err(ValidationError::new("price_must_not_be_negative"));
    }
    Ok(())
}

/// Looks up a product by id inside any connection or transaction.
pub async fn find_product<C: ConnectionTrait>(
    db: &C,
    id: Uuid,
) -> Result<product::Model, ServiceError> {
    product::Entity::find_by_id(id)
        .one(db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
}

/// Product catalog backed by the `products` table and an object store for images
#[derive(Clone)]
pub struct CatalogService {
    db_pool: Arc<DbPool>,
    store: Arc<dyn ObjectStore>,
}

impl CatalogService {
    pub fn new(db_pool: Arc<DbPool>, store: Arc<dyn ObjectStore>) -> Self {
        Self { db_pool, store }
    }

    pub async fn list_products(&self) -> Result<Vec<product::Model>, ServiceError> {
        product::Entity::find()
            .order_by_asc(product::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn get_product(&self, id: Uuid) -> Result<product::Model, ServiceError> {
        find_product(&*self.db_pool, id).await
    }

    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(request.title.trim().to_string()),
            price: Set(request.price),
            description: Set(request.description),
            short_description: Set(non_blank(request.short_description)),
            image_key: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, "Failed to create product");
            ServiceError::db_error(e)
        })?;
        info!(product_id = %created.id, "Product created");
        Ok(created)
    }

    #[instrument(skip(self, request))]
    pub async fn update_product(
        &self,
        id: Uuid,
        request: UpdateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        let title = non_blank(request.title);
        let description = non_blank(request.description);
        let short_description = non_blank(request.short_description);
        let image_key = non_blank(request.image_key);
        require_any_field(
            title.is_some()
                || description.is_some()
                || short_description.is_some()
                || image_key.is_some(),
        )?;

        let existing = self.get_product(id).await?;
        let mut active: product::ActiveModel = existing.into();
        if let Some(title) = title {
            active.title = Set(title);
        }
        if let Some(description) = description {
            active.description = Set(description);
        }
        if short_description.is_some() {
            active.short_description = Set(short_description);
        }
        if image_key.is_some() {
            active.image_key = Set(image_key);
        }
        active.updated_at = Set(Utc::now());

        active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Stores new image bytes under a generated key and drops the previous object.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn replace_image(
        &self,
        id: Uuid,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<product::Model, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::ValidationError("Image body is empty".to_string()));
        }
        let existing = self.get_product(id).await?;
        let previous = existing.image_key.clone();

        let key = crate::services::storage::product_image_key(content_type);
        self.store.put(&key, bytes).await?;

        let mut active: product::ActiveModel = existing.into();
        active.image_key = Set(Some(key.clone()));
        active.updated_at = Set(Utc::now());
        let updated = match active.update(&*self.db_pool).await {
            Ok(updated) => updated,
            Err(e) => {
                // Row was not updated, so the new object is orphaned.
                if let Err(cleanup) = self.store.delete(&key).await {
                    warn!(error = %cleanup, key, "Failed to remove orphaned image");
                }
                return Err(ServiceError::db_error(e));
            }
        };

        if let Some(old) = previous {
            if let Err(e) = self.store.delete(&old).await {
                warn!(error = %e, key = %old, "Failed to delete previous product image");
            }
        }
        Ok(updated)
    }

    /// Deletes a product that no order references, then its stored image.
    #[instrument(skip(self))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let existing = self.get_product(id).await?;

        let references = order::Entity::find()
            .filter(order::Column::ProductId.eq(id))
            .count(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if references > 0 {
            return Err(ServiceError::Conflict(format!(
                "Product {} is referenced by {} order(s)",
                id, references
            )));
        }

        product::Entity::delete_by_id(id)
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(key) = existing.image_key {
            if let Err(e) = self.store.delete(&key).await {
                warn!(error = %e, key, "Failed to delete product image");
            }
        }
        info!(product_id = %id, "Product deleted");
        Ok(())
    }
}
