use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::{AdminUser, AuthenticatedUser},
    errors::ServiceError,
    services::catalog::{CreateProductRequest, UpdateProductRequest},
    AppState,
};
use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{header, HeaderMap},
    response::Response,
    routing::{get, put},
    Router,
};
use uuid::Uuid;

pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(list_products).post(create_product))
        .route(
            "/products/:id",
            get(get_product).patch(update_product).delete(delete_product),
        )
        .route("/products/:id/image", put(upload_image))
}

async fn list_products(State(state): State<AppState>) -> Result<Response, ServiceError> {
    let products = state.services.catalog.list_products().await?;
    Ok(success_response(products))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let product = state.services.catalog.get_product(id).await?;
    Ok(success_response(product))
}

async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateProductRequest>,
) -> Result<Response, ServiceError> {
    let product = state.services.catalog.create_product(request).await?;
    Ok(created_response(product))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _user: AuthenticatedUser,
    Json(request): Json<UpdateProductRequest>,
) -> Result<Response, ServiceError> {
    let product = state.services.catalog.update_product(id, request).await?;
    Ok(success_response(product))
}

/// Raw image bytes in the body; `Content-Type` picks the extension.
async fn upload_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _admin: AdminUser,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let product = state
        .services
        .catalog
        .replace_image(id, content_type, &body)
        .await?;
    Ok(success_response(product))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    state.services.catalog.delete_product(id).await?;
    Ok(no_content_response())
}
