use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::{AdminUser, AuthenticatedUser},
    errors::ServiceError,
    services::notifications::{
        CreateNotificationRequest, CreateNotificationTypeRequest, UpdateNotificationTypeRequest,
    },
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::{get, post, put},
    Router,
};

pub fn notification_routes() -> Router<AppState> {
    Router::new()
        .route("/notification-types", get(list_types).post(create_type))
        .route("/notification-types/:id", put(update_type).delete(delete_type))
        .route("/notifications", post(create_notification))
        .route("/notifications/mine", get(my_notifications))
}

async fn create_type(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateNotificationTypeRequest>,
) -> Result<Response, ServiceError> {
    let created = state.services.notifications.create_type(request).await?;
    Ok(created_response(created))
}

async fn list_types(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.notifications.list_types().await?))
}

async fn update_type(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _admin: AdminUser,
    Json(request): Json<UpdateNotificationTypeRequest>,
) -> Result<Response, ServiceError> {
    let updated = state.services.notifications.update_type(&id, request).await?;
    Ok(success_response(updated))
}

async fn delete_type(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    state.services.notifications.delete_type(&id).await?;
    Ok(no_content_response())
}

async fn create_notification(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<Response, ServiceError> {
    let created = state
        .services
        .notifications
        .create_notification(request)
        .await?;
    Ok(created_response(created))
}

async fn my_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let items = state
        .services
        .notifications
        .list_for_user(&user.user_id)
        .await?;
    Ok(success_response(items))
}
