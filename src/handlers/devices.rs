use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::{AdminUser, AuthenticatedUser},
    errors::ServiceError,
    services::devices::{CreateDeviceRequest, UpdateDeviceRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::{get, patch, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct NicknameRequest {
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub invite_code: String,
}

pub fn device_routes() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices).post(create_device))
        .route("/devices/mine", get(my_devices))
        .route("/devices/join", post(join_device))
        .route("/devices/:id", put(update_device).delete(delete_device))
        .route("/devices/:id/unsubscribe", post(unsubscribe))
        .route("/devices/:id/nickname", patch(rename))
        .route("/devices/:id/simulate", post(simulate))
}

async fn list_devices(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.devices.list_devices().await?))
}

async fn create_device(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<Response, ServiceError> {
    let device = state.services.devices.create_device(request).await?;
    Ok(created_response(device))
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _admin: AdminUser,
    Json(request): Json<UpdateDeviceRequest>,
) -> Result<Response, ServiceError> {
    let device = state.services.devices.update_device(id, request).await?;
    Ok(success_response(device))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    state.services.devices.delete_device(id).await?;
    Ok(no_content_response())
}

async fn my_devices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let devices = state.services.devices.list_for_user(&user.user_id).await?;
    Ok(success_response(devices))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let device = state.services.devices.unsubscribe(id, &user.user_id).await?;
    Ok(success_response(device))
}

async fn rename(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(request): Json<NicknameRequest>,
) -> Result<Response, ServiceError> {
    let device = state
        .services
        .devices
        .rename(id, &user.user_id, request.nickname)
        .await?;
    Ok(success_response(device))
}

async fn join_device(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<JoinRequest>,
) -> Result<Response, ServiceError> {
    let device = state
        .services
        .devices
        .join(&user.user_id, &request.invite_code)
        .await?;
    Ok(success_response(device))
}

async fn simulate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let device = state
        .services
        .devices
        .simulate_step(id, &user.user_id, user.is_admin)
        .await?;
    Ok(success_response(device))
}
