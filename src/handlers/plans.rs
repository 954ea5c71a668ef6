use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::AdminUser,
    errors::ServiceError,
    services::plans::{CreatePlanRequest, UpdatePlanRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::{get, put},
    Router,
};
use uuid::Uuid;

pub fn plan_routes() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans).post(create_plan))
        .route("/plans/:id", put(update_plan).delete(delete_plan))
}

async fn list_plans(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.plans.list_plans().await?))
}

async fn create_plan(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreatePlanRequest>,
) -> Result<Response, ServiceError> {
    let plan = state.services.plans.create_plan(request).await?;
    Ok(created_response(plan))
}

async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _admin: AdminUser,
    Json(request): Json<UpdatePlanRequest>,
) -> Result<Response, ServiceError> {
    let plan = state.services.plans.update_plan(id, request).await?;
    Ok(success_response(plan))
}

async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    state.services.plans.delete_plan(id).await?;
    Ok(no_content_response())
}
