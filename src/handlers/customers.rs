use super::common::{created_response, success_response};
use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::customers::{CreateCustomerRequest, UpdateCustomerRequest},
    AppState,
};
use axum::{
    extract::{Json, State},
    response::Response,
    routing::get,
    Router,
};

pub fn customer_routes() -> Router<AppState> {
    Router::new().route(
        "/customers/me",
        get(get_profile).post(create_profile).put(update_profile),
    )
}

async fn create_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateCustomerRequest>,
) -> Result<Response, ServiceError> {
    let profile = state
        .services
        .customers
        .create_profile(&user.user_id, user.email.clone(), request)
        .await?;
    Ok(created_response(profile))
}

async fn get_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(
        state.services.customers.get_profile(&user.user_id).await?,
    ))
}

async fn update_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<UpdateCustomerRequest>,
) -> Result<Response, ServiceError> {
    let profile = state
        .services
        .customers
        .update_profile(&user.user_id, request)
        .await?;
    Ok(success_response(profile))
}
