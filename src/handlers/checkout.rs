use super::common::created_response;
use crate::{
    auth::AuthenticatedUser, errors::ServiceError, services::payments::CheckoutRequest, AppState,
};
use axum::{
    extract::{Json, State},
    response::Response,
    routing::post,
    Router,
};

pub fn checkout_routes() -> Router<AppState> {
    Router::new().route("/checkout/preference", post(create_preference))
}

/// Returns the provider `init_point` the client should open.
async fn create_preference(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Response, ServiceError> {
    let checkout = state
        .services
        .checkout
        .create_checkout(&user.user_id, request)
        .await?;
    Ok(created_response(checkout))
}
