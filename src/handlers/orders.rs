use super::common::{created_response, success_response};
use crate::{
    auth::{AdminUser, AuthenticatedUser, EmployeeUser},
    errors::ServiceError,
    services::orders::{FulfillmentOutcome, FulfillmentRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

/// Manual fulfillment body; no payment is involved.
#[derive(Debug, Deserialize)]
pub struct ManualOrderRequest {
    pub product_id: Uuid,
    pub plan_id: Uuid,
    pub user_id: String,
    pub delivery_address: Option<String>,
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/mine", get(my_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/deliver", post(deliver_order))
}

async fn create_order(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<ManualOrderRequest>,
) -> Result<Response, ServiceError> {
    if request.user_id.trim().is_empty() {
        return Err(ServiceError::ValidationError("user_id is required".to_string()));
    }
    let outcome = state
        .services
        .orders
        .fulfill(FulfillmentRequest {
            product_id: request.product_id,
            plan_id: request.plan_id,
            user_id: request.user_id,
            delivery_address: request.delivery_address,
            payment_id: None,
        })
        .await?;
    match outcome {
        FulfillmentOutcome::Created(order) => Ok(created_response(order)),
        FulfillmentOutcome::AlreadyProcessed => Err(ServiceError::InternalError(
            "manual fulfillment reported a processed payment".to_string(),
        )),
    }
}

async fn my_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let orders = state.services.orders.list_for_user(&user.user_id).await?;
    Ok(success_response(orders))
}

async fn list_orders(
    State(state): State<AppState>,
    _employee: EmployeeUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.orders.list_all().await?))
}

/// Visible to the order owner and to employees.
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    if order.user_id != user.user_id {
        let employee = state
            .services
            .auth
            .is_employee(&user)
            .await
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        if !employee {
            return Err(ServiceError::Forbidden("Not your order".to_string()));
        }
    }
    Ok(success_response(order))
}

async fn deliver_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _employee: EmployeeUser,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.mark_delivered(id).await?;
    Ok(success_response(order))
}
