use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::AdminUser,
    errors::ServiceError,
    services::employees::{CreateEmployeeRequest, UpdateEmployeeRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::get,
    Router,
};

pub fn employee_routes() -> Router<AppState> {
    Router::new()
        .route("/employees", get(list_employees).post(create_employee))
        .route(
            "/employees/:id",
            get(get_employee).put(update_employee).delete(delete_employee),
        )
}

async fn create_employee(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateEmployeeRequest>,
) -> Result<Response, ServiceError> {
    let employee = state.services.employees.create_employee(request).await?;
    Ok(created_response(employee))
}

async fn list_employees(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.employees.list_employees().await?))
}

async fn get_employee(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.employees.get_employee(&id).await?))
}

async fn update_employee(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _admin: AdminUser,
    Json(request): Json<UpdateEmployeeRequest>,
) -> Result<Response, ServiceError> {
    let employee = state
        .services
        .employees
        .update_employee(&id, request)
        .await?;
    Ok(success_response(employee))
}

async fn delete_employee(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _admin: AdminUser,
) -> Result<Response, ServiceError> {
    state.services.employees.delete_employee(&id).await?;
    Ok(no_content_response())
}
