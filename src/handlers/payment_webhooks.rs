use crate::{
    errors::ServiceError,
    services::webhook::{record_outcome, WebhookState},
    AppState,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};

pub const WEBHOOK_KEY_HEADER: &str = "x-webhook-key";

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/payments", post(payment_webhook))
}

// POST /api/v1/webhooks/payments
pub async fn payment_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    if let Some(secret) = state.config.webhook_secret() {
        let presented = headers
            .get(WEBHOOK_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            warn!("Payment webhook rejected: bad shared secret");
            return Err(ServiceError::Unauthorized("invalid webhook key".to_string()));
        }
    }

    // Providers sometimes post an empty body and put everything in the query.
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?
    };

    let topic = query
        .topic
        .clone()
        .or_else(|| query.event_type.clone())
        .or_else(|| str_field(&payload, "type"))
        .or_else(|| str_field(&payload, "topic"));
    if topic.as_deref() != Some("payment") {
        info!(topic = ?topic, "Ignoring non-payment webhook");
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response());
    }

    let Some(payment_id) = payment_id(&payload, &query) else {
        record_outcome(WebhookState::Failed);
        warn!("Payment webhook without a transaction id");
        return Err(ServiceError::BadRequest(
            "payment id missing from webhook".to_string(),
        ));
    };

    let processor = state.services.webhook.clone();
    if state.config.payment_webhook_ack_immediately {
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                processor.process(&payment_id).await;
            }
            .instrument(span),
        );
        return Ok((StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response());
    }

    let outcome = processor.process(&payment_id).await;
    let status = if outcome.state == WebhookState::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "status": outcome.state, "outcome": outcome }))).into_response())
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `data.id` from the body, then `id` or `data.id` from the query.
fn payment_id(payload: &Value, query: &WebhookQuery) -> Option<String> {
    let from_body = payload.get("data").and_then(|d| d.get("id")).and_then(|id| match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    from_body
        .or_else(|| query.id.clone())
        .or_else(|| query.data_id.clone())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefers_body_then_query() {
        let query = WebhookQuery {
            id: Some("from-query".into()),
            ..Default::default()
        };
        assert_eq!(
            payment_id(&json!({"data": {"id": 991}}), &query).as_deref(),
            Some("991")
        );
        assert_eq!(payment_id(&Value::Null, &query).as_deref(), Some("from-query"));
        assert_eq!(payment_id(&json!({"data": {}}), &WebhookQuery::default()), None);
    }

    #[test]
    fn secret_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
