//! Payment webhook processing.
//!
//! ```text
//! RECEIVED -> DEDUPED
//! RECEIVED -> VERIFIED -> FULFILLING -> FULFILLED
//! RECEIVED -> VERIFIED -> REJECTED
//! any      -> FAILED
//! ```
//!
//! Redelivery is safe: the marker written with the order makes a second run
//! end in `DEDUPED`, and a failed run leaves no marker so the provider can retry.

use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        orders::{FulfillmentOutcome, FulfillmentRequest, OrderService},
        payments::{ExternalReference, PaymentGateway},
    },
};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookState {
    Received,
    Deduped,
    Verified,
    Fulfilling,
    Fulfilled,
    Rejected,
    Failed,
}

impl WebhookState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Deduped | Self::Fulfilled | Self::Rejected | Self::Failed
        )
    }
}

/// Terminal result of one webhook run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookOutcome {
    pub payment_id: String,
    pub state: WebhookState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Counts a terminal state on `arfind.webhook.outcome`.
pub fn record_outcome(state: WebhookState) {
    counter!("arfind.webhook.outcome", 1, "state" => state.to_string());
}

#[derive(Clone)]
pub struct WebhookProcessor {
    orders: Arc<OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: EventSender,
}

impl WebhookProcessor {
    pub fn new(
        orders: Arc<OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            orders,
            gateway,
            event_sender,
        }
    }

    /// Drives one payment notification to a terminal state.
    #[instrument(skip(self), fields(state = tracing::field::Empty))]
    pub async fn process(&self, payment_id: &str) -> WebhookOutcome {
        transition(payment_id, WebhookState::Received);
        let outcome = self.run(payment_id).await;

        record_outcome(outcome.state);
        match outcome.state {
            WebhookState::Failed => error!(
                payment_id,
                state = %outcome.state,
                reason = outcome.reason.as_deref().unwrap_or(""),
                "Payment webhook failed"
            ),
            state => info!(
                payment_id,
                %state,
                order_id = ?outcome.order_id,
                "Payment webhook finished"
            ),
        }
        if let Err(e) = self
            .event_sender
            .send(Event::WebhookProcessed {
                payment_id: payment_id.to_string(),
                state: outcome.state.to_string(),
            })
            .await
        {
            warn!(error = %e, "Failed to publish WebhookProcessed");
        }
        outcome
    }

    async fn run(&self, payment_id: &str) -> WebhookOutcome {
        let done = |state: WebhookState, order_id: Option<Uuid>, reason: Option<String>| {
            WebhookOutcome {
                payment_id: payment_id.to_string(),
                state,
                order_id,
                reason,
            }
        };
        let failed = |err: ServiceError| done(WebhookState::Failed, None, Some(err.to_string()));

        match self.orders.is_payment_processed(payment_id).await {
            Ok(true) => return done(WebhookState::Deduped, None, None),
            Ok(false) => {}
            Err(e) => return failed(e),
        }

        let payment = match self.gateway.get_payment(payment_id).await {
            Ok(payment) => payment,
            Err(e) => return failed(e),
        };
        transition(payment_id, WebhookState::Verified);

        if !payment.is_approved() {
            return done(
                WebhookState::Rejected,
                None,
                Some(format!("payment status {}", payment.status)),
            );
        }

        let reference = match payment
            .external_reference
            .as_deref()
            .ok_or_else(|| ServiceError::BadRequest("payment has no external_reference".into()))
            .and_then(ExternalReference::parse)
        {
            Ok(reference) => reference,
            Err(e) => return failed(e),
        };

        transition(payment_id, WebhookState::Fulfilling);
        let request = FulfillmentRequest {
            product_id: reference.product_id,
            plan_id: reference.plan_id,
            user_id: reference.user_id,
            delivery_address: None,
            payment_id: Some(payment_id.to_string()),
        };
        match self.orders.fulfill(request).await {
            Ok(FulfillmentOutcome::Created(order)) => {
                done(WebhookState::Fulfilled, Some(order.id), None)
            }
            Ok(FulfillmentOutcome::AlreadyProcessed) => done(WebhookState::Deduped, None, None),
            Err(e) => failed(e),
        }
    }
}

fn transition(payment_id: &str, state: WebhookState) {
    tracing::Span::current().record("state", state.as_ref());
    debug!(payment_id, %state, "Webhook transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(WebhookState::Received, "RECEIVED", false)]
    #[case(WebhookState::Verified, "VERIFIED", false)]
    #[case(WebhookState::Fulfilling, "FULFILLING", false)]
    #[case(WebhookState::Deduped, "DEDUPED", true)]
    #[case(WebhookState::Fulfilled, "FULFILLED", true)]
    #[case(WebhookState::Rejected, "REJECTED", true)]
    #[case(WebhookState::Failed, "FAILED", true)]
    fn state_names_and_terminality(
        #[case] state: WebhookState,
        #[case] name: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(state.to_string(), name);
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(serde_json::to_value(state).unwrap(), name);
    }
}
