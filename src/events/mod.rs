use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub mod outbox;

/// In-process publisher for domain events that happened after a commit.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: String,
        device_id: Uuid,
    },
    OrderDelivered(Uuid),
    DeviceReleased(Uuid),
    NotificationCreated {
        notification_id: Uuid,
        user_id: String,
    },
    WebhookProcessed {
        payment_id: String,
        state: String,
    },
}

/// Event type names stored in `outbox_events.event_type`
pub const ORDER_CREATED: &str = "order.created";

/// Templated notification addressed to one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    pub device_id: Option<Uuid>,
    /// Notification type kind, e.g. `pedido_creado`
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Outbox payload written alongside a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedPayload {
    pub order_id: Uuid,
    pub notification: NotificationRequest,
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                user_id,
                device_id,
            } => {
                info!(%order_id, %user_id, %device_id, "order created");
            }
            Event::OrderDelivered(order_id) => info!(%order_id, "order delivered"),
            Event::DeviceReleased(device_id) => info!(%device_id, "device released"),
            Event::NotificationCreated {
                notification_id,
                user_id,
            } => {
                debug!(%notification_id, %user_id, "notification stored");
            }
            Event::WebhookProcessed { payment_id, state } => {
                info!(%payment_id, %state, "payment webhook processed");
            }
        }
    }

    info!("Event processing loop stopped");
}
