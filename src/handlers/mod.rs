pub mod checkout;
pub mod common;
pub mod customers;
pub mod devices;
pub mod employees;
pub mod notifications;
pub mod orders;
pub mod payment_webhooks;
pub mod plans;
pub mod products;

use crate::auth::{AuthConfig, AuthService};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::{outbox::OutboxDispatcher, EventSender};
use crate::services::{
    catalog::CatalogService,
    customers::CustomerService,
    devices::DeviceService,
    employees::EmployeeService,
    notifications::{NotificationDispatcher, NotificationService},
    orders::OrderService,
    payments::{CheckoutService, PaymentGateway},
    plans::PlanService,
    storage::ObjectStore,
    webhook::WebhookProcessor,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub auth: Arc<AuthService>,
    pub catalog: Arc<CatalogService>,
    pub plans: Arc<PlanService>,
    pub devices: Arc<DeviceService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub webhook: Arc<WebhookProcessor>,
    pub notifications: Arc<NotificationService>,
    pub employees: Arc<EmployeeService>,
    pub customers: Arc<CustomerService>,
    event_sender: EventSender,
}

impl AppServices {
    /// Wires every service over one pool. The gateway and object store are
    /// injected so tests can swap them.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(AuthConfig::from(config), db_pool.clone()));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.default_delivery_address.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            gateway.clone(),
            config.checkout_return_url.clone(),
            config.checkout_notification_url.clone(),
        ));
        let webhook = Arc::new(WebhookProcessor::new(
            orders.clone(),
            gateway,
            event_sender.clone(),
        ));

        Self {
            auth,
            catalog: Arc::new(CatalogService::new(db_pool.clone(), store)),
            plans: Arc::new(PlanService::new(db_pool.clone())),
            devices: Arc::new(DeviceService::new(db_pool.clone(), event_sender.clone())),
            orders,
            checkout,
            webhook,
            notifications: Arc::new(NotificationService::new(db_pool.clone())),
            employees: Arc::new(EmployeeService::new(db_pool.clone())),
            customers: Arc::new(CustomerService::new(db_pool)),
            event_sender,
        }
    }

    /// Dispatcher for the outbox worker
    pub fn outbox_dispatcher(&self) -> Arc<dyn OutboxDispatcher> {
        Arc::new(NotificationDispatcher::new(
            self.notifications.clone(),
            self.event_sender.clone(),
        ))
    }
}
