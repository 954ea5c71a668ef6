#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use arfind_api::{
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db,
    entities::{device, notification_type, plan, product},
    errors::ServiceError,
    events::{self, outbox, EventSender},
    handlers::AppServices,
    services::{
        payments::{PaymentGateway, PaymentInfo, Preference, PreferenceRequest},
        storage::LocalObjectStore,
    },
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "k3v9Qw2Lr8Zt5Xn1Bp7Mc4Hd6Jf0Gs2Ya";

/// Payment provider double. Payments are scripted per id; lookups are counted.
#[derive(Default)]
pub struct FakeGateway {
    payments: Mutex<HashMap<String, PaymentInfo>>,
    preferences: Mutex<Vec<PreferenceRequest>>,
    lookups: AtomicUsize,
}

impl FakeGateway {
    pub fn script_payment(&self, id: &str, status: &str, external_reference: Option<String>) {
        if let Ok(mut payments) = self.payments.lock() {
            payments.insert(
                id.to_string(),
                PaymentInfo {
                    id: id.to_string(),
                    status: status.to_string(),
                    external_reference,
                },
            );
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn preferences(&self) -> Vec<PreferenceRequest> {
        self.preferences
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentInfo, ServiceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.payments
            .lock()
            .ok()
            .and_then(|p| p.get(payment_id).cloned())
            .ok_or_else(|| ServiceError::ExternalServiceError(format!("unknown payment {}", payment_id)))
    }

    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, ServiceError> {
        if let Ok(mut prefs) = self.preferences.lock() {
            prefs.push(request.clone());
        }
        Ok(Preference {
            id: "pref-test-1".to_string(),
            init_point: "https://pay.test/checkout?pref_id=pref-test-1".to_string(),
        })
    }
}

/// Application harness backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    auth: AuthService,
    _storage: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let storage = TempDir::new().expect("temp storage dir");

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_ack_immediately = false;
        cfg.storage_dir = storage.path().to_string_lossy().into_owned();
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            &cfg,
            gateway.clone(),
            Arc::new(LocalObjectStore::new(storage.path())),
        );

        let state = AppState {
            db: db_arc.clone(),
            config: cfg.clone(),
            event_sender,
            services,
        };
        let router = arfind_api::build_router(
            state.clone(),
            tower_http::cors::CorsLayer::permissive(),
        );

        Self {
            router,
            state,
            gateway,
            auth: AuthService::new(AuthConfig::from(&cfg), db_arc),
            _storage: storage,
            _event_task: event_task,
        }
    }

    pub fn user_token(&self, user_id: &str) -> String {
        self.auth
            .issue_token(user_id, Some(&format!("{}@arfind.test", user_id)), false)
            .expect("sign user token")
    }

    pub fn admin_token(&self) -> String {
        self.auth
            .issue_token("admin-1", Some("admin@arfind.test"), true)
            .expect("sign admin token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        self.request_with_headers(method, uri, body, token, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Non-JSON body, e.g. an image upload.
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        bytes: Vec<u8>,
        content_type: &str,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", content_type);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let request = builder.body(Body::from(bytes)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub fn storage_path(&self, key: &str) -> std::path::PathBuf {
        self._storage.path().join(key)
    }

    /// Posts a payment notification the way the provider does.
    pub async fn deliver_webhook(&self, payment_id: &str) -> axum::response::Response {
        self.request(
            Method::POST,
            "/api/v1/webhooks/payments",
            Some(json!({ "type": "payment", "data": { "id": payment_id } })),
            None,
        )
        .await
    }

    pub async fn drain_outbox(&self) -> outbox::DrainReport {
        outbox::drain_once(&self.state.db, self.state.services.outbox_dispatcher().as_ref())
            .await
            .expect("outbox drain")
    }

    pub async fn seed_product(&self, title: &str, price: Decimal) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(title.to_string()),
            price: Set(price),
            description: Set(format!("{} tracker", title)),
            short_description: Set(Some(format!("{} short", title))),
            image_key: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_plan(&self, name: &str, price: Decimal, quota: i32) -> plan::Model {
        plan::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            description: Set(format!("{} plan", name)),
            refresh_rate: Set(30),
            shared_user_quota: Set(quota),
            image_key: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed plan")
    }

    /// Unassigned device created `minutes_ago` minutes in the past.
    pub async fn seed_device(
        &self,
        product_id: Uuid,
        phone: &str,
        minutes_ago: i64,
    ) -> device::Model {
        let created_at: DateTime<Utc> = Utc::now() - Duration::minutes(minutes_ago);
        device::ActiveModel {
            id: Set(Uuid::new_v4()),
            phone_number: Set(phone.to_string()),
            product_id: Set(product_id),
            owner_id: Set(None),
            plan_id: Set(None),
            invited_users: Set(json!([])),
            nickname: Set(None),
            invite_code: Set(format!("INV{}", &phone[phone.len().saturating_sub(5)..])),
            latitude: Set(None),
            longitude: Set(None),
            simulation_step: Set(0),
            created_at: Set(created_at),
            updated_at: Set(created_at),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed device")
    }

    /// Device already bound to `owner_id` on `plan_id`.
    pub async fn seed_owned_device(
        &self,
        product_id: Uuid,
        plan_id: Uuid,
        owner_id: &str,
        phone: &str,
    ) -> device::Model {
        let seeded = self.seed_device(product_id, phone, 60).await;
        let mut active: device::ActiveModel = seeded.into();
        active.owner_id = Set(Some(owner_id.to_string()));
        active.plan_id = Set(Some(plan_id));
        active
            .update(&*self.state.db)
            .await
            .expect("assign seeded device")
    }

    pub async fn seed_order_created_type(&self) -> notification_type::Model {
        notification_type::ActiveModel {
            id: Set("nt-pedido".to_string()),
            kind: Set("pedido_creado".to_string()),
            message_template: Set(
                "Tu {{producto}} con plan {{plan}} llega el {{fecha_entrega}} (linea {{telefono}})"
                    .to_string(),
            ),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed notification type")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// `external_reference` string the checkout would have produced.
pub fn external_reference(product_id: Uuid, plan_id: Uuid, user_id: &str) -> String {
    json!({ "idProducto": product_id, "idPlan": plan_id, "userId": user_id }).to_string()
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("response body is json")
}
