//! Payment provider (MercadoPago) integration: checkout preferences and
//! payment status lookups.

use crate::{
    config::AppConfig,
    db::DbPool,
    entities::{device, plan, product},
    errors::ServiceError,
    services::{catalog::find_product, plans::find_plan},
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const CURRENCY: &str = "ARS";
const EXCLUDED_PAYMENT_METHODS: [&str; 11] = [
    "amex", "argencard", "cabal", "cmr", "cencosud", "cordobesa", "diners", "naranja", "tarshop",
    "debcabal", "maestro",
];
const EXCLUDED_PAYMENT_TYPES: [&str; 1] = ["ticket"];

/// What was bought, echoed back by the provider on the payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReference {
    #[serde(rename = "idProducto")]
    pub product_id: Uuid,
    #[serde(rename = "idPlan")]
    pub plan_id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl ExternalReference {
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let parsed: Self = serde_json::from_str(raw).map_err(|e| {
            ServiceError::BadRequest(format!("Malformed external_reference: {}", e))
        })?;
        if parsed.user_id.trim().is_empty() {
            return Err(ServiceError::BadRequest(
                "external_reference has an empty userId".to_string(),
            ));
        }
        Ok(parsed)
    }

    pub fn encode(&self) -> Result<String, ServiceError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payment as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

impl PaymentInfo {
    pub fn is_approved(&self) -> bool {
        self.status == "approved"
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceItem {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
    pub quantity: u32,
    pub currency_id: String,
    pub unit_price: f64,
}

/// Checkout preference to create at the provider
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub external_reference: ExternalReference,
    pub return_url: String,
    pub notification_url: Option<String>,
}

impl PreferenceRequest {
    /// JSON body of `POST /checkout/preferences`
    pub fn to_body(&self) -> Result<serde_json::Value, ServiceError> {
        let back = |estado: &str| format!("{}?estado={}", self.return_url, estado);
        let mut body = json!({
            "items": self.items,
            "back_urls": {
                "success": back("exitoso"),
                "failure": back("fallo"),
                "pending": back("pendiente"),
            },
            "auto_return": "approved",
            "payment_methods": {
                "excluded_payment_methods": EXCLUDED_PAYMENT_METHODS
                    .iter()
                    .map(|id| json!({ "id": id }))
                    .collect::<Vec<_>>(),
                "excluded_payment_types": EXCLUDED_PAYMENT_TYPES
                    .iter()
                    .map(|id| json!({ "id": id }))
                    .collect::<Vec<_>>(),
                "installments": 1,
            },
            "external_reference": self.external_reference.encode()?,
        });
        if let Some(url) = &self.notification_url {
            body["notification_url"] = json!(url);
        }
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub id: String,
    pub init_point: String,
}

/// Payment provider seam.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentInfo, ServiceError>;
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, ServiceError>;
}

/// REST client for the MercadoPago API
#[derive(Clone)]
pub struct MercadoPagoClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl MercadoPagoClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Self::new(
            cfg.payment_provider_base_url.clone(),
            cfg.payment_access_token.clone(),
            Duration::from_secs(cfg.payment_provider_timeout_secs),
        )
    }

    fn token(&self) -> Result<&str, ServiceError> {
        self.access_token.as_deref().ok_or_else(|| {
            ServiceError::ExternalServiceError(
                "Payment provider access token is not configured".to_string(),
            )
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Payment provider rejected {}", what);
            return Err(ServiceError::ExternalServiceError(format!(
                "{} failed with status {}",
                what, status
            )));
        }
        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Malformed payment provider response");
            ServiceError::ExternalServiceError(format!("{} returned invalid JSON", what))
        })
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentInfo, ServiceError> {
        let url = format!("{}/v1/payments/{}", self.base_url, payment_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Payment lookup request failed");
                ServiceError::ExternalServiceError(e.to_string())
            })?;
        Self::read_json(response, "payment lookup").await
    }

    #[instrument(skip(self, request), fields(user_id = %request.external_reference.user_id))]
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, ServiceError> {
        let url = format!("{}/checkout/preferences", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token()?)
            .json(&request.to_body()?)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Preference request failed");
                ServiceError::ExternalServiceError(e.to_string())
            })?;
        Self::read_json(response, "preference creation").await
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub product_id: Uuid,
    pub plan_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub preference_id: String,
    pub init_point: String,
}

/// Builds hosted-checkout preferences for a product and plan
#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    return_url: String,
    notification_url: Option<String>,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        return_url: String,
        notification_url: Option<String>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            return_url,
            notification_url,
        }
    }

    #[instrument(skip(self, request), fields(product_id = %request.product_id, plan_id = %request.plan_id))]
    pub async fn create_checkout(
        &self,
        user_id: &str,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        let product = find_product(&*self.db_pool, request.product_id).await?;
        let plan = find_plan(&*self.db_pool, request.plan_id).await?;

        let in_stock = device::Entity::find()
            .filter(device::Column::ProductId.eq(product.id))
            .filter(device::Column::OwnerId.is_null())
            .count(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if in_stock == 0 {
            return Err(ServiceError::OutOfStock(format!(
                "No device in stock for product {}",
                product.id
            )));
        }

        let preference = self
            .gateway
            .create_preference(&self.preference_for(&product, &plan, user_id))
            .await?;
        info!(preference_id = %preference.id, "Checkout preference created");
        Ok(CheckoutResponse {
            preference_id: preference.id,
            init_point: preference.init_point,
        })
    }

    fn preference_for(
        &self,
        product: &product::Model,
        plan: &plan::Model,
        user_id: &str,
    ) -> PreferenceRequest {
        let mut items = vec![PreferenceItem {
            title: product.title.clone(),
            description: product
                .short_description
                .clone()
                .unwrap_or_else(|| product.description.clone()),
            picture_url: None,
            quantity: 1,
            currency_id: CURRENCY.to_string(),
            unit_price: product.price.to_f64().unwrap_or_default(),
        }];
        if plan.price.is_sign_positive() && !plan.price.is_zero() {
            items.push(PreferenceItem {
                title: format!("Plan {}", plan.name),
                description: plan.description.clone(),
                picture_url: None,
                quantity: 1,
                currency_id: CURRENCY.to_string(),
                unit_price: plan.price.to_f64().unwrap_or_default(),
            });
        }

        PreferenceRequest {
            items,
            external_reference: ExternalReference {
                product_id: product.id,
                plan_id: plan.id,
                user_id: user_id.to_string(),
            },
            return_url: self.return_url.clone(),
            notification_url: self.notification_url.clone(),
        }
    }
}
