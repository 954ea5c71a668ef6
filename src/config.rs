use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
pub const DEFAULT_DELIVERY_ADDRESS: &str = "Corrientes 2037";
const DEFAULT_PAYMENT_PROVIDER_URL: &str = "https://api.mercadopago.com";
const DEFAULT_CHECKOUT_RETURN_URL: &str = "tuapp://retorno-pago";
const DEV_DEFAULT_JWT_SECRET: &str = "arfind_development_only_secret_do_not_ship_9f3c1e7a";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// Shared HS256 secret used to verify identity tokens
    #[validate(custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    /// Lifetime of tokens minted by `AuthService::issue_token`
    #[serde(default = "default_jwt_expiration_secs")]
    pub jwt_expiration_secs: u64,

    /// Base URL of the payment provider REST API
    #[serde(default = "default_payment_provider_base_url")]
    pub payment_provider_base_url: String,

    /// Bearer access token for the payment provider
    #[serde(default)]
    pub payment_access_token: Option<String>,

    #[serde(default = "default_payment_provider_timeout_secs")]
    pub payment_provider_timeout_secs: u64,

    /// Expected value of the `x-webhook-key` header on payment webhooks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Acknowledge the webhook before fulfillment finishes
    #[serde(default = "default_true_bool")]
    pub payment_webhook_ack_immediately: bool,

    /// Base of the checkout back URLs; `?estado=...` is appended
    #[serde(default = "default_checkout_return_url")]
    pub checkout_return_url: String,

    /// Public URL of the webhook endpoint handed to the provider
    #[serde(default)]
    pub checkout_notification_url: Option<String>,

    #[serde(default = "default_delivery_address")]
    pub default_delivery_address: String,

    /// Root directory of the local object store
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Creates a new configuration with defaults for every optional field
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            jwt_secret,
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
            jwt_expiration_secs: default_jwt_expiration_secs(),
            payment_provider_base_url: default_payment_provider_base_url(),
            payment_access_token: None,
            payment_provider_timeout_secs: default_payment_provider_timeout_secs(),
            payment_webhook_secret: None,
            payment_webhook_ack_immediately: true,
            checkout_return_url: default_checkout_return_url(),
            checkout_notification_url: None,
            default_delivery_address: default_delivery_address(),
            storage_dir: default_storage_dir(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Shared webhook secret, ignoring a blank value
    pub fn webhook_secret(&self) -> Option<&str> {
        self.payment_webhook_secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development".into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.event_channel_capacity == 0 {
            let mut err = ValidationError::new("event_channel_capacity");
            err.message = Some("event_channel_capacity must be greater than 0".into());
            errors.add("event_channel_capacity", err);
        }

        if self.payment_provider_timeout_secs == 0 || self.payment_provider_timeout_secs > 120 {
            let mut err = ValidationError::new("payment_provider_timeout_secs");
            err.message = Some("payment_provider_timeout_secs must be between 1 and 120".into());
            errors.add("payment_provider_timeout_secs", err);
        }

        if self.is_production() && self.payment_access_token.is_none() {
            let mut err = ValidationError::new("payment_access_token_required");
            err.message = Some("Set APP__PAYMENT_ACCESS_TOKEN in production".into());
            errors.add("payment_access_token", err);
        }

        if self.is_production() && self.webhook_secret().is_none() {
            let mut err = ValidationError::new("payment_webhook_secret_required");
            err.message = Some("Set APP__PAYMENT_WEBHOOK_SECRET in production".into());
            errors.add("payment_webhook_secret", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_true_bool() -> bool {
    true
}
fn default_jwt_issuer() -> String {
    "arfind-auth".to_string()
}
fn default_jwt_audience() -> String {
    "arfind-api".to_string()
}
fn default_jwt_expiration_secs() -> u64 {
    3600
}
fn default_payment_provider_base_url() -> String {
    DEFAULT_PAYMENT_PROVIDER_URL.to_string()
}
fn default_payment_provider_timeout_secs() -> u64 {
    10
}
fn default_checkout_return_url() -> String {
    DEFAULT_CHECKOUT_RETURN_URL.to_string()
}
fn default_delivery_address() -> String {
    DEFAULT_DELIVERY_ADDRESS.to_string()
}
fn default_storage_dir() -> String {
    "storage".to_string()
}
fn default_outbox_poll_interval_ms() -> u64 {
    500
}
fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.len() < 32 {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be at least 32 characters".into());
        return Err(err);
    }

    let lower = trimmed.to_ascii_lowercase();
    let weak_fragments = ["changeme", "your-secret-key", "password"];
    if weak_fragments.iter().any(|pattern| lower.contains(pattern)) {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret appears to be a placeholder".into());
        return Err(err);
    }

    let unique_chars: std::collections::HashSet<char> = trimmed.chars().collect();
    if unique_chars.len() < 10 {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must have at least 10 unique characters".into());
        return Err(err);
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("arfind_api={},tower_http=debug,sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://arfind.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity provider signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
