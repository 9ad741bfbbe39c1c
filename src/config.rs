use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the photosink service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// MQTT configuration
    pub mqtt: MqttConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// OCR sidecar configuration
    pub ocr: OcrConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT broker and topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname
    pub broker_host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Broker username
    pub username: Option<String>,
    /// Broker password
    pub password: Option<String>,
    /// Topic prefix for inbound photos (`<prefix>/<device_id>`)
    #[serde(default = "default_photo_topic_prefix")]
    pub photo_topic_prefix: String,
    /// Topic prefix for device registrations
    #[serde(default = "default_register_topic_prefix")]
    pub register_topic_prefix: String,
    /// Topic prefix for device disconnects
    #[serde(default = "default_disconnect_topic_prefix")]
    pub disconnect_topic_prefix: String,
    /// Topic prefix for outbound device mode commands
    #[serde(default = "default_setup_topic_prefix")]
    pub setup_topic_prefix: String,
    /// Exact payload required on the disconnect topic
    #[serde(default = "default_disconnect_payload")]
    pub disconnect_payload: String,
    /// Maximum messages processed concurrently
    #[serde(default = "default_handler_concurrency")]
    pub handler_concurrency: usize,
    /// Delay between broker reconnect attempts in seconds
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photo archival
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for archived photos
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// OCR sidecar configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    /// HTTP endpoint that accepts image bytes and returns extracted text
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

/// API configuration for the query endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Bearer token required on /api/v1 routes; unauthenticated when unset
    pub auth_token: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "photosink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "photosink".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_photo_topic_prefix() -> String {
    "photos".to_string()
}

fn default_register_topic_prefix() -> String {
    "register".to_string()
}

fn default_disconnect_topic_prefix() -> String {
    "disconnect".to_string()
}

fn default_setup_topic_prefix() -> String {
    "setup".to_string()
}

fn default_disconnect_payload() -> String {
    "Device disconnected".to_string()
}

fn default_handler_concurrency() -> usize {
    16
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_prefix() -> String {
    "photos".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    900 // 15 minutes
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_ocr_timeout_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "photosink")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/photosink").required(false))
            .add_source(config::File::with_name("/etc/photosink/photosink").required(false))
            // PHOTOSINK__MQTT__BROKER_HOST -> mqtt.broker_host
            .add_source(
                config::Environment::with_prefix("PHOTOSINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl MqttConfig {
    /// Get keep-alive interval as Duration
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Get reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}
