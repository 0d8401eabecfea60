//! Configuration for Bulkline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Control API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scheduler tick configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Monthly quota plans
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Messaging transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Instance name, used as the campaign lease holder
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
        }
    }
}

fn default_instance_id() -> String {
    format!("bulkline-{}", uuid::Uuid::new_v4().simple())
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the control API
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
        }
    }
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval in seconds. Must not exceed 60 so every trigger minute
    /// of a recurring campaign is observed.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// How far ahead of `scheduled_at` a one-shot campaign may start
    #[serde(default = "default_lookahead")]
    pub lookahead_secs: i64,

    /// Recipients left in `sending` longer than this revert to `pending`
    #[serde(default = "default_reclaim_after")]
    pub reclaim_after_secs: i64,

    /// Minimum gap between two fires of the same recurring campaign
    #[serde(default = "default_refire_guard")]
    pub refire_guard_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            lookahead_secs: default_lookahead(),
            reclaim_after_secs: default_reclaim_after(),
            refire_guard_secs: default_refire_guard(),
        }
    }
}

fn default_tick_interval() -> u64 {
    30
}

fn default_lookahead() -> i64 {
    30
}

fn default_reclaim_after() -> i64 {
    600
}

fn default_refire_guard() -> i64 {
    120
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Lower bound of the pause between two sends, in milliseconds
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Upper bound of the pause between two sends, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Hard timeout for one transport call, in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Campaign lease duration, renewed before every recipient
    #[serde(default = "default_lease")]
    pub lease_secs: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            send_timeout_secs: default_send_timeout(),
            lease_secs: default_lease(),
        }
    }
}

fn default_min_delay() -> u64 {
    3_000
}

fn default_max_delay() -> u64 {
    8_000
}

fn default_send_timeout() -> u64 {
    30
}

fn default_lease() -> i64 {
    120
}

/// Monthly allowance of one plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanQuota {
    /// Fixed number of messages per calendar month
    Messages(i64),
    /// `"unlimited"`: no cap, usage is still counted
    Unlimited(UnlimitedMarker),
}

/// Marker for `plan = "unlimited"` entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlimitedMarker {
    Unlimited,
}

impl PlanQuota {
    /// Monthly cap, `None` when unlimited
    pub fn cap(&self) -> Option<i64> {
        match self {
            PlanQuota::Messages(n) => Some(*n),
            PlanQuota::Unlimited(_) => None,
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Plan assigned to users that have no quota row yet
    #[serde(default = "default_plan")]
    pub default_plan: String,

    /// Monthly allowance per plan tier
    #[serde(default = "default_plans")]
    pub plans: HashMap<String, PlanQuota>,

    /// Retries for serialization failures before failing open
    #[serde(default = "default_quota_retries")]
    pub max_retries: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
            plans: default_plans(),
            max_retries: default_quota_retries(),
        }
    }
}

impl QuotaConfig {
    /// Cap for a plan; unknown plans fall back to the default plan's cap
    pub fn plan_cap(&self, plan: &str) -> Option<i64> {
        self.plans
            .get(plan)
            .or_else(|| self.plans.get(&self.default_plan))
            .map(PlanQuota::cap)
            .unwrap_or(Some(0))
    }
}

fn default_plan() -> String {
    "free".to_string()
}

fn default_plans() -> HashMap<String, PlanQuota> {
    HashMap::from([
        ("free".to_string(), PlanQuota::Messages(100)),
        ("basic".to_string(), PlanQuota::Messages(1_000)),
        ("pro".to_string(), PlanQuota::Messages(10_000)),
        (
            "enterprise".to_string(),
            PlanQuota::Unlimited(UnlimitedMarker::Unlimited),
        ),
    ])
}

fn default_quota_retries() -> u32 {
    3
}

/// Messaging transport (HTTP gateway) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Gateway base URL
    #[serde(default = "default_transport_url")]
    pub base_url: String,

    /// Bearer token for the gateway
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_transport_url(),
            api_key: None,
            timeout_secs: default_send_timeout(),
        }
    }
}

fn default_transport_url() -> String {
    "http://localhost:3000".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first config file found, layered with
    /// `BULKLINE__SECTION__KEY` environment overrides
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var_os("BULKLINE_CONFIG").map(PathBuf::from);
        let paths = explicit.into_iter().chain([
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/bulkline/config.toml"),
        ]);

        let path = paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| crate::Error::Config("No configuration file found".to_string()))?;

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path.as_path()))
            .add_source(
                ::config::Environment::with_prefix("BULKLINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheduler.tick_interval_secs == 0 || self.scheduler.tick_interval_secs > 60 {
            return Err(crate::Error::Config(
                "scheduler.tick_interval_secs must be between 1 and 60".to_string(),
            ));
        }
        if self.delivery.min_delay_ms > self.delivery.max_delay_ms {
            return Err(crate::Error::Config(
                "delivery.min_delay_ms must not exceed delivery.max_delay_ms".to_string(),
            ));
        }
        if self.delivery.send_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "delivery.send_timeout_secs must be positive".to_string(),
            ));
        }
        let worst_case_ms = self.delivery.send_timeout_secs * 1000 + self.delivery.max_delay_ms;
        if (self.scheduler.reclaim_after_secs as u64) * 1000 <= worst_case_ms {
            return Err(crate::Error::Config(
                "scheduler.reclaim_after_secs must exceed the send timeout plus the maximum delay"
                    .to_string(),
            ));
        }
        if !self.quota.plans.contains_key(&self.quota.default_plan) {
            return Err(crate::Error::Config(format!(
                "quota.default_plan '{}' is not defined in quota.plans",
                self.quota.default_plan
            )));
        }
        Ok(())
    }
}
