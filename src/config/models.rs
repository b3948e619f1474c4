use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::admission::AdmissionQueueConfig;
use crate::auth::{CacheConfig, CircuitBreakerConfig};
use crate::pipeline::{ResponseCacheConfig, RouteRule};

#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct AppConfig {
    #[garde(dive)]
    #[serde(default)]
    pub server: ServerConfig,

    #[garde(dive)]
    #[serde(default)]
    pub logging: LoggingConfig,

    #[garde(dive)]
    #[serde(default)]
    pub metrics: MetricsSettings,

    #[garde(dive)]
    #[serde(default)]
    pub permission_cache: PermissionCacheSettings,

    #[garde(dive)]
    #[serde(default)]
    pub role_store_breaker: BreakerSettings,

    #[garde(dive)]
    #[serde(default)]
    pub admission: AdmissionSettings,

    #[garde(dive)]
    #[serde(default)]
    pub response_cache: ResponseCacheSettings,

    #[garde(skip)]
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[garde(range(min = 1024, max = 65535))]
    pub port: u16,

    #[garde(length(min = 1), custom(validate_bind_address))]
    #[serde(default = "default_bind")]
    pub bind: String,

    #[garde(range(min = 1, max = 300))]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64, // seconds
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: default_bind(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[garde(length(min = 1))]
    #[serde(default = "default_log_level")]
    pub level: String, // trace, debug, info, warn, error

    #[garde(pattern(r"^(json|pretty)$"))]
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    #[garde(skip)]
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PermissionCacheSettings {
    /// Disabled means every request reads the role store
    #[garde(skip)]
    pub enabled: bool,

    #[garde(range(min = 1, max = 86400))]
    pub ttl_seconds: u64,

    #[garde(range(min = 1))]
    pub capacity: usize,

    #[garde(range(min = 1, max = 86400))]
    pub sweep_interval_seconds: u64,
}

impl Default for PermissionCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            capacity: 1000,
            sweep_interval_seconds: 300,
        }
    }
}

impl From<&PermissionCacheSettings> for CacheConfig {
    fn from(settings: &PermissionCacheSettings) -> Self {
        Self {
            max_entries: settings.capacity,
            default_ttl: Duration::from_secs(settings.ttl_seconds),
            sweep_interval: Duration::from_secs(settings.sweep_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BreakerSettings {
    #[garde(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    #[garde(range(min = 1, max = 100))]
    pub success_threshold: u32,

    /// Upper bound on a single role lookup
    #[garde(range(min = 1, max = 60000))]
    pub timeout_ms: u64,

    /// Time spent open before a trial call is let through
    #[garde(range(min = 1, max = 3600))]
    pub retry_after_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 1000,
            retry_after_seconds: 30,
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            half_open_timeout: Duration::from_secs(settings.retry_after_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AdmissionSettings {
    #[garde(range(min = 1, max = 10000))]
    pub per_client_capacity: usize,

    #[garde(range(min = 1, max = 3600))]
    pub default_deadline_seconds: u64,

    #[garde(range(min = 1, max = 60000))]
    pub tick_interval_ms: u64,

    #[garde(range(min = 1))]
    pub budget_per_tick: usize,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            per_client_capacity: 50,
            default_deadline_seconds: 30,
            tick_interval_ms: 1000,
            budget_per_tick: 10,
        }
    }
}

impl From<&AdmissionSettings> for AdmissionQueueConfig {
    fn from(settings: &AdmissionSettings) -> Self {
        Self {
            per_client_capacity: settings.per_client_capacity,
            default_deadline: Duration::from_secs(settings.default_deadline_seconds),
            tick_interval: Duration::from_millis(settings.tick_interval_ms),
            budget_per_tick: settings.budget_per_tick,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ResponseCacheSettings {
    #[garde(skip)]
    pub enabled: bool,

    #[garde(range(min = 1))]
    pub capacity: usize,

    #[garde(range(min = 1, max = 67108864))]
    pub max_body_bytes: usize,

    #[garde(range(min = 1, max = 86400))]
    pub sweep_interval_seconds: u64,

    #[garde(range(min = 1, max = 86400))]
    pub reference_ttl_seconds: u64,

    #[garde(range(min = 1, max = 86400))]
    pub listing_ttl_seconds: u64,

    #[garde(range(min = 1, max = 86400))]
    pub default_ttl_seconds: u64,

    #[garde(custom(validate_route_rules))]
    pub routes: Vec<RouteRule>,
}

impl Default for ResponseCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            max_body_bytes: 1024 * 1024,
            sweep_interval_seconds: 60,
            reference_ttl_seconds: 3600,
            listing_ttl_seconds: 30,
            default_ttl_seconds: 60,
            routes: Vec::new(),
        }
    }
}

impl From<&ResponseCacheSettings> for ResponseCacheConfig {
    fn from(settings: &ResponseCacheSettings) -> Self {
        Self {
            max_entries: settings.capacity,
            max_body_bytes: settings.max_body_bytes,
            sweep_interval: Duration::from_secs(settings.sweep_interval_seconds),
            reference_ttl: Duration::from_secs(settings.reference_ttl_seconds),
            listing_ttl: Duration::from_secs(settings.listing_ttl_seconds),
            default_ttl: Duration::from_secs(settings.default_ttl_seconds),
            routes: settings.routes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn validate_bind_address(value: &str, _: &()) -> garde::Result {
    value
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| garde::Error::new("Invalid IP address"))
}

fn validate_route_rules(rules: &Vec<RouteRule>, _: &()) -> garde::Result {
    for rule in rules {
        if !rule.prefix.starts_with('/') {
            return Err(garde::Error::new(format!(
                "route prefix '{}' must start with '/'",
                rule.prefix
            )));
        }
    }
    Ok(())
}
