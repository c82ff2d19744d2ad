//! Global `settings` tree (§6): everything that isn't a per-proxy route.
//! The last four fields are parsed and validated but, per the admin-API
//! and metrics non-goals, only drive the trait boundaries in
//! [`crate::collab`] rather than a full exporter/server/log writer.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct SettingsConfig {
    #[serde(default = "default_true")]
    pub stats_enabled: bool,
    #[serde(default = "default_idle_timeout_sec")]
    pub idle_timeout_sec: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub admin_api: AdminApiConfig,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            stats_enabled: default_true(),
            idle_timeout_sec: default_idle_timeout_sec(),
            max_connections: default_max_connections(),
            load_balancing: LoadBalancingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            metrics: MetricsConfig::default(),
            access_log: AccessLogConfig::default(),
            admin_api: AdminApiConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_idle_timeout_sec() -> u64 {
    120
}
fn default_max_connections() -> u32 {
    65_536
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LbAlgorithm {
    #[default]
    Weighted,
    LeastConn,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub algorithm: LbAlgorithm,
    #[serde(default = "default_true")]
    pub weighted: bool,
    /// 100..10000 ms (§4.8).
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: LbAlgorithm::default(),
            weighted: true,
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

fn default_update_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_window_ms")]
    pub window_size_ms: u64,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u8,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size_ms: default_window_ms(),
            min_requests: default_min_requests(),
            error_threshold_pct: default_error_threshold_pct(),
            open_duration_ms: default_open_duration_ms(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}
fn default_min_requests() -> u32 {
    10
}
fn default_error_threshold_pct() -> u8 {
    50
}
fn default_open_duration_ms() -> u64 {
    30_000
}
fn default_half_open_requests() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub source: Option<RateLimitParams>,
    #[serde(default)]
    pub backend: Option<RateLimitParams>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitParams {
    /// Tokens/sec; stored in the kernel bucket scaled ×1000.
    pub rate_per_sec: u32,
    pub burst: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminApiConfig {
    #[serde(default)]
    pub enabled: bool,
}
