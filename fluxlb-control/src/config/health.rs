//! Per-target health-check configuration (§4.7).

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    #[default]
    None,
    Tcp,
    Http,
    Https,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub kind: HealthCheckKind,
    /// Seconds between probes, 1..300.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// HTTP(S) probes only.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: HealthCheckKind::default(),
            interval_secs: default_interval_secs(),
            timeout_ms: default_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            path: default_path(),
            expected_status: default_expected_status(),
        }
    }
}

fn default_interval_secs() -> u64 {
    10
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_path() -> String {
    "/health".to_string()
}
fn default_expected_status() -> Vec<u16> {
    vec![200, 201, 202, 204]
}
