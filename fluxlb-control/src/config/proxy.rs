//! Per-proxy configuration: a listener, its default target, and the
//! source-prefix/SNI route tables that override it.

use serde::Deserialize;

use super::health::HealthCheckConfig;

/// One virtual service: a listener plus everything that can route traffic
/// away from its default target.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Operator-facing name, used only in logs and the runtime API.
    pub name: String,
    pub listen: ListenConfig,
    pub default_target: TargetSpec,
    #[serde(default)]
    pub source_routes: Vec<SourceRoute>,
    #[serde(default)]
    pub sni_routes: Vec<SniRoute>,
    /// Session persistence applies to the default target unless a route
    /// overrides it with its own `session_persistence`.
    #[serde(default)]
    pub session_persistence: bool,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    /// Interface names XDP/TC attach to; the listen-table key is built per
    /// interface (`ifindex` is resolved at load time, not here).
    pub interfaces: Vec<String>,
    pub port: u16,
}

/// A target is either a single backend or a weighted set whose weights must
/// sum to exactly 100 (validated in `config::validator`).
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum TargetSpec {
    Single(Backend),
    Weighted(Vec<WeightedBackend>),
}

impl TargetSpec {
    /// Normalizes to a weighted list: a single backend gets an implicit
    /// weight of 100.
    pub fn as_weighted(&self) -> Vec<WeightedBackend> {
        match self {
            TargetSpec::Single(b) => vec![WeightedBackend {
                addr: b.addr.clone(),
                port: b.port,
                weight: 100,
            }],
            TargetSpec::Weighted(list) => list.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Backend {
    /// Either a literal IP or a hostname; hostnames are resolved by the DNS
    /// resolver (C11) and may expand into several weighted entries.
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeightedBackend {
    pub addr: String,
    pub port: u16,
    pub weight: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceRoute {
    /// CIDR in text form, e.g. `"10.0.0.0/8"`.
    pub cidr: String,
    pub target: TargetSpec,
    #[serde(default)]
    pub session_persistence: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SniRoute {
    /// Case-folded at load time; stored lowercase in the SNI table.
    pub hostname: String,
    pub target: TargetSpec,
}
