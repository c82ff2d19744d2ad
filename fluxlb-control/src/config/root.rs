use serde::Deserialize;

use super::proxy::ProxyConfig;
use super::settings::SettingsConfig;

/// Top-level configuration tree (§6): a list of virtual services plus the
/// settings that apply to all of them.
#[derive(Debug, Deserialize, Clone)]
pub struct FluxConfig {
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub settings: SettingsConfig,
}
