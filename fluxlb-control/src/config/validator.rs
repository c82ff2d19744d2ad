//! Config validation: weight sums, CIDR syntax, hostname charset. Mirrors
//! the teacher's `config/loader.rs::validate_config` — a fatal, no-partial-
//! apply pass run once after deserialization (§7 `invalid-config`).

use ipnet::IpNet;

use super::proxy::{ProxyConfig, TargetSpec};
use super::root::FluxConfig;
use crate::error::{ControlError, Result};

pub fn validate(cfg: &FluxConfig) -> Result<()> {
    if cfg.proxies.is_empty() {
        return Err(ControlError::InvalidConfig("no proxies configured".into()));
    }
    for proxy in &cfg.proxies {
        validate_proxy(proxy)?;
    }
    Ok(())
}

pub(crate) fn validate_proxy(proxy: &ProxyConfig) -> Result<()> {
    if proxy.listen.interfaces.is_empty() {
        return Err(ControlError::InvalidConfig(format!(
            "proxy '{}' has no listen interfaces",
            proxy.name
        )));
    }
    validate_target(&proxy.name, &proxy.default_target)?;

    for route in &proxy.source_routes {
        route
            .cidr
            .parse::<IpNet>()
            .map_err(|e| ControlError::InvalidConfig(format!(
                "proxy '{}': invalid CIDR '{}': {e}",
                proxy.name, route.cidr
            )))?;
        validate_target(&proxy.name, &route.target)?;
    }

    for route in &proxy.sni_routes {
        if !route.hostname.is_ascii() {
            return Err(ControlError::InvalidConfig(format!(
                "proxy '{}': SNI hostname '{}' is not ASCII",
                proxy.name, route.hostname
            )));
        }
        validate_target(&proxy.name, &route.target)?;
    }

    Ok(())
}

pub(crate) fn validate_target(proxy_name: &str, target: &TargetSpec) -> Result<()> {
    let weighted = target.as_weighted();
    if weighted.is_empty() {
        return Err(ControlError::InvalidConfig(format!(
            "proxy '{proxy_name}': target has no backends"
        )));
    }
    if weighted.len() > fluxlb_ebpf_common::lpm::MAX_TARGETS {
        return Err(ControlError::InvalidConfig(format!(
            "proxy '{proxy_name}': more than {} targets in one group",
            fluxlb_ebpf_common::lpm::MAX_TARGETS
        )));
    }
    let total: u32 = weighted.iter().map(|b| b.weight as u32).sum();
    if total != 100 {
        return Err(ControlError::InvalidConfig(format!(
            "proxy '{proxy_name}': target weights sum to {total}, must be exactly 100"
        )));
    }
    for b in &weighted {
        if b.weight == 0 || b.weight > 100 {
            return Err(ControlError::InvalidConfig(format!(
                "proxy '{proxy_name}': weight {} out of range 1..=100",
                b.weight
            )));
        }
    }
    Ok(())
}
