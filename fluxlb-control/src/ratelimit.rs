//! Rate-limit controller (C12, §4.12): translates configured
//! requests-per-second/burst figures into the fixed-point, scaled values the
//! kernel's token-bucket maps store, and pushes/removes them through
//! [`fluxlb_ebpf::FluxMaps`].
//!
//! Unlike the teacher's `security::rate_limit` manager, which runs the
//! token-bucket algorithm itself on the request path, the actual admit/deny
//! decision here happens in the XDP program; this controller is a thin
//! parameter pusher that keeps the kernel's buckets in sync with operator
//! config and exposes the few knobs the orchestrator's API surface needs
//! (§6: set/disable source and backend rate limits).

use fluxlb_ebpf::FluxMaps;
use fluxlb_ebpf_common::ratelimit::{BackendKey, RateLimitBucket, SCALE};
use fluxlb_ebpf_common::Addr;

use crate::config::RateLimitParams;
use crate::error::Result;

/// Scales a plain `requests_per_second`/`burst` pair into the fixed-point
/// representation the kernel bucket expects.
fn scale(params: &RateLimitParams) -> (u32, u32) {
    (params.rate_per_sec.saturating_mul(SCALE), params.burst.saturating_mul(SCALE))
}

/// Scales a plain `requests_per_second`/`burst` pair for direct storage in
/// the global settings array (slots 6/7), rather than a per-key bucket map
/// entry. Shares the same fixed-point factor as the per-backend path.
pub fn scale_for_settings(params: &RateLimitParams) -> (u32, u32) {
    scale(params)
}

/// Installs or refreshes the backend-wide rate limit for `(ip, port)`.
/// Re-seeds the bucket's tokens to `burst` so a config change takes effect
/// immediately rather than waiting on the old rate to refill it.
pub fn set_backend_rate_limit(maps: &mut FluxMaps, ip: Addr, port: u16, params: &RateLimitParams, now_ns: u64) -> Result<()> {
    let (rate_scaled, burst_scaled) = scale(params);
    let key = BackendKey { ip, port, _pad: [0; 6] };
    let bucket = RateLimitBucket::new(rate_scaled, burst_scaled, now_ns);
    maps.set_backend_rate_limit(key, bucket)?;
    Ok(())
}

/// Removes a backend's rate limit entirely — the kernel program treats a
/// missing bucket entry as "unlimited" for that backend.
pub fn disable_backend_rate_limit(maps: &mut FluxMaps, ip: Addr, port: u16) -> Result<()> {
    let key = BackendKey { ip, port, _pad: [0; 6] };
    maps.remove_backend_rate_limit(&key)?;
    Ok(())
}

/// Resets a single source IP's bucket, e.g. when an operator wants to clear
/// one client's throttled state without waiting for LRU eviction or the
/// bucket's own refill. The global per-source rate (when enabled) is pushed
/// once at startup via the settings map rather than per-key, since every
/// source shares the same configured rate.
pub fn reset_source_rate_limit(maps: &mut FluxMaps, addr: Addr) -> Result<()> {
    maps.remove_source_rate_limit(&addr)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_applies_fixed_point_factor() {
        let params = RateLimitParams { rate_per_sec: 100, burst: 200 };
        let (rate, burst) = scale(&params);
        assert_eq!(rate, 100 * SCALE);
        assert_eq!(burst, 200 * SCALE);
    }
}
