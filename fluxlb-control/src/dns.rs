//! DNS resolver/manager (C11, §4.11): periodic A/AAAA resolution per
//! configured hostname target, equal-weight redistribution across resolved
//! IPs on change, and a `dns-failed` event with a failure counter on
//! resolution failure.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::lookup_host;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::collab::ControlEvent;
use crate::error::{ControlError, Result};

/// Resolves `hostname` once, synchronously — used for the initial,
/// fatal-on-failure resolution at proxy load (§4.11, §7 `resolution-failed`
/// at startup).
pub async fn resolve_once(hostname: &str, port: u16) -> Result<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = lookup_host((hostname, port))
        .await
        .map_err(|source| ControlError::DnsResolution { hostname: hostname.to_string(), source })?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(ControlError::DnsEmptyResult(hostname.to_string()));
    }
    Ok(addrs)
}

/// Distributes `total_weight` equally across `count` IPs, putting any
/// remainder on the first IPs in resolution order (§4.11).
pub fn redistribute_weights(total_weight: u8, count: usize) -> Vec<u8> {
    if count == 0 {
        return Vec::new();
    }
    let base = total_weight / count as u8;
    let mut remainder = total_weight % count as u8;
    (0..count)
        .map(|_| {
            if remainder > 0 {
                remainder -= 1;
                base + 1
            } else {
                base
            }
        })
        .collect()
}

/// `true` if `a` and `b` contain the same IPs, ignoring order (§4.11's
/// order-insensitive comparison).
fn same_address_set(a: &[IpAddr], b: &[IpAddr]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut sorted_a = a.to_vec();
    let mut sorted_b = b.to_vec();
    sorted_a.sort();
    sorted_b.sort();
    sorted_a == sorted_b
}

/// Background task for one hostname target: re-resolves at
/// `refresh_interval` ± 10% jitter, emitting [`ControlEvent::DnsChanged`] on
/// a change and [`ControlEvent::DnsFailed`] on failure while retaining the
/// last-known set.
pub async fn run_refresh_loop(
    hostname: String,
    port: u16,
    refresh_interval: Duration,
    mut last_known: Vec<IpAddr>,
    events: broadcast::Sender<ControlEvent>,
) {
    let mut consecutive_failures = 0u32;
    loop {
        let jitter_pct = rand::thread_rng().gen_range(-10i64..=10);
        let jittered_ms =
            (refresh_interval.as_millis() as i64 * (100 + jitter_pct) / 100).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(jittered_ms)).await;

        match resolve_once(&hostname, port).await {
            Ok(resolved) => {
                consecutive_failures = 0;
                if !same_address_set(&resolved, &last_known) {
                    debug!(hostname, count = resolved.len(), "DNS record set changed");
                    last_known = resolved.clone();
                    let _ = events.send(ControlEvent::DnsChanged {
                        hostname: hostname.clone(),
                        addrs: resolved,
                    });
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(hostname, error = %e, consecutive_failures, "DNS refresh failed, retaining last-known set");
                let _ = events.send(ControlEvent::DnsFailed {
                    hostname: hostname.clone(),
                    consecutive_failures,
                });
            }
        }
    }
}

/// Builds a `tokio::time::interval`-based ticker matching
/// `MissedTickBehavior::Delay`, used by callers that prefer a fixed-period
/// loop over the jittered one-shot sleep in [`run_refresh_loop`] (e.g.
/// tests that want deterministic tick counts).
pub fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut t = tokio::time::interval(interval);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redistributes_remainder_to_first_ips() {
        let weights = redistribute_weights(100, 3);
        assert_eq!(weights.iter().map(|w| *w as u32).sum::<u32>(), 100);
        assert_eq!(weights[0], 34);
        assert_eq!(weights[1], 33);
        assert_eq!(weights[2], 33);
    }

    #[test]
    fn address_set_comparison_ignores_order() {
        let a = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let b = vec!["10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap()];
        assert!(same_address_set(&a, &b));
    }
}
