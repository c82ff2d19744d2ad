//! Weight computer (C8, §4.8): composes health, drain, circuit, and
//! least-conn signals into a per-target effective weight, then normalizes
//! the survivors back onto `fluxlb_core::weight`'s cumulative-weight table.

use fluxlb_ebpf_common::lpm::{Target, TargetGroup, MAX_TARGETS};
use fluxlb_ebpf_common::Addr;

use crate::circuit::CircuitState;

/// One target's signals as the weight computer sees them; `original_weight`
/// is the operator-configured value, everything else reflects live state.
#[derive(Debug, Clone, Copy)]
pub struct TargetSignal {
    pub ip: Addr,
    pub port: u16,
    pub original_weight: u8,
    pub healthy: bool,
    pub draining: bool,
    pub circuit: CircuitState,
    /// `Some(step)` while a gradual-recovery schedule is in progress
    /// (0..=3, see `fluxlb_core::weight::RECOVERY_STEPS`).
    pub recovery_step: Option<usize>,
    pub active_connections: u32,
}

/// Composes `signals` into a [`TargetGroup`] ready to push to the kernel's
/// listen/LPM/SNI map. `least_conn` selects step 6's alternate normalization
/// input (§4.8): `capacity_i = original_i / (1 + connections_i)`.
pub fn compute_group(signals: &[TargetSignal], least_conn: bool, session_persistence: bool) -> TargetGroup {
    let mut effective: Vec<u32> = signals
        .iter()
        .map(|s| effective_weight(s, least_conn))
        .collect();

    if effective.iter().all(|w| *w == 0) {
        // Graceful degradation: revert to the raw configured weights rather
        // than leave the group unselectable (§4.8 step 5).
        effective = signals.iter().map(|s| s.original_weight as u32).collect();
    }

    let normalized = normalize_to_100(&effective, signals.iter().map(|s| s.original_weight));

    let mut group = TargetGroup::default();
    group.target_count = signals.len().min(MAX_TARGETS) as u8;
    group.session_persistence = u8::from(session_persistence);
    group.flags = if least_conn {
        fluxlb_ebpf_common::lpm::group_flags::LEAST_CONN
    } else {
        fluxlb_ebpf_common::lpm::group_flags::WEIGHTED
    };

    let mut running = 0u16;
    for (i, (signal, weight)) in signals.iter().zip(normalized.iter()).enumerate().take(MAX_TARGETS) {
        running += *weight as u16;
        group.targets[i] = Target { ip: signal.ip, port: signal.port, cumulative_weight: running };
    }
    group
}

/// Applies priority order 1..4 of §4.8 (unhealthy / draining / circuit /
/// recovery) to one target's configured weight. Does not normalize —
/// normalization is a group-wide operation handled by [`compute_group`].
fn effective_weight(signal: &TargetSignal, least_conn: bool) -> u32 {
    if !signal.healthy {
        return 0;
    }
    if signal.draining {
        return 0;
    }
    let after_circuit = match signal.circuit {
        CircuitState::Open => 0,
        CircuitState::HalfOpen => (signal.original_weight as u32 * 10) / 100,
        CircuitState::Closed => signal.original_weight as u32,
    };
    let after_recovery = match signal.recovery_step {
        Some(step) => {
            let pct = fluxlb_core::weight::RECOVERY_STEPS.get(step).copied().unwrap_or(100) as u32;
            (after_circuit * pct) / 100
        }
        None => after_circuit,
    };
    if least_conn {
        // capacity_i = original_i / (1 + connections_i); computed against
        // the post-health/drain/circuit/recovery weight so an unhealthy or
        // draining target still contributes exactly 0 capacity.
        after_recovery / (1 + signal.active_connections)
    } else {
        after_recovery
    }
}

/// Normalizes `weights` so the surviving (non-zero-capacity but present)
/// entries sum to exactly 100. When integer rounding leaves a residual, it
/// is distributed to the highest-`original_weight` targets first, ties
/// broken by index (§4.8 step 6).
fn normalize_to_100(weights: &[u32], original_weights: impl Iterator<Item = u8>) -> Vec<u8> {
    let total: u32 = weights.iter().sum();
    if total == 0 {
        return vec![0; weights.len()];
    }

    let mut scaled: Vec<u8> = weights
        .iter()
        .map(|w| ((*w as u64 * 100) / total as u64) as u8)
        .collect();

    let assigned: u32 = scaled.iter().map(|w| *w as u32).sum();
    let mut residual = 100i32 - assigned as i32;

    if residual > 0 {
        let mut order: Vec<usize> = (0..weights.len()).collect();
        let originals: Vec<u8> = original_weights.collect();
        order.sort_by(|&a, &b| originals[b].cmp(&originals[a]).then(a.cmp(&b)));
        let mut idx = 0;
        while residual > 0 && !order.is_empty() {
            let i = order[idx % order.len()];
            scaled[i] = scaled[i].saturating_add(1);
            residual -= 1;
            idx += 1;
        }
    } else if residual < 0 {
        // Over-assigned due to truncation artifacts; trim from the lowest
        // weighted entries first so the highest-priority targets keep
        // their rounded share.
        let mut order: Vec<usize> = (0..weights.len()).collect();
        order.sort_by_key(|&i| scaled[i]);
        let mut idx = 0;
        while residual < 0 && !order.is_empty() {
            let i = order[idx % order.len()];
            if scaled[i] > 0 {
                scaled[i] -= 1;
                residual += 1;
            }
            idx += 1;
        }
    }

    scaled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(ip_last: u8, weight: u8, healthy: bool) -> TargetSignal {
        TargetSignal {
            ip: Addr::from_v4_octets([10, 0, 0, ip_last]),
            port: 80,
            original_weight: weight,
            healthy,
            draining: false,
            circuit: CircuitState::Closed,
            recovery_step: None,
            active_connections: 0,
        }
    }

    #[test]
    fn healthy_group_sums_to_100() {
        let signals = [signal(1, 70, true), signal(2, 30, true)];
        let group = compute_group(&signals, false, false);
        assert_eq!(group.live_targets().last().unwrap().cumulative_weight, 100);
    }

    #[test]
    fn all_unhealthy_falls_back_to_original_weights() {
        let signals = [signal(1, 70, false), signal(2, 30, false)];
        let group = compute_group(&signals, false, false);
        assert_eq!(group.live_targets().last().unwrap().cumulative_weight, 100);
        assert_eq!(group.live_targets()[0].cumulative_weight, 70);
    }

    #[test]
    fn unhealthy_target_gets_zero_share() {
        let signals = [signal(1, 50, false), signal(2, 50, true)];
        let group = compute_group(&signals, false, false);
        let targets = group.live_targets();
        assert_eq!(targets[0].cumulative_weight, 0);
        assert_eq!(targets[1].cumulative_weight, 100);
    }

    #[test]
    fn circuit_half_open_gets_ten_percent() {
        let mut a = signal(1, 50, true);
        a.circuit = CircuitState::HalfOpen;
        let b = signal(2, 50, true);
        let group = compute_group(&[a, b], false, false);
        let targets = group.live_targets();
        // a's raw share is 5, b's is 50; normalized to 100: 5/55*100≈9, 50/55*100≈90(+residual)
        assert!(targets[0].cumulative_weight > 0);
        assert_eq!(targets[1].cumulative_weight, 100);
    }
}
