//! Weight math: cumulative-weight construction, weighted/sticky/least-conn
//! selection, and gradual weight recovery after a health transition.
//!
//! Selection functions take an explicit `draw` rather than calling a PRNG
//! directly, so they are pure and deterministic — the caller (kernel program
//! or a test) supplies the randomness.

use crate::error::{CoreError, Result};
use fluxlb_ebpf_common::lpm::{Target, TargetGroup, MAX_TARGETS};

/// Builds the running cumulative-weight sum `TargetGroup::targets[i].cumulative_weight`
/// expects, from a slice of per-target weights that must sum to 100.
pub fn cumulative_weights(weights: &[u8]) -> Result<[u16; MAX_TARGETS]> {
    if weights.is_empty() {
        return Err(CoreError::EmptyTargetGroup);
    }
    if weights.len() > MAX_TARGETS {
        return Err(CoreError::WeightsDoNotSumTo100(weights.to_vec()));
    }
    let total: u32 = weights.iter().map(|w| *w as u32).sum();
    if total != 100 {
        return Err(CoreError::WeightsDoNotSumTo100(weights.to_vec()));
    }
    let mut out = [0u16; MAX_TARGETS];
    let mut running = 0u16;
    for (i, w) in weights.iter().enumerate() {
        running += *w as u16;
        out[i] = running;
    }
    Ok(out)
}

/// `true` if every live target's weight is zero (graceful-degradation
/// trigger: the weight computer should fall back to the originally
/// configured weights rather than select nothing).
pub fn all_weights_zero(group: &TargetGroup) -> bool {
    // Cumulative weights are non-decreasing, so the last live target's value
    // is the group total; if that's zero every target's weight is zero.
    group
        .live_targets()
        .last()
        .map(|t| t.cumulative_weight == 0)
        .unwrap_or(true)
}

/// Weighted-random selection: `draw` is uniform over `0..total_weight`
/// (the last entry's cumulative weight). Returns the index of the first
/// target whose cumulative weight exceeds `draw`.
pub fn select_weighted(group: &TargetGroup, draw: u16) -> Option<usize> {
    let targets = group.live_targets();
    if targets.is_empty() {
        return None;
    }
    let total = targets.last()?.cumulative_weight;
    if total == 0 {
        return Some(0);
    }
    let draw = draw % total;
    targets.iter().position(|t| draw < t.cumulative_weight)
}

/// Session-sticky selection: `(src_ip_low32 * 2654435761) mod 100` maps the
/// client into a 0..100 bucket, which is then resolved against the same
/// cumulative-weight table as weighted selection so sticky sessions still
/// respect configured weights.
pub fn select_sticky(group: &TargetGroup, src_ip_low32: u32) -> Option<usize> {
    let targets = group.live_targets();
    if targets.is_empty() {
        return None;
    }
    let total = targets.last()?.cumulative_weight;
    if total == 0 {
        return Some(0);
    }
    let bucket = src_ip_low32.wrapping_mul(2_654_435_761) % 100;
    let scaled = ((bucket as u32 * total as u32) / 100) as u16;
    targets.iter().position(|t| scaled < t.cumulative_weight)
}

/// Least-connections selection: index of the target with the fewest active
/// connections, ties broken by lowest index. `conn_counts` must be the same
/// length (and in the same order) as `group.live_targets()`.
pub fn select_least_conn(group: &TargetGroup, conn_counts: &[u32]) -> Option<usize> {
    let targets = group.live_targets();
    if targets.is_empty() || conn_counts.len() < targets.len() {
        return None;
    }
    conn_counts[..targets.len()]
        .iter()
        .enumerate()
        .min_by_key(|(_, count)| **count)
        .map(|(i, _)| i)
}

/// Longest-prefix-match selection just resolves to the single matched
/// group's weighted selection; kept as a named entry point for callers that
/// want to be explicit about which algorithm they invoked.
pub fn select_source_prefix(group: &TargetGroup, draw: u16) -> Option<usize> {
    select_weighted(group, draw)
}

/// Gradual recovery schedule after a health transition: 25/50/75/100% of the
/// originally configured weight, advancing one step per successful health
/// check interval.
pub const RECOVERY_STEPS: [u8; 4] = [25, 50, 75, 100];

pub fn recovery_weight(original_weight: u8, step: usize) -> u8 {
    let percent = RECOVERY_STEPS.get(step).copied().unwrap_or(100) as u32;
    (((original_weight as u32) * percent) / 100) as u8
}

#[inline]
pub fn build_target(ip: fluxlb_ebpf_common::Addr, port: u16, cumulative_weight: u16) -> Target {
    Target {
        ip,
        port,
        cumulative_weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxlb_ebpf_common::Addr;

    fn group_with_weights(weights: &[u8]) -> TargetGroup {
        let cum = cumulative_weights(weights).unwrap();
        let mut group = TargetGroup::default();
        group.target_count = weights.len() as u8;
        for (i, w) in cum.iter().enumerate().take(weights.len()) {
            group.targets[i] = build_target(Addr::from_v4_octets([10, 0, 0, i as u8 + 1]), 80, *w);
        }
        group
    }

    #[test]
    fn cumulative_weights_must_sum_to_100() {
        assert!(cumulative_weights(&[50, 50]).is_ok());
        assert!(cumulative_weights(&[50, 40]).is_err());
    }

    #[test]
    fn weighted_selection_respects_boundaries() {
        let group = group_with_weights(&[25, 75]);
        assert_eq!(select_weighted(&group, 0), Some(0));
        assert_eq!(select_weighted(&group, 24), Some(0));
        assert_eq!(select_weighted(&group, 25), Some(1));
        assert_eq!(select_weighted(&group, 99), Some(1));
    }

    #[test]
    fn sticky_selection_is_deterministic_per_src_ip() {
        let group = group_with_weights(&[50, 50]);
        let a = select_sticky(&group, 0x0a000001);
        let b = select_sticky(&group, 0x0a000001);
        assert_eq!(a, b);
    }

    #[test]
    fn least_conn_picks_minimum() {
        let group = group_with_weights(&[50, 50]);
        assert_eq!(select_least_conn(&group, &[5, 2]), Some(1));
        assert_eq!(select_least_conn(&group, &[0, 2]), Some(0));
    }

    #[test]
    fn recovery_schedule_scales_weight() {
        assert_eq!(recovery_weight(100, 0), 25);
        assert_eq!(recovery_weight(100, 3), 100);
        assert_eq!(recovery_weight(100, 99), 100);
    }
}
