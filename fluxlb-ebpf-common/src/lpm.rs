//! Source-prefix routing map: longest-prefix-match key to a target group.

use crate::Addr;

/// Key for an `LpmTrie` map. `prefix_len` is in bits and must come first in
/// the struct for `aya`'s `bpf_lpm_trie_key` layout (prefix length, then the
/// matched data) to line up with what the kernel's LPM trie implementation
/// expects.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LpmKey {
    pub prefix_len: u32,
    pub ip: Addr,
}

const _: () = assert!(core::mem::size_of::<LpmKey>() == 20);
const _: () = assert!(core::mem::offset_of!(LpmKey, prefix_len) == 0);
const _: () = assert!(core::mem::offset_of!(LpmKey, ip) == 4);

/// Maximum number of weighted backends in a single target group. Fixed so
/// the value type has a constant, verifier-friendly size; `fluxlb-control`
/// rejects a configured proxy with more backends than this at load time.
pub const MAX_TARGETS: usize = 8;

/// Bits in [`TargetGroup::flags`].
pub mod group_flags {
    /// Weighted random selection; without this bit, selection is uniform
    /// round of the first `target_count` entries by cumulative weight.
    pub const WEIGHTED: u8 = 1 << 0;
    /// Least-connections selection (overrides weighted/uniform).
    pub const LEAST_CONN: u8 = 1 << 1;
    /// Connections routed to this group get a PROXY-protocol-v2 header
    /// injected by the TC ingress program before the first payload byte.
    pub const PROXY_PROTOCOL: u8 = 1 << 2;
}

/// One weighted backend. `cumulative_weight` is the running sum (not the
/// raw per-target weight) so selection is a single scan comparing a random
/// draw against each entry in turn, per the weighted-random selection
/// algorithm.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    pub ip: Addr,
    pub port: u16,
    pub cumulative_weight: u16,
}

const _: () = assert!(core::mem::size_of::<Target>() == 20);

/// A selectable set of backends: the value type for both the listen map
/// (default target group) and the LPM / SNI maps (route-specific target
/// groups).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TargetGroup {
    pub target_count: u8,
    pub flags: u8,
    pub session_persistence: u8,
    pub _pad: [u8; 5],
    pub targets: [Target; MAX_TARGETS],
}

const _: () = assert!(core::mem::size_of::<TargetGroup>() == 168);
const _: () = assert!(core::mem::offset_of!(TargetGroup, target_count) == 0);
const _: () = assert!(core::mem::offset_of!(TargetGroup, flags) == 1);
const _: () = assert!(core::mem::offset_of!(TargetGroup, session_persistence) == 2);
const _: () = assert!(core::mem::offset_of!(TargetGroup, targets) == 8);

impl TargetGroup {
    #[inline]
    pub fn is_weighted(&self) -> bool {
        self.flags & group_flags::WEIGHTED != 0
    }

    #[inline]
    pub fn is_least_conn(&self) -> bool {
        self.flags & group_flags::LEAST_CONN != 0
    }

    #[inline]
    pub fn wants_proxy_protocol(&self) -> bool {
        self.flags & group_flags::PROXY_PROTOCOL != 0
    }

    #[inline]
    pub fn live_targets(&self) -> &[Target] {
        &self.targets[..(self.target_count as usize).min(MAX_TARGETS)]
    }
}

/// `LpmValue` is the same shape as the listen/SNI target group; the LPM map
/// simply names it for clarity at call sites.
pub type LpmValue = TargetGroup;

#[cfg(feature = "aya")]
#[allow(unsafe_code)]
mod pod_impls {
    use super::*;

    /// SAFETY: `LpmKey` is `#[repr(C)]`, `Copy`, all bit patterns valid.
    unsafe impl aya::Pod for LpmKey {}
    /// SAFETY: `Target` is `#[repr(C)]`, `Copy`, all bit patterns valid.
    unsafe impl aya::Pod for Target {}
    /// SAFETY: `TargetGroup` is `#[repr(C)]`, `Copy`, all bit patterns valid.
    unsafe impl aya::Pod for TargetGroup {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_sizes_are_byte_exact() {
        assert_eq!(core::mem::size_of::<LpmKey>(), 20);
        assert_eq!(core::mem::size_of::<TargetGroup>(), 168);
    }

    #[test]
    fn live_targets_respects_target_count() {
        let mut group = TargetGroup::default();
        group.target_count = 2;
        group.targets[0] = Target {
            ip: Addr::from_v4_octets([10, 0, 0, 1]),
            port: 80,
            cumulative_weight: 50,
        };
        group.targets[1] = Target {
            ip: Addr::from_v4_octets([10, 0, 0, 2]),
            port: 80,
            cumulative_weight: 100,
        };
        assert_eq!(group.live_targets().len(), 2);
    }
}
