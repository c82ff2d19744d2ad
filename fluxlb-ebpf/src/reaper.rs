//! Conntrack idle-timeout reaper (C6, consumer half lives in
//! `fluxlb-control`'s stats consumer).
//!
//! The kernel programs never expire conntrack entries themselves — only
//! this periodic host-side scan does, since only userspace can afford an
//! unbounded walk over the whole map. Each expired entry is handed back to
//! the caller (the control plane's stats consumer) so it can synthesize a
//! `CONN_CLOSED` observation with final byte/packet counts before the entry
//! is gone for good.

use std::time::{SystemTime, UNIX_EPOCH};

use fluxlb_ebpf_common::conntrack::{ConntrackKey, ConntrackValue};

use crate::error::Result;
use crate::maps::FluxMaps;

/// One conntrack entry the reaper decided to remove, carrying its final
/// counters for the stats consumer to turn into a closing event.
pub struct ExpiredConnection {
    pub key: ConntrackKey,
    pub value: ConntrackValue,
}

/// Scans every conntrack entry and removes the ones whose `last_seen_ns` is
/// older than `idle_timeout_ns`. Returns the entries it removed.
///
/// `now_ns` is passed in (rather than read internally) so this function
/// stays deterministic and unit-testable; callers pass
/// `fluxlb_ebpf_common`'s clock convention (nanoseconds since an arbitrary
/// epoch, matching `bpf_ktime_get_ns`, which is boot time — callers are
/// expected to read the corresponding host clock, see [`monotonic_now_ns`]).
pub fn reap_idle(maps: &mut FluxMaps, now_ns: u64, idle_timeout_ns: u64) -> Result<Vec<ExpiredConnection>> {
    let mut expired = Vec::new();
    for (key, value) in maps.conntrack_entries() {
        let age = now_ns.saturating_sub(value.last_seen_ns);
        if age >= idle_timeout_ns {
            maps.remove_conntrack_entry(&key)?;
            expired.push(ExpiredConnection { key, value });
        }
    }
    Ok(expired)
}

/// Host-side equivalent of `bpf_ktime_get_ns`: nanoseconds on the
/// `CLOCK_MONOTONIC` clock, which is what the kernel programs' timestamps
/// are actually drawn from (boot time, not wall time).
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64)
}

/// Wall-clock helper for log timestamps; never used for idle-timeout math.
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
