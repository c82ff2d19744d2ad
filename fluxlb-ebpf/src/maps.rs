//! Typed wrappers around the BPF maps declared in `fluxlb-ebpf-common` and
//! populated by the kernel programs in `fluxlb-ebpf-xdp`/`fluxlb-ebpf-tc`.
//!
//! `fluxlb-control` never touches `aya::maps` directly — every map write the
//! control plane issues (a health check flipping a target live/dead, the
//! weight computer pushing new cumulative weights, the DNS resolver
//! installing a fresh backend set) goes through one of the methods here, so
//! the map's wire layout stays centralized in one crate.

use aya::maps::lpm_trie::{Key as LpmTrieKey, LpmTrie};
use aya::maps::{Array, HashMap, LruHashMap, MapData};
use aya::Ebpf;

use fluxlb_ebpf_common::conntrack::{ConntrackKey, ConntrackValue};
use fluxlb_ebpf_common::listen::{ListenKey, ListenValue};
use fluxlb_ebpf_common::lpm::TargetGroup;
use fluxlb_ebpf_common::ratelimit::{BackendKey, RateLimitBucket};
use fluxlb_ebpf_common::settings::{SettingsArray, SLOT_COUNT};
use fluxlb_ebpf_common::sni::SniKey;
use fluxlb_ebpf_common::Addr;

use crate::error::{EbpfError, Result};

/// A handle to every named map the control plane reads or writes, resolved
/// once at load time from the `aya::Ebpf` instance that owns the XDP object
/// (maps created there are pinned and then reused by the TC object, per
/// `Loader::load`).
pub struct FluxMaps {
    listen: HashMap<MapData, ListenKey, ListenValue>,
    lpm: LpmTrie<MapData, [u8; 16], TargetGroup>,
    sni: HashMap<MapData, SniKey, TargetGroup>,
    conntrack: HashMap<MapData, ConntrackKey, ConntrackValue>,
    settings: Array<MapData, SettingsArray>,
    ratelimit_src: LruHashMap<MapData, Addr, RateLimitBucket>,
    ratelimit_backend: HashMap<MapData, BackendKey, RateLimitBucket>,
}

impl FluxMaps {
    pub(crate) fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self> {
        Ok(Self {
            listen: take_map(ebpf, "listen_map")?,
            lpm: take_map(ebpf, "lpm_map")?,
            sni: take_map(ebpf, "sni_map")?,
            conntrack: take_map(ebpf, "conntrack_map")?,
            settings: take_map(ebpf, "settings_map")?,
            ratelimit_src: take_map(ebpf, "ratelimit_src_map")?,
            ratelimit_backend: take_map(ebpf, "ratelimit_backend_map")?,
        })
    }

    // ── listen_map ───────────────────────────────────────────────────────

    pub fn set_listener(&mut self, key: ListenKey, value: ListenValue) -> Result<()> {
        self.listen.insert(key, value, 0)?;
        Ok(())
    }

    pub fn remove_listener(&mut self, key: &ListenKey) -> Result<()> {
        self.listen.remove(key)?;
        Ok(())
    }

    // ── lpm_map ──────────────────────────────────────────────────────────

    /// `prefix_len` is in bits against the full 16-byte `Addr` encoding:
    /// `96 + n` for an IPv4 `/n`, `n` for a native IPv6 `/n` (see the
    /// ingress program's lookup-side comment on why IPv4 is offset by 96).
    pub fn set_route(&mut self, prefix_len: u32, addr: Addr, group: TargetGroup) -> Result<()> {
        let key = LpmTrieKey::new(prefix_len, addr.0);
        self.lpm.insert(&key, &group, 0)?;
        Ok(())
    }

    pub fn remove_route(&mut self, prefix_len: u32, addr: Addr) -> Result<()> {
        let key = LpmTrieKey::new(prefix_len, addr.0);
        self.lpm.remove(&key)?;
        Ok(())
    }

    // ── sni_map ──────────────────────────────────────────────────────────

    pub fn set_sni_route(&mut self, hostname: &str, group: TargetGroup) -> Result<()> {
        let lowered = hostname.to_ascii_lowercase();
        let key = SniKey::from_lowercased_hostname(lowered.as_bytes());
        self.sni.insert(key, group, 0)?;
        Ok(())
    }

    pub fn remove_sni_route(&mut self, hostname: &str) -> Result<()> {
        let lowered = hostname.to_ascii_lowercase();
        let key = SniKey::from_lowercased_hostname(lowered.as_bytes());
        self.sni.remove(&key)?;
        Ok(())
    }

    // ── settings_map ─────────────────────────────────────────────────────

    pub fn write_settings(&mut self, settings: SettingsArray) -> Result<()> {
        self.settings.set(0, settings, 0)?;
        Ok(())
    }

    pub fn write_slot(&mut self, slot: usize, value: u64) -> Result<()> {
        let mut current = self.settings.get(0, 0).unwrap_or([0u64; SLOT_COUNT]);
        current[slot] = value;
        self.settings.set(0, current, 0)?;
        Ok(())
    }

    pub fn read_settings(&self) -> SettingsArray {
        self.settings.get(0, 0).unwrap_or([0u64; SLOT_COUNT])
    }

    // ── ratelimit maps ───────────────────────────────────────────────────

    pub fn set_backend_rate_limit(&mut self, key: BackendKey, bucket: RateLimitBucket) -> Result<()> {
        self.ratelimit_backend.insert(key, bucket, 0)?;
        Ok(())
    }

    pub fn remove_backend_rate_limit(&mut self, key: &BackendKey) -> Result<()> {
        self.ratelimit_backend.remove(key)?;
        Ok(())
    }

    /// Evicts a single source bucket; used when an operator wants to reset a
    /// client's rate-limit state without waiting for LRU eviction.
    pub fn remove_source_rate_limit(&mut self, addr: &Addr) -> Result<()> {
        self.ratelimit_src.remove(addr)?;
        Ok(())
    }

    // ── conntrack_map ────────────────────────────────────────────────────

    /// Snapshots every entry currently installed, for the reaper's idle-scan
    /// pass (§ reaper design). Returns owned copies since the scan may
    /// delete entries it walks over.
    pub fn conntrack_entries(&self) -> Vec<(ConntrackKey, ConntrackValue)> {
        self.conntrack
            .iter()
            .filter_map(|entry| entry.ok())
            .collect()
    }

    pub fn remove_conntrack_entry(&mut self, key: &ConntrackKey) -> Result<()> {
        self.conntrack.remove(key)?;
        Ok(())
    }

    pub fn conntrack_len(&self) -> usize {
        self.conntrack.iter().filter_map(|e| e.ok()).count()
    }
}

fn take_map<T>(ebpf: &mut Ebpf, name: &'static str) -> Result<T>
where
    T: TryFrom<aya::maps::Map, Error = aya::maps::MapError>,
{
    let map = ebpf.take_map(name).ok_or(EbpfError::MapNotFound(name))?;
    T::try_from(map).map_err(|source| EbpfError::MapType { name, source })
}
