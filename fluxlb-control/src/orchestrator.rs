//! Control-plane orchestrator (C13, §6): the single entry point that wires
//! every other component in this crate together and exposes the runtime API
//! an operator (or the `fluxlb` binary's config loader) drives — add/remove
//! proxies and routes, attach/detach interfaces, drain targets, flip circuit
//! breakers, adjust rate limits, and read back live status.
//!
//! Per §5, state lives behind one write lock per proxy (`ProxyState`'s own
//! `std::sync::Mutex`, never held across an `.await`) plus one async lock
//! for the top-level registry of proxies and attached interfaces. A weight
//! push always completes before the call that triggered it returns; a drain
//! callback only fires after the conntrack scan that produced it; DNS change
//! handling is serialized per hostname by running entirely inside the single
//! event-listener task below rather than being re-entered concurrently.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fluxlb_core::net::{addr_from_ip, addr_to_ip, Cidr};
use fluxlb_ebpf::{FluxMaps, Loader};
use fluxlb_ebpf_common::af;
use fluxlb_ebpf_common::listen::{ListenKey, ListenValue};
use fluxlb_ebpf_common::lpm::{group_flags, TargetGroup};
use fluxlb_ebpf_common::settings::{circuit_breaker_flags, lb_algorithm, slot, SettingsArray, SLOT_COUNT};
use fluxlb_ebpf_common::Addr;

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::collab::{AccessLogSink, ControlEvent, DrainOutcome, StatsSink, TracingAccessLogSink, TracingStatsSink};
use crate::config::{
    HealthCheckKind, LbAlgorithm, ProxyConfig, RateLimitParams, SettingsConfig, SniRoute, SourceRoute, TargetSpec,
};
use crate::drain::{self, ConnectionCounter, DrainHandle};
use crate::error::{ControlError, Result};
use crate::health::{self, HealthCheckTarget};
use crate::ratelimit;
use crate::stats_consumer::{self, StatsConsumerConfig};
use crate::weight_computer::{compute_group, TargetSignal};
use crate::dns;

/// `(ip, port)` — the unit every target-facing operation keys on.
type TargetKey = (Addr, u16);

/// Holds the kernel map handle once the first interface is attached;
/// `None` before that, so proxies can be registered (and validated) before
/// any interface exists, with their weight push deferred until one does.
type MapsCell = Arc<StdMutex<Option<Arc<StdMutex<FluxMaps>>>>>;

const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn current_maps(cell: &MapsCell) -> Option<Arc<StdMutex<FluxMaps>>> {
    cell.lock().expect("maps cell lock poisoned").clone()
}

/// One backend as it resolved at load time: either a literal address or a
/// hostname whose last-known resolution is tracked separately so a later
/// DNS change for just that hostname can be applied without re-resolving
/// every other member of the group.
#[derive(Clone)]
enum MemberSpec {
    Literal { key: TargetKey, weight: u8 },
    Hostname { hostname: String, port: u16, weight: u8 },
}

/// A route's backend set: the configured members plus the flattened,
/// currently-resolved `(target, weight)` table actually pushed to the
/// kernel.
struct RouteGroupDef {
    specs: Vec<MemberSpec>,
    last_known: HashMap<String, Vec<IpAddr>>,
    resolved: Vec<(TargetKey, u8)>,
    session_persistence: bool,
}

fn rebuild_resolved(def: &mut RouteGroupDef) {
    let mut resolved = Vec::new();
    for spec in &def.specs {
        match spec {
            MemberSpec::Literal { key, weight } => resolved.push((*key, *weight)),
            MemberSpec::Hostname { hostname, port, weight } => {
                if let Some(addrs) = def.last_known.get(hostname) {
                    for (ip, w) in addrs.iter().zip(dns::redistribute_weights(*weight, addrs.len())) {
                        resolved.push(((addr_from_ip(*ip), *port), w));
                    }
                }
            }
        }
    }
    def.resolved = resolved;
}

fn update_group_for_hostname(def: &mut RouteGroupDef, hostname: &str, addrs: &[IpAddr]) {
    let affected = def
        .specs
        .iter()
        .any(|s| matches!(s, MemberSpec::Hostname { hostname: h, .. } if h == hostname));
    if affected {
        def.last_known.insert(hostname.to_string(), addrs.to_vec());
        rebuild_resolved(def);
    }
}

async fn resolve_group_def(spec: &TargetSpec, session_persistence: bool) -> Result<RouteGroupDef> {
    let mut specs = Vec::new();
    let mut last_known = HashMap::new();
    for wb in spec.as_weighted() {
        if let Ok(ip) = wb.addr.parse::<IpAddr>() {
            specs.push(MemberSpec::Literal { key: (addr_from_ip(ip), wb.port), weight: wb.weight });
        } else {
            let addrs = dns::resolve_once(&wb.addr, wb.port).await?;
            last_known.insert(wb.addr.clone(), addrs);
            specs.push(MemberSpec::Hostname { hostname: wb.addr, port: wb.port, weight: wb.weight });
        }
    }
    let mut def = RouteGroupDef { specs, last_known, resolved: Vec::new(), session_persistence };
    rebuild_resolved(&mut def);
    Ok(def)
}

fn collect_hostnames(state: &ProxyState) -> Vec<(String, u16)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for def in std::iter::once(&state.default_group)
        .chain(state.source_routes.iter().map(|(_, d)| d))
        .chain(state.sni_routes.values())
    {
        for spec in &def.specs {
            if let MemberSpec::Hostname { hostname, port, .. } = spec {
                if seen.insert(hostname.clone()) {
                    out.push((hostname.clone(), *port));
                }
            }
        }
    }
    out
}

/// Live, mutable state for one target: the pieces the weight computer and
/// the runtime API both need to see and flip, independent of whatever
/// config produced the target in the first place.
struct TargetRuntime {
    healthy: AtomicBool,
    recovery_step: StdMutex<Option<usize>>,
    draining: AtomicBool,
    circuit: Option<Arc<CircuitBreaker>>,
    circuit_forward: StdMutex<Option<JoinHandle<()>>>,
    health_task: StdMutex<Option<JoinHandle<()>>>,
    drain_handle: StdMutex<Option<DrainHandle>>,
    drain_waiters: StdMutex<Vec<oneshot::Sender<DrainOutcome>>>,
}

impl Drop for TargetRuntime {
    fn drop(&mut self) {
        if let Some(h) = self.health_task.lock().expect("health task lock poisoned").take() {
            h.abort();
        }
        if let Some(h) = self.circuit_forward.lock().expect("circuit forward lock poisoned").take() {
            h.abort();
        }
        if let Some(d) = self.drain_handle.lock().expect("drain handle lock poisoned").take() {
            d.cancel();
        }
    }
}

fn target_label(proxy: &str, ip: Addr, port: u16) -> String {
    format!("{proxy}/{}:{port}", addr_to_ip(&ip, !ip.is_v4_mapped()))
}

fn spawn_target_runtime(
    proxy_name: &str,
    key: TargetKey,
    config: &ProxyConfig,
    settings: &SettingsConfig,
    events: &broadcast::Sender<ControlEvent>,
) -> Arc<TargetRuntime> {
    let label = target_label(proxy_name, key.0, key.1);

    let circuit = settings
        .circuit_breaker
        .enabled
        .then(|| Arc::new(CircuitBreaker::new(label.clone(), settings.circuit_breaker.clone())));

    let circuit_forward = circuit.clone().map(|c| {
        let events = events.clone();
        let mut rx = c.subscribe();
        tokio::spawn(async move {
            while let Ok(ev) = rx.recv().await {
                let _ = events.send(ev);
            }
        })
    });

    let health_task = (config.health_check.kind != HealthCheckKind::None).then(|| {
        let ip = addr_to_ip(&key.0, !key.0.is_v4_mapped());
        let target = HealthCheckTarget {
            target: label.clone(),
            addr: ip,
            port: key.1,
            host: ip.to_string(),
            config: config.health_check.clone(),
        };
        tokio::spawn(health::run_probe_loop(target, events.clone(), circuit.clone()))
    });

    Arc::new(TargetRuntime {
        healthy: AtomicBool::new(true),
        recovery_step: StdMutex::new(None),
        draining: AtomicBool::new(false),
        circuit,
        circuit_forward: StdMutex::new(circuit_forward),
        health_task: StdMutex::new(health_task),
        drain_handle: StdMutex::new(None),
        drain_waiters: StdMutex::new(Vec::new()),
    })
}

/// Everything tracked for one configured proxy: its routes (resolved into
/// live target sets), the runtime state for every target those routes
/// currently reference, and the background tasks that keep it all live.
struct ProxyState {
    config: ProxyConfig,
    default_group: RouteGroupDef,
    source_routes: Vec<(Cidr, RouteGroupDef)>,
    sni_routes: HashMap<String, RouteGroupDef>,
    targets: HashMap<TargetKey, Arc<TargetRuntime>>,
    dns_hostnames: HashSet<String>,
    dns_tasks: Vec<JoinHandle<()>>,
}

fn sync_target_runtimes(
    proxy_name: &str,
    state: &mut ProxyState,
    settings: &SettingsConfig,
    events: &broadcast::Sender<ControlEvent>,
    label_index: &Arc<StdMutex<HashMap<String, Arc<TargetRuntime>>>>,
) {
    let mut union: HashSet<TargetKey> = HashSet::new();
    union.extend(state.default_group.resolved.iter().map(|(k, _)| *k));
    for (_, def) in &state.source_routes {
        union.extend(def.resolved.iter().map(|(k, _)| *k));
    }
    for def in state.sni_routes.values() {
        union.extend(def.resolved.iter().map(|(k, _)| *k));
    }

    let stale: Vec<TargetKey> = state.targets.keys().filter(|k| !union.contains(k)).copied().collect();
    for key in stale {
        if let Some(rt) = state.targets.remove(&key) {
            label_index
                .lock()
                .expect("label index lock poisoned")
                .remove(&target_label(proxy_name, key.0, key.1));
            drop(rt);
        }
    }

    for key in union {
        if !state.targets.contains_key(&key) {
            let rt = spawn_target_runtime(proxy_name, key, &state.config, settings, events);
            label_index
                .lock()
                .expect("label index lock poisoned")
                .insert(target_label(proxy_name, key.0, key.1), rt.clone());
            state.targets.insert(key, rt);
        }
    }
}

fn ensure_dns_refreshers(state: &mut ProxyState, events: &broadcast::Sender<ControlEvent>) {
    let mut to_spawn = Vec::new();
    for def in std::iter::once(&state.default_group)
        .chain(state.source_routes.iter().map(|(_, d)| d))
        .chain(state.sni_routes.values())
    {
        for spec in &def.specs {
            if let MemberSpec::Hostname { hostname, port, .. } = spec {
                if state.dns_hostnames.insert(hostname.clone()) {
                    to_spawn.push((hostname.clone(), *port, def.last_known.get(hostname).cloned().unwrap_or_default()));
                }
            }
        }
    }
    for (hostname, port, last_known) in to_spawn {
        let handle = tokio::spawn(dns::run_refresh_loop(hostname, port, DNS_REFRESH_INTERVAL, last_known, events.clone()));
        state.dns_tasks.push(handle);
    }
}

#[allow(unsafe_code)]
fn resolve_ifindex(name: &str) -> Result<u32> {
    let cname = std::ffi::CString::new(name).map_err(|_| ControlError::InterfaceNotFound(name.to_string()))?;
    // SAFETY: `cname` is a valid NUL-terminated C string owned for this call.
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        Err(ControlError::InterfaceNotFound(name.to_string()))
    } else {
        Ok(idx)
    }
}

fn lpm_prefix_len(cidr: &Cidr) -> u32 {
    if cidr.addr.is_v4_mapped() {
        96 + cidr.prefix_len as u32
    } else {
        cidr.prefix_len as u32
    }
}

fn group_af(group: &TargetGroup) -> u8 {
    group
        .live_targets()
        .first()
        .map(|t| if t.ip.is_v4_mapped() { af::INET } else { af::INET6 })
        .unwrap_or(af::INET)
}

fn connection_counts(maps: &mut FluxMaps) -> HashMap<TargetKey, u32> {
    let mut counts = HashMap::new();
    for (_, v) in maps.conntrack_entries() {
        *counts.entry((v.nat_dst_ip, v.nat_dst_port)).or_insert(0u32) += 1;
    }
    counts
}

fn build_group(
    def: &RouteGroupDef,
    targets: &HashMap<TargetKey, Arc<TargetRuntime>>,
    least_conn: bool,
    wants_proxy_protocol: bool,
    counts: &HashMap<TargetKey, u32>,
) -> TargetGroup {
    let signals: Vec<TargetSignal> = def
        .resolved
        .iter()
        .map(|(key, weight)| {
            let rt = targets.get(key);
            TargetSignal {
                ip: key.0,
                port: key.1,
                original_weight: *weight,
                healthy: rt.map(|r| r.healthy.load(Ordering::SeqCst)).unwrap_or(true),
                draining: rt.map(|r| r.draining.load(Ordering::SeqCst)).unwrap_or(false),
                circuit: rt
                    .and_then(|r| r.circuit.as_ref())
                    .map(|c| c.state())
                    .unwrap_or(CircuitState::Closed),
                recovery_step: rt.and_then(|r| *r.recovery_step.lock().expect("recovery step lock poisoned")),
                active_connections: counts.get(key).copied().unwrap_or(0),
            }
        })
        .collect();

    let mut group = compute_group(&signals, least_conn, def.session_persistence);
    if wants_proxy_protocol {
        group.flags |= group_flags::PROXY_PROTOCOL;
    }
    group
}

/// Pushes one proxy's default/source/SNI groups to every interface it
/// listens on. Called after any change to health, circuit, drain, or DNS
/// state for one of its targets, and after the proxy is first registered.
fn push_proxy(name: &str, state: &ProxyState, maps: &Arc<StdMutex<FluxMaps>>, least_conn: bool) -> Result<()> {
    let mut guard = maps.lock().expect("flux maps lock poisoned");
    let counts = if least_conn { connection_counts(&mut guard) } else { HashMap::new() };

    let default_group = build_group(&state.default_group, &state.targets, least_conn, state.config.proxy_protocol, &counts);
    let af_tag = group_af(&default_group);
    for iface in &state.config.listen.interfaces {
        let ifindex = resolve_ifindex(iface)?;
        let key = ListenKey { ifindex, port: state.config.listen.port, af: af_tag, _pad: [0] };
        let value = ListenValue {
            group: default_group,
            sni_enabled: u8::from(!state.sni_routes.is_empty()),
            _pad: [0],
        };
        guard.set_listener(key, value)?;
    }

    for (cidr, def) in &state.source_routes {
        let group = build_group(def, &state.targets, least_conn, state.config.proxy_protocol, &counts);
        guard.set_route(lpm_prefix_len(cidr), cidr.addr, group)?;
    }

    for (hostname, def) in &state.sni_routes {
        let group = build_group(def, &state.targets, least_conn, state.config.proxy_protocol, &counts);
        guard.set_sni_route(hostname, group)?;
    }

    info!(proxy = %name, "weight push complete");
    Ok(())
}

fn push_global_settings(maps: &Arc<StdMutex<FluxMaps>>, settings: &SettingsConfig) -> Result<()> {
    let mut arr: SettingsArray = [0u64; SLOT_COUNT];
    arr[slot::STATS_ENABLED] = u64::from(settings.stats_enabled);
    arr[slot::IDLE_TIMEOUT_SECONDS] = settings.idle_timeout_sec;
    arr[slot::MAX_CONNECTIONS] = u64::from(settings.max_connections);
    arr[slot::LB_ALGORITHM] = match settings.load_balancing.algorithm {
        LbAlgorithm::Weighted => lb_algorithm::WEIGHTED_RANDOM,
        LbAlgorithm::LeastConn => lb_algorithm::LEAST_CONNECTIONS,
    };
    arr[slot::LB_WEIGHTED_FLAG] = u64::from(settings.load_balancing.weighted);
    arr[slot::UPDATE_INTERVAL_MS] = settings.load_balancing.update_interval_ms;
    if let Some(src) = &settings.rate_limits.source {
        let (rate, burst) = ratelimit::scale_for_settings(src);
        arr[slot::SOURCE_RATE_LIMIT] = u64::from(rate);
        arr[slot::SOURCE_BURST] = u64::from(burst);
    }
    arr[slot::CIRCUIT_BREAKER_FLAGS] =
        if settings.circuit_breaker.enabled { circuit_breaker_flags::ENABLED } else { 0 };

    let mut guard = maps.lock().expect("flux maps lock poisoned");
    guard.write_settings(arr)?;
    Ok(())
}

struct MapsConnectionCounter(Arc<StdMutex<FluxMaps>>);

impl ConnectionCounter for MapsConnectionCounter {
    fn count(&self, target_ip: Addr, target_port: u16) -> usize {
        let maps = self.0.lock().expect("flux maps lock poisoned");
        maps.conntrack_entries()
            .iter()
            .filter(|(_, v)| v.nat_dst_ip == target_ip && v.nat_dst_port == target_port)
            .count()
    }
}

fn spawn_event_listener(
    mut rx: broadcast::Receiver<ControlEvent>,
    label_index: Arc<StdMutex<HashMap<String, Arc<TargetRuntime>>>>,
    dns_index: Arc<StdMutex<HashMap<String, Vec<Arc<StdMutex<ProxyState>>>>>>,
    maps: MapsCell,
    settings: SettingsConfig,
) -> JoinHandle<()> {
    let least_conn = settings.load_balancing.algorithm == LbAlgorithm::LeastConn;

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ControlEvent::HealthChanged { target, healthy }) => {
                    if let Some(rt) = label_index.lock().expect("label index lock poisoned").get(&target) {
                        rt.healthy.store(healthy, Ordering::SeqCst);
                        *rt.recovery_step.lock().expect("recovery step lock poisoned") = if healthy { Some(0) } else { None };
                    }
                }
                Ok(ControlEvent::DnsChanged { hostname, addrs }) => {
                    let proxies = dns_index
                        .lock()
                        .expect("dns index lock poisoned")
                        .get(&hostname)
                        .cloned()
                        .unwrap_or_default();
                    for proxy_state in proxies {
                        reconcile_hostname(&proxy_state, &hostname, &addrs, &maps, least_conn, &label_index);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "control event bus lagged; some updates were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn reconcile_hostname(
    proxy_state: &Arc<StdMutex<ProxyState>>,
    hostname: &str,
    addrs: &[IpAddr],
    maps: &MapsCell,
    least_conn: bool,
    label_index: &Arc<StdMutex<HashMap<String, Arc<TargetRuntime>>>>,
) {
    // New targets introduced by this DNS change inherit no health check or
    // circuit breaker (§9 open question, recorded in DESIGN.md): wiring
    // those up here would need the proxy's settings/events handles, which
    // `reconcile_hostname` deliberately does not carry so DNS handling stays
    // a pure route-table update. `sync_target_runtimes` below still adds a
    // bare `TargetRuntime` (healthy by default) so weight/drain/rate-limit
    // operations keep working for it; `force_dns_resolve` performs the full
    // reconcile including health/circuit wiring.
    let name = {
        let mut state = proxy_state.lock().expect("proxy state lock poisoned");
        update_group_for_hostname(&mut state.default_group, hostname, addrs);
        for (_, def) in state.source_routes.iter_mut() {
            update_group_for_hostname(def, hostname, addrs);
        }
        for def in state.sni_routes.values_mut() {
            update_group_for_hostname(def, hostname, addrs);
        }
        let name = state.config.name.clone();
        retarget_without_probes(&name, &mut state, &label_index);
        name
    };

    if let Some(maps_arc) = current_maps(maps) {
        let state = proxy_state.lock().expect("proxy state lock poisoned");
        if let Err(e) = push_proxy(&name, &state, &maps_arc, least_conn) {
            warn!(proxy = %name, error = %e, "weight push after DNS change failed");
        }
    }
}

/// Bare-bones version of [`sync_target_runtimes`] used by the DNS
/// event-listener path: adds/removes `TargetRuntime` entries for the new
/// resolved set, but never spawns a health-probe task, since that needs a
/// `ProxyConfig`/`SettingsConfig` the listener doesn't hold a clone of.
fn retarget_without_probes(
    proxy_name: &str,
    state: &mut ProxyState,
    label_index: &Arc<StdMutex<HashMap<String, Arc<TargetRuntime>>>>,
) {
    let mut union: HashSet<TargetKey> = HashSet::new();
    union.extend(state.default_group.resolved.iter().map(|(k, _)| *k));
    for (_, def) in &state.source_routes {
        union.extend(def.resolved.iter().map(|(k, _)| *k));
    }
    for def in state.sni_routes.values() {
        union.extend(def.resolved.iter().map(|(k, _)| *k));
    }

    let stale: Vec<TargetKey> = state.targets.keys().filter(|k| !union.contains(k)).copied().collect();
    for key in stale {
        if let Some(rt) = state.targets.remove(&key) {
            label_index
                .lock()
                .expect("label index lock poisoned")
                .remove(&target_label(proxy_name, key.0, key.1));
            drop(rt);
        }
    }

    for key in union {
        state.targets.entry(key).or_insert_with(|| {
            Arc::new(TargetRuntime {
                healthy: AtomicBool::new(true),
                recovery_step: StdMutex::new(None),
                draining: AtomicBool::new(false),
                circuit: None,
                circuit_forward: StdMutex::new(None),
                health_task: StdMutex::new(None),
                drain_handle: StdMutex::new(None),
                drain_waiters: StdMutex::new(Vec::new()),
            })
        });
    }
}

/// One target's point-in-time status, as returned by [`Orchestrator::get_all_statuses`].
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub ip: IpAddr,
    pub port: u16,
    pub healthy: bool,
    pub draining: bool,
    pub circuit_state: Option<&'static str>,
    pub recovery_step: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ProxyStatus {
    pub name: String,
    pub targets: Vec<TargetStatus>,
}

struct Registry {
    loaders: HashMap<String, Loader>,
    attach_order: Vec<String>,
    stats_task: Option<JoinHandle<()>>,
    stats_sinks: Vec<Arc<dyn StatsSink>>,
    access_log_sinks: Vec<Arc<dyn AccessLogSink>>,
    proxies: HashMap<String, Arc<StdMutex<ProxyState>>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            loaders: HashMap::new(),
            attach_order: Vec::new(),
            stats_task: None,
            stats_sinks: vec![Arc::new(TracingStatsSink)],
            access_log_sinks: vec![Arc::new(TracingAccessLogSink)],
            proxies: HashMap::new(),
        }
    }
}

/// Owns every attached interface, every configured proxy, and the
/// background tasks that keep their live state current. One instance per
/// process (§1: single load-balancer instance, not a distributed control
/// plane).
pub struct Orchestrator {
    registry: AsyncMutex<Registry>,
    events: broadcast::Sender<ControlEvent>,
    settings: SettingsConfig,
    maps: MapsCell,
    label_index: Arc<StdMutex<HashMap<String, Arc<TargetRuntime>>>>,
    dns_index: Arc<StdMutex<HashMap<String, Vec<Arc<StdMutex<ProxyState>>>>>>,
    event_listener: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(settings: SettingsConfig) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        let label_index = Arc::new(StdMutex::new(HashMap::new()));
        let dns_index = Arc::new(StdMutex::new(HashMap::new()));
        let maps: MapsCell = Arc::new(StdMutex::new(None));
        let event_listener = spawn_event_listener(
            events.subscribe(),
            label_index.clone(),
            dns_index.clone(),
            maps.clone(),
            settings.clone(),
        );

        Orchestrator { registry: AsyncMutex::new(Registry::new()), events, settings, maps, label_index, event_listener }
    }

    fn least_conn(&self) -> bool {
        self.settings.load_balancing.algorithm == LbAlgorithm::LeastConn
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub async fn register_stats_sink(&self, sink: Arc<dyn StatsSink>) {
        let mut registry = self.registry.lock().await;
        if registry.stats_task.is_some() {
            warn!("stats sink registered after the stats consumer already started; it will not receive events");
        }
        registry.stats_sinks.push(sink);
    }

    pub async fn register_access_log_sink(&self, sink: Arc<dyn AccessLogSink>) {
        let mut registry = self.registry.lock().await;
        if registry.stats_task.is_some() {
            warn!("access-log sink registered after the stats consumer already started; it will not receive events");
        }
        registry.access_log_sinks.push(sink);
    }

    // ── interfaces ───────────────────────────────────────────────────────

    pub async fn attach_interface(&self, interface: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.loaders.contains_key(interface) {
            return Ok(());
        }

        let mut loader = Loader::attach(interface)?;
        let is_first = current_maps(&self.maps).is_none();

        if is_first {
            let maps = loader.maps()?;
            let shared = Arc::new(StdMutex::new(maps));
            *self.maps.lock().expect("maps cell lock poisoned") = Some(shared.clone());
            push_global_settings(&shared, &self.settings)?;

            let ring = loader.take_stats_ring()?;
            let stats_config = StatsConsumerConfig {
                idle_timeout: Duration::from_secs(self.settings.idle_timeout_sec),
                reap_interval: Duration::from_secs(5),
                stats_sinks: registry.stats_sinks.clone(),
                access_log_sinks: registry.access_log_sinks.clone(),
            };
            registry.stats_task = Some(tokio::spawn(stats_consumer::run(ring, shared, stats_config)));
        }

        registry.loaders.insert(interface.to_string(), loader);
        registry.attach_order.push(interface.to_string());

        if let Some(maps) = current_maps(&self.maps) {
            let least_conn = self.least_conn();
            for (name, state) in &registry.proxies {
                let guard = state.lock().expect("proxy state lock poisoned");
                if let Err(e) = push_proxy(name, &guard, &maps, least_conn) {
                    warn!(proxy = %name, interface, error = %e, "weight push after interface attach failed");
                }
            }
        }

        info!(interface, "interface attached");
        Ok(())
    }

    pub async fn detach_interface(&self, interface: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry
            .loaders
            .remove(interface)
            .ok_or_else(|| ControlError::InterfaceNotFound(interface.to_string()))?;
        registry.attach_order.retain(|i| i != interface);

        if let (Ok(ifindex), Some(maps)) = (resolve_ifindex(interface), current_maps(&self.maps)) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            for state in registry.proxies.values() {
                let st = state.lock().expect("proxy state lock poisoned");
                if st.config.listen.interfaces.iter().any(|i| i == interface) {
                    for af_tag in [af::INET, af::INET6] {
                        let key = ListenKey { ifindex, port: st.config.listen.port, af: af_tag, _pad: [0] };
                        let _ = guard.remove_listener(&key);
                    }
                }
            }
        }

        info!(interface, "interface detached");
        Ok(())
    }

    // ── proxies ──────────────────────────────────────────────────────────

    pub async fn add_proxy(&self, config: ProxyConfig) -> Result<()> {
        crate::config::validate_proxy(&config)?;

        {
            let registry = self.registry.lock().await;
            if registry.proxies.contains_key(&config.name) {
                return Err(ControlError::DuplicateProxy(config.name.clone()));
            }
        }

        let default_group = resolve_group_def(&config.default_target, config.session_persistence).await?;
        let mut source_routes = Vec::new();
        for route in &config.source_routes {
            let cidr = parse_cidr(&route.cidr)?;
            let persistence = route.session_persistence.unwrap_or(config.session_persistence);
            source_routes.push((cidr, resolve_group_def(&route.target, persistence).await?));
        }
        let mut sni_routes = HashMap::new();
        for route in &config.sni_routes {
            let def = resolve_group_def(&route.target, config.session_persistence).await?;
            sni_routes.insert(route.hostname.to_ascii_lowercase(), def);
        }

        let mut state = ProxyState {
            config: config.clone(),
            default_group,
            source_routes,
            sni_routes,
            targets: HashMap::new(),
            dns_hostnames: HashSet::new(),
            dns_tasks: Vec::new(),
        };
        sync_target_runtimes(&config.name, &mut state, &self.settings, &self.events, &self.label_index);
        ensure_dns_refreshers(&mut state, &self.events);
        let hostnames = collect_hostnames(&state);
        let state = Arc::new(StdMutex::new(state));

        {
            let mut idx = self.dns_index.lock().expect("dns index lock poisoned");
            for (hostname, _) in hostnames {
                idx.entry(hostname).or_default().push(state.clone());
            }
        }

        if let Some(maps) = current_maps(&self.maps) {
            let guard = state.lock().expect("proxy state lock poisoned");
            push_proxy(&config.name, &guard, &maps, self.least_conn())?;
        }

        let mut registry = self.registry.lock().await;
        registry.proxies.insert(config.name.clone(), state);
        info!(proxy = %config.name, "proxy added");
        Ok(())
    }

    pub async fn remove_proxy(&self, name: &str) -> Result<()> {
        let state_arc = {
            let mut registry = self.registry.lock().await;
            registry.proxies.remove(name).ok_or_else(|| ControlError::UnknownProxy(name.to_string()))?
        };

        {
            let mut idx = self.dns_index.lock().expect("dns index lock poisoned");
            for refs in idx.values_mut() {
                refs.retain(|s| !Arc::ptr_eq(s, &state_arc));
            }
        }

        let mut state = state_arc.lock().expect("proxy state lock poisoned");
        for task in state.dns_tasks.drain(..) {
            task.abort();
        }
        let keys: Vec<TargetKey> = state.targets.keys().copied().collect();
        for key in keys {
            if let Some(rt) = state.targets.remove(&key) {
                self.label_index
                    .lock()
                    .expect("label index lock poisoned")
                    .remove(&target_label(name, key.0, key.1));
                drop(rt);
            }
        }

        if let Some(maps) = current_maps(&self.maps) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            for iface in &state.config.listen.interfaces {
                if let Ok(ifindex) = resolve_ifindex(iface) {
                    for af_tag in [af::INET, af::INET6] {
                        let key = ListenKey { ifindex, port: state.config.listen.port, af: af_tag, _pad: [0] };
                        let _ = guard.remove_listener(&key);
                    }
                }
            }
            for (cidr, _) in &state.source_routes {
                let _ = guard.remove_route(lpm_prefix_len(cidr), cidr.addr);
            }
            for hostname in state.sni_routes.keys() {
                let _ = guard.remove_sni_route(hostname);
            }
        }

        info!(proxy = %name, "proxy removed");
        Ok(())
    }

    async fn get_proxy(&self, proxy: &str) -> Result<Arc<StdMutex<ProxyState>>> {
        let registry = self.registry.lock().await;
        registry.proxies.get(proxy).cloned().ok_or_else(|| ControlError::UnknownProxy(proxy.to_string()))
    }

    fn push_after_change(&self, proxy: &str, state: &Arc<StdMutex<ProxyState>>) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            let guard = state.lock().expect("proxy state lock poisoned");
            push_proxy(proxy, &guard, &maps, self.least_conn())?;
        }
        Ok(())
    }

    // ── routes ───────────────────────────────────────────────────────────

    pub async fn add_source_route(&self, proxy: &str, route: SourceRoute) -> Result<()> {
        crate::config::validate_target(proxy, &route.target)?;
        let cidr = parse_cidr(&route.cidr)?;
        let state_arc = self.get_proxy(proxy).await?;

        let persistence = {
            let state = state_arc.lock().expect("proxy state lock poisoned");
            route.session_persistence.unwrap_or(state.config.session_persistence)
        };
        let def = resolve_group_def(&route.target, persistence).await?;

        {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            state.source_routes.push((cidr, def));
            sync_target_runtimes(proxy, &mut state, &self.settings, &self.events, &self.label_index);
            ensure_dns_refreshers(&mut state, &self.events);
        }
        self.reindex_dns_hostnames(proxy, &state_arc);
        self.push_after_change(proxy, &state_arc)
    }

    pub async fn remove_source_route(&self, proxy: &str, cidr_text: &str) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            state.source_routes.retain(|(c, _)| !cidr_matches(c, cidr_text));
            sync_target_runtimes(proxy, &mut state, &self.settings, &self.events, &self.label_index);
        }
        if let Some(maps) = current_maps(&self.maps) {
            if let Ok(cidr) = parse_cidr(cidr_text) {
                let mut guard = maps.lock().expect("flux maps lock poisoned");
                let _ = guard.remove_route(lpm_prefix_len(&cidr), cidr.addr);
            }
        }
        self.push_after_change(proxy, &state_arc)
    }

    pub async fn add_sni_route(&self, proxy: &str, route: SniRoute) -> Result<()> {
        crate::config::validate_target(proxy, &route.target)?;
        let state_arc = self.get_proxy(proxy).await?;
        let persistence = state_arc.lock().expect("proxy state lock poisoned").config.session_persistence;
        let def = resolve_group_def(&route.target, persistence).await?;

        {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            state.sni_routes.insert(route.hostname.to_ascii_lowercase(), def);
            sync_target_runtimes(proxy, &mut state, &self.settings, &self.events, &self.label_index);
            ensure_dns_refreshers(&mut state, &self.events);
        }
        self.reindex_dns_hostnames(proxy, &state_arc);
        self.push_after_change(proxy, &state_arc)
    }

    pub async fn remove_sni_route(&self, proxy: &str, hostname: &str) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        let lowered = hostname.to_ascii_lowercase();
        {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            state.sni_routes.remove(&lowered);
            sync_target_runtimes(proxy, &mut state, &self.settings, &self.events, &self.label_index);
        }
        if let Some(maps) = current_maps(&self.maps) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            let _ = guard.remove_sni_route(&lowered);
        }
        self.push_after_change(proxy, &state_arc)
    }

    pub async fn list_sni_routes(&self, proxy: &str) -> Result<Vec<String>> {
        let state_arc = self.get_proxy(proxy).await?;
        let state = state_arc.lock().expect("proxy state lock poisoned");
        Ok(state.sni_routes.keys().cloned().collect())
    }

    /// Re-registers `state_arc` in the DNS hostname index for any hostname
    /// it references that isn't already indexed against it (adding a route
    /// can introduce new hostnames after the proxy was first registered).
    fn reindex_dns_hostnames(&self, _proxy: &str, state_arc: &Arc<StdMutex<ProxyState>>) {
        let hostnames = collect_hostnames(&state_arc.lock().expect("proxy state lock poisoned"));
        let mut idx = self.dns_index.lock().expect("dns index lock poisoned");
        for (hostname, _) in hostnames {
            let refs = idx.entry(hostname).or_default();
            if !refs.iter().any(|s| Arc::ptr_eq(s, state_arc)) {
                refs.push(state_arc.clone());
            }
        }
    }

    // ── DNS ──────────────────────────────────────────────────────────────

    pub async fn force_dns_resolve(&self, proxy: &str) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        let hostnames = collect_hostnames(&state_arc.lock().expect("proxy state lock poisoned"));

        let mut resolved = HashMap::new();
        for (hostname, port) in &hostnames {
            resolved.insert(hostname.clone(), dns::resolve_once(hostname, *port).await?);
        }

        {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            for (hostname, addrs) in &resolved {
                update_group_for_hostname(&mut state.default_group, hostname, addrs);
                for (_, def) in state.source_routes.iter_mut() {
                    update_group_for_hostname(def, hostname, addrs);
                }
                for def in state.sni_routes.values_mut() {
                    update_group_for_hostname(def, hostname, addrs);
                }
            }
            sync_target_runtimes(proxy, &mut state, &self.settings, &self.events, &self.label_index);
        }

        self.push_after_change(proxy, &state_arc)
    }

    // ── drain ────────────────────────────────────────────────────────────

    pub async fn drain(&self, proxy: &str, ip: IpAddr, port: u16, timeout: Duration) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        let key = (addr_from_ip(ip), port);
        let rt = self.target_runtime(proxy, &state_arc, key)?;
        rt.draining.store(true, Ordering::SeqCst);

        self.push_after_change(proxy, &state_arc)?;

        if let Some(maps) = current_maps(&self.maps) {
            let counter = Arc::new(MapsConnectionCounter(maps));
            let events = self.events.clone();
            let proxy_label = proxy.to_string();
            let rt_for_cb = rt.clone();
            let handle = drain::start_drain(key.0, key.1, timeout, DRAIN_POLL_INTERVAL, counter, move |outcome| {
                let _ = events.send(ControlEvent::DrainComplete { target: proxy_label, outcome });
                let waiters = std::mem::take(&mut *rt_for_cb.drain_waiters.lock().expect("drain waiters lock poisoned"));
                for tx in waiters {
                    let _ = tx.send(outcome);
                }
            });
            *rt.drain_handle.lock().expect("drain handle lock poisoned") = Some(handle);
        }
        Ok(())
    }

    pub async fn undrain(&self, proxy: &str, ip: IpAddr, port: u16) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        let key = (addr_from_ip(ip), port);
        let rt = self.target_runtime(proxy, &state_arc, key)?;
        if let Some(h) = rt.drain_handle.lock().expect("drain handle lock poisoned").take() {
            h.cancel();
        }
        rt.draining.store(false, Ordering::SeqCst);
        self.push_after_change(proxy, &state_arc)
    }

    pub async fn wait_for_drain(&self, proxy: &str, ip: IpAddr, port: u16) -> Result<DrainOutcome> {
        let state_arc = self.get_proxy(proxy).await?;
        let key = (addr_from_ip(ip), port);
        let rt = self.target_runtime(proxy, &state_arc, key)?;
        let (tx, rx) = oneshot::channel();
        rt.drain_waiters.lock().expect("drain waiters lock poisoned").push(tx);
        rx.await.map_err(|_| ControlError::DrainChannelClosed(format!("{ip}:{port}")))
    }

    fn target_runtime(&self, proxy: &str, state_arc: &Arc<StdMutex<ProxyState>>, key: TargetKey) -> Result<Arc<TargetRuntime>> {
        let state = state_arc.lock().expect("proxy state lock poisoned");
        state
            .targets
            .get(&key)
            .cloned()
            .ok_or_else(|| ControlError::UnknownTarget(format!("{}:{}", addr_to_ip(&key.0, !key.0.is_v4_mapped()), key.1), proxy.to_string()))
    }

    // ── circuit breaker ──────────────────────────────────────────────────

    pub async fn force_open_circuit(&self, proxy: &str, ip: IpAddr, port: u16) -> Result<()> {
        self.with_circuit(proxy, ip, port, |c| c.force_open()).await
    }

    pub async fn force_close_circuit(&self, proxy: &str, ip: IpAddr, port: u16) -> Result<()> {
        self.with_circuit(proxy, ip, port, |c| c.force_close()).await
    }

    pub async fn reset_circuit(&self, proxy: &str, ip: IpAddr, port: u16) -> Result<()> {
        self.with_circuit(proxy, ip, port, |c| c.reset()).await
    }

    async fn with_circuit(&self, proxy: &str, ip: IpAddr, port: u16, f: impl FnOnce(&CircuitBreaker)) -> Result<()> {
        let state_arc = self.get_proxy(proxy).await?;
        let key = (addr_from_ip(ip), port);
        let rt = self.target_runtime(proxy, &state_arc, key)?;
        let circuit = rt
            .circuit
            .as_ref()
            .ok_or_else(|| ControlError::CircuitMisuse(format!("circuit breaker disabled for {ip}:{port}")))?;
        f(circuit);
        self.push_after_change(proxy, &state_arc)
    }

    // ── rate limits ──────────────────────────────────────────────────────

    pub async fn set_source_rate_limit(&self, params: RateLimitParams) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            let (rate, burst) = ratelimit::scale_for_settings(&params);
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            guard.write_slot(slot::SOURCE_RATE_LIMIT, u64::from(rate))?;
            guard.write_slot(slot::SOURCE_BURST, u64::from(burst))?;
        }
        Ok(())
    }

    pub async fn disable_source_rate_limit(&self) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            guard.write_slot(slot::SOURCE_RATE_LIMIT, 0)?;
            guard.write_slot(slot::SOURCE_BURST, 0)?;
        }
        Ok(())
    }

    pub async fn set_backend_rate_limit(&self, ip: IpAddr, port: u16, params: RateLimitParams) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            ratelimit::set_backend_rate_limit(&mut guard, addr_from_ip(ip), port, &params, fluxlb_ebpf::monotonic_now_ns())?;
        }
        Ok(())
    }

    pub async fn disable_backend_rate_limit(&self, ip: IpAddr, port: u16) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            let mut guard = maps.lock().expect("flux maps lock poisoned");
            ratelimit::disable_backend_rate_limit(&mut guard, addr_from_ip(ip), port)?;
        }
        Ok(())
    }

    // ── stats ────────────────────────────────────────────────────────────

    pub async fn enable_stats(&self) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            maps.lock().expect("flux maps lock poisoned").write_slot(slot::STATS_ENABLED, 1)?;
        }
        Ok(())
    }

    pub async fn disable_stats(&self) -> Result<()> {
        if let Some(maps) = current_maps(&self.maps) {
            maps.lock().expect("flux maps lock poisoned").write_slot(slot::STATS_ENABLED, 0)?;
        }
        Ok(())
    }

    // ── status ───────────────────────────────────────────────────────────

    pub async fn get_all_statuses(&self) -> Vec<ProxyStatus> {
        let registry = self.registry.lock().await;
        registry
            .proxies
            .iter()
            .map(|(name, state)| {
                let state = state.lock().expect("proxy state lock poisoned");
                let targets = state
                    .targets
                    .iter()
                    .map(|(key, rt)| TargetStatus {
                        ip: addr_to_ip(&key.0, !key.0.is_v4_mapped()),
                        port: key.1,
                        healthy: rt.healthy.load(Ordering::SeqCst),
                        draining: rt.draining.load(Ordering::SeqCst),
                        circuit_state: rt.circuit.as_ref().map(|c| c.state().as_str()),
                        recovery_step: *rt.recovery_step.lock().expect("recovery step lock poisoned"),
                    })
                    .collect();
                ProxyStatus { name: name.clone(), targets }
            })
            .collect()
    }

    // ── shutdown ─────────────────────────────────────────────────────────

    /// Tears everything down in the reverse of its build-up order: stats
    /// consumer first, then every proxy's background tasks and target
    /// runtimes, then every attached interface (most-recently-attached
    /// first), then the event listener.
    pub async fn shutdown(&self) -> Result<()> {
        let mut registry = self.registry.lock().await;

        if let Some(task) = registry.stats_task.take() {
            task.abort();
        }

        for (_, state_arc) in registry.proxies.drain() {
            let mut state = state_arc.lock().expect("proxy state lock poisoned");
            for task in state.dns_tasks.drain(..) {
                task.abort();
            }
            state.targets.clear();
        }

        for iface in registry.attach_order.drain(..).rev() {
            registry.loaders.remove(&iface);
        }

        self.event_listener.abort();
        info!("orchestrator shut down");
        Ok(())
    }
}

fn parse_cidr(text: &str) -> Result<Cidr> {
    let net: ipnet::IpNet = text
        .parse()
        .map_err(|e| ControlError::InvalidConfig(format!("invalid CIDR '{text}': {e}")))?;
    Ok(Cidr::new(addr_from_ip(net.network()), net.prefix_len()))
}

fn cidr_matches(cidr: &Cidr, text: &str) -> bool {
    parse_cidr(text).map(|parsed| parsed == *cidr).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpm_prefix_len_offsets_ipv4() {
        let cidr = Cidr::from_ip("10.0.0.0".parse().unwrap(), 8);
        assert_eq!(lpm_prefix_len(&cidr), 104);
    }

    #[test]
    fn lpm_prefix_len_is_native_for_ipv6() {
        let cidr = Cidr::from_ip("2001:db8::".parse().unwrap(), 32);
        assert_eq!(lpm_prefix_len(&cidr), 32);
    }

    #[test]
    fn redistribute_equally_across_two_hosts() {
        let weights = dns::redistribute_weights(100, 2);
        assert_eq!(weights, vec![50, 50]);
    }
}
