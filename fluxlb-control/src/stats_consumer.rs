//! Stats ring-buffer consumer (C6, consumer half — the producer half is the
//! kernel program plus `fluxlb_ebpf::StatsRingConsumer`'s async plumbing).
//!
//! Drains ring-buffer events as fast as the reactor wakes us, periodically
//! reaps idle conntrack entries and synthesizes a closing event for each,
//! and fans everything out to the registered [`StatsSink`]/[`AccessLogSink`]
//! collaborators. Runs as one long-lived task per process; a slow sink must
//! not be allowed to block the ring-buffer drain loop, so sinks are invoked
//! synchronously but are expected to be cheap (the default `tracing` sinks
//! are) — a collaborator with real I/O should queue internally rather than
//! block here.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluxlb_ebpf::{FluxMaps, StatsRingConsumer};
use fluxlb_ebpf_common::stats::{event_type, StatEvent};
use fluxlb_ebpf_common::Addr;
use tracing::{trace, warn};

use crate::collab::{AccessLogRecord, AccessLogSink, StatsSink};

/// Widens a wire `Addr` to the std `IpAddr` the access-log collaborator
/// trait deals in; IPv4-mapped addresses render as plain dotted quads.
fn to_ip_addr(addr: Addr) -> IpAddr {
    match addr.v4_octets() {
        Some(octets) => IpAddr::from(octets),
        None => IpAddr::from(addr.0),
    }
}

/// Everything the consumer loop needs each tick; bundled so
/// [`run`]'s signature stays readable.
pub struct StatsConsumerConfig {
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub stats_sinks: Vec<Arc<dyn StatsSink>>,
    pub access_log_sinks: Vec<Arc<dyn AccessLogSink>>,
}

/// Runs forever, draining the ring buffer and periodically reaping idle
/// conntrack entries. Intended to be `tokio::spawn`ed by the orchestrator
/// and aborted on shutdown.
pub async fn run(mut consumer: StatsRingConsumer, maps: Arc<Mutex<FluxMaps>>, config: StatsConsumerConfig) {
    let mut reap_ticker = tokio::time::interval(config.reap_interval);

    loop {
        tokio::select! {
            biased;

            batch = consumer.recv_batch() => {
                match batch {
                    Ok(events) => {
                        for ev in events {
                            dispatch(&ev, &config.stats_sinks);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stats ring buffer read failed");
                    }
                }
            }

            _ = reap_ticker.tick() => {
                reap_and_report(&maps, &config);
            }
        }
    }
}

fn dispatch(ev: &StatEvent, sinks: &[Arc<dyn StatsSink>]) {
    trace!(event_type = ev.event_type, packets = ev.packets, bytes = ev.bytes, "stats event");
    for sink in sinks {
        sink.on_event(*ev);
    }
    match ev.event_type {
        event_type::NEW_CONN | event_type::CONN_CLOSED | event_type::PERIODIC_STATS => {}
        other => warn!(event_type = other, "unrecognized stats event type"),
    }
}

fn reap_and_report(maps: &Arc<Mutex<FluxMaps>>, config: &StatsConsumerConfig) {
    let idle_ns = config.idle_timeout.as_nanos() as u64;
    let now_ns = fluxlb_ebpf::monotonic_now_ns();

    let expired = {
        let mut guard = maps.lock().expect("flux maps lock poisoned");
        match fluxlb_ebpf::reap_idle(&mut guard, now_ns, idle_ns) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "idle conntrack reap failed");
                return;
            }
        }
    };

    for conn in expired {
        let rec = AccessLogRecord {
            src: to_ip_addr(conn.key.src_ip),
            src_port: conn.key.src_port,
            dst: to_ip_addr(conn.key.dst_ip),
            dst_port: conn.key.dst_port,
            backend: to_ip_addr(conn.value.nat_dst_ip),
            backend_port: conn.value.nat_dst_port,
            packets: conn.value.packets_fwd + conn.value.packets_rev,
            bytes: conn.value.bytes_fwd + conn.value.bytes_rev,
            duration_ns: conn.value.last_seen_ns.saturating_sub(conn.value.created_ns),
        };
        for sink in &config.access_log_sinks {
            sink.on_connection_closed(rec.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);
    impl StatsSink for CountingSink {
        fn on_event(&self, _ev: StatEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_forwards_to_every_sink() {
        let a = Arc::new(CountingSink(AtomicUsize::new(0)));
        let b = Arc::new(CountingSink(AtomicUsize::new(0)));
        let sinks: Vec<Arc<dyn StatsSink>> = vec![a.clone(), b.clone()];
        dispatch(&StatEvent::default(), &sinks);
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }
}
