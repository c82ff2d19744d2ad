//! External collaborator trait boundaries (§4.14). These are the seams a
//! Prometheus exporter, an access-log file writer, or an admin HTTP API
//! would attach to; their full bodies are out of scope (§1), so only the
//! narrow contract and a `tracing`-backed default/test implementation live
//! here — matching the teacher's pattern of keeping telemetry collaborators
//! behind a small trait rather than baking a specific backend into the
//! hot path.

use std::net::IpAddr;

use fluxlb_ebpf_common::stats::StatEvent;

/// Receives every decoded ring-buffer event (`new-conn`, `conn-closed`,
/// `periodic-stats`) as C6's consumer drains them.
pub trait StatsSink: Send + Sync {
    fn on_event(&self, ev: StatEvent);
}

/// One finished connection, summarized for an access-log collaborator.
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub backend: IpAddr,
    pub backend_port: u16,
    pub packets: u64,
    pub bytes: u64,
    pub duration_ns: u64,
}

pub trait AccessLogSink: Send + Sync {
    fn on_connection_closed(&self, rec: AccessLogRecord);
}

/// Tagged control-plane events (§9 redesign note: untyped event maps become
/// a shaped variant per kind).
#[derive(Debug, Clone)]
pub enum ControlEvent {
    HealthChanged { target: String, healthy: bool },
    DnsChanged { hostname: String, addrs: Vec<IpAddr> },
    DnsFailed { hostname: String, consecutive_failures: u32 },
    CircuitChanged { target: String, state: &'static str },
    DrainComplete { target: String, outcome: DrainOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    Timeout,
    Cancelled,
}

/// Default/test sink: logs at `debug!`, per §4.0's granularity guidance for
/// per-operation detail.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn on_event(&self, ev: StatEvent) {
        tracing::debug!(
            event_type = ev.event_type,
            packets = ev.packets,
            bytes = ev.bytes,
            "stats event"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLogSink;

impl AccessLogSink for TracingAccessLogSink {
    fn on_connection_closed(&self, rec: AccessLogRecord) {
        tracing::debug!(
            src = %rec.src,
            src_port = rec.src_port,
            backend = %rec.backend,
            backend_port = rec.backend_port,
            packets = rec.packets,
            bytes = rec.bytes,
            duration_ns = rec.duration_ns,
            "connection closed"
        );
    }
}
