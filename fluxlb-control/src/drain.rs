//! Drain coordinator (C10, §4.10): marks a target weight-0 then polls
//! conntrack until its connection count reaches zero, a timeout elapses, or
//! the drain is cancelled. Callbacks fire exactly once (§5 ordering
//! guarantee).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::collab::DrainOutcome;

/// Counts live connections for a given target. The orchestrator supplies
/// this by scanning `fluxlb_ebpf::FluxMaps::conntrack_entries()` and
/// filtering on the target's (ip, port) — kept as a trait so drain logic is
/// independently testable against a fake counter.
pub trait ConnectionCounter: Send + Sync {
    fn count(&self, target_ip: fluxlb_ebpf_common::Addr, target_port: u16) -> usize;
}

/// Handle returned by [`start_drain`]; `cancel()` stops polling without
/// invoking the completion callback again (the callback has already fired
/// with `Cancelled` if called after completion it is a no-op).
pub struct DrainHandle {
    cancel: Arc<Notify>,
}

impl DrainHandle {
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

/// Starts draining `target` (caller is responsible for having already
/// pushed an effective weight of 0 via the weight computer before calling
/// this — §4.10 says "sets weight=0, then polls"). Spawns a task that polls
/// every `check_interval` and invokes `on_complete` exactly once.
pub fn start_drain<C, F>(
    target_ip: fluxlb_ebpf_common::Addr,
    target_port: u16,
    timeout: Duration,
    check_interval: Duration,
    counter: Arc<C>,
    on_complete: F,
) -> DrainHandle
where
    C: ConnectionCounter + 'static,
    F: FnOnce(DrainOutcome) + Send + 'static,
{
    let cancel = Arc::new(Notify::new());
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = cancel_clone.notified() => {
                    debug!(target_port, "drain cancelled");
                    on_complete(DrainOutcome::Cancelled);
                    return;
                }
                _ = ticker.tick() => {
                    if counter.count(target_ip, target_port) == 0 {
                        info!(target_port, "drain completed");
                        on_complete(DrainOutcome::Completed);
                        return;
                    }
                    if Instant::now() >= deadline {
                        info!(target_port, "drain timed out");
                        on_complete(DrainOutcome::Timeout);
                        return;
                    }
                }
            }
        }
    });

    DrainHandle { cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedCounter(AtomicUsize);
    impl ConnectionCounter for FixedCounter {
        fn count(&self, _ip: fluxlb_ebpf_common::Addr, _port: u16) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn completes_when_count_reaches_zero() {
        let counter = Arc::new(FixedCounter(AtomicUsize::new(0)));
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = outcome.clone();
        let _handle = start_drain(
            fluxlb_ebpf_common::Addr::from_v4_octets([10, 0, 0, 1]),
            80,
            Duration::from_millis(200),
            Duration::from_millis(10),
            counter,
            move |o| *outcome_clone.lock().unwrap() = Some(o),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*outcome.lock().unwrap(), Some(DrainOutcome::Completed));
    }

    #[tokio::test]
    async fn times_out_when_connections_never_drain() {
        let counter = Arc::new(FixedCounter(AtomicUsize::new(3)));
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = outcome.clone();
        let _handle = start_drain(
            fluxlb_ebpf_common::Addr::from_v4_octets([10, 0, 0, 1]),
            80,
            Duration::from_millis(30),
            Duration::from_millis(10),
            counter,
            move |o| *outcome_clone.lock().unwrap() = Some(o),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*outcome.lock().unwrap(), Some(DrainOutcome::Timeout));
    }
}
