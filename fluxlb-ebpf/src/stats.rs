//! Async consumer for the kernel's `stats_ringbuf` map — the only channel
//! the XDP ingress program uses to tell userspace about a newly admitted
//! connection (§4.3 step 9). `fluxlb-control`'s stats consumer (C6) drains
//! this alongside the reaper's `CONN_CLOSED` synthesis.

use std::os::fd::AsRawFd;

use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;

use fluxlb_ebpf_common::stats::StatEvent;

use crate::error::{EbpfError, Result};

pub struct StatsRingConsumer {
    poll: AsyncFd<RingBuf<MapData>>,
}

impl StatsRingConsumer {
    pub(crate) fn new(ring_buf: RingBuf<MapData>) -> Result<Self> {
        let poll = AsyncFd::new(ring_buf).map_err(EbpfError::RingBufPoll)?;
        Ok(Self { poll })
    }

    /// Waits for at least one event, then drains everything currently
    /// queued. Never blocks indefinitely holding the ring buffer: items read
    /// in a batch are owned copies, so the caller can process them without
    /// holding the ring buffer borrowed.
    pub async fn recv_batch(&mut self) -> std::io::Result<Vec<StatEvent>> {
        let mut guard = self.poll.readable_mut().await?;
        let ring_buf = guard.get_inner_mut();
        let mut events = Vec::new();
        while let Some(item) = ring_buf.next() {
            if item.len() == core::mem::size_of::<StatEvent>() {
                let mut ev = StatEvent::default();
                // SAFETY: StatEvent is `#[repr(C)]`, `Copy`, all bit
                // patterns valid, and `item` is exactly its byte size.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        item.as_ptr(),
                        &mut ev as *mut StatEvent as *mut u8,
                        item.len(),
                    );
                }
                events.push(ev);
            }
        }
        guard.clear_ready();
        Ok(events)
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.poll.get_ref().as_raw_fd()
    }
}
