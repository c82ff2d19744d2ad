//! Statistics ring buffer record: the only channel the kernel programs use
//! to talk to userspace, since they cannot log.

use crate::Addr;

/// Discriminant for [`StatEvent::event_type`].
pub mod event_type {
    pub const NEW_CONN: u8 = 0;
    pub const CONN_CLOSED: u8 = 1;
    pub const PERIODIC_STATS: u8 = 2;
}

/// One ring-buffer record. Always the full 5-tuple plus selected backend and
/// counters; `event_type` tells the consumer which fields are meaningful
/// (e.g. `packets`/`bytes` are a delta for `CONN_CLOSED`, a point-in-time
/// snapshot for `PERIODIC_STATS`, and zero for `NEW_CONN`).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct StatEvent {
    pub event_type: u8,
    pub _pad0: [u8; 7],
    pub timestamp_ns: u64,
    pub src_ip: Addr,
    pub dst_ip: Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _pad1: [u8; 1],
    pub backend_ip: Addr,
    pub backend_port: u16,
    pub _pad2: [u8; 6],
    pub packets: u64,
    pub bytes: u64,
}

const _: () = assert!(core::mem::size_of::<StatEvent>() == 88);
const _: () = assert!(core::mem::offset_of!(StatEvent, timestamp_ns) == 8);
const _: () = assert!(core::mem::offset_of!(StatEvent, src_ip) == 16);
const _: () = assert!(core::mem::offset_of!(StatEvent, dst_ip) == 32);
const _: () = assert!(core::mem::offset_of!(StatEvent, src_port) == 48);
const _: () = assert!(core::mem::offset_of!(StatEvent, dst_port) == 50);
const _: () = assert!(core::mem::offset_of!(StatEvent, protocol) == 52);
const _: () = assert!(core::mem::offset_of!(StatEvent, backend_ip) == 54);
const _: () = assert!(core::mem::offset_of!(StatEvent, backend_port) == 70);
const _: () = assert!(core::mem::offset_of!(StatEvent, packets) == 72);
const _: () = assert!(core::mem::offset_of!(StatEvent, bytes) == 80);

#[cfg(feature = "aya")]
#[allow(unsafe_code)]
/// SAFETY: `StatEvent` is `#[repr(C)]`, `Copy`, all bit patterns valid.
unsafe impl aya::Pod for StatEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_byte_exact() {
        assert_eq!(core::mem::size_of::<StatEvent>(), 88);
    }
}
