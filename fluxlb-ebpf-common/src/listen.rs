//! Listener map: which (interface, port, address family) pairs this box
//! load-balances, and each one's default target group.

use crate::lpm::TargetGroup;

/// Key for the listen map. `ifindex` pins the listener to a specific
/// interface (XDP programs attach per-interface) rather than relying on a
/// wildcard, matching the ingress component's per-interface attachment
/// model.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenKey {
    pub ifindex: u32,
    pub port: u16,
    pub af: u8,
    pub _pad: [u8; 1],
}

const _: () = assert!(core::mem::size_of::<ListenKey>() == 8);
const _: () = assert!(core::mem::offset_of!(ListenKey, ifindex) == 0);
const _: () = assert!(core::mem::offset_of!(ListenKey, port) == 4);
const _: () = assert!(core::mem::offset_of!(ListenKey, af) == 6);

/// Value for the listen map: the default target group plus a flag telling
/// the ingress program whether to defer selection to the SNI map when a
/// ClientHello is present.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ListenValue {
    pub group: TargetGroup,
    pub sni_enabled: u8,
    pub _pad: [u8; 1],
}

const _: () = assert!(core::mem::size_of::<ListenValue>() == 170);
const _: () = assert!(core::mem::offset_of!(ListenValue, group) == 0);
const _: () = assert!(core::mem::offset_of!(ListenValue, sni_enabled) == 168);

impl ListenValue {
    #[inline]
    pub fn wants_sni(&self) -> bool {
        self.sni_enabled != 0
    }
}

#[cfg(feature = "aya")]
#[allow(unsafe_code)]
mod pod_impls {
    use super::*;

    /// SAFETY: `ListenKey` is `#[repr(C)]`, `Copy`, all bit patterns valid.
    unsafe impl aya::Pod for ListenKey {}
    /// SAFETY: `ListenValue` is `#[repr(C)]`, `Copy`, all bit patterns valid.
    unsafe impl aya::Pod for ListenValue {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sni_flag_round_trips() {
        let mut v = ListenValue::default();
        assert!(!v.wants_sni());
        v.sni_enabled = 1;
        assert!(v.wants_sni());
    }
}
