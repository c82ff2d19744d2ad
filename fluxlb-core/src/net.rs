//! `std::net` conversions for the kernel-visible [`Addr`] type.
//!
//! These conversions live here, not in `fluxlb-ebpf-common`, because that
//! crate is `no_std` and cannot depend on `std::net`. Every userspace
//! boundary — config loading, the orchestrator's runtime API, tests —
//! crosses through this module rather than constructing `Addr` by hand.

use crate::error::{CoreError, Result};
use fluxlb_ebpf_common::Addr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn addr_from_ip(ip: IpAddr) -> Addr {
    match ip {
        IpAddr::V4(v4) => Addr::from_v4_octets(v4.octets()),
        IpAddr::V6(v6) => Addr::from_v6_octets(v6.octets()),
    }
}

pub fn addr_to_ip(addr: &Addr, is_v6: bool) -> IpAddr {
    if is_v6 {
        IpAddr::V6(Ipv6Addr::from(addr.0))
    } else {
        let octets = addr.v4_octets().unwrap_or([0, 0, 0, 0]);
        IpAddr::V4(Ipv4Addr::from(octets))
    }
}

/// A CIDR block: an [`Addr`] plus a prefix length, interpreted against the
/// address's own family (IPv4 prefixes are 0..=32, IPv6 prefixes 0..=128).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    pub addr: Addr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: Addr, prefix_len: u8) -> Self {
        Cidr { addr, prefix_len }
    }

    pub fn from_ip(ip: IpAddr, prefix_len: u8) -> Self {
        Cidr::new(addr_from_ip(ip), prefix_len)
    }

    /// `true` if `candidate` falls within this block. Per the mixed
    /// IPv4-mapped-IPv6 non-goal, a v4 candidate never matches a v6 block
    /// and vice versa — callers that need this should reject the
    /// configuration instead of silently comparing across families.
    pub fn contains(&self, candidate: &Addr) -> Result<bool> {
        let is_v4 = self.addr.is_v4_mapped();
        if is_v4 != candidate.is_v4_mapped() {
            return Err(CoreError::MixedAddressFamily);
        }
        let (start, bits) = if is_v4 { (12usize, 32u8) } else { (0usize, 128u8) };
        let prefix_len = self.prefix_len.min(bits);
        Ok(matching_prefix_bits(
            &self.addr.0[start..],
            &candidate.0[start..],
            prefix_len,
        ))
    }
}

fn matching_prefix_bits(a: &[u8], b: &[u8], prefix_len: u8) -> bool {
    let full_bytes = (prefix_len / 8) as usize;
    let remaining_bits = prefix_len % 8;

    if a[..full_bytes] != b[..full_bytes] {
        return false;
    }
    if remaining_bits == 0 {
        return true;
    }
    let mask = !(0xFFu8 >> remaining_bits);
    a[full_bytes] & mask == b[full_bytes] & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_prefix_match() {
        let block = Cidr::from_ip("10.0.0.0".parse().unwrap(), 8);
        let inside = addr_from_ip("10.1.2.3".parse().unwrap());
        let outside = addr_from_ip("11.0.0.1".parse().unwrap());
        assert!(block.contains(&inside).unwrap());
        assert!(!block.contains(&outside).unwrap());
    }

    #[test]
    fn v4_prefix_exact_bit_boundary() {
        let block = Cidr::from_ip("192.168.1.0".parse().unwrap(), 24);
        let inside = addr_from_ip("192.168.1.255".parse().unwrap());
        let outside = addr_from_ip("192.168.2.0".parse().unwrap());
        assert!(block.contains(&inside).unwrap());
        assert!(!block.contains(&outside).unwrap());
    }

    #[test]
    fn mixed_family_is_an_error() {
        let block = Cidr::from_ip("10.0.0.0".parse().unwrap(), 8);
        let v6 = addr_from_ip("::1".parse().unwrap());
        assert_eq!(block.contains(&v6), Err(CoreError::MixedAddressFamily));
    }

    #[test]
    fn v6_prefix_match() {
        let block = Cidr::from_ip("2001:db8::".parse().unwrap(), 32);
        let inside = addr_from_ip("2001:db8::1".parse().unwrap());
        let outside = addr_from_ip("2001:db9::1".parse().unwrap());
        assert!(block.contains(&inside).unwrap());
        assert!(!block.contains(&outside).unwrap());
    }
}
