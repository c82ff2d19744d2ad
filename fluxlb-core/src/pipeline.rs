//! Software-reference packet pipeline: a `std`, `&[u8]`-based twin of the
//! kernel ingress/egress/injector logic. It is never loaded into the kernel
//! — it exists so the literal end-to-end scenarios in the testable
//! properties can run inside a normal test harness, and so the incremental
//! checksum path can be checked against a full recompute.
//!
//! Every byte offset and struct here mirrors `fluxlb_ebpf_common::headers`;
//! this module only adds ownership (`Vec<u8>`) and the rewrite/selection
//! logic that the kernel programs express with raw pointers instead.

use crate::error::{CoreError, Result};
use fluxlb_ebpf_common::checksum;
use fluxlb_ebpf_common::conntrack::{conn_state, proxy_flags, ConntrackValue};
use fluxlb_ebpf_common::headers::{EthHdr, Ipv4Hdr, TcpHdr, ETH_P_IP, IP_MF, IP_OFFSET_MASK};
use fluxlb_ebpf_common::proxy_header;
use fluxlb_ebpf_common::Addr;

/// A parsed view into an owned IPv4+TCP packet buffer. Offsets only; the
/// buffer itself is mutated in place by the rewrite functions below, the
/// same way the kernel program rewrites packet memory in place.
pub struct Ipv4TcpView {
    pub eth_offset: usize,
    pub ip_offset: usize,
    pub ip_hdr_len: usize,
    pub tcp_offset: usize,
    pub tcp_hdr_len: usize,
}

/// Parses an Ethernet+IPv4+TCP packet, rejecting anything the ingress
/// program would also reject (non-IPv4, fragmented, non-TCP).
pub fn parse_ipv4_tcp(buf: &[u8]) -> Result<Ipv4TcpView> {
    let eth_offset = 0;
    require_len(buf, eth_offset + core::mem::size_of::<EthHdr>())?;
    let eth_proto = u16::from_ne_bytes([
        buf[eth_offset + 12],
        buf[eth_offset + 13],
    ]);
    if eth_proto != ETH_P_IP {
        return Err(CoreError::UnsupportedEtherType(u16::from_be(eth_proto)));
    }

    let ip_offset = eth_offset + core::mem::size_of::<EthHdr>();
    require_len(buf, ip_offset + core::mem::size_of::<Ipv4Hdr>())?;
    let ip = read_ipv4(buf, ip_offset);
    let ip_hdr_len = (ip.ihl() as usize) * 4;
    if ip_hdr_len < core::mem::size_of::<Ipv4Hdr>() {
        return Err(CoreError::Truncated {
            need: core::mem::size_of::<Ipv4Hdr>(),
            have: ip_hdr_len,
        });
    }
    if ip.frag_off & (IP_MF | IP_OFFSET_MASK) != 0 {
        return Err(CoreError::Fragmented);
    }
    if ip.protocol != fluxlb_ebpf_common::proto::TCP {
        return Err(CoreError::UnsupportedProtocol(ip.protocol));
    }

    let tcp_offset = ip_offset + ip_hdr_len;
    require_len(buf, tcp_offset + core::mem::size_of::<TcpHdr>())?;
    let tcp = read_tcp(buf, tcp_offset);
    let tcp_hdr_len = (tcp.doff() as usize) * 4;
    if tcp_hdr_len < core::mem::size_of::<TcpHdr>() {
        return Err(CoreError::Truncated {
            need: core::mem::size_of::<TcpHdr>(),
            have: tcp_hdr_len,
        });
    }
    require_len(buf, tcp_offset + tcp_hdr_len)?;

    Ok(Ipv4TcpView {
        eth_offset,
        ip_offset,
        ip_hdr_len,
        tcp_offset,
        tcp_hdr_len,
    })
}

fn require_len(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        Err(CoreError::Truncated {
            need,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn read_ipv4(buf: &[u8], off: usize) -> Ipv4Hdr {
    Ipv4Hdr {
        version_ihl: buf[off],
        tos: buf[off + 1],
        tot_len: u16::from_ne_bytes([buf[off + 2], buf[off + 3]]),
        id: u16::from_ne_bytes([buf[off + 4], buf[off + 5]]),
        frag_off: u16::from_ne_bytes([buf[off + 6], buf[off + 7]]),
        ttl: buf[off + 8],
        protocol: buf[off + 9],
        check: u16::from_ne_bytes([buf[off + 10], buf[off + 11]]),
        saddr: u32::from_ne_bytes([buf[off + 12], buf[off + 13], buf[off + 14], buf[off + 15]]),
        daddr: u32::from_ne_bytes([buf[off + 16], buf[off + 17], buf[off + 18], buf[off + 19]]),
    }
}

fn read_tcp(buf: &[u8], off: usize) -> TcpHdr {
    TcpHdr {
        source: u16::from_ne_bytes([buf[off], buf[off + 1]]),
        dest: u16::from_ne_bytes([buf[off + 2], buf[off + 3]]),
        seq: u32::from_ne_bytes([buf[off + 4], buf[off + 5], buf[off + 6], buf[off + 7]]),
        ack_seq: u32::from_ne_bytes([buf[off + 8], buf[off + 9], buf[off + 10], buf[off + 11]]),
        offset_flags: u16::from_ne_bytes([buf[off + 12], buf[off + 13]]),
        window: u16::from_ne_bytes([buf[off + 14], buf[off + 15]]),
        check: u16::from_ne_bytes([buf[off + 16], buf[off + 17]]),
        urg_ptr: u16::from_ne_bytes([buf[off + 18], buf[off + 19]]),
    }
}

fn ipv4_checksum_at(buf: &[u8], ip_offset: usize) -> u16 {
    u16::from_be_bytes([buf[ip_offset + 10], buf[ip_offset + 11]])
}

fn set_ipv4_checksum(buf: &mut [u8], ip_offset: usize, csum: u16) {
    buf[ip_offset + 10..ip_offset + 12].copy_from_slice(&csum.to_be_bytes());
}

fn ipv4_daddr(buf: &[u8], ip_offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[ip_offset + 16],
        buf[ip_offset + 17],
        buf[ip_offset + 18],
        buf[ip_offset + 19],
    ])
}

fn set_ipv4_daddr(buf: &mut [u8], ip_offset: usize, addr: u32) {
    buf[ip_offset + 16..ip_offset + 20].copy_from_slice(&addr.to_be_bytes());
}

fn ipv4_saddr(buf: &[u8], ip_offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[ip_offset + 12],
        buf[ip_offset + 13],
        buf[ip_offset + 14],
        buf[ip_offset + 15],
    ])
}

fn set_ipv4_saddr(buf: &mut [u8], ip_offset: usize, addr: u32) {
    buf[ip_offset + 12..ip_offset + 16].copy_from_slice(&addr.to_be_bytes());
}

fn tcp_checksum_at(buf: &[u8], tcp_offset: usize) -> u16 {
    u16::from_be_bytes([buf[tcp_offset + 16], buf[tcp_offset + 17]])
}

fn set_tcp_checksum(buf: &mut [u8], tcp_offset: usize, csum: u16) {
    buf[tcp_offset + 16..tcp_offset + 18].copy_from_slice(&csum.to_be_bytes());
}

fn tcp_port_at(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn set_tcp_port_at(buf: &mut [u8], off: usize, port: u16) {
    buf[off..off + 2].copy_from_slice(&port.to_be_bytes());
}

/// Rewrites destination IP and port (DNAT) in place, fixing up both the
/// IPv4 and TCP checksums incrementally. Mirrors the ingress program's
/// rewrite-and-forward path.
pub fn rewrite_destination(buf: &mut [u8], view: &Ipv4TcpView, new_daddr: u32, new_dport: u16) {
    let old_daddr = ipv4_daddr(buf, view.ip_offset);
    let old_ip_csum = ipv4_checksum_at(buf, view.ip_offset);
    let new_ip_csum = checksum::replace_u32(old_ip_csum, old_daddr, new_daddr);
    set_ipv4_daddr(buf, view.ip_offset, new_daddr);
    set_ipv4_checksum(buf, view.ip_offset, new_ip_csum);

    let dport_offset = view.tcp_offset + 2;
    let old_dport = tcp_port_at(buf, dport_offset);
    let old_tcp_csum = tcp_checksum_at(buf, view.tcp_offset);
    let mut new_tcp_csum = checksum::replace_u32(old_tcp_csum, old_daddr, new_daddr);
    new_tcp_csum = checksum::replace_u16(new_tcp_csum, old_dport, new_dport);
    set_tcp_port_at(buf, dport_offset, new_dport);
    set_tcp_checksum(buf, view.tcp_offset, new_tcp_csum);
}

/// Rewrites source IP and port (SNAT) in place on the reverse path. Mirrors
/// the egress program's rewrite.
pub fn rewrite_source(buf: &mut [u8], view: &Ipv4TcpView, new_saddr: u32, new_sport: u16) {
    let old_saddr = ipv4_saddr(buf, view.ip_offset);
    let old_ip_csum = ipv4_checksum_at(buf, view.ip_offset);
    let new_ip_csum = checksum::replace_u32(old_ip_csum, old_saddr, new_saddr);
    set_ipv4_saddr(buf, view.ip_offset, new_saddr);
    set_ipv4_checksum(buf, view.ip_offset, new_ip_csum);

    let sport_offset = view.tcp_offset;
    let old_sport = tcp_port_at(buf, sport_offset);
    let old_tcp_csum = tcp_checksum_at(buf, view.tcp_offset);
    let mut new_tcp_csum = checksum::replace_u32(old_tcp_csum, old_saddr, new_saddr);
    new_tcp_csum = checksum::replace_u16(new_tcp_csum, old_sport, new_sport);
    set_tcp_port_at(buf, sport_offset, new_sport);
    set_tcp_checksum(buf, view.tcp_offset, new_tcp_csum);
}

/// Builds a PROXY-protocol-v2 header for the given client/destination
/// addresses (both IPv4), matching the byte layout in
/// `fluxlb_ebpf_common::proxy_header`.
pub fn build_proxy_v2_header_v4(
    client_addr: Addr,
    client_port: u16,
    dst_addr: Addr,
    dst_port: u16,
) -> Result<[u8; proxy_header::IPV4_HEADER_LEN]> {
    let client = client_addr.v4_octets().ok_or(CoreError::MixedAddressFamily)?;
    let dst = dst_addr.v4_octets().ok_or(CoreError::MixedAddressFamily)?;

    let mut out = [0u8; proxy_header::IPV4_HEADER_LEN];
    out[..12].copy_from_slice(&proxy_header::SIGNATURE);
    out[12] = proxy_header::VERSION_COMMAND_PROXY;
    out[13] = proxy_header::AF_INET | proxy_header::TRANSPORT_STREAM;
    out[14..16].copy_from_slice(&proxy_header::IPV4_ADDR_LEN.to_be_bytes());
    out[16..20].copy_from_slice(&client);
    out[20..24].copy_from_slice(&dst);
    out[24..26].copy_from_slice(&client_port.to_be_bytes());
    out[26..28].copy_from_slice(&dst_port.to_be_bytes());
    Ok(out)
}

/// Inserts a PROXY-protocol-v2 header immediately before the TCP payload of
/// `buf`, shifting the payload and growing the packet by the header's
/// length. Returns the number of bytes inserted (the amount `seq_offset`
/// must record on the conntrack entry so future ACKs are adjusted).
///
/// Only valid before any real payload byte has been sent on the connection
/// — callers are responsible for checking
/// `proxy_flags::HEADER_INJECTED` first.
pub fn inject_proxy_header(buf: &mut Vec<u8>, view: &Ipv4TcpView, header: &[u8]) -> usize {
    let insert_at = view.tcp_offset + view.tcp_hdr_len;
    buf.splice(insert_at..insert_at, header.iter().copied());

    let new_tot_len = (buf.len() - view.ip_offset) as u16;
    buf[view.ip_offset + 2..view.ip_offset + 4].copy_from_slice(&new_tot_len.to_be_bytes());

    header.len()
}

/// `true` if it is still safe to inject a PROXY header on this connection:
/// not yet injected, and the handshake has completed (§4.5: injection
/// happens on the first ESTABLISHED-state packet carrying a payload).
pub fn can_inject_proxy_header(entry: &ConntrackValue) -> bool {
    entry.proxy_flags & proxy_flags::HEADER_INJECTED == 0
        && entry.conn_state == conn_state::ESTABLISHED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_syn_packet() -> Vec<u8> {
        let mut buf = vec![0u8; 14 + 20 + 20];
        // ethertype = IPv4
        buf[12] = 0x08;
        buf[13] = 0x00;
        let ip_off = 14;
        buf[ip_off] = 0x45; // version 4, ihl 5
        buf[ip_off + 9] = 6; // TCP
        buf[ip_off + 12..ip_off + 16].copy_from_slice(&[10, 0, 0, 1]);
        buf[ip_off + 16..ip_off + 20].copy_from_slice(&[10, 0, 0, 100]);
        let tcp_off = ip_off + 20;
        set_tcp_port_at(&mut buf, tcp_off, 33000);
        set_tcp_port_at(&mut buf, tcp_off + 2, 443);
        buf[tcp_off + 12] = 5 << 4; // doff = 5
        buf
    }

    #[test]
    fn parses_minimal_ipv4_tcp_packet() {
        let buf = sample_syn_packet();
        let view = parse_ipv4_tcp(&buf).unwrap();
        assert_eq!(view.ip_hdr_len, 20);
        assert_eq!(view.tcp_hdr_len, 20);
    }

    #[test]
    fn rejects_fragmented_packets() {
        let mut buf = sample_syn_packet();
        buf[14 + 6] = 0x20; // MF bit set
        assert_eq!(parse_ipv4_tcp(&buf), Err(CoreError::Fragmented));
    }

    #[test]
    fn dnat_rewrite_checksum_matches_full_recompute() {
        let mut buf = sample_syn_packet();
        let view = parse_ipv4_tcp(&buf).unwrap();

        // establish a valid baseline IPv4 checksum before rewriting
        let baseline = checksum::rfc1071(&buf[view.ip_offset..view.ip_offset + view.ip_hdr_len]);
        set_ipv4_checksum(&mut buf, view.ip_offset, baseline);

        let mut rewritten = buf.clone();
        rewrite_destination(&mut rewritten, &view, u32::from_be_bytes([10, 0, 1, 5]), 8443);

        // recompute the IPv4 header checksum from scratch and confirm it
        // matches what the incremental path produced
        let mut scratch = rewritten.clone();
        scratch[view.ip_offset + 10] = 0;
        scratch[view.ip_offset + 11] = 0;
        let full = checksum::rfc1071(&scratch[view.ip_offset..view.ip_offset + view.ip_hdr_len]);
        assert_eq!(full, ipv4_checksum_at(&rewritten, view.ip_offset));
    }

    #[test]
    fn proxy_header_injection_grows_packet_and_updates_tot_len() {
        let buf = sample_syn_packet();
        let view = parse_ipv4_tcp(&buf).unwrap();
        let header = build_proxy_v2_header_v4(
            Addr::from_v4_octets([203, 0, 113, 9]),
            44000,
            Addr::from_v4_octets([10, 0, 0, 100]),
            443,
        )
        .unwrap();

        let mut mutated = buf.clone();
        let inserted = inject_proxy_header(&mut mutated, &view, &header);

        assert_eq!(inserted, proxy_header::IPV4_HEADER_LEN);
        assert_eq!(mutated.len(), buf.len() + proxy_header::IPV4_HEADER_LEN);
        let tot_len = u16::from_be_bytes([
            mutated[view.ip_offset + 2],
            mutated[view.ip_offset + 3],
        ]) as usize;
        assert_eq!(tot_len, mutated.len() - view.ip_offset);
    }
}
