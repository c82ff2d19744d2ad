//! Literal end-to-end scenarios against the software-reference packet
//! pipeline and weight math — the parts of the testable-properties scenarios
//! that do not require a live kernel program or control-plane task scheduler
//! (those are covered by `fluxlb-control`'s own test suites for drain and
//! circuit breaking).

use fluxlb_core::pipeline::{
    build_proxy_v2_header_v4, can_inject_proxy_header, inject_proxy_header, parse_ipv4_tcp,
    rewrite_destination, rewrite_source,
};
use fluxlb_core::weight::{build_target, cumulative_weights, select_sticky, select_weighted};
use fluxlb_ebpf_common::checksum;
use fluxlb_ebpf_common::conntrack::{conn_state, proxy_flags, ConntrackValue};
use fluxlb_ebpf_common::lpm::TargetGroup;
use fluxlb_ebpf_common::Addr;
use rand::Rng;

fn ipv4_tcp_packet(
    src_ip: [u8; 4],
    src_port: u16,
    dst_ip: [u8; 4],
    dst_port: u16,
) -> Vec<u8> {
    let mut buf = vec![0u8; 14 + 20 + 20];
    buf[12] = 0x08;
    buf[13] = 0x00;
    let ip_off = 14;
    buf[ip_off] = 0x45;
    buf[ip_off + 9] = 6; // TCP
    buf[ip_off + 12..ip_off + 16].copy_from_slice(&src_ip);
    buf[ip_off + 16..ip_off + 20].copy_from_slice(&dst_ip);
    let tcp_off = ip_off + 20;
    buf[tcp_off..tcp_off + 2].copy_from_slice(&src_port.to_be_bytes());
    buf[tcp_off + 2..tcp_off + 4].copy_from_slice(&dst_port.to_be_bytes());
    buf[tcp_off + 12] = 5 << 4; // doff = 5, no options
    let ip_csum = checksum::rfc1071(&buf[ip_off..ip_off + 20]);
    buf[ip_off + 10..ip_off + 12].copy_from_slice(&ip_csum.to_be_bytes());
    buf
}

fn ipv4_daddr(buf: &[u8]) -> [u8; 4] {
    buf[14 + 16..14 + 20].try_into().unwrap()
}

fn ipv4_saddr(buf: &[u8]) -> [u8; 4] {
    buf[14 + 12..14 + 16].try_into().unwrap()
}

fn tcp_dport(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[34 + 2], buf[34 + 3]])
}

fn tcp_sport(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[34], buf[34 + 1]])
}

/// Scenario 1 (§8): single target, IPv4. Listen `10.0.0.100:80`, target
/// `10.0.0.1:8080`. A SYN from `192.168.1.10:54321` to the VIP is DNATed to
/// the backend; the reply is SNATed back to the VIP's address and port.
#[test]
fn scenario_1_single_target_dnat_and_snat_roundtrip() {
    let vip = [10, 0, 0, 100];
    let vip_port = 80u16;
    let backend = [10, 0, 0, 1];
    let backend_port = 8080u16;
    let client = [192, 168, 1, 10];
    let client_port = 54321u16;

    let mut request = ipv4_tcp_packet(client, client_port, vip, vip_port);
    let view = parse_ipv4_tcp(&request).unwrap();
    rewrite_destination(
        &mut request,
        &view,
        u32::from_be_bytes(backend),
        backend_port,
    );

    assert_eq!(ipv4_daddr(&request), backend);
    assert_eq!(tcp_dport(&request), backend_port);

    // the conntrack entry installed by ingress keys on the original
    // (unmodified) forward 5-tuple and remembers the pre-DNAT destination
    // as `orig_dst` so the egress path can SNAT the reply back to it.
    let conntrack_orig_dst = Addr::from_v4_octets(vip);
    let conntrack_orig_dst_port = vip_port;

    // backend replies to the client; egress swaps source back to the VIP.
    let mut reply = ipv4_tcp_packet(backend, backend_port, client, client_port);
    let reply_view = parse_ipv4_tcp(&reply).unwrap();
    rewrite_source(
        &mut reply,
        &reply_view,
        u32::from_be_bytes(conntrack_orig_dst.v4_octets().unwrap()),
        conntrack_orig_dst_port,
    );

    assert_eq!(ipv4_saddr(&reply), vip);
    assert_eq!(tcp_sport(&reply), vip_port);
    assert_eq!(tcp_dport(&reply), client_port);
}

/// Scenario 2 (§8): weighted, two targets (A weight 70, B weight 30),
/// weighted-random. Over 10,000 synthetic fresh 5-tuples, A is chosen
/// 7000±300, B 3000±300.
#[test]
fn scenario_2_weighted_distribution_converges_to_configured_ratio() {
    let cum = cumulative_weights(&[70, 30]).unwrap();
    let mut group = TargetGroup::default();
    group.target_count = 2;
    group.targets[0] = build_target(Addr::from_v4_octets([10, 0, 0, 1]), 80, cum[0]);
    group.targets[1] = build_target(Addr::from_v4_octets([10, 0, 0, 2]), 80, cum[1]);

    let mut rng = rand::thread_rng();
    let mut count_a = 0u32;
    let mut count_b = 0u32;
    for _ in 0..10_000 {
        let draw: u16 = rng.gen_range(0..100);
        match select_weighted(&group, draw) {
            Some(0) => count_a += 1,
            Some(1) => count_b += 1,
            other => panic!("unexpected selection index {other:?}"),
        }
    }

    assert!(
        (6700..=7300).contains(&count_a),
        "A selected {count_a} times, expected 7000±300"
    );
    assert!(
        (2700..=3300).contains(&count_b),
        "B selected {count_b} times, expected 3000±300"
    );
    assert_eq!(count_a + count_b, 10_000);
}

/// Scenario 3 (§8): session stickiness. For source `192.168.1.100`,
/// selector = `((0xC0A80164 * 2654435761) mod 100)`; choose A iff
/// selector < 70. Selection must be identical across 1,000 repeated trials.
#[test]
fn scenario_3_sticky_selection_is_deterministic_for_fixed_source() {
    let cum = cumulative_weights(&[70, 30]).unwrap();
    let mut group = TargetGroup::default();
    group.target_count = 2;
    group.targets[0] = build_target(Addr::from_v4_octets([10, 0, 0, 1]), 80, cum[0]);
    group.targets[1] = build_target(Addr::from_v4_octets([10, 0, 0, 2]), 80, cum[1]);

    let src_ip_low32 = 0xC0A80164u32; // 192.168.1.100
    let selector = src_ip_low32.wrapping_mul(2_654_435_761) % 100;
    let expected = if selector < 70 { 0 } else { 1 };

    let first = select_sticky(&group, src_ip_low32).unwrap();
    assert_eq!(first, expected);

    for _ in 0..1_000 {
        assert_eq!(select_sticky(&group, src_ip_low32).unwrap(), first);
    }
}

/// Scenario 4 (§8): PROXY/IPv4. The first ESTABLISHED-state data packet
/// egresses from the host to the backend with 28 additional header bytes
/// preceding the original payload; total IPv4 length increases by 28, and
/// all checksums remain valid. Forward SEQ of the next packet is increased
/// by 28; reverse ACK is decreased by 28 on egress.
#[test]
fn scenario_4_proxy_v4_header_injection_and_seq_ack_offset() {
    let client = Addr::from_v4_octets([203, 0, 113, 9]);
    let client_port = 44000u16;
    let backend = Addr::from_v4_octets([10, 0, 0, 100]);
    let backend_port = 443u16;

    let mut entry = ConntrackValue {
        orig_dst_ip: backend,
        orig_dst_port: backend_port,
        _pad0: [0; 2],
        nat_dst_ip: backend,
        nat_dst_port: backend_port,
        _pad1: [0; 2],
        last_seen_ns: 0,
        created_ns: 0,
        packets_rev: 0,
        packets_fwd: 0,
        bytes_rev: 0,
        bytes_fwd: 0,
        reserved: [0; 8],
        conn_state: conn_state::ESTABLISHED,
        proxy_flags: proxy_flags::ENABLED,
        _pad2: [0; 2],
        seq_offset: 0,
        orig_client_ip: client,
        orig_client_port: client_port,
        _pad3: [0; 6],
    };
    assert!(can_inject_proxy_header(&entry));

    // a 100-byte payload arrives on the first ESTABLISHED-state packet.
    let mut packet =
        ipv4_tcp_packet(client.v4_octets().unwrap(), client_port, backend.v4_octets().unwrap(), backend_port);
    packet.extend(std::iter::repeat(0xAB).take(100));
    let original_len = packet.len();
    let view = parse_ipv4_tcp(&packet).unwrap();

    let header = build_proxy_v2_header_v4(client, client_port, backend, backend_port).unwrap();
    assert_eq!(header.len(), 28);

    let inserted = inject_proxy_header(&mut packet, &view, &header);
    assert_eq!(inserted, 28);
    assert_eq!(packet.len(), original_len + 28);

    let tot_len = u16::from_be_bytes([packet[view.ip_offset + 2], packet[view.ip_offset + 3]]) as usize;
    assert_eq!(tot_len, packet.len() - view.ip_offset);

    entry.proxy_flags |= proxy_flags::HEADER_INJECTED;
    entry.seq_offset = inserted as u32;
    assert!(!can_inject_proxy_header(&entry));
    assert_eq!(entry.seq_offset, 28);

    // the next forward packet's SEQ is advanced by seq_offset...
    let next_fwd_seq: u32 = 1_000_000;
    let adjusted_fwd_seq = next_fwd_seq.wrapping_add(entry.seq_offset);
    assert_eq!(adjusted_fwd_seq, next_fwd_seq + 28);

    // ...and egress subtracts the same offset from the reverse ACK so the
    // client's own accounting of the byte stream is unaffected.
    let backend_ack: u32 = 2_000_000;
    let adjusted_rev_ack = backend_ack.wrapping_sub(entry.seq_offset);
    assert_eq!(adjusted_rev_ack, backend_ack - 28);
}
