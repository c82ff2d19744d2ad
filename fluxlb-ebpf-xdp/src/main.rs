//! XDP ingress program (§4.3): parse, classify, select a target, DNAT, and
//! install a conntrack entry, all before the packet reaches the host network
//! stack.
//!
//! Every map key/value here is defined once in `fluxlb-ebpf-common` and
//! shared byte-for-byte with the userspace loader in `fluxlb-ebpf` and the
//! TC programs in `fluxlb-ebpf-tc`; this program never invents its own
//! layout.
#![no_std]
#![no_main]

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::helpers::{bpf_get_prandom_u32, bpf_ktime_get_ns};
use aya_ebpf::macros::{map, xdp};
use aya_ebpf::maps::lpm_trie::Key as LpmTrieKey;
use aya_ebpf::maps::{Array, HashMap as BpfHashMap, LpmTrie, LruHashMap, RingBuf};
use aya_ebpf::programs::XdpContext;

use fluxlb_ebpf_common::conntrack::{conn_state, proxy_flags, ConntrackKey, ConntrackValue};
use fluxlb_ebpf_common::headers::{
    EthHdr, Ipv4Hdr, Ipv6Hdr, TcpHdr, UdpHdr, ETH_P_IP, ETH_P_IPV6, IP_MF, IP_OFFSET_MASK,
};
use fluxlb_ebpf_common::listen::{ListenKey, ListenValue};
use fluxlb_ebpf_common::lpm::{TargetGroup, MAX_TARGETS};
use fluxlb_ebpf_common::ratelimit::{BackendKey, RateLimitBucket};
use fluxlb_ebpf_common::settings::{slot, SettingsArray, SLOT_COUNT};
use fluxlb_ebpf_common::sni::SniKey;
use fluxlb_ebpf_common::stats::{event_type, StatEvent};
use fluxlb_ebpf_common::{af, proto, Addr};

// ── Maps ─────────────────────────────────────────────────────────────────────
//
// `listen_map`, `lpm_map`, `sni_map`, `settings_map`, `ratelimit_src_map`,
// `ratelimit_backend_map`, and `conntrack_map` are created and populated by
// the control plane (`fluxlb-control`) through the typed wrappers in
// `fluxlb-ebpf`; `conntrack_map` is pinned so the TC programs in
// `fluxlb-ebpf-tc` share the exact same table.

#[map]
#[allow(non_upper_case_globals)]
static listen_map: BpfHashMap<ListenKey, ListenValue> = BpfHashMap::with_max_entries(1024, 0);

#[map]
#[allow(non_upper_case_globals)]
static lpm_map: LpmTrie<[u8; 16], TargetGroup> = LpmTrie::with_max_entries(4096, 0);

#[map]
#[allow(non_upper_case_globals)]
static sni_map: BpfHashMap<SniKey, TargetGroup> = BpfHashMap::with_max_entries(4096, 0);

#[map]
#[allow(non_upper_case_globals)]
static conntrack_map: BpfHashMap<ConntrackKey, ConntrackValue> = BpfHashMap::pinned(65536, 0);

#[map]
#[allow(non_upper_case_globals)]
static settings_map: Array<SettingsArray> = Array::with_max_entries(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static ratelimit_src_map: LruHashMap<Addr, RateLimitBucket> = LruHashMap::with_max_entries(65536, 0);

#[map]
#[allow(non_upper_case_globals)]
static ratelimit_backend_map: BpfHashMap<BackendKey, RateLimitBucket> =
    BpfHashMap::with_max_entries(1024, 0);

#[map]
#[allow(non_upper_case_globals)]
static stats_ringbuf: RingBuf = RingBuf::with_byte_size(1 << 16, 0);

// ── Packet access helper ─────────────────────────────────────────────────────

#[inline(always)]
unsafe fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Option<*mut T> {
    let start = ctx.data();
    let end = ctx.data_end();
    let access_end = start.checked_add(offset)?.checked_add(core::mem::size_of::<T>())?;
    if access_end > end {
        return None;
    }
    Some(start.checked_add(offset)? as *mut T)
}

/// Max IPv6 extension headers walked before giving up (§4.3 step 2 — "up to
/// a fixed bound"). Hop-by-hop, routing, dest-opts, fragment: four is enough
/// headroom for any packet this load balancer is expected to see without an
/// unbounded (verifier-rejected) loop.
const MAX_IPV6_EXT_HEADERS: u32 = 4;

const IPV6_NEXTHDR_HOP_BY_HOP: u8 = 0;
const IPV6_NEXTHDR_ROUTING: u8 = 43;
const IPV6_NEXTHDR_FRAGMENT: u8 = 44;
const IPV6_NEXTHDR_DEST_OPTS: u8 = 60;

struct ParsedPacket {
    ifindex: u32,
    is_v6: bool,
    ip_offset: usize,
    ip_hdr_len: usize,
    l4_offset: usize,
    protocol: u8,
    src: Addr,
    dst: Addr,
    src_port: u16,
    dst_port: u16,
}

#[xdp]
pub fn fluxlb_xdp_ingress(ctx: XdpContext) -> u32 {
    match try_ingress(&ctx) {
        Ok(action) => action,
        Err(()) => xdp_action::XDP_PASS,
    }
}

fn try_ingress(ctx: &XdpContext) -> Result<u32, ()> {
    let pkt = match parse_packet(ctx)? {
        Some(p) => p,
        None => return Ok(xdp_action::XDP_PASS),
    };

    let af_tag = if pkt.is_v6 { af::INET6 } else { af::INET };
    let listen_key = ListenKey {
        ifindex: pkt.ifindex,
        port: pkt.dst_port,
        af: af_tag,
        _pad: [0; 1],
    };
    let listen = match unsafe { listen_map.get(&listen_key) } {
        Some(v) => v,
        None => return Ok(xdp_action::XDP_PASS),
    };

    let fwd_key = ConntrackKey {
        src_ip: pkt.src,
        dst_ip: pkt.dst,
        src_port: pkt.src_port,
        dst_port: pkt.dst_port,
        protocol: pkt.protocol,
        _pad: [0; 3],
    };

    let now = unsafe { bpf_ktime_get_ns() };

    if let Some(existing) = unsafe { conntrack_map.get_ptr_mut(&fwd_key) } {
        let nat_ip = unsafe { (*existing).nat_dst_ip };
        let nat_port = unsafe { (*existing).nat_dst_port };
        unsafe {
            (*existing).last_seen_ns = now;
            (*existing).packets_fwd = (*existing).packets_fwd.wrapping_add(1);
            (*existing).bytes_fwd = (*existing).bytes_fwd.wrapping_add(ctx.data_end().wrapping_sub(ctx.data()) as u64);
        }
        return finish(ctx, &pkt, nat_ip, nat_port);
    }

    if !check_source_rate_limit(&pkt, now) {
        return Ok(xdp_action::XDP_DROP);
    }

    let settings = read_settings();
    let group = select_group(ctx, &pkt, listen, &settings)?;
    let (target_ip, target_port) = select_target(&group, &pkt, &settings).ok_or(())?;

    if !check_backend_rate_limit(target_ip, target_port, now) {
        return Ok(xdp_action::XDP_DROP);
    }

    let new_entry = ConntrackValue {
        orig_dst_ip: pkt.dst,
        orig_dst_port: pkt.dst_port,
        _pad0: [0; 2],
        nat_dst_ip: target_ip,
        nat_dst_port: target_port,
        _pad1: [0; 2],
        last_seen_ns: now,
        created_ns: now,
        packets_rev: 0,
        packets_fwd: 1,
        bytes_rev: 0,
        bytes_fwd: ctx.data_end().wrapping_sub(ctx.data()) as u64,
        reserved: [0; 8],
        conn_state: conn_state::NEW,
        proxy_flags: if group.wants_proxy_protocol() { proxy_flags::ENABLED } else { 0 },
        _pad2: [0; 2],
        seq_offset: 0,
        orig_client_ip: pkt.src,
        orig_client_port: pkt.src_port,
        _pad3: [0; 6],
    };

    // `insert` on a HashMap overwrites unconditionally, which would lose a
    // race against a peer CPU that already installed an entry for the same
    // forward key; re-check under the same lookup-then-insert sequence and
    // prefer whatever is already there (§4.3 step 7).
    let (final_nat_ip, final_nat_port, created) = match unsafe { conntrack_map.get_ptr_mut(&fwd_key) } {
        Some(existing) => (
            unsafe { (*existing).nat_dst_ip },
            unsafe { (*existing).nat_dst_port },
            false,
        ),
        None => {
            if conntrack_map.insert(&fwd_key, &new_entry, 0).is_err() {
                // Map full or another transient failure: fall back to PASS
                // without mutating state (§4.3 failure semantics).
                return Ok(xdp_action::XDP_PASS);
            }
            (target_ip, target_port, true)
        }
    };

    if created && settings[slot::STATS_ENABLED] != 0 {
        emit_new_conn_event(&pkt, now, final_nat_ip, final_nat_port, ctx.data_end().wrapping_sub(ctx.data()) as u64);
    }

    finish(ctx, &pkt, final_nat_ip, final_nat_port)
}

fn finish(ctx: &XdpContext, pkt: &ParsedPacket, nat_ip: Addr, nat_port: u16) -> Result<u32, ()> {
    rewrite_destination(ctx, pkt, nat_ip, nat_port)?;
    Ok(xdp_action::XDP_TX)
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn parse_packet(ctx: &XdpContext) -> Result<Option<ParsedPacket>, ()> {
    let eth = unsafe { ptr_at::<EthHdr>(ctx, 0) }.ok_or(())?;
    let eth_type = unsafe { (*eth).h_proto };
    let eth_len = core::mem::size_of::<EthHdr>();

    if eth_type == ETH_P_IP {
        Ok(parse_ipv4(ctx, eth_len)?)
    } else if eth_type == ETH_P_IPV6 {
        Ok(parse_ipv6(ctx, eth_len)?)
    } else {
        Ok(None)
    }
}

fn parse_ipv4(ctx: &XdpContext, ip_offset: usize) -> Result<Option<ParsedPacket>, ()> {
    let ip = match unsafe { ptr_at::<Ipv4Hdr>(ctx, ip_offset) } {
        Some(p) => p,
        None => return Ok(None),
    };
    let ihl = unsafe { (*ip).ihl() } as usize * 4;
    if ihl != core::mem::size_of::<Ipv4Hdr>() {
        // IHL carrying options: rejected per §4.3 step 2.
        return Ok(None);
    }
    let frag_off = unsafe { (*ip).frag_off };
    if frag_off & (IP_MF | IP_OFFSET_MASK) != 0 {
        return Ok(None);
    }
    let protocol = unsafe { (*ip).protocol };
    if protocol != proto::TCP && protocol != proto::UDP {
        return Ok(None);
    }

    let l4_offset = ip_offset + ihl;
    let (src_port, dst_port) = match read_ports(ctx, l4_offset, protocol == proto::TCP) {
        Some(p) => p,
        None => return Ok(None),
    };

    let src = Addr::from_v4_octets(unsafe { (*ip).saddr }.to_ne_bytes());
    let dst = Addr::from_v4_octets(unsafe { (*ip).daddr }.to_ne_bytes());

    Ok(Some(ParsedPacket {
        ifindex: ctx.ingress_ifindex(),
        is_v6: false,
        ip_offset,
        ip_hdr_len: ihl,
        l4_offset,
        protocol,
        src,
        dst,
        src_port,
        dst_port,
    }))
}

fn parse_ipv6(ctx: &XdpContext, ip_offset: usize) -> Result<Option<ParsedPacket>, ()> {
    let ip = match unsafe { ptr_at::<Ipv6Hdr>(ctx, ip_offset) } {
        Some(p) => p,
        None => return Ok(None),
    };

    let mut next_header = unsafe { (*ip).next_header };
    let mut cursor = ip_offset + core::mem::size_of::<Ipv6Hdr>();
    let mut hops: u32 = 0;

    while hops < MAX_IPV6_EXT_HEADERS {
        match next_header {
            IPV6_NEXTHDR_HOP_BY_HOP | IPV6_NEXTHDR_ROUTING | IPV6_NEXTHDR_DEST_OPTS => {
                let hdr = match unsafe { ptr_at::<[u8; 2]>(ctx, cursor) } {
                    Some(p) => p,
                    None => return Ok(None),
                };
                let this_next = unsafe { (*hdr)[0] };
                let ext_len = (unsafe { (*hdr)[1] } as usize + 1) * 8;
                next_header = this_next;
                cursor += ext_len;
                hops += 1;
            }
            IPV6_NEXTHDR_FRAGMENT => return Ok(None),
            _ => break,
        }
    }
    if hops >= MAX_IPV6_EXT_HEADERS {
        return Ok(None);
    }

    if next_header != proto::TCP && next_header != proto::UDP {
        return Ok(None);
    }

    let (src_port, dst_port) = match read_ports(ctx, cursor, next_header == proto::TCP) {
        Some(p) => p,
        None => return Ok(None),
    };

    let src = Addr::from_v6_octets(unsafe { (*ip).saddr });
    let dst = Addr::from_v6_octets(unsafe { (*ip).daddr });

    Ok(Some(ParsedPacket {
        ifindex: ctx.ingress_ifindex(),
        is_v6: true,
        ip_offset,
        ip_hdr_len: cursor - ip_offset,
        l4_offset: cursor,
        protocol: next_header,
        src,
        dst,
        src_port,
        dst_port,
    }))
}

fn read_ports(ctx: &XdpContext, l4_offset: usize, is_tcp: bool) -> Option<(u16, u16)> {
    if is_tcp {
        let tcp = unsafe { ptr_at::<TcpHdr>(ctx, l4_offset) }?;
        let doff = unsafe { (*tcp).doff() } as usize * 4;
        if doff < core::mem::size_of::<TcpHdr>() {
            return None;
        }
        Some((unsafe { (*tcp).source }, unsafe { (*tcp).dest }))
    } else {
        let udp = unsafe { ptr_at::<UdpHdr>(ctx, l4_offset) }?;
        Some((unsafe { (*udp).source }, unsafe { (*udp).dest }))
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

fn read_settings() -> SettingsArray {
    unsafe { settings_map.get(0) }
        .copied()
        .unwrap_or([0u64; SLOT_COUNT])
}

// ── Rate limiting (§4.3 steps 5 and 6's backend check) ──────────────────────

fn check_source_rate_limit(pkt: &ParsedPacket, now: u64) -> bool {
    let settings = read_settings();
    let rate = settings[slot::SOURCE_RATE_LIMIT];
    if rate == 0 {
        return true;
    }
    let burst = settings[slot::SOURCE_BURST].max(rate);

    if let Some(bucket) = unsafe { ratelimit_src_map.get_ptr_mut(&pkt.src) } {
        return unsafe { (*bucket).try_consume(now, fluxlb_ebpf_common::ratelimit::SCALE) };
    }
    let mut bucket = RateLimitBucket::new(rate as u32, burst as u32, now);
    let admitted = bucket.try_consume(now, fluxlb_ebpf_common::ratelimit::SCALE);
    let _ = ratelimit_src_map.insert(&pkt.src, &bucket, 0);
    admitted
}

fn check_backend_rate_limit(ip: Addr, port: u16, now: u64) -> bool {
    let key = BackendKey { ip, port, _pad: [0; 6] };
    match unsafe { ratelimit_backend_map.get_ptr_mut(&key) } {
        Some(bucket) => unsafe { (*bucket).try_consume(now, fluxlb_ebpf_common::ratelimit::SCALE) },
        // No configured bucket for this backend: unrestricted.
        None => true,
    }
}

// ── Target selection (§4.3 step 6) ──────────────────────────────────────────

fn select_group(
    ctx: &XdpContext,
    pkt: &ParsedPacket,
    listen: &ListenValue,
    _settings: &SettingsArray,
) -> Result<TargetGroup, ()> {
    // (a) LPM lookup against the source address. The trie's data is always
    // the full 16-byte `Addr` encoding (IPv4 zero-extended into the high 12
    // bytes, per `fluxlb_ebpf_common::Addr`); a lookup key's own prefix_len
    // only bounds how many of its bits are meaningful, so it is always 128
    // here — the stored route's prefix_len (96+N for an IPv4 /N, N for a
    // native IPv6 /N) is what actually limits the match.
    let lpm_key = LpmTrieKey::new(128, pkt.src.0);
    if let Some(group) = unsafe { lpm_map.get(&lpm_key) } {
        return Ok(*group);
    }

    // (b) SNI evaluation, TCP only, only if the listener requests it.
    if listen.wants_sni() && pkt.protocol == proto::TCP {
        if let Some(group) = try_sni_lookup(ctx, pkt) {
            return Ok(group);
        }
    }

    // (c) the listener's default group.
    Ok(listen.group)
}

/// Maximum hostname length read out of the SNI extension (§3 SNI key note).
const SNI_MAX_HOSTNAME_LEN: usize = 64;
/// Bound on how many bytes of the ClientHello record this parser will walk;
/// generous enough for a typical ClientHello's session id / cipher suite
/// list / extensions while keeping every loop in this function statically
/// bounded for the verifier.
const CLIENTHELLO_SCAN_LIMIT: usize = 512;

fn try_sni_lookup(ctx: &XdpContext, pkt: &ParsedPacket) -> Option<TargetGroup> {
    let payload_offset = read_tcp_payload_offset(ctx, pkt)?;

    let content_type = unsafe { *ptr_at::<u8>(ctx, payload_offset)? };
    if content_type != 0x16 {
        return None; // not a TLS handshake record
    }
    let handshake_type = unsafe { *ptr_at::<u8>(ctx, payload_offset + 5)? };
    if handshake_type != 0x01 {
        return None; // not a ClientHello
    }

    // Walk past: record header(5) + handshake header(4) + client_version(2)
    // + random(32) + session_id_len(1)+session_id + cipher_suites_len(2)+
    // ciphers + compression_len(1)+methods, to reach the extensions block.
    let mut cursor = payload_offset + 5 + 4 + 2 + 32;

    let session_id_len = unsafe { *ptr_at::<u8>(ctx, cursor)? } as usize;
    cursor += 1 + session_id_len;

    let cipher_suites_len = u16::from_be(unsafe { *ptr_at::<u16>(ctx, cursor)? }) as usize;
    cursor += 2 + cipher_suites_len;

    let compression_len = unsafe { *ptr_at::<u8>(ctx, cursor)? } as usize;
    cursor += 1 + compression_len;

    if cursor - payload_offset > CLIENTHELLO_SCAN_LIMIT {
        return None;
    }

    let extensions_len = u16::from_be(unsafe { *ptr_at::<u16>(ctx, cursor)? }) as usize;
    cursor += 2;
    let extensions_end = cursor + extensions_len;

    let mut i: usize = 0;
    // Bounded loop: at minimum 4 bytes (type+length) per extension, so this
    // cap is never reached by a well-formed extensions block within the
    // overall scan limit.
    while i < 32 {
        if cursor + 4 > extensions_end || cursor - payload_offset > CLIENTHELLO_SCAN_LIMIT {
            break;
        }
        let ext_type = u16::from_be(unsafe { *ptr_at::<u16>(ctx, cursor)? });
        let ext_len = u16::from_be(unsafe { *ptr_at::<u16>(ctx, cursor + 2)? }) as usize;
        let ext_data_off = cursor + 4;

        if ext_type == 0x0000 {
            // server_name extension: list_len(2), then entries of
            // type(1)=0 + len(2) + hostname.
            let name_off = ext_data_off + 2 + 1 + 2;
            let name_len = u16::from_be(unsafe { *ptr_at::<u16>(ctx, ext_data_off + 3)? }) as usize;
            let name_len = name_len.min(SNI_MAX_HOSTNAME_LEN);

            let mut lowered = [0u8; SNI_MAX_HOSTNAME_LEN];
            let mut j = 0usize;
            while j < SNI_MAX_HOSTNAME_LEN {
                if j >= name_len {
                    break;
                }
                let byte = unsafe { *ptr_at::<u8>(ctx, name_off + j)? };
                lowered[j] = byte.to_ascii_lowercase();
                j += 1;
            }
            let key = SniKey::from_lowercased_hostname(&lowered[..name_len]);
            return unsafe { sni_map.get(&key) }.copied();
        }

        cursor = ext_data_off + ext_len;
        i += 1;
    }

    None
}

fn read_tcp_payload_offset(ctx: &XdpContext, pkt: &ParsedPacket) -> Option<usize> {
    let tcp = unsafe { ptr_at::<TcpHdr>(ctx, pkt.l4_offset) }?;
    let doff = unsafe { (*tcp).doff() } as usize * 4;
    let offset = pkt.l4_offset + doff;
    // Bounds-check the first byte of payload so later fixed-width reads in
    // try_sni_lookup fail closed via ptr_at rather than reading garbage.
    unsafe { ptr_at::<u8>(ctx, offset) }?;
    Some(offset)
}

fn select_target(group: &TargetGroup, pkt: &ParsedPacket, settings: &SettingsArray) -> Option<(Addr, u16)> {
    let targets = group.live_targets();
    if targets.is_empty() {
        return None;
    }

    let all_zero = targets.last().map(|t| t.cumulative_weight == 0).unwrap_or(true);
    let total = targets.last()?.cumulative_weight;

    let idx = if all_zero || total == 0 {
        0
    } else if group.is_least_conn() {
        weighted_index(targets, total, unsafe { bpf_get_prandom_u32() } as u16)
    } else if group.session_persistence != 0 {
        let src_low32 = u32::from_be_bytes([pkt.src.0[12], pkt.src.0[13], pkt.src.0[14], pkt.src.0[15]]);
        let bucket = src_low32.wrapping_mul(2_654_435_761) % 100;
        let scaled = ((bucket as u32 * total as u32) / 100) as u16;
        weighted_index(targets, total, scaled)
    } else {
        let draw = (unsafe { bpf_get_prandom_u32() } % 100) as u16;
        let scaled = ((draw as u32 * total as u32) / 100) as u16;
        weighted_index(targets, total, scaled)
    };

    let _ = settings[slot::LB_ALGORITHM]; // informational only on the kernel side
    let t = targets.get(idx.min(MAX_TARGETS - 1))?;
    Some((t.ip, t.port))
}

fn weighted_index(targets: &[fluxlb_ebpf_common::lpm::Target], _total: u16, draw: u16) -> usize {
    for (i, t) in targets.iter().enumerate() {
        if draw < t.cumulative_weight {
            return i;
        }
    }
    targets.len().saturating_sub(1)
}

// ── Rewrite + checksum (§4.3 step 8) ────────────────────────────────────────

fn rewrite_destination(ctx: &XdpContext, pkt: &ParsedPacket, nat_ip: Addr, nat_port: u16) -> Result<(), ()> {
    if !pkt.is_v6 {
        let ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, pkt.ip_offset) }.ok_or(())?;
        let old_daddr = unsafe { (*ip).daddr };
        let new_daddr = u32::from_be_bytes(nat_ip.v4_octets().ok_or(())?);
        let old_csum = unsafe { (*ip).check };
        let new_csum = fluxlb_ebpf_common::checksum::replace_u32(
            u16::from_be(old_csum),
            u32::from_be(old_daddr),
            u32::from_be(new_daddr),
        );
        unsafe {
            (*ip).daddr = new_daddr;
            (*ip).check = new_csum.to_be();
        }

        rewrite_l4_port_and_csum(ctx, pkt, old_daddr, new_daddr, nat_port, false)?;
    } else {
        let ip = unsafe { ptr_at::<Ipv6Hdr>(ctx, pkt.ip_offset) }.ok_or(())?;
        let old_daddr = unsafe { (*ip).daddr };
        let new_daddr = nat_ip.0;
        unsafe { (*ip).daddr = new_daddr };

        rewrite_l4_port_and_csum_v6(ctx, pkt, &old_daddr, &new_daddr, nat_port)?;
    }
    Ok(())
}

fn rewrite_l4_port_and_csum(
    ctx: &XdpContext,
    pkt: &ParsedPacket,
    old_daddr: u32,
    new_daddr: u32,
    new_port: u16,
    is_v6: bool,
) -> Result<(), ()> {
    let _ = is_v6;
    if pkt.protocol == proto::TCP {
        let tcp = unsafe { ptr_at::<TcpHdr>(ctx, pkt.l4_offset) }.ok_or(())?;
        let old_dport = unsafe { (*tcp).dest };
        let old_csum = unsafe { (*tcp).check };
        let mut csum = fluxlb_ebpf_common::checksum::replace_u32(
            u16::from_be(old_csum),
            u32::from_be(old_daddr),
            u32::from_be(new_daddr),
        );
        csum = fluxlb_ebpf_common::checksum::replace_u16(csum, u16::from_be(old_dport), new_port);
        unsafe {
            (*tcp).dest = new_port.to_be();
            (*tcp).check = csum.to_be();
        }
    } else {
        let udp = unsafe { ptr_at::<UdpHdr>(ctx, pkt.l4_offset) }.ok_or(())?;
        let old_dport = unsafe { (*udp).dest };
        let old_csum = unsafe { (*udp).check };
        // §4.3 step 8: a zero UDP/IPv4 checksum means "not in use"; leave it
        // untouched rather than recomputing it.
        if old_csum != 0 {
            let mut csum = fluxlb_ebpf_common::checksum::replace_u32(
                u16::from_be(old_csum),
                u32::from_be(old_daddr),
                u32::from_be(new_daddr),
            );
            csum = fluxlb_ebpf_common::checksum::replace_u16(csum, u16::from_be(old_dport), new_port);
            unsafe { (*udp).check = csum.to_be() };
        }
        unsafe { (*udp).dest = new_port.to_be() };
    }
    Ok(())
}

fn rewrite_l4_port_and_csum_v6(
    ctx: &XdpContext,
    pkt: &ParsedPacket,
    old_daddr: &[u8; 16],
    new_daddr: &[u8; 16],
    new_port: u16,
) -> Result<(), ()> {
    if pkt.protocol == proto::TCP {
        let tcp = unsafe { ptr_at::<TcpHdr>(ctx, pkt.l4_offset) }.ok_or(())?;
        let old_dport = unsafe { (*tcp).dest };
        let old_csum = unsafe { (*tcp).check };
        let mut csum = fluxlb_ebpf_common::checksum::replace_u128(u16::from_be(old_csum), old_daddr, new_daddr);
        csum = fluxlb_ebpf_common::checksum::replace_u16(csum, u16::from_be(old_dport), new_port);
        unsafe {
            (*tcp).dest = new_port.to_be();
            (*tcp).check = csum.to_be();
        }
    } else {
        let udp = unsafe { ptr_at::<UdpHdr>(ctx, pkt.l4_offset) }.ok_or(())?;
        let old_dport = unsafe { (*udp).dest };
        let old_csum = unsafe { (*udp).check };
        // UDP/IPv6 checksum is mandatory (§4.3 step 8): always recompute.
        let mut csum = fluxlb_ebpf_common::checksum::replace_u128(u16::from_be(old_csum), old_daddr, new_daddr);
        csum = fluxlb_ebpf_common::checksum::replace_u16(csum, u16::from_be(old_dport), new_port);
        unsafe {
            (*udp).dest = new_port.to_be();
            (*udp).check = csum.to_be();
        }
    }
    Ok(())
}

// ── Stats emission (§4.3 step 9) ────────────────────────────────────────────

fn emit_new_conn_event(pkt: &ParsedPacket, now: u64, backend_ip: Addr, backend_port: u16, frame_len: u64) {
    if let Some(mut entry) = stats_ringbuf.reserve::<StatEvent>(0) {
        let ev = StatEvent {
            event_type: event_type::NEW_CONN,
            _pad0: [0; 7],
            timestamp_ns: now,
            src_ip: pkt.src,
            dst_ip: pkt.dst,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
            _pad1: [0; 1],
            backend_ip,
            backend_port,
            _pad2: [0; 6],
            packets: 1,
            bytes: frame_len,
        };
        entry.write(ev);
        entry.submit(0);
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
