//! TC (`sched_cls`) programs: reply-path SNAT (§4.4) and PROXY-protocol-v2
//! injection (§4.5).
//!
//! Two programs live in this one object, attached at different hooks by the
//! userspace loader in `fluxlb-ebpf`:
//! - `fluxlb_tc_egress` — attached at the egress clsact hook. Reverses the
//!   DNAT the XDP ingress program (`fluxlb-ebpf-xdp`) applied, so replies
//!   leave the host looking like they came from the listen VIP.
//! - `fluxlb_tc_ingress_proxy` — attached at the ingress clsact hook,
//!   downstream of XDP (XDP already ran and, on a hit, rewrote the
//!   destination). It tracks the per-connection TCP handshake state and
//!   injects a PROXY-protocol-v2 header ahead of the first payload byte.
//!
//! Both programs share the conntrack map with the XDP program via BPF map
//! pinning: `fluxlb-ebpf`'s loader pins every cross-program map under a
//! common directory and loads this object with the same pin path, so
//! `aya`'s pinning-by-name resolves to the XDP program's already-created
//! map instead of creating a second, disconnected one.
#![no_std]
#![no_main]

use aya_ebpf::bindings::TC_ACT_OK;
use aya_ebpf::helpers::{bpf_ktime_get_ns, bpf_skb_change_tail, bpf_skb_load_bytes, bpf_skb_store_bytes};
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::HashMap as BpfHashMap;
use aya_ebpf::programs::TcContext;

use fluxlb_ebpf_common::conntrack::{conn_state, proxy_flags, ConntrackKey, ConntrackValue};
use fluxlb_ebpf_common::headers::{EthHdr, Ipv4Hdr, TcpHdr, ETH_P_IP};
use fluxlb_ebpf_common::proxy_header;
use fluxlb_ebpf_common::{proto, Addr};

// ── Shared maps ──────────────────────────────────────────────────────────────
//
// Same name and pin path as the map of the same name in fluxlb-ebpf-xdp;
// see the loader for how the pin path is wired up. `pinned()` marks the map
// `PinningType::ByName` in the generated BTF so aya reuses rather than
// recreates it.

#[map]
#[allow(non_upper_case_globals)]
static conntrack_map: BpfHashMap<ConntrackKey, ConntrackValue> = BpfHashMap::pinned(65536, 0);

// ── Packet access helper (mirrors fluxlb-ebpf-xdp's `ptr_at`) ───────────────

#[inline(always)]
unsafe fn ptr_at<T>(ctx: &TcContext, offset: usize) -> Option<*mut T> {
    let start = ctx.data();
    let end = ctx.data_end();
    let access_end = start.checked_add(offset)?.checked_add(core::mem::size_of::<T>())?;
    if access_end > end {
        return None;
    }
    Some(start.checked_add(offset)? as *mut T)
}

struct Parsed {
    ip_offset: usize,
    ip_hdr_len: usize,
    tcp_offset: usize,
    tcp_hdr_len: usize,
}

/// Parses Ethernet+IPv4+TCP exactly as the ingress program does; anything
/// else is handed back to the stack untouched (this crate's non-goals match
/// the ingress program's — no IP options, no fragments, TCP only for the
/// PROXY path; UDP also reaches the egress SNAT path but never the injector).
#[inline(always)]
unsafe fn parse_ipv4_tcp(ctx: &TcContext) -> Option<Parsed> {
    let eth = ptr_at::<EthHdr>(ctx, 0)?;
    if (*eth).h_proto != ETH_P_IP {
        return None;
    }
    let ip_offset = core::mem::size_of::<EthHdr>();
    let ip = ptr_at::<Ipv4Hdr>(ctx, ip_offset)?;
    let ip_hdr_len = ((*ip).ihl() as usize) * 4;
    if ip_hdr_len < core::mem::size_of::<Ipv4Hdr>() {
        return None;
    }
    if (*ip).protocol != proto::TCP && (*ip).protocol != proto::UDP {
        return None;
    }
    let tcp_offset = ip_offset + ip_hdr_len;
    if (*ip).protocol != proto::TCP {
        return Some(Parsed { ip_offset, ip_hdr_len, tcp_offset, tcp_hdr_len: 0 });
    }
    let tcp = ptr_at::<TcpHdr>(ctx, tcp_offset)?;
    let tcp_hdr_len = ((*tcp).doff() as usize) * 4;
    if tcp_hdr_len < core::mem::size_of::<TcpHdr>() {
        return None;
    }
    Some(Parsed { ip_offset, ip_hdr_len, tcp_offset, tcp_hdr_len })
}

// ── C4: egress SNAT ──────────────────────────────────────────────────────────

#[classifier]
pub fn fluxlb_tc_egress(ctx: TcContext) -> i32 {
    match try_egress(&ctx) {
        Ok(action) => action,
        Err(()) => TC_ACT_OK as i32,
    }
}

fn try_egress(ctx: &TcContext) -> Result<i32, ()> {
    let parsed = unsafe { parse_ipv4_tcp(ctx) }.ok_or(())?;
    let is_tcp = parsed.tcp_hdr_len > 0;

    let ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, parsed.ip_offset).ok_or(())? };
    let (src_ip, dst_ip, src_port, dst_port, protocol) = unsafe {
        let saddr = (*ip).saddr;
        let daddr = (*ip).daddr;
        let protocol = (*ip).protocol;
        if is_tcp {
            let tcp = ptr_at::<TcpHdr>(ctx, parsed.tcp_offset).ok_or(())?;
            (saddr, daddr, (*tcp).source, (*tcp).dest, protocol)
        } else {
            // UDP header shares the same first-4-bytes layout as TCP (source,
            // dest), so reading it through TcpHdr's first two fields is safe.
            let udp = ptr_at::<TcpHdr>(ctx, parsed.tcp_offset).ok_or(())?;
            (saddr, daddr, (*udp).source, (*udp).dest, protocol)
        }
    };

    // Reverse-direction lookup: this packet is leaving as (src=backend,
    // dst=client); the conntrack entry was created keyed on the forward
    // 5-tuple (src=client, dst=backend), so swap both ends to find it.
    let key = ConntrackKey {
        src_ip: Addr::from_v4_octets(dst_ip.to_ne_bytes()),
        dst_ip: Addr::from_v4_octets(src_ip.to_ne_bytes()),
        src_port: dst_port,
        dst_port: src_port,
        protocol,
        _pad: [0; 3],
    };

    let entry = unsafe { conntrack_map.get_ptr_mut(&key) }.ok_or(())?;
    let now = unsafe { bpf_ktime_get_ns() };
    unsafe {
        (*entry).last_seen_ns = now;
        (*entry).packets_rev = (*entry).packets_rev.wrapping_add(1);
        (*entry).bytes_rev = (*entry).bytes_rev.wrapping_add(ctx.len() as u64);
    }

    let new_saddr = unsafe { (*entry).orig_dst_ip.v4_octets().ok_or(())? };
    let new_saddr = u32::from_ne_bytes(new_saddr);
    let new_sport = unsafe { (*entry).orig_dst_port };

    rewrite_source(ctx, parsed.ip_offset, parsed.tcp_offset, is_tcp, src_ip, new_saddr, src_port, new_sport)?;

    if is_tcp {
        let seq_offset = unsafe { (*entry).seq_offset };
        if seq_offset != 0 {
            adjust_ack(ctx, parsed.tcp_offset, seq_offset)?;
        }
    }

    Ok(TC_ACT_OK as i32)
}

/// Rewrites the IPv4 source address and L4 source port, repairing both
/// checksums via `TcContext::l3_csum_replace`/`l4_csum_replace` — the
/// `aya`-provided equivalent of the raw `bpf_l3_csum_replace`/
/// `bpf_l4_csum_replace` helpers referenced in §4.4.
fn rewrite_source(
    ctx: &TcContext,
    ip_offset: usize,
    tcp_offset: usize,
    is_tcp: bool,
    old_saddr: u32,
    new_saddr: u32,
    old_sport: u16,
    new_sport: u16,
) -> Result<(), ()> {
    const BPF_F_PSEUDO_HDR: u64 = 1 << 4;

    ctx.l3_csum_replace(ip_offset + 10, old_saddr as u64, new_saddr as u64, 4)
        .map_err(|_| ())?;
    unsafe {
        let daddr_ptr = ptr_at::<u32>(ctx, ip_offset + 12).ok_or(())?;
        core::ptr::write_unaligned(daddr_ptr, new_saddr);
    }

    let l4_csum_off = if is_tcp { tcp_offset + 16 } else { tcp_offset + 6 };
    ctx.l4_csum_replace(l4_csum_off, old_saddr as u64, new_saddr as u64, BPF_F_PSEUDO_HDR | 4)
        .map_err(|_| ())?;
    ctx.l4_csum_replace(l4_csum_off, old_sport as u64, new_sport as u64, 2)
        .map_err(|_| ())?;
    unsafe {
        let sport_ptr = ptr_at::<u16>(ctx, tcp_offset).ok_or(())?;
        core::ptr::write_unaligned(sport_ptr, new_sport);
    }
    Ok(())
}

/// Subtracts `seq_offset` from the TCP acknowledgment number so the
/// client's view of the byte stream is unaffected by the PROXY bytes the
/// injector spliced into the forward direction (§4.4 step 5).
fn adjust_ack(ctx: &TcContext, tcp_offset: usize, seq_offset: u32) -> Result<(), ()> {
    let ack_ptr = unsafe { ptr_at::<u32>(ctx, tcp_offset + 8).ok_or(())? };
    let old_ack = u32::from_be(unsafe { *ack_ptr });
    let new_ack = old_ack.wrapping_sub(seq_offset);
    ctx.l4_csum_replace(tcp_offset + 16, old_ack as u64, new_ack.to_be() as u64, 4)
        .map_err(|_| ())?;
    unsafe { core::ptr::write_unaligned(ack_ptr, new_ack.to_be()) };
    Ok(())
}

// ── C5: PROXY-protocol-v2 injector ──────────────────────────────────────────

/// Verifier-friendly cap on the payload shift: 24 chunks of 64 bytes each
/// (§4.5 step 3, §9 open question). A first data packet larger than this is
/// passed through without injection rather than dropped.
const SHIFT_CHUNK_LEN: u32 = 64;
const SHIFT_MAX_CHUNKS: u32 = 24;
const SHIFT_MAX_BYTES: u32 = SHIFT_CHUNK_LEN * SHIFT_MAX_CHUNKS;

#[classifier]
pub fn fluxlb_tc_ingress_proxy(ctx: TcContext) -> i32 {
    match try_ingress_proxy(&ctx) {
        Ok(action) => action,
        Err(()) => TC_ACT_OK as i32,
    }
}

fn try_ingress_proxy(ctx: &TcContext) -> Result<i32, ()> {
    let parsed = unsafe { parse_ipv4_tcp(ctx) }.ok_or(())?;
    if parsed.tcp_hdr_len == 0 {
        return Ok(TC_ACT_OK as i32);
    }

    let ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, parsed.ip_offset).ok_or(())? };
    let tcp = unsafe { ptr_at::<TcpHdr>(ctx, parsed.tcp_offset).ok_or(())? };
    let (saddr, daddr, sport, dport, protocol, syn, ack, fin, rst) = unsafe {
        (
            (*ip).saddr,
            (*ip).daddr,
            (*tcp).source,
            (*tcp).dest,
            (*ip).protocol,
            (*tcp).syn(),
            (*tcp).ack(),
            (*tcp).fin(),
            (*tcp).rst(),
        )
    };

    let key = ConntrackKey {
        src_ip: Addr::from_v4_octets(saddr.to_ne_bytes()),
        dst_ip: Addr::from_v4_octets(daddr.to_ne_bytes()),
        src_port: sport,
        dst_port: dport,
        protocol,
        _pad: [0; 3],
    };
    let entry = match unsafe { conntrack_map.get_ptr_mut(&key) } {
        Some(e) => e,
        None => return Ok(TC_ACT_OK as i32),
    };

    if unsafe { (*entry).proxy_flags } & proxy_flags::ENABLED == 0 {
        return Ok(TC_ACT_OK as i32);
    }

    advance_handshake_state(entry, syn, ack, fin, rst);

    if unsafe { (*entry).conn_state } != conn_state::ESTABLISHED {
        return Ok(TC_ACT_OK as i32);
    }

    let payload_len = ctx.len().saturating_sub((parsed.tcp_offset + parsed.tcp_hdr_len) as u32);

    if unsafe { (*entry).proxy_flags } & proxy_flags::HEADER_INJECTED != 0 {
        if payload_len > 0 {
            let seq_offset = unsafe { (*entry).seq_offset };
            if seq_offset != 0 {
                adjust_seq(ctx, parsed.tcp_offset, seq_offset)?;
            }
        }
        return Ok(TC_ACT_OK as i32);
    }

    if payload_len == 0 {
        return Ok(TC_ACT_OK as i32);
    }
    if payload_len > SHIFT_MAX_BYTES {
        // Over the verifier-friendly shift cap: skip injection silently
        // rather than drop the connection (§9 open question resolution).
        return Ok(TC_ACT_OK as i32);
    }

    let client_ip = unsafe { (*entry).orig_client_ip };
    let client_port = unsafe { (*entry).orig_client_port };
    let dst_ip = unsafe { (*entry).orig_dst_ip };
    let dst_port = unsafe { (*entry).orig_dst_port };

    let header_len = inject_header_v4(ctx, parsed.ip_offset, parsed.tcp_offset + parsed.tcp_hdr_len, payload_len, client_ip, client_port, dst_ip, dst_port)?;

    unsafe {
        (*entry).proxy_flags |= proxy_flags::HEADER_INJECTED;
        (*entry).seq_offset = header_len;
    }

    Ok(TC_ACT_OK as i32)
}

/// TCP state machine (§4.5): this program only ever observes the ingress
/// (client-to-backend) direction, so the SYN_SENT→SYN_RECV step that
/// depends on the egress SYN-ACK is driven on a best-effort basis here by
/// also accepting the handshake-completing ACK; a stricter implementation
/// would pair this with an egress-side observer (§9 open question).
fn advance_handshake_state(entry: *mut ConntrackValue, syn: bool, ack: bool, fin: bool, rst: bool) {
    if fin || rst {
        return;
    }
    let state = unsafe { (*entry).conn_state };
    let next = match state {
        conn_state::NEW if syn && !ack => conn_state::SYN_SENT,
        conn_state::SYN_SENT if syn && ack => conn_state::SYN_RECV,
        conn_state::SYN_RECV if ack && !syn => conn_state::ESTABLISHED,
        other => other,
    };
    unsafe { (*entry).conn_state = next };
}

/// Adds `seq_offset` to the TCP sequence number of later forward packets on
/// a connection whose header has already been injected (§4.5 step 6).
fn adjust_seq(ctx: &TcContext, tcp_offset: usize, seq_offset: u32) -> Result<(), ()> {
    let seq_ptr = unsafe { ptr_at::<u32>(ctx, tcp_offset + 4).ok_or(())? };
    let old_seq = u32::from_be(unsafe { *seq_ptr });
    let new_seq = old_seq.wrapping_add(seq_offset);
    ctx.l4_csum_replace(tcp_offset + 16, old_seq as u64, new_seq.to_be() as u64, 4)
        .map_err(|_| ())?;
    unsafe { core::ptr::write_unaligned(seq_ptr, new_seq.to_be()) };
    Ok(())
}

/// Grows the packet by `IPV4_HEADER_LEN` bytes, shifts the existing payload
/// down by that amount (last-chunk-first, §4.5 step 3), and writes the
/// PROXY-protocol-v2 header into the freed space.
fn inject_header_v4(
    ctx: &TcContext,
    ip_offset: usize,
    payload_offset: usize,
    payload_len: u32,
    client_ip: Addr,
    client_port: u16,
    dst_ip: Addr,
    dst_port: u16,
) -> Result<u32, ()> {
    let header_len = proxy_header::IPV4_HEADER_LEN as u32;
    let new_len = ctx.len() + header_len;

    let skb_ptr = ctx.skb.skb;
    let ret = unsafe { bpf_skb_change_tail(skb_ptr, new_len, 0) };
    if ret != 0 {
        return Err(());
    }

    // Shift the payload down by `header_len`, copying 64-byte chunks from
    // the tail backward so a chunk is never overwritten before it is read.
    let mut remaining = payload_len;
    let mut chunk_idx: u32 = 0;
    while chunk_idx < SHIFT_MAX_CHUNKS {
        if remaining == 0 {
            break;
        }
        let this_len = remaining.min(SHIFT_CHUNK_LEN);
        let src_off = payload_offset as u32 + remaining - this_len;
        let dst_off = src_off + header_len;

        let mut buf = [0u8; SHIFT_CHUNK_LEN as usize];
        let load_ret = unsafe {
            bpf_skb_load_bytes(
                skb_ptr,
                src_off,
                buf.as_mut_ptr() as *mut core::ffi::c_void,
                this_len,
            )
        };
        if load_ret != 0 {
            return Err(());
        }
        let store_ret = unsafe {
            bpf_skb_store_bytes(
                skb_ptr,
                dst_off,
                buf.as_ptr() as *const core::ffi::c_void,
                this_len,
                0,
            )
        };
        if store_ret != 0 {
            return Err(());
        }

        remaining -= this_len;
        chunk_idx += 1;
    }

    let mut header = [0u8; proxy_header::IPV4_HEADER_LEN];
    header[..12].copy_from_slice(&proxy_header::SIGNATURE);
    header[12] = proxy_header::VERSION_COMMAND_PROXY;
    header[13] = proxy_header::AF_INET | proxy_header::TRANSPORT_STREAM;
    header[14..16].copy_from_slice(&proxy_header::IPV4_ADDR_LEN.to_be_bytes());
    header[16..20].copy_from_slice(&client_ip.v4_octets().ok_or(())?);
    header[20..24].copy_from_slice(&dst_ip.v4_octets().ok_or(())?);
    header[24..26].copy_from_slice(&client_port.to_be_bytes());
    header[26..28].copy_from_slice(&dst_port.to_be_bytes());

    let store_ret = unsafe {
        bpf_skb_store_bytes(
            skb_ptr,
            payload_offset as u32,
            header.as_ptr() as *const core::ffi::c_void,
            header.len() as u32,
            0,
        )
    };
    if store_ret != 0 {
        return Err(());
    }

    // Update the IPv4 total-length field and its header checksum for the
    // grown packet.
    let ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, ip_offset).ok_or(())? };
    let old_tot_len = u16::from_be(unsafe { (*ip).tot_len });
    let new_tot_len = old_tot_len + header_len as u16;
    ctx.l3_csum_replace(ip_offset + 10, old_tot_len as u64, new_tot_len as u64, 2)
        .map_err(|_| ())?;
    unsafe {
        let tot_len_ptr = ptr_at::<u16>(ctx, ip_offset + 2).ok_or(())?;
        core::ptr::write_unaligned(tot_len_ptr, new_tot_len.to_be());
    }

    Ok(header_len)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
