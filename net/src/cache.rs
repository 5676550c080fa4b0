// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The packet cache: a parsed, normalized view of the L3 and L4 headers of a packet.
//!
//! The cache is computed once per packet and consulted by every later stage. Parsing never
//! fails hard on malformed or truncated input: whatever could not be parsed is simply not
//! flagged as cached. The only hard failure is a buffer that cannot be rearranged to expose a
//! header which is known to be present.
//!
//! The cache may be recomputed ([`PacketCache::recache`]) after the packet was modified in
//! place, and it offers the in-place rewrites used by address translation, which keep the
//! checksums valid.

use crate::buffer::{BufferError, NetBuffer};
use crate::checksum;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// IANA protocol numbers used by the filter.
pub mod proto {
    /// IPv6 hop-by-hop options.
    pub const HOPOPTS: u8 = 0;
    /// ICMP.
    pub const ICMP: u8 = 1;
    /// TCP.
    pub const TCP: u8 = 6;
    /// UDP.
    pub const UDP: u8 = 17;
    /// IPv6 routing header.
    pub const ROUTING: u8 = 43;
    /// IPv6 fragment header.
    pub const FRAGMENT: u8 = 44;
    /// ICMPv6.
    pub const ICMPV6: u8 = 58;
    /// IPv6 no next header.
    pub const NONE: u8 = 59;
    /// IPv6 destination options.
    pub const DSTOPTS: u8 = 60;
}

const IP4_MIN_HLEN: usize = 20;
const IP6_HLEN: usize = 40;
const TCP_MIN_HLEN: usize = 20;
const UDP_HLEN: usize = 8;
const ICMP_HLEN: usize = 8;
// More IPv6 extension headers than this and we give up on finding the upper layer.
const IP6_MAX_EXT: usize = 8;

/// Direction of a packet relative to the interface it crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received.
    In,
    /// Sent.
    Out,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Direction {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Source or destination side of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Source address / port.
    Src = 0,
    /// Destination address / port.
    Dst = 1,
}

impl Side {
    /// Index of the side in `[src, dst]` pairs.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The other side.
    #[must_use]
    pub const fn other(self) -> Side {
        match self {
            Side::Src => Side::Dst,
            Side::Dst => Side::Src,
        }
    }
}

bitflags! {
    /// Which parts of a packet are cached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct CacheFlags: u32 {
        /// IPv4 header.
        const IP4 = 1 << 0;
        /// IPv6 header (and extension headers).
        const IP6 = 1 << 1;
        /// The packet is a fragment: no L4 header is cached.
        const IPFRAG = 1 << 2;
        /// Some L4 header.
        const LAYER4 = 1 << 3;
        /// TCP header.
        const TCP = 1 << 4;
        /// UDP header.
        const UDP = 1 << 5;
        /// ICMP or `ICMPv6` header.
        const ICMP = 1 << 6;
        /// ICMP query with an identifier (echo, timestamp).
        const ICMP_ID = 1 << 7;
        /// Either IP version.
        const IP46 = Self::IP4.bits() | Self::IP6.bits();
    }
}

bitflags! {
    /// TCP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct TcpFlags: u8 {
        /// FIN.
        const FIN = 0x01;
        /// SYN.
        const SYN = 0x02;
        /// RST.
        const RST = 0x04;
        /// PSH.
        const PUSH = 0x08;
        /// ACK.
        const ACK = 0x10;
        /// URG.
        const URG = 0x20;
    }
}

/// Cached TCP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgement number.
    pub ack: u32,
    /// Advertised window.
    pub win: u16,
    /// Flags.
    pub flags: TcpFlags,
    /// Header length, options included.
    pub hlen: usize,
    /// Window scale option, if present.
    pub wscale: Option<u8>,
    /// Maximum segment size option, if present.
    pub mss: Option<u16>,
}

/// Cached UDP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
}

/// Cached ICMP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpInfo {
    /// Message type.
    pub kind: u8,
    /// Message code.
    pub code: u8,
    /// Query identifier, for queries.
    pub id: Option<u16>,
}

/// Cached L4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Info {
    /// TCP.
    Tcp(TcpInfo),
    /// UDP.
    Udp(UdpInfo),
    /// ICMP or `ICMPv6`.
    Icmp(IcmpInfo),
}

/// Errors of the packet cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The packet storage could not be rearranged.
    #[error("packet buffer pull-up failed: {0}")]
    Pullup(BufferError),
    /// The packet could not be made writable.
    #[error("packet is not writable: {0}")]
    NotWritable(BufferError),
    /// The headers required by the operation are not cached.
    #[error("required headers not cached")]
    NotCached,
    /// Address family does not match the packet.
    #[error("address family mismatch")]
    FamilyMismatch,
}

/// The parsed view of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketCache {
    flags: CacheFlags,
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    ttl: u8,
    l3_len: usize,
    ip_len: usize,
    l4: Option<L4Info>,
    pulled_up: bool,
}

impl Default for PacketCache {
    fn default() -> Self {
        PacketCache {
            flags: CacheFlags::empty(),
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proto: 0,
            ttl: 0,
            l3_len: 0,
            ip_len: 0,
            l4: None,
            pulled_up: false,
        }
    }
}

fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn be32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn v6_addr(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

impl PacketCache {
    /// Parse the headers of `buf`.
    ///
    /// # Errors
    ///
    /// Fails only if a header within the packet bounds could not be made contiguous.
    pub fn new<B: NetBuffer + ?Sized>(buf: &mut B) -> Result<PacketCache, CacheError> {
        let mut cache = PacketCache::default();
        cache.recache(buf)?;
        Ok(cache)
    }

    /// Parse the headers of `buf` again, e.g. after the packet was modified in place.
    ///
    /// # Errors
    ///
    /// Fails only if a header within the packet bounds could not be made contiguous.
    pub fn recache<B: NetBuffer + ?Sized>(&mut self, buf: &mut B) -> Result<(), CacheError> {
        let pulled_up = self.pulled_up;
        *self = PacketCache {
            pulled_up,
            ..PacketCache::default()
        };
        let Some(version) = self.fetch(buf, 0, 1)?.map(|hdr| hdr[0] >> 4) else {
            return Ok(());
        };
        let l3 = match version {
            4 => self.cache_ip4(buf)?,
            6 => self.cache_ip6(buf)?,
            _ => false,
        };
        if l3 && !self.flags.contains(CacheFlags::IPFRAG) {
            self.cache_l4(buf)?;
        }
        trace!("cached {:?}", self.flags);
        Ok(())
    }

    /// Get `len` contiguous octets at `offset`, pulling the buffer up if needed. `None` if the
    /// packet is too short.
    fn fetch<'a, B: NetBuffer + ?Sized>(
        &mut self,
        buf: &'a mut B,
        offset: usize,
        len: usize,
    ) -> Result<Option<&'a [u8]>, CacheError> {
        let Some(end) = offset.checked_add(len).filter(|end| *end <= buf.len()) else {
            return Ok(None);
        };
        if !buf.is_contiguous(offset, len) {
            buf.pullup(end).map_err(CacheError::Pullup)?;
            self.pulled_up = true;
        }
        Ok(buf.window(offset, len))
    }

    fn cache_ip4<B: NetBuffer + ?Sized>(&mut self, buf: &mut B) -> Result<bool, CacheError> {
        let Some(hdr) = self.fetch(buf, 0, IP4_MIN_HLEN)? else {
            return Ok(false);
        };
        let hlen = usize::from(hdr[0] & 0x0f) * 4;
        let total = usize::from(be16(hdr, 2));
        if hlen < IP4_MIN_HLEN || total < hlen {
            return Ok(false);
        }
        let frag = be16(hdr, 6) & 0x3fff != 0;
        let (ttl, proto) = (hdr[8], hdr[9]);
        let src = Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15]);
        let dst = Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19]);
        // options must be present too
        if hlen > IP4_MIN_HLEN && self.fetch(buf, 0, hlen)?.is_none() {
            return Ok(false);
        }
        self.flags |= CacheFlags::IP4;
        if frag {
            self.flags |= CacheFlags::IPFRAG;
        }
        self.src = src.into();
        self.dst = dst.into();
        self.proto = proto;
        self.ttl = ttl;
        self.l3_len = hlen;
        self.ip_len = total.min(buf.len());
        Ok(true)
    }

    fn cache_ip6<B: NetBuffer + ?Sized>(&mut self, buf: &mut B) -> Result<bool, CacheError> {
        let Some(hdr) = self.fetch(buf, 0, IP6_HLEN)? else {
            return Ok(false);
        };
        let payload = usize::from(be16(hdr, 4));
        let mut next = hdr[6];
        let ttl = hdr[7];
        let src = v6_addr(hdr, 8);
        let dst = v6_addr(hdr, 24);

        let mut offset = IP6_HLEN;
        let mut frag = false;
        for _ in 0..IP6_MAX_EXT {
            match next {
                proto::HOPOPTS | proto::ROUTING | proto::DSTOPTS => {
                    let Some(ext) = self.fetch(buf, offset, 2)? else {
                        return Ok(false);
                    };
                    next = ext[0];
                    offset += (usize::from(ext[1]) + 1) * 8;
                }
                proto::FRAGMENT => {
                    let Some(ext) = self.fetch(buf, offset, 8)? else {
                        return Ok(false);
                    };
                    next = ext[0];
                    // offset or more-fragments set: a real fragment
                    frag |= be16(ext, 2) & 0xfff9 != 0;
                    offset += 8;
                }
                _ => break,
            }
        }
        self.flags |= CacheFlags::IP6;
        if frag {
            self.flags |= CacheFlags::IPFRAG;
        }
        self.src = src.into();
        self.dst = dst.into();
        self.proto = next;
        self.ttl = ttl;
        self.l3_len = offset;
        self.ip_len = (IP6_HLEN + payload).min(buf.len());
        Ok(true)
    }

    fn cache_l4<B: NetBuffer + ?Sized>(&mut self, buf: &mut B) -> Result<(), CacheError> {
        let offset = self.l3_len;
        let icmp_proto = if self.is_ipv4() {
            proto::ICMP
        } else {
            proto::ICMPV6
        };
        let l4 = match self.proto {
            proto::TCP => self.cache_tcp(buf, offset)?,
            proto::UDP => self.fetch(buf, offset, UDP_HLEN)?.map(|hdr| {
                L4Info::Udp(UdpInfo {
                    sport: be16(hdr, 0),
                    dport: be16(hdr, 2),
                })
            }),
            p if p == icmp_proto => {
                let v4 = self.is_ipv4();
                self.fetch(buf, offset, ICMP_HLEN)?.map(|hdr| {
                    let (kind, code) = (hdr[0], hdr[1]);
                    let query = if v4 {
                        matches!(kind, 0 | 8 | 13 | 14 | 15 | 16 | 17 | 18)
                    } else {
                        matches!(kind, 128 | 129)
                    };
                    L4Info::Icmp(IcmpInfo {
                        kind,
                        code,
                        id: query.then(|| be16(hdr, 4)),
                    })
                })
            }
            _ => None,
        };
        if let Some(l4) = l4 {
            self.flags |= CacheFlags::LAYER4
                | match l4 {
                    L4Info::Tcp(_) => CacheFlags::TCP,
                    L4Info::Udp(_) => CacheFlags::UDP,
                    L4Info::Icmp(IcmpInfo { id: Some(_), .. }) => {
                        CacheFlags::ICMP | CacheFlags::ICMP_ID
                    }
                    L4Info::Icmp(_) => CacheFlags::ICMP,
                };
            self.l4 = Some(l4);
        }
        Ok(())
    }

    fn cache_tcp<B: NetBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        offset: usize,
    ) -> Result<Option<L4Info>, CacheError> {
        let Some(hdr) = self.fetch(buf, offset, TCP_MIN_HLEN)? else {
            return Ok(None);
        };
        let hlen = usize::from(hdr[12] >> 4) * 4;
        if hlen < TCP_MIN_HLEN {
            return Ok(None);
        }
        let mut info = TcpInfo {
            sport: be16(hdr, 0),
            dport: be16(hdr, 2),
            seq: be32(hdr, 4),
            ack: be32(hdr, 8),
            win: be16(hdr, 14),
            flags: TcpFlags::from_bits_truncate(hdr[13]),
            hlen,
            wscale: None,
            mss: None,
        };
        if hlen > TCP_MIN_HLEN {
            let Some(hdr) = self.fetch(buf, offset, hlen)? else {
                return Ok(None);
            };
            parse_tcp_options(&hdr[TCP_MIN_HLEN..], &mut info);
        }
        Ok(Some(L4Info::Tcp(info)))
    }
}

fn parse_tcp_options(mut options: &[u8], info: &mut TcpInfo) {
    const EOL: u8 = 0;
    const NOP: u8 = 1;
    const MSS: u8 = 2;
    const WSCALE: u8 = 3;
    while let [kind, rest @ ..] = options {
        match *kind {
            EOL => break,
            NOP => options = rest,
            _ => {
                let Some(&len) = rest.first() else { break };
                let len = usize::from(len);
                if len < 2 || len > options.len() {
                    break;
                }
                match (*kind, len) {
                    (MSS, 4) => info.mss = Some(be16(options, 2)),
                    // RFC 7323: values above 14 are treated as 14
                    (WSCALE, 3) => info.wscale = Some(options[2].min(14)),
                    _ => {}
                }
                options = &options[len..];
            }
        }
    }
}

// Accessors
impl PacketCache {
    /// What is cached.
    #[must_use]
    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// Whether all of `flags` are cached.
    #[must_use]
    pub fn is(&self, flags: CacheFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Whether an IP header is cached.
    #[must_use]
    pub fn is_ip(&self) -> bool {
        self.flags.intersects(CacheFlags::IP46)
    }

    /// Whether this is an IPv4 packet.
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.flags.contains(CacheFlags::IP4)
    }

    /// Whether the storage of the packet had to be rearranged while parsing.
    #[must_use]
    pub fn pulled_up(&self) -> bool {
        self.pulled_up
    }

    /// Address length: 4 or 16, 0 if no IP header is cached.
    #[must_use]
    pub fn alen(&self) -> u8 {
        if self.is_ipv4() {
            4
        } else if self.flags.contains(CacheFlags::IP6) {
            16
        } else {
            0
        }
    }

    /// Source address.
    #[must_use]
    pub fn src(&self) -> IpAddr {
        self.src
    }

    /// Destination address.
    #[must_use]
    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    /// Address of the given side.
    #[must_use]
    pub fn addr(&self, side: Side) -> IpAddr {
        match side {
            Side::Src => self.src,
            Side::Dst => self.dst,
        }
    }

    /// Upper layer protocol.
    #[must_use]
    pub fn proto(&self) -> u8 {
        self.proto
    }

    /// IPv4 TTL or IPv6 hop limit.
    #[must_use]
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Offset of the L4 header.
    #[must_use]
    pub fn l4_offset(&self) -> usize {
        self.l3_len
    }

    /// Length of the L4 header and payload.
    #[must_use]
    pub fn l4_len(&self) -> usize {
        self.ip_len.saturating_sub(self.l3_len)
    }

    /// Cached L4 header.
    #[must_use]
    pub fn l4(&self) -> Option<&L4Info> {
        self.l4.as_ref()
    }

    /// Cached TCP header.
    #[must_use]
    pub fn tcp(&self) -> Option<&TcpInfo> {
        match &self.l4 {
            Some(L4Info::Tcp(tcp)) => Some(tcp),
            _ => None,
        }
    }

    /// Cached ICMP header.
    #[must_use]
    pub fn icmp(&self) -> Option<&IcmpInfo> {
        match &self.l4 {
            Some(L4Info::Icmp(icmp)) => Some(icmp),
            _ => None,
        }
    }

    /// TCP payload length.
    #[must_use]
    pub fn tcp_payload_len(&self) -> usize {
        self.tcp()
            .map_or(0, |tcp| self.l4_len().saturating_sub(tcp.hlen))
    }

    /// Source and destination ids: ports for TCP and UDP, the query id (as both) for ICMP
    /// queries.
    #[must_use]
    pub fn ids(&self) -> Option<[u16; 2]> {
        match &self.l4 {
            Some(L4Info::Tcp(tcp)) => Some([tcp.sport, tcp.dport]),
            Some(L4Info::Udp(udp)) => Some([udp.sport, udp.dport]),
            Some(L4Info::Icmp(IcmpInfo { id: Some(id), .. })) => Some([*id, *id]),
            _ => None,
        }
    }

    /// Port (or ICMP query id) of the given side.
    #[must_use]
    pub fn port(&self, side: Side) -> Option<u16> {
        self.ids().map(|ids| ids[side.index()])
    }
}

// In-place rewrites
impl PacketCache {
    /// Offset of the L4 checksum field and whether it covers the pseudo-header.
    fn l4_cksum(&self) -> Option<(usize, bool)> {
        let offset = self.l3_len;
        match self.l4? {
            L4Info::Tcp(_) => Some((offset + 16, true)),
            L4Info::Udp(_) => Some((offset + 6, true)),
            L4Info::Icmp(_) => Some((offset + 2, !self.is_ipv4())),
        }
    }

    fn writable<'a, B: NetBuffer + ?Sized>(
        &self,
        buf: &'a mut B,
        len: usize,
    ) -> Result<&'a mut [u8], CacheError> {
        buf.ensure_writable(len).map_err(CacheError::NotWritable)?;
        buf.pullup(len).map_err(CacheError::Pullup)?;
        buf.window_mut(0, len)
            .ok_or(CacheError::Pullup(BufferError::Pullup(len)))
    }

    fn l4_hlen(&self) -> usize {
        match &self.l4 {
            Some(L4Info::Tcp(tcp)) => tcp.hlen,
            Some(L4Info::Udp(_)) => UDP_HLEN,
            Some(L4Info::Icmp(_)) => ICMP_HLEN,
            None => 0,
        }
    }

    /// Replace the address of `side` with `addr`, fixing up the checksums.
    ///
    /// # Errors
    ///
    /// Fails if the packet has no IP header, `addr` is not of the packet's family, or the
    /// packet cannot be written.
    pub fn rewrite_addr<B: NetBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        side: Side,
        addr: IpAddr,
    ) -> Result<(), CacheError> {
        if !self.is_ip() {
            return Err(CacheError::NotCached);
        }
        let old = self.addr(side);
        if old.is_ipv4() != addr.is_ipv4() {
            return Err(CacheError::FamilyMismatch);
        }
        let l4_cksum = if self.is(CacheFlags::LAYER4) {
            self.l4_cksum()
        } else {
            None
        };
        let len = self.l3_len + self.l4_hlen();
        let data = self.writable(buf, len)?;
        match addr {
            IpAddr::V4(new) => {
                let at = 12 + 4 * side.index();
                data[at..at + 4].copy_from_slice(&new.octets());
                let cksum = checksum::fixup_addr(be16(data, 10), old, addr);
                data[10..12].copy_from_slice(&cksum.to_be_bytes());
            }
            IpAddr::V6(new) => {
                let at = 8 + 16 * side.index();
                data[at..at + 16].copy_from_slice(&new.octets());
            }
        }
        if let Some((at, true)) = l4_cksum {
            let stored = be16(data, at);
            // a zero UDP checksum over IPv4 means "no checksum"
            if !(stored == 0 && self.is_ipv4() && self.proto == proto::UDP) {
                let cksum = checksum::fixup_addr(stored, old, addr);
                data[at..at + 2].copy_from_slice(&cksum.to_be_bytes());
            }
        }
        match side {
            Side::Src => self.src = addr,
            Side::Dst => self.dst = addr,
        }
        Ok(())
    }

    /// Replace the port of `side` (the query id for ICMP queries) with `port`, fixing up the
    /// checksum.
    ///
    /// # Errors
    ///
    /// Fails if the packet has no ports or ICMP query id, or cannot be written.
    pub fn rewrite_port<B: NetBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        side: Side,
        port: u16,
    ) -> Result<(), CacheError> {
        let (Some(l4), Some((cksum_at, _))) = (self.l4, self.l4_cksum()) else {
            return Err(CacheError::NotCached);
        };
        let offset = self.l3_len;
        let at = match l4 {
            L4Info::Tcp(_) | L4Info::Udp(_) => offset + 2 * side.index(),
            L4Info::Icmp(IcmpInfo { id: Some(_), .. }) => offset + 4,
            L4Info::Icmp(_) => return Err(CacheError::NotCached),
        };
        let udp4 = self.is_ipv4() && self.proto == proto::UDP;
        let len = offset + self.l4_hlen();
        let data = self.writable(buf, len)?;
        let old = be16(data, at);
        data[at..at + 2].copy_from_slice(&port.to_be_bytes());
        let stored = be16(data, cksum_at);
        if !(stored == 0 && udp4) {
            let cksum = checksum::fixup16(stored, old, port);
            data[cksum_at..cksum_at + 2].copy_from_slice(&cksum.to_be_bytes());
        }
        self.l4 = Some(match l4 {
            L4Info::Tcp(mut tcp) => {
                match side {
                    Side::Src => tcp.sport = port,
                    Side::Dst => tcp.dport = port,
                }
                L4Info::Tcp(tcp)
            }
            L4Info::Udp(mut udp) => {
                match side {
                    Side::Src => udp.sport = port,
                    Side::Dst => udp.dport = port,
                }
                L4Info::Udp(udp)
            }
            L4Info::Icmp(mut icmp) => {
                icmp.id = Some(port);
                L4Info::Icmp(icmp)
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TestBuffer;
    use crate::test_utils::{TcpSegment, icmp_echo, tcp, udp};
    use std::net::SocketAddr;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn l4_checksum_ok(cache: &PacketCache, buf: &TestBuffer) -> bool {
        let data = buf.to_vec();
        let segment = &data[cache.l4_offset()..];
        checksum::l4_checksum(cache.src(), cache.dst(), cache.proto(), segment) == 0
    }

    #[test]
    fn caches_tcp4() {
        let seg = TcpSegment {
            flags: TcpFlags::SYN,
            seq: 1000,
            win: 29200,
            wscale: Some(7),
            mss: Some(1460),
            ..TcpSegment::default()
        };
        let mut buf = tcp(sa("10.0.0.1:1234"), sa("10.0.0.2:80"), &seg);
        let cache = PacketCache::new(&mut buf).unwrap();
        assert!(cache.is(CacheFlags::IP4 | CacheFlags::LAYER4 | CacheFlags::TCP));
        assert!(!cache.is(CacheFlags::IPFRAG));
        assert_eq!(cache.alen(), 4);
        assert_eq!(cache.ids(), Some([1234, 80]));
        let tcp = cache.tcp().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.flags, TcpFlags::SYN);
        assert_eq!(tcp.wscale, Some(7));
        assert_eq!(tcp.mss, Some(1460));
        assert_eq!(cache.tcp_payload_len(), 0);
        assert!(!cache.pulled_up());
    }

    #[test]
    fn caches_udp6_and_icmp() {
        let mut buf = udp(sa("[2001:db8::1]:53"), sa("[2001:db8::2]:5353"), b"payload");
        let cache = PacketCache::new(&mut buf).unwrap();
        assert!(cache.is(CacheFlags::IP6 | CacheFlags::UDP));
        assert_eq!(cache.alen(), 16);
        assert_eq!(cache.ids(), Some([53, 5353]));
        assert_eq!(cache.l4_len(), 8 + 7);

        let mut buf = icmp_echo("10.0.0.1".parse().unwrap(), "8.8.8.8".parse().unwrap(), 77);
        let cache = PacketCache::new(&mut buf).unwrap();
        assert!(cache.is(CacheFlags::ICMP | CacheFlags::ICMP_ID));
        assert_eq!(cache.ids(), Some([77, 77]));

        let mut buf = icmp_echo("2001:db8::1".parse().unwrap(), "2001:db8::2".parse().unwrap(), 9);
        let cache = PacketCache::new(&mut buf).unwrap();
        assert!(cache.is(CacheFlags::IP6 | CacheFlags::ICMP_ID));
        assert_eq!(cache.icmp().map(|icmp| icmp.kind), Some(128));
    }

    #[test]
    fn split_headers_are_pulled_up() {
        let buf = tcp(sa("10.0.0.1:1"), sa("10.0.0.2:2"), &TcpSegment::default());
        let data = buf.to_vec();
        let mut split = TestBuffer::split_at(&data, 25);
        let cache = PacketCache::new(&mut split).unwrap();
        assert!(cache.pulled_up());
        assert!(cache.is(CacheFlags::TCP));
        assert_eq!(split.pullups(), 1);
    }

    #[test]
    fn truncated_and_garbage_are_not_cached() {
        let buf = tcp(sa("10.0.0.1:1"), sa("10.0.0.2:2"), &TcpSegment::default());
        let data = buf.to_vec();
        // IP header only
        let mut truncated = TestBuffer::from_raw_data(&data[..24]);
        let cache = PacketCache::new(&mut truncated).unwrap();
        assert!(cache.is(CacheFlags::IP4));
        assert!(!cache.is(CacheFlags::LAYER4));

        let mut garbage = TestBuffer::from_raw_data(&[0x75, 1, 2]);
        assert!(!PacketCache::new(&mut garbage).unwrap().is_ip());
        let mut empty = TestBuffer::from_raw_data(&[]);
        assert_eq!(PacketCache::new(&mut empty).unwrap().flags(), CacheFlags::empty());
    }

    #[test]
    fn fragments_have_no_l4() {
        let buf = udp(sa("10.0.0.1:1"), sa("10.0.0.2:2"), b"x");
        let mut data = buf.to_vec();
        // set more-fragments and refresh the header checksum
        data[6] |= 0x20;
        data[10..12].copy_from_slice(&[0, 0]);
        let cksum = checksum::checksum(&data[..20]);
        data[10..12].copy_from_slice(&cksum.to_be_bytes());
        let mut buf = TestBuffer::from_raw_data(&data);
        let cache = PacketCache::new(&mut buf).unwrap();
        assert!(cache.is(CacheFlags::IP4 | CacheFlags::IPFRAG));
        assert_eq!(cache.l4(), None);
    }

    #[test]
    fn rewrites_keep_checksums_valid() {
        let seg = TcpSegment {
            flags: TcpFlags::ACK,
            payload_len: 11,
            ..TcpSegment::default()
        };
        let mut buf = tcp(sa("192.168.1.10:40000"), sa("203.0.113.5:443"), &seg);
        let mut cache = PacketCache::new(&mut buf).unwrap();
        assert!(l4_checksum_ok(&cache, &buf));

        let new: IpAddr = "198.51.100.7".parse().unwrap();
        cache.rewrite_addr(&mut buf, Side::Src, new).unwrap();
        cache.rewrite_port(&mut buf, Side::Src, 1025).unwrap();
        assert_eq!(cache.src(), new);
        assert_eq!(cache.port(Side::Src), Some(1025));
        assert_eq!(checksum::checksum(&buf.to_vec()[..20]), 0);
        assert!(l4_checksum_ok(&cache, &buf));

        // the rewritten packet parses to the same view
        let mut reparsed = cache.clone();
        reparsed.recache(&mut buf).unwrap();
        assert_eq!(reparsed, cache);

        let mut buf = icmp_echo("2001:db8::1".parse().unwrap(), "2001:db8::2".parse().unwrap(), 9);
        let mut cache = PacketCache::new(&mut buf).unwrap();
        cache
            .rewrite_addr(&mut buf, Side::Dst, "2001:db8:1::2".parse().unwrap())
            .unwrap();
        cache.rewrite_port(&mut buf, Side::Src, 4242).unwrap();
        assert!(l4_checksum_ok(&cache, &buf));
        assert_eq!(cache.ids(), Some([4242, 4242]));
    }

    #[test]
    fn rewrite_errors() {
        let mut buf = udp(sa("10.0.0.1:1"), sa("10.0.0.2:2"), b"");
        let mut cache = PacketCache::new(&mut buf).unwrap();
        assert_eq!(
            cache.rewrite_addr(&mut buf, Side::Src, "::1".parse().unwrap()),
            Err(CacheError::FamilyMismatch)
        );
        let mut ro = TestBuffer::from_raw_data(&buf.to_vec()).readonly();
        assert_eq!(
            cache.rewrite_port(&mut ro, Side::Dst, 3),
            Err(CacheError::NotWritable(BufferError::NotWritable))
        );
    }

    #[test]
    fn parse_never_panics() {
        bolero::check!()
            .with_type::<(Vec<u8>, u8)>()
            .for_each(|(data, split)| {
                let mut buf = TestBuffer::split_at(data, usize::from(*split));
                if let Ok(mut cache) = PacketCache::new(&mut buf) {
                    let _ = cache.rewrite_port(&mut buf, Side::Src, 1);
                    let _ = cache.recache(&mut buf);
                }
            });
    }
}
