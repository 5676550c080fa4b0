// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection keys.
//!
//! A key identifies one direction of a connection: protocol, addresses, ids (ports or ICMP
//! query id) and, unless the connection is global, the interface and direction it was seen on.
//!
//! The canonical word layout, used for export, is:
//!
//! ```text
//! word 0:   alen << 24 | proto << 16 | direction << 8
//! word 1:   interface id (0 for none)
//! word 2:   source id << 16 | destination id
//! word 3..: source address, then destination address (alen / 4 words each)
//! ```

use net::cache::{CacheFlags, Direction, PacketCache, Side, proto};
use net::interface::IfId;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const NO_DIRECTION: u8 = 0;
const DIRECTION_IN: u8 = 1;
const DIRECTION_OUT: u8 = 2;

/// Number of words of the canonical layout of a key with addresses of `alen` bytes.
#[must_use]
pub const fn key_words(alen: u8) -> usize {
    3 + 2 * (alen as usize / 4)
}

fn encode_direction(di: Option<Direction>) -> u8 {
    match di {
        None => NO_DIRECTION,
        Some(Direction::In) => DIRECTION_IN,
        Some(Direction::Out) => DIRECTION_OUT,
    }
}

fn addr_bytes(addr: IpAddr) -> [u8; 16] {
    let mut bytes = [0; 16];
    match addr {
        IpAddr::V4(v4) => bytes[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes = v6.octets(),
    }
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    alen: u8,
    proto: u8,
    ifid: u32,
    di: u8,
    ids: [u16; 2],
    addrs: [[u8; 16]; 2],
}

impl ConnKey {
    /// Key of the packet in `cache`, as seen on `ifid` in direction `di`.
    ///
    /// Returns `None` for packets that cannot be tracked: non-IP packets, fragments, and ICMP
    /// messages other than queries. Protocols without ports get ids of 0.
    #[must_use]
    pub fn from_cache(
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Option<Direction>,
    ) -> Option<ConnKey> {
        if !cache.is_ip() || cache.is(CacheFlags::IPFRAG) {
            return None;
        }
        let ids = match cache.ids() {
            Some(ids) => ids,
            None if cache.is(CacheFlags::ICMP) => return None,
            None => [0, 0],
        };
        Some(ConnKey {
            alen: cache.alen(),
            proto: cache.proto(),
            ifid: ifid.map_or(0, IfId::get),
            di: encode_direction(di),
            ids,
            addrs: [addr_bytes(cache.src()), addr_bytes(cache.dst())],
        })
    }

    /// The key of the other direction of the same connection.
    #[must_use]
    pub fn reverse(&self) -> ConnKey {
        let di = match self.di {
            DIRECTION_IN => DIRECTION_OUT,
            DIRECTION_OUT => DIRECTION_IN,
            other => other,
        };
        ConnKey {
            di,
            ids: [self.ids[1], self.ids[0]],
            addrs: [self.addrs[1], self.addrs[0]],
            ..*self
        }
    }

    #[must_use]
    pub fn alen(&self) -> u8 {
        self.alen
    }

    #[must_use]
    pub fn proto(&self) -> u8 {
        self.proto
    }

    #[must_use]
    pub fn ifid(&self) -> Option<IfId> {
        (self.ifid != 0).then_some(IfId::new(self.ifid))
    }

    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        match self.di {
            DIRECTION_IN => Some(Direction::In),
            DIRECTION_OUT => Some(Direction::Out),
            _ => None,
        }
    }

    #[must_use]
    pub fn id(&self, side: Side) -> u16 {
        self.ids[side.index()]
    }

    #[must_use]
    pub fn addr(&self, side: Side) -> IpAddr {
        let bytes = self.addrs[side.index()];
        if self.alen == 4 {
            IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
        } else {
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
    }

    fn is_icmp_query(&self) -> bool {
        self.proto == proto::ICMP || self.proto == proto::ICMPV6
    }

    /// Replace the address and id of one side, as a translation does.
    ///
    /// ICMP queries carry the same id on both sides.
    pub fn rewrite(&mut self, side: Side, addr: IpAddr, id: u16) {
        self.addrs[side.index()] = addr_bytes(addr);
        if self.is_icmp_query() {
            self.ids = [id, id];
        } else {
            self.ids[side.index()] = id;
        }
    }

    /// Canonical word layout of the key.
    #[must_use]
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(key_words(self.alen));
        words.push(
            (u32::from(self.alen) << 24)
                | (u32::from(self.proto) << 16)
                | (u32::from(self.di) << 8),
        );
        words.push(self.ifid);
        words.push((u32::from(self.ids[0]) << 16) | u32::from(self.ids[1]));
        let alen = usize::from(self.alen);
        for addr in &self.addrs {
            words.extend(
                addr[..alen]
                    .chunks_exact(4)
                    .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            );
        }
        words
    }

    /// Rebuild a key from its canonical word layout.
    ///
    /// Returns `None` if the words do not form a valid key.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // fields are extracted with shifts and masks
    pub fn from_words(words: &[u32]) -> Option<ConnKey> {
        let head = *words.first()?;
        let alen = (head >> 24) as u8;
        if alen != 4 && alen != 16 {
            return None;
        }
        let di = (head >> 8) as u8;
        if words.len() != key_words(alen) || di > DIRECTION_OUT || head & 0xff != 0 {
            return None;
        }
        let mut addrs = [[0u8; 16]; 2];
        let per_addr = usize::from(alen) / 4;
        for (side, addr) in addrs.iter_mut().enumerate() {
            let start = 3 + side * per_addr;
            for (chunk, word) in addr
                .chunks_exact_mut(4)
                .zip(&words[start..start + per_addr])
            {
                chunk.copy_from_slice(&word.to_be_bytes());
            }
        }
        Some(ConnKey {
            alen,
            proto: (head >> 16) as u8,
            ifid: words[1],
            di,
            ids: [(words[2] >> 16) as u16, words[2] as u16],
            addrs,
        })
    }
}

impl Display for ConnKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "proto {} {}:{} -> {}:{}",
            self.proto,
            self.addr(Side::Src),
            self.ids[0],
            self.addr(Side::Dst),
            self.ids[1]
        )?;
        if let Some(ifid) = self.ifid() {
            write!(f, " on {ifid}")?;
        }
        if let Some(di) = self.direction() {
            write!(f, " {di}")?;
        }
        Ok(())
    }
}
