// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network address translation.
//!
//! A [`NatPolicy`] belongs to a rule of the NAT ruleset and says how to translate the packets
//! matching the rule. Static policies translate every packet on its own. Dynamic policies
//! create a [`NatEntry`] per connection, holding the original and translated address and port;
//! the entry is attached to the connection, whose backward key is rewritten to match the
//! translated replies.

mod algo;
mod portmap;

pub use algo::{netmap, npt66};
pub use portmap::{PortMap, PortMaps};

use crate::alg::{Alg, AlgRegistry};
use crate::config::Config;
use crate::conn::{Conn, ConnDb, ConnError, FlowDir, NatInfo};
use crate::stats::{NpfStat, Stats};
use bitflags::bitflags;
use bpf::BpfArgs;
use net::buffer::NetBuffer;
use net::cache::{CacheError, CacheFlags, Direction, PacketCache, Side};
use net::interface::IfId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use table::{TableError, TableId, TableSet};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("no table with id {0}")]
    NoTable(TableId),
    #[error(transparent)]
    Table(TableError),
    #[error("no translation address available")]
    NoAddress,
    #[error("translation address family does not match the packet")]
    FamilyMismatch,
    #[error("no free port left for {0}")]
    PortsExhausted(IpAddr),
    #[error("port {port} of {addr} is already in use")]
    PortTaken { addr: IpAddr, port: u16 },
    #[error("invalid policy: {0}")]
    InvalidPolicy(&'static str),
    #[error("packet rewrite failed: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Conn(#[from] ConnError),
}

/// Which side of the packets a policy translates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NatType {
    /// Source translation of outgoing packets.
    Outbound,
    /// Destination translation of incoming packets (redirection).
    Inbound,
}

impl NatType {
    /// Direction of the packets the policy applies to.
    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            NatType::Outbound => Direction::Out,
            NatType::Inbound => Direction::In,
        }
    }

    fn side(self) -> Side {
        match self {
            NatType::Outbound => Side::Src,
            NatType::Inbound => Side::Dst,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct NatFlags: u32 {
        /// Translate ports too.
        const PORTS = 1 << 0;
        /// Allocate translated ports from the port map.
        const PORTMAP = 1 << 1;
        /// Translate every packet without tracking a connection.
        const STATIC = 1 << 2;
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NatAlgo {
    /// A single translation address, or the first address of the pool table.
    #[default]
    None,
    /// Pool table address picked by a hash of the packet addresses.
    IpHash,
    /// Pool table addresses in turn.
    RoundRobin,
    /// Replace the network part of the address, keep the host part.
    Netmap,
    /// IPv6 prefix translation (RFC 6296).
    Npt66,
}

/// The static part of a policy. Two policies with equal parameters are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatParams {
    pub kind: NatType,
    pub flags: NatFlags,
    pub addr: IpAddr,
    /// Prefix length of `addr`, for netmap and NPTv6.
    pub prefix: u8,
    /// Pool table, instead of `addr`.
    pub table: Option<TableId>,
    /// Fixed translated port, 0 to keep the original one.
    pub port: u16,
    pub algo: NatAlgo,
}

impl NatParams {
    fn validate(&self) -> Result<(), NatError> {
        let max_prefix = if self.addr.is_ipv4() { 32 } else { 128 };
        if self.prefix > max_prefix {
            return Err(NatError::InvalidPolicy("prefix longer than the address"));
        }
        if self.flags.contains(NatFlags::PORTMAP) && !self.flags.contains(NatFlags::PORTS) {
            return Err(NatError::InvalidPolicy("port map without port translation"));
        }
        if self.flags.contains(NatFlags::PORTMAP) && self.kind == NatType::Inbound {
            return Err(NatError::InvalidPolicy("port map on an inbound policy"));
        }
        if self.algo == NatAlgo::Npt66 {
            if !self.flags.contains(NatFlags::STATIC) {
                return Err(NatError::InvalidPolicy("npt66 needs a static policy"));
            }
            if self.addr.is_ipv4() || self.table.is_some() {
                return Err(NatError::InvalidPolicy("npt66 needs an IPv6 prefix"));
            }
        }
        if self.flags.contains(NatFlags::STATIC) && self.flags.contains(NatFlags::PORTS) {
            return Err(NatError::InvalidPolicy("static policies do not translate ports"));
        }
        Ok(())
    }
}

pub struct NatPolicy {
    id: AtomicU32,
    params: NatParams,
    entries: Mutex<Vec<Weak<NatEntry>>>,
    rr: AtomicUsize,
    portmaps: Arc<PortMaps>,
    stats: Arc<Stats>,
}

impl Debug for NatPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPolicy")
            .field("id", &self.id())
            .field("params", &self.params)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

impl NatPolicy {
    /// # Errors
    ///
    /// Fails if the parameters are inconsistent.
    pub fn new(
        id: u32,
        params: NatParams,
        portmaps: Arc<PortMaps>,
        stats: Arc<Stats>,
    ) -> Result<NatPolicy, NatError> {
        params.validate()?;
        Ok(NatPolicy {
            id: AtomicU32::new(id),
            params,
            entries: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
            portmaps,
            stats,
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    #[must_use]
    pub fn params(&self) -> &NatParams {
        &self.params
    }

    #[must_use]
    pub fn kind(&self) -> NatType {
        self.params.kind
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.params.flags.contains(NatFlags::STATIC)
    }

    /// Number of live entries of the policy.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Expire the connection of every entry, so that the collector releases them.
    pub fn expire_all(&self) {
        let entries: Vec<_> = self.entries.lock().iter().filter_map(Weak::upgrade).collect();
        for entry in &entries {
            if let Some(conn) = entry.conn.upgrade() {
                conn.expire();
            }
        }
        debug!("nat policy {}: expired {} entries", self.id(), entries.len());
    }

    fn register(&self, entry: &Arc<NatEntry>) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(entry));
        self.stats.inc(NpfStat::NatCreate);
    }

    fn prune(&self) {
        self.entries.lock().retain(|entry| entry.strong_count() > 0);
    }

    fn translated_port(&self, taddr: IpAddr, oport: u16) -> Result<(u16, bool), NatError> {
        if !self.params.flags.contains(NatFlags::PORTS) {
            return Ok((oport, false));
        }
        if self.params.flags.contains(NatFlags::PORTMAP) {
            let port = self
                .portmaps
                .get(taddr)
                .ok_or(NatError::PortsExhausted(taddr))?;
            return Ok((port, true));
        }
        if self.params.port != 0 {
            return Ok((self.params.port, false));
        }
        Ok((oport, false))
    }

    /// Create the entry of `conn`, whose first packet is in `cache`.
    pub(crate) fn create_entry(
        self: &Arc<Self>,
        cache: &PacketCache,
        conn: &Arc<Conn>,
        tables: &TableSet,
        algs: &[Arc<dyn Alg>],
    ) -> Result<Arc<NatEntry>, NatError> {
        let side = self.kind().side();
        let oaddr = cache.addr(side);
        let oport = cache.port(side).unwrap_or(0);
        let taddr = algo::select(&self.params, tables, cache, &self.rr, oaddr)?;
        let (tport, port_taken) = self.translated_port(taddr, oport)?;
        let mut entry = NatEntry {
            policy: self.clone(),
            conn: Arc::downgrade(conn),
            oaddr,
            oport,
            taddr,
            tport,
            port_taken,
            alg: None,
        };
        entry.alg = algs.iter().find(|alg| alg.matches(cache, &entry)).cloned();
        let entry = Arc::new(entry);
        self.register(&entry);
        trace!(
            "nat policy {}: {oaddr}:{oport} -> {taddr}:{tport}",
            self.id()
        );
        Ok(entry)
    }

    /// Translate a packet matching a static policy.
    fn translate_static(
        &self,
        buf: &mut dyn NetBuffer,
        cache: &mut PacketCache,
        tables: &TableSet,
    ) -> Result<(), NatError> {
        let side = self.kind().side();
        let orig = cache.addr(side);
        let addr = match (self.params.algo, orig, self.params.addr) {
            (NatAlgo::Npt66, IpAddr::V6(orig), IpAddr::V6(net)) => {
                IpAddr::V6(npt66(orig, net, self.params.prefix).ok_or(NatError::NoAddress)?)
            }
            (NatAlgo::Npt66, _, _) => return Err(NatError::FamilyMismatch),
            _ => algo::select(&self.params, tables, cache, &self.rr, orig)?,
        };
        if addr != orig {
            cache.rewrite_addr(buf, side, addr)?;
            cache.recache(buf)?;
        }
        Ok(())
    }
}

/// The translation of one connection.
pub struct NatEntry {
    policy: Arc<NatPolicy>,
    conn: Weak<Conn>,
    oaddr: IpAddr,
    oport: u16,
    taddr: IpAddr,
    tport: u16,
    port_taken: bool,
    alg: Option<Arc<dyn Alg>>,
}

impl Debug for NatEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatEntry")
            .field("policy", &self.policy.id())
            .field("oaddr", &self.oaddr)
            .field("oport", &self.oport)
            .field("taddr", &self.taddr)
            .field("tport", &self.tport)
            .field("alg", &self.alg.as_ref().map(|alg| alg.name().to_owned()))
            .finish_non_exhaustive()
    }
}

impl NatEntry {
    #[must_use]
    pub fn kind(&self) -> NatType {
        self.policy.kind()
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<NatPolicy> {
        &self.policy
    }

    #[must_use]
    pub fn conn(&self) -> Option<Arc<Conn>> {
        self.conn.upgrade()
    }

    #[must_use]
    pub fn oaddr(&self) -> IpAddr {
        self.oaddr
    }

    #[must_use]
    pub fn oport(&self) -> u16 {
        self.oport
    }

    #[must_use]
    pub fn taddr(&self) -> IpAddr {
        self.taddr
    }

    #[must_use]
    pub fn tport(&self) -> u16 {
        self.tport
    }

    #[must_use]
    pub fn alg(&self) -> Option<&Arc<dyn Alg>> {
        self.alg.as_ref()
    }

    #[must_use]
    pub fn info(&self) -> NatInfo {
        NatInfo {
            policy: self.policy.id(),
            oaddr: self.oaddr,
            oport: self.oport,
            taddr: self.taddr,
            tport: self.tport,
        }
    }

    /// Recreate an exported entry, reserving its translated port.
    pub(crate) fn import(
        policy: &Arc<NatPolicy>,
        conn: &Arc<Conn>,
        info: &NatInfo,
    ) -> Result<Arc<NatEntry>, NatError> {
        let port_taken = policy.params.flags.contains(NatFlags::PORTMAP);
        if port_taken && !policy.portmaps.take(info.taddr, info.tport) {
            return Err(NatError::PortTaken {
                addr: info.taddr,
                port: info.tport,
            });
        }
        let entry = Arc::new(NatEntry {
            policy: policy.clone(),
            conn: Arc::downgrade(conn),
            oaddr: info.oaddr,
            oport: info.oport,
            taddr: info.taddr,
            tport: info.tport,
            port_taken,
            alg: None,
        });
        policy.register(&entry);
        Ok(entry)
    }

    /// Rewrite a packet of the connection of the entry, flowing in direction `flow`.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot be rewritten.
    pub fn translate(
        &self,
        buf: &mut dyn NetBuffer,
        cache: &mut PacketCache,
        flow: FlowDir,
    ) -> Result<(), NatError> {
        let side = self.kind().side();
        let (side, addr, port) = match flow {
            FlowDir::Forward => (side, self.taddr, self.tport),
            FlowDir::Backward => (side.other(), self.oaddr, self.oport),
        };
        if cache.addr(side) != addr {
            cache.rewrite_addr(buf, side, addr)?;
        }
        if cache.port(side).is_some_and(|current| current != port) {
            cache.rewrite_port(buf, side, port)?;
        }
        if let Some(alg) = &self.alg {
            alg.translate(buf, cache, self, flow);
        }
        cache.recache(buf)?;
        Ok(())
    }
}

impl Drop for NatEntry {
    fn drop(&mut self) {
        if let Some(alg) = &self.alg {
            alg.destroy(self);
        }
        if self.port_taken {
            self.policy.portmaps.put(self.taddr, self.tport);
        }
        self.policy.prune();
        self.policy.stats.inc(NpfStat::NatDestroy);
    }
}

/// What [`do_nat`] works with.
pub(crate) struct NatContext<'a> {
    pub config: &'a Config,
    pub conndb: &'a ConnDb,
    pub algs: &'a AlgRegistry,
}

/// Translate the packet in `cache` if it belongs to a translated connection or matches the NAT
/// ruleset.
///
/// `conn` is the connection of the packet, if it has one. Returns the connection created for
/// the translation, if one was.
///
/// # Errors
///
/// Fails if the translation could not be set up or applied; a connection created here is
/// removed again.
pub(crate) fn do_nat(
    ctx: &NatContext<'_>,
    buf: &mut dyn NetBuffer,
    cache: &mut PacketCache,
    ifid: Option<IfId>,
    di: Direction,
    conn: Option<&(Arc<Conn>, FlowDir)>,
) -> Result<Option<Arc<Conn>>, NatError> {
    if !cache.is(CacheFlags::LAYER4) || cache.ids().is_none() {
        return Ok(None);
    }
    if let Some((conn, flow)) = conn {
        if let Some(entry) = conn.nat() {
            entry.translate(buf, cache, *flow)?;
            return Ok(None);
        }
        if *flow == FlowDir::Backward {
            return Ok(None);
        }
    }

    let tables = &ctx.config.tables;
    let rule = {
        let args = BpfArgs {
            pkt: &*buf,
            cache: &*cache,
            tables: Some(tables),
        };
        ctx.config.nat_ruleset.inspect(&args, ifid, di)
    };
    let Some(policy) = rule.as_ref().and_then(|rule| rule.nat()) else {
        return Ok(None);
    };
    if policy.kind().direction() != di {
        return Ok(None);
    }
    if policy.is_static() {
        return policy.translate_static(buf, cache, tables).map(|()| None);
    }

    let (conn, created) = match conn {
        Some((conn, _)) => (conn.clone(), false),
        None => (
            ctx.conndb
                .establish(cache, ifid, di, false, &ctx.config.params)?,
            true,
        ),
    };
    let result = attach(ctx, policy, buf, cache, &conn);
    match result {
        Ok(()) => Ok(created.then_some(conn)),
        // another packet of the connection attached its translation first
        Err(NatError::Conn(ConnError::NatRace)) if conn.nat().is_some() => {
            if let Some(entry) = conn.nat() {
                entry.translate(buf, cache, FlowDir::Forward)?;
            }
            Ok(created.then_some(conn))
        }
        Err(err) => {
            if created {
                ctx.conndb.remove(&conn);
            }
            debug!("translation failed: {err}");
            Err(err)
        }
    }
}

fn attach(
    ctx: &NatContext<'_>,
    policy: &Arc<NatPolicy>,
    buf: &mut dyn NetBuffer,
    cache: &mut PacketCache,
    conn: &Arc<Conn>,
) -> Result<(), NatError> {
    let algs = ctx.algs.snapshot();
    let entry = policy.create_entry(cache, conn, &ctx.config.tables, algs.algs())?;
    ctx.conndb.set_nat(conn, entry.clone())?;
    entry.translate(buf, cache, FlowDir::Forward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use net::test_utils::udp;
    use pretty_assertions::assert_eq;

    fn policy(kind: NatType, flags: NatFlags, addr: &str, port: u16) -> Arc<NatPolicy> {
        Arc::new(
            NatPolicy::new(
                1,
                NatParams {
                    kind,
                    flags,
                    addr: addr.parse().unwrap(),
                    prefix: 32,
                    table: None,
                    port,
                    algo: NatAlgo::None,
                },
                Arc::new(PortMaps::new(5000, 5009)),
                Arc::new(Stats::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn invalid_policies() {
        let portmaps = Arc::new(PortMaps::new(1, 2));
        let stats = Arc::new(Stats::new());
        let params = NatParams {
            kind: NatType::Outbound,
            flags: NatFlags::PORTMAP,
            addr: "10.0.0.1".parse().unwrap(),
            prefix: 32,
            table: None,
            port: 0,
            algo: NatAlgo::None,
        };
        assert!(NatPolicy::new(1, params.clone(), portmaps.clone(), stats.clone()).is_err());
        let npt = NatParams {
            flags: NatFlags::empty(),
            algo: NatAlgo::Npt66,
            ..params.clone()
        };
        assert!(NatPolicy::new(1, npt, portmaps.clone(), stats.clone()).is_err());
        let wide = NatParams {
            flags: NatFlags::empty(),
            prefix: 33,
            ..params
        };
        assert!(NatPolicy::new(1, wide, portmaps, stats).is_err());
    }

    #[test]
    fn entry_translates_both_ways_and_releases_its_port() {
        let policy = policy(
            NatType::Outbound,
            NatFlags::PORTS | NatFlags::PORTMAP,
            "198.51.100.1",
            0,
        );
        let db = ConnDb::new(Arc::new(Stats::new()));
        let mut pkt = udp(
            "10.0.0.5:4000".parse().unwrap(),
            "203.0.113.9:53".parse().unwrap(),
            b"query",
        );
        let mut cache = PacketCache::new(&mut pkt).unwrap();
        let conn = db
            .establish(&cache, None, Direction::Out, false, &Params::default())
            .unwrap();
        let entry = policy
            .create_entry(&cache, &conn, &TableSet::new(1), &[])
            .unwrap();
        assert_eq!(policy.entry_count(), 1);
        let tport = entry.tport();
        assert!((5000..=5009).contains(&tport));
        db.set_nat(&conn, entry.clone()).unwrap();

        entry.translate(&mut pkt, &mut cache, FlowDir::Forward).unwrap();
        assert_eq!(cache.src(), "198.51.100.1".parse::<IpAddr>().unwrap());
        assert_eq!(cache.port(Side::Src), Some(tport));

        let mut reply = udp(
            "203.0.113.9:53".parse().unwrap(),
            format!("198.51.100.1:{tport}").parse().unwrap(),
            b"answer",
        );
        let mut reply_cache = PacketCache::new(&mut reply).unwrap();
        let (found, flow) = db
            .lookup_packet(&reply_cache, None, Direction::In)
            .unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert_eq!(flow, FlowDir::Backward);
        entry
            .translate(&mut reply, &mut reply_cache, flow)
            .unwrap();
        assert_eq!(reply_cache.dst(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(reply_cache.port(Side::Dst), Some(4000));

        assert!(!policy.portmaps.take(entry.taddr(), tport));
        policy.expire_all();
        assert!(conn.is_expired());
        drop((entry, found));
        db.remove(&conn);
        drop(conn);
        assert!(db.lookup_packet(&reply_cache, None, Direction::In).is_none());
    }

    #[test]
    fn dropping_the_entry_frees_the_port() {
        let policy = policy(
            NatType::Outbound,
            NatFlags::PORTS | NatFlags::PORTMAP,
            "198.51.100.1",
            0,
        );
        let db = ConnDb::new(Arc::new(Stats::new()));
        let mut pkt = udp(
            "10.0.0.5:4000".parse().unwrap(),
            "203.0.113.9:53".parse().unwrap(),
            b"",
        );
        let cache = PacketCache::new(&mut pkt).unwrap();
        let conn = db
            .establish(&cache, None, Direction::Out, false, &Params::default())
            .unwrap();
        let entry = policy
            .create_entry(&cache, &conn, &TableSet::new(1), &[])
            .unwrap();
        let (taddr, tport) = (entry.taddr(), entry.tport());
        drop(entry);
        assert_eq!(policy.entry_count(), 0);
        assert!(policy.portmaps.take(taddr, tport));
        assert_eq!(policy.stats.get(NpfStat::NatDestroy), 1);
    }

    #[test]
    fn redirect_uses_the_fixed_port() {
        let policy = policy(NatType::Inbound, NatFlags::PORTS, "10.0.0.80", 8080);
        let db = ConnDb::new(Arc::new(Stats::new()));
        let mut pkt = udp(
            "203.0.113.9:3333".parse().unwrap(),
            "198.51.100.1:80".parse().unwrap(),
            b"",
        );
        let mut cache = PacketCache::new(&mut pkt).unwrap();
        let conn = db
            .establish(&cache, None, Direction::In, false, &Params::default())
            .unwrap();
        let entry = policy
            .create_entry(&cache, &conn, &TableSet::new(1), &[])
            .unwrap();
        db.set_nat(&conn, entry.clone()).unwrap();
        entry.translate(&mut pkt, &mut cache, FlowDir::Forward).unwrap();
        assert_eq!(cache.dst(), "10.0.0.80".parse::<IpAddr>().unwrap());
        assert_eq!(cache.port(Side::Dst), Some(8080));
        assert_eq!(entry.oaddr(), "198.51.100.1".parse::<IpAddr>().unwrap());
        assert_eq!(entry.oport(), 80);
        // replies come from the redirected address and port
        let back = conn.back_key();
        assert_eq!(back.addr(Side::Src), entry.taddr());
        assert_eq!(back.id(Side::Src), 8080);

        let other = policy
            .create_entry(&cache, &conn, &TableSet::new(1), &[])
            .unwrap();
        assert!(matches!(
            db.set_nat(&conn, other),
            Err(ConnError::NatRace)
        ));
    }
}
