// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The connection database.
//!
//! Both keys of every connection map to it in a concurrent hash map. New connections are also
//! pushed on a lock-free stack, which the collector drains into the list it owns and scans.

use crate::conn::{Clock, Conn, ConnFlags, ConnKey, ConnRef, FlowDir};
use crate::nat::{NatEntry, NatType};
use crate::params::Params;
use crate::state::{ConnState, StateError};
use crate::stats::{NpfStat, Stats};
use ahash::RandomState;
use concurrency::{Ebr, LfStack};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use net::cache::{Direction, PacketCache, Side};
use net::interface::IfId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    #[error("packet cannot be tracked")]
    NotTrackable,
    #[error("forward and backward keys are equal: {0}")]
    SameKeys(ConnKey),
    #[error("invalid initial state: {0}")]
    State(#[from] StateError),
    #[error("lost the race to insert {0}")]
    Race(ConnKey),
    #[error("connection already has a translation")]
    NatRace,
    #[error("connection was removed")]
    Removed,
}

/// How much of the database a collection pass checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// At most `gc.step` connections, resuming where the previous pass stopped.
    Incremental,
    /// Every connection.
    Full,
}

#[derive(Debug, Default)]
struct GcState {
    all: Vec<Arc<Conn>>,
    pending: Vec<Arc<Conn>>,
    cursor: usize,
}

fn hasher_state() -> &'static RandomState {
    use std::sync::OnceLock;
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

#[derive(Debug)]
pub struct ConnDb {
    map: DashMap<ConnKey, ConnRef, RandomState>,
    new_conns: LfStack<Arc<Conn>>,
    gc: Mutex<GcState>,
    count: AtomicUsize,
    clock: Clock,
    stats: Arc<Stats>,
}

impl ConnDb {
    #[must_use]
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            map: DashMap::with_hasher(hasher_state().clone()),
            new_conns: LfStack::new(),
            gc: Mutex::new(GcState::default()),
            count: AtomicUsize::new(0),
            clock: Clock::default(),
            stats,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Number of connections not yet destroyed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the connection of `key` and the direction of the packet within it.
    ///
    /// Expired connections, and connections not yet fully inserted, are not returned.
    #[must_use]
    pub fn lookup(&self, key: &ConnKey) -> Option<(Arc<Conn>, FlowDir)> {
        let (conn, flow) = {
            let entry = self.map.get(key)?;
            (entry.conn().clone(), entry.flow())
        };
        if !conn.is_usable() {
            return None;
        }
        conn.touch(self.clock.now());
        Some((conn, flow))
    }

    /// Connection of the packet in `cache`: first the one bound to the interface and direction
    /// of the packet, then a global one.
    #[must_use]
    pub fn lookup_packet(
        &self,
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Direction,
    ) -> Option<(Arc<Conn>, FlowDir)> {
        let key = ConnKey::from_cache(cache, ifid, Some(di))?;
        self.lookup(&key).or_else(|| {
            let global = ConnKey::from_cache(cache, None, None)?;
            self.lookup(&global)
        })
    }

    fn insert_key(&self, key: ConnKey, value: ConnRef) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    fn unlink_key(&self, key: &ConnKey, conn: &Arc<Conn>) {
        self.map
            .remove_if(key, |_, stored| Arc::ptr_eq(stored.conn(), conn));
    }

    /// Create a connection for the packet in `cache`, seen on `ifid` in direction `di`, and
    /// insert both of its keys.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot be tracked or cannot open a connection, or if another thread
    /// inserted a connection with one of the same keys first. The losing connection is left
    /// expired and never retried.
    pub fn establish(
        &self,
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Direction,
        global: bool,
        params: &Params,
    ) -> Result<Arc<Conn>, ConnError> {
        let forw = if global {
            ConnKey::from_cache(cache, None, None)
        } else {
            ConnKey::from_cache(cache, ifid, Some(di))
        }
        .ok_or(ConnError::NotTrackable)?;
        let back = forw.reverse();
        if forw == back {
            return Err(ConnError::SameKeys(forw));
        }
        let state = ConnState::new(cache, params)?;
        let flags = if global {
            ConnFlags::GLOBAL
        } else {
            ConnFlags::empty()
        };
        let conn = Arc::new(Conn::new(forw, state, flags, self.clock.now()));

        if !self.insert_key(forw, ConnRef::Forward(conn.clone())) {
            return Err(self.lost_race(&conn, forw));
        }
        if !self.insert_key(back, ConnRef::Backward(conn.clone())) {
            self.unlink_key(&forw, &conn);
            return Err(self.lost_race(&conn, back));
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.new_conns.push(conn.clone());
        conn.set_flags(ConnFlags::ACTIVE);
        self.stats.inc(NpfStat::ConnCreate);
        debug!("established connection {forw}");
        Ok(conn)
    }

    fn lost_race(&self, conn: &Conn, key: ConnKey) -> ConnError {
        conn.set_flags(ConnFlags::REMOVED | ConnFlags::EXPIRE);
        self.stats.inc(NpfStat::RaceConn);
        trace!("lost the race to insert {key}");
        ConnError::Race(key)
    }

    /// Unlink both keys of `conn`. The connection is destroyed by the collector.
    pub fn remove(&self, conn: &Arc<Conn>) {
        let inner = conn.lock();
        self.unlink_key(&conn.forw_key(), conn);
        self.unlink_key(&inner.back, conn);
        conn.set_flags(ConnFlags::REMOVED | ConnFlags::EXPIRE);
        trace!("removed connection {}", conn.forw_key());
    }

    /// Attach a translation to `conn` and rewrite its backward key so that replies to the
    /// translated packets find the connection.
    ///
    /// # Errors
    ///
    /// Fails if the connection already has a translation, or was removed, or if the rewritten
    /// backward key is taken. In the last case the connection is removed.
    pub fn set_nat(&self, conn: &Arc<Conn>, entry: Arc<NatEntry>) -> Result<(), ConnError> {
        let mut inner = conn.lock();
        if inner.nat.is_some() {
            self.stats.inc(NpfStat::RaceNat);
            return Err(ConnError::NatRace);
        }
        if conn.flags().contains(ConnFlags::REMOVED) {
            return Err(ConnError::Removed);
        }
        let old = inner.back;
        let mut back = old;
        let side = match entry.kind() {
            NatType::Outbound => Side::Dst,
            NatType::Inbound => Side::Src,
        };
        back.rewrite(side, entry.taddr(), entry.tport());
        if back != old {
            self.unlink_key(&old, conn);
            if !self.insert_key(back, ConnRef::Backward(conn.clone())) {
                self.unlink_key(&conn.forw_key(), conn);
                conn.set_flags(ConnFlags::REMOVED | ConnFlags::EXPIRE);
                self.stats.inc(NpfStat::RaceNat);
                warn!("translated key {back} is taken, dropping {}", conn.forw_key());
                return Err(ConnError::NatRace);
            }
            inner.back = back;
        }
        inner.nat = Some(entry);
        Ok(())
    }

    /// Unlink expired connections and destroy those nobody holds any more.
    ///
    /// Waits for a full epoch sync of `ebr` before destroying anything, so it must not be called
    /// from within a read section.
    pub fn gc(&self, ebr: &Ebr, params: &Params, mode: GcMode) {
        let mut gc = self.gc.lock();
        let GcState {
            all,
            pending,
            cursor,
        } = &mut *gc;
        all.extend(self.new_conns.take_all());

        let now = self.clock.now();
        // an incremental pass removes up to `gc.step` connections and sees every connection;
        // only the kept ones count against the visits, as a removal brings an unseen one in
        let budget = match mode {
            GcMode::Incremental => params.gc_step(),
            GcMode::Full => all.len(),
        };
        if mode == GcMode::Full {
            *cursor = 0;
        }
        let mut expired = 0;
        let mut visits = all.len();
        while visits > 0 && expired < budget && !all.is_empty() {
            if *cursor >= all.len() {
                *cursor = 0;
            }
            if all[*cursor].expired_at(now, params) {
                let conn = all.swap_remove(*cursor);
                self.remove(&conn);
                pending.push(conn);
                expired += 1;
            } else {
                *cursor += 1;
                visits -= 1;
            }
        }

        if pending.is_empty() {
            return;
        }
        ebr.full_sync();
        let before = pending.len();
        pending.retain(|conn| Arc::strong_count(conn) > 1);
        let destroyed = before - pending.len();
        self.count.fetch_sub(destroyed, Ordering::Relaxed);
        self.stats
            .add(NpfStat::ConnDestroy, u64::try_from(destroyed).unwrap_or(u64::MAX));
        debug!(
            "gc: {expired} expired, {destroyed} destroyed, {} still referenced, {} live",
            pending.len(),
            all.len()
        );
    }

    /// Expire every connection and collect them.
    pub fn flush(&self, ebr: &Ebr, params: &Params) {
        for entry in &self.map {
            entry.conn().expire();
        }
        self.gc(ebr, params, GcMode::Full);
    }

    /// The live connections.
    #[must_use]
    pub fn conns(&self) -> Vec<Arc<Conn>> {
        self.map
            .iter()
            .filter_map(|entry| match entry.value() {
                ConnRef::Forward(conn) if conn.is_usable() => Some(conn.clone()),
                _ => None,
            })
            .collect()
    }

    /// Insert an imported connection with the given keys.
    pub(crate) fn insert_imported(
        &self,
        conn: &Arc<Conn>,
        forw: ConnKey,
        back: ConnKey,
    ) -> Result<(), ConnError> {
        if forw == back {
            return Err(ConnError::SameKeys(forw));
        }
        if !self.insert_key(forw, ConnRef::Forward(conn.clone())) {
            return Err(self.lost_race(conn, forw));
        }
        if !self.insert_key(back, ConnRef::Backward(conn.clone())) {
            self.unlink_key(&forw, conn);
            return Err(self.lost_race(conn, back));
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.new_conns.push(conn.clone());
        conn.set_flags(ConnFlags::ACTIVE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GenericState;
    use net::buffer::TestBuffer;
    use net::test_utils::udp;
    use std::thread;

    fn packet(i: u16) -> TestBuffer {
        udp(
            format!("10.0.{}.{}:{}", i >> 8, i & 0xff, 1024 + i)
                .parse()
                .unwrap(),
            "192.0.2.1:53".parse().unwrap(),
            b"x",
        )
    }

    fn establish(db: &ConnDb, i: u16) -> Arc<Conn> {
        let mut pkt = packet(i);
        let cache = PacketCache::new(&mut pkt).unwrap();
        db.establish(
            &cache,
            Some(IfId::new(1)),
            Direction::Out,
            false,
            &Params::default(),
        )
        .unwrap()
    }

    #[test]
    fn lookup_both_directions() {
        let db = ConnDb::new(Arc::new(Stats::new()));
        let conn = establish(&db, 1);
        let (found, flow) = db.lookup(&conn.forw_key()).unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert_eq!(flow, FlowDir::Forward);
        let (_, flow) = db.lookup(&conn.back_key()).unwrap();
        assert_eq!(flow, FlowDir::Backward);
        assert_eq!(db.len(), 1);
        assert_eq!(db.conns().len(), 1);

        conn.expire();
        assert!(db.lookup(&conn.forw_key()).is_none());
    }

    #[test]
    fn second_establish_loses() {
        let stats = Arc::new(Stats::new());
        let db = ConnDb::new(stats.clone());
        let _first = establish(&db, 7);
        let mut pkt = packet(7);
        let cache = PacketCache::new(&mut pkt).unwrap();
        let err = db
            .establish(
                &cache,
                Some(IfId::new(1)),
                Direction::Out,
                false,
                &Params::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ConnError::Race(_)));
        assert_eq!(stats.get(NpfStat::RaceConn), 1);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn concurrent_establish_creates_one_connection() {
        let stats = Arc::new(Stats::new());
        let db = Arc::new(ConnDb::new(stats.clone()));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                thread::spawn(move || {
                    let mut pkt = packet(3);
                    let cache = PacketCache::new(&mut pkt).unwrap();
                    db.establish(
                        &cache,
                        Some(IfId::new(1)),
                        Direction::Out,
                        false,
                        &Params::default(),
                    )
                    .is_ok()
                })
            })
            .collect();
        let winners = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(stats.get(NpfStat::RaceConn), 7);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn incremental_gc_is_bounded_by_step() {
        let stats = Arc::new(Stats::new());
        let db = ConnDb::new(stats.clone());
        let ebr = Ebr::new();
        let params = Params::default();
        assert_eq!(params.gc_step(), 256);
        for i in 0..512 {
            establish(&db, i).expire();
        }
        assert_eq!(db.len(), 512);

        db.gc(&ebr, &params, GcMode::Incremental);
        assert_eq!(db.len(), 256);
        assert_eq!(stats.get(NpfStat::ConnDestroy), 256);
        db.gc(&ebr, &params, GcMode::Incremental);
        assert!(db.is_empty());
        assert!(db.conns().is_empty());
    }

    #[test]
    fn incremental_gc_skips_live_connections() {
        let stats = Arc::new(Stats::new());
        let db = ConnDb::new(stats.clone());
        let ebr = Ebr::new();
        let params = Params::default();
        let live: Vec<_> = (0..256).map(|i| establish(&db, i)).collect();
        for i in 256..512 {
            establish(&db, i).expire();
        }
        assert_eq!(db.len(), 512);

        db.gc(&ebr, &params, GcMode::Incremental);
        assert_eq!(db.len(), 256);
        assert_eq!(stats.get(NpfStat::ConnDestroy), 256);
        assert!(live.iter().all(|conn| db.lookup(&conn.forw_key()).is_some()));

        // fewer expired connections than the step: all of them go in one pass
        for conn in &live[..10] {
            conn.expire();
        }
        drop(live);
        db.gc(&ebr, &params, GcMode::Incremental);
        assert_eq!(db.len(), 246);
    }

    #[test]
    fn idle_connections_time_out() {
        let db = ConnDb::new(Arc::new(Stats::new()));
        let ebr = Ebr::new();
        let params = Params::default();
        let conn = establish(&db, 1);
        assert_eq!(
            conn.lock().state,
            ConnState::Generic(GenericState::New)
        );
        drop(conn);
        db.gc(&ebr, &params, GcMode::Full);
        assert_eq!(db.len(), 1);
        db.clock().advance(31);
        db.gc(&ebr, &params, GcMode::Full);
        assert!(db.is_empty());
    }

    #[test]
    fn referenced_connections_wait() {
        let db = ConnDb::new(Arc::new(Stats::new()));
        let ebr = Ebr::new();
        let params = Params::default();
        let conn = establish(&db, 1);
        db.flush(&ebr, &params);
        assert!(conn.flags().contains(ConnFlags::REMOVED));
        assert_eq!(db.len(), 1);
        drop(conn);
        db.gc(&ebr, &params, GcMode::Incremental);
        assert!(db.is_empty());
    }
}
