// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection tracking.
//!
//! A [`Conn`] is one tracked flow. It is reachable from the [`ConnDb`] through two keys: the
//! forward key, built from the packet that created the connection, and the backward key, which
//! matches the replies. Connections are shared as `Arc<Conn>` and destroyed by the collector
//! once they are unlinked and nobody else holds them.

mod conndb;
mod export;
mod key;

pub use conndb::{ConnDb, ConnError, GcMode};
pub use export::{ConnInfo, ImportError, NatInfo, export_conns, import_conn};
pub use key::{ConnKey, key_words};

use crate::nat::NatEntry;
use crate::params::Params;
use crate::ruleset::Rproc;
use crate::state::ConnState;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Direction of a packet relative to the connection it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDir {
    /// Same direction as the packet that created the connection.
    Forward = 0,
    /// A reply.
    Backward = 1,
}

impl FlowDir {
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn reverse(self) -> FlowDir {
        match self {
            FlowDir::Forward => FlowDir::Backward,
            FlowDir::Backward => FlowDir::Forward,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u32 {
        /// Inserted in the database and visible to lookups.
        const ACTIVE = 1 << 0;
        /// Packets of the connection pass without a ruleset inspection.
        const PASS = 1 << 1;
        /// To be collected.
        const EXPIRE = 1 << 2;
        /// Unlinked from the database.
        const REMOVED = 1 << 3;
        /// Not bound to an interface and direction.
        const GLOBAL = 1 << 4;
    }
}

/// Fields of a connection protected by its lock.
#[derive(Debug)]
pub struct ConnInner {
    pub back: ConnKey,
    pub state: ConnState,
    pub nat: Option<Arc<NatEntry>>,
    pub rproc: Option<Arc<Rproc>>,
    /// Id of the rule that let the connection pass.
    pub rule_id: Option<u64>,
}

#[derive(Debug)]
pub struct Conn {
    forw: ConnKey,
    flags: AtomicU32,
    atime: AtomicU64,
    inner: Mutex<ConnInner>,
}

impl Conn {
    pub(crate) fn new(forw: ConnKey, state: ConnState, flags: ConnFlags, now: u64) -> Conn {
        Conn {
            forw,
            flags: AtomicU32::new(flags.bits()),
            atime: AtomicU64::new(now),
            inner: Mutex::new(ConnInner {
                back: forw.reverse(),
                state,
                nat: None,
                rproc: None,
                rule_id: None,
            }),
        }
    }

    #[must_use]
    pub fn forw_key(&self) -> ConnKey {
        self.forw
    }

    /// The backward key; it changes when a translation is attached.
    #[must_use]
    pub fn back_key(&self) -> ConnKey {
        self.inner.lock().back
    }

    #[must_use]
    pub fn flags(&self) -> ConnFlags {
        ConnFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ConnFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: ConnFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Mark the connection for collection.
    pub fn expire(&self) {
        self.set_flags(ConnFlags::EXPIRE);
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.flags().contains(ConnFlags::EXPIRE)
    }

    /// Whether lookups may return the connection.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let flags = self.flags();
        flags.contains(ConnFlags::ACTIVE) && !flags.contains(ConnFlags::EXPIRE)
    }

    /// Time of the last packet, in seconds of the database clock.
    #[must_use]
    pub fn atime(&self) -> u64 {
        self.atime.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: u64) {
        self.atime.fetch_max(now, Ordering::Relaxed);
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    #[must_use]
    pub fn nat(&self) -> Option<Arc<NatEntry>> {
        self.inner.lock().nat.clone()
    }

    #[must_use]
    pub fn rproc(&self) -> Option<Arc<Rproc>> {
        self.inner.lock().rproc.clone()
    }

    /// Let the following packets of the connection pass, running `rproc` on each of them.
    pub fn set_pass(&self, rule_id: Option<u64>, rproc: Option<Arc<Rproc>>) {
        {
            let mut inner = self.inner.lock();
            inner.rule_id = rule_id;
            inner.rproc = rproc;
        }
        self.set_flags(ConnFlags::PASS);
    }

    /// Whether the connection idled past the timeout of its state, or was expired explicitly.
    #[must_use]
    pub fn expired_at(&self, now: u64, params: &Params) -> bool {
        if self.is_expired() {
            return true;
        }
        let timeout = self.inner.lock().state.timeout(params);
        now.saturating_sub(self.atime()) > timeout
    }
}

/// A connection as stored under one of its keys.
#[derive(Debug, Clone)]
pub enum ConnRef {
    Forward(Arc<Conn>),
    Backward(Arc<Conn>),
}

impl ConnRef {
    #[must_use]
    pub fn conn(&self) -> &Arc<Conn> {
        match self {
            ConnRef::Forward(conn) | ConnRef::Backward(conn) => conn,
        }
    }

    #[must_use]
    pub fn flow(&self) -> FlowDir {
        match self {
            ConnRef::Forward(_) => FlowDir::Forward,
            ConnRef::Backward(_) => FlowDir::Backward,
        }
    }
}

/// Monotonic clock of a connection database, in seconds.
#[derive(Debug)]
pub struct Clock {
    origin: Instant,
    skew: AtomicU64,
}

impl Default for Clock {
    fn default() -> Self {
        Clock {
            origin: Instant::now(),
            skew: AtomicU64::new(0),
        }
    }
}

impl Clock {
    #[must_use]
    pub fn now(&self) -> u64 {
        self.origin.elapsed().as_secs() + self.skew.load(Ordering::Relaxed)
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.skew.fetch_add(secs, Ordering::Relaxed);
    }
}
