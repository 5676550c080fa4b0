// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Application level gateways.
//!
//! An [`Alg`] follows translated connections whose payload carries addresses or ports, or whose
//! packets belong to another connection (ICMP errors quoting the packet that caused them).

use crate::conn::{Conn, ConnDb, FlowDir};
use crate::nat::NatEntry;
use arc_swap::ArcSwap;
use concurrency::Ebr;
use net::buffer::NetBuffer;
use net::cache::{Direction, PacketCache};
use net::interface::IfId;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::debug;

pub trait Alg: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the ALG follows the connection of a new translation entry, whose first packet is
    /// in `cache`.
    fn matches(&self, cache: &PacketCache, entry: &NatEntry) -> bool;

    /// Called after every translated packet of an entry the ALG follows.
    fn translate(
        &self,
        buf: &mut dyn NetBuffer,
        cache: &mut PacketCache,
        entry: &NatEntry,
        flow: FlowDir,
    );

    /// Called before the connection lookup of every packet. May return the connection the
    /// packet belongs to.
    fn inspect(
        &self,
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Direction,
        conndb: &ConnDb,
    ) -> Option<(Arc<Conn>, FlowDir)>;

    /// Called when an entry the ALG follows is released.
    fn destroy(&self, _entry: &NatEntry) {}
}

/// Opaque handle of a registered ALG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgHandle(u64);

/// The registered ALGs, as seen by packet processing.
#[derive(Default)]
pub struct AlgList {
    handles: Vec<AlgHandle>,
    algs: Vec<Arc<dyn Alg>>,
}

impl AlgList {
    #[must_use]
    pub fn algs(&self) -> &[Arc<dyn Alg>] {
        &self.algs
    }
}

#[derive(Default)]
pub struct AlgRegistry {
    list: ArcSwap<AlgList>,
    writer: Mutex<u64>,
}

impl Debug for AlgRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.list.load().algs.iter().map(|alg| alg.name().to_owned()))
            .finish()
    }
}

impl AlgRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, alg: Arc<dyn Alg>) -> AlgHandle {
        let mut next = self.writer.lock();
        let handle = AlgHandle(*next);
        *next += 1;
        let old = self.list.load();
        let mut handles = old.handles.clone();
        let mut algs = old.algs.clone();
        debug!("registered alg {}", alg.name());
        handles.push(handle);
        algs.push(alg);
        self.list.store(Arc::new(AlgList { handles, algs }));
        handle
    }

    /// Unregister an ALG. Returns once no packet is processed with it any more; the entries
    /// already following connections keep it until they are released.
    pub fn unregister(&self, handle: AlgHandle, ebr: &Ebr) -> bool {
        let _writer = self.writer.lock();
        let old = self.list.load_full();
        let Some(index) = old.handles.iter().position(|h| *h == handle) else {
            return false;
        };
        let mut handles = old.handles.clone();
        let mut algs = old.algs.clone();
        handles.remove(index);
        let alg = algs.remove(index);
        self.list.store(Arc::new(AlgList { handles, algs }));
        ebr.full_sync();
        debug!("unregistered alg {}", alg.name());
        true
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<AlgList> {
        self.list.load_full()
    }

    /// Ask every ALG for the connection of the packet in `cache`.
    #[must_use]
    pub fn inspect(
        &self,
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Direction,
        conndb: &ConnDb,
    ) -> Option<(Arc<Conn>, FlowDir)> {
        let list = self.list.load();
        list.algs
            .iter()
            .find_map(|alg| alg.inspect(cache, ifid, di, conndb))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use net::cache::{Side, proto};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Follows UDP flows to `port` and counts what it sees.
    #[derive(Default)]
    pub(crate) struct CountingAlg {
        pub port: u16,
        pub translated: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    impl Alg for CountingAlg {
        fn name(&self) -> &str {
            "counting"
        }

        fn matches(&self, cache: &PacketCache, _entry: &NatEntry) -> bool {
            cache.proto() == proto::UDP && cache.port(Side::Dst) == Some(self.port)
        }

        fn translate(
            &self,
            _buf: &mut dyn NetBuffer,
            _cache: &mut PacketCache,
            _entry: &NatEntry,
            _flow: FlowDir,
        ) {
            self.translated.fetch_add(1, Ordering::Relaxed);
        }

        fn inspect(
            &self,
            _cache: &PacketCache,
            _ifid: Option<IfId>,
            _di: Direction,
            _conndb: &ConnDb,
        ) -> Option<(Arc<Conn>, FlowDir)> {
            None
        }

        fn destroy(&self, _entry: &NatEntry) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn register_and_unregister() {
        let registry = AlgRegistry::new();
        let ebr = Ebr::new();
        let first = registry.register(Arc::new(CountingAlg::default()));
        let second = registry.register(Arc::new(CountingAlg::default()));
        assert_ne!(first, second);
        let before = registry.snapshot();
        assert_eq!(before.algs().len(), 2);
        assert!(registry.unregister(first, &ebr));
        assert!(!registry.unregister(first, &ebr));
        assert_eq!(registry.snapshot().algs().len(), 1);
        // snapshots taken before stay intact
        assert_eq!(before.algs().len(), 2);
    }
}
