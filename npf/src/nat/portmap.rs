// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port maps: which ports of a translation address are in use.
//!
//! The 65536 ports are split in 32 ranges of 2048 ports, each with one level-0 word. A word
//! starts in the small form, holding up to four port offsets packed inline. When a fifth port
//! is needed, the word is migrated to a level-1 bitmap of 2048 bits and points to it from then
//! on. All updates are compare-and-swap loops on the level-0 word or atomic bit operations on
//! the bitmap.

use ahash::RandomState;
use concurrency::sync::Arc;
use concurrency::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::sync::OnceLock;
use tracing::{debug, trace};

#[cfg(not(feature = "shuttle"))]
use rand::Rng;
#[cfg(feature = "shuttle")]
use shuttle::rand::{Rng, thread_rng};

const L0_WORDS: usize = 32;
const PORTS_PER_L0: usize = 65536 / L0_WORDS;
const L1_WORDS: usize = PORTS_PER_L0 / 64;

const TAG_SHIFT: u32 = 62;
const TAG_MASK: u64 = 0b11 << TAG_SHIFT;
const TAG_SMALL: u64 = 0b00 << TAG_SHIFT;
const TAG_MIGRATING: u64 = 0b01 << TAG_SHIFT;
const TAG_L1: u64 = 0b10 << TAG_SHIFT;

const SMALL_SLOTS: usize = 4;
const SLOT_BITS: u32 = 12;
const SLOT_VALID: u64 = 1 << 11;
const SLOT_OFFSET: u64 = SLOT_VALID - 1;

type L1Bitmap = Box<[AtomicU64; L1_WORDS]>;

#[allow(clippy::cast_possible_truncation)] // index < SMALL_SLOTS
fn slot_shift(index: usize) -> u32 {
    SLOT_BITS * index as u32
}

fn slot(word: u64, index: usize) -> u64 {
    (word >> slot_shift(index)) & ((1 << SLOT_BITS) - 1)
}

fn small_find(word: u64, offset: u64) -> Option<usize> {
    (0..SMALL_SLOTS).find(|&index| slot(word, index) == (SLOT_VALID | offset))
}

fn small_free(word: u64) -> Option<usize> {
    (0..SMALL_SLOTS).find(|&index| slot(word, index) & SLOT_VALID == 0)
}

const OFFSET_MASK: u16 = 2047;

fn split(port: u16) -> (usize, u64) {
    (usize::from(port) / PORTS_PER_L0, u64::from(port & OFFSET_MASK))
}

fn yield_now() {
    concurrency::thread::yield_now();
}

/// Port bitmap of one address.
pub struct PortMap {
    l0: [AtomicU64; L0_WORDS],
    l1: [OnceLock<L1Bitmap>; L0_WORDS],
}

impl Debug for PortMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bitmaps = self.l1.iter().filter(|l1| l1.get().is_some()).count();
        write!(f, "PortMap {{ bitmaps: {bitmaps} }}")
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            l0: std::array::from_fn(|_| AtomicU64::new(TAG_SMALL)),
            l1: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    fn bitmap(&self, index: usize) -> &[AtomicU64; L1_WORDS] {
        self.l1[index].get_or_init(|| Box::new(std::array::from_fn(|_| AtomicU64::new(0))))
    }

    fn bit(offset: u64) -> (usize, u64) {
        // offset < 2048
        #[allow(clippy::cast_possible_truncation)]
        let word = (offset / 64) as usize;
        (word, 1 << (offset % 64))
    }

    // Move the inline ports of a full small word to its bitmap.
    fn migrate(&self, index: usize, word: u64) {
        let bitmap = self.bitmap(index);
        for i in 0..SMALL_SLOTS {
            let entry = slot(word, i);
            if entry & SLOT_VALID != 0 {
                let (at, mask) = Self::bit(entry & SLOT_OFFSET);
                bitmap[at].fetch_or(mask, Ordering::AcqRel);
            }
        }
        self.l0[index].store(TAG_L1, Ordering::Release);
        trace!("port map range {index} migrated to a bitmap");
    }

    /// Mark `port` as used. Returns `false` if it already was.
    pub fn test_and_set(&self, port: u16) -> bool {
        let (index, offset) = split(port);
        loop {
            let word = self.l0[index].load(Ordering::Acquire);
            match word & TAG_MASK {
                TAG_L1 => {
                    let (at, mask) = Self::bit(offset);
                    let old = self.bitmap(index)[at].fetch_or(mask, Ordering::AcqRel);
                    return old & mask == 0;
                }
                TAG_MIGRATING => yield_now(),
                _ => {
                    if small_find(word, offset).is_some() {
                        return false;
                    }
                    if let Some(free) = small_free(word) {
                        let shift = slot_shift(free);
                        let new = word | ((SLOT_VALID | offset) << shift);
                        if self.l0[index]
                            .compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return true;
                        }
                    } else if self.l0[index]
                        .compare_exchange(word, TAG_MIGRATING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.migrate(index, word);
                    }
                }
            }
        }
    }

    /// Mark `port` as free. Returns `false` if it was not in use.
    pub fn clear(&self, port: u16) -> bool {
        let (index, offset) = split(port);
        loop {
            let word = self.l0[index].load(Ordering::Acquire);
            match word & TAG_MASK {
                TAG_L1 => {
                    let (at, mask) = Self::bit(offset);
                    let old = self.bitmap(index)[at].fetch_and(!mask, Ordering::AcqRel);
                    return old & mask != 0;
                }
                TAG_MIGRATING => yield_now(),
                _ => {
                    let Some(found) = small_find(word, offset) else {
                        return false;
                    };
                    let new = word & !(((1 << SLOT_BITS) - 1) << slot_shift(found));
                    if self.l0[index]
                        .compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn is_set(&self, port: u16) -> bool {
        let (index, offset) = split(port);
        loop {
            let word = self.l0[index].load(Ordering::Acquire);
            match word & TAG_MASK {
                TAG_L1 => {
                    let (at, mask) = Self::bit(offset);
                    return self.bitmap(index)[at].load(Ordering::Acquire) & mask != 0;
                }
                TAG_MIGRATING => yield_now(),
                _ => return small_find(word, offset).is_some(),
            }
        }
    }
}

#[cfg(not(feature = "shuttle"))]
fn random_index(len: usize) -> usize {
    rand::rng().random_range(0..len)
}

#[cfg(feature = "shuttle")]
fn random_index(len: usize) -> usize {
    thread_rng().r#gen::<usize>() % len
}

/// The port maps of all translation addresses, created on first use.
#[derive(Debug)]
pub struct PortMaps {
    maps: DashMap<IpAddr, Arc<PortMap>, RandomState>,
    range: RwLock<(u16, u16)>,
}

impl PortMaps {
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            maps: DashMap::with_hasher(RandomState::new()),
            range: RwLock::new((min, max)),
        }
    }

    /// Set the range of ports handed out by [`PortMaps::get`].
    pub fn set_range(&self, min: u16, max: u16) {
        *self.range.write() = (min, max);
    }

    #[must_use]
    pub fn range(&self) -> (u16, u16) {
        *self.range.read()
    }

    fn map(&self, addr: IpAddr) -> Arc<PortMap> {
        self.maps
            .entry(addr)
            .or_insert_with(|| Arc::new(PortMap::new()))
            .clone()
    }

    /// Allocate a free port of `addr`, starting the search at a random port of the range.
    ///
    /// Returns `None` if every port of the range is in use.
    #[must_use]
    pub fn get(&self, addr: IpAddr) -> Option<u16> {
        let (min, max) = self.range();
        if min > max {
            return None;
        }
        let map = self.map(addr);
        let len = usize::from(max - min) + 1;
        let start = random_index(len);
        let port = (0..len)
            .map(|i| (start + i) % len)
            .filter_map(|i| u16::try_from(i).ok())
            .map(|i| min + i)
            .find(|&port| map.test_and_set(port));
        if port.is_none() {
            debug!("no free port left for {addr} in {min}..={max}");
        }
        port
    }

    /// Reserve a given port of `addr`. Returns `false` if it is already in use.
    pub fn take(&self, addr: IpAddr, port: u16) -> bool {
        self.map(addr).test_and_set(port)
    }

    /// Release a port of `addr`.
    pub fn put(&self, addr: IpAddr, port: u16) {
        if let Some(map) = self.maps.get(&addr).map(|map| map.clone()) {
            if !map.clear(port) {
                debug!("released port {port} of {addr} was not in use");
            }
        }
    }

    /// Forget every port map.
    pub fn flush(&self) {
        self.maps.clear();
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    #[test]
    fn small_then_bitmap() {
        let map = PortMap::new();
        for port in [10, 11, 12, 13] {
            assert!(map.test_and_set(port));
        }
        assert!(!map.test_and_set(12));
        assert_eq!(map.l0[0].load(Ordering::Relaxed) & TAG_MASK, TAG_SMALL);
        assert!(map.test_and_set(14));
        assert_eq!(map.l0[0].load(Ordering::Relaxed) & TAG_MASK, TAG_L1);
        for port in 10..=14 {
            assert!(map.is_set(port));
        }
        assert!(map.clear(12));
        assert!(!map.clear(12));
        assert!(!map.is_set(12));
        assert!(map.test_and_set(12));
        // other ranges are untouched
        assert!(!map.is_set(2048 + 10));
        assert!(map.test_and_set(65535));
        assert!(map.is_set(65535));
    }

    #[test]
    fn small_clear_frees_a_slot() {
        let map = PortMap::new();
        for port in [1, 2, 3, 4] {
            assert!(map.test_and_set(port));
        }
        assert!(map.clear(2));
        assert!(map.test_and_set(5));
        assert_eq!(map.l0[0].load(Ordering::Relaxed) & TAG_MASK, TAG_SMALL);
        assert!(!map.is_set(2));
    }

    #[test]
    fn concurrent_gets_are_distinct_then_exhausted() {
        let maps = Arc::new(PortMaps::new(2000, 2999));
        let addr: IpAddr = "198.51.100.1".parse().unwrap();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let maps = maps.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|_| maps.get(addr).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = BTreeSet::new();
        for worker in workers {
            for port in worker.join().unwrap() {
                assert!((2000..=2999).contains(&port));
                assert!(all.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(all.len(), 1000);
        assert_eq!(maps.get(addr), None);

        maps.put(addr, 2500);
        assert_eq!(maps.get(addr), Some(2500));
        assert!(!maps.take(addr, 2500));
        // other addresses have their own map
        assert!(maps.get("198.51.100.2".parse().unwrap()).is_some());
    }
}

#[cfg(all(test, feature = "shuttle"))]
mod shuttle_tests {
    use super::*;
    use concurrency::thread;

    #[test]
    fn concurrent_set_and_migrate() {
        shuttle::check_random(
            || {
                let map = Arc::new(PortMap::new());
                let workers: Vec<_> = (0..3u16)
                    .map(|t| {
                        let map = map.clone();
                        thread::spawn(move || {
                            let mut won = Vec::new();
                            for port in 0..4u16 {
                                if map.test_and_set(port + t) {
                                    won.push(port + t);
                                }
                            }
                            won
                        })
                    })
                    .collect();
                let mut all: Vec<u16> = workers
                    .into_iter()
                    .flat_map(|worker| worker.join().unwrap())
                    .collect();
                all.sort_unstable();
                assert_eq!(all, (0..7).collect::<Vec<_>>());
                for port in 0..7 {
                    assert!(map.is_set(port));
                    assert!(map.clear(port));
                }
                assert!(!map.is_set(3));
            },
            1000,
        );
    }
}
