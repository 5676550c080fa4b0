// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet filter counters.
//!
//! Each thread increments its own set of counters; a snapshot sums them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};
use thread_local::ThreadLocal;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum NpfStat {
    /// Passed by the default rule.
    PassDefault,
    /// Passed by a rule.
    PassRuleset,
    /// Passed by an existing connection.
    PassConn,
    BlockDefault,
    BlockRuleset,
    ConnCreate,
    ConnDestroy,
    NatCreate,
    NatDestroy,
    /// Packet did not match the state of its connection.
    InvalidState,
    /// TCP segment beyond the upper boundary of the window.
    InvalidStateTcp1,
    /// TCP segment below the lower boundary of the window.
    InvalidStateTcp2,
    /// TCP acknowledgement out of bounds.
    InvalidStateTcp3,
    /// Lost a race to insert a new connection.
    RaceConn,
    /// Lost a race to associate a translation with a connection.
    RaceNat,
    /// Headers had to be made contiguous.
    NbufNonContig,
    /// Headers could not be made contiguous.
    NbufContigFail,
    Fragmented,
    Error,
}

type Counters = [AtomicU64; NpfStat::COUNT];

#[derive(Debug, Default)]
pub struct Stats {
    counters: ThreadLocal<Counters>,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn local(&self) -> &Counters {
        self.counters
            .get_or(|| std::array::from_fn(|_| AtomicU64::new(0)))
    }

    pub fn inc(&self, stat: NpfStat) {
        self.add(stat, 1);
    }

    pub fn add(&self, stat: NpfStat, count: u64) {
        self.local()[stat as usize].fetch_add(count, Ordering::Relaxed);
    }

    /// Current value of one counter.
    #[must_use]
    pub fn get(&self, stat: NpfStat) -> u64 {
        self.counters
            .iter()
            .map(|counters| counters[stat as usize].load(Ordering::Relaxed))
            .sum()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut values = [0; NpfStat::COUNT];
        for counters in &self.counters {
            for (total, counter) in values.iter_mut().zip(counters) {
                *total += counter.load(Ordering::Relaxed);
            }
        }
        StatsSnapshot { values }
    }
}

/// Counter values at some point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; NpfStat::COUNT],
}

impl StatsSnapshot {
    #[must_use]
    pub fn get(&self, stat: NpfStat) -> u64 {
        self.values[stat as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NpfStat, u64)> + '_ {
        NpfStat::iter().map(|stat| (stat, self.get(stat)))
    }
}

impl Serialize for StatsSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let flat: BTreeMap<&'static str, u64> = self
            .iter()
            .map(|(stat, value)| (<&'static str>::from(stat), value))
            .collect();
        flat.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counters_sum_over_threads() {
        let stats = Arc::new(Stats::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inc(NpfStat::PassConn);
                    }
                    stats.add(NpfStat::Error, 2);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get(NpfStat::PassConn), 4000);
        assert_eq!(snapshot.get(NpfStat::Error), 8);
        assert_eq!(stats.get(NpfStat::PassConn), 4000);
        assert_eq!(snapshot.get(NpfStat::RaceNat), 0);
    }

    #[test]
    fn snapshot_is_flat() {
        let stats = Stats::new();
        stats.inc(NpfStat::InvalidStateTcp1);
        let yaml = serde_yaml_ng::to_string(&stats.snapshot()).unwrap();
        assert!(yaml.contains("invalid_state_tcp1: 1"), "{yaml}");
        assert_eq!(NpfStat::NbufContigFail.to_string(), "nbuf_contig_fail");
    }
}
