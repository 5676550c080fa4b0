// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Epoch-based reclamation (EBR)
//!
//! Readers call [`Ebr::enter`] before dereferencing a shared structure and keep the returned
//! [`EpochGuard`] alive for as long as they use it. A writer that unpublished a structure calls
//! [`Ebr::full_sync`], which returns only once every reader that could have observed the old
//! structure has left its read section. The old structure can then be destroyed.
//!
//! The global epoch only ever grows. A reader records the epoch it observed when entering. The
//! epoch can advance only when all active readers have observed the current one, so two
//! advances after an unpublish guarantee that no reader from before the unpublish is left.
//!
//! Reader slots are per thread (see [`thread_local::ThreadLocal`]), and read sections nest.
//! This module always uses `std` atomics: its slots are keyed by OS thread, which shuttle does
//! not model.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use std::time::Duration;
use thread_local::ThreadLocal;
use tracing::{trace, warn};

const ACTIVE: u64 = 1;

// Spins before a synchronizing writer starts to sleep between attempts.
const SPIN_LIMIT: u32 = 64;
const SYNC_BACKOFF: Duration = Duration::from_micros(100);

#[derive(Debug, Default)]
struct ReaderSlot {
    // 0 when not in a read section, (epoch << 1) | ACTIVE otherwise.
    state: AtomicU64,
    // Nesting depth, only modified by the owning thread.
    depth: AtomicU32,
}

impl ReaderSlot {
    fn observed_epoch(&self) -> Option<u64> {
        let state = self.state.load(Ordering::Acquire);
        (state & ACTIVE == ACTIVE).then_some(state >> 1)
    }
}

/// An epoch-based reclamation domain.
pub struct Ebr {
    epoch: AtomicU64,
    readers: ThreadLocal<ReaderSlot>,
}

impl Debug for Ebr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ebr")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a read section. The section ends when the guard is dropped.
///
/// Guards are bound to the thread that created them.
#[must_use = "the read section ends as soon as the guard is dropped"]
pub struct EpochGuard<'a> {
    slot: &'a ReaderSlot,
    _not_send: PhantomData<*const ()>,
}

impl Debug for EpochGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochGuard")
            .field("epoch", &self.slot.observed_epoch())
            .finish()
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        if self.slot.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.slot.state.store(0, Ordering::Release);
        }
    }
}

impl Ebr {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            readers: ThreadLocal::new(),
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Enter a read section.
    pub fn enter(&self) -> EpochGuard<'_> {
        let slot = self.readers.get_or(ReaderSlot::default);
        if slot.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            let epoch = self.epoch.load(Ordering::Relaxed);
            slot.state.store((epoch << 1) | ACTIVE, Ordering::Relaxed);
            // Publish the slot before any load of a shared pointer in the read section.
            fence(Ordering::SeqCst);
        }
        EpochGuard {
            slot,
            _not_send: PhantomData,
        }
    }

    /// Whether the calling thread is currently in a read section.
    #[must_use]
    pub fn in_read_section(&self) -> bool {
        self.readers
            .get()
            .is_some_and(|slot| slot.depth.load(Ordering::Relaxed) > 0)
    }

    /// Try to advance the global epoch.
    ///
    /// Returns `true` if the epoch advanced, `false` if some reader has not yet observed the
    /// current epoch.
    pub fn sync(&self) -> bool {
        fence(Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::Acquire);
        let lagging = self
            .readers
            .iter()
            .filter_map(ReaderSlot::observed_epoch)
            .any(|observed| observed != epoch);
        if lagging {
            return false;
        }
        // Losing the race against another writer is fine: the epoch advanced either way.
        let _ = self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Relaxed);
        true
    }

    /// Block until every reader that might have been in a read section when this function was
    /// called has left it.
    ///
    /// Must not be called from within a read section: the caller would wait on itself.
    pub fn full_sync(&self) {
        if self.in_read_section() {
            warn!("full_sync: called from within a read section, this would never complete");
            return;
        }
        let target = self.epoch() + 2;
        let mut attempts: u32 = 0;
        while self.epoch() < target {
            if self.sync() {
                continue;
            }
            attempts = attempts.saturating_add(1);
            if attempts < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(SYNC_BACKOFF);
            }
        }
        trace!("full_sync: reached epoch {target} after {attempts} failed attempts");
    }
}
