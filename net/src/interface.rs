// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface identifiers.
//!
//! Rules and connections refer to interfaces by small integer ids rather than by name. The
//! [`IfMap`] hands out a stable id per name: a name keeps its id even after the interface goes
//! away, so that state referring to it remains meaningful if it comes back.

use ahash::RandomState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use tracing::debug;

/// Small integer identifying an interface. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IfId(u32);

impl IfId {
    /// Wrap a raw interface id.
    #[must_use]
    pub const fn new(id: u32) -> IfId {
        IfId(id)
    }

    /// The raw interface id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Display for IfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct IfMapInner {
    by_name: HashMap<String, IfId, RandomState>,
    names: Vec<String>,
}

/// Name to id mapping of interfaces.
#[derive(Debug, Default)]
pub struct IfMap {
    inner: RwLock<IfMapInner>,
}

impl IfMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> IfMap {
        IfMap::default()
    }

    /// Get the id of `name`, assigning a new one if the name was never seen.
    pub fn register(&self, name: &str) -> IfId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.by_name.get(name) {
            return *id;
        }
        inner.names.push(name.to_owned());
        #[allow(clippy::cast_possible_truncation)] // never that many interfaces
        let id = IfId(inner.names.len() as u32);
        inner.by_name.insert(name.to_owned(), id);
        debug!("interface {name} registered as {id}");
        id
    }

    /// Get the id of `name`, if known.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<IfId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Get the name of the interface with id `id`.
    #[must_use]
    pub fn name(&self, id: IfId) -> Option<String> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.inner.read().names.get(index).cloned()
    }

    /// Forget every interface. Ids handed out before are no longer meaningful.
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.by_name.clear();
        inner.names.clear();
    }
}
