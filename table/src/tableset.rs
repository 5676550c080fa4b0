// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The table set: a fixed number of table slots.
//!
//! The slots are allocated when the set is built and never change; a table can only be
//! replaced as a whole, by publishing a new table in its slot. The old table is handed back to
//! the caller once no reader can still be using it.

use crate::{Table, TableError, TableId, TableType};
use arc_swap::ArcSwapOption;
use concurrency::Ebr;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TableSet {
    slots: Box<[ArcSwapOption<Table>]>,
}

impl TableSet {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: TableId) -> Result<&ArcSwapOption<Table>, TableError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or(TableError::InvalidId(id))
    }

    /// Add a table in the slot of its id, while building the set.
    ///
    /// # Errors
    ///
    /// Fails if the id is out of range or taken, or the name is already used.
    pub fn insert(&mut self, table: Table) -> Result<Arc<Table>, TableError> {
        if self.by_name(table.name()).is_some() {
            return Err(TableError::NameInUse(table.name().to_owned()));
        }
        let slot = self.slot(table.id())?;
        if slot.load().is_some() {
            return Err(TableError::IdInUse(table.id()));
        }
        let table = Arc::new(table);
        slot.store(Some(table.clone()));
        Ok(table)
    }

    #[must_use]
    pub fn get(&self, id: TableId) -> Option<Arc<Table>> {
        self.slot(id).ok()?.load_full()
    }

    /// Run `f` on the table with the given id, without taking a reference on it.
    pub fn with_table<R>(&self, id: TableId, f: impl FnOnce(&Table) -> R) -> Option<R> {
        let guard = self.slot(id).ok()?.load();
        guard.as_deref().map(f)
    }

    /// Membership test; `None` if there is no such table.
    #[must_use]
    pub fn lookup(&self, id: TableId, addr: IpAddr) -> Option<bool> {
        self.with_table(id, |table| table.lookup(addr))
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<Table>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .find(|table| table.name() == name)
    }

    #[must_use]
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .collect()
    }

    /// Replace the table of the same name with `table`, which takes over its id.
    ///
    /// Returns the old table once every reader that could have seen it is done.
    ///
    /// # Errors
    ///
    /// Fails if there is no table with that name, or it has a different type.
    pub fn replace(&self, mut table: Table, ebr: &Ebr) -> Result<Arc<Table>, TableError> {
        let current = self
            .by_name(table.name())
            .ok_or_else(|| TableError::NoSuchTable(table.name().to_owned()))?;
        if current.kind() != table.kind() {
            return Err(TableError::TypeMismatch {
                name: table.name().to_owned(),
                expected: current.kind(),
                actual: table.kind(),
            });
        }
        table.set_id(current.id());
        let slot = self.slot(current.id())?;
        let old = slot.swap(Some(Arc::new(table))).unwrap_or(current);
        ebr.full_sync();
        debug!("replaced table {} (id {})", old.name(), old.id());
        Ok(old)
    }

    /// The [`TableType`] of every table, by id.
    #[must_use]
    pub fn kinds(&self) -> Vec<(TableId, TableType)> {
        self.tables()
            .iter()
            .map(|table| (table.id(), table.kind()))
            .collect()
    }
}
