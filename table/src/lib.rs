// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Address tables.
//!
//! A [`Table`] is a set of addresses or prefixes with one of four backends:
//! - [`TableType::Hash`]: exact-match set of host addresses.
//! - [`TableType::Lpm`]: prefixes, looked up by longest-prefix match.
//! - [`TableType::Const`]: exact-match set built once from a compiled image, read-only.
//! - [`TableType::IfAddr`]: append-only list of addresses per family, from which translation
//!   addresses are picked.
//!
//! Tables live in the slots of a [`TableSet`] and are referred to by slot id.

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::module_name_repetitions)]

mod cdb;
mod hash;
mod ifaddr;
mod lpm;
mod tableset;

pub use cdb::ConstTable;
pub use hash::HashTable;
pub use ifaddr::IfAddrTable;
pub use lpm::LpmTable;
pub use tableset::TableSet;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracectl::{LevelFilter, trace_target};
use tracing::debug;

trace_target!("table", LevelFilter::INFO, &["npf"]);

/// Table identifier: the index of its slot in the [`TableSet`].
pub type TableId = u32;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TableType {
    Hash,
    Lpm,
    Const,
    IfAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("entry {0} already exists")]
    Exists(IpNet),
    #[error("entry {0} not found")]
    NotFound(IpNet),
    #[error("table {table}: entry {entry} must be a host address")]
    NotHost { table: String, entry: IpNet },
    #[error("table {0} is read-only")]
    ReadOnly(String),
    #[error("table {name}: operation not supported by {kind} tables")]
    Unsupported { name: String, kind: TableType },
    #[error("table {0}: constant tables are built from an image")]
    NeedsImage(String),
    #[error("malformed constant table image at offset {0}")]
    InvalidImage(usize),
    #[error("table id {0} is out of range")]
    InvalidId(TableId),
    #[error("table id {0} is already in use")]
    IdInUse(TableId),
    #[error("table name {0} is already in use")]
    NameInUse(String),
    #[error("no table named {0}")]
    NoSuchTable(String),
    #[error("table {name} is {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: TableType,
        actual: TableType,
    },
}

#[derive(Debug)]
enum Backend {
    Hash(HashTable),
    Lpm(LpmTable),
    Const(ConstTable),
    IfAddr(IfAddrTable),
}

/// A named address table.
#[derive(Debug)]
pub struct Table {
    name: String,
    id: TableId,
    backend: Backend,
}

fn is_host(entry: &IpNet) -> bool {
    entry.prefix_len() == entry.max_prefix_len()
}

impl Table {
    /// Create an empty table.
    ///
    /// # Errors
    ///
    /// Constant tables cannot be created empty, see [`Table::from_image`].
    pub fn new(
        name: &str,
        id: TableId,
        kind: TableType,
        capacity: usize,
    ) -> Result<Table, TableError> {
        let backend = match kind {
            TableType::Hash => Backend::Hash(HashTable::with_capacity(capacity)),
            TableType::Lpm => Backend::Lpm(LpmTable::new()),
            TableType::IfAddr => Backend::IfAddr(IfAddrTable::new()),
            TableType::Const => return Err(TableError::NeedsImage(name.to_owned())),
        };
        debug!("created {kind} table {name} (id {id})");
        Ok(Table {
            name: name.to_owned(),
            id,
            backend,
        })
    }

    /// Create a constant table from its compiled image (see [`ConstTable::compile`]).
    ///
    /// # Errors
    ///
    /// Fails if the image is malformed.
    pub fn from_image(name: &str, id: TableId, image: &[u8]) -> Result<Table, TableError> {
        let table = ConstTable::from_image(image)?;
        debug!("loaded const table {name} (id {id}) with {} entries", table.len());
        Ok(Table {
            name: name.to_owned(),
            id,
            backend: Backend::Const(table),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TableType {
        match self.backend {
            Backend::Hash(_) => TableType::Hash,
            Backend::Lpm(_) => TableType::Lpm,
            Backend::Const(_) => TableType::Const,
            Backend::IfAddr(_) => TableType::IfAddr,
        }
    }

    pub(crate) fn set_id(&mut self, id: TableId) {
        self.id = id;
    }

    fn unsupported(&self) -> TableError {
        TableError::Unsupported {
            name: self.name.clone(),
            kind: self.kind(),
        }
    }

    /// Add an entry. Only LPM tables take prefixes, the others take host addresses.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate entry (hash and LPM), a prefix given to a host table, or a
    /// read-only table.
    pub fn insert(&self, entry: IpNet) -> Result<(), TableError> {
        if !matches!(self.backend, Backend::Lpm(_)) && !is_host(&entry) {
            return Err(TableError::NotHost {
                table: self.name.clone(),
                entry,
            });
        }
        match &self.backend {
            Backend::Hash(t) => t.insert(entry.addr()),
            Backend::Lpm(t) => t.insert(entry),
            Backend::IfAddr(t) => {
                t.insert(entry.addr());
                Ok(())
            }
            Backend::Const(_) => Err(TableError::ReadOnly(self.name.clone())),
        }
    }

    /// Remove an entry.
    ///
    /// # Errors
    ///
    /// Fails if the entry is not present, or the table does not support removal.
    pub fn remove(&self, entry: IpNet) -> Result<(), TableError> {
        match &self.backend {
            Backend::Hash(t) => t.remove(entry.addr()),
            Backend::Lpm(t) => t.remove(entry),
            Backend::IfAddr(_) => Err(self.unsupported()),
            Backend::Const(_) => Err(TableError::ReadOnly(self.name.clone())),
        }
    }

    /// Whether `addr` is in the table (LPM: covered by some prefix).
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> bool {
        match &self.backend {
            Backend::Hash(t) => t.contains(addr),
            Backend::Lpm(t) => t.lookup(addr).is_some(),
            Backend::Const(t) => t.contains(addr),
            Backend::IfAddr(t) => t.contains(addr),
        }
    }

    /// All entries.
    #[must_use]
    pub fn list(&self) -> Vec<IpNet> {
        match &self.backend {
            Backend::Hash(t) => t.list(),
            Backend::Lpm(t) => t.list(),
            Backend::Const(t) => t.list(),
            Backend::IfAddr(t) => t.list(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Hash(t) => t.len(),
            Backend::Lpm(t) => t.len(),
            Backend::Const(t) => t.len(),
            Backend::IfAddr(t) => t.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    ///
    /// # Errors
    ///
    /// Constant tables cannot be flushed.
    pub fn flush(&self) -> Result<(), TableError> {
        match &self.backend {
            Backend::Hash(t) => t.flush(),
            Backend::Lpm(t) => t.flush(),
            Backend::IfAddr(t) => t.flush(),
            Backend::Const(_) => return Err(TableError::ReadOnly(self.name.clone())),
        }
        debug!("flushed table {}", self.name);
        Ok(())
    }

    /// Pick the `index`-th address of length `alen` (4 or 16), wrapping around. Used to select
    /// translation addresses from a pool.
    ///
    /// # Errors
    ///
    /// Only interface-address and constant tables hold an ordered list of addresses.
    pub fn getsome(&self, alen: u8, index: usize) -> Result<Option<IpAddr>, TableError> {
        match &self.backend {
            Backend::IfAddr(t) => Ok(t.get(alen, index)),
            Backend::Const(t) => Ok(t.get(alen, index)),
            Backend::Hash(_) | Backend::Lpm(_) => {
                debug_assert!(
                    false,
                    "getsome on {} table {} is not supported",
                    self.kind(),
                    self.name
                );
                Err(self.unsupported())
            }
        }
    }

    /// Number of addresses of length `alen` (4 or 16) in the table.
    #[must_use]
    pub fn count(&self, alen: u8) -> usize {
        match &self.backend {
            Backend::IfAddr(t) => t.count(alen),
            Backend::Const(t) => t.count(alen),
            Backend::Hash(_) | Backend::Lpm(_) => self
                .list()
                .iter()
                .filter(|entry| alen_of(entry.addr()) == alen)
                .count(),
        }
    }
}

pub(crate) fn alen_of(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}
