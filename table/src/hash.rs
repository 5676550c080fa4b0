// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Exact-match table.

use crate::TableError;
use ahash::RandomState;
use dashmap::DashSet;
use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct HashTable {
    entries: DashSet<IpAddr, RandomState>,
}

impl HashTable {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashSet::with_capacity_and_hasher(capacity, RandomState::new()),
        }
    }

    /// # Errors
    ///
    /// [`TableError::Exists`] if the address is already present.
    pub fn insert(&self, addr: IpAddr) -> Result<(), TableError> {
        if self.entries.insert(addr) {
            Ok(())
        } else {
            Err(TableError::Exists(IpNet::from(addr)))
        }
    }

    /// # Errors
    ///
    /// [`TableError::NotFound`] if the address is not present.
    pub fn remove(&self, addr: IpAddr) -> Result<(), TableError> {
        self.entries
            .remove(&addr)
            .map(|_| ())
            .ok_or(TableError::NotFound(IpNet::from(addr)))
    }

    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries.contains(&addr)
    }

    #[must_use]
    pub fn list(&self) -> Vec<IpNet> {
        self.entries.iter().map(|addr| IpNet::from(*addr)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_is_an_error() {
        let table = HashTable::with_capacity(4);
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        table.insert(addr).unwrap();
        assert_eq!(table.insert(addr), Err(TableError::Exists(addr.into())));
        assert!(table.contains(addr));
        assert_eq!(table.list(), vec![IpNet::from(addr)]);
        table.remove(addr).unwrap();
        assert_eq!(table.remove(addr), Err(TableError::NotFound(addr.into())));
        assert!(table.is_empty());
    }
}
