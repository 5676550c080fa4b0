// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface address table: per-family append-only lists.

use ipnet::IpNet;
use parking_lot::RwLock;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct IfAddrTable {
    v4: RwLock<Vec<IpAddr>>,
    v6: RwLock<Vec<IpAddr>>,
}

impl IfAddrTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&self, alen: u8) -> Option<&RwLock<Vec<IpAddr>>> {
        match alen {
            4 => Some(&self.v4),
            16 => Some(&self.v6),
            _ => None,
        }
    }

    /// Duplicates are kept.
    pub fn insert(&self, addr: IpAddr) {
        match addr {
            IpAddr::V4(_) => self.v4.write().push(addr),
            IpAddr::V6(_) => self.v6.write().push(addr),
        }
    }

    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let list = match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        list.read().contains(&addr)
    }

    /// The `index`-th address of the family, modulo the number of addresses.
    #[must_use]
    pub fn get(&self, alen: u8, index: usize) -> Option<IpAddr> {
        let list = self.family(alen)?.read();
        if list.is_empty() {
            return None;
        }
        list.get(index % list.len()).copied()
    }

    #[must_use]
    pub fn count(&self, alen: u8) -> usize {
        self.family(alen).map_or(0, |list| list.read().len())
    }

    #[must_use]
    pub fn list(&self) -> Vec<IpNet> {
        let v4 = self.v4.read();
        let v6 = self.v6.read();
        v4.iter().chain(v6.iter()).map(|a| IpNet::from(*a)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.v4.read().len() + self.v6.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        self.v4.write().clear();
        self.v6.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_wraps_around() {
        let table = IfAddrTable::new();
        assert_eq!(table.get(4, 0), None);
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();
        let c: IpAddr = "2001:db8::1".parse().unwrap();
        table.insert(a);
        table.insert(b);
        table.insert(c);
        assert_eq!(table.get(4, 0), Some(a));
        assert_eq!(table.get(4, 1), Some(b));
        assert_eq!(table.get(4, 2), Some(a));
        assert_eq!(table.get(16, 5), Some(c));
        assert_eq!(table.get(7, 0), None);
        assert!(table.contains(b));
        assert_eq!(table.len(), 3);
    }
}
