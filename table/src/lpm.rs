// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Longest-prefix-match table, one prefix trie per address family.

use crate::TableError;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;
use prefix_trie::{Prefix, PrefixMap};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;

struct Prefixes<P: Prefix> {
    trie: PrefixMap<P, ()>,
    count: usize,
}

impl<P: Prefix + Clone> Prefixes<P> {
    fn new() -> Self {
        Self {
            trie: PrefixMap::new(),
            count: 0,
        }
    }

    fn insert(&mut self, prefix: P) -> bool {
        if self.trie.get(&prefix).is_some() {
            return false;
        }
        self.trie.insert(prefix, ());
        self.count += 1;
        true
    }

    fn remove(&mut self, prefix: &P) -> bool {
        let removed = self.trie.remove(prefix).is_some();
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn lookup(&self, host: &P) -> Option<P> {
        self.trie.get_lpm(host).map(|(prefix, ())| prefix.clone())
    }

    fn entries(&self) -> impl Iterator<Item = &P> + '_ {
        self.trie.iter().map(|(prefix, ())| prefix)
    }

    fn flush(&mut self) {
        *self = Self::new();
    }
}

pub struct LpmTable {
    v4: RwLock<Prefixes<Ipv4Net>>,
    v6: RwLock<Prefixes<Ipv6Net>>,
}

impl Debug for LpmTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpmTable")
            .field("v4", &self.v4.read().count)
            .field("v6", &self.v6.read().count)
            .finish()
    }
}

impl Default for LpmTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LpmTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            v4: RwLock::new(Prefixes::new()),
            v6: RwLock::new(Prefixes::new()),
        }
    }

    /// Host bits of `prefix` are ignored.
    ///
    /// # Errors
    ///
    /// [`TableError::Exists`] if the prefix is already present.
    pub fn insert(&self, prefix: IpNet) -> Result<(), TableError> {
        let prefix = prefix.trunc();
        let inserted = match prefix {
            IpNet::V4(n) => self.v4.write().insert(n),
            IpNet::V6(n) => self.v6.write().insert(n),
        };
        if inserted {
            Ok(())
        } else {
            Err(TableError::Exists(prefix))
        }
    }

    /// # Errors
    ///
    /// [`TableError::NotFound`] if the prefix is not present.
    pub fn remove(&self, prefix: IpNet) -> Result<(), TableError> {
        let prefix = prefix.trunc();
        let removed = match prefix {
            IpNet::V4(n) => self.v4.write().remove(&n),
            IpNet::V6(n) => self.v6.write().remove(&n),
        };
        if removed {
            Ok(())
        } else {
            Err(TableError::NotFound(prefix))
        }
    }

    /// The longest prefix covering `addr`.
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<IpNet> {
        match addr {
            IpAddr::V4(a) => self.v4.read().lookup(&Ipv4Net::from(a)).map(IpNet::V4),
            IpAddr::V6(a) => self.v6.read().lookup(&Ipv6Net::from(a)).map(IpNet::V6),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<IpNet> {
        let v4 = self.v4.read();
        let v6 = self.v6.read();
        v4.entries()
            .map(|n| IpNet::V4(*n))
            .chain(v6.entries().map(|n| IpNet::V6(*n)))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.v4.read().count + self.v6.read().count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        self.v4.write().flush();
        self.v6.write().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn check_172_16(table: &LpmTable) {
        assert_eq!(table.lookup(addr("172.16.90.1")), Some(net("172.16.90.0/25")));
        assert_eq!(table.lookup(addr("172.16.90.127")), Some(net("172.16.90.0/25")));
        assert_eq!(table.lookup(addr("172.16.90.128")), Some(net("172.16.0.0/16")));
        assert_eq!(table.lookup(addr("172.16.1.1")), Some(net("172.16.0.0/16")));
        assert_eq!(table.lookup(addr("172.17.0.1")), None);
    }

    #[test]
    fn longest_match_independent_of_insertion_order() {
        let table = LpmTable::new();
        table.insert(net("172.16.0.0/16")).unwrap();
        table.insert(net("172.16.90.0/25")).unwrap();
        check_172_16(&table);

        let table = LpmTable::new();
        table.insert(net("172.16.90.0/25")).unwrap();
        table.insert(net("172.16.0.0/16")).unwrap();
        check_172_16(&table);

        table.remove(net("172.16.90.0/25")).unwrap();
        assert_eq!(table.lookup(addr("172.16.90.1")), Some(net("172.16.0.0/16")));
        assert_eq!(
            table.remove(net("172.16.90.0/25")),
            Err(TableError::NotFound(net("172.16.90.0/25")))
        );
    }

    #[test]
    fn host_bits_are_ignored() {
        let table = LpmTable::new();
        table.insert(net("10.1.2.3/8")).unwrap();
        assert_eq!(
            table.insert(net("10.0.0.0/8")),
            Err(TableError::Exists(net("10.0.0.0/8")))
        );
        assert_eq!(table.list(), vec![net("10.0.0.0/8")]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn default_route_and_ipv6() {
        let table = LpmTable::new();
        table.insert(net("0.0.0.0/0")).unwrap();
        table.insert(net("2001:db8::/32")).unwrap();
        table.insert(net("2001:db8:1::/48")).unwrap();
        table.insert(net("2001:db8:1::1/128")).unwrap();
        assert_eq!(table.lookup(addr("8.8.8.8")), Some(net("0.0.0.0/0")));
        assert_eq!(table.lookup(addr("2001:db8:1::1")), Some(net("2001:db8:1::1/128")));
        assert_eq!(table.lookup(addr("2001:db8:1::2")), Some(net("2001:db8:1::/48")));
        assert_eq!(table.lookup(addr("2001:db8:2::1")), Some(net("2001:db8::/32")));
        assert_eq!(table.lookup(addr("2001:db9::1")), None);
        table.flush();
        assert!(table.is_empty());
        assert_eq!(table.lookup(addr("8.8.8.8")), None);
    }

    #[test]
    fn matches_linear_scan() {
        bolero::check!()
            .with_type::<(Vec<(u32, u8)>, Vec<u32>)>()
            .for_each(|(prefixes, probes)| {
                let table = LpmTable::new();
                let mut nets = Vec::new();
                for (a, len) in prefixes {
                    let Ok(n) = Ipv4Net::new(Ipv4Addr::from(*a), len % 33) else {
                        continue;
                    };
                    let n = IpNet::V4(n.trunc());
                    if table.insert(n).is_ok() {
                        nets.push(n);
                    }
                }
                for probe in probes {
                    let probe = IpAddr::V4(Ipv4Addr::from(*probe));
                    let expected = nets
                        .iter()
                        .filter(|n| n.contains(&probe))
                        .max_by_key(|n| n.prefix_len())
                        .copied();
                    assert_eq!(table.lookup(probe), expected);
                }
            });
    }
}
