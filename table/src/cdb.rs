// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Constant table, loaded from a compiled image.
//!
//! The image is a sequence of records, each made of the address length (4 or 16) followed by
//! the address octets in network order.

use crate::{TableError, alen_of};
use ahash::RandomState;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Default)]
pub struct ConstTable {
    set: HashSet<IpAddr, RandomState>,
    v4: Vec<IpAddr>,
    v6: Vec<IpAddr>,
}

impl ConstTable {
    /// Compile `addrs` into an image.
    #[must_use]
    pub fn compile(addrs: &[IpAddr]) -> Vec<u8> {
        let mut image = Vec::with_capacity(addrs.len() * 5);
        for addr in addrs {
            image.push(alen_of(*addr));
            match addr {
                IpAddr::V4(a) => image.extend_from_slice(&a.octets()),
                IpAddr::V6(a) => image.extend_from_slice(&a.octets()),
            }
        }
        image
    }

    /// # Errors
    ///
    /// [`TableError::InvalidImage`] with the offset of the first bad record.
    pub fn from_image(image: &[u8]) -> Result<Self, TableError> {
        let mut table = Self::default();
        let mut offset = 0;
        while offset < image.len() {
            let alen = usize::from(image[offset]);
            let octets = image
                .get(offset + 1..offset + 1 + alen)
                .ok_or(TableError::InvalidImage(offset))?;
            let addr = match alen {
                4 => IpAddr::V4(Ipv4Addr::from(
                    <[u8; 4]>::try_from(octets).map_err(|_| TableError::InvalidImage(offset))?,
                )),
                16 => IpAddr::V6(Ipv6Addr::from(
                    <[u8; 16]>::try_from(octets).map_err(|_| TableError::InvalidImage(offset))?,
                )),
                _ => return Err(TableError::InvalidImage(offset)),
            };
            if table.set.insert(addr) {
                match addr {
                    IpAddr::V4(_) => table.v4.push(addr),
                    IpAddr::V6(_) => table.v6.push(addr),
                }
            }
            offset += 1 + alen;
        }
        Ok(table)
    }

    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.set.contains(&addr)
    }

    fn family(&self, alen: u8) -> &[IpAddr] {
        match alen {
            4 => &self.v4,
            16 => &self.v6,
            _ => &[],
        }
    }

    #[must_use]
    pub fn get(&self, alen: u8, index: usize) -> Option<IpAddr> {
        let list = self.family(alen);
        if list.is_empty() {
            return None;
        }
        list.get(index % list.len()).copied()
    }

    #[must_use]
    pub fn count(&self, alen: u8) -> usize {
        self.family(alen).len()
    }

    #[must_use]
    pub fn list(&self) -> Vec<IpNet> {
        self.v4.iter().chain(&self.v6).map(|a| IpNet::from(*a)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip() {
        let addrs: Vec<IpAddr> = vec![
            "10.1.1.1".parse().unwrap(),
            "2001:db8::5".parse().unwrap(),
            "10.1.1.2".parse().unwrap(),
        ];
        let image = ConstTable::compile(&addrs);
        assert_eq!(image.len(), 5 + 17 + 5);
        let table = ConstTable::from_image(&image).unwrap();
        assert_eq!(table.len(), 3);
        assert!(addrs.iter().all(|a| table.contains(*a)));
        assert!(!table.contains("10.1.1.3".parse().unwrap()));
        assert_eq!(table.get(4, 1), Some(addrs[2]));
        assert_eq!(table.count(16), 1);
    }

    #[test]
    fn malformed_images() {
        assert_eq!(
            ConstTable::from_image(&[4, 10, 0, 0]).unwrap_err(),
            TableError::InvalidImage(0)
        );
        assert_eq!(
            ConstTable::from_image(&[4, 10, 0, 0, 1, 6, 1]).unwrap_err(),
            TableError::InvalidImage(5)
        );
        assert!(ConstTable::from_image(&[]).unwrap().is_empty());
    }
}
