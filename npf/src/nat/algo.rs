// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Translation address selection.

use crate::nat::{NatAlgo, NatError, NatParams};
use ahash::RandomState;
use net::cache::PacketCache;
use net::checksum;
use std::hash::BuildHasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use table::TableSet;

fn hasher_state() -> &'static RandomState {
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

fn alen(addr: IpAddr) -> u8 {
    if addr.is_ipv4() { 4 } else { 16 }
}

/// `(orig & !mask) | (net & mask)`, with `mask` the prefix mask of length `prefix`.
///
/// Returns `orig` unchanged if the families differ.
#[must_use]
pub fn netmap(orig: IpAddr, net: IpAddr, prefix: u8) -> IpAddr {
    match (orig, net) {
        (IpAddr::V4(orig), IpAddr::V4(net)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from_bits(
                (orig.to_bits() & !mask) | (net.to_bits() & mask),
            ))
        }
        (IpAddr::V6(orig), IpAddr::V6(net)) => {
            let mask = u128::MAX
                .checked_shl(128 - u32::from(prefix.min(128)))
                .unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from_bits(
                (orig.to_bits() & !mask) | (net.to_bits() & mask),
            ))
        }
        (orig, _) => orig,
    }
}

/// IPv6 prefix translation without checksum impact (RFC 6296).
///
/// The first `prefix` bits of `orig` are replaced with those of `net`, and the first 16-bit word
/// after the prefix (at least the fourth one) that is not `0xffff` is adjusted so that the one's
/// complement sum of the address is unchanged. Returns `None` if there is no such word.
#[must_use]
pub fn npt66(orig: Ipv6Addr, net: Ipv6Addr, prefix: u8) -> Option<Ipv6Addr> {
    let IpAddr::V6(mapped) = netmap(IpAddr::V6(orig), IpAddr::V6(net), prefix) else {
        return None;
    };
    let old_sum = checksum::fold(checksum::sum(&orig.octets(), 0));
    let new_sum = checksum::fold(checksum::sum(&mapped.octets(), 0));
    let mut words = mapped.segments();
    let first = usize::from(prefix).div_ceil(16).max(3);
    let word = words.get_mut(first..)?.iter_mut().find(|word| **word != 0xffff)?;
    *word = checksum::add(*word, checksum::sub(old_sum, new_sum));
    if *word == 0xffff {
        *word = 0;
    }
    Some(Ipv6Addr::from(words))
}

/// Pick the translation address of a new entry for the packet in `cache`, whose original
/// address is `orig`.
///
/// # Errors
///
/// Fails if the pool table is missing or has no address of the family of the packet.
pub(crate) fn select(
    params: &NatParams,
    tables: &TableSet,
    cache: &PacketCache,
    rr: &AtomicUsize,
    orig: IpAddr,
) -> Result<IpAddr, NatError> {
    let addr = match params.table {
        Some(id) => {
            let table = tables.get(id).ok_or(NatError::NoTable(id))?;
            let alen = cache.alen();
            let count = table.count(alen);
            if count == 0 {
                return Err(NatError::NoAddress);
            }
            let index = match params.algo {
                NatAlgo::IpHash => {
                    let hash = hasher_state().hash_one((cache.src(), cache.dst()));
                    usize::try_from(hash % count as u64).unwrap_or(0)
                }
                NatAlgo::RoundRobin => rr.fetch_add(1, Ordering::Relaxed) % count,
                NatAlgo::None | NatAlgo::Netmap | NatAlgo::Npt66 => 0,
            };
            table
                .getsome(alen, index)
                .map_err(NatError::Table)?
                .ok_or(NatError::NoAddress)?
        }
        None => match params.algo {
            NatAlgo::Netmap => netmap(orig, params.addr, params.prefix),
            _ => params.addr,
        },
    };
    if alen(addr) != alen(orig) {
        return Err(NatError::FamilyMismatch);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmap_keeps_host_bits() {
        assert_eq!(
            netmap(
                "10.1.2.3".parse().unwrap(),
                "192.168.0.0".parse().unwrap(),
                16
            ),
            "192.168.2.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            netmap(
                "10.1.2.3".parse().unwrap(),
                "192.168.7.7".parse().unwrap(),
                32
            ),
            "192.168.7.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            netmap(
                "10.1.2.3".parse().unwrap(),
                "192.168.7.7".parse().unwrap(),
                0
            ),
            "10.1.2.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            netmap(
                "2001:db8:1::5".parse().unwrap(),
                "fd00:aaaa::".parse().unwrap(),
                32
            ),
            "fd00:aaaa:1::5".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn npt66_is_checksum_neutral() {
        let inside: Ipv6Addr = "fd01:0203:0405:0001::1234".parse().unwrap();
        let outside: Ipv6Addr = "2001:0db8:0001::".parse().unwrap();
        let mapped = npt66(inside, outside, 48).unwrap();
        let segments = mapped.segments();
        assert_eq!(&segments[..3], &[0x2001, 0x0db8, 0x0001]);
        assert_ne!(segments[3], 0x0001);
        assert_eq!(&segments[4..], &inside.segments()[4..]);
        assert_eq!(
            checksum::fold(checksum::sum(&mapped.octets(), 0)),
            checksum::fold(checksum::sum(&inside.octets(), 0))
        );
        // and back
        assert_eq!(npt66(mapped, "fd01:0203:0405::".parse().unwrap(), 48), Some(inside));
    }

    #[test]
    fn npt66_skips_all_ones_words() {
        let inside: Ipv6Addr = "fd01::ffff:1:2:3:4".parse().unwrap();
        let mapped = npt66(inside, "2001:db8::".parse().unwrap(), 48).unwrap();
        assert_eq!(mapped.segments()[3], 0xffff);
        assert_eq!(
            checksum::fold(checksum::sum(&mapped.octets(), 0)),
            checksum::fold(checksum::sum(&inside.octets(), 0))
        );
    }
}
