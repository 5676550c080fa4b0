// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Internet checksum arithmetic.
//!
//! Translation rewrites a few fields of a header. Rather than recomputing checksums over the
//! whole packet, the checksums are adjusted incrementally following RFC 1624:
//! `HC' = ~(~HC + ~m + m')`.

use std::net::IpAddr;

/// Fold a 32-bit one's complement accumulator into 16 bits.
#[must_use]
pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)] // folded above
    let folded = sum as u16;
    folded
}

/// One's complement sum of `data`, read as big-endian 16-bit words, added to `initial`.
///
/// An odd trailing octet is padded with zero. The result is partially folded and can be fed
/// back as `initial` for the next chunk, as long as chunks (but the last) have an even length.
#[must_use]
pub fn sum(data: &[u8], initial: u32) -> u32 {
    let mut acc = u64::from(initial);
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        acc += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        acc += u64::from(u16::from_be_bytes([*last, 0]));
    }
    while acc > 0xffff_ffff {
        acc = (acc & 0xffff_ffff) + (acc >> 32);
    }
    #[allow(clippy::cast_possible_truncation)] // reduced above
    let acc = acc as u32;
    acc
}

/// The checksum of `data` (IPv4 header, `ICMPv4` message).
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum(data, 0))
}

/// One's complement sum of the TCP/UDP/ICMPv6 pseudo-header.
#[must_use]
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: u32) -> u32 {
    let mut acc = match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => sum(&dst.octets(), sum(&src.octets(), 0)),
        (src, dst) => sum(&addr_octets(dst), sum(&addr_octets(src), 0)),
    };
    acc = sum(&len.to_be_bytes(), acc);
    sum(&[0, proto], acc)
}

/// The checksum of an L4 `segment` (checksum field included) with its pseudo-header: zero
/// when the stored checksum is correct.
#[must_use]
pub fn l4_checksum(src: IpAddr, dst: IpAddr, proto: u8, segment: &[u8]) -> u16 {
    #[allow(clippy::cast_possible_truncation)] // IP payloads are below 4 GiB
    let len = segment.len() as u32;
    !fold(sum(segment, pseudo_header_sum(src, dst, proto, len)))
}

/// One's complement addition.
#[must_use]
pub fn add(a: u16, b: u16) -> u16 {
    fold(u32::from(a) + u32::from(b))
}

/// One's complement subtraction.
#[must_use]
pub fn sub(a: u16, b: u16) -> u16 {
    add(a, !b)
}

/// Adjust `cksum` for a 16-bit field changing from `old` to `new`.
#[must_use]
pub fn fixup16(cksum: u16, old: u16, new: u16) -> u16 {
    !fold(u32::from(!cksum) + u32::from(!old) + u32::from(new))
}

/// Adjust `cksum` for a 32-bit field changing from `old` to `new`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // splitting into 16-bit halves
pub fn fixup32(cksum: u16, old: u32, new: u32) -> u16 {
    let cksum = fixup16(cksum, (old >> 16) as u16, (new >> 16) as u16);
    fixup16(cksum, old as u16, new as u16)
}

/// Adjust `cksum` for an address changing from `old` to `new`.
///
/// Both addresses must be of the same family; the checksum is returned unchanged otherwise.
#[must_use]
pub fn fixup_addr(cksum: u16, old: IpAddr, new: IpAddr) -> u16 {
    match (old, new) {
        (IpAddr::V4(old), IpAddr::V4(new)) => fixup32(cksum, old.to_bits(), new.to_bits()),
        (IpAddr::V6(old), IpAddr::V6(new)) => old
            .segments()
            .iter()
            .zip(new.segments())
            .fold(cksum, |cksum, (o, n)| fixup16(cksum, *o, n)),
        _ => cksum,
    }
}

fn addr_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // IPv4 header from RFC 1071 style examples, checksum 0xb861.
    const IP4_HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn header_checksum() {
        assert_eq!(checksum(&IP4_HEADER), 0xb861);
        let mut header = IP4_HEADER;
        header[10..12].copy_from_slice(&0xb861u16.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn incremental_matches_full_recompute() {
        let mut header = IP4_HEADER;
        header[10..12].copy_from_slice(&checksum(&IP4_HEADER).to_be_bytes());
        let old = Ipv4Addr::new(192, 168, 0, 1);
        let new = Ipv4Addr::new(10, 1, 2, 3);
        let fixed = fixup_addr(0xb861, old.into(), new.into());

        header[12..16].copy_from_slice(&new.octets());
        header[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(fixed, checksum(&header));
    }

    #[test]
    fn fixup16_identity_and_inverse() {
        let cksum = 0x1234;
        assert_eq!(fixup16(cksum, 0xabcd, 0xabcd), cksum);
        let there = fixup16(cksum, 0x0050, 0x1f90);
        assert_eq!(fixup16(there, 0x1f90, 0x0050), cksum);
    }

    #[test]
    fn odd_length_is_padded() {
        assert_eq!(sum(&[0x01], 0), 0x0100);
        assert_eq!(sub(add(0x1234, 0x4321), 0x4321), 0x1234);
    }
}
