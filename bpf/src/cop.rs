// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Coprocessor calls.

use crate::MEMWORDS;
use crate::vm::BpfArgs;
use net::cache::CacheFlags;
use tracing::trace;

/// Fill memory words with L3/L4 information.
pub const COP_L3: u32 = 0;
/// Table membership lookup.
pub const COP_TABLE: u32 = 1;
/// Number of coprocessor functions.
pub const NCOPROCS: usize = 2;

/// Memory word receiving the IP version (4, 6, or 0 if not IP).
pub const MW_IPVER: usize = 0;
/// Memory word receiving the offset of the L4 header.
pub const MW_L4OFF: usize = 1;
/// Memory word receiving the L4 protocol.
pub const MW_L4PROTO: usize = 2;

/// Selects the source address for [`COP_TABLE`]; the destination otherwise.
pub const TABLE_SRC: u32 = 0x8000_0000;

fn cop_l3(args: &BpfArgs<'_>, mem: &mut [u32; MEMWORDS]) -> u32 {
    let cache = args.cache;
    let ipver = if cache.is(CacheFlags::IP4) {
        4
    } else if cache.is(CacheFlags::IP6) {
        6
    } else {
        0
    };
    mem[MW_IPVER] = ipver;
    if ipver != 0 {
        mem[MW_L4OFF] = u32::try_from(cache.l4_offset()).unwrap_or(u32::MAX);
        mem[MW_L4PROTO] = u32::from(cache.proto());
    } else {
        mem[MW_L4OFF] = 0;
        mem[MW_L4PROTO] = 0;
    }
    ipver
}

fn cop_table(args: &BpfArgs<'_>, a: u32) -> u32 {
    let cache = args.cache;
    if !cache.is_ip() {
        return 0;
    }
    let Some(tables) = args.tables else {
        return 0;
    };
    let tid = a & !TABLE_SRC;
    let addr = if a & TABLE_SRC != 0 {
        cache.src()
    } else {
        cache.dst()
    };
    let hit = tables.lookup(tid, addr);
    if hit.is_none() {
        trace!("table coprocessor: no table with id {tid}");
    }
    u32::from(hit.unwrap_or(false))
}

/// Run coprocessor `func`; the result is loaded in A.
pub(crate) fn call(func: u32, args: &BpfArgs<'_>, mem: &mut [u32; MEMWORDS], a: u32) -> u32 {
    match func {
        COP_L3 => cop_l3(args, mem),
        COP_TABLE => cop_table(args, a),
        _ => 0,
    }
}
