// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(unsafe_code)] // Parsing of untrusted input should always be strictly safe
#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Packet access for the packet filter.
//!
//! This crate provides the boundary between the filter and the host packet buffers
//! ([`buffer::NetBuffer`]), the parsed per-packet view used by every later stage
//! ([`cache::PacketCache`]), incremental checksum arithmetic and the mapping of interface names
//! to small integer ids.
//!
//! Packets are always seen from their network (IP) header onwards.

pub mod buffer;
pub mod cache;
pub mod checksum;
pub mod interface;
#[cfg(any(test, feature = "test_buffer"))]
pub mod test_utils;

pub use cache::{CacheFlags, Direction, PacketCache, Side};
pub use interface::{IfId, IfMap};

use tracectl::{LevelFilter, trace_target};
trace_target!("net", LevelFilter::INFO, &["npf"]);
