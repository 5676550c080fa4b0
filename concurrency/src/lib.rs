// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(missing_docs)]

//! Concurrency building blocks shared by the packet filter crates.
//!
//! - [`sync`] re-exports either `std::sync` or `shuttle::sync` so that code written against it
//!   can be model-checked with the `shuttle` feature.
//! - [`ebr`] implements epoch-based reclamation: readers enter an epoch before touching shared
//!   structures and writers wait for a full epoch sync before destroying what they unpublished.
//! - [`lfstack`] is a push-only lock-free stack, drained in one go by its single consumer.

pub mod ebr;
pub mod lfstack;

pub use ebr::{Ebr, EpochGuard};
pub use lfstack::LfStack;

#[cfg(not(feature = "shuttle"))]
pub use std::sync;

#[cfg(not(feature = "shuttle"))]
pub use std::thread;

#[cfg(feature = "shuttle")]
pub use shuttle::sync;

#[cfg(feature = "shuttle")]
pub use shuttle::thread;
