// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing for the packet filter crates.
//!
//! Every crate declares its tracing targets with [`trace_target!`] (or [`custom_target!`]). The
//! declarations are collected at link time, so [`TracingControl`] knows about all of them without
//! any explicit registration call, and the log level of any target or group of targets (tag) can
//! be changed while running.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::module_name_repetitions)]

pub mod control;
pub mod targets;

pub use control::{TraceCtlError, TracingControl, get_trace_ctl};
pub use tracing_subscriber::filter::LevelFilter;

#[doc(hidden)]
pub use linkme;
