// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A stateful packet filter with network address translation.
//!
//! An [`Npf`] instance filters the packets handed to [`Npf::handle`] according to its
//! configuration: a ruleset of classic BPF programs over address [tables](table), a NAT
//! ruleset of translation policies, and rule procedures run on matched packets. Passed flows are
//! tracked in a connection database ([`conn::ConnDb`]), so that their further packets skip the
//! ruleset, and translated consistently in both directions ([`nat`]).
//!
//! Configurations are built from a [`ConfigDoc`] and published atomically; packet threads read
//! them within an epoch of the instance, and a reload only returns once no packet thread can
//! still see the old configuration. Expired connections are collected by a [`Worker`].

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::module_name_repetitions)]

pub mod alg;
pub mod config;
pub mod conn;
pub mod ext;
pub mod handler;
pub mod instance;
pub mod nat;
pub mod params;
pub mod ruleset;
pub mod state;
pub mod stats;
pub mod worker;

pub use config::{Config, ConfigDoc, ConfigError};
pub use handler::{Decision, NpfError, PASS_TAG, Verdict};
pub use instance::Npf;
pub use params::{Param, Params};
pub use stats::{NpfStat, Stats, StatsSnapshot};
pub use worker::{Worker, WorkerError};

use tracectl::{LevelFilter, trace_target};
trace_target!("npf", LevelFilter::INFO, &["npf"]);
