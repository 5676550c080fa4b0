// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configurations.
//!
//! A [`Config`] is an immutable snapshot built from a [`ConfigDoc`]. It is published atomically
//! and replaced wholesale on reload; packet processing reads it within an epoch.

pub mod doc;
mod load;

pub use doc::ConfigDoc;
pub(crate) use load::{BuildContext, build, save};

use crate::conn::ImportError;
use crate::ext::ExtError;
use crate::nat::{NatError, NatPolicy};
use crate::params::{ParamError, Params};
use crate::ruleset::{Rproc, Ruleset, RulesetError};
use bpf::BpfError;
use std::collections::BTreeMap;
use std::sync::Arc;
use table::{TableError, TableSet};
use tracectl::TraceCtlError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid document: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error("tracing: {0}")]
    Tracing(#[from] TraceCtlError),
    #[error("table {name}: {source}")]
    Table { name: String, source: TableError },
    #[error("rproc {name}: {source}")]
    Rproc { name: String, source: ExtError },
    #[error("rule {rule}: invalid code: {source}")]
    Code { rule: String, source: BpfError },
    #[error("rule {rule}: no rule procedure named {rproc}")]
    NoRproc { rule: String, rproc: String },
    #[error("rule {rule}: no table named {table}")]
    NoTable { rule: String, table: String },
    #[error("rule {rule}: {source}")]
    Nat { rule: String, source: NatError },
    #[error("rule {rule}: a translation policy outside of the nat ruleset")]
    UnexpectedPolicy { rule: String },
    #[error("rule {rule}: nat policy id {id} is used twice")]
    DuplicatePolicy { rule: String, id: u32 },
    #[error(transparent)]
    Ruleset(#[from] RulesetError),
    #[error("connection {index}: {source}")]
    Import { index: usize, source: ImportError },
}

/// A published configuration.
#[derive(Debug, Default)]
pub struct Config {
    pub params: Params,
    pub default_pass: bool,
    pub tables: TableSet,
    pub rprocs: BTreeMap<String, Arc<Rproc>>,
    pub ruleset: Ruleset,
    pub nat_ruleset: Ruleset,
    pub nat_policies: Vec<Arc<NatPolicy>>,
    /// The document the configuration was built from.
    pub(crate) doc: ConfigDoc,
}

impl Config {
    #[must_use]
    pub fn nat_policy(&self, id: u32) -> Option<Arc<NatPolicy>> {
        self.nat_policies
            .iter()
            .find(|policy| policy.id() == id)
            .cloned()
    }
}
