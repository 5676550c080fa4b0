// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rule procedure extensions.
//!
//! An [`Extension`] is a named plugin run by rule procedures on the packets their rules
//! concluded on. Each call of an extension in a rule procedure gets its own metadata, built by
//! [`Extension::ctor`] from the parameters of the call when the configuration is loaded.

use crate::handler::Decision;
use ahash::RandomState;
use net::buffer::NetBuffer;
use net::cache::{Direction, PacketCache};
use net::interface::IfId;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Parameters of one extension call, as written in the configuration.
pub type ExtParams = BTreeMap<String, String>;

/// Per-call state of an extension.
pub type ExtMeta = Box<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtError {
    #[error("extension {0} is already registered")]
    Exists(String),
    #[error("no extension named {0}")]
    NotFound(String),
    #[error("extension {name} is used by {refs} rule procedure calls")]
    InUse { name: String, refs: usize },
    #[error("extension {name}: invalid parameter {param}: {reason}")]
    InvalidParam {
        name: String,
        param: String,
        reason: String,
    },
}

/// What a rule procedure knows about the packet it runs on.
#[derive(Debug, Clone, Copy)]
pub struct MatchInfo {
    /// Id of the rule that concluded, if it was a dynamic one.
    pub rule_id: Option<u64>,
    pub ifid: Option<IfId>,
    pub di: Direction,
}

pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Build the metadata of a call from its parameters.
    ///
    /// # Errors
    ///
    /// Fails on unknown or malformed parameters.
    fn ctor(&self, params: &ExtParams) -> Result<ExtMeta, ExtError>;

    /// Release the metadata of a call.
    fn dtor(&self, meta: ExtMeta) {
        drop(meta);
    }

    /// Process a packet. May change `decision`. Returns `false` to skip the remaining calls of
    /// the rule procedure.
    fn process(
        &self,
        buf: &mut dyn NetBuffer,
        cache: &PacketCache,
        meta: &ExtMeta,
        info: &MatchInfo,
        decision: &mut Decision,
    ) -> bool;
}

/// Opaque handle of a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtHandle(u64);

struct Registered {
    handle: ExtHandle,
    ext: Arc<dyn Extension>,
    refs: Arc<AtomicUsize>,
}

/// A counted reference to a registered extension, held by rule procedure calls.
pub struct ExtRef {
    ext: Arc<dyn Extension>,
    refs: Arc<AtomicUsize>,
}

impl ExtRef {
    #[must_use]
    pub fn ext(&self) -> &dyn Extension {
        &*self.ext
    }
}

impl Debug for ExtRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ExtRef").field(&self.ext.name()).finish()
    }
}

impl Drop for ExtRef {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct ExtRegistry {
    exts: RwLock<HashMap<String, Registered, RandomState>>,
    next: AtomicU64,
}

impl Debug for ExtRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.exts.read().keys()).finish()
    }
}

impl ExtRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Fails if an extension with the same name is registered.
    pub fn register(&self, ext: Arc<dyn Extension>) -> Result<ExtHandle, ExtError> {
        let name = ext.name().to_owned();
        let mut exts = self.exts.write();
        if exts.contains_key(&name) {
            return Err(ExtError::Exists(name));
        }
        let handle = ExtHandle(self.next.fetch_add(1, Ordering::Relaxed));
        exts.insert(
            name.clone(),
            Registered {
                handle,
                ext,
                refs: Arc::new(AtomicUsize::new(0)),
            },
        );
        debug!("registered extension {name}");
        Ok(handle)
    }

    /// # Errors
    ///
    /// Fails if the handle is stale, or if rule procedures still use the extension.
    pub fn unregister(&self, handle: ExtHandle) -> Result<(), ExtError> {
        let mut exts = self.exts.write();
        let Some((name, registered)) = exts.iter().find(|(_, reg)| reg.handle == handle) else {
            return Err(ExtError::NotFound(format!("{handle:?}")));
        };
        let refs = registered.refs.load(Ordering::Acquire);
        if refs > 0 {
            return Err(ExtError::InUse {
                name: name.clone(),
                refs,
            });
        }
        let name = name.clone();
        exts.remove(&name);
        debug!("unregistered extension {name}");
        Ok(())
    }

    /// Take a reference on the extension named `name`.
    ///
    /// # Errors
    ///
    /// Fails if there is no such extension.
    pub fn get(&self, name: &str) -> Result<ExtRef, ExtError> {
        let exts = self.exts.read();
        let registered = exts
            .get(name)
            .ok_or_else(|| ExtError::NotFound(name.to_owned()))?;
        registered.refs.fetch_add(1, Ordering::AcqRel);
        Ok(ExtRef {
            ext: registered.ext.clone(),
            refs: registered.refs.clone(),
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.exts.read().keys().cloned().collect();
        names.sort();
        names
    }
}
