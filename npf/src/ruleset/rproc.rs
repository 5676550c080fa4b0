// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rule procedures.

use crate::ext::{ExtError, ExtMeta, ExtParams, ExtRef, ExtRegistry, MatchInfo};
use crate::handler::Decision;
use net::buffer::NetBuffer;
use net::cache::PacketCache;
use std::fmt::{Debug, Formatter};
use tracing::trace;

/// One extension call of a rule procedure, with its metadata.
pub struct RprocCall {
    ext: ExtRef,
    meta: Option<ExtMeta>,
}

impl Drop for RprocCall {
    fn drop(&mut self) {
        if let Some(meta) = self.meta.take() {
            self.ext.ext().dtor(meta);
        }
    }
}

/// A named list of extension calls, run in order on the packets a rule concluded on.
pub struct Rproc {
    name: String,
    calls: Vec<RprocCall>,
}

impl Debug for Rproc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rproc")
            .field("name", &self.name)
            .field(
                "calls",
                &self
                    .calls
                    .iter()
                    .map(|call| call.ext.ext().name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Rproc {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Append a call of the extension `ext`.
    ///
    /// # Errors
    ///
    /// Fails if the extension is not registered or rejects the parameters.
    pub fn add_call(
        &mut self,
        exts: &ExtRegistry,
        ext: &str,
        params: &ExtParams,
    ) -> Result<(), ExtError> {
        let ext = exts.get(ext)?;
        let meta = ext.ext().ctor(params)?;
        self.calls.push(RprocCall {
            ext,
            meta: Some(meta),
        });
        Ok(())
    }

    /// Run the calls in order until one of them asks to stop.
    pub fn run(
        &self,
        buf: &mut dyn NetBuffer,
        cache: &PacketCache,
        info: &MatchInfo,
        decision: &mut Decision,
    ) {
        for call in &self.calls {
            let Some(meta) = &call.meta else {
                continue;
            };
            if !call.ext.ext().process(buf, cache, meta, info, decision) {
                trace!("rproc {}: stopped by {}", self.name, call.ext.ext().name());
                break;
            }
        }
    }
}
