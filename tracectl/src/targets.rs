// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of tracing targets.

use crate::LevelFilter;
use linkme::distributed_slice;

/// A tracing target as declared by one of the registration macros.
#[derive(Debug)]
pub struct TraceTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl TraceTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }

    #[must_use]
    pub const fn target(&self) -> &'static str {
        self.target
    }
}

#[allow(unsafe_code)] // link_section emitted by linkme
#[distributed_slice]
pub static TRACE_TARGETS: [TraceTarget];

/// Declare the tracing target of the calling module, with a short name, a default level and a
/// list of tags.
#[macro_export]
macro_rules! trace_target {
    // The const scope keeps the static name local, so the macro can be used several times per
    // crate.
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            #[allow(unsafe_code)]
            #[$crate::linkme::distributed_slice($crate::targets::TRACE_TARGETS)]
            #[linkme(crate = $crate::linkme)]
            static TRACE_TARGET: $crate::targets::TraceTarget =
                $crate::targets::TraceTarget::new(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a tracing target that does not follow the module path (used with
/// `tracing::event!(target: ...)`).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            #[allow(unsafe_code)]
            #[$crate::linkme::distributed_slice($crate::targets::TRACE_TARGETS)]
            #[linkme(crate = $crate::linkme)]
            static TRACE_TARGET: $crate::targets::TraceTarget =
                $crate::targets::TraceTarget::new($target, $target, $level, $tags);
        };
    };
}
