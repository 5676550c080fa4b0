// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing levels.

use crate::LevelFilter;
use crate::targets::TRACE_TARGETS;
use crate::trace_target;
use ordermap::{OrderMap, OrderSet};
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("invalid syntax in '{0}': expected tag=level")]
    Syntax(String),
    #[error("invalid level '{level}' for tag '{tag}'")]
    InvalidLevel { tag: String, level: String },
}

/// Current configuration of a target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub target: &'static str,
    pub name: &'static str,
    pub level: LevelFilter,
    pub tags: Vec<&'static str>,
}

impl TargetConfig {
    fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        // a target can always be addressed by its name
        let mut tags = tags.to_vec();
        if !tags.contains(&name) {
            tags.push(name);
        }
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[derive(Debug)]
struct TargetDb {
    default: LevelFilter,
    targets: OrderMap<&'static str, TargetConfig>,
    tags: OrderMap<&'static str, OrderSet<&'static str>>,
}

impl TargetDb {
    fn from_registry(default: LevelFilter) -> Self {
        let mut db = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for declared in TRACE_TARGETS {
            db.register(TargetConfig::new(
                declared.target,
                declared.name,
                declared.level,
                declared.tags,
            ));
        }
        db
    }

    fn register(&mut self, config: TargetConfig) {
        let target = config.target;
        for tag in &config.tags {
            self.tags.entry(*tag).or_default().insert(target);
        }
        if self.targets.insert(target, config).is_some() {
            warn!("Tracing target {target} is declared more than once");
        }
    }

    fn tagged_mut(&mut self, tag: &str) -> impl Iterator<Item = &mut TargetConfig> {
        let members = self.tags.get(tag).cloned().unwrap_or_default();
        self.targets
            .values_mut()
            .filter(move |config| members.contains(config.target))
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.default.to_string());
        for config in self.targets.values() {
            match format!("{}={}", config.target, config.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => warn!("Skipping tracing target {}: {e}", config.target),
            }
        }
        filter
    }
}

impl Display for TargetDb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "default={}", self.default)?;
        for config in self.targets.values() {
            write!(f, ",{}={}", config.name, config.level)?;
        }
        Ok(())
    }
}

/// Owner of the tracing subscriber and of the per-target levels.
#[derive(Debug)]
pub struct TracingControl {
    db: Mutex<TargetDb>,
    handle: reload::Handle<EnvFilter, Registry>,
}

static TRACING_CONTROL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first use.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CONTROL.get_or_init(TracingControl::new)
}

impl TracingControl {
    fn new() -> Self {
        let db = TargetDb::from_registry(LevelFilter::INFO);
        let (filter, handle) = reload::Layer::new(db.env_filter());
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_names(true)
            .with_level(true);
        if let Err(e) = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
        {
            // A subscriber was installed by someone else, e.g. a test harness.
            warn!("Tracing subscriber not installed: {e}");
        }
        Self {
            db: Mutex::new(db),
            handle,
        }
    }

    pub fn init() {
        get_trace_ctl();
    }

    fn reload(&self, db: &TargetDb) {
        if let Err(e) = self.handle.reload(db.env_filter()) {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    /// Set the level of every target carrying `tag`. Returns the number of targets changed.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> usize {
        let mut db = self.db.lock();
        let mut changed = 0;
        for config in db.tagged_mut(tag) {
            if config.level != level {
                config.level = level;
                changed += 1;
            }
        }
        if changed > 0 {
            self.reload(&db);
        }
        info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
        changed
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        db.targets
            .values_mut()
            .for_each(|config| config.level = level);
        self.reload(&db);
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        if db.default != level {
            db.default = level;
            self.reload(&db);
        }
    }

    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.db.lock().default
    }

    /// Apply a configuration string made of comma-separated `tag=level` items. The `default`
    /// tag sets the default level and the `all` tag sets the level of every target; other tags
    /// are applied afterwards, so `all=info,nat=debug` works as expected.
    ///
    /// # Errors
    ///
    /// Fails without applying anything if an item is malformed or names an unknown level.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let mut levels = OrderMap::new();
        for item in input.split(',').map(str::trim) {
            let (tag, level) = item
                .split_once('=')
                .ok_or_else(|| TraceCtlError::Syntax(item.to_owned()))?;
            let (tag, level) = (tag.trim(), level.trim());
            let parsed =
                LevelFilter::from_str(level).map_err(|_| TraceCtlError::InvalidLevel {
                    tag: tag.to_owned(),
                    level: level.to_owned(),
                })?;
            levels.insert(tag, parsed);
        }
        if let Some(level) = levels.remove("default") {
            self.set_default_level(level);
        }
        if let Some(level) = levels.remove("all") {
            self.set_level_all(level);
        }
        for (tag, level) in levels {
            self.set_tag_level(tag, level);
        }
        Ok(())
    }

    #[must_use]
    pub fn target(&self, target: &str) -> Option<TargetConfig> {
        self.db.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn targets_by_tag(&self, tag: &str) -> Vec<TargetConfig> {
        self.db.lock().tagged_mut(tag).map(|c| c.clone()).collect()
    }

    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        self.db.lock().tags.keys().copied().collect()
    }

    /// A configuration string that reproduces the current levels.
    #[must_use]
    pub fn as_config_string(&self) -> String {
        self.db.lock().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_target;
    use serial_test::serial;

    #[test]
    #[serial]
    fn targets_are_collected_at_link_time() {
        custom_target!("declared-late", LevelFilter::OFF, &["late"]);
        let tctl = get_trace_ctl();
        assert!(tctl.target(module_path!()).is_some());
        assert!(tctl.target("declared-late").is_some());
        assert!(tctl.tags().contains(&"late"));
    }

    #[test]
    #[serial]
    fn tag_level_changes_every_member() {
        const TAG: &str = "common-tag";
        custom_target!("t1", LevelFilter::DEBUG, &[TAG]);
        custom_target!("t2", LevelFilter::ERROR, &[TAG]);
        custom_target!("t3", LevelFilter::WARN, &[]);

        let tctl = get_trace_ctl();
        let members: Vec<_> = tctl.targets_by_tag(TAG).iter().map(|c| c.target).collect();
        assert_eq!(members.len(), 2);
        assert_eq!(tctl.set_tag_level(TAG, LevelFilter::OFF), 2);
        assert_eq!(tctl.target("t1").map(|c| c.level), Some(LevelFilter::OFF));
        assert_eq!(tctl.target("t2").map(|c| c.level), Some(LevelFilter::OFF));
        assert_eq!(tctl.target("t3").map(|c| c.level), Some(LevelFilter::WARN));
        // nothing left to change
        assert_eq!(tctl.set_tag_level(TAG, LevelFilter::OFF), 0);
    }

    #[test]
    #[serial]
    fn setup_from_string() {
        custom_target!("from-string", LevelFilter::INFO, &["fs"]);
        let tctl = get_trace_ctl();
        tctl.setup_from_string("default=warn, all=info, fs=error")
            .unwrap();
        assert_eq!(tctl.default_level(), LevelFilter::WARN);
        assert_eq!(
            tctl.target("from-string").map(|c| c.level),
            Some(LevelFilter::ERROR)
        );
        assert!(tctl.as_config_string().starts_with("default=warn"));

        assert_eq!(
            tctl.setup_from_string("fs=bad"),
            Err(TraceCtlError::InvalidLevel {
                tag: "fs".to_owned(),
                level: "bad".to_owned()
            })
        );
        assert_eq!(
            tctl.setup_from_string("fs=error, foo"),
            Err(TraceCtlError::Syntax("foo".to_owned()))
        );
        tctl.set_default_level(LevelFilter::INFO);
    }
}
