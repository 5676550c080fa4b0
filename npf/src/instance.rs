// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The packet filter instance.
//!
//! [`Npf`] owns everything the filter works with: the published configuration, the connection
//! database, the port maps, the counters and the extension and ALG registries. Packet threads
//! share it by reference (see [`Npf::handle`]); the control plane reloads and edits it through
//! the methods below.

use crate::alg::{Alg, AlgHandle, AlgRegistry};
use crate::config::{BuildContext, Config, ConfigDoc, ConfigError, build, save};
use crate::conn::{ConnDb, ConnInfo, GcMode, export_conns, import_conn};
use crate::ext::{ExtError, ExtHandle, ExtRegistry, Extension};
use crate::nat::PortMaps;
use crate::params::Params;
use crate::ruleset::{Rule, Ruleset, RulesetError};
use crate::stats::{Stats, StatsSnapshot};
use arc_swap::ArcSwap;
use concurrency::Ebr;
use ipnet::IpNet;
use net::interface::IfMap;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::sync::Arc;
use table::{Table, TableError};
use tracing::{debug, info};

pub struct Npf {
    pub(crate) ebr: Ebr,
    pub(crate) config: ArcSwap<Config>,
    /// Serializes reloads.
    writer: Mutex<()>,
    pub(crate) conndb: ConnDb,
    portmaps: Arc<PortMaps>,
    pub(crate) stats: Arc<Stats>,
    ifmap: IfMap,
    exts: ExtRegistry,
    pub(crate) algs: AlgRegistry,
}

impl Debug for Npf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Npf")
            .field("conns", &self.conndb.len())
            .field("ebr", &self.ebr)
            .finish_non_exhaustive()
    }
}

impl Default for Npf {
    fn default() -> Self {
        Self::new()
    }
}

impl Npf {
    /// An instance with an empty configuration, blocking every packet.
    #[must_use]
    pub fn new() -> Self {
        let stats = Arc::new(Stats::new());
        let (min, max) = Params::default().port_range();
        Npf {
            ebr: Ebr::new(),
            config: ArcSwap::from_pointee(Config::default()),
            writer: Mutex::new(()),
            conndb: ConnDb::new(stats.clone()),
            portmaps: Arc::new(PortMaps::new(min, max)),
            stats,
            ifmap: IfMap::new(),
            exts: ExtRegistry::new(),
            algs: AlgRegistry::new(),
        }
    }

    /// The published configuration.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    #[must_use]
    pub fn ifmap(&self) -> &IfMap {
        &self.ifmap
    }

    #[must_use]
    pub fn conndb(&self) -> &ConnDb {
        &self.conndb
    }

    #[must_use]
    pub fn portmaps(&self) -> &PortMaps {
        &self.portmaps
    }

    /// Build the configuration of `doc` and publish it.
    ///
    /// Policies equal to a policy of the current configuration take it over, along with its
    /// translated connections; connections translated by the policies nobody took over are
    /// expired. Dynamic groups keep their rules. The connections of the document are restored.
    ///
    /// Must not be called from within a read section of the instance.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid part of the document; nothing is changed then.
    pub fn load(&self, mut doc: ConfigDoc) -> Result<(), ConfigError> {
        let _writer = self.writer.lock();
        let old = self.config.load_full();
        let conns = std::mem::take(&mut doc.conns);
        let tracing = doc.tracing.clone();
        let built = build(
            doc,
            &BuildContext {
                ifmap: &self.ifmap,
                exts: &self.exts,
                portmaps: &self.portmaps,
                stats: &self.stats,
                old_policies: &old.nat_policies,
            },
        )?;

        let mut imported = Vec::with_capacity(conns.len());
        let imported_all: Result<(), ConfigError> =
            conns.iter().enumerate().try_for_each(|(index, info)| {
                let conn =
                    import_conn(&self.conndb, info, &self.ifmap, |id| built.nat_policy(id))
                        .map_err(|source| ConfigError::Import { index, source })?;
                imported.push(conn);
                Ok(())
            });
        let applied = imported_all.and_then(|()| match &tracing {
            Some(tracing) => Ok(tracectl::get_trace_ctl().setup_from_string(tracing)?),
            None => Ok(()),
        });
        if let Err(err) = applied {
            for conn in &imported {
                self.conndb.remove(conn);
            }
            return Err(err);
        }

        let (config, orphans) = built.commit();
        config.ruleset.adopt(&old.ruleset);
        config.nat_ruleset.adopt(&old.nat_ruleset);
        let (min, max) = config.params.port_range();
        self.portmaps.set_range(min, max);
        self.config.store(Arc::new(config));
        self.ebr.full_sync();
        for policy in &orphans {
            policy.expire_all();
        }
        info!(
            "loaded configuration: {} connections restored, {} policies dropped",
            imported.len(),
            orphans.len()
        );
        Ok(())
    }

    /// Parse a YAML document and [`load`](Npf::load) it.
    ///
    /// # Errors
    ///
    /// Fails if the document is malformed or invalid.
    pub fn load_yaml(&self, yaml: &str) -> Result<(), ConfigError> {
        self.load(ConfigDoc::from_yaml(yaml)?)
    }

    /// The document of the current configuration, with the live table entries, dynamic rules
    /// and connections.
    #[must_use]
    pub fn save(&self) -> ConfigDoc {
        let config = self.config.load();
        save(&config, &self.ifmap, self.conn_export())
    }

    /// Load an empty configuration and drop every connection.
    ///
    /// # Errors
    ///
    /// Fails if the empty configuration cannot be applied.
    pub fn flush(&self) -> Result<(), ConfigError> {
        self.load(ConfigDoc::default())?;
        let config = self.config.load();
        self.conndb.flush(&self.ebr, &config.params);
        self.portmaps.flush();
        debug!("flushed");
        Ok(())
    }

    /// Collect expired connections.
    pub fn gc(&self, mode: GcMode) {
        let config = self.config.load();
        self.conndb.gc(&self.ebr, &config.params, mode);
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn conn_export(&self) -> Vec<ConnInfo> {
        export_conns(&self.conndb, &self.ifmap)
    }

    fn table(config: &Config, name: &str) -> Result<Arc<Table>, TableError> {
        config
            .tables
            .by_name(name)
            .ok_or_else(|| TableError::NoSuchTable(name.to_owned()))
    }

    /// # Errors
    ///
    /// Fails if there is no such table.
    pub fn table_list(&self, name: &str) -> Result<Vec<IpNet>, TableError> {
        Ok(Self::table(&self.config.load(), name)?.list())
    }

    /// # Errors
    ///
    /// Fails if there is no such table, it is read-only, or the entry is already there.
    pub fn table_add(&self, name: &str, entry: IpNet) -> Result<(), TableError> {
        Self::table(&self.config.load(), name)?.insert(entry)
    }

    /// # Errors
    ///
    /// Fails if there is no such table, it is read-only, or the entry is not there.
    pub fn table_remove(&self, name: &str, entry: IpNet) -> Result<(), TableError> {
        Self::table(&self.config.load(), name)?.remove(entry)
    }

    /// # Errors
    ///
    /// Fails if there is no such table.
    pub fn table_lookup(&self, name: &str, addr: IpAddr) -> Result<bool, TableError> {
        Ok(Self::table(&self.config.load(), name)?.lookup(addr))
    }

    /// # Errors
    ///
    /// Fails if there is no such table or it is read-only.
    pub fn table_flush(&self, name: &str) -> Result<(), TableError> {
        Self::table(&self.config.load(), name)?.flush()
    }

    /// Swap in `table` for the table of the same name.
    ///
    /// Must not be called from within a read section of the instance.
    ///
    /// # Errors
    ///
    /// Fails if there is no table of that name and type.
    pub fn table_replace(&self, table: Table) -> Result<(), TableError> {
        let _writer = self.writer.lock();
        let config = self.config.load();
        let old = config.tables.replace(table, &self.ebr)?;
        debug!("table {} replaced, {} entries dropped", old.name(), old.len());
        Ok(())
    }

    /// Run `f` on the ruleset that has the dynamic group `group`. Serialized with reloads, which
    /// carry the rules of dynamic groups over to the new configuration.
    fn with_group<R>(
        &self,
        group: &str,
        f: impl FnOnce(&Ruleset) -> Result<R, RulesetError>,
    ) -> Result<R, RulesetError> {
        let _writer = self.writer.lock();
        let config = self.config.load();
        if config.ruleset.has_group(group) {
            f(&config.ruleset)
        } else {
            f(&config.nat_ruleset)
        }
    }

    /// Add a rule to a dynamic group. Returns the id of the rule.
    ///
    /// # Errors
    ///
    /// Fails if there is no dynamic group of that name.
    pub fn rule_add(&self, group: &str, rule: Rule) -> Result<u64, RulesetError> {
        self.with_group(group, |ruleset| ruleset.rule_add(group, rule))
    }

    /// # Errors
    ///
    /// Fails if there is no such group or rule.
    pub fn rule_remove(&self, group: &str, id: u64) -> Result<Arc<Rule>, RulesetError> {
        self.with_group(group, |ruleset| ruleset.rule_remove(group, id, &self.ebr))
    }

    /// # Errors
    ///
    /// Fails if there is no such group or no rule with that key.
    pub fn rule_remove_key(&self, group: &str, key: &str) -> Result<Arc<Rule>, RulesetError> {
        self.with_group(group, |ruleset| {
            ruleset.rule_remove_key(group, key, &self.ebr)
        })
    }

    /// # Errors
    ///
    /// Fails if there is no such group.
    pub fn rule_list(&self, group: &str) -> Result<Vec<Arc<Rule>>, RulesetError> {
        self.with_group(group, |ruleset| ruleset.rule_list(group))
    }

    /// Remove every rule of a dynamic group. Returns how many there were.
    ///
    /// # Errors
    ///
    /// Fails if there is no such group.
    pub fn rule_flush(&self, group: &str) -> Result<usize, RulesetError> {
        self.with_group(group, |ruleset| ruleset.rule_flush(group, &self.ebr))
    }

    /// # Errors
    ///
    /// Fails if an extension of the same name is registered.
    pub fn ext_register(&self, ext: Arc<dyn Extension>) -> Result<ExtHandle, ExtError> {
        self.exts.register(ext)
    }

    /// # Errors
    ///
    /// Fails while rule procedures use the extension.
    pub fn ext_unregister(&self, handle: ExtHandle) -> Result<(), ExtError> {
        self.exts.unregister(handle)
    }

    pub fn alg_register(&self, alg: Arc<dyn Alg>) -> AlgHandle {
        self.algs.register(alg)
    }

    /// Returns `false` if the handle is unknown.
    pub fn alg_unregister(&self, handle: AlgHandle) -> bool {
        self.algs.unregister(handle, &self.ebr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::tests::PortBlock;
    use crate::ruleset::RuleAttr;
    use net::cache::Direction;
    use net::test_utils::udp;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const DOC: &str = r"
default_pass: false
params:
  portmap.min_port: 2000
  portmap.max_port: 2999
tables:
  - name: trusted
    id: 0
    type: hash
    entries: [10.0.0.5/32]
rules:
  - name: trusted
    attr: [pass, stateful, in]
    interface: eth0
    # source address in table 0
    code:
      - {code: 0, jt: 0, jf: 0, k: 2147483648}
      - {code: 39, jt: 0, jf: 0, k: 1}
      - {code: 22, jt: 0, jf: 0, k: 0}
  - name: blocklist
    attr: [group, dynamic, in]
";

    fn npf() -> Npf {
        let npf = Npf::new();
        npf.ext_register(Arc::new(PortBlock)).unwrap();
        npf
    }

    #[test]
    fn load_and_save() {
        let npf = npf();
        npf.load_yaml(DOC).unwrap();
        let config = npf.config();
        assert!(!config.default_pass);
        assert_eq!(config.ruleset.len(), 2);
        assert_eq!(npf.portmaps().range(), (2000, 2999));

        npf.table_add("trusted", "10.0.0.6/32".parse().unwrap())
            .unwrap();
        assert!(npf.table_lookup("trusted", "10.0.0.6".parse().unwrap()).unwrap());
        assert!(matches!(
            npf.table_lookup("missing", "10.0.0.6".parse().unwrap()),
            Err(TableError::NoSuchTable(_))
        ));
        npf.rule_add("blocklist", Rule::new(RuleAttr::FINAL).with_key("k1"))
            .unwrap();

        let saved = npf.save();
        assert_eq!(saved.tables[0].entries.len(), 2);
        assert_eq!(saved.rules[1].children.len(), 1);
        assert_eq!(saved.rules[1].children[0].key.as_deref(), Some("k1"));

        // a reload of the saved document keeps the dynamic rule once
        npf.load(saved.clone()).unwrap();
        let again = npf.save();
        assert_eq!(again.rules, saved.rules);
        assert_eq!(again.params, saved.params);
        assert_eq!(npf.rule_list("blocklist").unwrap().len(), 1);
        assert!(npf.table_lookup("trusted", "10.0.0.6".parse().unwrap()).unwrap());
    }

    #[test]
    fn a_failed_load_changes_nothing() {
        let npf = npf();
        npf.load_yaml(DOC).unwrap();
        let before = npf.config();
        let err = npf
            .load_yaml("rules: [{name: bad, rproc: missing}]")
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoRproc { .. }), "{err}");
        assert!(Arc::ptr_eq(&before, &npf.config()));
        assert!(npf.load_yaml("params: {gc.step: 0}").is_err());
        assert!(Arc::ptr_eq(&before, &npf.config()));
    }

    const MASQUERADE: &str = r"
default_pass: true
params:
  portmap.min_port: 30000
  portmap.max_port: 30999
nat:
  - name: masquerade
    attr: [out]
    interface: eth1
    policy:
      id: 1
      type: outbound
      flags: [ports, portmap]
      addr: 198.51.100.1
";

    #[test]
    fn a_failed_load_keeps_policies_and_connections() {
        let npf = npf();
        npf.load_yaml(MASQUERADE).unwrap();
        let eth1 = npf.ifmap().lookup("eth1").unwrap();
        let mut pkt = udp(
            "10.0.0.5:4000".parse().unwrap(),
            "203.0.113.9:53".parse().unwrap(),
            b"",
        )
        .with_ifid(eth1);
        npf.handle(&mut pkt, Direction::Out).unwrap();
        let policy = npf.config().nat_policy(1).unwrap();
        let exported = npf.conn_export();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].nat.as_ref().map(|nat| nat.policy), Some(1));
        let saved = npf.save();

        // the policy would be taken over as 9, but a connection cannot be restored
        let renumbered = MASQUERADE
            .replace("id: 1", "id: 9")
            .replace("30999", "31999");
        let mut doc = ConfigDoc::from_yaml(&renumbered).unwrap();
        let mut orphan = exported[0].clone();
        if let Some(nat) = orphan.nat.as_mut() {
            nat.policy = 42;
        }
        doc.conns.push(orphan);
        let err = npf.load(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Import { index: 0, .. }), "{err}");

        // the same, failing on the tracing levels
        let err = npf
            .load_yaml(&format!("{renumbered}tracing: 'npf=loud'\n"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tracing(_)), "{err}");

        assert_eq!(policy.id(), 1);
        assert!(Arc::ptr_eq(&policy, &npf.config().nat_policy(1).unwrap()));
        assert_eq!(npf.portmaps().range(), (30000, 30999));
        assert_eq!(npf.conn_export(), exported);
        let again = npf.save();
        assert_eq!(again.nat, saved.nat);
        assert_eq!(again.conns, saved.conns);

        // what was saved still restores
        let restarted = Npf::new();
        restarted.load(saved).unwrap();
        assert_eq!(restarted.conn_export().len(), 1);
    }

    #[test]
    fn dynamic_rules_added_during_reloads_are_kept() {
        const RULES: usize = 200;
        let npf = Arc::new(npf());
        npf.load_yaml(DOC).unwrap();
        let adder = {
            let npf = npf.clone();
            thread::spawn(move || {
                for i in 0..RULES {
                    let rule = Rule::new(RuleAttr::FINAL).with_key(&format!("k{i}"));
                    npf.rule_add("blocklist", rule).unwrap();
                }
            })
        };
        while !adder.is_finished() {
            npf.load_yaml(DOC).unwrap();
        }
        adder.join().unwrap();
        npf.load_yaml(DOC).unwrap();
        assert_eq!(npf.rule_list("blocklist").unwrap().len(), RULES);
    }

    #[test]
    fn readers_see_one_configuration_across_a_reload() {
        let npf = Arc::new(npf());
        npf.load_yaml(DOC).unwrap();

        let epoch = npf.ebr.enter();
        let seen = npf.config.load_full();
        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let npf = npf.clone();
            let done = done.clone();
            thread::spawn(move || {
                npf.load_yaml("default_pass: true").unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        // the reload cannot complete while this read section is open
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(seen.ruleset.len(), 2);
        assert!(!seen.default_pass);
        drop(epoch);
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));

        let now = npf.config();
        assert!(now.ruleset.is_empty());
        assert!(now.default_pass);
        // the old snapshot is intact for whoever still holds it
        assert_eq!(seen.ruleset.len(), 2);
    }

    #[test]
    fn flush_drops_connections_and_configuration() {
        let npf = npf();
        npf.load_yaml(DOC).unwrap();
        let eth0 = npf.ifmap().lookup("eth0").unwrap();
        let mut pkt = udp(
            "10.0.0.5:4000".parse().unwrap(),
            "10.0.0.1:53".parse().unwrap(),
            b"",
        )
        .with_ifid(eth0);
        npf.handle(&mut pkt, Direction::In).unwrap();
        assert_eq!(npf.conndb().len(), 1);

        npf.flush().unwrap();
        assert!(npf.conndb().is_empty());
        assert!(npf.config().ruleset.is_empty());
        assert!(npf.conn_export().is_empty());
    }

    #[test]
    #[serial]
    fn tracing_levels_follow_the_document() {
        let npf = npf();
        npf.load_yaml("tracing: 'npf=debug'").unwrap();
        let tctl = tracectl::get_trace_ctl();
        assert_eq!(
            tctl.target("npf").map(|c| c.level),
            Some(tracectl::LevelFilter::DEBUG)
        );

        let before = npf.config();
        let err = npf.load_yaml("tracing: 'npf=loud'").unwrap_err();
        assert!(matches!(err, ConfigError::Tracing(_)), "{err}");
        assert!(Arc::ptr_eq(&before, &npf.config()));
        tctl.setup_from_string("npf=info").unwrap();
    }

    #[test]
    fn extensions_in_use_stay_registered() {
        let npf = npf();
        let handle = npf.ext_register(Arc::new(PortBlock));
        assert!(matches!(handle, Err(ExtError::Exists(_))));
        npf.load_yaml(
            r"
rprocs:
  - name: noquery
    calls: [{ext: portblock, params: {ports: '53'}}]
",
        )
        .unwrap();
        assert_eq!(npf.config().rprocs.len(), 1);
    }
}
