// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Building a [`Config`] from a [`ConfigDoc`], and back.

use crate::config::doc::{PolicyDoc, PolicyFlag, RuleDoc, RuleFlag, TableDoc, rule_attr, rule_flags};
use crate::config::{Config, ConfigDoc, ConfigError};
use crate::conn::ConnInfo;
use crate::ext::ExtRegistry;
use crate::nat::{NatFlags, NatParams, NatPolicy, PortMaps};
use crate::params::Params;
use crate::ruleset::{Rproc, Rule, RuleAttr, Ruleset};
use crate::stats::Stats;
use bpf::Program;
use net::interface::IfMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use table::{ConstTable, Table, TableError, TableSet, TableType};
use tracing::debug;

/// What building a configuration needs besides the document.
pub(crate) struct BuildContext<'a> {
    pub ifmap: &'a IfMap,
    pub exts: &'a ExtRegistry,
    pub portmaps: &'a Arc<PortMaps>,
    pub stats: &'a Arc<Stats>,
    /// Policies of the configuration being replaced. A new policy with the same parameters as
    /// one of them takes it over, with its entries.
    pub old_policies: &'a [Arc<NatPolicy>],
}

pub(crate) struct Built {
    pub config: Config,
    /// Old policies no new policy took over.
    pub orphans: Vec<Arc<NatPolicy>>,
    /// Old policies taken over, with the id they get once the configuration is published. They
    /// are still live in the current configuration, so their ids are left alone until then.
    renumbered: Vec<(Arc<NatPolicy>, u32)>,
}

impl Built {
    fn id_of(&self, policy: &Arc<NatPolicy>) -> u32 {
        self.renumbered
            .iter()
            .find(|(adopted, _)| Arc::ptr_eq(adopted, policy))
            .map_or_else(|| policy.id(), |(_, id)| *id)
    }

    /// The policy of the new configuration with the given id.
    pub fn nat_policy(&self, id: u32) -> Option<Arc<NatPolicy>> {
        self.config
            .nat_policies
            .iter()
            .find(|policy| self.id_of(policy) == id)
            .cloned()
    }

    /// Give the adopted policies their new ids. Must be the last step before publishing.
    pub fn commit(self) -> (Config, Vec<Arc<NatPolicy>>) {
        for (policy, id) in &self.renumbered {
            policy.set_id(*id);
        }
        (self.config, self.orphans)
    }
}

fn build_table(doc: &TableDoc) -> Result<Table, TableError> {
    if doc.kind == TableType::Const {
        let mut addrs = Vec::with_capacity(doc.entries.len());
        for entry in &doc.entries {
            if entry.prefix_len() != entry.max_prefix_len() {
                return Err(TableError::NotHost {
                    table: doc.name.clone(),
                    entry: *entry,
                });
            }
            addrs.push(entry.addr());
        }
        return Table::from_image(&doc.name, doc.id, &ConstTable::compile(&addrs));
    }
    let table = Table::new(&doc.name, doc.id, doc.kind, doc.entries.len())?;
    for entry in &doc.entries {
        table.insert(*entry)?;
    }
    Ok(table)
}

fn build_tables(docs: &[TableDoc]) -> Result<TableSet, ConfigError> {
    let capacity = docs
        .iter()
        .filter_map(|doc| usize::try_from(doc.id).ok())
        .map(|id| id + 1)
        .max()
        .unwrap_or(0);
    let mut tables = TableSet::new(capacity);
    for doc in docs {
        build_table(doc)
            .and_then(|table| tables.insert(table))
            .map_err(|source| ConfigError::Table {
                name: doc.name.clone(),
                source,
            })?;
    }
    Ok(tables)
}

struct Builder<'a, 'b> {
    ctx: &'b BuildContext<'a>,
    tables: &'b TableSet,
    rprocs: &'b BTreeMap<String, Arc<Rproc>>,
    available: Vec<Arc<NatPolicy>>,
    policies: Vec<Arc<NatPolicy>>,
    adopted: Vec<(Arc<NatPolicy>, u32)>,
    /// Initial rules of dynamic groups.
    dynamic: Vec<(String, Vec<Rule>)>,
}

impl Builder<'_, '_> {
    fn rule(&mut self, doc: &RuleDoc, label: &str, nat: bool) -> Result<Rule, ConfigError> {
        let label = doc.name.clone().unwrap_or_else(|| label.to_owned());
        let attr = rule_attr(&doc.attr);
        let mut rule = Rule::new(attr).with_priority(doc.priority);
        if let Some(name) = &doc.name {
            rule = rule.with_name(name);
        }
        if let Some(interface) = &doc.interface {
            rule = rule.with_ifid(self.ctx.ifmap.register(interface));
        }
        if !doc.code.is_empty() {
            let code = Program::new(doc.code.clone()).map_err(|source| ConfigError::Code {
                rule: label.clone(),
                source,
            })?;
            rule = rule.with_code(code);
        }
        if let Some(rproc) = &doc.rproc {
            let rproc = self
                .rprocs
                .get(rproc)
                .ok_or_else(|| ConfigError::NoRproc {
                    rule: label.clone(),
                    rproc: rproc.clone(),
                })?;
            rule = rule.with_rproc(rproc.clone());
        }
        if let Some(key) = &doc.key {
            rule = rule.with_key(key);
        }
        if let Some(policy) = &doc.policy {
            if !nat {
                return Err(ConfigError::UnexpectedPolicy { rule: label });
            }
            rule = rule.with_nat(self.policy(policy, &label)?);
        }
        let children = doc
            .children
            .iter()
            .enumerate()
            .map(|(index, child)| self.rule(child, &format!("{label}/{index}"), nat))
            .collect::<Result<Vec<_>, _>>()?;
        if attr.contains(RuleAttr::GROUP | RuleAttr::DYNAMIC) {
            if !children.is_empty() {
                self.dynamic.push((label, children));
            }
        } else {
            rule = rule.with_children(children);
        }
        Ok(rule)
    }

    fn policy(&mut self, doc: &PolicyDoc, label: &str) -> Result<Arc<NatPolicy>, ConfigError> {
        let nat_err = |source| ConfigError::Nat {
            rule: label.to_owned(),
            source,
        };
        if self.policies.iter().any(|policy| policy.id() == doc.id)
            || self.adopted.iter().any(|(_, id)| *id == doc.id)
        {
            return Err(ConfigError::DuplicatePolicy {
                rule: label.to_owned(),
                id: doc.id,
            });
        }
        let table = match &doc.table {
            Some(name) => {
                let table = self
                    .tables
                    .by_name(name)
                    .ok_or_else(|| ConfigError::NoTable {
                        rule: label.to_owned(),
                        table: name.clone(),
                    })?;
                if !matches!(table.kind(), TableType::IfAddr | TableType::Const) {
                    return Err(ConfigError::Table {
                        name: name.clone(),
                        source: TableError::TypeMismatch {
                            name: name.clone(),
                            expected: TableType::IfAddr,
                            actual: table.kind(),
                        },
                    });
                }
                Some(table.id())
            }
            None => None,
        };
        let params = NatParams {
            kind: doc.kind,
            flags: doc
                .flags
                .iter()
                .fold(NatFlags::empty(), |flags, flag| flags | NatFlags::from(*flag)),
            addr: doc.addr,
            prefix: doc
                .prefix
                .unwrap_or(if doc.addr.is_ipv4() { 32 } else { 128 }),
            table,
            port: doc.port,
            algo: doc.algo,
        };
        let policy = match self
            .available
            .iter()
            .position(|old| *old.params() == params)
        {
            Some(index) => {
                let policy = self.available.swap_remove(index);
                self.adopted.push((policy.clone(), doc.id));
                policy
            }
            None => {
                let policy = NatPolicy::new(
                    doc.id,
                    params,
                    self.ctx.portmaps.clone(),
                    self.ctx.stats.clone(),
                )
                .map_err(nat_err)?;
                let policy = Arc::new(policy);
                self.policies.push(policy.clone());
                policy
            }
        };
        Ok(policy)
    }

    fn ruleset(
        &mut self,
        docs: &[RuleDoc],
        prefix: &str,
        nat: bool,
    ) -> Result<Ruleset, ConfigError> {
        self.dynamic.clear();
        let rules = docs
            .iter()
            .enumerate()
            .map(|(index, doc)| self.rule(doc, &format!("{prefix}#{index}"), nat))
            .collect::<Result<Vec<_>, _>>()?;
        let ruleset = Ruleset::new(rules)?;
        for (group, rules) in self.dynamic.drain(..) {
            for rule in rules {
                ruleset.rule_add(&group, rule)?;
            }
        }
        Ok(ruleset)
    }
}

/// Build the configuration described by `doc`. Nothing is published.
pub(crate) fn build(doc: ConfigDoc, ctx: &BuildContext<'_>) -> Result<Built, ConfigError> {
    let mut params = Params::default();
    for (name, value) in &doc.params {
        params.set_by_name(name, *value)?;
    }
    params.validate()?;

    let tables = build_tables(&doc.tables)?;

    let mut rprocs = BTreeMap::new();
    for rproc_doc in &doc.rprocs {
        let mut rproc = Rproc::new(&rproc_doc.name);
        for call in &rproc_doc.calls {
            rproc
                .add_call(ctx.exts, &call.ext, &call.params)
                .map_err(|source| ConfigError::Rproc {
                    name: rproc_doc.name.clone(),
                    source,
                })?;
        }
        rprocs.insert(rproc_doc.name.clone(), Arc::new(rproc));
    }

    let mut builder = Builder {
        ctx,
        tables: &tables,
        rprocs: &rprocs,
        available: ctx.old_policies.to_vec(),
        policies: Vec::new(),
        adopted: Vec::new(),
        dynamic: Vec::new(),
    };
    let ruleset = builder.ruleset(&doc.rules, "rule", false)?;
    let nat_ruleset = builder.ruleset(&doc.nat, "nat", true)?;

    let Builder {
        available,
        mut policies,
        adopted,
        ..
    } = builder;
    policies.extend(adopted.iter().map(|(policy, _)| policy.clone()));
    debug!(
        "built configuration: {} rules, {} nat rules, {} tables, {} policies ({} orphaned)",
        ruleset.len(),
        nat_ruleset.len(),
        tables.tables().len(),
        policies.len(),
        available.len()
    );
    Ok(Built {
        config: Config {
            params,
            default_pass: doc.default_pass,
            tables,
            rprocs,
            ruleset,
            nat_ruleset,
            nat_policies: policies,
            doc,
        },
        orphans: available,
        renumbered: adopted,
    })
}

fn policy_doc(policy: &NatPolicy, tables: &TableSet) -> PolicyDoc {
    let params = policy.params();
    let flags = [PolicyFlag::Ports, PolicyFlag::Portmap, PolicyFlag::Static]
        .into_iter()
        .filter(|flag| params.flags.contains(NatFlags::from(*flag)))
        .collect();
    PolicyDoc {
        id: policy.id(),
        kind: params.kind,
        flags,
        addr: params.addr,
        prefix: Some(params.prefix),
        table: params
            .table
            .and_then(|id| tables.get(id))
            .map(|table| table.name().to_owned()),
        port: params.port,
        algo: params.algo,
    }
}

fn rule_doc(rule: &Rule, ifmap: &IfMap, tables: &TableSet) -> RuleDoc {
    RuleDoc {
        name: rule.name().map(str::to_owned),
        attr: rule_flags(rule.attr()),
        priority: rule.priority(),
        interface: rule.ifid().and_then(|ifid| ifmap.name(ifid)),
        code: rule
            .code()
            .map(|code| code.insns().to_vec())
            .unwrap_or_default(),
        rproc: rule.rproc().map(|rproc| rproc.name().to_owned()),
        key: rule.key().map(str::to_owned),
        policy: rule.nat().map(|policy| policy_doc(policy, tables)),
        children: Vec::new(),
    }
}

fn save_dynamic(docs: &mut [RuleDoc], ruleset: &Ruleset, ifmap: &IfMap, tables: &TableSet) {
    for doc in docs {
        let dynamic = doc.attr.contains(&RuleFlag::Group) && doc.attr.contains(&RuleFlag::Dynamic);
        match (&doc.name, dynamic) {
            (Some(name), true) => {
                if let Ok(rules) = ruleset.rule_list(name) {
                    doc.children = rules
                        .iter()
                        .map(|rule| rule_doc(rule, ifmap, tables))
                        .collect();
                }
            }
            _ => save_dynamic(&mut doc.children, ruleset, ifmap, tables),
        }
    }
}

/// The document of `config` as it is now: the current table entries and dynamic rules, and the
/// connections `conns`.
pub(crate) fn save(config: &Config, ifmap: &IfMap, conns: Vec<ConnInfo>) -> ConfigDoc {
    let mut doc = config.doc.clone();
    for table_doc in &mut doc.tables {
        if let Some(table) = config.tables.get(table_doc.id) {
            table_doc.entries = table.list();
        }
    }
    save_dynamic(&mut doc.rules, &config.ruleset, ifmap, &config.tables);
    save_dynamic(&mut doc.nat, &config.nat_ruleset, ifmap, &config.tables);
    doc.conns = conns;
    doc
}
