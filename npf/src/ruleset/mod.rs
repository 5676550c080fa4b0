// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rulesets.
//!
//! Rules are scanned in priority order. A matching rule is remembered and the scan goes on,
//! unless the rule is final. A group does not match by itself: when its own constraints match,
//! its rules are scanned and a match among them replaces what was remembered so far. A dynamic
//! group with a matching rule ends the scan. When nothing matches, the default rule concludes.

mod rproc;
mod rule;

pub use rproc::{Rproc, RprocCall};
pub use rule::{Rule, RuleAttr};

use ahash::RandomState;
use bpf::BpfArgs;
use concurrency::Ebr;
use net::cache::Direction;
use net::interface::IfId;
use parking_lot::Mutex;
use rule::{Children, DynGroup};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesetError {
    #[error("no dynamic group named {0}")]
    NoGroup(String),
    #[error("group {group} has no rule with id {id}")]
    NoRule { group: String, id: u64 },
    #[error("group {group} has no rule with key {key}")]
    NoKey { group: String, key: String },
    #[error("dynamic rules cannot be groups")]
    NestedGroup,
    #[error("duplicate group name {0}")]
    DuplicateGroup(String),
    #[error("more than one default rule")]
    DuplicateDefault,
}

struct Scan {
    matched: Option<Arc<Rule>>,
    stop: bool,
}

fn scan(rules: &[Arc<Rule>], args: &BpfArgs<'_>, ifid: Option<IfId>, di: Direction) -> Scan {
    let mut matched = None;
    for rule in rules {
        if !rule.matches(args, ifid, di) {
            continue;
        }
        if rule.is_group() {
            let inner = scan_group(rule, args, ifid, di);
            if inner.matched.is_some() {
                matched = inner.matched;
                if inner.stop || rule.is_final() || rule.is_dynamic() {
                    return Scan {
                        matched,
                        stop: true,
                    };
                }
            }
            continue;
        }
        matched = Some(rule.clone());
        if rule.is_final() {
            return Scan {
                matched,
                stop: true,
            };
        }
    }
    Scan {
        matched,
        stop: false,
    }
}

fn scan_group(group: &Rule, args: &BpfArgs<'_>, ifid: Option<IfId>, di: Direction) -> Scan {
    match &group.children {
        Children::Static(rules) => scan(rules, args, ifid, di),
        Children::Dynamic(dynamic) => scan(&dynamic.rules.load(), args, ifid, di),
    }
}

fn collect_groups(
    rules: &[Arc<Rule>],
    groups: &mut HashMap<String, Arc<DynGroup>, RandomState>,
) -> Result<(), RulesetError> {
    for rule in rules {
        match &rule.children {
            Children::Dynamic(group) => {
                let name = rule.name().unwrap_or_default().to_owned();
                if groups.insert(name.clone(), group.clone()).is_some() {
                    return Err(RulesetError::DuplicateGroup(name));
                }
            }
            Children::Static(children) => collect_groups(children, groups)?,
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct Ruleset {
    rules: Vec<Arc<Rule>>,
    default: Option<Arc<Rule>>,
    groups: HashMap<String, Arc<DynGroup>, RandomState>,
    next_id: AtomicU64,
    writer: Mutex<()>,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: None,
            groups: HashMap::default(),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(()),
        }
    }
}

impl Ruleset {
    /// Build a ruleset. The rule flagged default, if any, is set apart; the others are sorted
    /// by priority, keeping the given order between equal priorities.
    ///
    /// # Errors
    ///
    /// Fails if two rules are flagged default or two dynamic groups have the same name.
    pub fn new(rules: Vec<Rule>) -> Result<Ruleset, RulesetError> {
        let mut default = None;
        let mut scanned = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.is_default() {
                if default.is_some() {
                    return Err(RulesetError::DuplicateDefault);
                }
                default = Some(Arc::new(rule));
            } else {
                scanned.push(rule);
            }
        }
        scanned.sort_by_key(Rule::priority);
        let rules: Vec<_> = scanned.into_iter().map(Arc::new).collect();
        let mut groups = HashMap::default();
        collect_groups(&rules, &mut groups)?;
        if let Some(default) = &default {
            collect_groups(std::slice::from_ref(default), &mut groups)?;
        }
        Ok(Ruleset {
            rules,
            default,
            groups,
            ..Ruleset::default()
        })
    }

    /// Number of top-level rules, not counting the default one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default.is_none()
    }

    #[must_use]
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    #[must_use]
    pub fn default_rule(&self) -> Option<&Arc<Rule>> {
        self.default.as_ref()
    }

    /// Find the rule concluding on the packet.
    #[must_use]
    pub fn inspect(
        &self,
        args: &BpfArgs<'_>,
        ifid: Option<IfId>,
        di: Direction,
    ) -> Option<Arc<Rule>> {
        if let Some(rule) = scan(&self.rules, args, ifid, di).matched {
            return Some(rule);
        }
        let default = self.default.as_ref()?;
        if default.is_group() {
            if let Some(rule) = scan_group(default, args, ifid, di).matched {
                return Some(rule);
            }
        }
        Some(default.clone())
    }

    /// Take over the dynamic rules of the groups of `old` that have a namesake here, and the
    /// dynamic rule id counter.
    pub fn adopt(&self, old: &Ruleset) {
        let _writer = self.writer.lock();
        let _old_writer = old.writer.lock();
        for (name, group) in &self.groups {
            if let Some(old_group) = old.groups.get(name) {
                group.rules.store(old_group.rules.load_full());
                debug!("group {name}: took over {} rules", old_group.rules.load().len());
            }
        }
        self.next_id
            .fetch_max(old.next_id.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn group(&self, name: &str) -> Result<&Arc<DynGroup>, RulesetError> {
        self.groups
            .get(name)
            .ok_or_else(|| RulesetError::NoGroup(name.to_owned()))
    }

    #[must_use]
    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Add a rule to the dynamic group `group`, after the rules of lower or equal priority.
    /// Returns the id of the rule.
    ///
    /// # Errors
    ///
    /// Fails if there is no such group or if the rule is a group itself.
    pub fn rule_add(&self, group: &str, mut rule: Rule) -> Result<u64, RulesetError> {
        if rule.is_group() {
            return Err(RulesetError::NestedGroup);
        }
        let _writer = self.writer.lock();
        let dynamic = self.group(group)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        rule.id = id;
        let mut rules = dynamic.rules.load().to_vec();
        let at = rules.partition_point(|other| other.priority() <= rule.priority());
        rules.insert(at, Arc::new(rule));
        dynamic.rules.store(Arc::new(rules));
        debug!("group {group}: added rule {id}");
        Ok(id)
    }

    fn remove_where(
        &self,
        group: &str,
        ebr: &Ebr,
        pred: impl Fn(&Rule) -> bool,
    ) -> Result<Option<Arc<Rule>>, RulesetError> {
        let removed = {
            let _writer = self.writer.lock();
            let dynamic = self.group(group)?;
            let mut rules = dynamic.rules.load().to_vec();
            let Some(at) = rules.iter().position(|rule| pred(rule)) else {
                return Ok(None);
            };
            let removed = rules.remove(at);
            dynamic.rules.store(Arc::new(rules));
            removed
        };
        ebr.full_sync();
        Ok(Some(removed))
    }

    /// Remove the rule with id `id` from `group`. Returns once no packet is inspected against
    /// it any more.
    ///
    /// # Errors
    ///
    /// Fails if there is no such group or rule.
    pub fn rule_remove(&self, group: &str, id: u64, ebr: &Ebr) -> Result<Arc<Rule>, RulesetError> {
        let removed = self
            .remove_where(group, ebr, |rule| rule.id() == id)?
            .ok_or_else(|| RulesetError::NoRule {
                group: group.to_owned(),
                id,
            })?;
        debug!("group {group}: removed rule {id}");
        Ok(removed)
    }

    /// Remove the rule added with key `key` from `group`.
    ///
    /// # Errors
    ///
    /// Fails if there is no such group or rule.
    pub fn rule_remove_key(
        &self,
        group: &str,
        key: &str,
        ebr: &Ebr,
    ) -> Result<Arc<Rule>, RulesetError> {
        let removed = self
            .remove_where(group, ebr, |rule| rule.key() == Some(key))?
            .ok_or_else(|| RulesetError::NoKey {
                group: group.to_owned(),
                key: key.to_owned(),
            })?;
        debug!("group {group}: removed rule {}", removed.id());
        Ok(removed)
    }

    /// # Errors
    ///
    /// Fails if there is no such group.
    pub fn rule_list(&self, group: &str) -> Result<Vec<Arc<Rule>>, RulesetError> {
        Ok(self.group(group)?.rules.load().to_vec())
    }

    /// Remove every rule of `group`, returning how many there were.
    ///
    /// # Errors
    ///
    /// Fails if there is no such group.
    pub fn rule_flush(&self, group: &str, ebr: &Ebr) -> Result<usize, RulesetError> {
        let flushed = {
            let _writer = self.writer.lock();
            let old = self.group(group)?.rules.swap(Arc::new(Vec::new()));
            old.len()
        };
        ebr.full_sync();
        debug!("group {group}: flushed {flushed} rules");
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf::Insn;
    use bpf::Program;
    use bpf::insn::{ABS, B, JEQ, JMP, K, LD, RET};
    use net::buffer::TestBuffer;
    use net::cache::PacketCache;
    use net::test_utils::{TcpSegment, tcp, udp};
    use pretty_assertions::assert_eq;

    fn proto_is(proto: u8) -> Program {
        Program::new(vec![
            Insn::stmt(LD | B | ABS, 9),
            Insn::jump(JMP | JEQ | K, u32::from(proto), 0, 1),
            Insn::stmt(RET | K, 1),
            Insn::stmt(RET | K, 0),
        ])
        .unwrap()
    }

    fn tcp_packet() -> TestBuffer {
        tcp(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
            &TcpSegment::default(),
        )
    }

    fn udp_packet() -> TestBuffer {
        udp(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:53".parse().unwrap(),
            b"",
        )
    }

    fn inspect(ruleset: &Ruleset, mut pkt: TestBuffer, di: Direction) -> Option<Arc<Rule>> {
        let cache = PacketCache::new(&mut pkt).unwrap();
        let args = BpfArgs {
            pkt: &pkt,
            cache: &cache,
            tables: None,
        };
        ruleset.inspect(&args, Some(IfId::new(1)), di)
    }

    fn named(rule: Option<Arc<Rule>>) -> Option<String> {
        rule.and_then(|rule| rule.name().map(str::to_owned))
    }

    #[test]
    fn last_match_wins_unless_final() {
        let ruleset = Ruleset::new(vec![
            Rule::new(RuleAttr::PASS).with_name("any"),
            Rule::new(RuleAttr::empty())
                .with_name("block-tcp")
                .with_code(proto_is(6)),
            Rule::new(RuleAttr::PASS | RuleAttr::FINAL)
                .with_name("udp")
                .with_code(proto_is(17)),
            Rule::new(RuleAttr::empty()).with_name("never"),
            Rule::new(RuleAttr::DEFAULT).with_name("default"),
        ])
        .unwrap();
        assert_eq!(ruleset.len(), 4);
        assert_eq!(named(inspect(&ruleset, tcp_packet(), Direction::In)), Some("never".to_owned()));
        assert_eq!(named(inspect(&ruleset, udp_packet(), Direction::In)), Some("udp".to_owned()));
    }

    #[test]
    fn priority_orders_rules() {
        let ruleset = Ruleset::new(vec![
            Rule::new(RuleAttr::PASS | RuleAttr::FINAL)
                .with_name("late")
                .with_priority(10),
            Rule::new(RuleAttr::FINAL).with_name("early").with_priority(-1),
        ])
        .unwrap();
        assert_eq!(named(inspect(&ruleset, tcp_packet(), Direction::In)), Some("early".to_owned()));
    }

    #[test]
    fn groups_and_directions() {
        let ruleset = Ruleset::new(vec![
            Rule::new(RuleAttr::GROUP | RuleAttr::OUT)
                .with_name("outgoing")
                .with_children(vec![
                    Rule::new(RuleAttr::PASS).with_name("out-tcp").with_code(proto_is(6)),
                ]),
            Rule::new(RuleAttr::GROUP | RuleAttr::IN)
                .with_name("other-if")
                .with_ifid(IfId::new(2))
                .with_children(vec![Rule::new(RuleAttr::PASS).with_name("if2")]),
            Rule::new(RuleAttr::GROUP | RuleAttr::DEFAULT | RuleAttr::PASS)
                .with_name("default")
                .with_children(vec![
                    Rule::new(RuleAttr::empty())
                        .with_name("default-udp")
                        .with_code(proto_is(17)),
                ]),
        ])
        .unwrap();
        assert_eq!(
            named(inspect(&ruleset, tcp_packet(), Direction::Out)),
            Some("out-tcp".to_owned())
        );
        assert_eq!(
            named(inspect(&ruleset, tcp_packet(), Direction::In)),
            Some("default".to_owned())
        );
        assert_eq!(
            named(inspect(&ruleset, udp_packet(), Direction::Out)),
            Some("default-udp".to_owned())
        );
        assert!(inspect(&Ruleset::new(vec![]).unwrap(), udp_packet(), Direction::In).is_none());
    }

    #[test]
    fn dynamic_rules() {
        let ebr = Ebr::new();
        let ruleset = Ruleset::new(vec![
            Rule::new(RuleAttr::PASS).with_name("any"),
            Rule::new(RuleAttr::GROUP | RuleAttr::DYNAMIC).with_name("blacklist"),
        ])
        .unwrap();
        assert!(ruleset.has_group("blacklist"));
        assert_eq!(named(inspect(&ruleset, tcp_packet(), Direction::In)), Some("any".to_owned()));

        let first = ruleset
            .rule_add(
                "blacklist",
                Rule::new(RuleAttr::empty())
                    .with_name("no-tcp")
                    .with_code(proto_is(6))
                    .with_priority(5)
                    .with_key("tcp"),
            )
            .unwrap();
        let second = ruleset
            .rule_add(
                "blacklist",
                Rule::new(RuleAttr::empty()).with_name("no-udp").with_code(proto_is(17)),
            )
            .unwrap();
        assert_ne!(first, second);
        let listed: Vec<_> = ruleset
            .rule_list("blacklist")
            .unwrap()
            .iter()
            .map(|rule| rule.id())
            .collect();
        assert_eq!(listed, vec![second, first]);
        assert_eq!(
            named(inspect(&ruleset, tcp_packet(), Direction::In)),
            Some("no-tcp".to_owned())
        );

        assert!(ruleset.rule_add("nosuch", Rule::new(RuleAttr::PASS)).is_err());
        assert_eq!(
            ruleset
                .rule_add("blacklist", Rule::new(RuleAttr::GROUP))
                .unwrap_err(),
            RulesetError::NestedGroup
        );

        ruleset.rule_remove_key("blacklist", "tcp", &ebr).unwrap();
        assert_eq!(named(inspect(&ruleset, tcp_packet(), Direction::In)), Some("any".to_owned()));
        assert!(matches!(
            ruleset.rule_remove("blacklist", first, &ebr),
            Err(RulesetError::NoRule { .. })
        ));

        // a reload takes the dynamic rules over
        let reloaded = Ruleset::new(vec![
            Rule::new(RuleAttr::GROUP | RuleAttr::DYNAMIC).with_name("blacklist"),
        ])
        .unwrap();
        reloaded.adopt(&ruleset);
        assert_eq!(reloaded.rule_list("blacklist").unwrap().len(), 1);
        let third = reloaded
            .rule_add("blacklist", Rule::new(RuleAttr::PASS))
            .unwrap();
        assert!(third > second);
        assert_eq!(reloaded.rule_flush("blacklist", &ebr).unwrap(), 2);
        assert!(reloaded.rule_list("blacklist").unwrap().is_empty());
    }

    #[test]
    fn duplicate_defaults_and_groups_are_rejected() {
        assert_eq!(
            Ruleset::new(vec![
                Rule::new(RuleAttr::DEFAULT),
                Rule::new(RuleAttr::DEFAULT | RuleAttr::PASS),
            ])
            .unwrap_err(),
            RulesetError::DuplicateDefault
        );
        assert_eq!(
            Ruleset::new(vec![
                Rule::new(RuleAttr::GROUP | RuleAttr::DYNAMIC).with_name("g"),
                Rule::new(RuleAttr::GROUP | RuleAttr::DYNAMIC).with_name("g"),
            ])
            .unwrap_err(),
            RulesetError::DuplicateGroup("g".to_owned())
        );
    }
}
