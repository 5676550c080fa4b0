// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::nat::NatPolicy;
use crate::ruleset::Rproc;
use arc_swap::ArcSwap;
use bitflags::bitflags;
use bpf::{BpfArgs, Program};
use net::cache::Direction;
use net::interface::IfId;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct RuleAttr: u32 {
        const PASS = 1 << 0;
        /// Stop the scan on match.
        const FINAL = 1 << 1;
        /// Create a connection on pass.
        const STATEFUL = 1 << 2;
        const RETURN_RST = 1 << 3;
        const RETURN_ICMP = 1 << 4;
        const IN = 1 << 5;
        const OUT = 1 << 6;
        /// A container of rules.
        const GROUP = 1 << 7;
        /// A group whose rules change at runtime.
        const DYNAMIC = 1 << 8;
        /// Connections are global: they match on every interface and in both directions.
        const MULTIENDS = 1 << 9;
        /// Concludes when no other rule matches.
        const DEFAULT = 1 << 10;
    }
}

#[derive(Debug, Default)]
pub(crate) struct DynGroup {
    pub(crate) rules: ArcSwap<Vec<Arc<Rule>>>,
}

#[derive(Debug)]
pub(crate) enum Children {
    Static(Vec<Arc<Rule>>),
    Dynamic(Arc<DynGroup>),
}

/// A rule of a ruleset. Built with the `with_*` methods, then frozen in an `Arc`.
#[derive(Debug)]
pub struct Rule {
    name: Option<String>,
    attr: RuleAttr,
    priority: i32,
    ifid: Option<IfId>,
    code: Option<Program>,
    rproc: Option<Arc<Rproc>>,
    nat: Option<Arc<NatPolicy>>,
    pub(crate) children: Children,
    pub(crate) id: u64,
    key: Option<String>,
}

impl Rule {
    #[must_use]
    pub fn new(attr: RuleAttr) -> Self {
        let children = if attr.contains(RuleAttr::GROUP | RuleAttr::DYNAMIC) {
            Children::Dynamic(Arc::default())
        } else {
            Children::Static(Vec::new())
        };
        Self {
            name: None,
            attr,
            priority: 0,
            ifid: None,
            code: None,
            rproc: None,
            nat: None,
            children,
            id: 0,
            key: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_ifid(mut self, ifid: IfId) -> Self {
        self.ifid = Some(ifid);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: Program) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_rproc(mut self, rproc: Arc<Rproc>) -> Self {
        self.rproc = Some(rproc);
        self
    }

    #[must_use]
    pub fn with_nat(mut self, nat: Arc<NatPolicy>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Key under which a dynamic rule can be removed.
    #[must_use]
    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    /// Set the rules of a static group, sorted by priority.
    #[must_use]
    pub fn with_children(mut self, mut children: Vec<Rule>) -> Self {
        if let Children::Static(rules) = &mut self.children {
            children.sort_by_key(Rule::priority);
            rules.extend(children.into_iter().map(Arc::new));
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn attr(&self) -> RuleAttr {
        self.attr
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Id of a dynamic rule, 0 for the others.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    #[must_use]
    pub fn ifid(&self) -> Option<IfId> {
        self.ifid
    }

    #[must_use]
    pub fn code(&self) -> Option<&Program> {
        self.code.as_ref()
    }

    #[must_use]
    pub fn rproc(&self) -> Option<&Arc<Rproc>> {
        self.rproc.as_ref()
    }

    #[must_use]
    pub fn nat(&self) -> Option<&Arc<NatPolicy>> {
        self.nat.as_ref()
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.attr.contains(RuleAttr::PASS)
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.attr.contains(RuleAttr::FINAL)
    }

    #[must_use]
    pub fn is_stateful(&self) -> bool {
        self.attr.contains(RuleAttr::STATEFUL)
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.attr.contains(RuleAttr::GROUP)
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.children, Children::Dynamic(_))
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.attr.contains(RuleAttr::DEFAULT)
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.attr.contains(RuleAttr::MULTIENDS)
    }

    #[must_use]
    pub fn return_rst(&self) -> bool {
        self.attr.contains(RuleAttr::RETURN_RST)
    }

    #[must_use]
    pub fn return_icmp(&self) -> bool {
        self.attr.contains(RuleAttr::RETURN_ICMP)
    }

    /// The rules of a group, in scan order.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Rule>> {
        match &self.children {
            Children::Static(rules) => rules.clone(),
            Children::Dynamic(group) => group.rules.load().to_vec(),
        }
    }

    /// Whether the interface, direction and code of the rule match the packet.
    #[must_use]
    pub fn matches(&self, args: &BpfArgs<'_>, ifid: Option<IfId>, di: Direction) -> bool {
        if self.ifid.is_some() && self.ifid != ifid {
            return false;
        }
        let dirs = self.attr & (RuleAttr::IN | RuleAttr::OUT);
        let wanted = match di {
            Direction::In => RuleAttr::IN,
            Direction::Out => RuleAttr::OUT,
        };
        if !dirs.is_empty() && !dirs.contains(wanted) {
            return false;
        }
        self.code.as_ref().is_none_or(|code| code.matches(args))
    }
}
