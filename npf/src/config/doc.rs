// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The configuration document.
//!
//! This is the deserialized form of what the control plane sends. It is only checked for
//! syntax here; [`crate::config::build`] validates it and builds the in-memory configuration.

use crate::conn::ConnInfo;
use crate::ext::ExtParams;
use crate::nat::{NatAlgo, NatFlags, NatType};
use crate::ruleset::RuleAttr;
use bpf::Insn;
use ipnet::IpNet;
use ordermap::OrderMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use table::{TableId, TableType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDoc {
    /// Parameter values by dotted name.
    #[serde(default, skip_serializing_if = "OrderMap::is_empty")]
    pub params: OrderMap<String, u32>,
    /// Pass packets no rule concluded on.
    #[serde(default)]
    pub default_pass: bool,
    /// Tracing levels, as `tag=level` items separated by commas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rprocs: Vec<RprocDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nat: Vec<RuleDoc>,
    /// Connections to restore.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conns: Vec<ConnInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDoc {
    pub name: String,
    pub id: TableId,
    #[serde(rename = "type")]
    pub kind: TableType,
    #[serde(default)]
    pub entries: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RprocDoc {
    pub name: String,
    #[serde(default)]
    pub calls: Vec<ExtCallDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtCallDoc {
    pub ext: String,
    #[serde(default, skip_serializing_if = "ExtParams::is_empty")]
    pub params: ExtParams,
}

/// Rule attribute, as written in documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFlag {
    Pass,
    Final,
    Stateful,
    ReturnRst,
    ReturnIcmp,
    In,
    Out,
    Group,
    Dynamic,
    Multiends,
    Default,
}

impl From<RuleFlag> for RuleAttr {
    fn from(flag: RuleFlag) -> RuleAttr {
        match flag {
            RuleFlag::Pass => RuleAttr::PASS,
            RuleFlag::Final => RuleAttr::FINAL,
            RuleFlag::Stateful => RuleAttr::STATEFUL,
            RuleFlag::ReturnRst => RuleAttr::RETURN_RST,
            RuleFlag::ReturnIcmp => RuleAttr::RETURN_ICMP,
            RuleFlag::In => RuleAttr::IN,
            RuleFlag::Out => RuleAttr::OUT,
            RuleFlag::Group => RuleAttr::GROUP,
            RuleFlag::Dynamic => RuleAttr::DYNAMIC,
            RuleFlag::Multiends => RuleAttr::MULTIENDS,
            RuleFlag::Default => RuleAttr::DEFAULT,
        }
    }
}

const RULE_FLAGS: [RuleFlag; 11] = [
    RuleFlag::Pass,
    RuleFlag::Final,
    RuleFlag::Stateful,
    RuleFlag::ReturnRst,
    RuleFlag::ReturnIcmp,
    RuleFlag::In,
    RuleFlag::Out,
    RuleFlag::Group,
    RuleFlag::Dynamic,
    RuleFlag::Multiends,
    RuleFlag::Default,
];

/// Attributes of a rule, from its flags.
#[must_use]
pub fn rule_attr(flags: &[RuleFlag]) -> RuleAttr {
    flags
        .iter()
        .fold(RuleAttr::empty(), |attr, flag| attr | RuleAttr::from(*flag))
}

/// Flags of a rule, from its attributes.
#[must_use]
pub fn rule_flags(attr: RuleAttr) -> Vec<RuleFlag> {
    RULE_FLAGS
        .into_iter()
        .filter(|flag| attr.contains(RuleAttr::from(*flag)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attr: Vec<RuleFlag>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Byte code the packet must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Insn>,
    /// Name of the rule procedure to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rproc: Option<String>,
    /// Key of a dynamic rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Translation policy of a rule of the NAT ruleset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDoc>,
    /// Rules of a group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RuleDoc>,
}

/// Policy flag, as written in documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFlag {
    Ports,
    Portmap,
    Static,
}

impl From<PolicyFlag> for NatFlags {
    fn from(flag: PolicyFlag) -> NatFlags {
        match flag {
            PolicyFlag::Ports => NatFlags::PORTS,
            PolicyFlag::Portmap => NatFlags::PORTMAP,
            PolicyFlag::Static => NatFlags::STATIC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    /// Id under which saved connections refer to the policy.
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: NatType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<PolicyFlag>,
    pub addr: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u8>,
    /// Name of the pool table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub algo: NatAlgo,
}

impl ConfigDoc {
    /// # Errors
    ///
    /// Fails if `yaml` is not a valid document.
    pub fn from_yaml(yaml: &str) -> Result<ConfigDoc, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(yaml)
    }

    /// # Errors
    ///
    /// Fails if the document cannot be represented in YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml_ng::Error> {
        serde_yaml_ng::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_map_to_attributes() {
        let attr = rule_attr(&[RuleFlag::Pass, RuleFlag::Stateful, RuleFlag::Out]);
        assert_eq!(attr, RuleAttr::PASS | RuleAttr::STATEFUL | RuleAttr::OUT);
        assert_eq!(
            rule_flags(attr),
            vec![RuleFlag::Pass, RuleFlag::Stateful, RuleFlag::Out]
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ConfigDoc::from_yaml("rules: [{name: r, colour: blue}]").is_err());
        let doc = ConfigDoc::from_yaml(
            r"
params:
  gc.step: 16
nat:
  - name: masquerade
    attr: [out]
    interface: eth0
    policy:
      id: 1
      type: outbound
      flags: [ports, portmap]
      addr: 198.51.100.1
",
        )
        .unwrap();
        assert_eq!(doc.params.get("gc.step"), Some(&16));
        let policy = doc.nat[0].policy.as_ref().unwrap();
        assert_eq!(policy.kind, NatType::Outbound);
        assert_eq!(policy.algo, NatAlgo::None);
        assert_eq!(ConfigDoc::from_yaml(&doc.to_yaml().unwrap()).unwrap(), doc);
    }
}
