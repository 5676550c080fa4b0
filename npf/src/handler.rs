// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The packet handler.
//!
//! Every packet goes through the same steps: the headers are cached, packets tagged by a
//! multi-end connection pass right away, then the packet is matched against the connections
//! (ALGs first) and, unless a passing connection is found, against the ruleset. A stateful pass
//! rule opens a connection. Passed packets are translated, and the rule procedure of the rule
//! or connection runs last; it may still block the packet.

use crate::conn::{Conn, ConnError, ConnFlags, FlowDir};
use crate::ext::MatchInfo;
use crate::instance::Npf;
use crate::nat::{NatContext, NatError, do_nat};
use crate::params::Params;
use crate::ruleset::Rproc;
use crate::stats::NpfStat;
use bpf::BpfArgs;
use net::buffer::NetBuffer;
use net::cache::{CacheError, CacheFlags, Direction, PacketCache};
use net::interface::IfId;
use std::sync::Arc;
use tracing::{debug, trace};

/// Buffer tag of packets that pass without inspection.
pub const PASS_TAG: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pass,
    Block,
}

/// What to do with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// Answer a blocked TCP packet with a reset.
    pub return_rst: bool,
    /// Answer a blocked packet with an ICMP destination unreachable.
    pub return_icmp: bool,
}

impl Verdict {
    #[must_use]
    pub fn pass() -> Verdict {
        Verdict {
            decision: Decision::Pass,
            return_rst: false,
            return_icmp: false,
        }
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.decision == Decision::Pass
    }
}

/// Errors of packet processing. The packet must be dropped.
#[derive(Debug, thiserror::Error)]
pub enum NpfError {
    #[error("packet headers: {0}")]
    Cache(#[from] CacheError),
    #[error("translation: {0}")]
    Nat(#[from] NatError),
}

/// Result of the ruleset inspection.
struct Conclusion {
    decision: Decision,
    return_rst: bool,
    return_icmp: bool,
    rule_id: Option<u64>,
    rproc: Option<Arc<Rproc>>,
}

impl Npf {
    /// Connection of the packet, if it has one and the packet fits its state.
    fn conn_inspect(
        &self,
        cache: &PacketCache,
        ifid: Option<IfId>,
        di: Direction,
        params: &Params,
    ) -> Option<(Arc<Conn>, FlowDir)> {
        if let Some(found) = self.algs.inspect(cache, ifid, di, &self.conndb) {
            return Some(found);
        }
        if cache.is(CacheFlags::IPFRAG) {
            return None;
        }
        let (conn, flow) = self.conndb.lookup_packet(cache, ifid, di)?;
        let result = conn.lock().state.inspect(cache, flow, params);
        match result {
            Ok(()) => Some((conn, flow)),
            Err(err) => {
                self.stats.inc(err.stat());
                debug!("connection {}: {err}", conn.forw_key());
                None
            }
        }
    }

    /// Filter and translate a packet seen on its interface in direction `di`.
    ///
    /// # Errors
    ///
    /// Fails if the headers could not be accessed or the translation failed. The packet must be
    /// dropped then.
    pub fn handle(&self, buf: &mut dyn NetBuffer, di: Direction) -> Result<Verdict, NpfError> {
        let _epoch = self.ebr.enter();
        let config = self.config.load();

        let mut cache = match PacketCache::new(buf) {
            Ok(cache) => cache,
            Err(err) => {
                let stat = match err {
                    CacheError::Pullup(_) => NpfStat::NbufContigFail,
                    _ => NpfStat::Error,
                };
                self.stats.inc(stat);
                return Err(err.into());
            }
        };
        if cache.pulled_up() {
            self.stats.inc(NpfStat::NbufNonContig);
        }
        if cache.is(CacheFlags::IPFRAG) {
            self.stats.inc(NpfStat::Fragmented);
        }
        if buf.tag().is_some_and(|tag| tag & PASS_TAG != 0) {
            trace!("tagged packet passes");
            return Ok(Verdict::pass());
        }

        let ifid = buf.ifid();
        let mut conn = self.conn_inspect(&cache, ifid, di, &config.params);
        let passing = conn
            .as_ref()
            .filter(|(conn, _)| conn.flags().contains(ConnFlags::PASS));
        let conclusion = if let Some((conn, _)) = passing {
            self.stats.inc(NpfStat::PassConn);
            let inner = conn.lock();
            Conclusion {
                decision: Decision::Pass,
                return_rst: false,
                return_icmp: false,
                rule_id: inner.rule_id,
                rproc: inner.rproc.clone(),
            }
        } else {
            let rule = {
                let args = BpfArgs {
                    pkt: &*buf,
                    cache: &cache,
                    tables: Some(&config.tables),
                };
                config.ruleset.inspect(&args, ifid, di)
            };
            match rule {
                None => {
                    let (decision, stat) = if config.default_pass {
                        (Decision::Pass, NpfStat::PassDefault)
                    } else {
                        (Decision::Block, NpfStat::BlockDefault)
                    };
                    self.stats.inc(stat);
                    Conclusion {
                        decision,
                        return_rst: false,
                        return_icmp: false,
                        rule_id: None,
                        rproc: None,
                    }
                }
                Some(rule) if rule.is_pass() => {
                    self.stats.inc(NpfStat::PassRuleset);
                    let rule_id = Some(rule.id()).filter(|id| *id != 0);
                    let rproc = rule.rproc().cloned();
                    if rule.is_stateful() && conn.is_none() {
                        match self.conndb.establish(
                            &cache,
                            ifid,
                            di,
                            rule.is_global(),
                            &config.params,
                        ) {
                            Ok(created) => {
                                created.set_pass(rule_id, rproc.clone());
                                conn = Some((created, FlowDir::Forward));
                            }
                            // the packet passes all the same
                            Err(err) => trace!("no connection for the packet: {err}"),
                        }
                    }
                    Conclusion {
                        decision: Decision::Pass,
                        return_rst: false,
                        return_icmp: false,
                        rule_id,
                        rproc,
                    }
                }
                Some(rule) => {
                    self.stats.inc(NpfStat::BlockRuleset);
                    Conclusion {
                        decision: Decision::Block,
                        return_rst: rule.return_rst(),
                        return_icmp: rule.return_icmp(),
                        rule_id: Some(rule.id()).filter(|id| *id != 0),
                        rproc: rule.rproc().cloned(),
                    }
                }
            }
        };

        let mut decision = conclusion.decision;
        let mut error = None;
        if decision == Decision::Pass {
            if let Some((conn, _)) = &conn {
                if conn.flags().contains(ConnFlags::GLOBAL) {
                    if let Err(err) = buf.set_tag(PASS_TAG) {
                        debug!("cannot tag the packet of {}: {err}", conn.forw_key());
                    }
                }
            }
            let ctx = NatContext {
                config: &config,
                conndb: &self.conndb,
                algs: &self.algs,
            };
            if let Err(err) = do_nat(&ctx, buf, &mut cache, ifid, di, conn.as_ref()) {
                error = Some(err);
            }
        }

        if let Some(rproc) = &conclusion.rproc {
            let info = MatchInfo {
                rule_id: conclusion.rule_id,
                ifid,
                di,
            };
            rproc.run(buf, &cache, &info, &mut decision);
        }

        if let Some(err) = error {
            if !matches!(err, NatError::Conn(ConnError::Race(_))) {
                self.stats.inc(NpfStat::Error);
            }
            return Err(err.into());
        }
        Ok(Verdict {
            decision,
            return_rst: decision == Decision::Block && conclusion.return_rst,
            return_icmp: decision == Decision::Block && conclusion.return_icmp,
        })
    }
}
