// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP state tracking.
//!
//! The state of a connection moves on a table keyed by the current state, the flow direction of
//! the segment and its flags. Independently of the state, every segment must fall within the
//! window of its direction:
//!
//! - (I) its end must not go beyond the highest end the other side acknowledged plus its
//!   window;
//! - (II) it must not start more than one window before the highest end seen;
//! - (III, IV) its acknowledgement must be within `max_ack_win` of the end of the other side.
//!
//! A segment outside the window is rejected and leaves the state untouched.

use crate::conn::FlowDir;
use crate::params::{Param, Params};
use crate::state::StateError;
use net::cache::{TcpFlags, TcpInfo};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TcpState {
    Closed,
    SynSent,
    SimSynSent,
    SynReceived,
    Established,
    FinSent,
    FinReceived,
    CloseWait,
    FinWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    #[must_use]
    pub const fn timeout_param(self) -> Param {
        match self {
            TcpState::Closed => Param::TcpTimeoutClosed,
            TcpState::SynSent => Param::TcpTimeoutSynSent,
            TcpState::SimSynSent => Param::TcpTimeoutSimSynSent,
            TcpState::SynReceived => Param::TcpTimeoutSynReceived,
            TcpState::Established => Param::TcpTimeoutEstablished,
            TcpState::FinSent => Param::TcpTimeoutFinSent,
            TcpState::FinReceived => Param::TcpTimeoutFinReceived,
            TcpState::CloseWait => Param::TcpTimeoutCloseWait,
            TcpState::FinWait => Param::TcpTimeoutFinWait,
            TcpState::Closing => Param::TcpTimeoutClosing,
            TcpState::LastAck => Param::TcpTimeoutLastAck,
            TcpState::TimeWait => Param::TcpTimeoutTimeWait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagCase {
    Invalid,
    Syn,
    SynAck,
    Ack,
    /// FIN, with or without ACK.
    Fin,
}

fn flag_case(flags: TcpFlags) -> FlagCase {
    let flags = flags & (TcpFlags::SYN | TcpFlags::ACK | TcpFlags::FIN);
    if flags == TcpFlags::SYN {
        FlagCase::Syn
    } else if flags == TcpFlags::SYN | TcpFlags::ACK {
        FlagCase::SynAck
    } else if flags == TcpFlags::ACK {
        FlagCase::Ack
    } else if flags == TcpFlags::FIN || flags == TcpFlags::FIN | TcpFlags::ACK {
        FlagCase::Fin
    } else {
        FlagCase::Invalid
    }
}

/// The state to move to, or `None` to stay.
fn transition(state: TcpState, flow: FlowDir, case: FlagCase) -> Option<TcpState> {
    use FlagCase::{Ack, Fin, Syn, SynAck};
    use FlowDir::{Backward, Forward};
    use TcpState::{
        CloseWait, Closed, Closing, Established, FinReceived, FinSent, FinWait, LastAck,
        SimSynSent, SynReceived, SynSent, TimeWait,
    };
    match (state, flow, case) {
        (Closed, Forward, Syn) => Some(SynSent),
        (SynSent, Backward, SynAck) => Some(SynReceived),
        (SynSent, Backward, Syn) => Some(SimSynSent),
        (SimSynSent, _, SynAck) => Some(SynReceived),
        (SynReceived, Forward, Ack) => Some(Established),
        (SynReceived, Forward, Fin) => Some(FinSent),
        (SynReceived, Backward, Fin) => Some(FinReceived),
        (Established, Forward, Fin) => Some(FinSent),
        (Established, Backward, Fin) => Some(FinReceived),
        (FinSent, Backward, Ack) => Some(FinWait),
        (FinSent, Backward, Fin) => Some(Closing),
        (FinReceived, Forward, Ack) => Some(CloseWait),
        (FinReceived, Forward, Fin) => Some(Closing),
        (CloseWait | FinWait, _, Fin) => Some(LastAck),
        (Closing, _, Ack) => Some(LastAck),
        (LastAck, _, Ack) => Some(TimeWait),
        // may re-open, RFC 1122
        (TimeWait, Forward, Syn) => Some(SynSent),
        _ => None,
    }
}

/// Sequence space tracking of one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPeer {
    /// Highest sequence end sent.
    pub end: u32,
    /// Highest end the other side allows (acknowledgement plus window).
    pub maxend: u32,
    /// Largest window advertised.
    pub maxwin: u32,
    pub wscale: u8,
}

#[allow(clippy::cast_possible_wrap)]
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

fn seq_leq(a: u32, b: u32) -> bool {
    seq_diff(a, b) <= 0
}

fn seq_geq(a: u32, b: u32) -> bool {
    seq_diff(a, b) >= 0
}

fn seq_gt(a: u32, b: u32) -> bool {
    seq_diff(a, b) > 0
}

/// State of a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTracker {
    state: TcpState,
    peers: [TcpPeer; 2],
}

impl TcpTracker {
    /// Track a new connection, starting with its first segment.
    ///
    /// # Errors
    ///
    /// In strict mode only a SYN opens a connection. Otherwise a connection can also be picked
    /// up in the middle, from any segment with an ACK.
    pub fn new(tcp: &TcpInfo, payload_len: usize, params: &Params) -> Result<Self, StateError> {
        let mut tracker = TcpTracker {
            state: TcpState::Closed,
            peers: [TcpPeer::default(); 2],
        };
        let case = flag_case(tcp.flags);
        if case != FlagCase::Syn {
            if params.tcp_strict()
                || case == FlagCase::Invalid
                || tcp.flags.contains(TcpFlags::RST)
            {
                return Err(StateError::Invalid);
            }
            tracker.in_window(tcp, payload_len, FlowDir::Forward, params)?;
            tracker.state = TcpState::Established;
            return Ok(tracker);
        }
        tracker.inspect(tcp, payload_len, FlowDir::Forward, params)?;
        Ok(tracker)
    }

    /// Rebuild a tracker from exported state.
    #[must_use]
    pub fn from_parts(state: TcpState, peers: [TcpPeer; 2]) -> Self {
        TcpTracker { state, peers }
    }

    #[must_use]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[must_use]
    pub fn peer(&self, flow: FlowDir) -> &TcpPeer {
        &self.peers[flow.index()]
    }

    /// Process a segment of the connection.
    ///
    /// # Errors
    ///
    /// Fails, leaving the state unchanged, if the segment is out of the window.
    pub fn inspect(
        &mut self,
        tcp: &TcpInfo,
        payload_len: usize,
        flow: FlowDir,
        params: &Params,
    ) -> Result<(), StateError> {
        let next = if tcp.flags.contains(TcpFlags::RST) {
            // no TIME-WAIT assassination, RFC 1337
            (self.state != TcpState::TimeWait).then_some(TcpState::Closed)
        } else {
            transition(self.state, flow, flag_case(tcp.flags))
        };
        let saved = self.peers;
        if self.state == TcpState::TimeWait && next == Some(TcpState::SynSent) {
            self.peers = [TcpPeer::default(); 2];
        }
        if let Err(error) = self.in_window(tcp, payload_len, flow, params) {
            self.peers = saved;
            return Err(error);
        }
        if let Some(next) = next {
            trace!("tcp state {} -> {next} ({flow:?})", self.state);
            self.state = next;
        }
        Ok(())
    }

    fn in_window(
        &mut self,
        tcp: &TcpInfo,
        payload_len: usize,
        flow: FlowDir,
        params: &Params,
    ) -> Result<(), StateError> {
        let flags = tcp.flags;
        let mut seq = tcp.seq;
        let mut ack = tcp.ack;
        let mut win = u32::from(tcp.win);
        #[allow(clippy::cast_possible_truncation)] // sequence arithmetic is modulo 2^32
        let mut end = seq.wrapping_add(payload_len as u32);
        if flags.contains(TcpFlags::SYN) {
            end = end.wrapping_add(1);
        }
        if flags.contains(TcpFlags::FIN) {
            end = end.wrapping_add(1);
        }

        let [forward, backward] = &mut self.peers;
        let (fstate, tstate) = match flow {
            FlowDir::Forward => (forward, backward),
            FlowDir::Backward => (backward, forward),
        };

        if fstate.end == 0 {
            // First segment in this direction.
            fstate.end = end;
            fstate.maxend = end;
            fstate.maxwin = win.max(1);
            fstate.wscale = 0;
            if flags.contains(TcpFlags::SYN) {
                if let Some(wscale) = tcp.wscale {
                    fstate.wscale = wscale;
                } else if flags.contains(TcpFlags::ACK) {
                    // scaling is only in use if both sides asked for it
                    tstate.wscale = 0;
                }
            }
            if tstate.end == 0 {
                tstate.maxwin = fstate.maxwin;
                if flags.contains(TcpFlags::ACK) {
                    tstate.end = ack;
                }
            }
        } else if !flags.contains(TcpFlags::SYN) {
            win <<= fstate.wscale;
        }

        if !flags.contains(TcpFlags::ACK) {
            // pretend the expected acknowledgement was sent
            ack = tstate.end;
        } else if flags.contains(TcpFlags::RST) && ack == 0 {
            ack = tstate.end;
        }
        if flags.contains(TcpFlags::RST) && seq == 0 && self.state == TcpState::SynSent {
            // RST to the initial SYN may carry a zero sequence number
            end = fstate.end;
            seq = end;
        }

        // (I)
        if !seq_leq(end, fstate.maxend) {
            return Err(StateError::TcpUpperBound);
        }
        // (II)
        if !seq_geq(seq, fstate.end.wrapping_sub(tstate.maxwin)) {
            return Err(StateError::TcpLowerBound);
        }
        // (III, IV)
        let ackskew = i64::from(seq_diff(tstate.end, ack));
        let max_ack_win = i64::from(params.get(Param::TcpMaxAckWin));
        if ackskew < -max_ack_win || ackskew > (max_ack_win << fstate.wscale) {
            return Err(StateError::TcpAck);
        }

        if ackskew < 0 {
            tstate.end = ack;
        }
        fstate.maxwin = fstate.maxwin.max(win);
        if seq_gt(end, fstate.end) {
            fstate.end = end;
        }
        let limit = ack.wrapping_add(win);
        if seq_geq(limit, tstate.maxend) {
            tstate.maxend = limit;
        }
        Ok(())
    }
}
