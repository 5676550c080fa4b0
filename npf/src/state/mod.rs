// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection state.
//!
//! TCP connections are tracked by [`TcpTracker`]. Every other protocol uses a generic state,
//! which only records whether a reply was seen.

pub mod tcp;

pub use tcp::{TcpPeer, TcpState, TcpTracker};

use crate::conn::FlowDir;
use crate::params::{Param, Params};
use crate::stats::NpfStat;
use net::cache::{CacheFlags, PacketCache};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("packet does not match the connection state")]
    Invalid,
    #[error("TCP segment beyond the upper boundary of the window")]
    TcpUpperBound,
    #[error("TCP segment before the lower boundary of the window")]
    TcpLowerBound,
    #[error("TCP acknowledgement out of bounds")]
    TcpAck,
}

impl StateError {
    /// The counter for packets rejected with this error.
    #[must_use]
    pub fn stat(self) -> NpfStat {
        match self {
            StateError::Invalid => NpfStat::InvalidState,
            StateError::TcpUpperBound => NpfStat::InvalidStateTcp1,
            StateError::TcpLowerBound => NpfStat::InvalidStateTcp2,
            StateError::TcpAck => NpfStat::InvalidStateTcp3,
        }
    }
}

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
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenericState {
    Closed,
    New,
    Established,
}

/// State of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Generic(GenericState),
    Tcp(TcpTracker),
}

impl ConnState {
    /// Initial state of a connection created for the packet in `cache`.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot open a connection.
    pub fn new(cache: &PacketCache, params: &Params) -> Result<ConnState, StateError> {
        if cache.is(CacheFlags::TCP) {
            let tcp = cache.tcp().ok_or(StateError::Invalid)?;
            let tracker = TcpTracker::new(tcp, cache.tcp_payload_len(), params)?;
            return Ok(ConnState::Tcp(tracker));
        }
        let mut state = ConnState::Generic(GenericState::Closed);
        state.inspect(cache, FlowDir::Forward, params)?;
        Ok(state)
    }

    /// Process a packet of the connection.
    ///
    /// # Errors
    ///
    /// Fails if the packet does not match the state; the state is then unchanged.
    pub fn inspect(
        &mut self,
        cache: &PacketCache,
        flow: FlowDir,
        params: &Params,
    ) -> Result<(), StateError> {
        match self {
            ConnState::Tcp(tracker) => {
                let tcp = cache.tcp().ok_or(StateError::Invalid)?;
                tracker.inspect(tcp, cache.tcp_payload_len(), flow, params)
            }
            ConnState::Generic(state) => {
                *state = match (*state, flow) {
                    (GenericState::Closed, FlowDir::Forward) => GenericState::New,
                    (GenericState::New, FlowDir::Backward) => GenericState::Established,
                    (current, _) => current,
                };
                Ok(())
            }
        }
    }

    /// Idle time after which the connection expires, in seconds.
    #[must_use]
    pub fn timeout(&self, params: &Params) -> u64 {
        let param = match self {
            ConnState::Tcp(tracker) => tracker.state().timeout_param(),
            ConnState::Generic(GenericState::Closed) => Param::GenericTimeoutClosed,
            ConnState::Generic(GenericState::New) => Param::GenericTimeoutNew,
            ConnState::Generic(GenericState::Established) => Param::GenericTimeoutEstablished,
        };
        u64::from(params.get(param))
    }

    #[must_use]
    pub fn tcp_state(&self) -> Option<TcpState> {
        match self {
            ConnState::Tcp(tracker) => Some(tracker.state()),
            ConnState::Generic(_) => None,
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Tcp(tracker) => write!(f, "tcp {}", tracker.state()),
            ConnState::Generic(state) => write!(f, "{state}"),
        }
    }
}
