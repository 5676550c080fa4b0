// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunable parameters.
//!
//! Every parameter has a dotted name, a default value and bounds. Parameters are set from the
//! configuration document and applied when it is loaded.

use std::str::FromStr;
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("unknown parameter {0}")]
    Unknown(String),
    #[error("parameter {name}: value {value} is not within [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("port map range {min}..={max} is empty")]
    EmptyPortRange { min: u32, max: u32 },
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumCount,
    EnumIter,
    IntoStaticStr,
    strum::EnumString,
    strum::Display,
)]
pub enum Param {
    #[strum(serialize = "state.generic.timeout.closed")]
    GenericTimeoutClosed,
    #[strum(serialize = "state.generic.timeout.new")]
    GenericTimeoutNew,
    #[strum(serialize = "state.generic.timeout.established")]
    GenericTimeoutEstablished,
    #[strum(serialize = "state.tcp.timeout.closed")]
    TcpTimeoutClosed,
    #[strum(serialize = "state.tcp.timeout.syn_sent")]
    TcpTimeoutSynSent,
    #[strum(serialize = "state.tcp.timeout.sim_syn_sent")]
    TcpTimeoutSimSynSent,
    #[strum(serialize = "state.tcp.timeout.syn_received")]
    TcpTimeoutSynReceived,
    #[strum(serialize = "state.tcp.timeout.established")]
    TcpTimeoutEstablished,
    #[strum(serialize = "state.tcp.timeout.fin_sent")]
    TcpTimeoutFinSent,
    #[strum(serialize = "state.tcp.timeout.fin_received")]
    TcpTimeoutFinReceived,
    #[strum(serialize = "state.tcp.timeout.close_wait")]
    TcpTimeoutCloseWait,
    #[strum(serialize = "state.tcp.timeout.fin_wait")]
    TcpTimeoutFinWait,
    #[strum(serialize = "state.tcp.timeout.closing")]
    TcpTimeoutClosing,
    #[strum(serialize = "state.tcp.timeout.last_ack")]
    TcpTimeoutLastAck,
    #[strum(serialize = "state.tcp.timeout.time_wait")]
    TcpTimeoutTimeWait,
    /// Only a SYN can open a TCP connection.
    #[strum(serialize = "state.tcp.strict")]
    TcpStrict,
    /// Bound on how far an acknowledgement may be from the expected one.
    #[strum(serialize = "state.tcp.max_ack_win")]
    TcpMaxAckWin,
    /// Connections checked per incremental collection.
    #[strum(serialize = "gc.step")]
    GcStep,
    #[strum(serialize = "gc.interval_ms")]
    GcIntervalMs,
    #[strum(serialize = "portmap.min_port")]
    PortmapMinPort,
    #[strum(serialize = "portmap.max_port")]
    PortmapMaxPort,
}

const HOUR: u32 = 3600;
const DAY: u32 = 24 * HOUR;

impl Param {
    /// Default value, minimum and maximum.
    #[must_use]
    pub const fn bounds(self) -> (u32, u32, u32) {
        match self {
            Param::GenericTimeoutClosed | Param::TcpTimeoutClosed => (0, 0, DAY),
            Param::GenericTimeoutNew
            | Param::TcpTimeoutSynSent
            | Param::TcpTimeoutSimSynSent
            | Param::TcpTimeoutClosing
            | Param::TcpTimeoutLastAck => (30, 0, DAY),
            Param::GenericTimeoutEstablished | Param::TcpTimeoutSynReceived => (60, 0, DAY),
            Param::TcpTimeoutEstablished => (DAY, 0, 30 * DAY),
            Param::TcpTimeoutFinSent
            | Param::TcpTimeoutFinReceived
            | Param::TcpTimeoutCloseWait
            | Param::TcpTimeoutFinWait
            | Param::TcpTimeoutTimeWait => (240, 0, DAY),
            Param::TcpStrict => (1, 0, 1),
            Param::TcpMaxAckWin => (66000, 0, u32::MAX),
            Param::GcStep => (256, 1, 1 << 20),
            Param::GcIntervalMs => (1000, 10, 60_000),
            Param::PortmapMinPort => (1024, 1, 65535),
            Param::PortmapMaxPort => (49151, 1, 65535),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// A full set of parameter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    values: [u32; Param::COUNT],
}

impl Default for Params {
    fn default() -> Self {
        let mut values = [0; Param::COUNT];
        for param in Param::iter() {
            values[param as usize] = param.bounds().0;
        }
        Params { values }
    }
}

impl Params {
    #[must_use]
    pub fn get(&self, param: Param) -> u32 {
        self.values[param as usize]
    }

    /// # Errors
    ///
    /// Fails if the value is out of the bounds of the parameter.
    pub fn set(&mut self, param: Param, value: u32) -> Result<(), ParamError> {
        let (_, min, max) = param.bounds();
        if !(min..=max).contains(&value) {
            return Err(ParamError::OutOfRange {
                name: param.name(),
                value,
                min,
                max,
            });
        }
        self.values[param as usize] = value;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if there is no such parameter or the value is out of bounds.
    pub fn set_by_name(&mut self, name: &str, value: u32) -> Result<(), ParamError> {
        let param = Param::from_str(name).map_err(|_| ParamError::Unknown(name.to_owned()))?;
        self.set(param, value)
    }

    /// Check the constraints between parameters.
    ///
    /// # Errors
    ///
    /// Fails if the port map range is empty.
    pub fn validate(&self) -> Result<(), ParamError> {
        let (min, max) = (
            self.get(Param::PortmapMinPort),
            self.get(Param::PortmapMaxPort),
        );
        if min > max {
            return Err(ParamError::EmptyPortRange { min, max });
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, u32)> + '_ {
        Param::iter().map(|param| (param, self.get(param)))
    }

    #[must_use]
    pub fn tcp_strict(&self) -> bool {
        self.get(Param::TcpStrict) != 0
    }

    #[must_use]
    pub fn gc_step(&self) -> usize {
        usize::try_from(self.get(Param::GcStep)).unwrap_or(usize::MAX)
    }

    /// Port map range; callers must have validated the parameters.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded to 65535
    pub fn port_range(&self) -> (u16, u16) {
        (
            self.get(Param::PortmapMinPort) as u16,
            self.get(Param::PortmapMaxPort) as u16,
        )
    }
}
