// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Byte-code classifier.
//!
//! Rules carry classic BPF programs. A [`Program`] is validated once, when it is loaded
//! ([`validate`]), and can then be run any number of times against packets ([`Program::filter`]).
//! Two coprocessor calls extend the instruction set with packet filter knowledge:
//! - [`COP_L3`] stores the IP version, the L4 offset and the L4 protocol of the packet in the
//!   memory words [`MW_IPVER`], [`MW_L4OFF`] and [`MW_L4PROTO`], and loads the IP version in A.
//! - [`COP_TABLE`] looks up the source (if [`TABLE_SRC`] is set in A) or destination address in
//!   the table whose id is in the low bits of A, and loads 1 in A on a hit, 0 otherwise.
//!
//! A program matches when it returns a non-zero value.

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cop;
pub mod insn;
mod validate;
mod vm;

pub use cop::{COP_L3, COP_TABLE, MW_IPVER, MW_L4OFF, MW_L4PROTO, NCOPROCS, TABLE_SRC};
pub use insn::Insn;
pub use validate::validate;
pub use vm::{BpfArgs, Program};

use tracectl::{LevelFilter, trace_target};
trace_target!("bpf", LevelFilter::INFO, &["npf"]);

/// Maximum number of instructions in a program.
pub const MAX_INSNS: usize = 4096;
/// Number of scratch memory words.
pub const MEMWORDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BpfError {
    #[error("empty program")]
    Empty,
    #[error("program too long: {0} instructions")]
    TooLong(usize),
    #[error("invalid opcode {code:#06x} at {pc}")]
    InvalidOpcode { pc: usize, code: u16 },
    #[error("jump out of range at {pc}")]
    JumpOutOfRange { pc: usize },
    #[error("invalid memory word {k} at {pc}")]
    InvalidMemWord { pc: usize, k: u32 },
    #[error("division by zero at {pc}")]
    DivisionByZero { pc: usize },
    #[error("invalid coprocessor {k} at {pc}")]
    InvalidCoprocessor { pc: usize, k: u32 },
    #[error("program does not end with a return")]
    NoReturn,
    #[error("program image length {0} is not a multiple of the instruction size")]
    InvalidImage(usize),
}
