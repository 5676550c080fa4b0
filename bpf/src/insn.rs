// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Classic BPF instructions.

use serde::{Deserialize, Serialize};

// Instruction classes
pub const LD: u16 = 0x00;
pub const LDX: u16 = 0x01;
pub const ST: u16 = 0x02;
pub const STX: u16 = 0x03;
pub const ALU: u16 = 0x04;
pub const JMP: u16 = 0x05;
pub const RET: u16 = 0x06;
pub const MISC: u16 = 0x07;

// Load sizes
pub const W: u16 = 0x00;
pub const H: u16 = 0x08;
pub const B: u16 = 0x10;

// Load modes
pub const IMM: u16 = 0x00;
pub const ABS: u16 = 0x20;
pub const IND: u16 = 0x40;
pub const MEM: u16 = 0x60;
pub const LEN: u16 = 0x80;
pub const MSH: u16 = 0xa0;

// ALU operations
pub const ADD: u16 = 0x00;
pub const SUB: u16 = 0x10;
pub const MUL: u16 = 0x20;
pub const DIV: u16 = 0x30;
pub const OR: u16 = 0x40;
pub const AND: u16 = 0x50;
pub const LSH: u16 = 0x60;
pub const RSH: u16 = 0x70;
pub const NEG: u16 = 0x80;
pub const MOD: u16 = 0x90;
pub const XOR: u16 = 0xa0;

// Jumps
pub const JA: u16 = 0x00;
pub const JEQ: u16 = 0x10;
pub const JGT: u16 = 0x20;
pub const JGE: u16 = 0x30;
pub const JSET: u16 = 0x40;

// Operand source
pub const K: u16 = 0x00;
pub const X: u16 = 0x08;
/// Return value source: the accumulator.
pub const A: u16 = 0x10;

// Miscellaneous
pub const TAX: u16 = 0x00;
pub const TXA: u16 = 0x80;
/// Call coprocessor `k`.
pub const COP: u16 = 0x20;
/// Call coprocessor `X`.
pub const COPX: u16 = 0x40;

#[must_use]
pub const fn class(code: u16) -> u16 {
    code & 0x07
}

#[must_use]
pub const fn size(code: u16) -> u16 {
    code & 0x18
}

#[must_use]
pub const fn mode(code: u16) -> u16 {
    code & 0xe0
}

#[must_use]
pub const fn op(code: u16) -> u16 {
    code & 0xf0
}

#[must_use]
pub const fn src(code: u16) -> u16 {
    code & 0x08
}

#[must_use]
pub const fn miscop(code: u16) -> u16 {
    code & 0xf8
}

/// A BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(bolero::TypeGenerator))]
pub struct Insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Insn {
    /// Size of an instruction in a program image.
    pub const SIZE: usize = 8;

    #[must_use]
    pub const fn stmt(code: u16, k: u32) -> Insn {
        Insn {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[must_use]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Insn {
        Insn { code, jt, jf, k }
    }

    /// Decode an instruction from its image (host byte order, as `struct bpf_insn`).
    #[must_use]
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Insn {
        Insn {
            code: u16::from_ne_bytes([bytes[0], bytes[1]]),
            jt: bytes[2],
            jf: bytes[3],
            k: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[..2].copy_from_slice(&self.code.to_ne_bytes());
        bytes[2] = self.jt;
        bytes[3] = self.jf;
        bytes[4..].copy_from_slice(&self.k.to_ne_bytes());
        bytes
    }
}
