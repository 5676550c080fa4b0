// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::insn::{
    A, ABS, ADD, ALU, AND, B, COP, COPX, DIV, H, IMM, IND, Insn, JA, JEQ, JGE, JGT, JMP, JSET, K,
    LD, LDX, LEN, LSH, MEM, MISC, MOD, MSH, MUL, NEG, OR, RET, RSH, ST, STX, SUB, TAX, TXA, W,
    XOR, class, miscop, mode, op, size, src,
};
use crate::{BpfError, MAX_INSNS, MEMWORDS, NCOPROCS};

fn valid_code(code: u16) -> bool {
    if code > 0xff {
        return false;
    }
    match class(code) {
        LD => match mode(code) {
            ABS | IND => matches!(size(code), W | H | B),
            IMM | MEM | LEN => size(code) == W,
            _ => false,
        },
        LDX => matches!(code, 0x01 | 0x61 | 0x81) || code == (LDX | B | MSH),
        ST | STX => code == class(code),
        ALU => match op(code) {
            NEG => code == (ALU | NEG),
            ADD | SUB | MUL | DIV | OR | AND | LSH | RSH | MOD | XOR => true,
            _ => false,
        },
        JMP => match op(code) {
            JA => code == (JMP | JA),
            JEQ | JGT | JGE | JSET => true,
            _ => false,
        },
        RET => code == (RET | K) || code == (RET | A),
        MISC => matches!(miscop(code), TAX | TXA | COP | COPX),
        _ => false,
    }
}

fn check_mem(pc: usize, k: u32) -> Result<(), BpfError> {
    if usize::try_from(k).is_ok_and(|k| k < MEMWORDS) {
        Ok(())
    } else {
        Err(BpfError::InvalidMemWord { pc, k })
    }
}

/// Check that `prog` is a well-formed program: bounded length, legal opcodes, in-range
/// jumps and memory words, no constant division by zero, known coprocessors, and a return as
/// the last instruction.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate(prog: &[Insn]) -> Result<(), BpfError> {
    if prog.is_empty() {
        return Err(BpfError::Empty);
    }
    if prog.len() > MAX_INSNS {
        return Err(BpfError::TooLong(prog.len()));
    }
    for (pc, insn) in prog.iter().enumerate() {
        let code = insn.code;
        if !valid_code(code) {
            return Err(BpfError::InvalidOpcode { pc, code });
        }
        // instructions left after this one
        let left = prog.len() - pc - 1;
        match class(code) {
            LD | LDX if mode(code) == MEM => check_mem(pc, insn.k)?,
            ST | STX => check_mem(pc, insn.k)?,
            ALU if matches!(op(code), DIV | MOD) && src(code) == K && insn.k == 0 => {
                return Err(BpfError::DivisionByZero { pc });
            }
            JMP if op(code) == JA => {
                if !usize::try_from(insn.k).is_ok_and(|k| k < left) {
                    return Err(BpfError::JumpOutOfRange { pc });
                }
            }
            JMP => {
                if usize::from(insn.jt) >= left || usize::from(insn.jf) >= left {
                    return Err(BpfError::JumpOutOfRange { pc });
                }
            }
            MISC if miscop(code) == COP => {
                if !usize::try_from(insn.k).is_ok_and(|k| k < NCOPROCS) {
                    return Err(BpfError::InvalidCoprocessor { pc, k: insn.k });
                }
            }
            _ => {}
        }
    }
    if prog.last().is_some_and(|insn| class(insn.code) == RET) {
        Ok(())
    } else {
        Err(BpfError::NoReturn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::X;

    #[test]
    fn accepts_simple_programs() {
        let prog = [
            Insn::stmt(LD | H | ABS, 2),
            Insn::jump(JMP | JGT | K, 100, 0, 1),
            Insn::stmt(RET | K, 1),
            Insn::stmt(RET | K, 0),
        ];
        assert_eq!(validate(&prog), Ok(()));
        assert_eq!(validate(&[Insn::stmt(RET | A, 0)]), Ok(()));
    }

    #[test]
    fn rejects_malformed_programs() {
        assert_eq!(validate(&[]), Err(BpfError::Empty));
        let long = vec![Insn::stmt(RET | K, 0); MAX_INSNS + 1];
        assert_eq!(validate(&long), Err(BpfError::TooLong(MAX_INSNS + 1)));
        assert_eq!(
            validate(&[Insn::stmt(0xffff, 0), Insn::stmt(RET | K, 0)]),
            Err(BpfError::InvalidOpcode { pc: 0, code: 0xffff })
        );
        assert_eq!(
            validate(&[Insn::jump(JMP | JEQ | K, 0, 1, 0), Insn::stmt(RET | K, 0)]),
            Err(BpfError::JumpOutOfRange { pc: 0 })
        );
        assert_eq!(
            validate(&[Insn::stmt(JMP | JA, 1), Insn::stmt(RET | K, 0)]),
            Err(BpfError::JumpOutOfRange { pc: 0 })
        );
        assert_eq!(
            validate(&[Insn::stmt(ST, 16), Insn::stmt(RET | K, 0)]),
            Err(BpfError::InvalidMemWord { pc: 0, k: 16 })
        );
        assert_eq!(
            validate(&[Insn::stmt(ALU | DIV | K, 0), Insn::stmt(RET | K, 0)]),
            Err(BpfError::DivisionByZero { pc: 0 })
        );
        assert_eq!(
            validate(&[Insn::stmt(MISC | COP, 2), Insn::stmt(RET | K, 0)]),
            Err(BpfError::InvalidCoprocessor { pc: 0, k: 2 })
        );
        assert_eq!(
            validate(&[Insn::stmt(LD | IMM, 1)]),
            Err(BpfError::NoReturn)
        );
    }

    #[test]
    fn opcode_table() {
        for code in [
            LD | W | ABS,
            LD | B | IND,
            LD | W | LEN,
            LD | MEM,
            LDX | IMM,
            LDX | MEM,
            LDX | W | LEN,
            LDX | B | MSH,
            ALU | NEG,
            ALU | ADD | X,
            JMP | JSET | X,
            MISC | TAX,
            MISC | TXA,
            MISC | COPX,
        ] {
            assert!(valid_code(code), "{code:#x} should be valid");
        }
        for code in [LD | W | MSH, LDX | H | ABS, ALU | 0xb0, JMP | 0x50, RET | X, MISC | 0x08] {
            assert!(!valid_code(code), "{code:#x} should be invalid");
        }
    }

    #[test]
    fn never_panics() {
        bolero::check!()
            .with_type::<Vec<Insn>>()
            .for_each(|prog| {
                let _ = validate(prog);
            });
    }
}
