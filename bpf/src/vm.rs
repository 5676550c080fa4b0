// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Program execution.

use crate::insn::{
    A, ABS, ADD, ALU, AND, B, COP, COPX, DIV, H, IMM, IND, Insn, JA, JEQ, JGE, JGT, JMP, JSET, K,
    LD, LDX, LEN, LSH, MEM, MISC, MOD, MSH, MUL, NEG, OR, RET, RSH, ST, STX, SUB, TAX, TXA, W,
    XOR, class, miscop, mode, op, size, src,
};
use crate::{BpfError, MEMWORDS, NCOPROCS, cop, validate};
use net::buffer::NetBuffer;
use net::cache::PacketCache;
use table::TableSet;

/// What a program runs against.
#[derive(Debug, Clone, Copy)]
pub struct BpfArgs<'a> {
    pub pkt: &'a dyn NetBuffer,
    pub cache: &'a PacketCache,
    pub tables: Option<&'a TableSet>,
}

/// A validated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program(Box<[Insn]>);

fn load(pkt: &dyn NetBuffer, offset: u32, width: usize) -> Option<u32> {
    let offset = usize::try_from(offset).ok()?;
    let end = offset.checked_add(width)?;
    if end > pkt.len() {
        return None;
    }
    let mut value: u32 = 0;
    match pkt.window(offset, width) {
        Some(bytes) => {
            for byte in bytes {
                value = (value << 8) | u32::from(*byte);
            }
        }
        // Not contiguous: gather the octets one by one.
        None => {
            for at in offset..end {
                let byte = pkt.window(at, 1)?.first().copied()?;
                value = (value << 8) | u32::from(byte);
            }
        }
    }
    Some(value)
}

fn width(code: u16) -> usize {
    match size(code) {
        H => 2,
        B => 1,
        _ => 4,
    }
}

fn pkt_len(pkt: &dyn NetBuffer) -> u32 {
    u32::try_from(pkt.len()).unwrap_or(u32::MAX)
}

fn mem_index(k: u32) -> usize {
    usize::try_from(k).unwrap_or(MEMWORDS) % MEMWORDS
}

impl Program {
    /// Validate and wrap a program.
    ///
    /// # Errors
    ///
    /// Returns the validation error if the program is not well-formed.
    pub fn new(insns: Vec<Insn>) -> Result<Program, BpfError> {
        validate(&insns)?;
        Ok(Program(insns.into_boxed_slice()))
    }

    /// Decode and validate a program from its image.
    ///
    /// # Errors
    ///
    /// Fails if the image is truncated or the program is not well-formed.
    pub fn from_image(image: &[u8]) -> Result<Program, BpfError> {
        if image.len() % Insn::SIZE != 0 {
            return Err(BpfError::InvalidImage(image.len()));
        }
        let insns = image
            .chunks_exact(Insn::SIZE)
            .map(|chunk| {
                let mut bytes = [0; Insn::SIZE];
                bytes.copy_from_slice(chunk);
                Insn::from_bytes(bytes)
            })
            .collect();
        Program::new(insns)
    }

    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        self.0.iter().flat_map(Insn::to_bytes).collect()
    }

    #[must_use]
    pub fn insns(&self) -> &[Insn] {
        &self.0
    }

    /// Run the program and return its result. A load beyond the end of the packet ends the
    /// program with 0, as does a division by zero.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn filter(&self, args: &BpfArgs<'_>) -> u32 {
        let mut mem = [0u32; MEMWORDS];
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut pc: usize = 0;

        loop {
            let Some(insn) = self.0.get(pc) else {
                return 0;
            };
            let code = insn.code;
            let k = insn.k;
            pc += 1;
            match class(code) {
                LD => {
                    a = match mode(code) {
                        ABS => match load(args.pkt, k, width(code)) {
                            Some(v) => v,
                            None => return 0,
                        },
                        IND => {
                            let Some(offset) = x.checked_add(k) else {
                                return 0;
                            };
                            match load(args.pkt, offset, width(code)) {
                                Some(v) => v,
                                None => return 0,
                            }
                        }
                        LEN if size(code) == W => pkt_len(args.pkt),
                        MEM => mem[mem_index(k)],
                        IMM => k,
                        _ => return 0,
                    };
                }
                LDX => {
                    x = match mode(code) {
                        IMM => k,
                        MEM => mem[mem_index(k)],
                        LEN => pkt_len(args.pkt),
                        MSH => match load(args.pkt, k, 1) {
                            Some(v) => (v & 0xf) << 2,
                            None => return 0,
                        },
                        _ => return 0,
                    };
                }
                ST => mem[mem_index(k)] = a,
                STX => mem[mem_index(k)] = x,
                ALU => {
                    if op(code) == NEG {
                        a = a.wrapping_neg();
                        continue;
                    }
                    let operand = if src(code) == K { k } else { x };
                    a = match op(code) {
                        ADD => a.wrapping_add(operand),
                        SUB => a.wrapping_sub(operand),
                        MUL => a.wrapping_mul(operand),
                        DIV => match a.checked_div(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        MOD => match a.checked_rem(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        OR => a | operand,
                        AND => a & operand,
                        XOR => a ^ operand,
                        LSH => a.checked_shl(operand).unwrap_or(0),
                        RSH => a.checked_shr(operand).unwrap_or(0),
                        _ => return 0,
                    };
                }
                JMP => {
                    if op(code) == JA {
                        let Ok(offset) = usize::try_from(k) else {
                            return 0;
                        };
                        pc = pc.saturating_add(offset);
                        continue;
                    }
                    let operand = if src(code) == K { k } else { x };
                    let taken = match op(code) {
                        JEQ => a == operand,
                        JGT => a > operand,
                        JGE => a >= operand,
                        JSET => a & operand != 0,
                        _ => return 0,
                    };
                    pc += usize::from(if taken { insn.jt } else { insn.jf });
                }
                RET => {
                    return if code == (RET | A) { a } else { k };
                }
                MISC => match miscop(code) {
                    TAX => x = a,
                    TXA => a = x,
                    COP => a = cop::call(k, args, &mut mem, a),
                    COPX => {
                        if !usize::try_from(x).is_ok_and(|func| func < NCOPROCS) {
                            return 0;
                        }
                        a = cop::call(x, args, &mut mem, a);
                    }
                    _ => return 0,
                },
                _ => return 0,
            }
        }
    }

    /// Whether the program accepts the packet.
    #[must_use]
    pub fn matches(&self, args: &BpfArgs<'_>) -> bool {
        self.filter(args) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{COP_L3, COP_TABLE, MW_IPVER, MW_L4PROTO, TABLE_SRC};
    use ipnet::IpNet;
    use net::buffer::TestBuffer;
    use net::test_utils::{TcpSegment, tcp, udp};
    use table::{Table, TableType};

    fn sock(s: &str) -> std::net::SocketAddr {
        s.parse().unwrap()
    }

    fn run(prog: &Program, pkt: &mut TestBuffer, tables: Option<&TableSet>) -> u32 {
        let cache = PacketCache::new(pkt).unwrap();
        let args = BpfArgs {
            pkt: &*pkt,
            cache: &cache,
            tables,
        };
        prog.filter(&args)
    }

    // ip proto tcp (IPv4 only)
    fn tcp_filter() -> Program {
        Program::new(vec![
            Insn::stmt(LD | B | ABS, 9),
            Insn::jump(JMP | JEQ | K, 6, 0, 1),
            Insn::stmt(RET | K, 1),
            Insn::stmt(RET | K, 0),
        ])
        .unwrap()
    }

    #[test]
    fn matches_protocol() {
        let prog = tcp_filter();
        let mut pkt = tcp(sock("10.0.0.1:1000"), sock("10.0.0.2:80"), &TcpSegment::default());
        assert_eq!(run(&prog, &mut pkt, None), 1);
        let mut pkt = udp(sock("10.0.0.1:1000"), sock("10.0.0.2:53"), b"q");
        assert_eq!(run(&prog, &mut pkt, None), 0);
    }

    #[test]
    fn destination_port_with_msh() {
        // X = IP header length, then load the destination port
        let prog = Program::new(vec![
            Insn::stmt(LDX | B | MSH, 0),
            Insn::stmt(LD | H | IND, 2),
            Insn::stmt(RET | A, 0),
        ])
        .unwrap();
        let mut pkt = udp(sock("10.0.0.1:1000"), sock("10.0.0.2:53"), b"q");
        assert_eq!(run(&prog, &mut pkt, None), 53);
    }

    #[test]
    fn loads_work_across_segments() {
        let prog = Program::new(vec![Insn::stmt(LD | W | ABS, 10), Insn::stmt(RET | A, 0)])
            .unwrap();
        let whole = udp(sock("10.0.0.1:1000"), sock("10.0.0.2:53"), b"q");
        let data = whole.to_vec();
        let mut split = TestBuffer::split_at(&data, 12);
        let expected = u32::from_be_bytes([data[10], data[11], data[12], data[13]]);
        assert_eq!(run(&prog, &mut split, None), expected);
    }

    #[test]
    fn out_of_bounds_and_division_by_zero_return_zero() {
        let mut pkt = udp(sock("10.0.0.1:1000"), sock("10.0.0.2:53"), b"q");
        let prog = Program::new(vec![Insn::stmt(LD | W | ABS, 5000), Insn::stmt(RET | K, 7)])
            .unwrap();
        assert_eq!(run(&prog, &mut pkt, None), 0);
        let prog = Program::new(vec![
            Insn::stmt(LD | IMM, 10),
            Insn::stmt(LDX | IMM, 0),
            Insn::stmt(ALU | DIV | crate::insn::X, 0),
            Insn::stmt(RET | K, 7),
        ])
        .unwrap();
        assert_eq!(run(&prog, &mut pkt, None), 0);
        let prog = Program::new(vec![
            Insn::stmt(LDX | IMM, 9),
            Insn::stmt(MISC | COPX, 0),
            Insn::stmt(RET | K, 7),
        ])
        .unwrap();
        assert_eq!(run(&prog, &mut pkt, None), 0);
    }

    #[test]
    fn l3_coprocessor() {
        let prog = Program::new(vec![
            Insn::stmt(MISC | COP, COP_L3),
            Insn::stmt(ST, 5),
            Insn::stmt(LD | MEM, u32::try_from(MW_L4PROTO).unwrap()),
            Insn::stmt(LDX | MEM, u32::try_from(MW_IPVER).unwrap()),
            Insn::stmt(ALU | LSH | K, 8),
            Insn::stmt(ALU | OR | crate::insn::X, 0),
            Insn::stmt(RET | A, 0),
        ])
        .unwrap();
        let mut pkt = udp(sock("[2001:db8::1]:1000"), sock("[2001:db8::2]:53"), b"q");
        assert_eq!(run(&prog, &mut pkt, None), (17 << 8) | 6);
        let mut pkt = tcp(sock("10.0.0.1:1"), sock("10.0.0.2:2"), &TcpSegment::default());
        assert_eq!(run(&prog, &mut pkt, None), (6 << 8) | 4);
    }

    #[test]
    fn table_coprocessor() {
        let mut tables = TableSet::new(2);
        let blocklist = Table::new("blocklist", 1, TableType::Hash, 0).unwrap();
        blocklist
            .insert("10.0.0.1/32".parse::<IpNet>().unwrap())
            .unwrap();
        tables.insert(blocklist).unwrap();

        let src_in_table = Program::new(vec![
            Insn::stmt(LD | IMM, TABLE_SRC | 1),
            Insn::stmt(MISC | COP, COP_TABLE),
            Insn::stmt(RET | A, 0),
        ])
        .unwrap();
        let dst_in_table = Program::new(vec![
            Insn::stmt(LD | IMM, 1),
            Insn::stmt(MISC | COP, COP_TABLE),
            Insn::stmt(RET | A, 0),
        ])
        .unwrap();
        let missing_table = Program::new(vec![
            Insn::stmt(LD | IMM, TABLE_SRC),
            Insn::stmt(MISC | COP, COP_TABLE),
            Insn::stmt(RET | A, 0),
        ])
        .unwrap();

        let mut pkt = udp(sock("10.0.0.1:1000"), sock("10.0.0.2:53"), b"q");
        assert_eq!(run(&src_in_table, &mut pkt, Some(&tables)), 1);
        assert_eq!(run(&dst_in_table, &mut pkt, Some(&tables)), 0);
        assert_eq!(run(&missing_table, &mut pkt, Some(&tables)), 0);
        assert_eq!(run(&src_in_table, &mut pkt, None), 0);
    }

    #[test]
    fn image_round_trip_validates() {
        let prog = tcp_filter();
        assert_eq!(Program::from_image(&prog.to_image()), Ok(prog));
        assert_eq!(Program::from_image(&[0; 7]), Err(BpfError::InvalidImage(7)));
        let mut image = Insn::stmt(LD | IMM, 0).to_bytes().to_vec();
        image.extend(Insn::stmt(LD | IMM, 0).to_bytes());
        assert_eq!(Program::from_image(&image), Err(BpfError::NoReturn));
    }

    #[test]
    fn valid_programs_never_panic() {
        bolero::check!()
            .with_type::<Vec<Insn>>()
            .for_each(|insns| {
                let Ok(prog) = Program::new(insns.clone()) else {
                    return;
                };
                let mut pkt = tcp(
                    sock("10.0.0.1:1000"),
                    sock("10.0.0.2:80"),
                    &TcpSegment {
                        payload_len: 40,
                        ..TcpSegment::default()
                    },
                );
                let tables = TableSet::new(1);
                let _ = run(&prog, &mut pkt, Some(&tables));
            });
    }
}
