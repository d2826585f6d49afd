//!
//! The machine-code encoder.
//!

use crate::mc::McInst;
use crate::mc::McOperand;
use crate::target::Register;
use crate::target::opcode::Format;
use crate::target::opcode::Opcode;
use crate::target::register::SRC_LITERAL;

///
/// The encoding error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A pseudo opcode reached the encoder.
    #[error("pseudo opcode `{0}` cannot be encoded")]
    Pseudo(&'static str),
    /// The instruction shape does not match the opcode's encoding family.
    #[error("malformed `{mnemonic}`: {reason}")]
    Malformed {
        /// The instruction mnemonic.
        mnemonic: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn malformed(opcode: Opcode, reason: impl ToString) -> EncodeError {
    EncodeError::Malformed {
        mnemonic: opcode.mnemonic(),
        reason: reason.to_string(),
    }
}

///
/// Encodes one instruction, appending its bytes to `out`.
///
/// Returns the encoded size in bytes.
///
pub fn encode(inst: &McInst, out: &mut Vec<u8>) -> Result<u8, EncodeError> {
    let description = inst.opcode.description();
    let op = description.op as u32;

    let mut literal: Option<u32> = None;
    let mut source = |operand: &McOperand| -> Result<u32, EncodeError> {
        match operand {
            McOperand::Register(register) => Ok(register.encode_source() as u32),
            McOperand::Immediate(value @ -16..=64) => Ok(if *value >= 0 {
                128 + *value as u32
            } else {
                192 + value.unsigned_abs() as u32
            }),
            McOperand::Immediate(value) => {
                if literal.replace(*value as u32).is_some() {
                    return Err(malformed(inst.opcode, "two literal operands"));
                }
                Ok(SRC_LITERAL as u32)
            }
        }
    };

    let reg = |operand: &McOperand, what: &str| -> Result<Register, EncodeError> {
        match operand {
            McOperand::Register(register) => Ok(*register),
            McOperand::Immediate(_) => Err(malformed(inst.opcode, format!("{what} register"))),
        }
    };
    let imm = |operand: &McOperand, what: &str| -> Result<i64, EncodeError> {
        match operand {
            McOperand::Immediate(value) => Ok(*value),
            McOperand::Register(_) => Err(malformed(inst.opcode, format!("{what} immediate"))),
        }
    };
    let operand = |index: usize| -> Result<&McOperand, EncodeError> {
        inst.operands
            .get(index)
            .ok_or_else(|| malformed(inst.opcode, format!("missing operand {index}")))
    };

    let mut words: Vec<u32> = Vec::with_capacity(2);
    match description.format {
        Format::Sop2 => {
            let sdst = reg(operand(0)?, "destination must be a")?.encode_source() as u32;
            let ssrc0 = source(operand(1)?)?;
            let ssrc1 = source(operand(2)?)?;
            words.push((0b10 << 30) | (op << 23) | (sdst << 16) | (ssrc1 << 8) | ssrc0);
        }
        Format::Sop1 => {
            let (sdst, ssrc0) = match inst.opcode {
                Opcode::SGetpcB64 => {
                    (reg(operand(0)?, "destination must be a")?.encode_source() as u32, 0)
                }
                Opcode::SSetpcB64 => (0, source(operand(0)?)?),
                _ => (
                    reg(operand(0)?, "destination must be a")?.encode_source() as u32,
                    source(operand(1)?)?,
                ),
            };
            words.push((0b1_0111_1101 << 23) | (sdst << 16) | (op << 8) | ssrc0);
        }
        Format::Sopk => {
            let sdst = reg(operand(0)?, "destination must be a")?.encode_source() as u32;
            let simm16 = (imm(operand(1)?, "operand 1 must be an")? as u16) as u32;
            words.push((0b1011 << 28) | (op << 23) | (sdst << 16) | simm16);
        }
        Format::Sopc => {
            let ssrc0 = source(operand(0)?)?;
            let ssrc1 = source(operand(1)?)?;
            words.push((0b1_0111_1110 << 23) | (op << 16) | (ssrc1 << 8) | ssrc0);
        }
        Format::Sopp => {
            let simm16 = (imm(operand(0)?, "operand 0 must be an")? as u16) as u32;
            words.push((0b1_0111_1111 << 23) | (op << 16) | simm16);
        }
        Format::Smem => {
            let sdata = reg(operand(0)?, "data must be a")?.encode_source() as u32;
            let sbase = match reg(operand(1)?, "base must be a")? {
                Register::Sgpr(index) if index % 2 == 0 => (index / 2) as u32,
                other => {
                    return Err(malformed(
                        inst.opcode,
                        format!("base must be an even SGPR pair, got {other}"),
                    ));
                }
            };
            let offset = imm(operand(2)?, "offset must be an")? as u32 & 0xFFFFF;
            words.push((0b110000 << 26) | (op << 18) | (sdata << 6) | sbase);
            words.push(offset);
        }
        Format::Vop1 => {
            let (vdst, src0) = match inst.opcode {
                Opcode::VNop => (0, 0),
                Opcode::VReadfirstlaneB32 => (
                    reg(operand(0)?, "destination must be a")?.encode_source() as u32,
                    source(operand(1)?)?,
                ),
                _ => {
                    let vdst = match reg(operand(0)?, "destination must be a")? {
                        Register::Vgpr(index) => index as u32,
                        other => {
                            return Err(malformed(
                                inst.opcode,
                                format!("destination must be a VGPR, got {other}"),
                            ));
                        }
                    };
                    (vdst, source(operand(1)?)?)
                }
            };
            words.push((0b011_1111 << 25) | (vdst << 17) | (op << 9) | src0);
        }
        Format::Vop2 => {
            let vdst = reg(operand(0)?, "destination must be a")?;
            let vdst = match (inst.opcode, vdst) {
                (Opcode::VReadlaneB32, register) => register.encode_source() as u32,
                (_, Register::Vgpr(index)) => index as u32,
                (_, other) => {
                    return Err(malformed(
                        inst.opcode,
                        format!("destination must be a VGPR, got {other}"),
                    ));
                }
            };
            let src0 = source(operand(1)?)?;
            let is_lane_op = matches!(inst.opcode, Opcode::VReadlaneB32 | Opcode::VWritelaneB32);
            let vsrc1 = match (operand(2)?, is_lane_op) {
                (McOperand::Register(Register::Vgpr(index)), false) => *index as u32,
                (McOperand::Register(Register::Sgpr(index)), true) => *index as u32,
                (McOperand::Immediate(lane @ 0..=63), true) => 128 + *lane as u32,
                (other, _) => {
                    return Err(malformed(
                        inst.opcode,
                        format!("operand 2 is not encodable: {other:?}"),
                    ));
                }
            };
            words.push((op << 25) | (vdst << 17) | (vsrc1 << 9) | src0);
        }
        Format::Flat => {
            words.push((0b110111 << 26) | (op << 18));
            let word1 = if description.is_store {
                let addr = reg(operand(0)?, "address must be a")?;
                let data = reg(operand(1)?, "data must be a")?;
                match (addr, data) {
                    (Register::Vgpr(addr), Register::Vgpr(data)) => {
                        ((data as u32) << 8) | addr as u32
                    }
                    _ => return Err(malformed(inst.opcode, "flat operands must be VGPRs")),
                }
            } else {
                let vdst = reg(operand(0)?, "destination must be a")?;
                let addr = reg(operand(1)?, "address must be a")?;
                match (vdst, addr) {
                    (Register::Vgpr(vdst), Register::Vgpr(addr)) => {
                        ((vdst as u32) << 24) | addr as u32
                    }
                    _ => return Err(malformed(inst.opcode, "flat operands must be VGPRs")),
                }
            };
            words.push(word1);
        }
        Format::Pseudo => return Err(EncodeError::Pseudo(description.mnemonic)),
    }

    if let Some(literal) = literal {
        words.push(literal);
    }
    for word in words.iter() {
        out.extend_from_slice(&word.to_le_bytes());
    }
    Ok((words.len() * 4) as u8)
}

#[cfg(test)]
mod tests {
    use crate::mc::McInst;
    use crate::mc::McOperand;
    use crate::mc::decoder::decode_all;
    use crate::target::Register;
    use crate::target::opcode::Opcode;

    use super::EncodeError;
    use super::encode;

    fn round_trip(inst: McInst) {
        let mut bytes = Vec::new();
        let size = encode(&inst, &mut bytes).expect("Always valid");
        assert_eq!(size as usize, bytes.len());
        let decoded = decode_all(bytes.as_slice()).expect("Always valid");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].inst, inst, "{inst}");
    }

    #[test]
    fn scalar_alu_round_trips() {
        round_trip(McInst::new(
            Opcode::SAddU32,
            vec![
                McOperand::Register(Register::Sgpr(0)),
                McOperand::Register(Register::Sgpr(0)),
                McOperand::Immediate(1),
            ],
        ));
        round_trip(McInst::new(
            Opcode::SMovB32,
            vec![
                McOperand::Register(Register::Sgpr(7)),
                McOperand::Immediate(0x1234_5678),
            ],
        ));
        round_trip(McInst::new(
            Opcode::SGetpcB64,
            vec![McOperand::Register(Register::Sgpr(10))],
        ));
        round_trip(McInst::new(
            Opcode::SSetpcB64,
            vec![McOperand::Register(Register::Sgpr(30))],
        ));
    }

    #[test]
    fn memory_and_vector_round_trips() {
        round_trip(McInst::new(
            Opcode::SLoadDwordx2,
            vec![
                McOperand::Register(Register::Sgpr(8)),
                McOperand::Register(Register::Sgpr(4)),
                McOperand::Immediate(0x40),
            ],
        ));
        round_trip(McInst::new(
            Opcode::VMovB32,
            vec![
                McOperand::Register(Register::Vgpr(3)),
                McOperand::Register(Register::Sgpr(1)),
            ],
        ));
        round_trip(McInst::new(
            Opcode::VWritelaneB32,
            vec![
                McOperand::Register(Register::Vgpr(40)),
                McOperand::Register(Register::Sgpr(5)),
                McOperand::Register(Register::Sgpr(6)),
            ],
        ));
        round_trip(McInst::new(
            Opcode::FlatStoreDword,
            vec![
                McOperand::Register(Register::Vgpr(0)),
                McOperand::Register(Register::Vgpr(2)),
            ],
        ));
    }

    #[test]
    fn rejects_pseudo_opcodes() {
        let mut bytes = Vec::new();
        let error = encode(
            &McInst::new(Opcode::Copy, vec![]),
            &mut bytes,
        )
        .expect_err("Must fail");
        assert_eq!(error, EncodeError::Pseudo("COPY"));
    }
}
