//!
//! The machine-code decoder.
//!

use crate::mc::McInst;
use crate::mc::McOperand;
use crate::target::Register;
use crate::target::SourceOperand;
use crate::target::opcode::Format;
use crate::target::opcode::Opcode;

///
/// The decoding error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The byte range ends in the middle of an instruction.
    #[error("truncated instruction at offset {offset:#x}")]
    Truncated {
        /// The offset of the truncated instruction.
        offset: usize,
    },
    /// The instruction word does not decode to a known opcode.
    #[error("invalid instruction word {word:#010x} at offset {offset:#x}")]
    InvalidOpcode {
        /// The offset of the offending word.
        offset: usize,
        /// The offending word.
        word: u32,
    },
    /// An operand field holds a value outside its encoding space.
    #[error("invalid operand field in word {word:#010x} at offset {offset:#x}")]
    InvalidOperand {
        /// The offset of the offending word.
        offset: usize,
        /// The offending word.
        word: u32,
    },
}

///
/// One decoded instruction with its position inside the byte range.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// The decoded instruction.
    pub inst: McInst,
    /// The byte offset from the start of the decoded range.
    pub offset: usize,
    /// The encoded size in bytes, including trailing literals.
    pub size: u8,
}

///
/// Decodes an entire byte range into consecutive instructions.
///
/// The range must cover whole instructions; a trailing partial word is a
/// `Truncated` error.
///
pub fn decode_all(bytes: &[u8]) -> Result<Vec<DecodedInstruction>, DecodeError> {
    let mut decoded = Vec::with_capacity(bytes.len() / 4);
    let mut offset = 0;
    while offset < bytes.len() {
        let instruction = decode_one(bytes, offset)?;
        offset += instruction.size as usize;
        decoded.push(instruction);
    }
    Ok(decoded)
}

///
/// Decodes the instruction at `offset`.
///
fn decode_one(bytes: &[u8], offset: usize) -> Result<DecodedInstruction, DecodeError> {
    let word = read_word(bytes, offset).ok_or(DecodeError::Truncated { offset })?;

    let format = classify(word);
    let (opcode, mut operands, mut size) = match format {
        Format::Sop2 => decode_sop2(word, bytes, offset)?,
        Format::Sop1 => decode_sop1(word, bytes, offset)?,
        Format::Sopk => decode_sopk(word, offset)?,
        Format::Sopc => decode_sopc(word, bytes, offset)?,
        Format::Sopp => decode_sopp(word, offset)?,
        Format::Smem => decode_smem(word, bytes, offset)?,
        Format::Vop1 => decode_vop1(word, bytes, offset)?,
        Format::Vop2 => decode_vop2(word, bytes, offset)?,
        Format::Flat => decode_flat(word, bytes, offset)?,
        Format::Pseudo => unreachable!("classification never yields pseudo"),
    };

    // A literal operand was recorded as a sentinel by the field decoders;
    // patch it with the trailing dword.
    if let Some(position) = operands
        .iter()
        .position(|operand| matches!(operand, McOperand::Immediate(LITERAL_SENTINEL)))
    {
        let literal =
            read_word(bytes, offset + size as usize).ok_or(DecodeError::Truncated { offset })?;
        operands[position] = McOperand::Immediate(literal as i64);
        size += 4;
    }

    Ok(DecodedInstruction {
        inst: McInst::new(opcode, operands),
        offset,
        size,
    })
}

/// Marks a source slot awaiting the trailing literal dword. Outside the
/// value range of every real operand.
const LITERAL_SENTINEL: i64 = i64::MIN;

fn read_word(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

///
/// Classifies an instruction word into its encoding family.
///
fn classify(word: u32) -> Format {
    if word >> 31 == 0 {
        return if (word >> 25) & 0x3F == 0x3F {
            Format::Vop1
        } else {
            Format::Vop2
        };
    }
    match word >> 23 {
        0b1_0111_1101 => return Format::Sop1,
        0b1_0111_1110 => return Format::Sopc,
        0b1_0111_1111 => return Format::Sopp,
        _ => {}
    }
    if word >> 26 == 0b110000 {
        return Format::Smem;
    }
    if word >> 26 == 0b110111 {
        return Format::Flat;
    }
    if word >> 28 == 0b1011 {
        return Format::Sopk;
    }
    Format::Sop2
}

fn lookup(format: Format, op: u16, word: u32, offset: usize) -> Result<Opcode, DecodeError> {
    Opcode::from_fields(format, op).ok_or(DecodeError::InvalidOpcode { offset, word })
}

fn source_operand(field: u16, word: u32, offset: usize) -> Result<McOperand, DecodeError> {
    match Register::decode_source(field) {
        Some(SourceOperand::Register(register)) => Ok(McOperand::Register(register)),
        Some(SourceOperand::Inline(value)) => Ok(McOperand::Immediate(value)),
        Some(SourceOperand::Literal) => Ok(McOperand::Immediate(LITERAL_SENTINEL)),
        None => Err(DecodeError::InvalidOperand { offset, word }),
    }
}

fn scalar_dest(field: u16, word: u32, offset: usize) -> Result<McOperand, DecodeError> {
    Register::decode_scalar_dest(field)
        .map(McOperand::Register)
        .ok_or(DecodeError::InvalidOperand { offset, word })
}

type Fields = (Opcode, Vec<McOperand>, u8);

fn decode_sop2(word: u32, _bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Sop2, ((word >> 23) & 0x7F) as u16, word, offset)?;
    let operands = vec![
        scalar_dest(((word >> 16) & 0x7F) as u16, word, offset)?,
        source_operand((word & 0xFF) as u16, word, offset)?,
        source_operand(((word >> 8) & 0xFF) as u16, word, offset)?,
    ];
    Ok((opcode, operands, 4))
}

fn decode_sop1(word: u32, _bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Sop1, ((word >> 8) & 0xFF) as u16, word, offset)?;
    let mut operands = Vec::with_capacity(2);
    if opcode.description().dest_slots > 0 {
        operands.push(scalar_dest(((word >> 16) & 0x7F) as u16, word, offset)?);
    }
    if opcode != Opcode::SGetpcB64 {
        operands.push(source_operand((word & 0xFF) as u16, word, offset)?);
    }
    Ok((opcode, operands, 4))
}

fn decode_sopk(word: u32, offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Sopk, ((word >> 23) & 0x1F) as u16, word, offset)?;
    let operands = vec![
        scalar_dest(((word >> 16) & 0x7F) as u16, word, offset)?,
        McOperand::Immediate((word & 0xFFFF) as u16 as i16 as i64),
    ];
    Ok((opcode, operands, 4))
}

fn decode_sopc(word: u32, _bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Sopc, ((word >> 16) & 0x7F) as u16, word, offset)?;
    let operands = vec![
        source_operand((word & 0xFF) as u16, word, offset)?,
        source_operand(((word >> 8) & 0xFF) as u16, word, offset)?,
    ];
    Ok((opcode, operands, 4))
}

fn decode_sopp(word: u32, offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Sopp, ((word >> 16) & 0x7F) as u16, word, offset)?;
    // The 16-bit field is kept raw; branch-target evaluators decide its
    // signedness.
    let operands = vec![McOperand::Immediate((word & 0xFFFF) as i64)];
    Ok((opcode, operands, 4))
}

fn decode_smem(word: u32, bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Smem, ((word >> 18) & 0xFF) as u16, word, offset)?;
    let word1 = read_word(bytes, offset + 4).ok_or(DecodeError::Truncated { offset })?;
    let sbase = Register::Sgpr(((word & 0x3F) as u16) * 2);
    let sdata = scalar_dest(((word >> 6) & 0x7F) as u16, word, offset)?;
    let operands = vec![
        sdata,
        McOperand::Register(sbase),
        McOperand::Immediate((word1 & 0xFFFFF) as i64),
    ];
    Ok((opcode, operands, 8))
}

fn decode_vop1(word: u32, _bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Vop1, ((word >> 9) & 0xFF) as u16, word, offset)?;
    let mut operands = Vec::with_capacity(2);
    if opcode.description().dest_slots > 0 {
        let vdst = ((word >> 17) & 0xFF) as u16;
        let destination = if opcode == Opcode::VReadfirstlaneB32 {
            scalar_dest(vdst, word, offset)?
        } else {
            McOperand::Register(Register::Vgpr(vdst))
        };
        operands.push(destination);
        operands.push(source_operand((word & 0x1FF) as u16, word, offset)?);
    }
    Ok((opcode, operands, 4))
}

fn decode_vop2(word: u32, _bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Vop2, ((word >> 25) & 0x3F) as u16, word, offset)?;
    let vdst = ((word >> 17) & 0xFF) as u16;
    let vsrc1 = ((word >> 9) & 0xFF) as u16;
    let src0 = source_operand((word & 0x1FF) as u16, word, offset)?;

    // The lane-access instructions reuse the VOP2 layout with scalar
    // destination and lane-select fields; a lane field of 128 and above is
    // an inline lane number.
    let lane = |field: u16| {
        if field >= 128 {
            McOperand::Immediate((field - 128) as i64)
        } else {
            McOperand::Register(Register::Sgpr(field))
        }
    };
    let operands = match opcode {
        Opcode::VReadlaneB32 => vec![scalar_dest(vdst, word, offset)?, src0, lane(vsrc1)],
        Opcode::VWritelaneB32 => {
            vec![McOperand::Register(Register::Vgpr(vdst)), src0, lane(vsrc1)]
        }
        _ => vec![
            McOperand::Register(Register::Vgpr(vdst)),
            src0,
            McOperand::Register(Register::Vgpr(vsrc1)),
        ],
    };
    Ok((opcode, operands, 4))
}

fn decode_flat(word: u32, bytes: &[u8], offset: usize) -> Result<Fields, DecodeError> {
    let opcode = lookup(Format::Flat, ((word >> 18) & 0x7F) as u16, word, offset)?;
    let word1 = read_word(bytes, offset + 4).ok_or(DecodeError::Truncated { offset })?;
    let addr = Register::Vgpr((word1 & 0xFF) as u16);
    let description = opcode.description();
    let operands = if description.is_store {
        let data = Register::Vgpr(((word1 >> 8) & 0xFF) as u16);
        vec![McOperand::Register(addr), McOperand::Register(data)]
    } else {
        let vdst = Register::Vgpr(((word1 >> 24) & 0xFF) as u16);
        vec![McOperand::Register(vdst), McOperand::Register(addr)]
    };
    Ok((opcode, operands, 8))
}

#[cfg(test)]
mod tests {
    use crate::mc::McOperand;
    use crate::target::Register;
    use crate::target::opcode::Opcode;

    use super::DecodeError;
    use super::decode_all;

    /// `s_mov_b32 s0, 0x10` with a trailing literal, then `s_endpgm`.
    fn mov_literal_endpgm() -> Vec<u8> {
        let mut bytes = Vec::new();
        // SOP1, op 0, sdst s0, ssrc0 literal (255).
        let word = (0b1_0111_1101_u32 << 23) | 0xFF;
        bytes.extend_from_slice(&word.to_le_bytes());
        bytes.extend_from_slice(&0x10_u32.to_le_bytes());
        // SOPP, op 1.
        let endpgm = (0b1_0111_1111_u32 << 23) | (1 << 16);
        bytes.extend_from_slice(&endpgm.to_le_bytes());
        bytes
    }

    #[test]
    fn decodes_literal_and_sizes() {
        let decoded = decode_all(mov_literal_endpgm().as_slice()).expect("Always valid");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].inst.opcode, Opcode::SMovB32);
        assert_eq!(decoded[0].size, 8);
        assert_eq!(
            decoded[0].inst.operands,
            vec![
                McOperand::Register(Register::Sgpr(0)),
                McOperand::Immediate(0x10),
            ]
        );
        assert_eq!(decoded[1].inst.opcode, Opcode::SEndpgm);
        assert_eq!(decoded[1].offset, 8);
        assert_eq!(decoded[1].size, 4);
    }

    #[test]
    fn reports_invalid_opcode_offset() {
        let mut bytes = mov_literal_endpgm();
        // An SOPP word with an undefined opcode field.
        let bogus = (0b1_0111_1111_u32 << 23) | (0x7F << 16);
        bytes.extend_from_slice(&bogus.to_le_bytes());
        let error = decode_all(bytes.as_slice()).expect_err("Must fail");
        assert_eq!(
            error,
            DecodeError::InvalidOpcode {
                offset: 12,
                word: bogus,
            }
        );
    }

    #[test]
    fn reports_truncation() {
        let mut bytes = mov_literal_endpgm();
        bytes.extend_from_slice(&[0x00, 0x00]);
        let error = decode_all(bytes.as_slice()).expect_err("Must fail");
        assert_eq!(error, DecodeError::Truncated { offset: 12 });
    }
}
