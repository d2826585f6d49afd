//!
//! The physical register file of the supported GPU ISAs.
//!

///
/// A physical register.
///
/// Scalar registers, vector registers, and the architectural specials the
/// instrumentation core needs to name. Wide operands are expressed as their
/// low register; the register class carries the width.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Register {
    /// A 32-bit scalar register `s<N>`.
    Sgpr(u16),
    /// A 32-bit vector register `v<N>`.
    Vgpr(u16),
    /// The low half of the vector condition code mask.
    VccLo,
    /// The high half of the vector condition code mask.
    VccHi,
    /// The low half of the execution mask.
    ExecLo,
    /// The high half of the execution mask.
    ExecHi,
    /// The memory-descriptor register.
    M0,
    /// The low half of the flat-scratch base.
    FlatScratchLo,
    /// The high half of the flat-scratch base.
    FlatScratchHi,
    /// The scalar condition code. Not addressable as a source operand.
    Scc,
}

///
/// A register class, deciding which physical registers a virtual register
/// may be allocated to.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum RegisterClass {
    /// A single scalar register.
    Sgpr32,
    /// An even-aligned scalar register pair.
    Sgpr64,
    /// A single vector register.
    Vgpr32,
}

/// Source-operand field values with special meaning.
const SRC_VCC_LO: u16 = 106;
const SRC_VCC_HI: u16 = 107;
const SRC_FLAT_SCRATCH_LO: u16 = 102;
const SRC_FLAT_SCRATCH_HI: u16 = 103;
const SRC_M0: u16 = 124;
const SRC_EXEC_LO: u16 = 126;
const SRC_EXEC_HI: u16 = 127;
const SRC_INLINE_INT_FIRST: u16 = 128;
const SRC_INLINE_INT_LAST: u16 = 192;
const SRC_INLINE_NEG_FIRST: u16 = 193;
const SRC_INLINE_NEG_LAST: u16 = 208;
/// A 32-bit literal follows the instruction word.
pub const SRC_LITERAL: u16 = 255;
const SRC_VGPR_FIRST: u16 = 256;

///
/// A decoded source-operand field.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOperand {
    /// A register operand.
    Register(Register),
    /// An inline integer constant.
    Inline(i64),
    /// A literal constant in the trailing dword.
    Literal,
}

impl Register {
    ///
    /// Decodes a 9-bit source-operand field.
    ///
    pub fn decode_source(encoding: u16) -> Option<SourceOperand> {
        let operand = match encoding {
            0..=101 => SourceOperand::Register(Register::Sgpr(encoding)),
            SRC_FLAT_SCRATCH_LO => SourceOperand::Register(Register::FlatScratchLo),
            SRC_FLAT_SCRATCH_HI => SourceOperand::Register(Register::FlatScratchHi),
            SRC_VCC_LO => SourceOperand::Register(Register::VccLo),
            SRC_VCC_HI => SourceOperand::Register(Register::VccHi),
            SRC_M0 => SourceOperand::Register(Register::M0),
            SRC_EXEC_LO => SourceOperand::Register(Register::ExecLo),
            SRC_EXEC_HI => SourceOperand::Register(Register::ExecHi),
            SRC_INLINE_INT_FIRST..=SRC_INLINE_INT_LAST => {
                SourceOperand::Inline((encoding - SRC_INLINE_INT_FIRST) as i64)
            }
            SRC_INLINE_NEG_FIRST..=SRC_INLINE_NEG_LAST => {
                SourceOperand::Inline(-((encoding - SRC_INLINE_NEG_FIRST + 1) as i64))
            }
            SRC_LITERAL => SourceOperand::Literal,
            SRC_VGPR_FIRST..=511 => {
                SourceOperand::Register(Register::Vgpr(encoding - SRC_VGPR_FIRST))
            }
            _ => return None,
        };
        Some(operand)
    }

    ///
    /// Encodes this register into a source-operand field.
    ///
    pub fn encode_source(&self) -> u16 {
        match self {
            Register::Sgpr(index) => *index,
            Register::Vgpr(index) => SRC_VGPR_FIRST + *index,
            Register::FlatScratchLo => SRC_FLAT_SCRATCH_LO,
            Register::FlatScratchHi => SRC_FLAT_SCRATCH_HI,
            Register::VccLo => SRC_VCC_LO,
            Register::VccHi => SRC_VCC_HI,
            Register::M0 => SRC_M0,
            Register::ExecLo => SRC_EXEC_LO,
            Register::ExecHi => SRC_EXEC_HI,
            Register::Scc => panic!("SCC is not encodable as a source operand"),
        }
    }

    ///
    /// Decodes a 7-bit scalar-destination field.
    ///
    pub fn decode_scalar_dest(encoding: u16) -> Option<Register> {
        match Self::decode_source(encoding)? {
            SourceOperand::Register(register) if register.is_scalar() => Some(register),
            _ => None,
        }
    }

    ///
    /// Whether this register lives in the scalar file.
    ///
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Register::Vgpr(_))
    }

    ///
    /// Whether this register is a plain allocatable SGPR.
    ///
    pub fn is_sgpr(&self) -> bool {
        matches!(self, Register::Sgpr(_))
    }

    ///
    /// Whether this register is a VGPR.
    ///
    pub fn is_vgpr(&self) -> bool {
        matches!(self, Register::Vgpr(_))
    }

    ///
    /// Returns the register `offset` slots above this one within its file.
    ///
    /// Used to address the high halves of wide operands.
    ///
    pub fn offset_by(&self, offset: u16) -> Register {
        match self {
            Register::Sgpr(index) => Register::Sgpr(index + offset),
            Register::Vgpr(index) => Register::Vgpr(index + offset),
            Register::VccLo if offset == 1 => Register::VccHi,
            Register::ExecLo if offset == 1 => Register::ExecHi,
            Register::FlatScratchLo if offset == 1 => Register::FlatScratchHi,
            other if offset == 0 => *other,
            other => panic!("register {other} has no slot at offset {offset}"),
        }
    }

    ///
    /// The natural register class of a single register of this file.
    ///
    pub fn natural_class(&self) -> RegisterClass {
        if self.is_vgpr() {
            RegisterClass::Vgpr32
        } else {
            RegisterClass::Sgpr32
        }
    }
}

impl RegisterClass {
    ///
    /// The width of the class in 32-bit slots.
    ///
    pub fn slot_count(&self) -> u16 {
        match self {
            RegisterClass::Sgpr32 | RegisterClass::Vgpr32 => 1,
            RegisterClass::Sgpr64 => 2,
        }
    }

    ///
    /// Whether the class allocates from the scalar file.
    ///
    pub fn is_scalar(&self) -> bool {
        !matches!(self, RegisterClass::Vgpr32)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Register::Sgpr(index) => write!(f, "s{index}"),
            Register::Vgpr(index) => write!(f, "v{index}"),
            Register::VccLo => write!(f, "vcc_lo"),
            Register::VccHi => write!(f, "vcc_hi"),
            Register::ExecLo => write!(f, "exec_lo"),
            Register::ExecHi => write!(f, "exec_hi"),
            Register::M0 => write!(f, "m0"),
            Register::FlatScratchLo => write!(f, "flat_scratch_lo"),
            Register::FlatScratchHi => write!(f, "flat_scratch_hi"),
            Register::Scc => write!(f, "scc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Register;
    use super::SourceOperand;

    #[test]
    fn source_encoding_round_trip() {
        for register in [
            Register::Sgpr(0),
            Register::Sgpr(101),
            Register::Vgpr(0),
            Register::Vgpr(255),
            Register::VccLo,
            Register::ExecLo,
            Register::ExecHi,
            Register::M0,
        ] {
            let encoding = register.encode_source();
            assert_eq!(
                Register::decode_source(encoding),
                Some(SourceOperand::Register(register))
            );
        }
    }

    #[test]
    fn inline_constants_decode() {
        assert_eq!(Register::decode_source(128), Some(SourceOperand::Inline(0)));
        assert_eq!(Register::decode_source(192), Some(SourceOperand::Inline(64)));
        assert_eq!(Register::decode_source(193), Some(SourceOperand::Inline(-1)));
        assert_eq!(Register::decode_source(208), Some(SourceOperand::Inline(-16)));
        assert_eq!(Register::decode_source(255), Some(SourceOperand::Literal));
    }
}
