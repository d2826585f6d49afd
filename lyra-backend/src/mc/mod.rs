//!
//! Machine-code decoding and encoding.
//!

pub mod branch;
pub mod decoder;
pub mod encoder;

use crate::target::Register;
use crate::target::opcode::Opcode;

pub use self::branch::evaluate_branch;
pub use self::decoder::DecodeError;
pub use self::decoder::DecodedInstruction;
pub use self::decoder::decode_all;
pub use self::encoder::EncodeError;
pub use self::encoder::encode;

///
/// A decoded machine instruction: the opcode and its explicit operands.
///
/// Implicit state (SCC, EXEC, memory counters) is carried by the opcode
/// description, not by operands.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct McInst {
    /// The opcode.
    pub opcode: Opcode,
    /// The explicit operands, destination first.
    pub operands: Vec<McOperand>,
}

///
/// A machine-code-level operand.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum McOperand {
    /// A physical register. Wide operands name their low register.
    Register(Register),
    /// An immediate: an inline constant, a trailing literal, or a 16-bit
    /// instruction field, stored as decoded.
    Immediate(i64),
}

impl McInst {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(opcode: Opcode, operands: Vec<McOperand>) -> Self {
        Self { opcode, operands }
    }
}

impl std::fmt::Display for McInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        for (index, operand) in self.operands.iter().enumerate() {
            let separator = if index == 0 { " " } else { ", " };
            match operand {
                McOperand::Register(register) => write!(f, "{separator}{register}")?,
                McOperand::Immediate(value) => {
                    if *value < 0 {
                        write!(f, "{separator}{value}")?
                    } else {
                        write!(f, "{separator}0x{value:x}")?
                    }
                }
            }
        }
        Ok(())
    }
}
