//!
//! The instruction record.
//!

use lyra_backend::mc::McInst;
use lyra_runtime::LoadedCodeObjectHandle;

///
/// One disassembled instruction.
///
/// Invariant: `size` is strictly positive and equals the distance to the
/// next record's address (or to the end of the owning symbol).
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRecord {
    /// The machine-level instruction form.
    pub inst: McInst,
    /// The device load address.
    pub address: u64,
    /// The encoded size in bytes.
    pub size: u8,
    /// The owning symbol name.
    pub symbol: String,
    /// The owning code object.
    pub lco: LoadedCodeObjectHandle,
}

impl std::fmt::Display for InstructionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#012x}: {}", self.address, self.inst)
    }
}
