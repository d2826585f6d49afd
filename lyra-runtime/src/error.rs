//!
//! The runtime error.
//!

///
/// The runtime operation error, mirroring the status codes the underlying
/// runtime reports.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A handle does not refer to a live runtime object.
    #[error("invalid runtime handle {0:#x}")]
    InvalidHandle(u64),
    /// The executable is frozen and rejects further mutation.
    #[error("executable is frozen")]
    Frozen,
    /// The operation requires a frozen executable.
    #[error("executable is not frozen")]
    NotFrozen,
    /// A symbol is not defined in the queried executable.
    #[error("symbol `{0}` is not defined")]
    SymbolNotFound(String),
    /// A device address does not fall into any loaded range.
    #[error("device address {0:#x} is not loaded")]
    UnmappedAddress(u64),
    /// The code object is malformed.
    #[error("code object: {0}")]
    CodeObject(String),
}

impl RuntimeError {
    ///
    /// The numeric status code of this error, in the runtime's convention.
    ///
    pub fn status(&self) -> u32 {
        match self {
            RuntimeError::InvalidHandle(_) => 0x1001,
            RuntimeError::Frozen => 0x1002,
            RuntimeError::NotFrozen => 0x1003,
            RuntimeError::SymbolNotFound(_) => 0x1004,
            RuntimeError::UnmappedAddress(_) => 0x1005,
            RuntimeError::CodeObject(_) => 0x1006,
        }
    }
}
