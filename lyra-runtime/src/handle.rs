//!
//! Value-type runtime handles.
//!

///
/// A GPU agent handle.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Agent(pub u64);

///
/// A runtime executable handle.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutableHandle(pub u64);

///
/// A handle of one code object loaded onto one agent inside one executable.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadedCodeObjectHandle(pub u64);

///
/// A runtime-visible executable symbol handle. Only globally bound symbols
/// have one.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutableSymbolHandle(pub u64);

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent:{:#x}", self.0)
    }
}

impl std::fmt::Display for ExecutableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exec:{:#x}", self.0)
    }
}

impl std::fmt::Display for LoadedCodeObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lco:{:#x}", self.0)
    }
}
