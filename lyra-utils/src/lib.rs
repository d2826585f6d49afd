//!
//! Shared utilities for the Lyra GPU instrumentation toolkit.
//!

pub mod r#const;
pub mod isa;
pub mod mangling;
pub mod state_lock;

pub use self::r#const::*;
pub use self::isa::Isa;
pub use self::isa::IsaParseError;
pub use self::state_lock::SharedStateLock;
pub use self::state_lock::StateLock;
