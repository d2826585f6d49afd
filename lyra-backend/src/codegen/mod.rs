//!
//! Code generation passes.
//!

pub mod emit;
pub mod isel;
pub mod regalloc;

pub use self::emit::EmitError;
pub use self::emit::EmitGlobal;
pub use self::emit::EmitInput;
pub use self::emit::emit_payload_object;
pub use self::emit::emit_relocatable;
pub use self::emit::print_assembly;
pub use self::isel::SelectError;
pub use self::isel::Selection;
pub use self::isel::select_body;
pub use self::regalloc::AllocationInput;
pub use self::regalloc::AllocationResult;
pub use self::regalloc::RegAllocError;
pub use self::regalloc::allocate;
