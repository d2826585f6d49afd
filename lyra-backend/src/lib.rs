//!
//! Compiler backend services for the Lyra GPU instrumentation toolkit.
//!
//! The backend is consumed by the instrumentation core as a service: target
//! descriptions, machine-code decoding and encoding, machine IR containers,
//! the hook IR with its payload format, and the code generation passes that
//! turn machine IR back into a relocatable object.
//!

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod codegen;
pub mod ir;
pub mod mc;
pub mod metadata;
pub mod mir;
pub mod target;

pub use self::metadata::KernelArgKind;
pub use self::metadata::KernelArgument;
pub use self::metadata::KernelDescriptor;
pub use self::metadata::KernelMetadata;
pub use self::target::Register;
pub use self::target::RegisterClass;
pub use self::target::TargetDescription;
pub use self::target::TargetError;
pub use self::target::TargetMachine;
pub use self::target::opcode::Opcode;
