//!
//! Shared constants.
//!

/// The symbol-name prefix under which tools export hook-handle shadow pointers.
pub const HOOK_HANDLE_PREFIX: &str = "__luthier_hook_handle_";

/// The reserved managed variable every tool payload defines.
///
/// Its presence both forces the runtime to load the payload eagerly and
/// identifies the frozen executable as a tool payload rather than an
/// application code object.
pub const TOOL_MARKER_VARIABLE: &str = "__lyra_reserved_managed_var";

/// The ELF section the serialized hook IR payload is embedded in.
pub const PAYLOAD_SECTION: &str = ".lyra.payload";

/// The device-function attribute marking hook entry points inside the payload.
pub const HOOK_ATTRIBUTE: &str = "lyra_hook";

/// The vendor name of the metadata note emitted into instrumented objects.
pub const METADATA_NOTE_NAME: &str = "LYRA";

/// The note type of the kernel metadata blob.
pub const METADATA_NOTE_TYPE: u32 = 32;
