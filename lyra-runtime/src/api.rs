//!
//! The runtime API-table snapshot.
//!

use std::sync::Arc;

use lyra_utils::Isa;

use crate::error::RuntimeError;
use crate::handle::Agent;
use crate::handle::ExecutableHandle;
use crate::handle::ExecutableSymbolHandle;
use crate::handle::LoadedCodeObjectHandle;

///
/// The core runtime entry points the instrumentation system drives.
///
pub trait CoreApi: Send + Sync {
    ///
    /// The ISA of an agent.
    ///
    fn agent_isa(&self, agent: Agent) -> Result<Isa, RuntimeError>;

    ///
    /// Creates an empty executable targeting an agent.
    ///
    fn create_executable(&self, agent: Agent) -> Result<ExecutableHandle, RuntimeError>;

    ///
    /// Loads a code object from a reader over `bytes` into an executable.
    ///
    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: Agent,
        bytes: &[u8],
    ) -> Result<LoadedCodeObjectHandle, RuntimeError>;

    ///
    /// Defines an agent-external variable inside an unfrozen executable.
    ///
    fn define_external_variable(
        &self,
        executable: ExecutableHandle,
        name: &str,
        address: u64,
    ) -> Result<(), RuntimeError>;

    ///
    /// Freezes an executable, making its symbols queryable.
    ///
    fn freeze_executable(&self, executable: ExecutableHandle) -> Result<(), RuntimeError>;

    ///
    /// Destroys an executable and everything loaded into it.
    ///
    fn destroy_executable(&self, executable: ExecutableHandle) -> Result<(), RuntimeError>;
}

///
/// The loader entry points: introspection over loaded code objects.
///
pub trait LoaderApi: Send + Sync {
    ///
    /// The raw ELF bytes behind a loaded code object. The returned buffer
    /// is a copy; the runtime may reclaim its own storage at any time.
    ///
    fn code_object_storage(&self, lco: LoadedCodeObjectHandle) -> Result<Vec<u8>, RuntimeError>;

    ///
    /// The agent a code object is loaded onto.
    ///
    fn code_object_agent(&self, lco: LoadedCodeObjectHandle) -> Result<Agent, RuntimeError>;

    ///
    /// The executable a code object is loaded into.
    ///
    fn code_object_executable(
        &self,
        lco: LoadedCodeObjectHandle,
    ) -> Result<ExecutableHandle, RuntimeError>;

    ///
    /// The device base address of a code object's loaded image.
    ///
    fn code_object_load_base(&self, lco: LoadedCodeObjectHandle) -> Result<u64, RuntimeError>;

    ///
    /// The loaded image size in bytes.
    ///
    fn code_object_load_size(&self, lco: LoadedCodeObjectHandle) -> Result<u64, RuntimeError>;

    ///
    /// The signed delta between file addresses and loaded device addresses.
    ///
    fn code_object_load_delta(&self, lco: LoadedCodeObjectHandle) -> Result<i64, RuntimeError>;

    ///
    /// The device load address of every allocated section, keyed by the
    /// section's index in the ELF.
    ///
    fn code_object_section_bases(
        &self,
        lco: LoadedCodeObjectHandle,
    ) -> Result<Vec<(usize, u64)>, RuntimeError>;

    ///
    /// Copies `size` bytes of loaded device memory into a host buffer.
    ///
    fn host_view(&self, device_address: u64, size: u64) -> Result<Vec<u8>, RuntimeError>;

    ///
    /// The code objects loaded into an executable.
    ///
    fn executable_code_objects(
        &self,
        executable: ExecutableHandle,
    ) -> Result<Vec<LoadedCodeObjectHandle>, RuntimeError>;

    ///
    /// The device address of a symbol inside a frozen executable,
    /// external definitions included.
    ///
    fn symbol_device_address(
        &self,
        executable: ExecutableHandle,
        name: &str,
    ) -> Result<u64, RuntimeError>;

    ///
    /// The runtime-visible handle of a globally bound symbol.
    ///
    fn symbol_handle(
        &self,
        executable: ExecutableHandle,
        name: &str,
    ) -> Result<ExecutableSymbolHandle, RuntimeError>;
}

///
/// The immutable API-table snapshot captured at tool-configure time.
///
#[derive(Clone)]
pub struct ApiTable {
    /// The core runtime table.
    pub core: Arc<dyn CoreApi>,
    /// The loader table.
    pub loader: Arc<dyn LoaderApi>,
}

impl std::fmt::Debug for ApiTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTable").finish_non_exhaustive()
    }
}
