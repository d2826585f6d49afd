//!
//! The loaded-code-object model.
//!

use lyra_runtime::Agent;
use lyra_runtime::ApiTable;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::LoadedCodeObjectHandle;
use lyra_utils::Isa;

use crate::error::Error;
use crate::error::Result;

///
/// One ELF loaded onto one GPU agent inside one runtime executable.
///
/// A value-type view over the runtime's loader state, captured at load
/// time. The runtime owns the lifetime; the cache references code objects
/// by handle and never the other way around.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedCodeObject {
    /// The runtime handle.
    pub handle: LoadedCodeObjectHandle,
    /// The agent the code object is loaded onto.
    pub agent: Agent,
    /// The agent's ISA.
    pub isa: Isa,
    /// The owning executable.
    pub executable: ExecutableHandle,
    /// The device base address of the loaded image.
    pub load_base: u64,
    /// The loaded image size in bytes.
    pub load_size: u64,
    /// The signed delta between file addresses and device addresses.
    pub load_delta: i64,
    /// The device base address of every allocated section, by ELF section
    /// index.
    pub section_bases: Vec<(usize, u64)>,
}

impl LoadedCodeObject {
    ///
    /// Captures the loader's view of a freshly loaded code object.
    ///
    pub fn capture(api: &ApiTable, handle: LoadedCodeObjectHandle) -> Result<Self> {
        let agent = api
            .loader
            .code_object_agent(handle)
            .map_err(Error::runtime)?;
        let isa = api.core.agent_isa(agent).map_err(Error::runtime)?;
        Ok(Self {
            handle,
            agent,
            isa,
            executable: api
                .loader
                .code_object_executable(handle)
                .map_err(Error::runtime)?,
            load_base: api
                .loader
                .code_object_load_base(handle)
                .map_err(Error::runtime)?,
            load_size: api
                .loader
                .code_object_load_size(handle)
                .map_err(Error::runtime)?,
            load_delta: api
                .loader
                .code_object_load_delta(handle)
                .map_err(Error::runtime)?,
            section_bases: api
                .loader
                .code_object_section_bases(handle)
                .map_err(Error::runtime)?,
        })
    }

    ///
    /// The device load address of an ELF section, if the section was
    /// allocated.
    ///
    pub fn section_base(&self, section_index: usize) -> Option<u64> {
        self.section_bases
            .iter()
            .find(|(index, _)| *index == section_index)
            .map(|(_, base)| *base)
    }

    ///
    /// Whether a device address falls into the loaded range.
    ///
    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.load_base && address < self.load_base + self.load_size
    }
}
