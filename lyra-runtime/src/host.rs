//!
//! The in-process host runtime.
//!
//! Implements the API tables by loading code objects into host memory at
//! synthetic device addresses: ELF parsing, section layout, symbol
//! resolution, and the executable lifecycle. It loads and resolves only;
//! it never executes GPU code.
//!

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;

use lyra_utils::Isa;
use lyra_utils::StateLock;

use crate::api::ApiTable;
use crate::api::CoreApi;
use crate::api::LoaderApi;
use crate::error::RuntimeError;
use crate::events::RuntimeEvents;
use crate::handle::Agent;
use crate::handle::ExecutableHandle;
use crate::handle::ExecutableSymbolHandle;
use crate::handle::LoadedCodeObjectHandle;

/// The device address the first loaded image is placed at.
const DEVICE_BASE: u64 = 0x7F00_0000_0000;

/// The guard gap between loaded images.
const LOAD_GAP: u64 = 0x1_0000;

#[derive(Debug)]
struct ExecutableState {
    agent: Agent,
    frozen: bool,
    code_objects: Vec<u64>,
    externals: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct CodeObjectState {
    executable: ExecutableHandle,
    agent: Agent,
    /// The private copy of the ELF bytes.
    storage: Vec<u8>,
    /// The loaded image.
    memory: Vec<u8>,
    base: u64,
    delta: i64,
    /// Device base address per allocated ELF section index.
    section_bases: Vec<(usize, u64)>,
    /// Defined symbol name to (device address, size, global binding).
    symbols: BTreeMap<String, (u64, u64, bool)>,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_base: u64,
    agents: BTreeMap<u64, Isa>,
    executables: BTreeMap<u64, ExecutableState>,
    code_objects: BTreeMap<u64, CodeObjectState>,
}

///
/// The in-process host runtime.
///
pub struct HostRuntime {
    state: Mutex<State>,
    events: RuntimeEvents,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime {
    ///
    /// A shortcut constructor.
    ///
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                next_base: DEVICE_BASE,
                ..State::default()
            }),
            events: RuntimeEvents::new(),
        }
    }

    ///
    /// The event registry the interception layer drives.
    ///
    pub fn events(&self) -> &RuntimeEvents {
        &self.events
    }

    ///
    /// The API-table snapshot over this runtime.
    ///
    pub fn api_table(self: &Arc<Self>) -> ApiTable {
        ApiTable {
            core: self.clone(),
            loader: self.clone(),
        }
    }

    ///
    /// Registers an agent with its ISA and returns its handle.
    ///
    pub fn add_agent(&self, isa: Isa) -> Agent {
        let mut state = self.state.acquire();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.agents.insert(handle, isa);
        Agent(handle)
    }

    ///
    /// Records a device-function registration and notifies observers.
    ///
    /// This is the application-side entry point tools reach through the
    /// intercepted register-function call.
    ///
    pub fn register_function(&self, shadow_pointer: u64, device_name: &str) {
        log::debug!("function registered: {device_name} via {shadow_pointer:#x}");
        self.events
            .fire_function_registered(shadow_pointer, device_name);
    }
}

impl CoreApi for HostRuntime {
    fn agent_isa(&self, agent: Agent) -> Result<Isa, RuntimeError> {
        self.state
            .acquire()
            .agents
            .get(&agent.0)
            .cloned()
            .ok_or(RuntimeError::InvalidHandle(agent.0))
    }

    fn create_executable(&self, agent: Agent) -> Result<ExecutableHandle, RuntimeError> {
        let mut state = self.state.acquire();
        if !state.agents.contains_key(&agent.0) {
            return Err(RuntimeError::InvalidHandle(agent.0));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.executables.insert(
            handle,
            ExecutableState {
                agent,
                frozen: false,
                code_objects: Vec::new(),
                externals: BTreeMap::new(),
            },
        );
        Ok(ExecutableHandle(handle))
    }

    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: Agent,
        bytes: &[u8],
    ) -> Result<LoadedCodeObjectHandle, RuntimeError> {
        let lco = {
            let mut state = self.state.acquire();
            let executable_state = state
                .executables
                .get(&executable.0)
                .ok_or(RuntimeError::InvalidHandle(executable.0))?;
            if executable_state.frozen {
                return Err(RuntimeError::Frozen);
            }

            let image = load_image(bytes, state.next_base)?;
            state.next_base = align_up(state.next_base + image.memory.len() as u64, 0x1000)
                + LOAD_GAP;

            let handle = state.next_handle;
            state.next_handle += 1;
            state.code_objects.insert(
                handle,
                CodeObjectState {
                    executable,
                    agent,
                    storage: bytes.to_vec(),
                    memory: image.memory,
                    base: image.base,
                    delta: image.base as i64,
                    section_bases: image.section_bases,
                    symbols: image.symbols,
                },
            );
            state
                .executables
                .get_mut(&executable.0)
                .expect("Checked above")
                .code_objects
                .push(handle);
            LoadedCodeObjectHandle(handle)
        };

        log::debug!("code object {lco} loaded into {executable}");
        self.events.fire_code_object_loaded(lco);
        Ok(lco)
    }

    fn define_external_variable(
        &self,
        executable: ExecutableHandle,
        name: &str,
        address: u64,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.acquire();
        let executable_state = state
            .executables
            .get_mut(&executable.0)
            .ok_or(RuntimeError::InvalidHandle(executable.0))?;
        if executable_state.frozen {
            return Err(RuntimeError::Frozen);
        }
        executable_state.externals.insert(name.to_owned(), address);
        Ok(())
    }

    fn freeze_executable(&self, executable: ExecutableHandle) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.acquire();
            let executable_state = state
                .executables
                .get_mut(&executable.0)
                .ok_or(RuntimeError::InvalidHandle(executable.0))?;
            if executable_state.frozen {
                return Err(RuntimeError::Frozen);
            }
            executable_state.frozen = true;
        }
        log::debug!("{executable} frozen");
        self.events.fire_executable_frozen(executable);
        Ok(())
    }

    fn destroy_executable(&self, executable: ExecutableHandle) -> Result<(), RuntimeError> {
        if !self
            .state
            .acquire()
            .executables
            .contains_key(&executable.0)
        {
            return Err(RuntimeError::InvalidHandle(executable.0));
        }

        // Observers see the executable intact; removal follows the
        // callback.
        log::debug!("{executable} destroyed");
        self.events.fire_executable_destroyed(executable);

        let mut state = self.state.acquire();
        if let Some(executable_state) = state.executables.remove(&executable.0) {
            for lco in executable_state.code_objects {
                state.code_objects.remove(&lco);
            }
        }
        Ok(())
    }
}

impl LoaderApi for HostRuntime {
    fn code_object_storage(&self, lco: LoadedCodeObjectHandle) -> Result<Vec<u8>, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.storage.clone())
    }

    fn code_object_agent(&self, lco: LoadedCodeObjectHandle) -> Result<Agent, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.agent)
    }

    fn code_object_executable(
        &self,
        lco: LoadedCodeObjectHandle,
    ) -> Result<ExecutableHandle, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.executable)
    }

    fn code_object_load_base(&self, lco: LoadedCodeObjectHandle) -> Result<u64, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.base)
    }

    fn code_object_load_size(&self, lco: LoadedCodeObjectHandle) -> Result<u64, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.memory.len() as u64)
    }

    fn code_object_load_delta(&self, lco: LoadedCodeObjectHandle) -> Result<i64, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.delta)
    }

    fn code_object_section_bases(
        &self,
        lco: LoadedCodeObjectHandle,
    ) -> Result<Vec<(usize, u64)>, RuntimeError> {
        self.with_code_object(lco, |code_object| code_object.section_bases.clone())
    }

    fn host_view(&self, device_address: u64, size: u64) -> Result<Vec<u8>, RuntimeError> {
        let state = self.state.acquire();
        for code_object in state.code_objects.values() {
            let end = code_object.base + code_object.memory.len() as u64;
            if device_address >= code_object.base && device_address + size <= end {
                let start = (device_address - code_object.base) as usize;
                return Ok(code_object.memory[start..start + size as usize].to_vec());
            }
        }
        Err(RuntimeError::UnmappedAddress(device_address))
    }

    fn executable_code_objects(
        &self,
        executable: ExecutableHandle,
    ) -> Result<Vec<LoadedCodeObjectHandle>, RuntimeError> {
        let state = self.state.acquire();
        let executable_state = state
            .executables
            .get(&executable.0)
            .ok_or(RuntimeError::InvalidHandle(executable.0))?;
        Ok(executable_state
            .code_objects
            .iter()
            .map(|handle| LoadedCodeObjectHandle(*handle))
            .collect())
    }

    fn symbol_device_address(
        &self,
        executable: ExecutableHandle,
        name: &str,
    ) -> Result<u64, RuntimeError> {
        let state = self.state.acquire();
        let executable_state = state
            .executables
            .get(&executable.0)
            .ok_or(RuntimeError::InvalidHandle(executable.0))?;
        for lco in executable_state.code_objects.iter() {
            if let Some((address, _, _)) = state
                .code_objects
                .get(lco)
                .and_then(|code_object| code_object.symbols.get(name))
            {
                return Ok(*address);
            }
        }
        executable_state
            .externals
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::SymbolNotFound(name.to_owned()))
    }

    fn symbol_handle(
        &self,
        executable: ExecutableHandle,
        name: &str,
    ) -> Result<ExecutableSymbolHandle, RuntimeError> {
        // Loaded addresses are unique per symbol, which makes them stable
        // handles.
        let state = self.state.acquire();
        let executable_state = state
            .executables
            .get(&executable.0)
            .ok_or(RuntimeError::InvalidHandle(executable.0))?;
        for lco in executable_state.code_objects.iter() {
            if let Some((address, _, is_global)) = state
                .code_objects
                .get(lco)
                .and_then(|code_object| code_object.symbols.get(name))
            {
                if !is_global {
                    break;
                }
                return Ok(ExecutableSymbolHandle(*address));
            }
        }
        Err(RuntimeError::SymbolNotFound(name.to_owned()))
    }
}

impl HostRuntime {
    fn with_code_object<T>(
        &self,
        lco: LoadedCodeObjectHandle,
        read: impl FnOnce(&CodeObjectState) -> T,
    ) -> Result<T, RuntimeError> {
        let state = self.state.acquire();
        state
            .code_objects
            .get(&lco.0)
            .map(read)
            .ok_or(RuntimeError::InvalidHandle(lco.0))
    }
}

struct LoadedImage {
    memory: Vec<u8>,
    base: u64,
    section_bases: Vec<(usize, u64)>,
    symbols: BTreeMap<String, (u64, u64, bool)>,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

///
/// Lays out a relocatable code object at `base`: allocated sections are
/// placed in file order and symbols resolved against their sections.
///
fn load_image(bytes: &[u8], base: u64) -> Result<LoadedImage, RuntimeError> {
    let file = object::File::parse(bytes)
        .map_err(|error| RuntimeError::CodeObject(error.to_string()))?;

    let mut section_bases = Vec::new();
    let mut section_addresses: BTreeMap<usize, u64> = BTreeMap::new();
    let mut cursor = base;
    let mut copies: Vec<(u64, Vec<u8>)> = Vec::new();

    for section in file.sections() {
        let kind = section.kind();
        let allocated = matches!(
            kind,
            object::SectionKind::Text
                | object::SectionKind::ReadOnlyData
                | object::SectionKind::Data
                | object::SectionKind::UninitializedData
        );
        if !allocated || section.size() == 0 {
            continue;
        }
        let align = section.align().max(16);
        cursor = align_up(cursor, align);
        let index = section.index().0;
        section_addresses.insert(index, cursor);
        section_bases.push((index, cursor));
        if kind != object::SectionKind::UninitializedData {
            let data = section
                .data()
                .map_err(|error| RuntimeError::CodeObject(error.to_string()))?;
            copies.push((cursor, data.to_vec()));
        }
        cursor += section.size();
    }

    let size = (cursor - base) as usize;
    let mut memory = vec![0u8; size];
    for (address, data) in copies {
        let start = (address - base) as usize;
        memory[start..start + data.len()].copy_from_slice(data.as_slice());
    }

    let mut symbols = BTreeMap::new();
    for symbol in file.symbols() {
        let Some(section_index) = symbol.section_index() else {
            continue;
        };
        let Some(section_address) = section_addresses.get(&section_index.0) else {
            continue;
        };
        let Ok(name) = symbol.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        symbols.insert(
            name.to_owned(),
            (
                section_address + symbol.address(),
                symbol.size(),
                symbol.is_global(),
            ),
        );
    }

    Ok(LoadedImage {
        memory,
        base,
        section_bases,
        symbols,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lyra_utils::Isa;

    use crate::api::CoreApi as _;
    use crate::api::LoaderApi as _;
    use crate::error::RuntimeError;

    use super::HostRuntime;

    fn fixture_elf() -> Vec<u8> {
        use lyra_backend::codegen::emit::EmitGlobal;
        use lyra_backend::codegen::emit::EmitInput;
        use lyra_backend::codegen::emit::emit_relocatable;
        use lyra_backend::mir::MachineFunction;
        use lyra_backend::mir::MachineInst;
        use lyra_backend::mir::MachineModule;
        use lyra_backend::mir::MachineOperand;
        use lyra_backend::target::opcode::Opcode;

        let mut function = MachineFunction::new("k".to_owned(), true);
        let block = function.create_block();
        function.push_inst(
            block,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
        let mut module = MachineModule::new("fixture".to_owned(), Isa::from_processor("gfx908"));
        module.add_function(function);
        emit_relocatable(&EmitInput {
            module: &module,
            kernels: &[],
            globals: &[EmitGlobal {
                name: "counter".to_owned(),
                size: 4,
                align: 4,
                initializer: None,
                is_external: false,
            }],
        })
        .expect("Always valid")
    }

    #[test]
    fn load_freeze_query_destroy() {
        let runtime = Arc::new(HostRuntime::new());
        let agent = runtime.add_agent(Isa::from_processor("gfx908"));
        let executable = runtime.create_executable(agent).expect("Always valid");
        let elf = fixture_elf();
        let lco = runtime
            .load_code_object(executable, agent, elf.as_slice())
            .expect("Always valid");

        assert_eq!(
            runtime.code_object_storage(lco).expect("Always valid"),
            elf
        );
        runtime.freeze_executable(executable).expect("Always valid");

        let kernel_address = runtime
            .symbol_device_address(executable, "k")
            .expect("Always valid");
        let base = runtime.code_object_load_base(lco).expect("Always valid");
        let size = runtime.code_object_load_size(lco).expect("Always valid");
        assert!(kernel_address >= base && kernel_address < base + size);

        let view = runtime
            .host_view(kernel_address, 4)
            .expect("Always valid");
        assert_eq!(view.len(), 4);

        runtime.destroy_executable(executable).expect("Always valid");
        assert_eq!(
            runtime.code_object_storage(lco).expect_err("Must fail"),
            RuntimeError::InvalidHandle(lco.0)
        );
    }

    #[test]
    fn external_definitions_resolve_after_freeze() {
        let runtime = Arc::new(HostRuntime::new());
        let agent = runtime.add_agent(Isa::from_processor("gfx908"));
        let executable = runtime.create_executable(agent).expect("Always valid");
        runtime
            .define_external_variable(executable, "counter_storage", 0xDEAD_0000)
            .expect("Always valid");
        runtime.freeze_executable(executable).expect("Always valid");
        assert_eq!(
            runtime
                .symbol_device_address(executable, "counter_storage")
                .expect("Always valid"),
            0xDEAD_0000
        );
    }
}
