//!
//! The instrumentation-module registry.
//!
//! Tracks the tool's payload: its serialized hook IR per agent, the device
//! addresses of its globals, and the shadow-pointer map tools identify
//! hooks by. Registered on the first executable freeze that carries the
//! reserved marker variable; torn down with the last tool executable.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use object::Object as _;
use object::ObjectSection as _;

use sha2::Digest as _;

use lyra_backend::ir;
use lyra_runtime::Agent;
use lyra_runtime::ApiTable;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::RuntimeEventObserver;
use lyra_utils::PAYLOAD_SECTION;
use lyra_utils::StateLock;
use lyra_utils::TOOL_MARKER_VARIABLE;
use lyra_utils::mangling::demangle_hook_handle;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Default)]
struct AgentPayload {
    /// The serialized hook IR.
    bitcode: Vec<u8>,
    /// Global-variable name to loaded device address.
    global_addresses: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct ToolModule {
    /// The compile-unit identifier of the payload.
    compile_unit_id: String,
    /// The digest of the payload bytes, detecting the module across loads.
    digest: String,
    /// The tool executables carrying this payload.
    executables: BTreeSet<u64>,
    /// Per-agent payload state.
    agents: BTreeMap<u64, AgentPayload>,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// The registered payload, if any.
    module: Option<ToolModule>,
    /// Hook shadow host pointer to hook function name. Registrations may
    /// arrive before the payload executable freezes.
    hook_handles: BTreeMap<u64, String>,
}

///
/// The instrumentation-module registry.
///
pub struct InstrumentationModuleRegistry {
    api: ApiTable,
    state: Mutex<RegistryState>,
}

impl InstrumentationModuleRegistry {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(api: ApiTable) -> Self {
        Self {
            api,
            state: Mutex::new(RegistryState::default()),
        }
    }

    ///
    /// Whether a tool payload is currently registered.
    ///
    pub fn is_registered(&self) -> bool {
        self.state.acquire().module.is_some()
    }

    ///
    /// The compile-unit identifier of the registered payload.
    ///
    pub fn compile_unit_id(&self) -> Result<String> {
        self.with_module(|module| module.compile_unit_id.clone())
    }

    ///
    /// Resolves a hook shadow pointer to the hook function name.
    ///
    pub fn hook_name(&self, shadow_pointer: u64) -> Result<String> {
        self.state
            .acquire()
            .hook_handles
            .get(&shadow_pointer)
            .cloned()
            .ok_or_else(|| {
                Error::lowering(format!(
                    "shadow pointer {shadow_pointer:#x} names no registered hook"
                ))
            })
    }

    ///
    /// The deserialized hook IR module for an agent.
    ///
    pub fn bitcode_for_agent(&self, agent: Agent) -> Result<ir::Module> {
        let bitcode = self
            .with_module(|module| {
                module
                    .agents
                    .get(&agent.0)
                    .map(|payload| payload.bitcode.clone())
            })?
            .ok_or_else(|| {
                Error::lowering(format!("no tool payload is loaded onto {agent}"))
            })?;
        ir::payload::decode_payload(bitcode.as_slice())
            .map_err(|error| Error::lowering(format!("tool payload: {error}")))
    }

    ///
    /// The loaded device address of a payload global on an agent.
    ///
    pub fn global_address(&self, agent: Agent, name: &str) -> Result<u64> {
        self.with_module(|module| {
            module
                .agents
                .get(&agent.0)
                .and_then(|payload| payload.global_addresses.get(name).copied())
        })?
        .ok_or_else(|| {
            Error::lowering(format!("payload global `{name}` has no address on {agent}"))
        })
    }

    ///
    /// Every payload global and its device address on an agent; empty when
    /// no payload is registered.
    ///
    pub fn agent_globals(&self, agent: Agent) -> BTreeMap<String, u64> {
        self.with_module(|module| {
            module
                .agents
                .get(&agent.0)
                .map(|payload| payload.global_addresses.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    fn with_module<T>(&self, read: impl FnOnce(&ToolModule) -> T) -> Result<T> {
        self.state
            .acquire()
            .module
            .as_ref()
            .map(read)
            .ok_or_else(|| Error::lowering("no instrumentation module is registered"))
    }

    ///
    /// Inspects a frozen executable and registers it when it carries the
    /// tool payload.
    ///
    fn try_register(&self, executable: ExecutableHandle) -> Result<bool> {
        // The marker variable identifies tool payloads.
        if self
            .api
            .loader
            .symbol_device_address(executable, TOOL_MARKER_VARIABLE)
            .is_err()
        {
            return Ok(false);
        }

        let code_objects = self
            .api
            .loader
            .executable_code_objects(executable)
            .map_err(Error::runtime)?;

        let mut registered = false;
        let mut state = self.state.acquire();
        for lco in code_objects {
            let agent = self.api.loader.code_object_agent(lco).map_err(Error::runtime)?;
            let storage = self
                .api
                .loader
                .code_object_storage(lco)
                .map_err(Error::runtime)?;
            let Some(bitcode) = extract_payload(storage.as_slice())? else {
                continue;
            };
            let module = ir::payload::decode_payload(bitcode.as_slice())
                .map_err(|error| Error::lowering(format!("tool payload: {error}")))?;
            let digest = hex::encode(sha2::Sha256::digest(bitcode.as_slice()));

            let tool = state.module.get_or_insert_with(ToolModule::default);
            if tool.executables.is_empty() {
                tool.compile_unit_id = module.compile_unit_id.clone();
                tool.digest = digest;
            } else if tool.digest != digest {
                return Err(Error::lowering(
                    "a different tool payload is already registered",
                ));
            }
            tool.executables.insert(executable.0);
            registered = true;

            let mut global_addresses = BTreeMap::new();
            for global in module.globals.values().filter(|global| !global.is_external) {
                if let Ok(address) = self
                    .api
                    .loader
                    .symbol_device_address(executable, global.name.as_str())
                {
                    global_addresses.insert(global.name.clone(), address);
                }
            }
            tool.agents.insert(
                agent.0,
                AgentPayload {
                    bitcode,
                    global_addresses,
                },
            );
        }
        Ok(registered)
    }
}

impl RuntimeEventObserver for InstrumentationModuleRegistry {
    fn executable_frozen(&self, executable: ExecutableHandle) {
        match self.try_register(executable) {
            Ok(true) => log::info!("tool payload registered from {executable}"),
            Ok(false) => {}
            Err(error) => log::warn!("tool payload registration failed: {error}"),
        }
    }

    fn executable_destroyed(&self, executable: ExecutableHandle) {
        let mut state = self.state.acquire();
        let Some(tool) = state.module.as_mut() else {
            return;
        };
        if tool.executables.remove(&executable.0) && tool.executables.is_empty() {
            log::info!("last tool executable destroyed, payload unregistered");
            state.module = None;
            state.hook_handles.clear();
        }
    }

    fn function_registered(&self, shadow_pointer: u64, device_name: &str) {
        let hook_name = demangle_hook_handle(device_name)
            .unwrap_or(device_name)
            .to_owned();
        self.state
            .acquire()
            .hook_handles
            .insert(shadow_pointer, hook_name);
    }
}

///
/// Pulls the serialized hook IR out of a code object's payload section.
///
fn extract_payload(storage: &[u8]) -> Result<Option<Vec<u8>>> {
    let file = object::File::parse(storage)
        .map_err(|error| Error::lowering(format!("tool code object: {error}")))?;
    let Some(section) = file.section_by_name(PAYLOAD_SECTION) else {
        return Ok(None);
    };
    let data = section
        .data()
        .map_err(|error| Error::lowering(format!("payload section: {error}")))?;
    if !ir::payload::is_payload(data) {
        return Ok(None);
    }
    Ok(Some(data.to_vec()))
}
