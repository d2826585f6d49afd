//!
//! The tool executable loader.
//!
//! Side-loads instrumented relocatable objects into the runtime as new
//! executables, tracks which preset of which original kernel each one
//! implements, and rewrites dispatch packets to redirect launches.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

use object::Object as _;
use object::ObjectSection as _;

use lyra_backend::KernelMetadata;
use lyra_backend::metadata::parse_metadata_note;
use lyra_runtime::ApiTable;
use lyra_runtime::AqlDispatchPacket;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::RuntimeEventObserver;
use lyra_utils::StateLock;

use crate::code_object_cache::CodeObjectCache;
use crate::error::Error;
use crate::error::Result;
use crate::symbol::Symbol;

///
/// One registered instrumented kernel.
///
#[derive(Debug, Clone)]
pub struct InstrumentedKernel {
    /// The executable the instrumented code object is loaded into.
    pub executable: ExecutableHandle,
    /// The kernel symbol name.
    pub name: String,
    /// The device address of the instrumented kernel descriptor.
    pub kernel_object: u64,
    /// The instrumented kernel's metadata, segment sizes widened by the
    /// code generator.
    pub metadata: KernelMetadata,
    /// The executable the original kernel lives in, for teardown.
    original_executable: ExecutableHandle,
}

#[derive(Debug, Default)]
struct LoaderState {
    /// (original kernel descriptor address, preset) to the instrumented
    /// kernel.
    presets: BTreeMap<(u64, String), InstrumentedKernel>,
    /// Original executable to the instrumented executables derived from
    /// it.
    dependencies: BTreeMap<u64, BTreeSet<u64>>,
}

///
/// The tool executable loader.
///
pub struct ToolExecutableLoader {
    api: ApiTable,
    cache: Arc<CodeObjectCache>,
    state: Mutex<LoaderState>,
}

impl ToolExecutableLoader {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(api: ApiTable, cache: Arc<CodeObjectCache>) -> Self {
        Self {
            api,
            cache,
            state: Mutex::new(LoaderState::default()),
        }
    }

    ///
    /// Loads an instrumented relocatable as a new executable and registers
    /// it under `(original kernel, preset)`.
    ///
    /// A second call for the same pair observes the previously registered
    /// kernel; nothing is loaded twice.
    ///
    pub fn load_instrumented_kernel(
        &self,
        elf: &[u8],
        original: &Symbol,
        preset: &str,
        externs: &BTreeMap<String, u64>,
    ) -> Result<InstrumentedKernel> {
        let kernel = original
            .as_kernel()
            .ok_or_else(|| Error::loader(format!("`{}` is not a kernel", original.name())))?;
        let key = (kernel.descriptor_address, preset.to_owned());

        if let Some(existing) = self.state.acquire().presets.get(&key) {
            return Ok(existing.clone());
        }

        let info = self.cache.code_object_info(original.lco())?;

        let executable = self
            .api
            .core
            .create_executable(info.agent)
            .map_err(|error| Error::loader(format!("creating the executable: {error}")))?;
        let loaded = self.load_into(executable, elf, &info, externs, kernel.base.name.as_str());
        let instrumented = match loaded {
            Ok(instrumented) => instrumented,
            Err(error) => {
                // No side effects on failure: the half-built executable
                // goes away with the error.
                let _ = self.api.core.destroy_executable(executable);
                return Err(error);
            }
        };

        let mut state = self.state.acquire();
        state
            .dependencies
            .entry(info.executable.0)
            .or_default()
            .insert(executable.0);
        let instrumented = InstrumentedKernel {
            original_executable: info.executable,
            ..instrumented
        };
        state.presets.insert(key, instrumented.clone());
        log::info!(
            "kernel `{}` instrumented under preset `{preset}`",
            original.name()
        );
        Ok(instrumented)
    }

    fn load_into(
        &self,
        executable: ExecutableHandle,
        elf: &[u8],
        info: &crate::code_object::LoadedCodeObject,
        externs: &BTreeMap<String, u64>,
        kernel_name: &str,
    ) -> Result<InstrumentedKernel> {
        for (name, address) in externs {
            self.api
                .core
                .define_external_variable(executable, name.as_str(), *address)
                .map_err(|error| {
                    Error::loader(format!("defining external `{name}`: {error}"))
                })?;
        }
        self.api
            .core
            .load_code_object(executable, info.agent, elf)
            .map_err(|error| Error::loader(format!("loading the code object: {error}")))?;
        self.api
            .core
            .freeze_executable(executable)
            .map_err(|error| Error::loader(format!("freezing the executable: {error}")))?;

        let metadata = read_kernel_metadata(elf, kernel_name)?;
        let kernel_object = self
            .api
            .loader
            .symbol_device_address(executable, metadata.descriptor_symbol().as_str())
            .map_err(|error| {
                Error::loader(format!("locating the instrumented descriptor: {error}"))
            })?;

        Ok(InstrumentedKernel {
            executable,
            name: kernel_name.to_owned(),
            kernel_object,
            metadata,
            original_executable: ExecutableHandle(0),
        })
    }

    ///
    /// Whether `(kernel, preset)` has a registered instrumented variant.
    ///
    pub fn is_kernel_instrumented(&self, kernel: &Symbol, preset: &str) -> bool {
        let Some(kernel) = kernel.as_kernel() else {
            return false;
        };
        self.state
            .acquire()
            .presets
            .contains_key(&(kernel.descriptor_address, preset.to_owned()))
    }

    ///
    /// The instrumented kernel registered under `(kernel, preset)`.
    ///
    pub fn instrumented_kernel(
        &self,
        kernel: &Symbol,
        preset: &str,
    ) -> Result<InstrumentedKernel> {
        let kernel = kernel
            .as_kernel()
            .ok_or_else(|| Error::loader(format!("`{}` is not a kernel", kernel.name())))?;
        self.state
            .acquire()
            .presets
            .get(&(kernel.descriptor_address, preset.to_owned()))
            .cloned()
            .ok_or_else(|| {
                Error::loader(format!(
                    "`{}` has no instrumented variant under preset `{preset}`",
                    kernel.base.name
                ))
            })
    }

    ///
    /// Rewrites a dispatch packet in place to launch the instrumented
    /// variant of its kernel.
    ///
    /// Idempotent: a packet already rewritten for the preset is left
    /// untouched.
    ///
    pub fn override_with_instrumented(
        &self,
        packet: &mut AqlDispatchPacket,
        preset: &str,
    ) -> Result<()> {
        let state = self.state.acquire();
        if let Some(instrumented) = state
            .presets
            .get(&(packet.kernel_object, preset.to_owned()))
        {
            packet.kernel_object = instrumented.kernel_object;
            packet.private_segment_size = packet
                .private_segment_size
                .max(instrumented.metadata.private_segment_fixed_size);
            return Ok(());
        }
        // Applying the override twice yields the same packet.
        if state
            .presets
            .iter()
            .any(|((_, entry_preset), instrumented)| {
                entry_preset == preset && instrumented.kernel_object == packet.kernel_object
            })
        {
            return Ok(());
        }
        Err(Error::loader(format!(
            "packet's kernel object {:#x} has no instrumented variant under preset `{preset}`",
            packet.kernel_object
        )))
    }
}

impl RuntimeEventObserver for ToolExecutableLoader {
    fn executable_destroyed(&self, executable: ExecutableHandle) {
        let derived: Vec<u64> = {
            let mut state = self.state.acquire();
            state
                .presets
                .retain(|_, instrumented| {
                    instrumented.original_executable != executable
                        && instrumented.executable != executable
                });
            state.dependencies.remove(&executable.0).map(|set| set.into_iter().collect()).unwrap_or_default()
        };

        // The runtime fires nested destroy events; the lock is released
        // first.
        for handle in derived {
            if let Err(error) = self.api.core.destroy_executable(ExecutableHandle(handle)) {
                log::warn!("tearing down instrumented executable {handle:#x}: {error}");
            } else {
                log::debug!("instrumented executable {handle:#x} torn down with its original");
            }
        }
    }
}

///
/// Reads one kernel's metadata back out of an emitted relocatable.
///
fn read_kernel_metadata(elf: &[u8], kernel_name: &str) -> Result<KernelMetadata> {
    let file = object::File::parse(elf)
        .map_err(|error| Error::loader(format!("instrumented ELF: {error}")))?;
    let section = file
        .section_by_name(".note.lyra")
        .ok_or_else(|| Error::loader("instrumented ELF carries no metadata note"))?;
    let data = section
        .data()
        .map_err(|error| Error::loader(format!("metadata note: {error}")))?;
    parse_metadata_note(data)
        .map_err(|error| Error::loader(format!("metadata note: {error}")))?
        .into_iter()
        .find(|metadata| metadata.symbol == kernel_name)
        .ok_or_else(|| {
            Error::loader(format!("no metadata for kernel `{kernel_name}` in the note"))
        })
}
