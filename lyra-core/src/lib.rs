//!
//! Dynamic binary instrumentation core for AMD GPU code objects.
//!
//! The pipeline: loaded machine code is disassembled and lifted into a
//! compiler-level representation, tools splice hook calls into a clone of
//! it, the code generator lowers the result back into a relocatable code
//! object, and the loader side-loads that object and redirects dispatch
//! packets to it.
//!

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]

pub mod code_object;
pub mod code_object_cache;
pub mod codegen;
pub mod error;
pub mod instrumentation;
pub mod intrinsics;
pub mod lifter;
pub mod loader;
pub mod symbol;
pub mod target_manager;

pub use self::code_object::LoadedCodeObject;
pub use self::code_object_cache::CodeObjectCache;
pub use self::codegen::CodeGenerator;
pub use self::codegen::OutputFormat;
pub use self::error::Error;
pub use self::error::Result;
pub use self::instrumentation::HookArgument;
pub use self::instrumentation::InstrumentationModuleRegistry;
pub use self::instrumentation::InstrumentationTask;
pub use self::intrinsics::IntrinsicRegistry;
pub use self::lifter::CodeLifter;
pub use self::lifter::InstRef;
pub use self::lifter::InstructionRecord;
pub use self::lifter::LiftedRepresentation;
pub use self::loader::InstrumentedKernel;
pub use self::loader::ToolExecutableLoader;
pub use self::symbol::Symbol;
pub use self::symbol::SymbolKind;
pub use self::target_manager::TargetManager;

use std::collections::BTreeMap;
use std::sync::Arc;

use lyra_runtime::ApiTable;
use lyra_runtime::AqlDispatchPacket;
use lyra_runtime::RuntimeEvents;

///
/// The instrumentation session: the process-wide composition root.
///
/// Constructed once at tool-configure time from the API-table snapshot;
/// construction wires every component into the runtime's event stream.
/// Each component owns its own lock, and no lock is ever held across a
/// callback into tool code.
///
pub struct Session {
    api: ApiTable,
    targets: Arc<TargetManager>,
    cache: Arc<CodeObjectCache>,
    lifter: Arc<CodeLifter>,
    intrinsics: Arc<IntrinsicRegistry>,
    modules: Arc<InstrumentationModuleRegistry>,
    codegen: Arc<CodeGenerator>,
    loader: Arc<ToolExecutableLoader>,
}

impl Session {
    ///
    /// Builds the session over an API-table snapshot and subscribes its
    /// components to the runtime's events.
    ///
    pub fn new(api: ApiTable, events: &RuntimeEvents) -> Arc<Self> {
        let targets = Arc::new(TargetManager::new());
        let cache = Arc::new(CodeObjectCache::new(api.clone()));
        let lifter = Arc::new(CodeLifter::new(
            api.clone(),
            cache.clone(),
            targets.clone(),
        ));
        let intrinsics = Arc::new(IntrinsicRegistry::new());
        let modules = Arc::new(InstrumentationModuleRegistry::new(api.clone()));
        let codegen = Arc::new(CodeGenerator::new(
            lifter.clone(),
            intrinsics.clone(),
            modules.clone(),
        ));
        let loader = Arc::new(ToolExecutableLoader::new(api.clone(), cache.clone()));

        // The cache must observe destruction first so later observers see
        // a consistent world; the loader goes last because it cascades
        // destruction.
        events.register(cache.clone());
        events.register(modules.clone());
        events.register(lifter.clone());
        events.register(loader.clone());

        Arc::new(Self {
            api,
            targets,
            cache,
            lifter,
            intrinsics,
            modules,
            codegen,
            loader,
        })
    }

    ///
    /// Disassembles a kernel or device function.
    ///
    pub fn disassemble(&self, symbol: &Symbol) -> Result<Arc<Vec<InstructionRecord>>> {
        self.lifter.disassemble(symbol)
    }

    ///
    /// Lifts a kernel into its cached representation.
    ///
    pub fn lift(&self, kernel: &Symbol) -> Result<Arc<LiftedRepresentation>> {
        self.lifter.lift(kernel)
    }

    ///
    /// Instruments a representation through a mutator, yielding a new,
    /// independent representation.
    ///
    pub fn instrument(
        &self,
        representation: &LiftedRepresentation,
        mut mutator: impl FnMut(&mut InstrumentationTask) -> Result<()>,
    ) -> Result<LiftedRepresentation> {
        self.codegen.instrument(representation, &mut mutator)
    }

    ///
    /// Prints a representation into `out` in the requested format.
    ///
    pub fn print_lifted_representation(
        &self,
        representation: &LiftedRepresentation,
        out: &mut Vec<u8>,
        format: OutputFormat,
    ) -> Result<()> {
        out.extend(self.codegen.print(representation, format)?);
        Ok(())
    }

    ///
    /// Instruments a kernel and loads the result under a preset.
    ///
    /// The second call for the same `(kernel, preset)` pair is a no-op;
    /// the previously registered variant stays.
    ///
    pub fn instrument_and_load(
        &self,
        kernel: &Symbol,
        representation: &LiftedRepresentation,
        mut mutator: impl FnMut(&mut InstrumentationTask) -> Result<()>,
        preset: &str,
    ) -> Result<()> {
        if self.loader.is_kernel_instrumented(kernel, preset) {
            return Ok(());
        }

        let instrumented = self.codegen.instrument(representation, &mut mutator)?;
        let elf = self.codegen.print(&instrumented, OutputFormat::Relocatable)?;

        // Every global of the printed object resolves to a live device
        // address: the original code object's variables and the tool
        // payload's globals.
        let mut externs: BTreeMap<String, u64> = BTreeMap::new();
        for (name, symbol) in instrumented.variables() {
            externs.insert(name.clone(), symbol.address());
        }
        for (name, address) in self.modules.agent_globals(representation.agent()) {
            externs.insert(name, address);
        }

        self.loader
            .load_instrumented_kernel(elf.as_slice(), kernel, preset, &externs)?;
        Ok(())
    }

    ///
    /// Whether `(kernel, preset)` has a registered instrumented variant.
    ///
    pub fn is_kernel_instrumented(&self, kernel: &Symbol, preset: &str) -> bool {
        self.loader.is_kernel_instrumented(kernel, preset)
    }

    ///
    /// Rewrites a dispatch packet in place to launch the instrumented
    /// variant registered under a preset.
    ///
    pub fn override_with_instrumented(
        &self,
        packet: &mut AqlDispatchPacket,
        preset: &str,
    ) -> Result<()> {
        self.loader.override_with_instrumented(packet, preset)
    }

    ///
    /// The API-table snapshot the session was built over.
    ///
    pub fn api(&self) -> &ApiTable {
        &self.api
    }

    ///
    /// The target manager.
    ///
    pub fn targets(&self) -> &Arc<TargetManager> {
        &self.targets
    }

    ///
    /// The code-object cache.
    ///
    pub fn cache(&self) -> &Arc<CodeObjectCache> {
        &self.cache
    }

    ///
    /// The code lifter.
    ///
    pub fn lifter(&self) -> &Arc<CodeLifter> {
        &self.lifter
    }

    ///
    /// The intrinsic registry; tools may register their own entries.
    ///
    pub fn intrinsics(&self) -> &Arc<IntrinsicRegistry> {
        &self.intrinsics
    }

    ///
    /// The instrumentation-module registry.
    ///
    pub fn modules(&self) -> &Arc<InstrumentationModuleRegistry> {
        &self.modules
    }

    ///
    /// The tool executable loader.
    ///
    pub fn loader(&self) -> &Arc<ToolExecutableLoader> {
        &self.loader
    }
}
