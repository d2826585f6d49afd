//!
//! The code generator.
//!
//! Runs the instrumentation pipeline over a cloned lifted representation:
//! mutation, hook materialization, two-stage intrinsic lowering,
//! physical-register virtualization, preamble analysis, register
//! allocation, frame injection, and relocatable printing.
//!

pub mod frame;
pub mod lower;
pub mod virtualize;

use std::collections::BTreeMap;
use std::sync::Arc;

use lyra_backend::codegen::EmitGlobal;
use lyra_backend::codegen::EmitInput;
use lyra_backend::codegen::emit_relocatable;
use lyra_backend::codegen::print_assembly;

use crate::error::Error;
use crate::error::Result;
use crate::instrumentation::InstrumentationModuleRegistry;
use crate::instrumentation::InstrumentationTask;
use crate::intrinsics::IntrinsicRegistry;
use crate::lifter::CodeLifter;
use crate::lifter::LiftedRepresentation;
use crate::symbol::Symbol;

pub use self::frame::FramePlan;
pub use self::lower::AccessSet;

///
/// The output form of a printed representation.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// A relocatable ELF object.
    Relocatable,
    /// Textual assembly for diagnostics.
    Assembly,
}

///
/// The code generator.
///
pub struct CodeGenerator {
    lifter: Arc<CodeLifter>,
    intrinsics: Arc<IntrinsicRegistry>,
    modules: Arc<InstrumentationModuleRegistry>,
}

impl CodeGenerator {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(
        lifter: Arc<CodeLifter>,
        intrinsics: Arc<IntrinsicRegistry>,
        modules: Arc<InstrumentationModuleRegistry>,
    ) -> Self {
        Self {
            lifter,
            intrinsics,
            modules,
        }
    }

    ///
    /// Instruments a representation: clones it, runs the mutator, and
    /// materializes the queued hooks through the full lowering pipeline.
    ///
    /// The cached original is never touched; mutator errors propagate
    /// verbatim.
    ///
    pub fn instrument(
        &self,
        representation: &LiftedRepresentation,
        mutator: &mut dyn FnMut(&mut InstrumentationTask) -> Result<()>,
    ) -> Result<LiftedRepresentation> {
        let clone = self.lifter.clone_representation(representation);
        let mut task = InstrumentationTask::new(clone, self.modules.clone());
        mutator(&mut task)?;
        let (mut lr, queue) = task.into_parts();

        // Steps 3 to 7: materialize hook calls, lower intrinsics in two
        // stages with instruction selection in between. Direct mutator
        // edits need no payload and flow straight into the passes below.
        let mut lowering = lower::LoweringState::new(self.intrinsics.clone());
        if !queue.is_empty() {
            let tool_module = self.modules.bitcode_for_agent(lr.agent())?;
            for (target, invocations) in queue {
                lower::materialize_and_lower(
                    &mut lr,
                    &tool_module,
                    &target,
                    &invocations,
                    &mut lowering,
                )?;
            }
        }

        // Steps 8 to 11 run per function over the occupied set of the
        // whole module.
        let isa = lr.isa().clone();
        let occupied = frame::occupied_registers(&lr);
        let mut widened: BTreeMap<String, (u16, u16)> = BTreeMap::new();
        for name in lr.machine_module().function_names() {
            let access = lowering.access.remove(name.as_str()).unwrap_or_default();
            let is_kernel = lr
                .function_symbol(name.as_str())
                .and_then(Symbol::as_kernel)
                .is_some();

            let function = lr
                .machine_module_mut()
                .function_mut(name.as_str())
                .expect("The function list is derived from the module");

            // Untouched functions keep their original register budget.
            let touched = function.vreg_count() > 0
                || function
                    .instructions()
                    .any(|(_, inst)| inst.origin == lyra_backend::mir::InstOrigin::Injected);
            if !touched {
                continue;
            }

            virtualize::virtualize(function, &access)?;

            let plan = frame::analyze(function, &occupied, &access, &isa)?;

            let allocation = frame::allocate_function(function, &plan)?;

            frame::inject_frame(function, &plan, &allocation)?;

            if is_kernel {
                widened.insert(
                    name.clone(),
                    frame::widened_register_counts(&plan, &allocation),
                );
            }
        }

        lr.widen_kernel_metadata(&widened);
        Ok(lr)
    }

    ///
    /// Prints a representation into the requested output form.
    ///
    pub fn print(
        &self,
        representation: &LiftedRepresentation,
        format: OutputFormat,
    ) -> Result<Vec<u8>> {
        match format {
            OutputFormat::Assembly => {
                Ok(print_assembly(representation.machine_module()).into_bytes())
            }
            OutputFormat::Relocatable => {
                let kernels: Vec<lyra_backend::KernelMetadata> = representation
                    .machine_module()
                    .function_names()
                    .iter()
                    .filter_map(|name| {
                        representation
                            .function_symbol(name)
                            .and_then(Symbol::as_kernel)
                            .map(|kernel| kernel.metadata.clone())
                    })
                    .collect();
                // Every global stays external in the printed object; the
                // loader defines each at its live device address.
                let globals: Vec<EmitGlobal> = representation
                    .ir_module()
                    .globals
                    .values()
                    .map(|global| EmitGlobal {
                        name: global.name.clone(),
                        size: global.size,
                        align: global.align,
                        initializer: None,
                        is_external: true,
                    })
                    .collect();
                emit_relocatable(&EmitInput {
                    module: representation.machine_module(),
                    kernels: kernels.as_slice(),
                    globals: globals.as_slice(),
                })
                .map_err(|error| Error::codegen(format!("printing: {error}")))
            }
        }
    }
}
