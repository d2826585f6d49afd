//!
//! The lifted representation.
//!

use std::collections::BTreeMap;

use lyra_backend::TargetMachine;
use lyra_backend::ir;
use lyra_backend::mir::InstId;
use lyra_backend::mir::MachineModule;
use lyra_runtime::Agent;
use lyra_runtime::LoadedCodeObjectHandle;
use lyra_utils::Isa;

use crate::lifter::record::InstructionRecord;
use crate::symbol::Symbol;

///
/// A reference to one machine instruction inside a lifted representation.
///
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstRef {
    /// The owning function's symbol name.
    pub function: String,
    /// The instruction identifier inside that function.
    pub inst: InstId,
}

///
/// The product of lifting one kernel: the owning context for everything
/// reconstructed from the loaded machine code.
///
/// The representation exclusively owns its modules and target machine. The
/// instruction↔record maps are valid only between lifting (or cloning) and
/// the first transformation that rewrites instructions; the code generator
/// works on clones and never consults the original's maps.
///
#[derive(Debug, Clone)]
pub struct LiftedRepresentation {
    /// The lifted kernel symbol.
    kernel: Symbol,
    /// The kernel's code object.
    lco: LoadedCodeObjectHandle,
    /// The agent the code object is loaded onto.
    agent: Agent,
    /// The target ISA.
    isa: Isa,
    /// The target machine configured for the kernel's ISA.
    target_machine: TargetMachine,
    /// The IR module: globals for the code object's variables and
    /// externals, plus hook code once instrumentation begins.
    ir_module: ir::Module,
    /// The machine-IR container: the kernel and every device function of
    /// the code object.
    machine_module: MachineModule,
    /// The function symbols behind the machine functions, by name.
    functions: BTreeMap<String, Symbol>,
    /// The variable and external symbols behind the IR globals, by name.
    variables: BTreeMap<String, Symbol>,
    /// Machine instruction to originating record.
    mi_to_record: BTreeMap<InstRef, InstructionRecord>,
    /// Loaded address to machine instruction.
    record_to_mi: BTreeMap<u64, InstRef>,
}

impl LiftedRepresentation {
    ///
    /// A shortcut constructor.
    ///
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: Symbol,
        agent: Agent,
        isa: Isa,
        target_machine: TargetMachine,
        ir_module: ir::Module,
        machine_module: MachineModule,
        functions: BTreeMap<String, Symbol>,
        variables: BTreeMap<String, Symbol>,
        mi_to_record: BTreeMap<InstRef, InstructionRecord>,
    ) -> Self {
        let lco = kernel.lco();
        let record_to_mi = mi_to_record
            .iter()
            .map(|(inst_ref, record)| (record.address, inst_ref.clone()))
            .collect();
        Self {
            kernel,
            lco,
            agent,
            isa,
            target_machine,
            ir_module,
            machine_module,
            functions,
            variables,
            mi_to_record,
            record_to_mi,
        }
    }

    ///
    /// The lifted kernel symbol.
    ///
    pub fn kernel(&self) -> &Symbol {
        &self.kernel
    }

    ///
    /// The kernel's code object.
    ///
    pub fn lco(&self) -> LoadedCodeObjectHandle {
        self.lco
    }

    ///
    /// The agent the kernel is loaded onto.
    ///
    pub fn agent(&self) -> Agent {
        self.agent
    }

    ///
    /// The target ISA.
    ///
    pub fn isa(&self) -> &Isa {
        &self.isa
    }

    ///
    /// The owned target machine.
    ///
    pub fn target_machine(&self) -> &TargetMachine {
        &self.target_machine
    }

    ///
    /// The IR module.
    ///
    pub fn ir_module(&self) -> &ir::Module {
        &self.ir_module
    }

    ///
    /// The mutable IR module.
    ///
    pub fn ir_module_mut(&mut self) -> &mut ir::Module {
        &mut self.ir_module
    }

    ///
    /// The machine-IR container.
    ///
    pub fn machine_module(&self) -> &MachineModule {
        &self.machine_module
    }

    ///
    /// The mutable machine-IR container.
    ///
    pub fn machine_module_mut(&mut self) -> &mut MachineModule {
        &mut self.machine_module
    }

    ///
    /// The function symbol behind a machine function.
    ///
    pub fn function_symbol(&self, name: &str) -> Option<&Symbol> {
        self.functions.get(name)
    }

    ///
    /// The variable and external symbols behind the IR globals.
    ///
    pub fn variables(&self) -> &BTreeMap<String, Symbol> {
        &self.variables
    }

    ///
    /// The machine instruction lifted from the record at a loaded address.
    ///
    pub fn instruction_at_address(&self, address: u64) -> Option<&InstRef> {
        self.record_to_mi.get(&address)
    }

    ///
    /// The record a machine instruction was lifted from.
    ///
    pub fn record_of(&self, inst_ref: &InstRef) -> Option<&InstructionRecord> {
        self.mi_to_record.get(inst_ref)
    }

    ///
    /// Iterates the instruction↔record pairs.
    ///
    pub fn records(&self) -> impl Iterator<Item = (&InstRef, &InstructionRecord)> + '_ {
        self.mi_to_record.iter()
    }

    ///
    /// Widens the register counts recorded in kernel metadata after
    /// instrumentation grew the register usage.
    ///
    pub(crate) fn widen_kernel_metadata(
        &mut self,
        counts: &BTreeMap<String, (u16, u16)>,
    ) {
        for (name, (sgpr_count, vgpr_count)) in counts {
            for symbol in [
                self.functions.get_mut(name),
                if self.kernel.name() == name.as_str() {
                    Some(&mut self.kernel)
                } else {
                    None
                },
            ]
            .into_iter()
            .flatten()
            {
                if let Symbol::Kernel(kernel) = symbol {
                    kernel.metadata.sgpr_count = kernel.metadata.sgpr_count.max(*sgpr_count);
                    kernel.metadata.vgpr_count = kernel.metadata.vgpr_count.max(*vgpr_count);
                }
            }
        }
    }

    ///
    /// Whether an instruction reference points into this representation.
    ///
    pub fn contains(&self, inst_ref: &InstRef) -> bool {
        self.machine_module
            .function(inst_ref.function.as_str())
            .map(|function| function.contains(inst_ref.inst))
            .unwrap_or(false)
    }
}
