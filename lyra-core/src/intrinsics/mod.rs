//!
//! The intrinsic registry and lowering interfaces.
//!
//! Intrinsics lower in two stages. The IR processor turns a call into an
//! indexed inline-asm placeholder plus a constraint bundle; instruction
//! selection carries the placeholder through untouched; the MIR processor
//! then replaces it with real machine instructions, minting virtual
//! registers through the builder's factories.
//!

pub mod builtins;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use indexmap::IndexMap;

use lyra_backend::KernelArgKind;
use lyra_backend::KernelMetadata;
use lyra_backend::Register;
use lyra_backend::RegisterClass;
use lyra_backend::ir;
use lyra_backend::mir::InstId;
use lyra_backend::mir::MachineFunction;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::VirtualRegister;
use lyra_backend::target::opcode::Opcode;
use lyra_utils::StateLock;
use lyra_utils::mangling::intrinsic_base_name;

use crate::error::Error;
use crate::error::Result;

///
/// An operand constraint of an inline-asm placeholder.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// A 32-bit scalar register, `"s"`.
    Scalar,
    /// A 64-bit scalar register pair, `"s"` over a pair.
    Scalar64,
    /// A 32-bit vector register, `"v"`.
    Vector,
    /// An immediate consumed at IR-lowering time, `"i"`; designators and
    /// constants never become placeholder inputs.
    Immediate,
}

impl Constraint {
    ///
    /// The register class of a register constraint.
    ///
    pub fn register_class(&self) -> Option<RegisterClass> {
        match self {
            Constraint::Scalar => Some(RegisterClass::Sgpr32),
            Constraint::Scalar64 => Some(RegisterClass::Sgpr64),
            Constraint::Vector => Some(RegisterClass::Vgpr32),
            Constraint::Immediate => None,
        }
    }
}

///
/// A kernel-argument value the lowered code may need.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelArgValue {
    /// The kernarg segment base pointer.
    KernargSegmentPtr,
    /// The hidden implicit-argument block pointer.
    ImplicitArgPtr,
    /// The hidden global offset along X.
    GlobalOffsetX,
    /// The hidden global offset along Y.
    GlobalOffsetY,
    /// The hidden global offset along Z.
    GlobalOffsetZ,
    /// The workgroup id along X, preloaded in an SGPR.
    WorkgroupIdX,
    /// The workgroup id along Y.
    WorkgroupIdY,
    /// The workgroup id along Z.
    WorkgroupIdZ,
    /// The dispatch id; preloaded in an SGPR when the metadata covers it,
    /// unavailable otherwise.
    DispatchId,
}

///
/// The bundle an IR processor returns: everything the MIR stage needs to
/// finish the lowering.
///
#[derive(Debug, Clone)]
pub struct IrLoweringInfo {
    /// The return-value constraint, absent for void intrinsics.
    pub return_constraint: Option<Constraint>,
    /// One constraint per call argument.
    pub arg_constraints: Vec<Constraint>,
    /// The physical registers the intrinsic must be able to touch.
    pub accessed_registers: Vec<Register>,
    /// The kernel-argument values the intrinsic must have access to.
    pub kernel_args: Vec<KernelArgValue>,
}

///
/// An intrinsic call site at IR-lowering time.
///
#[derive(Debug)]
pub struct IntrinsicCallSite<'a> {
    /// The demangled intrinsic name, template arguments stripped.
    pub name: &'a str,
    /// The actual arguments.
    pub args: &'a [ir::Value],
}

///
/// One lowered argument at MIR time.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredArg {
    /// A virtual register carrying the argument value.
    Register(VirtualRegister),
    /// An immediate consumed at IR time.
    Immediate(i64),
    /// A physical-register designator consumed at IR time.
    Designator(Register),
}

///
/// An intrinsic site at MIR-lowering time: the bundle recovered through
/// the placeholder index, plus the lowered operands.
///
#[derive(Debug)]
pub struct MirLoweringSite<'a> {
    /// The bundle the IR processor produced.
    pub info: &'a IrLoweringInfo,
    /// One lowered operand per original argument.
    pub args: Vec<LoweredArg>,
    /// The virtual register the placeholder's result lives in, if any.
    pub output: Option<VirtualRegister>,
}

/// The IR-stage processor of one intrinsic.
pub type IrProcessor = fn(&IntrinsicCallSite<'_>) -> Result<IrLoweringInfo>;

/// The MIR-stage processor of one intrinsic.
pub type MirProcessor = fn(&mut MirBuilder<'_>, &MirLoweringSite<'_>) -> Result<()>;

///
/// One registered intrinsic.
///
#[derive(Debug, Clone, Copy)]
pub struct Intrinsic {
    /// The IR-stage processor.
    pub ir_processor: IrProcessor,
    /// The MIR-stage processor.
    pub mir_processor: MirProcessor,
}

///
/// The intrinsic registry: demangled name, without template arguments, to
/// processor pair.
///
pub struct IntrinsicRegistry {
    entries: Mutex<IndexMap<String, Intrinsic>>,
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrinsicRegistry {
    ///
    /// A registry prepopulated with the built-in intrinsics.
    ///
    pub fn new() -> Self {
        let registry = Self {
            entries: Mutex::new(IndexMap::new()),
        };
        builtins::register_builtins(&registry);
        registry
    }

    ///
    /// Registers an intrinsic; tools may override built-ins.
    ///
    pub fn register(&self, name: impl ToString, intrinsic: Intrinsic) {
        self.entries
            .acquire()
            .insert(name.to_string(), intrinsic);
    }

    ///
    /// Resolves an intrinsic by call-site name.
    ///
    pub fn resolve(&self, name: &str) -> Result<Intrinsic> {
        let base = intrinsic_base_name(name);
        self.entries
            .acquire()
            .get(base)
            .copied()
            .ok_or_else(|| Error::lowering(format!("unknown intrinsic `{name}`")))
    }
}

///
/// The factories a MIR processor builds real machine code with, plus the
/// per-function access bookkeeping the later passes consume.
///
pub struct MirBuilder<'f> {
    function: &'f mut MachineFunction,
    /// The placeholder instruction; emitted code lands before it.
    anchor: InstId,
    /// The kernel metadata, absent inside device functions.
    metadata: Option<&'f KernelMetadata>,
    /// The physical registers the lowered code touches.
    pub accessed_registers: BTreeSet<Register>,
    /// The virtual register standing in for each touched physical
    /// register, to be bracketed by the virtualization pass.
    pub phys_vregs: BTreeMap<(Register, RegisterClass), VirtualRegister>,
    /// The kernel-argument values the lowered code reads.
    pub kernel_args_used: BTreeSet<KernelArgValue>,
    /// Whether the lowered code writes the exec mask.
    pub writes_exec: bool,
}

impl<'f> MirBuilder<'f> {
    ///
    /// A shortcut constructor.
    ///
    pub(crate) fn new(
        function: &'f mut MachineFunction,
        anchor: InstId,
        metadata: Option<&'f KernelMetadata>,
    ) -> Self {
        Self {
            function,
            anchor,
            metadata,
            accessed_registers: BTreeSet::new(),
            phys_vregs: BTreeMap::new(),
            kernel_args_used: BTreeSet::new(),
            writes_exec: false,
        }
    }

    ///
    /// Emits a machine instruction before the placeholder.
    ///
    pub fn build_before(&mut self, inst: MachineInst) -> InstId {
        self.function.insert_before(self.anchor, inst)
    }

    ///
    /// Mints a fresh virtual register.
    ///
    pub fn create_vreg(&mut self, class: RegisterClass) -> VirtualRegister {
        self.function.create_vreg(class)
    }

    ///
    /// The virtual register standing in for a physical register.
    ///
    /// The virtualization pass brackets it with explicit copies; the
    /// access is recorded for the preamble analysis.
    ///
    pub fn phys_reg_vreg(&mut self, register: Register, class: RegisterClass) -> VirtualRegister {
        self.accessed_registers.insert(register);
        if class.slot_count() > 1 {
            self.accessed_registers.insert(register.offset_by(1));
        }
        let function = &mut self.function;
        *self
            .phys_vregs
            .entry((register, class))
            .or_insert_with(|| function.create_vreg(class))
    }

    ///
    /// Marks the lowered code as writing the exec mask; the frame pass
    /// wraps it in an SCC-preserving sequence.
    ///
    pub fn mark_exec_write(&mut self) {
        self.writes_exec = true;
    }

    ///
    /// The virtual register holding a kernel-argument value.
    ///
    /// Preloaded values come from their user SGPRs; hidden values are
    /// fetched from the kernarg segment. Which storage applies is decided
    /// against the kernel metadata at lowering time.
    ///
    pub fn kernel_arg_reg(&mut self, value: KernelArgValue) -> Result<VirtualRegister> {
        let metadata = self.metadata.ok_or_else(|| {
            Error::lowering(format!(
                "kernel argument {value:?} requested outside a kernel"
            ))
        })?;
        self.kernel_args_used.insert(value);

        // User SGPR layout: s[0:1] kernarg segment pointer, s[2:3]
        // dispatch id when covered, workgroup ids after the user SGPRs.
        match value {
            KernelArgValue::KernargSegmentPtr => {
                Ok(self.phys_reg_vreg(Register::Sgpr(0), RegisterClass::Sgpr64))
            }
            KernelArgValue::WorkgroupIdX
            | KernelArgValue::WorkgroupIdY
            | KernelArgValue::WorkgroupIdZ => {
                let dim = match value {
                    KernelArgValue::WorkgroupIdX => 0,
                    KernelArgValue::WorkgroupIdY => 1,
                    _ => 2,
                };
                let register = Register::Sgpr(metadata.user_sgpr_count + dim);
                Ok(self.phys_reg_vreg(register, RegisterClass::Sgpr32))
            }
            KernelArgValue::DispatchId => {
                if metadata.user_sgpr_count >= 4 {
                    Ok(self.phys_reg_vreg(Register::Sgpr(2), RegisterClass::Sgpr64))
                } else {
                    Err(Error::lowering(
                        "dispatch id is neither preloaded nor in the hidden kernarg block",
                    ))
                }
            }
            KernelArgValue::ImplicitArgPtr => {
                self.hidden_kernarg_load(KernelArgKind::HiddenImplicitArgPtr, true)
            }
            KernelArgValue::GlobalOffsetX => {
                self.hidden_kernarg_load(KernelArgKind::HiddenGlobalOffsetX, false)
            }
            KernelArgValue::GlobalOffsetY => {
                self.hidden_kernarg_load(KernelArgKind::HiddenGlobalOffsetY, false)
            }
            KernelArgValue::GlobalOffsetZ => {
                self.hidden_kernarg_load(KernelArgKind::HiddenGlobalOffsetZ, false)
            }
        }
    }

    fn hidden_kernarg_load(&mut self, kind: KernelArgKind, wide: bool) -> Result<VirtualRegister> {
        let metadata = self.metadata.expect("Checked by the caller");
        let argument = metadata.argument_of_kind(kind).ok_or_else(|| {
            Error::lowering(format!("kernel has no hidden argument of kind {kind:?}"))
        })?;
        let offset = argument.offset as i64;

        let base = self.phys_reg_vreg(Register::Sgpr(0), RegisterClass::Sgpr64);
        let (class, opcode) = if wide {
            (RegisterClass::Sgpr64, Opcode::SLoadDwordx2)
        } else {
            (RegisterClass::Sgpr32, Opcode::SLoadDword)
        };
        let dest = self.create_vreg(class);
        self.build_before(MachineInst::new(
            opcode,
            vec![
                MachineOperand::def_virt(dest),
                MachineOperand::use_virt(base),
                MachineOperand::Immediate(offset),
            ],
        ));
        self.build_before(MachineInst::new(
            Opcode::SWaitcnt,
            vec![MachineOperand::Immediate(0)],
        ));
        Ok(dest)
    }
}
