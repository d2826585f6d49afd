//!
//! Hook materialization and two-stage intrinsic lowering.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use lyra_backend::Register;
use lyra_backend::RegisterClass;
use lyra_backend::ir;
use lyra_backend::codegen::select_body;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::OperandRegister;
use lyra_backend::mir::VirtualRegister;

use crate::error::Error;
use crate::error::Result;
use crate::instrumentation::HookArgument;
use crate::instrumentation::HookInvocation;
use crate::intrinsics::Constraint;
use crate::intrinsics::IntrinsicRegistry;
use crate::intrinsics::IrLoweringInfo;
use crate::intrinsics::IntrinsicCallSite;
use crate::intrinsics::KernelArgValue;
use crate::intrinsics::LoweredArg;
use crate::intrinsics::MirBuilder;
use crate::intrinsics::MirLoweringSite;
use crate::lifter::InstRef;
use crate::lifter::LiftedRepresentation;
use crate::symbol::Symbol;

///
/// The per-function access bookkeeping the virtualization and frame
/// passes consume.
///
#[derive(Debug, Clone, Default)]
pub struct AccessSet {
    /// The physical registers the injected code touches.
    pub registers: BTreeSet<Register>,
    /// The physical register each minted stand-in virtualizes. Distinct
    /// placeholders mint distinct stand-ins for the same register.
    pub phys_vregs: BTreeMap<VirtualRegister, (Register, RegisterClass)>,
    /// The kernel-argument values the injected code reads.
    pub kernel_args: BTreeSet<KernelArgValue>,
    /// Whether the injected code writes the exec mask.
    pub writes_exec: bool,
}

impl AccessSet {
    fn absorb(&mut self, builder: MirBuilder<'_>) {
        self.registers.extend(builder.accessed_registers);
        for ((register, class), vreg) in builder.phys_vregs {
            self.phys_vregs.insert(vreg, (register, class));
        }
        self.kernel_args.extend(builder.kernel_args_used);
        self.writes_exec |= builder.writes_exec;
    }
}

/// The bundle kept between the IR stage and the MIR stage, recovered
/// through the placeholder's monotonic index.
struct LoweredIntrinsic {
    name: String,
    info: IrLoweringInfo,
    original_args: Vec<ir::Value>,
}

///
/// The state threaded through one instrumentation run.
///
pub struct LoweringState {
    intrinsics: Arc<IntrinsicRegistry>,
    next_index: u32,
    next_wrapper: u32,
    side_table: BTreeMap<u32, LoweredIntrinsic>,
    /// The access sets accumulated per machine function.
    pub access: BTreeMap<String, AccessSet>,
}

impl LoweringState {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(intrinsics: Arc<IntrinsicRegistry>) -> Self {
        Self {
            intrinsics,
            next_index: 0,
            next_wrapper: 0,
            side_table: BTreeMap::new(),
            access: BTreeMap::new(),
        }
    }
}

///
/// Materializes one target's queued hook invocations: builds the wrapper
/// IR, optimizes it, lowers intrinsic calls to placeholders, selects the
/// wrapper into machine IR before the target, and lowers the placeholders
/// to real machine code.
///
pub fn materialize_and_lower(
    lr: &mut LiftedRepresentation,
    tool_module: &ir::Module,
    target: &InstRef,
    invocations: &[HookInvocation],
    state: &mut LoweringState,
) -> Result<()> {
    if !lr.contains(target) {
        return Err(Error::codegen(format!(
            "hook target {target:?} vanished before materialization"
        )));
    }

    // Step 3: the wrapper function calling the hooks in enqueue order.
    let wrapper_name = format!("__lyra_hook_wrapper_{}", state.next_wrapper);
    state.next_wrapper += 1;

    let mut body = Vec::new();
    for invocation in invocations {
        if !tool_module.clone_function_into(invocation.hook_name.as_str(), lr.ir_module_mut()) {
            return Err(Error::lowering(format!(
                "hook `{}` is not defined in the tool payload",
                invocation.hook_name
            )));
        }
        let mut args = Vec::with_capacity(invocation.args.len());
        for argument in invocation.args.iter() {
            match argument {
                HookArgument::Constant(value) => args.push(ir::Value::Constant(*value)),
                HookArgument::Register(register) => {
                    body.push(ir::Inst::Call {
                        callee: "readReg".to_owned(),
                        args: vec![ir::Value::PhysicalRegister(*register)],
                    });
                    args.push(ir::Value::Result(body.len() as u32 - 1));
                }
            }
        }
        body.push(ir::Inst::Call {
            callee: invocation.hook_name.clone(),
            args,
        });
    }
    body.push(ir::Inst::Return { value: None });

    lr.ir_module_mut().add_function(ir::Function {
        name: wrapper_name.clone(),
        param_count: 0,
        is_hook: false,
        body,
    });

    // Step 4: the standard IR pipeline over the injected code.
    ir::passes::optimize_function(lr.ir_module_mut(), wrapper_name.as_str())
        .map_err(|error| Error::lowering(format!("optimizing `{wrapper_name}`: {error}")))?;

    // Step 5: IR-level intrinsic lowering to indexed placeholders.
    lower_ir_intrinsics(lr, wrapper_name.as_str(), state)?;

    // Step 6: instruction selection; placeholders pass through.
    let body = lr
        .ir_module()
        .functions
        .get(wrapper_name.as_str())
        .expect("The wrapper was just added")
        .body
        .clone();
    let metadata = lr
        .function_symbol(target.function.as_str())
        .and_then(Symbol::as_kernel)
        .map(|kernel| kernel.metadata.clone());
    let function = lr
        .machine_module_mut()
        .function_mut(target.function.as_str())
        .ok_or_else(|| {
            Error::codegen(format!("no machine function `{}`", target.function))
        })?;
    let selection = select_body(body.as_slice(), function, target.inst)
        .map_err(|error| Error::codegen(format!("selecting `{wrapper_name}`: {error}")))?;

    // Step 7: MIR-level intrinsic lowering through the recovered bundles.
    for (index, site_inst) in selection.asm_sites.iter() {
        let lowered = state.side_table.remove(index).unwrap_or_else(|| {
            panic!(
                "inline-asm bundle {index} is unrecoverable after selection; \
                 an intrinsic modified its own placeholder"
            )
        });

        let (output, inputs) = split_site_operands(function.inst(*site_inst));
        let args = assemble_lowered_args(&lowered, inputs)?;

        let mut builder = MirBuilder::new(&mut *function, *site_inst, metadata.as_ref());
        let site = MirLoweringSite {
            info: &lowered.info,
            args,
            output,
        };
        let intrinsic = state.intrinsics.resolve(lowered.name.as_str())?;
        (intrinsic.mir_processor)(&mut builder, &site)
            .map_err(|error| Error::lowering(format!("lowering `{}`: {error}", lowered.name)))?;

        state
            .access
            .entry(target.function.clone())
            .or_default()
            .absorb(builder);
        function.remove(*site_inst);
    }

    // Hook code landed in this function even when no intrinsic did.
    state.access.entry(target.function.clone()).or_default();
    Ok(())
}

///
/// Replaces every intrinsic call in a function's body with an indexed
/// inline-asm placeholder and stashes the bundle in the side table.
///
fn lower_ir_intrinsics(
    lr: &mut LiftedRepresentation,
    wrapper_name: &str,
    state: &mut LoweringState,
) -> Result<()> {
    let intrinsics = state.intrinsics.clone();
    let module = lr.ir_module_mut();
    let Some(function) = module.functions.get_mut(wrapper_name) else {
        return Ok(());
    };

    for inst in function.body.iter_mut() {
        let ir::Inst::Call { callee, args } = inst else {
            continue;
        };
        let intrinsic = intrinsics.resolve(callee.as_str())?;
        let site = IntrinsicCallSite {
            name: callee.as_str(),
            args: args.as_slice(),
        };
        let info = (intrinsic.ir_processor)(&site)?;
        if info.arg_constraints.len() != args.len() {
            return Err(Error::lowering(format!(
                "`{callee}` declares {} constraints for {} arguments",
                info.arg_constraints.len(),
                args.len()
            )));
        }

        let index = state.next_index;
        state.next_index += 1;

        let inputs: Vec<ir::Value> = args
            .iter()
            .zip(info.arg_constraints.iter())
            .filter(|(_, constraint)| **constraint != Constraint::Immediate)
            .map(|(value, _)| value.clone())
            .collect();
        let result_class = info
            .return_constraint
            .and_then(|constraint| constraint.register_class());

        state.side_table.insert(
            index,
            LoweredIntrinsic {
                name: callee.clone(),
                info,
                original_args: args.clone(),
            },
        );
        *inst = ir::Inst::InlineAsm {
            index,
            inputs,
            result_class,
        };
    }
    Ok(())
}

///
/// Splits a placeholder's machine operands into its optional result
/// register and its input registers.
///
fn split_site_operands(
    inst: &lyra_backend::mir::MachineInst,
) -> (Option<VirtualRegister>, Vec<VirtualRegister>) {
    let mut output = None;
    let mut inputs = Vec::new();
    for operand in inst.operands.iter() {
        if let MachineOperand::Register {
            register: OperandRegister::Virtual(vreg),
            is_def,
        } = operand
        {
            if *is_def {
                output = Some(*vreg);
            } else {
                inputs.push(*vreg);
            }
        }
    }
    (output, inputs)
}

///
/// Re-associates the original call arguments with their lowered form:
/// immediate-constrained arguments are consumed as designators or
/// constants, the rest take the placeholder's input registers in order.
///
fn assemble_lowered_args(
    lowered: &LoweredIntrinsic,
    inputs: Vec<VirtualRegister>,
) -> Result<Vec<LoweredArg>> {
    let mut remaining = inputs.into_iter();
    let mut args = Vec::with_capacity(lowered.original_args.len());
    for (value, constraint) in lowered
        .original_args
        .iter()
        .zip(lowered.info.arg_constraints.iter())
    {
        let arg = match constraint {
            Constraint::Immediate => match value {
                ir::Value::PhysicalRegister(register) => LoweredArg::Designator(*register),
                ir::Value::Constant(constant) => LoweredArg::Immediate(*constant),
                other => {
                    return Err(Error::lowering(format!(
                        "`{}` expected an immediate-class argument, got {other:?}",
                        lowered.name
                    )));
                }
            },
            _ => LoweredArg::Register(remaining.next().ok_or_else(|| {
                Error::lowering(format!(
                    "`{}` lost a value input during selection",
                    lowered.name
                ))
            })?),
        };
        args.push(arg);
    }
    Ok(args)
}
