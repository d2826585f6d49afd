//!
//! Preamble analysis, register allocation, and frame injection for
//! instrumented functions.
//!

use std::collections::BTreeSet;

use lyra_backend::Register;
use lyra_backend::codegen::AllocationInput;
use lyra_backend::codegen::AllocationResult;
use lyra_backend::codegen::allocate;
use lyra_backend::mir::InstId;
use lyra_backend::mir::InstOrigin;
use lyra_backend::mir::MachineFunction;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::OperandRegister;
use lyra_backend::target::RegisterInfo;
use lyra_backend::target::opcode::Format;
use lyra_backend::target::opcode::Opcode;
use lyra_utils::Isa;

use crate::codegen::lower::AccessSet;
use crate::error::Error;
use crate::error::Result;
use crate::intrinsics::KernelArgValue;
use crate::lifter::LiftedRepresentation;
use crate::symbol::Symbol;

///
/// The preamble plan of one instrumented function.
///
#[derive(Debug, Clone)]
pub struct FramePlan {
    /// The register file description of the target.
    pub register_info: RegisterInfo,
    /// Physical registers the original code or the intrinsics already
    /// claim; allocation avoids all of them.
    pub occupied: BTreeSet<Register>,
    /// The reserved lane-indexed register spilled values live in.
    pub state_value_register: Register,
    /// The reserved even scalar pair spilled values shuttle through.
    pub shuttle: Register,
    /// The reserved scalar the SCC value is preserved in around
    /// clobbering injected code.
    pub scc_scratch: Register,
    /// Whether the injected payload writes the exec mask.
    pub writes_exec: bool,
    /// The kernel-argument values the payload needs at entry.
    pub kernel_args: BTreeSet<KernelArgValue>,
    /// Extra scratch bytes the instrumented kernel requests.
    pub extra_scratch_bytes: u32,
}

///
/// Collects every physical register the module's original code can
/// possibly hold live, metadata-declared register budgets included.
///
/// The set is module-wide: device functions share the register file with
/// their calling kernel, so allocation inside any function must avoid the
/// whole set.
///
pub fn occupied_registers(lr: &LiftedRepresentation) -> BTreeSet<Register> {
    let mut occupied = BTreeSet::new();

    for name in lr.machine_module().function_names() {
        if let Some(kernel) = lr
            .function_symbol(name.as_str())
            .and_then(Symbol::as_kernel)
        {
            for index in 0..kernel.metadata.sgpr_count {
                occupied.insert(Register::Sgpr(index));
            }
            for index in 0..kernel.metadata.vgpr_count {
                occupied.insert(Register::Vgpr(index));
            }
        }
    }

    for function in lr.machine_module().functions() {
        for (_, inst) in function.instructions() {
            if inst.origin != InstOrigin::Original {
                continue;
            }
            let description = inst.opcode.description();
            let width = description.dest_slots.max(1);
            for (index, operand) in inst.operands.iter().enumerate() {
                let MachineOperand::Register {
                    register: OperandRegister::Physical(register),
                    ..
                } = operand
                else {
                    continue;
                };
                // Wide ALU operations read and write register pairs; the
                // scalar-memory base is always a pair.
                let slots = if description.format == Format::Smem && index == 1 {
                    2
                } else {
                    width
                };
                for slot in 0..slots {
                    match register {
                        Register::Sgpr(base) if base + slot < 102 => {
                            occupied.insert(Register::Sgpr(base + slot));
                        }
                        Register::Vgpr(base) if base + slot < 256 => {
                            occupied.insert(Register::Vgpr(base + slot));
                        }
                        other => {
                            if slot == 0 {
                                occupied.insert(*other);
                            }
                        }
                    }
                }
            }
        }
    }
    occupied
}

///
/// Derives the preamble plan of one function: which registers stay
/// reserved, where spills go, and what the payload needs at entry.
///
pub fn analyze(
    function: &MachineFunction,
    module_occupied: &BTreeSet<Register>,
    access: &AccessSet,
    isa: &Isa,
) -> Result<FramePlan> {
    let register_info = RegisterInfo {
        sgpr_count: isa.addressable_sgpr_count(),
        vgpr_count: isa.addressable_vgpr_count(),
    };

    let mut occupied = module_occupied.clone();
    occupied.extend(access.registers.iter().copied());

    let state_value_register = (0..register_info.vgpr_count)
        .map(Register::Vgpr)
        .find(|register| !occupied.contains(register))
        .ok_or_else(|| {
            Error::codegen(format!(
                "`{}` leaves no free vector register for the state-value array",
                function.name()
            ))
        })?;

    let mut free_sgprs = (0..register_info.sgpr_count)
        .map(Register::Sgpr)
        .filter(|register| !occupied.contains(register));
    let shuttle = {
        let mut candidate = None;
        for index in (0..register_info.sgpr_count - 1).step_by(2) {
            let low = Register::Sgpr(index);
            let high = Register::Sgpr(index + 1);
            if !occupied.contains(&low) && !occupied.contains(&high) {
                candidate = Some(low);
                break;
            }
        }
        candidate.ok_or_else(|| {
            Error::codegen(format!(
                "`{}` leaves no free scalar pair for the spill shuttle",
                function.name()
            ))
        })?
    };
    let scc_scratch = free_sgprs
        .find(|register| {
            *register != shuttle && *register != shuttle.offset_by(1)
        })
        .ok_or_else(|| {
            Error::codegen(format!(
                "`{}` leaves no free scalar register for SCC preservation",
                function.name()
            ))
        })?;

    Ok(FramePlan {
        register_info,
        occupied,
        state_value_register,
        shuttle,
        scc_scratch,
        writes_exec: access.writes_exec,
        kernel_args: access.kernel_args.clone(),
        extra_scratch_bytes: 0,
    })
}

///
/// Runs register allocation under the plan's reservations.
///
pub fn allocate_function(
    function: &mut MachineFunction,
    plan: &FramePlan,
) -> Result<AllocationResult> {
    let mut occupied = plan.occupied.clone();
    occupied.insert(plan.scc_scratch);
    allocate(
        function,
        &AllocationInput {
            register_info: &plan.register_info,
            occupied,
            state_value_register: plan.state_value_register,
            shuttle: plan.shuttle,
        },
    )
    .map_err(|error| Error::codegen(format!("allocating `{}`: {error}", function.name())))
}

///
/// Injects the payload frame: every injected region that clobbers SCC or
/// the exec mask is wrapped in an SCC-preserving capture/restore pair.
///
/// The state-value register and the allocator's assignments come from the
/// register file's free set, so no push/pop of original state is needed
/// beyond this.
///
pub fn inject_frame(
    function: &mut MachineFunction,
    plan: &FramePlan,
    _allocation: &AllocationResult,
) -> Result<()> {
    let mut regions: Vec<(InstId, InstId, bool)> = Vec::new();
    for block in function.layout().to_vec() {
        let mut start: Option<InstId> = None;
        let mut last: Option<InstId> = None;
        let mut clobbers = false;
        for inst_id in function.block(block).insts().to_vec() {
            let inst = function.inst(inst_id);
            if inst.origin == InstOrigin::Injected {
                start.get_or_insert(inst_id);
                last = Some(inst_id);
                let description = inst.opcode.description();
                clobbers |= description.defs_scc || description.defs_exec;
                // The address-materialization pseudo expands to an
                // add-with-carry pair, which writes SCC.
                clobbers |= inst.opcode == Opcode::GlobalAddr;
                clobbers |= inst.registers().any(|(register, is_def)| {
                    is_def
                        && matches!(
                            register,
                            OperandRegister::Physical(
                                Register::ExecLo | Register::ExecHi
                            )
                        )
                });
            } else if let (Some(first), Some(last_inst)) = (start.take(), last.take()) {
                if clobbers {
                    regions.push((first, last_inst, true));
                }
                clobbers = false;
            }
        }
        if let (Some(first), Some(last_inst)) = (start, last) {
            if clobbers {
                regions.push((first, last_inst, true));
            }
        }
    }

    for (first, last, _) in regions {
        // Capture SCC into the scratch register, restore it by comparing
        // the scratch against zero.
        function.insert_before(
            first,
            MachineInst::new(
                Opcode::SCselectB32,
                vec![
                    MachineOperand::def_phys(plan.scc_scratch),
                    MachineOperand::Immediate(1),
                    MachineOperand::Immediate(0),
                ],
            ),
        );
        function.insert_after(
            last,
            MachineInst::new(
                Opcode::SCmpLgU32,
                vec![
                    MachineOperand::use_phys(plan.scc_scratch),
                    MachineOperand::Immediate(0),
                ],
            ),
        );
    }
    Ok(())
}

///
/// The register counts an instrumented kernel must declare, covering the
/// original budget, the allocator's assignments, and the reservations.
///
pub fn widened_register_counts(
    plan: &FramePlan,
    allocation: &AllocationResult,
) -> (u16, u16) {
    let mut max_sgpr: u16 = 0;
    let mut max_vgpr: u16 = 0;
    let mut cover = |register: &Register, slots: u16| match register {
        Register::Sgpr(index) => max_sgpr = max_sgpr.max(index + slots),
        Register::Vgpr(index) => max_vgpr = max_vgpr.max(index + slots),
        _ => {}
    };

    for register in plan.occupied.iter() {
        cover(register, 1);
    }
    cover(&plan.shuttle, 2);
    cover(&plan.scc_scratch, 1);
    for register in allocation.assignments.values() {
        // Pair assignments are indistinguishable here; covering two slots
        // never undercounts.
        cover(register, 2);
    }
    if allocation.spill_lanes_used > 0 {
        cover(&plan.state_value_register, 1);
    }
    (max_sgpr, max_vgpr)
}
