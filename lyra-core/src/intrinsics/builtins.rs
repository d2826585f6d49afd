//!
//! The built-in intrinsics.
//!

use lyra_backend::Register;
use lyra_backend::RegisterClass;
use lyra_backend::ir;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::OperandRegister;
use lyra_backend::target::opcode::Opcode;

use crate::error::Error;
use crate::error::Result;
use crate::intrinsics::Constraint;
use crate::intrinsics::Intrinsic;
use crate::intrinsics::IntrinsicCallSite;
use crate::intrinsics::IntrinsicRegistry;
use crate::intrinsics::IrLoweringInfo;
use crate::intrinsics::KernelArgValue;
use crate::intrinsics::LoweredArg;
use crate::intrinsics::MirBuilder;
use crate::intrinsics::MirLoweringSite;

///
/// Registers every built-in intrinsic.
///
pub fn register_builtins(registry: &IntrinsicRegistry) {
    registry.register(
        "readReg",
        Intrinsic {
            ir_processor: read_reg_ir,
            mir_processor: read_reg_mir,
        },
    );
    registry.register(
        "writeReg",
        Intrinsic {
            ir_processor: write_reg_ir,
            mir_processor: write_reg_mir,
        },
    );
    registry.register(
        "writeExec",
        Intrinsic {
            ir_processor: write_exec_ir,
            mir_processor: write_exec_mir,
        },
    );
    registry.register(
        "implicitArgPtr",
        Intrinsic {
            ir_processor: implicit_arg_ptr_ir,
            mir_processor: implicit_arg_ptr_mir,
        },
    );
    // The three dimensions share the MIR processor; it recovers its
    // dimension from the recorded kernel args.
    registry.register(
        "workgroupIdX",
        Intrinsic {
            ir_processor: workgroup_id_x_ir,
            mir_processor: workgroup_id_mir,
        },
    );
    registry.register(
        "workgroupIdY",
        Intrinsic {
            ir_processor: workgroup_id_y_ir,
            mir_processor: workgroup_id_mir,
        },
    );
    registry.register(
        "workgroupIdZ",
        Intrinsic {
            ir_processor: workgroup_id_z_ir,
            mir_processor: workgroup_id_mir,
        },
    );
    registry.register(
        "sAtomicAdd",
        Intrinsic {
            ir_processor: s_atomic_add_ir,
            mir_processor: s_atomic_add_mir,
        },
    );
}

fn designator_of(site: &IntrinsicCallSite<'_>, index: usize) -> Result<Register> {
    match site.args.get(index) {
        Some(ir::Value::PhysicalRegister(register)) => Ok(*register),
        other => Err(Error::lowering(format!(
            "`{}` argument {index} must be a register designator, got {other:?}",
            site.name
        ))),
    }
}

fn lowered_register(
    site: &MirLoweringSite<'_>,
    index: usize,
    builder: &mut MirBuilder<'_>,
) -> Result<lyra_backend::mir::VirtualRegister> {
    match site.args.get(index) {
        Some(LoweredArg::Register(vreg)) => Ok(*vreg),
        Some(LoweredArg::Immediate(value)) => {
            let vreg = builder.create_vreg(RegisterClass::Sgpr32);
            builder.build_before(MachineInst::new(
                Opcode::SMovB32,
                vec![
                    MachineOperand::def_virt(vreg),
                    MachineOperand::Immediate(*value),
                ],
            ));
            Ok(vreg)
        }
        other => Err(Error::lowering(format!(
            "lowered argument {index} is not a value: {other:?}"
        ))),
    }
}

fn output_of(site: &MirLoweringSite<'_>) -> Result<lyra_backend::mir::VirtualRegister> {
    site.output
        .ok_or_else(|| Error::lowering("the placeholder lost its result register"))
}

// readReg(designator) -> value

fn read_reg_ir(site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    let register = designator_of(site, 0)?;
    Ok(IrLoweringInfo {
        return_constraint: Some(if register.is_vgpr() {
            Constraint::Vector
        } else {
            Constraint::Scalar
        }),
        arg_constraints: vec![Constraint::Immediate],
        accessed_registers: vec![register],
        kernel_args: vec![],
    })
}

fn read_reg_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let Some(LoweredArg::Designator(register)) = site.args.first().copied() else {
        return Err(Error::lowering("readReg lost its register designator"));
    };
    let output = output_of(site)?;
    let class = if register.is_vgpr() {
        RegisterClass::Vgpr32
    } else {
        RegisterClass::Sgpr32
    };
    let source = builder.phys_reg_vreg(register, class);
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::def_virt(output),
            MachineOperand::use_virt(source),
        ],
    ));
    Ok(())
}

// writeReg(designator, value)

fn write_reg_ir(site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    let register = designator_of(site, 0)?;
    if site.args.len() != 2 {
        return Err(Error::lowering(format!(
            "`{}` takes a designator and a value",
            site.name
        )));
    }
    Ok(IrLoweringInfo {
        return_constraint: None,
        arg_constraints: vec![
            Constraint::Immediate,
            if register.is_vgpr() {
                Constraint::Vector
            } else {
                Constraint::Scalar
            },
        ],
        accessed_registers: vec![register],
        kernel_args: vec![],
    })
}

fn write_reg_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let Some(LoweredArg::Designator(register)) = site.args.first().copied() else {
        return Err(Error::lowering("writeReg lost its register designator"));
    };
    let value = lowered_register(site, 1, builder)?;
    let class = if register.is_vgpr() {
        RegisterClass::Vgpr32
    } else {
        RegisterClass::Sgpr32
    };
    let dest = builder.phys_reg_vreg(register, class);
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::def_virt(dest),
            MachineOperand::use_virt(value),
        ],
    ));
    Ok(())
}

// writeExec(value): writes the low half of the exec mask.

fn write_exec_ir(site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    if site.args.len() != 1 {
        return Err(Error::lowering("`writeExec` takes one value"));
    }
    Ok(IrLoweringInfo {
        return_constraint: None,
        arg_constraints: vec![Constraint::Scalar],
        accessed_registers: vec![Register::ExecLo],
        kernel_args: vec![],
    })
}

fn write_exec_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let value = lowered_register(site, 0, builder)?;
    builder.mark_exec_write();
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::Register {
                register: OperandRegister::Physical(Register::ExecLo),
                is_def: true,
            },
            MachineOperand::use_virt(value),
        ],
    ));
    Ok(())
}

// implicitArgPtr() -> pointer

fn implicit_arg_ptr_ir(_site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    Ok(IrLoweringInfo {
        return_constraint: Some(Constraint::Scalar64),
        arg_constraints: vec![],
        accessed_registers: vec![Register::Sgpr(0), Register::Sgpr(1)],
        kernel_args: vec![KernelArgValue::ImplicitArgPtr],
    })
}

fn implicit_arg_ptr_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let output = output_of(site)?;
    let pointer = builder.kernel_arg_reg(KernelArgValue::ImplicitArgPtr)?;
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::def_virt(output),
            MachineOperand::use_virt(pointer),
        ],
    ));
    Ok(())
}

// workgroupIdX/Y/Z() -> id

fn workgroup_id_info(value: KernelArgValue) -> IrLoweringInfo {
    IrLoweringInfo {
        return_constraint: Some(Constraint::Scalar),
        arg_constraints: vec![],
        accessed_registers: vec![],
        kernel_args: vec![value],
    }
}

fn workgroup_id_x_ir(_site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    Ok(workgroup_id_info(KernelArgValue::WorkgroupIdX))
}

fn workgroup_id_y_ir(_site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    Ok(workgroup_id_info(KernelArgValue::WorkgroupIdY))
}

fn workgroup_id_z_ir(_site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    Ok(workgroup_id_info(KernelArgValue::WorkgroupIdZ))
}

fn workgroup_id_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let output = output_of(site)?;
    let value = site
        .info
        .kernel_args
        .first()
        .copied()
        .ok_or_else(|| Error::lowering("workgroup id lost its dimension"))?;
    let id = builder.kernel_arg_reg(value)?;
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::def_virt(output),
            MachineOperand::use_virt(id),
        ],
    ));
    Ok(())
}

// sAtomicAdd(address, value)

fn s_atomic_add_ir(site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    if site.args.len() != 2 {
        return Err(Error::lowering("`sAtomicAdd` takes an address and a value"));
    }
    Ok(IrLoweringInfo {
        return_constraint: None,
        arg_constraints: vec![Constraint::Scalar64, Constraint::Scalar],
        accessed_registers: vec![],
        kernel_args: vec![],
    })
}

fn s_atomic_add_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let address = lowered_register(site, 0, builder)?;
    let value = lowered_register(site, 1, builder)?;
    builder.build_before(MachineInst::new(
        Opcode::SAtomicAdd,
        vec![
            MachineOperand::use_virt(value),
            MachineOperand::use_virt(address),
            MachineOperand::Immediate(0),
        ],
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use lyra_backend::Register;
    use lyra_backend::ir;

    use crate::intrinsics::Constraint;
    use crate::intrinsics::IntrinsicCallSite;
    use crate::intrinsics::IntrinsicRegistry;

    #[test]
    fn builtins_resolve_with_template_arguments() {
        let registry = IntrinsicRegistry::new();
        assert!(registry.resolve("readReg").is_ok());
        assert!(registry.resolve("readReg<4>").is_ok());
        assert!(registry.resolve("workgroupIdY").is_ok());
        assert!(registry.resolve("unknownIntrinsic").is_err());
    }

    #[test]
    fn read_reg_constrains_by_register_file() {
        let registry = IntrinsicRegistry::new();
        let intrinsic = registry.resolve("readReg").expect("Always valid");

        let scalar_args = vec![ir::Value::PhysicalRegister(Register::Sgpr(4))];
        let info = (intrinsic.ir_processor)(&IntrinsicCallSite {
            name: "readReg",
            args: scalar_args.as_slice(),
        })
        .expect("Always valid");
        assert_eq!(info.return_constraint, Some(Constraint::Scalar));
        assert_eq!(info.accessed_registers, vec![Register::Sgpr(4)]);

        let vector_args = vec![ir::Value::PhysicalRegister(Register::Vgpr(9))];
        let info = (intrinsic.ir_processor)(&IntrinsicCallSite {
            name: "readReg",
            args: vector_args.as_slice(),
        })
        .expect("Always valid");
        assert_eq!(info.return_constraint, Some(Constraint::Vector));
    }
}
