//!
//! Intrinsic registration and lowering tests.
//!

mod common;

use lyra_backend::Register;
use lyra_backend::RegisterClass;
use lyra_backend::ir;
use lyra_backend::mir::InstOrigin;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::OperandRegister;
use lyra_backend::target::opcode::Opcode;
use lyra_core::HookArgument;
use lyra_core::error::Result;
use lyra_core::intrinsics::Constraint;
use lyra_core::intrinsics::Intrinsic;
use lyra_core::intrinsics::IntrinsicCallSite;
use lyra_core::intrinsics::IrLoweringInfo;
use lyra_core::intrinsics::LoweredArg;
use lyra_core::intrinsics::MirBuilder;
use lyra_core::intrinsics::MirLoweringSite;

use self::common::add_kernel_elf;
use self::common::load_kernel;
use self::common::load_tool;
use self::common::world;

fn my_read_reg_ir(site: &IntrinsicCallSite<'_>) -> Result<IrLoweringInfo> {
    let register = match site.args.first() {
        Some(ir::Value::PhysicalRegister(register)) => *register,
        other => {
            return Err(lyra_core::Error::lowering(format!(
                "expected a designator, got {other:?}"
            )));
        }
    };
    Ok(IrLoweringInfo {
        return_constraint: Some(Constraint::Scalar),
        arg_constraints: vec![Constraint::Immediate],
        accessed_registers: vec![register],
        kernel_args: vec![],
    })
}

fn my_read_reg_mir(builder: &mut MirBuilder<'_>, site: &MirLoweringSite<'_>) -> Result<()> {
    let Some(LoweredArg::Designator(register)) = site.args.first().copied() else {
        return Err(lyra_core::Error::lowering("lost the designator"));
    };
    let output = site
        .output
        .ok_or_else(|| lyra_core::Error::lowering("lost the output register"))?;
    let source = builder.phys_reg_vreg(register, RegisterClass::Sgpr32);
    builder.build_before(MachineInst::new(
        Opcode::Copy,
        vec![
            MachineOperand::def_virt(output),
            MachineOperand::use_virt(source),
        ],
    ));
    Ok(())
}

#[test]
fn custom_intrinsics_declare_the_scalar_class_and_lower_to_a_copy() {
    let world = world();

    world.session.intrinsics().register(
        "my.readReg32",
        Intrinsic {
            ir_processor: my_read_reg_ir,
            mir_processor: my_read_reg_mir,
        },
    );

    // The IR stage declares an "s" result, which selection turns into a
    // 32-bit scalar virtual register.
    let intrinsic = world
        .session
        .intrinsics()
        .resolve("my.readReg32")
        .expect("Just registered");
    let args = vec![ir::Value::PhysicalRegister(Register::Sgpr(4))];
    let info = (intrinsic.ir_processor)(&IntrinsicCallSite {
        name: "my.readReg32",
        args: args.as_slice(),
    })
    .expect("Always valid");
    assert_eq!(
        info.return_constraint.and_then(|c| c.register_class()),
        Some(RegisterClass::Sgpr32)
    );

    // End to end: a hook calling it lowers to a copy out of s4 feeding the
    // counter bump.
    let probe_payload = {
        let mut module = common::tool_payload_module();
        module.add_function(ir::Function {
            name: "probe".to_owned(),
            param_count: 0,
            is_hook: true,
            body: vec![
                ir::Inst::Call {
                    callee: "my.readReg32".to_owned(),
                    args: vec![ir::Value::PhysicalRegister(Register::Sgpr(4))],
                },
                ir::Inst::AtomicAdd {
                    address: ir::Value::GlobalAddress(common::COUNTER_GLOBAL.to_owned()),
                    value: ir::Value::Result(0),
                },
                ir::Inst::Return { value: None },
            ],
        });
        module
    };
    let (_tool, handles) = common::load_tool_with(&world, &probe_payload);
    let probe_handle = handles["probe"];

    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    let instrumented = world
        .session
        .instrument(&representation, |task| {
            let target = task
                .representation()
                .records()
                .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                .map(|(inst_ref, _)| inst_ref.clone())
                .expect("The add instruction was lifted");
            task.insert_hook_before(&target, probe_handle, vec![])
        })
        .expect("Always valid");

    let function = instrumented
        .machine_module()
        .function("k")
        .expect("Always exists");
    let copy_from_s4 = function.instructions().any(|(_, inst)| {
        inst.opcode == Opcode::Copy
            && inst.origin == InstOrigin::Injected
            && inst.operands.iter().any(|operand| {
                matches!(
                    operand,
                    MachineOperand::Register {
                        register: OperandRegister::Physical(Register::Sgpr(4)),
                        is_def: false,
                    }
                )
            })
    });
    assert!(copy_from_s4, "the intrinsic lowered to a copy out of s4");
}

#[test]
fn register_arguments_flow_through_a_read_reg_copy() {
    let world = world();
    let (_tool, hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    let instrumented = world
        .session
        .instrument(&representation, |task| {
            let target = task
                .representation()
                .records()
                .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                .map(|(inst_ref, _)| inst_ref.clone())
                .expect("The add instruction was lifted");
            task.insert_hook_before(
                &target,
                hook_handle,
                vec![HookArgument::Register(Register::Sgpr(0))],
            )
        })
        .expect("Always valid");

    let function = instrumented
        .machine_module()
        .function("k")
        .expect("Always exists");
    let insts: Vec<_> = function
        .instructions()
        .map(|(_, inst)| inst.clone())
        .collect();

    // The injected region reads s0 through an explicit copy, and the
    // counter bump consumes the value.
    let copy_in = insts.iter().position(|inst| {
        inst.opcode == Opcode::Copy
            && inst.origin == InstOrigin::Injected
            && inst.operands.iter().any(|operand| {
                matches!(
                    operand,
                    MachineOperand::Register {
                        register: OperandRegister::Physical(Register::Sgpr(0)),
                        is_def: false,
                    }
                )
            })
    });
    assert!(copy_in.is_some(), "no copy-in from s0: {insts:#?}");

    let atomic = insts
        .iter()
        .position(|inst| inst.opcode == Opcode::SAtomicAdd)
        .expect("The counter bump survived lowering");
    let anchor = insts
        .iter()
        .position(|inst| {
            inst.opcode == Opcode::SAddU32 && inst.origin == InstOrigin::Original
        })
        .expect("The original add survives");
    assert!(copy_in.expect("Checked above") < atomic);
    assert!(atomic < anchor);
}
