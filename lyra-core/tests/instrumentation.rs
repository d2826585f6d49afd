//!
//! Instrumentation pipeline and loader end-to-end tests.
//!

mod common;

use lyra_backend::mir::MachineOperand;
use lyra_backend::target::opcode::Opcode;
use lyra_core::HookArgument;
use lyra_runtime::AqlDispatchPacket;
use lyra_runtime::CoreApi as _;

use self::common::add_kernel_elf;
use self::common::load_kernel;
use self::common::load_tool;
use self::common::world;

#[test]
fn instrument_and_load_registers_the_preset_and_redirects_dispatch() {
    let world = world();
    let (_tool, hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");

    let representation = world.session.lift(&kernel).expect("Always valid");
    assert!(!world.session.is_kernel_instrumented(&kernel, "p"));

    world
        .session
        .instrument_and_load(
            &kernel,
            &representation,
            |task| {
                let target = task
                    .representation()
                    .records()
                    .map(|(inst_ref, record)| (inst_ref.clone(), record.clone()))
                    .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                    .map(|(inst_ref, _)| inst_ref)
                    .expect("The add instruction was lifted");
                task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(42)])
            },
            "p",
        )
        .expect("Always valid");

    assert!(world.session.is_kernel_instrumented(&kernel, "p"));
    let instrumented = world
        .session
        .loader()
        .instrumented_kernel(&kernel, "p")
        .expect("Always valid");

    let descriptor = kernel.as_kernel().expect("Is a kernel").descriptor_address;
    assert_ne!(instrumented.kernel_object, descriptor);

    let mut packet = AqlDispatchPacket::for_kernel(descriptor);
    world
        .session
        .override_with_instrumented(&mut packet, "p")
        .expect("Always valid");
    assert_eq!(packet.kernel_object, instrumented.kernel_object);
}

#[test]
fn dispatch_override_is_idempotent() {
    let world = world();
    let (_tool, hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    world
        .session
        .instrument_and_load(
            &kernel,
            &representation,
            |task| {
                let target = task
                    .representation()
                    .records()
                    .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                    .map(|(inst_ref, _)| inst_ref.clone())
                    .expect("The add instruction was lifted");
                task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(1)])
            },
            "p",
        )
        .expect("Always valid");

    let descriptor = kernel.as_kernel().expect("Is a kernel").descriptor_address;
    let mut packet = AqlDispatchPacket::for_kernel(descriptor);
    world
        .session
        .override_with_instrumented(&mut packet, "p")
        .expect("Always valid");
    let once = packet.to_bytes();
    world
        .session
        .override_with_instrumented(&mut packet, "p")
        .expect("Always valid");
    assert_eq!(packet.to_bytes(), once);
}

#[test]
fn instrumentation_is_performed_at_most_once_per_preset() {
    let world = world();
    let (_tool, hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    let mutator_factory = |hook_handle: u64| {
        move |task: &mut lyra_core::InstrumentationTask| {
            let target = task
                .representation()
                .records()
                .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                .map(|(inst_ref, _)| inst_ref.clone())
                .expect("The add instruction was lifted");
            task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(7)])
        }
    };

    world
        .session
        .instrument_and_load(&kernel, &representation, mutator_factory(hook_handle), "p")
        .expect("Always valid");
    let first = world
        .session
        .loader()
        .instrumented_kernel(&kernel, "p")
        .expect("Always valid");

    world
        .session
        .instrument_and_load(&kernel, &representation, mutator_factory(hook_handle), "p")
        .expect("Always valid");
    let second = world
        .session
        .loader()
        .instrumented_kernel(&kernel, "p")
        .expect("Always valid");

    assert_eq!(first.kernel_object, second.kernel_object);
    assert_eq!(first.executable, second.executable);
}

#[test]
fn hooks_for_one_instruction_materialize_in_enqueue_order_before_it() {
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
            task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(11)])?;
            task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(22)])
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

    let position_of_constant = |constant: i64| {
        insts
            .iter()
            .position(|inst| {
                inst.opcode == Opcode::SMovB32
                    && inst
                        .operands
                        .iter()
                        .any(|operand| *operand == MachineOperand::Immediate(constant))
            })
            .unwrap_or_else(|| panic!("no materialized constant {constant}"))
    };
    let anchor = insts
        .iter()
        .position(|inst| inst.opcode == Opcode::SAddU32 && inst.origin == lyra_backend::mir::InstOrigin::Original)
        .expect("The original add survives");

    let first_hook = position_of_constant(11);
    let second_hook = position_of_constant(22);
    assert!(first_hook < second_hook, "enqueue order is preserved");
    assert!(second_hook < anchor, "hooks land strictly before the target");

    // Both invocations lowered to scalar atomic adds.
    let atomic_count = insts
        .iter()
        .filter(|inst| inst.opcode == Opcode::SAtomicAdd)
        .count();
    assert_eq!(atomic_count, 2);
}

#[test]
fn preset_registration_clears_when_executables_go_away() {
    let world = world();
    let (_tool, hook_handle) = load_tool(&world);
    let (executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    assert!(!world.session.is_kernel_instrumented(&kernel, "p"));
    world
        .session
        .instrument_and_load(
            &kernel,
            &representation,
            |task| {
                let target = task
                    .representation()
                    .records()
                    .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                    .map(|(inst_ref, _)| inst_ref.clone())
                    .expect("The add instruction was lifted");
                task.insert_hook_before(&target, hook_handle, vec![HookArgument::Constant(1)])
            },
            "p",
        )
        .expect("Always valid");
    assert!(world.session.is_kernel_instrumented(&kernel, "p"));

    let instrumented = world
        .session
        .loader()
        .instrumented_kernel(&kernel, "p")
        .expect("Always valid");

    world
        .runtime
        .destroy_executable(executable)
        .expect("Always valid");

    // The preset entry and the derived executable are gone.
    assert!(!world.session.is_kernel_instrumented(&kernel, "p"));
    assert!(
        world
            .runtime
            .destroy_executable(instrumented.executable)
            .is_err(),
        "the instrumented executable was torn down with its original"
    );
}

#[test]
fn mutator_errors_propagate_verbatim() {
    let world = world();
    let (_tool, _hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    let error = world
        .session
        .instrument(&representation, |_task| {
            Err(lyra_core::Error::lowering("tool decided not to"))
        })
        .expect_err("Must fail");
    assert!(error.to_string().contains("tool decided not to"));
    assert!(!world.session.is_kernel_instrumented(&kernel, "p"));
}

#[test]
fn unknown_hook_handles_are_rejected() {
    let world = world();
    let (_tool, _hook_handle) = load_tool(&world);
    let (_executable, kernel) = load_kernel(&world, &add_kernel_elf("k"), "k");
    let representation = world.session.lift(&kernel).expect("Always valid");

    let error = world
        .session
        .instrument(&representation, |task| {
            let target = task
                .representation()
                .records()
                .find(|(_, record)| record.inst.opcode == Opcode::SAddU32)
                .map(|(inst_ref, _)| inst_ref.clone())
                .expect("The add instruction was lifted");
            task.insert_hook_before(&target, 0xDEAD_BEEF, vec![])
        })
        .expect_err("Must fail");
    assert!(error.to_string().contains("names no registered hook"));
}
