//!
//! Disassembly and lifting end-to-end tests.
//!

mod common;

use std::sync::Arc;

use lyra_backend::mir::MachineOperand;
use lyra_backend::target::opcode::Opcode;
use lyra_core::InstRef;
use lyra_runtime::CoreApi as _;

use self::common::branchy_kernel_elf;
use self::common::load_kernel;
use self::common::world;

#[test]
fn disassembly_round_trip_size() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let records = world.session.disassemble(&kernel).expect("Always valid");
    assert_eq!(records.len(), 3);
    let total: u64 = records.iter().map(|record| record.size as u64).sum();
    assert_eq!(total, kernel.base().size);

    // Consecutive records tile the symbol exactly.
    for pair in records.windows(2) {
        assert_eq!(pair[0].address + pair[0].size as u64, pair[1].address);
    }
}

#[test]
fn branch_targets_stay_inside_the_code_object_and_start_records() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let records = world.session.disassemble(&kernel).expect("Always valid");
    let targets = world.session.lifter().branch_targets(kernel.lco());
    assert_eq!(targets.len(), 1);
    let info = world
        .session
        .cache()
        .code_object_info(kernel.lco())
        .expect("Always valid");
    for target in targets {
        assert!(info.contains_address(target));
        assert!(
            records.iter().any(|record| record.address == target),
            "target {target:#x} must start a record"
        );
    }
}

#[test]
fn lifting_splits_blocks_at_branch_targets() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let representation = world.session.lift(&kernel).expect("Always valid");
    let function = representation
        .machine_module()
        .function("k")
        .expect("Always exists");

    assert_eq!(function.layout().len(), 2);
    let entry = function.layout()[0];
    let exit = function.layout()[1];
    assert_eq!(function.block(entry).successors(), &[exit]);

    // The branch operand was re-targeted to the successor block.
    let branch = function
        .instructions()
        .find(|(_, inst)| inst.opcode == Opcode::SBranch)
        .expect("The branch was lifted");
    assert_eq!(branch.1.operands, vec![MachineOperand::Block(exit)]);
}

#[test]
fn every_lifted_instruction_has_a_record_preimage() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let representation = world.session.lift(&kernel).expect("Always valid");
    for function in representation.machine_module().functions() {
        for (inst_id, _) in function.instructions() {
            let inst_ref = InstRef {
                function: function.name().to_owned(),
                inst: inst_id,
            };
            assert!(
                representation.record_of(&inst_ref).is_some(),
                "{inst_ref:?} has no originating record"
            );
        }
    }
}

#[test]
fn concurrent_lifts_share_the_cached_representation() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let first = {
        let session = world.session.clone();
        let kernel = kernel.clone();
        std::thread::spawn(move || session.lift(&kernel).expect("Always valid"))
    };
    let second = {
        let session = world.session.clone();
        let kernel = kernel.clone();
        std::thread::spawn(move || session.lift(&kernel).expect("Always valid"))
    };
    let first = first.join().expect("No panic");
    let second = second.join().expect("No panic");
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn clones_are_independent_of_the_cached_original() {
    let world = world();
    let (_executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let original = world.session.lift(&kernel).expect("Always valid");
    let original_count = original
        .machine_module()
        .function("k")
        .expect("Always exists")
        .inst_count();

    let mut clone = world.session.lifter().clone_representation(&original);
    let function = clone.machine_module_mut().function_mut("k").expect("Always exists");
    let first = function
        .block(function.layout()[0])
        .insts()
        .first()
        .copied()
        .expect("The entry block is not empty");
    function.insert_before(
        first,
        lyra_backend::mir::MachineInst::new(
            Opcode::SNop,
            vec![MachineOperand::Immediate(0)],
        ),
    );

    let cached = world.session.lift(&kernel).expect("Always valid");
    assert!(Arc::ptr_eq(&original, &cached));
    assert_eq!(
        cached
            .machine_module()
            .function("k")
            .expect("Always exists")
            .inst_count(),
        original_count
    );
}

#[test]
fn destruction_invalidates_the_caches_but_not_borrowed_results() {
    let world = world();
    let (executable, kernel) = load_kernel(&world, &branchy_kernel_elf("k"), "k");

    let representation = world.session.lift(&kernel).expect("Always valid");
    let lco = kernel.lco();
    assert!(world.session.cache().is_cached(lco));

    world
        .runtime
        .destroy_executable(executable)
        .expect("Always valid");

    // The borrowed representation stays usable.
    assert!(representation.machine_module().function("k").is_some());
    assert_eq!(representation.kernel().name(), "k");

    // The caches observed the destruction.
    assert!(!world.session.cache().is_cached(lco));
    let error = world.session.lift(&kernel).expect_err("Must miss");
    assert!(error.is_cache_miss(), "{error}");
    let error = world.session.disassemble(&kernel).expect_err("Must miss");
    assert!(error.is_cache_miss(), "{error}");
}
