//!
//! Shared fixtures: an in-process runtime, assembled code objects, and a
//! tool payload.
//!

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use lyra_backend::KernelMetadata;
use lyra_backend::Register;
use lyra_backend::codegen::EmitGlobal;
use lyra_backend::codegen::EmitInput;
use lyra_backend::codegen::emit_payload_object;
use lyra_backend::codegen::emit_relocatable;
use lyra_backend::ir;
use lyra_backend::mir::MachineFunction;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineModule;
use lyra_backend::mir::MachineOperand;
use lyra_backend::target::opcode::Opcode;
use lyra_core::Session;
use lyra_core::Symbol;
use lyra_core::SymbolKind;
use lyra_runtime::Agent;
use lyra_runtime::CoreApi as _;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::HostRuntime;
use lyra_runtime::LoaderApi as _;
use lyra_utils::Isa;
use lyra_utils::mangling::mangle_hook_handle;

/// The counter global the test hook bumps.
pub const COUNTER_GLOBAL: &str = "lyra_test_counter";

/// The test hook's name.
pub const HOOK_NAME: &str = "record_event";

pub struct TestWorld {
    pub runtime: Arc<HostRuntime>,
    pub session: Arc<Session>,
    pub agent: Agent,
}

pub fn world() -> TestWorld {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Arc::new(HostRuntime::new());
    let agent = runtime.add_agent(Isa::from_processor("gfx908"));
    let session = Session::new(runtime.api_table(), runtime.events());
    TestWorld {
        runtime,
        session,
        agent,
    }
}

fn kernel_metadata(name: &str) -> KernelMetadata {
    KernelMetadata {
        symbol: name.to_owned(),
        kernarg_segment_size: 16,
        kernarg_segment_align: 8,
        group_segment_fixed_size: 0,
        private_segment_fixed_size: 0,
        sgpr_count: 16,
        vgpr_count: 4,
        user_sgpr_count: 2,
        args: Vec::new(),
    }
}

fn emit_kernel(name: &str, build: impl FnOnce(&mut MachineFunction)) -> Vec<u8> {
    let mut function = MachineFunction::new(name.to_owned(), true);
    build(&mut function);
    let mut module = MachineModule::new("fixture".to_owned(), Isa::from_processor("gfx908"));
    module.add_function(function);
    emit_relocatable(&EmitInput {
        module: &module,
        kernels: &[kernel_metadata(name)],
        globals: &[EmitGlobal {
            name: "fixture_data".to_owned(),
            size: 8,
            align: 8,
            initializer: Some(vec![0u8; 8]),
            is_external: false,
        }],
    })
    .expect("Fixture emission cannot fail")
}

///
/// `s_mov_b32 s0, 0x10; s_branch .L; .L: s_endpgm`, two basic blocks.
///
pub fn branchy_kernel_elf(name: &str) -> Vec<u8> {
    emit_kernel(name, |function| {
        let entry = function.create_block();
        let exit = function.create_block();
        function.push_inst(
            entry,
            MachineInst::original(
                Opcode::SMovB32,
                vec![
                    MachineOperand::def_phys(Register::Sgpr(0)),
                    MachineOperand::Immediate(0x10),
                ],
            ),
        );
        function.push_inst(
            entry,
            MachineInst::original(Opcode::SBranch, vec![MachineOperand::Block(exit)]),
        );
        function.push_inst(
            exit,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
        function.add_successor(entry, exit);
    })
}

///
/// `s_add_u32 s0, s0, 1; s_endpgm`, a single block.
///
pub fn add_kernel_elf(name: &str) -> Vec<u8> {
    emit_kernel(name, |function| {
        let entry = function.create_block();
        function.push_inst(
            entry,
            MachineInst::original(
                Opcode::SAddU32,
                vec![
                    MachineOperand::def_phys(Register::Sgpr(0)),
                    MachineOperand::use_phys(Register::Sgpr(0)),
                    MachineOperand::Immediate(1),
                ],
            ),
        );
        function.push_inst(
            entry,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
    })
}

///
/// Loads a kernel ELF into a fresh frozen executable and returns its
/// kernel symbol.
///
pub fn load_kernel(world: &TestWorld, elf: &[u8], name: &str) -> (ExecutableHandle, Symbol) {
    let executable = world
        .runtime
        .create_executable(world.agent)
        .expect("Executable creation cannot fail");
    world
        .runtime
        .load_code_object(executable, world.agent, elf)
        .expect("Loading cannot fail");
    world
        .runtime
        .freeze_executable(executable)
        .expect("Freezing cannot fail");

    let lco = world
        .session
        .cache()
        .executable_code_objects(executable)
        .into_iter()
        .next()
        .expect("The code object was cached on load");
    let kernel = world
        .session
        .cache()
        .symbol_by_name(lco, name)
        .expect("The kernel symbol is indexed");
    assert_eq!(kernel.kind(), SymbolKind::Kernel);
    (executable, kernel)
}

///
/// The tool payload: one hook atomically bumping a counter global by its
/// argument.
///
pub fn tool_payload_module() -> ir::Module {
    let mut module = ir::Module::new("test_tool".to_owned(), "lyra-test-tool-cu".to_owned());
    module.add_global(ir::Global {
        name: COUNTER_GLOBAL.to_owned(),
        size: 4,
        align: 4,
        initializer: None,
        is_external: false,
    });
    module.add_function(ir::Function {
        name: HOOK_NAME.to_owned(),
        param_count: 1,
        is_hook: true,
        body: vec![
            ir::Inst::AtomicAdd {
                address: ir::Value::GlobalAddress(COUNTER_GLOBAL.to_owned()),
                value: ir::Value::Argument(0),
            },
            ir::Inst::Return { value: None },
        ],
    });
    module
}

///
/// Loads a tool payload and registers a shadow pointer per hook; returns
/// the executable and the hook-name to shadow-pointer map.
///
pub fn load_tool_with(
    world: &TestWorld,
    payload: &ir::Module,
) -> (ExecutableHandle, BTreeMap<String, u64>) {
    let elf = emit_payload_object(payload).expect("Payload emission cannot fail");

    let executable = world
        .runtime
        .create_executable(world.agent)
        .expect("Executable creation cannot fail");
    world
        .runtime
        .load_code_object(executable, world.agent, elf.as_slice())
        .expect("Loading cannot fail");
    world
        .runtime
        .freeze_executable(executable)
        .expect("Freezing cannot fail");
    assert!(world.session.modules().is_registered());

    let mut handles = BTreeMap::new();
    for function in payload.functions.values().filter(|function| function.is_hook) {
        let shadow_symbol = mangle_hook_handle(function.name.as_str());
        let shadow_pointer = world
            .runtime
            .symbol_device_address(executable, shadow_symbol.as_str())
            .expect("The shadow symbol is defined");
        world
            .runtime
            .register_function(shadow_pointer, shadow_symbol.as_str());
        handles.insert(function.name.clone(), shadow_pointer);
    }
    (executable, handles)
}

///
/// Loads the default payload; returns the executable and the counter
/// hook's shadow pointer.
///
pub fn load_tool(world: &TestWorld) -> (ExecutableHandle, u64) {
    let (executable, handles) = load_tool_with(world, &tool_payload_module());
    let shadow_pointer = handles[HOOK_NAME];
    (executable, shadow_pointer)
}

///
/// Externs for manual instrumented loads: the fixture global plus the
/// tool counter.
///
pub fn default_externs(world: &TestWorld) -> BTreeMap<String, u64> {
    world.session.modules().agent_globals(world.agent)
}
