//!
//! The code lifter.
//!
//! Disassembles loaded machine code into instruction records and
//! reconstructs machine IR from them, one module per code object, one
//! function per kernel or device function. Both caches live behind one
//! mutex; every public entry point takes the lock once at the boundary and
//! the internal helpers stay lock-free.
//!

pub mod branch;
pub mod lift;
pub mod record;
pub mod representation;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

use itertools::Itertools as _;
use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;

use lyra_backend::ir;
use lyra_backend::mc::decode_all;
use lyra_backend::mir::MachineModule;
use lyra_runtime::ApiTable;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::LoadedCodeObjectHandle;
use lyra_runtime::RuntimeEventObserver;
use lyra_utils::StateLock;

use crate::code_object::LoadedCodeObject;
use crate::code_object_cache::CodeObjectCache;
use crate::error::Error;
use crate::error::Result;
use crate::symbol::Symbol;
use crate::symbol::SymbolKind;
use crate::target_manager::TargetManager;

pub use self::lift::RelocationRecord;
pub use self::record::InstructionRecord;
pub use self::representation::InstRef;
pub use self::representation::LiftedRepresentation;

type SymbolKey = (u64, String);

#[derive(Default)]
struct LifterState {
    /// Function symbol to its ordered record list.
    disassembly: BTreeMap<SymbolKey, Arc<Vec<InstructionRecord>>>,
    /// Kernel symbol to its lifted representation.
    lifts: BTreeMap<SymbolKey, Arc<LiftedRepresentation>>,
    /// Per code object: the addresses some direct branch in the same code
    /// object targets.
    branch_targets: BTreeMap<u64, BTreeSet<u64>>,
    /// Per code object: loaded address to resolved relocation.
    relocations: BTreeMap<u64, BTreeMap<u64, RelocationRecord>>,
    /// Code object to owning executable, for invalidation.
    lco_executables: BTreeMap<u64, u64>,
}

///
/// The code lifter.
///
pub struct CodeLifter {
    api: ApiTable,
    cache: Arc<CodeObjectCache>,
    targets: Arc<TargetManager>,
    state: Mutex<LifterState>,
}

impl CodeLifter {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(api: ApiTable, cache: Arc<CodeObjectCache>, targets: Arc<TargetManager>) -> Self {
        Self {
            api,
            cache,
            targets,
            state: Mutex::new(LifterState::default()),
        }
    }

    ///
    /// Disassembles a kernel or device function into its record list.
    ///
    /// Results are cached per symbol until the owning executable is
    /// destroyed.
    ///
    pub fn disassemble(&self, symbol: &Symbol) -> Result<Arc<Vec<InstructionRecord>>> {
        let mut state = self.state.acquire();
        self.disassemble_locked(&mut state, symbol)
    }

    ///
    /// The direct-branch target set of a code object, as populated by the
    /// disassembly done so far.
    ///
    pub fn branch_targets(&self, lco: LoadedCodeObjectHandle) -> BTreeSet<u64> {
        self.state
            .acquire()
            .branch_targets
            .get(&lco.0)
            .cloned()
            .unwrap_or_default()
    }

    ///
    /// Lifts a kernel into its cached representation.
    ///
    /// A second caller for the same kernel observes the same
    /// representation; entries drop when the executable is destroyed.
    ///
    pub fn lift(&self, kernel: &Symbol) -> Result<Arc<LiftedRepresentation>> {
        let kernel_symbol = kernel
            .as_kernel()
            .ok_or_else(|| Error::lift(format!("`{}` is not a kernel", kernel.name())))?;

        let mut state = self.state.acquire();
        let key = (kernel.lco().0, kernel.name().to_owned());
        if let Some(representation) = state.lifts.get(&key) {
            return Ok(representation.clone());
        }

        let info = self.cache.code_object_info(kernel.lco())?;
        let target_machine = self.targets.create_target_machine(&info.isa)?;

        // Conservative reachability: every device function of the code
        // object is lifted alongside the kernel.
        let mut function_symbols = vec![kernel.clone()];
        function_symbols.extend(
            self.cache
                .symbols(kernel.lco(), Some(SymbolKind::DeviceFunction))?,
        );

        let mut ir_module = ir::Module::new(
            format!("lifted.{}", kernel.name()),
            String::new(),
        );
        let mut variables = BTreeMap::new();
        for symbol in self
            .cache
            .symbols(kernel.lco(), Some(SymbolKind::Variable))?
            .into_iter()
            .chain(self.cache.symbols(kernel.lco(), Some(SymbolKind::External))?)
        {
            let base = symbol.base();
            let is_external = symbol.kind() == SymbolKind::External;
            let initializer = if is_external || base.size == 0 {
                None
            } else {
                self.api
                    .loader
                    .host_view(base.address, base.size)
                    .ok()
            };
            ir_module.add_global(ir::Global {
                name: base.name.clone(),
                size: base.size.max(4),
                align: 4,
                initializer,
                is_external,
            });
            variables.insert(base.name.clone(), symbol);
        }

        let mut machine_module =
            MachineModule::new(format!("lifted.{}", kernel.name()), info.isa.clone());
        let mut functions = BTreeMap::new();
        let mut mi_to_record = BTreeMap::new();

        for symbol in function_symbols {
            let records = self.disassemble_locked(&mut state, &symbol)?;
            let branch_targets = state
                .branch_targets
                .get(&kernel.lco().0)
                .cloned()
                .unwrap_or_default();
            let relocations = state
                .relocations
                .get(&kernel.lco().0)
                .cloned()
                .unwrap_or_default();
            let (function, mapping) = lift::lift_function(
                symbol.name(),
                symbol.kind() == SymbolKind::Kernel,
                records.as_slice(),
                &branch_targets,
                &relocations,
            )?;
            for (inst_id, record_index) in mapping {
                mi_to_record.insert(
                    InstRef {
                        function: symbol.name().to_owned(),
                        inst: inst_id,
                    },
                    records[record_index].clone(),
                );
            }
            machine_module.add_function(function);
            functions.insert(symbol.name().to_owned(), symbol);
        }

        let representation = Arc::new(LiftedRepresentation::new(
            Symbol::Kernel(kernel_symbol.clone()),
            info.agent,
            info.isa.clone(),
            target_machine,
            ir_module,
            machine_module,
            functions,
            variables,
            mi_to_record,
        ));
        state.lco_executables.insert(kernel.lco().0, info.executable.0);
        state.lifts.insert(key, representation.clone());
        Ok(representation)
    }

    ///
    /// Deep-copies a representation so instrumentation can mutate it
    /// without poisoning the cached original.
    ///
    /// Identifiers are stable across the copy, so the instruction↔record
    /// map is re-established on the clone; it stays valid until the first
    /// transformation pass rewrites instructions.
    ///
    pub fn clone_representation(
        &self,
        representation: &LiftedRepresentation,
    ) -> LiftedRepresentation {
        representation.clone()
    }

    fn disassemble_locked(
        &self,
        state: &mut LifterState,
        symbol: &Symbol,
    ) -> Result<Arc<Vec<InstructionRecord>>> {
        if !symbol.is_function() {
            return Err(Error::lift(format!(
                "`{}` is a {:?}, not a function",
                symbol.name(),
                symbol.kind()
            )));
        }
        let key = (symbol.lco().0, symbol.name().to_owned());
        if let Some(records) = state.disassembly.get(&key) {
            return Ok(records.clone());
        }

        let info = self.cache.code_object_info(symbol.lco())?;
        // The ISA must translate before any decoding is attempted.
        self.targets.description(&info.isa)?;

        let base = symbol.base();
        let bytes = self
            .api
            .loader
            .host_view(base.address, base.size)
            .map_err(Error::runtime)?;
        let decoded =
            decode_all(bytes.as_slice()).map_err(|error| Error::decode(&base.name, error))?;

        let mut records = Vec::with_capacity(decoded.len());
        let targets = state.branch_targets.entry(symbol.lco().0).or_default();
        for decoded_inst in decoded {
            let address = base.address + decoded_inst.offset as u64;
            if let Some(target) = branch::evaluate_branch(
                &decoded_inst.inst,
                address,
                decoded_inst.size as u64,
            ) {
                targets.insert(target);
            }
            records.push(InstructionRecord {
                inst: decoded_inst.inst,
                address,
                size: decoded_inst.size,
                symbol: base.name.clone(),
                lco: symbol.lco(),
            });
        }

        // Record sizes must tile the symbol without gaps.
        if let Some((before, after)) = records
            .iter()
            .tuple_windows()
            .find(|(before, after)| before.address + before.size as u64 != after.address)
        {
            return Err(Error::lift(format!(
                "records do not tile `{}`: {before} is not adjacent to {after}",
                base.name
            )));
        }

        self.scan_relocations_locked(state, &info)?;

        let records = Arc::new(records);
        state.lco_executables.insert(symbol.lco().0, info.executable.0);
        state.disassembly.insert(key, records.clone());
        Ok(records)
    }

    ///
    /// Scans every relocation of a code object once, mapping loaded
    /// addresses to referenced symbols.
    ///
    fn scan_relocations_locked(
        &self,
        state: &mut LifterState,
        info: &LoadedCodeObject,
    ) -> Result<()> {
        if state.relocations.contains_key(&info.handle.0) {
            return Ok(());
        }

        let map = self.cache.with_object_file(info.handle, |file| {
            let mut map = BTreeMap::new();
            for section in file.sections() {
                let Some(section_base) = info.section_base(section.index().0) else {
                    continue;
                };
                for (offset, relocation) in section.relocations() {
                    let object::RelocationTarget::Symbol(symbol_index) = relocation.target()
                    else {
                        continue;
                    };
                    let symbol_name = file
                        .symbol_by_index(symbol_index)
                        .and_then(|symbol| symbol.name())
                        .map_err(|error| {
                            Error::lift(format!("relocation names no symbol: {error}"))
                        })?
                        .to_owned();
                    let r_type = match relocation.flags() {
                        object::RelocationFlags::Elf { r_type } => r_type,
                        _ => 0,
                    };
                    map.insert(
                        section_base + offset,
                        RelocationRecord {
                            symbol_name,
                            r_type,
                        },
                    );
                }
            }
            Ok(map)
        })?;

        state.relocations.insert(info.handle.0, map);
        Ok(())
    }
}

impl RuntimeEventObserver for CodeLifter {
    fn executable_destroyed(&self, executable: ExecutableHandle) {
        let mut state = self.state.acquire();
        let dead: BTreeSet<u64> = state
            .lco_executables
            .iter()
            .filter(|(_, exec)| **exec == executable.0)
            .map(|(lco, _)| *lco)
            .collect();
        if dead.is_empty() {
            return;
        }
        state.disassembly.retain(|(lco, _), _| !dead.contains(lco));
        state.lifts.retain(|(lco, _), _| !dead.contains(lco));
        state.branch_targets.retain(|lco, _| !dead.contains(lco));
        state.relocations.retain(|lco, _| !dead.contains(lco));
        state.lco_executables.retain(|lco, _| !dead.contains(lco));
        log::debug!("lifter caches invalidated for {executable}");
    }
}
