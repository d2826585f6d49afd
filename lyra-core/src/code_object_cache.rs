//!
//! The code-object cache.
//!
//! Snapshots the raw ELF bytes and a symbol index of every code object the
//! runtime loads, and invalidates both when the owning executable is
//! destroyed. The load callback is on the application's critical path, so
//! indexing stays limited to ELF parsing and symbol classification.
//!

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;

use lyra_backend::KernelMetadata;
use lyra_backend::metadata::parse_metadata_note;
use lyra_runtime::ApiTable;
use lyra_runtime::ExecutableHandle;
use lyra_runtime::LoadedCodeObjectHandle;
use lyra_runtime::RuntimeEventObserver;
use lyra_utils::StateLock;

use crate::code_object::LoadedCodeObject;
use crate::error::Error;
use crate::error::Result;
use crate::symbol::ExternalSymbol;
use crate::symbol::KernelSymbol;
use crate::symbol::Symbol;
use crate::symbol::SymbolBase;
use crate::symbol::SymbolKind;

/// The metadata note section name.
const METADATA_SECTION: &str = ".note.lyra";

#[derive(Debug)]
struct CachedCodeObject {
    info: LoadedCodeObject,
    storage: Arc<Vec<u8>>,
    symbols: Vec<Symbol>,
    by_name: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<u64, CachedCodeObject>,
    by_executable: BTreeMap<u64, Vec<u64>>,
}

///
/// The code-object cache.
///
pub struct CodeObjectCache {
    api: ApiTable,
    state: Mutex<CacheState>,
}

impl CodeObjectCache {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(api: ApiTable) -> Self {
        Self {
            api,
            state: Mutex::new(CacheState::default()),
        }
    }

    ///
    /// Whether a code object is still cached.
    ///
    pub fn is_cached(&self, lco: LoadedCodeObjectHandle) -> bool {
        self.state.acquire().entries.contains_key(&lco.0)
    }

    ///
    /// The private copy of a code object's ELF bytes.
    ///
    pub fn code_object(&self, lco: LoadedCodeObjectHandle) -> Result<Arc<Vec<u8>>> {
        self.with_entry(lco, |entry| entry.storage.clone())
    }

    ///
    /// The captured loader view of a code object.
    ///
    pub fn code_object_info(&self, lco: LoadedCodeObjectHandle) -> Result<LoadedCodeObject> {
        self.with_entry(lco, |entry| entry.info.clone())
    }

    ///
    /// Parses the cached ELF and hands the parsed file to `read`.
    ///
    pub fn with_object_file<T>(
        &self,
        lco: LoadedCodeObjectHandle,
        read: impl FnOnce(&object::File<'_>) -> Result<T>,
    ) -> Result<T> {
        let storage = self.code_object(lco)?;
        let file = object::File::parse(storage.as_slice())
            .map_err(|error| Error::lift(format!("cached ELF is unreadable: {error}")))?;
        read(&file)
    }

    ///
    /// The owned symbol records of a code object, optionally restricted to
    /// one kind.
    ///
    pub fn symbols(
        &self,
        lco: LoadedCodeObjectHandle,
        kind: Option<SymbolKind>,
    ) -> Result<Vec<Symbol>> {
        self.with_entry(lco, |entry| {
            entry
                .symbols
                .iter()
                .filter(|symbol| kind.map(|kind| symbol.kind() == kind).unwrap_or(true))
                .cloned()
                .collect()
        })
    }

    ///
    /// A symbol by name.
    ///
    pub fn symbol_by_name(&self, lco: LoadedCodeObjectHandle, name: &str) -> Result<Symbol> {
        self.with_entry(lco, |entry| {
            entry
                .by_name
                .get(name)
                .map(|index| entry.symbols[*index].clone())
        })?
        .ok_or_else(|| Error::cache_miss(format!("symbol `{name}` in {lco}")))
    }

    ///
    /// The function symbol whose loaded range contains a device address.
    ///
    pub fn symbol_containing_address(&self, address: u64) -> Result<Symbol> {
        let state = self.state.acquire();
        for entry in state.entries.values() {
            for symbol in entry.symbols.iter() {
                if !symbol.is_function() {
                    continue;
                }
                let base = symbol.base();
                if address >= base.address && address < base.address + base.size {
                    return Ok(symbol.clone());
                }
            }
        }
        Err(Error::cache_miss(format!(
            "no cached function covers address {address:#x}"
        )))
    }

    ///
    /// The symbol behind a runtime-visible symbol handle.
    ///
    pub fn symbol_by_runtime_handle(
        &self,
        handle: lyra_runtime::ExecutableSymbolHandle,
    ) -> Result<Symbol> {
        let state = self.state.acquire();
        for entry in state.entries.values() {
            for symbol in entry.symbols.iter() {
                if symbol.base().runtime_handle == Some(handle) {
                    return Ok(symbol.clone());
                }
            }
        }
        Err(Error::cache_miss(format!(
            "no cached symbol behind runtime handle {:#x}",
            handle.0
        )))
    }

    ///
    /// The kernel whose descriptor sits at a device address.
    ///
    pub fn kernel_by_descriptor_address(&self, address: u64) -> Result<Symbol> {
        let state = self.state.acquire();
        for entry in state.entries.values() {
            for symbol in entry.symbols.iter() {
                if let Symbol::Kernel(kernel) = symbol {
                    if kernel.descriptor_address == address {
                        return Ok(symbol.clone());
                    }
                }
            }
        }
        Err(Error::cache_miss(format!(
            "no cached kernel descriptor at {address:#x}"
        )))
    }

    ///
    /// The cached code objects of an executable.
    ///
    pub fn executable_code_objects(
        &self,
        executable: ExecutableHandle,
    ) -> Vec<LoadedCodeObjectHandle> {
        self.state
            .acquire()
            .by_executable
            .get(&executable.0)
            .map(|handles| handles.iter().map(|h| LoadedCodeObjectHandle(*h)).collect())
            .unwrap_or_default()
    }

    fn with_entry<T>(
        &self,
        lco: LoadedCodeObjectHandle,
        read: impl FnOnce(&CachedCodeObject) -> T,
    ) -> Result<T> {
        let state = self.state.acquire();
        state
            .entries
            .get(&lco.0)
            .map(read)
            .ok_or_else(|| Error::cache_miss(format!("{lco} is not cached")))
    }

    ///
    /// Captures and indexes a freshly loaded code object.
    ///
    fn capture(&self, handle: LoadedCodeObjectHandle) -> Result<()> {
        let info = LoadedCodeObject::capture(&self.api, handle)?;
        let storage = Arc::new(
            self.api
                .loader
                .code_object_storage(handle)
                .map_err(Error::runtime)?,
        );
        let symbols = index_symbols(&self.api, &info, storage.as_slice())?;
        let by_name = symbols
            .iter()
            .enumerate()
            .map(|(index, symbol)| (symbol.name().to_owned(), index))
            .collect();

        let mut state = self.state.acquire();
        state
            .by_executable
            .entry(info.executable.0)
            .or_default()
            .push(handle.0);
        state.entries.insert(
            handle.0,
            CachedCodeObject {
                info,
                storage,
                symbols,
                by_name,
            },
        );
        Ok(())
    }
}

impl RuntimeEventObserver for CodeObjectCache {
    fn code_object_loaded(&self, lco: LoadedCodeObjectHandle) {
        if let Err(error) = self.capture(lco) {
            log::warn!("failed to cache {lco}: {error}");
        }
    }

    fn executable_destroyed(&self, executable: ExecutableHandle) {
        let mut state = self.state.acquire();
        if let Some(handles) = state.by_executable.remove(&executable.0) {
            for handle in handles {
                state.entries.remove(&handle);
            }
            log::debug!("cache invalidated for {executable}");
        }
    }
}

///
/// Walks the ELF symbol tables and classifies every symbol.
///
fn index_symbols(
    api: &ApiTable,
    info: &LoadedCodeObject,
    storage: &[u8],
) -> Result<Vec<Symbol>> {
    let file = object::File::parse(storage)
        .map_err(|error| Error::lift(format!("code object is unreadable: {error}")))?;

    let metadata: BTreeMap<String, KernelMetadata> = file
        .section_by_name(METADATA_SECTION)
        .and_then(|section| section.data().ok().map(|data| data.to_vec()))
        .map(|data| parse_metadata_note(data.as_slice()))
        .transpose()
        .map_err(|error| Error::lift(format!("kernel metadata: {error}")))?
        .unwrap_or_default()
        .into_iter()
        .map(|metadata| (metadata.symbol.clone(), metadata))
        .collect();

    // Descriptor symbols are folded into their kernels, not listed.
    let mut descriptor_addresses: BTreeMap<String, u64> = BTreeMap::new();
    let mut bases: Vec<(SymbolBase, object::SectionKind)> = Vec::new();
    let mut externals: Vec<SymbolBase> = Vec::new();

    for symbol in file.symbols() {
        let Ok(name) = symbol.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let Some(section_index) = symbol.section_index() else {
            if symbol.is_undefined() {
                let address = api
                    .loader
                    .symbol_device_address(info.executable, name)
                    .unwrap_or(0);
                externals.push(SymbolBase {
                    lco: info.handle,
                    name: name.to_owned(),
                    address,
                    size: 0,
                    is_global: true,
                    runtime_handle: None,
                });
            }
            continue;
        };
        let Some(section_base) = info.section_base(section_index.0) else {
            continue;
        };
        let address = section_base + symbol.address();

        if let Some(kernel_name) = name.strip_suffix(".kd") {
            descriptor_addresses.insert(kernel_name.to_owned(), address);
            continue;
        }

        let section_kind = file
            .section_by_index(section_index)
            .map(|section| section.kind())
            .unwrap_or(object::SectionKind::Unknown);
        bases.push((
            SymbolBase {
                lco: info.handle,
                name: name.to_owned(),
                address,
                size: symbol.size(),
                is_global: symbol.is_global(),
                runtime_handle: None,
            },
            section_kind,
        ));
    }

    let mut symbols = Vec::with_capacity(bases.len() + externals.len());
    for (mut base, section_kind) in bases {
        if base.is_global {
            base.runtime_handle = api.loader.symbol_handle(info.executable, &base.name).ok();
        }
        let symbol = match section_kind {
            object::SectionKind::Text => match metadata.get(base.name.as_str()) {
                Some(metadata) => {
                    let descriptor_address = descriptor_addresses
                        .get(base.name.as_str())
                        .copied()
                        .ok_or_else(|| {
                            Error::lift(format!(
                                "kernel `{}` has metadata but no descriptor symbol",
                                base.name
                            ))
                        })?;
                    Symbol::Kernel(KernelSymbol {
                        base,
                        descriptor_address,
                        metadata: metadata.clone(),
                    })
                }
                None => Symbol::DeviceFunction(base),
            },
            _ => Symbol::Variable(base),
        };
        symbols.push(symbol);
    }
    for base in externals {
        symbols.push(Symbol::External(ExternalSymbol { base }));
    }
    Ok(symbols)
}
