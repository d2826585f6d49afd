//!
//! The symbol model.
//!
//! Typed handles over the ELF symbols of a loaded code object. The closed
//! variant set is {Kernel, DeviceFunction, Variable, External}; the shared
//! base record carries what every variant has, the arms carry the rest.
//!

use lyra_backend::KernelMetadata;
use lyra_runtime::ExecutableSymbolHandle;
use lyra_runtime::LoadedCodeObjectHandle;

///
/// The symbol kind discriminant.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymbolKind {
    /// A kernel entry point.
    Kernel,
    /// A non-kernel device function.
    DeviceFunction,
    /// A variable defined in the code object.
    Variable,
    /// A symbol resolved against a definition outside this code object.
    External,
}

///
/// The shared part of every symbol.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolBase {
    /// The owning code object.
    pub lco: LoadedCodeObjectHandle,
    /// The ELF symbol name.
    pub name: String,
    /// The loaded device address.
    pub address: u64,
    /// The symbol size in bytes.
    pub size: u64,
    /// Whether the binding is global; local symbols have no runtime
    /// handle.
    pub is_global: bool,
    /// The runtime-visible handle, present only for global symbols of
    /// frozen executables.
    pub runtime_handle: Option<ExecutableSymbolHandle>,
}

///
/// A kernel symbol: the code symbol plus its descriptor and metadata.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    /// The shared base over the code symbol.
    pub base: SymbolBase,
    /// The kernel-descriptor symbol's device address.
    pub descriptor_address: u64,
    /// The parsed kernel metadata.
    pub metadata: KernelMetadata,
}

///
/// An external symbol: unresolved in its own code object, defined in
/// another one.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSymbol {
    /// The shared base; its address is the cross-code-object definition.
    pub base: SymbolBase,
}

///
/// A typed symbol record.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// A kernel entry point.
    Kernel(KernelSymbol),
    /// A non-kernel device function.
    DeviceFunction(SymbolBase),
    /// A variable defined in the code object.
    Variable(SymbolBase),
    /// A symbol defined in another code object.
    External(ExternalSymbol),
}

impl Symbol {
    ///
    /// The shared base record.
    ///
    pub fn base(&self) -> &SymbolBase {
        match self {
            Symbol::Kernel(kernel) => &kernel.base,
            Symbol::DeviceFunction(base) | Symbol::Variable(base) => base,
            Symbol::External(external) => &external.base,
        }
    }

    ///
    /// The symbol kind.
    ///
    pub fn kind(&self) -> SymbolKind {
        match self {
            Symbol::Kernel(_) => SymbolKind::Kernel,
            Symbol::DeviceFunction(_) => SymbolKind::DeviceFunction,
            Symbol::Variable(_) => SymbolKind::Variable,
            Symbol::External(_) => SymbolKind::External,
        }
    }

    ///
    /// The symbol name.
    ///
    pub fn name(&self) -> &str {
        self.base().name.as_str()
    }

    ///
    /// The owning code object.
    ///
    pub fn lco(&self) -> LoadedCodeObjectHandle {
        self.base().lco
    }

    ///
    /// The loaded device address.
    ///
    pub fn address(&self) -> u64 {
        self.base().address
    }

    ///
    /// Whether the symbol names code that can be disassembled.
    ///
    pub fn is_function(&self) -> bool {
        matches!(self, Symbol::Kernel(_) | Symbol::DeviceFunction(_))
    }

    ///
    /// Downcasts to the kernel arm.
    ///
    pub fn as_kernel(&self) -> Option<&KernelSymbol> {
        match self {
            Symbol::Kernel(kernel) => Some(kernel),
            _ => None,
        }
    }

    ///
    /// Applies the matching visitor arm.
    ///
    pub fn visit<T>(
        &self,
        on_kernel: impl FnOnce(&KernelSymbol) -> T,
        on_device_function: impl FnOnce(&SymbolBase) -> T,
        on_variable: impl FnOnce(&SymbolBase) -> T,
        on_external: impl FnOnce(&ExternalSymbol) -> T,
    ) -> T {
        match self {
            Symbol::Kernel(kernel) => on_kernel(kernel),
            Symbol::DeviceFunction(base) => on_device_function(base),
            Symbol::Variable(base) => on_variable(base),
            Symbol::External(external) => on_external(external),
        }
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} `{}` @ {:#x} ({})",
            self.kind(),
            self.name(),
            self.address(),
            self.lco()
        )
    }
}
