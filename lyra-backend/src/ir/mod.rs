//!
//! The hook IR.
//!
//! The compact intermediate representation tool payloads are shipped in.
//! Hook bodies arrive precompiled in this form, serialized as a CBOR
//! payload, and are spliced into lifted machine IR by the code generator.
//!

pub mod passes;
pub mod payload;

use indexmap::IndexMap;

use crate::target::Register;

///
/// A value operand inside a function body.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// An integer constant.
    Constant(i64),
    /// The caller-supplied argument at an index.
    Argument(u32),
    /// The result of the body instruction at an index.
    Result(u32),
    /// The absolute address of a global, resolved at code generation.
    GlobalAddress(String),
    /// A physical-register designator, meaningful only as an intrinsic
    /// argument.
    PhysicalRegister(Register),
}

///
/// A binary integer operation.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Mul,
}

///
/// A body instruction.
///
/// Bodies are flat ordered lists; `Value::Result(i)` refers to the `i`-th
/// instruction of the same body.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Inst {
    /// A direct call. Callees defined in the module are inlined by the
    /// optimization pipeline; the rest are intrinsic calls, resolved
    /// through the intrinsic registry at lowering.
    Call {
        /// The callee name.
        callee: String,
        /// The actual arguments.
        args: Vec<Value>,
    },
    /// A binary integer operation on 32-bit scalars.
    Binary {
        /// The operation.
        op: BinaryOp,
        /// The left operand.
        lhs: Value,
        /// The right operand.
        rhs: Value,
    },
    /// A 32-bit scalar load.
    Load {
        /// The 64-bit address.
        address: Value,
    },
    /// A 32-bit scalar store.
    Store {
        /// The 64-bit address.
        address: Value,
        /// The stored value.
        value: Value,
    },
    /// A 32-bit scalar atomic add.
    AtomicAdd {
        /// The 64-bit address.
        address: Value,
        /// The addend.
        value: Value,
    },
    /// An inline-asm placeholder created by IR-level intrinsic lowering.
    /// Never present in tool payloads; survives instruction selection
    /// untouched and is resolved through its side-table index afterwards.
    InlineAsm {
        /// The index into the lowering side table.
        index: u32,
        /// The value inputs, matched against the bundle's constraints.
        inputs: Vec<Value>,
        /// The register class of the result, absent for void placeholders.
        result_class: Option<crate::target::RegisterClass>,
    },
    /// Returns from the function.
    Return {
        /// The returned value, if any.
        value: Option<Value>,
    },
}

impl Inst {
    ///
    /// Whether the instruction has an effect besides its result.
    ///
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Inst::Call { .. }
                | Inst::Store { .. }
                | Inst::AtomicAdd { .. }
                | Inst::InlineAsm { .. }
                | Inst::Return { .. }
        )
    }

    ///
    /// The value operands, in place.
    ///
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Inst::Call { args, .. } => args.iter().collect(),
            Inst::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Load { address } => vec![address],
            Inst::Store { address, value } | Inst::AtomicAdd { address, value } => {
                vec![address, value]
            }
            Inst::InlineAsm { inputs, .. } => inputs.iter().collect(),
            Inst::Return { value } => value.iter().collect(),
        }
    }

    ///
    /// The value operands, mutably.
    ///
    pub fn values_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Inst::Call { args, .. } => args.iter_mut().collect(),
            Inst::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Store { address, value } | Inst::AtomicAdd { address, value } => {
                vec![address, value]
            }
            Inst::Load { address } => vec![address],
            Inst::InlineAsm { inputs, .. } => inputs.iter_mut().collect(),
            Inst::Return { value } => value.iter_mut().collect(),
        }
    }
}

///
/// A function of the hook IR.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Function {
    /// The function name.
    pub name: String,
    /// The number of parameters.
    pub param_count: u32,
    /// Whether the function carries the hook entry-point attribute.
    pub is_hook: bool,
    /// The body instructions.
    pub body: Vec<Inst>,
}

///
/// A global variable of the hook IR.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Global {
    /// The variable name.
    pub name: String,
    /// The size in bytes.
    pub size: u64,
    /// The alignment in bytes.
    pub align: u64,
    /// The initializer bytes; zero-initialized when absent.
    pub initializer: Option<Vec<u8>>,
    /// Whether the variable is defined outside the payload and resolved
    /// at load time.
    pub is_external: bool,
}

///
/// A hook IR module.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    /// The module name.
    pub name: String,
    /// The compile-unit identifier, used to recognize the payload across
    /// executable loads.
    pub compile_unit_id: String,
    /// The global variables.
    pub globals: IndexMap<String, Global>,
    /// The functions.
    pub functions: IndexMap<String, Function>,
}

impl Module {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(name: String, compile_unit_id: String) -> Self {
        Self {
            name,
            compile_unit_id,
            globals: IndexMap::new(),
            functions: IndexMap::new(),
        }
    }

    ///
    /// Adds a function.
    ///
    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.name.clone(), function);
    }

    ///
    /// Adds a global variable.
    ///
    pub fn add_global(&mut self, global: Global) {
        self.globals.insert(global.name.clone(), global);
    }

    ///
    /// Clones a function and its transitive module-defined callees into
    /// `target`, leaving intrinsic calls alone.
    ///
    /// Globals referenced by the cloned bodies are carried over as well.
    ///
    pub fn clone_function_into(&self, name: &str, target: &mut Module) -> bool {
        let Some(function) = self.functions.get(name) else {
            return false;
        };
        if target.functions.contains_key(name) {
            return true;
        }
        target.functions.insert(name.to_owned(), function.clone());

        for inst in function.body.iter() {
            if let Inst::Call { callee, .. } = inst {
                self.clone_function_into(callee.as_str(), target);
            }
            for value in inst.values() {
                if let Value::GlobalAddress(global_name) = value {
                    if let Some(global) = self.globals.get(global_name) {
                        if !target.globals.contains_key(global_name) {
                            target.globals.insert(global_name.clone(), global.clone());
                        }
                    }
                }
            }
        }
        true
    }
}
