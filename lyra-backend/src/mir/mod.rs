//!
//! Machine IR containers.
//!
//! One step above machine code: opcodes and registers are concrete, but
//! instructions live in an arena with stable identifiers, so passes can
//! insert, replace and remove them without invalidating references held
//! elsewhere.
//!

use indexmap::IndexMap;

use lyra_utils::Isa;

use crate::target::Register;
use crate::target::RegisterClass;
use crate::target::opcode::Opcode;

///
/// A stable identifier of an instruction inside one machine function.
///
/// Identifiers survive insertions and removals; they are never reused within
/// a function's lifetime.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct InstId(u32);

///
/// A stable identifier of a basic block inside one machine function.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct BlockId(u32);

impl BlockId {
    ///
    /// The block's position in creation order.
    ///
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

///
/// A virtual register, minted per-function with a register class.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct VirtualRegister(u32);

impl std::fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

///
/// A register operand: physical or virtual.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OperandRegister {
    /// A physical register.
    Physical(Register),
    /// A virtual register.
    Virtual(VirtualRegister),
}

///
/// A machine-IR operand.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MachineOperand {
    /// A register operand.
    Register {
        /// The register.
        register: OperandRegister,
        /// Whether the operand is written by the instruction.
        is_def: bool,
    },
    /// An immediate value.
    Immediate(i64),
    /// A reference to a global symbol, resolved at emission via relocation.
    Global(String),
    /// A reference to a basic block of the same function.
    Block(BlockId),
    /// An index into the inline-asm lowering side table.
    AsmIndex(u32),
}

impl MachineOperand {
    ///
    /// A register use.
    ///
    pub fn use_of(register: OperandRegister) -> Self {
        Self::Register {
            register,
            is_def: false,
        }
    }

    ///
    /// A register def.
    ///
    pub fn def_of(register: OperandRegister) -> Self {
        Self::Register {
            register,
            is_def: true,
        }
    }

    ///
    /// A physical-register use.
    ///
    pub fn use_phys(register: Register) -> Self {
        Self::use_of(OperandRegister::Physical(register))
    }

    ///
    /// A physical-register def.
    ///
    pub fn def_phys(register: Register) -> Self {
        Self::def_of(OperandRegister::Physical(register))
    }

    ///
    /// A virtual-register use.
    ///
    pub fn use_virt(register: VirtualRegister) -> Self {
        Self::use_of(OperandRegister::Virtual(register))
    }

    ///
    /// A virtual-register def.
    ///
    pub fn def_virt(register: VirtualRegister) -> Self {
        Self::def_of(OperandRegister::Virtual(register))
    }
}

///
/// Where a machine instruction came from.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstOrigin {
    /// Lifted from the original machine code.
    Original,
    /// Injected by the instrumentation pipeline.
    Injected,
}

///
/// A machine instruction.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MachineInst {
    /// The opcode.
    pub opcode: Opcode,
    /// The explicit operands, destinations first.
    pub operands: Vec<MachineOperand>,
    /// Whether the instruction was lifted or injected.
    pub origin: InstOrigin,
}

impl MachineInst {
    ///
    /// A shortcut constructor for injected instructions.
    ///
    pub fn new(opcode: Opcode, operands: Vec<MachineOperand>) -> Self {
        Self {
            opcode,
            operands,
            origin: InstOrigin::Injected,
        }
    }

    ///
    /// A shortcut constructor for lifted instructions.
    ///
    pub fn original(opcode: Opcode, operands: Vec<MachineOperand>) -> Self {
        Self {
            opcode,
            operands,
            origin: InstOrigin::Original,
        }
    }

    ///
    /// Iterates the register operands together with their def flags.
    ///
    pub fn registers(&self) -> impl Iterator<Item = (OperandRegister, bool)> + '_ {
        self.operands.iter().filter_map(|operand| match operand {
            MachineOperand::Register { register, is_def } => Some((*register, *is_def)),
            _ => None,
        })
    }
}

///
/// A basic block: an ordered list of instruction identifiers plus explicit
/// successor edges.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MachineBasicBlock {
    /// The instructions in program order.
    insts: Vec<InstId>,
    /// The successor blocks.
    successors: Vec<BlockId>,
}

impl MachineBasicBlock {
    ///
    /// The instructions in program order.
    ///
    pub fn insts(&self) -> &[InstId] {
        self.insts.as_slice()
    }

    ///
    /// The successor blocks.
    ///
    pub fn successors(&self) -> &[BlockId] {
        self.successors.as_slice()
    }
}

/// An arena slot. Removed instructions leave a tombstone so identifiers
/// stay stable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct InstSlot {
    inst: MachineInst,
    parent: BlockId,
    dead: bool,
}

///
/// A machine function.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MachineFunction {
    /// The symbol name.
    name: String,
    /// Whether the function is a kernel entry point.
    is_kernel: bool,
    /// The instruction arena.
    insts: Vec<InstSlot>,
    /// The basic blocks.
    blocks: Vec<MachineBasicBlock>,
    /// The block layout order.
    layout: Vec<BlockId>,
    /// The register classes of minted virtual registers.
    vreg_classes: Vec<RegisterClass>,
}

impl MachineFunction {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(name: String, is_kernel: bool) -> Self {
        Self {
            name,
            is_kernel,
            insts: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            vreg_classes: Vec::new(),
        }
    }

    ///
    /// The symbol name.
    ///
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    ///
    /// Whether the function is a kernel entry point.
    ///
    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    ///
    /// Appends a new basic block to the layout.
    ///
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(MachineBasicBlock::default());
        self.layout.push(id);
        id
    }

    ///
    /// Adds a control-flow edge.
    ///
    pub fn add_successor(&mut self, from: BlockId, to: BlockId) {
        let successors = &mut self.blocks[from.0 as usize].successors;
        if !successors.contains(&to) {
            successors.push(to);
        }
    }

    ///
    /// Appends an instruction to a block.
    ///
    pub fn push_inst(&mut self, block: BlockId, inst: MachineInst) -> InstId {
        let id = self.alloc(inst, block);
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    ///
    /// Inserts an instruction immediately before an existing one, in the
    /// same block.
    ///
    pub fn insert_before(&mut self, target: InstId, inst: MachineInst) -> InstId {
        let block = self.parent_block(target);
        let id = self.alloc(inst, block);
        let insts = &mut self.blocks[block.0 as usize].insts;
        let position = insts
            .iter()
            .position(|existing| *existing == target)
            .expect("The target instruction is in its parent block");
        insts.insert(position, id);
        id
    }

    ///
    /// Inserts an instruction immediately after an existing one, in the
    /// same block.
    ///
    pub fn insert_after(&mut self, target: InstId, inst: MachineInst) -> InstId {
        let block = self.parent_block(target);
        let id = self.alloc(inst, block);
        let insts = &mut self.blocks[block.0 as usize].insts;
        let position = insts
            .iter()
            .position(|existing| *existing == target)
            .expect("The target instruction is in its parent block");
        insts.insert(position + 1, id);
        id
    }

    ///
    /// Replaces an instruction with a sequence, in place.
    ///
    pub fn replace_with(&mut self, target: InstId, replacement: Vec<MachineInst>) -> Vec<InstId> {
        let ids: Vec<InstId> = replacement
            .into_iter()
            .map(|inst| self.insert_before(target, inst))
            .collect();
        self.remove(target);
        ids
    }

    ///
    /// Removes an instruction, leaving its identifier dead.
    ///
    pub fn remove(&mut self, target: InstId) {
        let block = self.parent_block(target);
        self.blocks[block.0 as usize]
            .insts
            .retain(|existing| *existing != target);
        self.insts[target.0 as usize].dead = true;
    }

    ///
    /// Mints a virtual register of the given class.
    ///
    pub fn create_vreg(&mut self, class: RegisterClass) -> VirtualRegister {
        let register = VirtualRegister(self.vreg_classes.len() as u32);
        self.vreg_classes.push(class);
        register
    }

    ///
    /// The class of a virtual register.
    ///
    pub fn vreg_class(&self, register: VirtualRegister) -> RegisterClass {
        self.vreg_classes[register.0 as usize]
    }

    ///
    /// The number of minted virtual registers.
    ///
    pub fn vreg_count(&self) -> usize {
        self.vreg_classes.len()
    }

    ///
    /// Whether an identifier refers to a live instruction of this function.
    ///
    pub fn contains(&self, id: InstId) -> bool {
        self.insts
            .get(id.0 as usize)
            .map(|slot| !slot.dead)
            .unwrap_or(false)
    }

    ///
    /// The instruction behind an identifier.
    ///
    pub fn inst(&self, id: InstId) -> &MachineInst {
        let slot = &self.insts[id.0 as usize];
        assert!(!slot.dead, "instruction {id:?} was removed");
        &slot.inst
    }

    ///
    /// The mutable instruction behind an identifier.
    ///
    pub fn inst_mut(&mut self, id: InstId) -> &mut MachineInst {
        let slot = &mut self.insts[id.0 as usize];
        assert!(!slot.dead, "instruction {id:?} was removed");
        &mut slot.inst
    }

    ///
    /// The block an instruction lives in.
    ///
    pub fn parent_block(&self, id: InstId) -> BlockId {
        let slot = &self.insts[id.0 as usize];
        assert!(!slot.dead, "instruction {id:?} was removed");
        slot.parent
    }

    ///
    /// The blocks in layout order.
    ///
    pub fn layout(&self) -> &[BlockId] {
        self.layout.as_slice()
    }

    ///
    /// A basic block.
    ///
    pub fn block(&self, id: BlockId) -> &MachineBasicBlock {
        &self.blocks[id.0 as usize]
    }

    ///
    /// Iterates live instructions in layout order.
    ///
    pub fn instructions(&self) -> impl Iterator<Item = (InstId, &MachineInst)> + '_ {
        self.layout.iter().flat_map(move |block| {
            self.blocks[block.0 as usize]
                .insts
                .iter()
                .map(move |id| (*id, &self.insts[id.0 as usize].inst))
        })
    }

    ///
    /// The number of live instructions.
    ///
    pub fn inst_count(&self) -> usize {
        self.insts.iter().filter(|slot| !slot.dead).count()
    }

    fn alloc(&mut self, inst: MachineInst, parent: BlockId) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(InstSlot {
            inst,
            parent,
            dead: false,
        });
        id
    }
}

///
/// The machine-IR container: one module per loaded code object, one
/// function per kernel or device function.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MachineModule {
    /// The module name.
    name: String,
    /// The target ISA.
    isa: Isa,
    /// The functions, keyed by symbol name in creation order.
    functions: IndexMap<String, MachineFunction>,
}

impl MachineModule {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(name: String, isa: Isa) -> Self {
        Self {
            name,
            isa,
            functions: IndexMap::new(),
        }
    }

    ///
    /// The module name.
    ///
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    ///
    /// The target ISA.
    ///
    pub fn isa(&self) -> &Isa {
        &self.isa
    }

    ///
    /// Adds a function; replaces any previous function of the same name.
    ///
    pub fn add_function(&mut self, function: MachineFunction) {
        self.functions
            .insert(function.name().to_owned(), function);
    }

    ///
    /// A function by symbol name.
    ///
    pub fn function(&self, name: &str) -> Option<&MachineFunction> {
        self.functions.get(name)
    }

    ///
    /// A mutable function by symbol name.
    ///
    pub fn function_mut(&mut self, name: &str) -> Option<&mut MachineFunction> {
        self.functions.get_mut(name)
    }

    ///
    /// Iterates the functions in creation order.
    ///
    pub fn functions(&self) -> impl Iterator<Item = &MachineFunction> + '_ {
        self.functions.values()
    }

    ///
    /// Iterates the functions mutably.
    ///
    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut MachineFunction> + '_ {
        self.functions.values_mut()
    }

    ///
    /// The function names in creation order.
    ///
    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::target::Register;
    use crate::target::RegisterClass;
    use crate::target::opcode::Opcode;

    use super::MachineFunction;
    use super::MachineInst;
    use super::MachineOperand;

    fn nop() -> MachineInst {
        MachineInst::new(Opcode::SNop, vec![MachineOperand::Immediate(0)])
    }

    #[test]
    fn insert_before_keeps_order() {
        let mut function = MachineFunction::new("f".to_owned(), false);
        let block = function.create_block();
        let first = function.push_inst(block, nop());
        let last = function.push_inst(
            block,
            MachineInst::new(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
        let middle = function.insert_before(
            last,
            MachineInst::new(
                Opcode::SMovB32,
                vec![
                    MachineOperand::def_phys(Register::Sgpr(0)),
                    MachineOperand::Immediate(1),
                ],
            ),
        );
        assert_eq!(function.block(block).insts(), &[first, middle, last]);
    }

    #[test]
    fn removal_tombstones_identifiers() {
        let mut function = MachineFunction::new("f".to_owned(), false);
        let block = function.create_block();
        let id = function.push_inst(block, nop());
        assert!(function.contains(id));
        function.remove(id);
        assert!(!function.contains(id));
        assert_eq!(function.inst_count(), 0);
    }

    #[test]
    fn replace_splices_in_place() {
        let mut function = MachineFunction::new("f".to_owned(), false);
        let block = function.create_block();
        let head = function.push_inst(block, nop());
        let target = function.push_inst(block, nop());
        let tail = function.push_inst(block, nop());
        let replacement = function.replace_with(target, vec![nop(), nop()]);
        assert_eq!(replacement.len(), 2);
        assert_eq!(
            function.block(block).insts(),
            &[head, replacement[0], replacement[1], tail]
        );
    }

    #[test]
    fn vreg_classes_are_tracked() {
        let mut function = MachineFunction::new("f".to_owned(), false);
        let scalar = function.create_vreg(RegisterClass::Sgpr32);
        let pair = function.create_vreg(RegisterClass::Sgpr64);
        assert_eq!(function.vreg_class(scalar), RegisterClass::Sgpr32);
        assert_eq!(function.vreg_class(pair), RegisterClass::Sgpr64);
    }
}
