//!
//! Instruction selection from hook IR into machine IR.
//!

use std::collections::BTreeMap;

use crate::ir::BinaryOp;
use crate::ir::Inst;
use crate::ir::Value;
use crate::mir::InstId;
use crate::mir::MachineFunction;
use crate::mir::MachineInst;
use crate::mir::MachineOperand;
use crate::mir::VirtualRegister;
use crate::target::RegisterClass;
use crate::target::opcode::Opcode;

///
/// The instruction-selection error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// A call survived to selection; intrinsic lowering should have
    /// replaced it with a placeholder.
    #[error("unselected call to `{0}`")]
    UnselectedCall(String),
    /// A value form has no meaning at selection time.
    #[error("unselectable value: {0}")]
    UnselectableValue(String),
    /// A value was used before it was produced.
    #[error("use of an unproduced result {0}")]
    UnproducedResult(u32),
}

///
/// The selection result of one body.
///
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// The virtual register holding each body instruction's result.
    pub results: Vec<Option<VirtualRegister>>,
    /// The machine instruction of each inline-asm placeholder, by index.
    pub asm_sites: BTreeMap<u32, InstId>,
    /// Every emitted machine instruction, in program order.
    pub emitted: Vec<InstId>,
}

///
/// Selects a straight-line body into machine instructions inserted
/// immediately before `anchor`, all over fresh virtual registers.
///
/// Inline-asm placeholders pass through untouched, carrying their side
/// table index.
///
pub fn select_body(
    body: &[Inst],
    function: &mut MachineFunction,
    anchor: InstId,
) -> Result<Selection, SelectError> {
    let mut selection = Selection {
        results: Vec::with_capacity(body.len()),
        ..Selection::default()
    };

    let mut emit = |function: &mut MachineFunction,
                    selection: &mut Selection,
                    inst: MachineInst|
     -> InstId {
        let id = function.insert_before(anchor, inst);
        selection.emitted.push(id);
        id
    };

    for inst in body.iter() {
        let result = match inst {
            Inst::Call { callee, .. } => {
                return Err(SelectError::UnselectedCall(callee.clone()));
            }
            Inst::Binary { op, lhs, rhs } => {
                let lhs = operand_of(lhs, function, &mut selection, &mut emit)?;
                let rhs = operand_of(rhs, function, &mut selection, &mut emit)?;
                let dest = function.create_vreg(RegisterClass::Sgpr32);
                let opcode = match op {
                    BinaryOp::Add => Opcode::SAddU32,
                    BinaryOp::Sub => Opcode::SSubU32,
                    BinaryOp::And => Opcode::SAndB32,
                    BinaryOp::Or => Opcode::SOrB32,
                    BinaryOp::Xor => Opcode::SXorB32,
                    BinaryOp::Shl => Opcode::SLshlB32,
                    BinaryOp::Mul => Opcode::SMulI32,
                };
                emit(
                    function,
                    &mut selection,
                    MachineInst::new(
                        opcode,
                        vec![MachineOperand::def_virt(dest), lhs, rhs],
                    ),
                );
                Some(dest)
            }
            Inst::Load { address } => {
                let base = address_of(address, function, &mut selection, &mut emit)?;
                let dest = function.create_vreg(RegisterClass::Sgpr32);
                emit(
                    function,
                    &mut selection,
                    MachineInst::new(
                        Opcode::SLoadDword,
                        vec![
                            MachineOperand::def_virt(dest),
                            MachineOperand::use_virt(base),
                            MachineOperand::Immediate(0),
                        ],
                    ),
                );
                Some(dest)
            }
            Inst::Store { address, value } => {
                let base = address_of(address, function, &mut selection, &mut emit)?;
                let data = vreg_of(value, function, &mut selection, &mut emit)?;
                emit(
                    function,
                    &mut selection,
                    MachineInst::new(
                        Opcode::SStoreDword,
                        vec![
                            MachineOperand::use_virt(data),
                            MachineOperand::use_virt(base),
                            MachineOperand::Immediate(0),
                        ],
                    ),
                );
                None
            }
            Inst::AtomicAdd { address, value } => {
                let base = address_of(address, function, &mut selection, &mut emit)?;
                let data = vreg_of(value, function, &mut selection, &mut emit)?;
                emit(
                    function,
                    &mut selection,
                    MachineInst::new(
                        Opcode::SAtomicAdd,
                        vec![
                            MachineOperand::use_virt(data),
                            MachineOperand::use_virt(base),
                            MachineOperand::Immediate(0),
                        ],
                    ),
                );
                None
            }
            Inst::InlineAsm {
                index,
                inputs,
                result_class,
            } => {
                let mut operands = vec![MachineOperand::AsmIndex(*index)];
                let result = result_class.map(|class| function.create_vreg(class));
                if let Some(register) = result {
                    operands.push(MachineOperand::def_virt(register));
                }
                for input in inputs.iter() {
                    // Addresses keep their 64-bit class; everything else
                    // is a 32-bit scalar.
                    let register = match input {
                        Value::GlobalAddress(_) => {
                            address_of(input, function, &mut selection, &mut emit)?
                        }
                        _ => vreg_of(input, function, &mut selection, &mut emit)?,
                    };
                    operands.push(MachineOperand::use_virt(register));
                }
                let site = emit(
                    function,
                    &mut selection,
                    MachineInst::new(Opcode::InlineAsm, operands),
                );
                selection.asm_sites.insert(*index, site);
                result
            }
            Inst::Return { .. } => None,
        };
        selection.results.push(result);
    }
    Ok(selection)
}

type Emit<'a> = dyn FnMut(&mut MachineFunction, &mut Selection, MachineInst) -> InstId + 'a;

///
/// Turns a value into a plain machine operand; constants stay immediate.
///
fn operand_of(
    value: &Value,
    function: &mut MachineFunction,
    selection: &mut Selection,
    emit: &mut Emit<'_>,
) -> Result<MachineOperand, SelectError> {
    match value {
        Value::Constant(constant) => Ok(MachineOperand::Immediate(*constant)),
        _ => Ok(MachineOperand::use_virt(vreg_of(
            value, function, selection, emit,
        )?)),
    }
}

///
/// Materializes a value into a 32-bit scalar virtual register.
///
fn vreg_of(
    value: &Value,
    function: &mut MachineFunction,
    selection: &mut Selection,
    emit: &mut Emit<'_>,
) -> Result<VirtualRegister, SelectError> {
    match value {
        Value::Constant(constant) => {
            let dest = function.create_vreg(RegisterClass::Sgpr32);
            emit(
                function,
                selection,
                MachineInst::new(
                    Opcode::SMovB32,
                    vec![
                        MachineOperand::def_virt(dest),
                        MachineOperand::Immediate(*constant),
                    ],
                ),
            );
            Ok(dest)
        }
        Value::Result(index) => selection
            .results
            .get(*index as usize)
            .copied()
            .flatten()
            .ok_or(SelectError::UnproducedResult(*index)),
        Value::GlobalAddress(_) => {
            // A 64-bit address used where a 32-bit value is expected.
            Err(SelectError::UnselectableValue(format!("{value:?}")))
        }
        Value::Argument(index) => Err(SelectError::UnselectableValue(format!(
            "argument {index} outside a call"
        ))),
        Value::PhysicalRegister(register) => Err(SelectError::UnselectableValue(format!(
            "raw physical register {register}"
        ))),
    }
}

///
/// Materializes a value into a 64-bit scalar address register.
///
fn address_of(
    value: &Value,
    function: &mut MachineFunction,
    selection: &mut Selection,
    emit: &mut Emit<'_>,
) -> Result<VirtualRegister, SelectError> {
    match value {
        Value::GlobalAddress(name) => {
            let dest = function.create_vreg(RegisterClass::Sgpr64);
            emit(
                function,
                selection,
                MachineInst::new(
                    Opcode::GlobalAddr,
                    vec![
                        MachineOperand::def_virt(dest),
                        MachineOperand::Global(name.clone()),
                    ],
                ),
            );
            Ok(dest)
        }
        Value::Result(index) => selection
            .results
            .get(*index as usize)
            .copied()
            .flatten()
            .ok_or(SelectError::UnproducedResult(*index)),
        other => Err(SelectError::UnselectableValue(format!(
            "{other:?} is not an address"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::Inst;
    use crate::ir::Value;
    use crate::mir::MachineFunction;
    use crate::mir::MachineInst;
    use crate::mir::MachineOperand;
    use crate::target::opcode::Opcode;

    use super::select_body;

    #[test]
    fn selects_an_atomic_counter_bump() {
        let mut function = MachineFunction::new("kernel".to_owned(), true);
        let block = function.create_block();
        let anchor = function.push_inst(
            block,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );

        let body = vec![
            Inst::AtomicAdd {
                address: Value::GlobalAddress("counter".to_owned()),
                value: Value::Constant(1),
            },
            Inst::Return { value: None },
        ];
        let selection = select_body(body.as_slice(), &mut function, anchor).expect("Always valid");

        // GLOBAL_ADDR + S_MOV + S_ATOMIC_ADD, all before the anchor.
        assert_eq!(selection.emitted.len(), 3);
        let opcodes: Vec<Opcode> = function
            .block(block)
            .insts()
            .iter()
            .map(|id| function.inst(*id).opcode)
            .collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::GlobalAddr,
                Opcode::SMovB32,
                Opcode::SAtomicAdd,
                Opcode::SEndpgm,
            ]
        );
    }

    #[test]
    fn placeholders_survive_selection() {
        let mut function = MachineFunction::new("kernel".to_owned(), true);
        let block = function.create_block();
        let anchor = function.push_inst(
            block,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
        let body = vec![Inst::InlineAsm {
            index: 7,
            inputs: vec![Value::Constant(5)],
            result_class: None,
        }];
        let selection = select_body(body.as_slice(), &mut function, anchor).expect("Always valid");
        let site = *selection.asm_sites.get(&7).expect("Always exists");
        assert_eq!(function.inst(site).opcode, Opcode::InlineAsm);
        assert_eq!(
            function.inst(site).operands.first(),
            Some(&MachineOperand::AsmIndex(7))
        );
    }
}
