//!
//! Machine-IR construction from instruction records.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use lyra_backend::mc::McOperand;
use lyra_backend::mir::InstId;
use lyra_backend::mir::MachineFunction;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::target::opcode::Format;

use crate::error::Error;
use crate::error::Result;
use crate::lifter::branch::evaluate_branch;
use crate::lifter::record::InstructionRecord;

///
/// A resolved relocation: the referenced symbol and the ELF relocation
/// type.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRecord {
    /// The referenced symbol name.
    pub symbol_name: String,
    /// The ELF relocation type.
    pub r_type: u32,
}

///
/// Builds one machine function from a symbol's instruction records.
///
/// Basic blocks split at every address in the direct-branch target set and
/// after every terminator; branch operands are re-targeted to blocks;
/// literal operands whose sites carry relocations are symbolized into
/// global references.
///
pub(crate) fn lift_function(
    name: &str,
    is_kernel: bool,
    records: &[InstructionRecord],
    branch_targets: &BTreeSet<u64>,
    relocations: &BTreeMap<u64, RelocationRecord>,
) -> Result<(MachineFunction, Vec<(InstId, usize)>)> {
    if records.is_empty() {
        return Err(Error::lift(format!("`{name}` has no instructions")));
    }

    let mut function = MachineFunction::new(name.to_owned(), is_kernel);

    // Block boundaries: the entry, every branch target, and every
    // instruction following a terminator.
    let mut block_starts: BTreeSet<u64> = BTreeSet::new();
    block_starts.insert(records[0].address);
    let mut previous_was_terminator = false;
    for record in records.iter() {
        if previous_was_terminator || branch_targets.contains(&record.address) {
            block_starts.insert(record.address);
        }
        previous_was_terminator = record.inst.opcode.description().is_terminator;
    }

    let block_of: BTreeMap<u64, lyra_backend::mir::BlockId> = block_starts
        .iter()
        .map(|address| (*address, function.create_block()))
        .collect();

    let first = records[0].address;
    let last = records.last().expect("Checked non-empty");
    let end = last.address + last.size as u64;

    let mut mapping = Vec::with_capacity(records.len());
    let mut current_block = block_of[&first];
    for (index, record) in records.iter().enumerate() {
        if let Some(block) = block_of.get(&record.address) {
            // A fallthrough into a new block keeps control flow explicit.
            if *block != current_block && !ends_with_terminator(&function, current_block) {
                function.add_successor(current_block, *block);
            }
            current_block = *block;
        }

        let description = record.inst.opcode.description();
        let operands = if description.is_branch {
            let target = evaluate_branch(&record.inst, record.address, record.size as u64)
                .ok_or_else(|| {
                    Error::lift(format!(
                        "direct branch without a computable target at {record}"
                    ))
                })?;
            if target < first || target >= end {
                return Err(Error::lift(format!(
                    "branch target {target:#x} escapes `{name}` at {record}"
                )));
            }
            let target_block = block_of.get(&target).copied().ok_or_else(|| {
                Error::lift(format!(
                    "branch target {target:#x} does not start an instruction at {record}"
                ))
            })?;
            function.add_successor(current_block, target_block);
            vec![MachineOperand::Block(target_block)]
        } else {
            convert_operands(record, relocations)
        };

        let id = function.push_inst(
            current_block,
            MachineInst::original(record.inst.opcode, operands),
        );
        mapping.push((id, index));
    }

    Ok((function, mapping))
}

fn ends_with_terminator(
    function: &MachineFunction,
    block: lyra_backend::mir::BlockId,
) -> bool {
    function
        .block(block)
        .insts()
        .last()
        .map(|id| {
            let inst = function.inst(*id);
            inst.opcode.description().is_terminator && !inst.opcode.description().is_conditional
        })
        .unwrap_or(false)
}

///
/// Converts machine-code operands into machine-IR operands, symbolizing
/// relocated literals.
///
fn convert_operands(
    record: &InstructionRecord,
    relocations: &BTreeMap<u64, RelocationRecord>,
) -> Vec<MachineOperand> {
    let description = record.inst.opcode.description();
    let base_size: u8 = match description.format {
        Format::Smem | Format::Flat => 8,
        _ => 4,
    };
    let literal_relocation = (record.size > base_size)
        .then(|| relocations.get(&(record.address + record.size as u64 - 4)))
        .flatten();

    let literal_position = literal_relocation.and_then(|_| {
        record
            .inst
            .operands
            .iter()
            .rposition(|operand| matches!(operand, McOperand::Immediate(_)))
    });

    record
        .inst
        .operands
        .iter()
        .enumerate()
        .map(|(index, operand)| match operand {
            McOperand::Register(register) => {
                let is_def = index == 0 && description.dest_slots > 0 && !description.is_store;
                MachineOperand::Register {
                    register: lyra_backend::mir::OperandRegister::Physical(*register),
                    is_def,
                }
            }
            McOperand::Immediate(value) => match (literal_position, literal_relocation) {
                (Some(position), Some(relocation)) if position == index => {
                    MachineOperand::Global(relocation.symbol_name.clone())
                }
                _ => MachineOperand::Immediate(*value),
            },
        })
        .collect()
}
