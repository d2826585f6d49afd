//!
//! Linear-scan register allocation.
//!
//! Virtual registers minted by the instrumentation pipeline are mapped onto
//! the physical registers the original code leaves free. Scalar ranges that
//! do not fit are spilled to lanes of the reserved state-value register and
//! shuttled through a reserved scalar pair at each access.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::mir::InstId;
use crate::mir::MachineFunction;
use crate::mir::MachineInst;
use crate::mir::MachineOperand;
use crate::mir::OperandRegister;
use crate::mir::VirtualRegister;
use crate::target::Register;
use crate::target::RegisterClass;
use crate::target::RegisterInfo;
use crate::target::opcode::Opcode;

///
/// The register-allocation error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegAllocError {
    /// The free set and the spill lanes are both exhausted.
    #[error("register pressure exceeds the free {0:?} set")]
    Pressure(RegisterClass),
    /// One instruction touches more spilled values than the shuttle pair
    /// can carry.
    #[error("spill shuttle exhausted at {0:?}")]
    ShuttlePressure(InstId),
}

///
/// The allocation environment of one function.
///
#[derive(Debug, Clone)]
pub struct AllocationInput<'a> {
    /// The register file description.
    pub register_info: &'a RegisterInfo,
    /// Physical registers the original code or the ABI already uses.
    pub occupied: BTreeSet<Register>,
    /// The reserved state-value register spills go to, one 32-bit value
    /// per lane.
    pub state_value_register: Register,
    /// The reserved even-aligned scalar pair spilled values are shuttled
    /// through.
    pub shuttle: Register,
}

///
/// The allocation outcome.
///
#[derive(Debug, Clone, Default)]
pub struct AllocationResult {
    /// The physical register assigned to each non-spilled virtual register.
    pub assignments: BTreeMap<VirtualRegister, Register>,
    /// The number of state-value lanes taken by spills.
    pub spill_lanes_used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Assigned(Register),
    Lane(u32),
}

#[derive(Debug, Clone)]
struct LiveRange {
    vreg: VirtualRegister,
    class: RegisterClass,
    start: usize,
    end: usize,
}

///
/// Allocates every virtual register of `function`, rewriting operands to
/// physical registers and inserting lane spill/fill code where needed.
///
pub fn allocate(
    function: &mut MachineFunction,
    input: &AllocationInput<'_>,
) -> Result<AllocationResult, RegAllocError> {
    let order: Vec<InstId> = function.instructions().map(|(id, _)| id).collect();
    let ranges = live_ranges(function, order.as_slice());

    let mut pool = Pool::new(input);
    let mut active: Vec<(usize, VirtualRegister)> = Vec::new();
    let mut locations: BTreeMap<VirtualRegister, Location> = BTreeMap::new();
    let mut classes: BTreeMap<VirtualRegister, RegisterClass> = BTreeMap::new();
    let mut lanes_used = 0u32;

    for range in ranges.iter() {
        classes.insert(range.vreg, range.class);

        // Expire ranges that ended before this one starts.
        active.retain(|(end, vreg)| {
            if *end < range.start {
                if let Some(Location::Assigned(register)) = locations.get(vreg) {
                    pool.release(*register, classes[vreg]);
                }
                false
            } else {
                true
            }
        });

        match pool.acquire(range.class) {
            Some(register) => {
                locations.insert(range.vreg, Location::Assigned(register));
                active.push((range.end, range.vreg));
            }
            None => {
                // Spill the scalar range that stays live the longest.
                let victim = active
                    .iter()
                    .filter(|(_, vreg)| classes[vreg].is_scalar())
                    .max_by_key(|(end, _)| *end)
                    .copied();
                let spilled = match victim {
                    Some((victim_end, victim_vreg))
                        if victim_end > range.end && range.class.is_scalar() =>
                    {
                        let victim_register = match locations[&victim_vreg] {
                            Location::Assigned(register) => register,
                            Location::Lane(_) => unreachable!("active ranges are assigned"),
                        };
                        pool.release(victim_register, classes[&victim_vreg]);
                        active.retain(|(_, vreg)| *vreg != victim_vreg);
                        let register = pool
                            .acquire(range.class)
                            .ok_or(RegAllocError::Pressure(range.class))?;
                        locations.insert(range.vreg, Location::Assigned(register));
                        active.push((range.end, range.vreg));
                        victim_vreg
                    }
                    _ if range.class.is_scalar() => range.vreg,
                    _ => return Err(RegAllocError::Pressure(range.class)),
                };

                let slots = classes[&spilled].slot_count() as u32;
                if lanes_used + slots > 64 {
                    return Err(RegAllocError::Pressure(classes[&spilled]));
                }
                locations.insert(spilled, Location::Lane(lanes_used));
                lanes_used += slots;
            }
        }
    }

    rewrite(function, order.as_slice(), &locations, &classes, input)?;

    let assignments = locations
        .iter()
        .filter_map(|(vreg, location)| match location {
            Location::Assigned(register) => Some((*vreg, *register)),
            Location::Lane(_) => None,
        })
        .collect();
    Ok(AllocationResult {
        assignments,
        spill_lanes_used: lanes_used,
    })
}

///
/// Computes one contiguous live range per virtual register over the
/// linearized instruction order.
///
fn live_ranges(function: &MachineFunction, order: &[InstId]) -> Vec<LiveRange> {
    let mut ranges: BTreeMap<VirtualRegister, LiveRange> = BTreeMap::new();
    for (index, id) in order.iter().enumerate() {
        for (register, _) in function.inst(*id).registers() {
            if let OperandRegister::Virtual(vreg) = register {
                ranges
                    .entry(vreg)
                    .and_modify(|range| range.end = index)
                    .or_insert_with(|| LiveRange {
                        vreg,
                        class: function.vreg_class(vreg),
                        start: index,
                        end: index,
                    });
            }
        }
    }
    let mut ranges: Vec<LiveRange> = ranges.into_values().collect();
    ranges.sort_by_key(|range| (range.start, range.end));
    ranges
}

struct Pool<'a> {
    register_info: &'a RegisterInfo,
    taken_sgprs: BTreeSet<u16>,
    taken_vgprs: BTreeSet<u16>,
}

impl<'a> Pool<'a> {
    fn new(input: &AllocationInput<'a>) -> Self {
        let mut taken_sgprs = BTreeSet::new();
        let mut taken_vgprs = BTreeSet::new();
        for register in input.occupied.iter() {
            match register {
                Register::Sgpr(index) => {
                    taken_sgprs.insert(*index);
                }
                Register::Vgpr(index) => {
                    taken_vgprs.insert(*index);
                }
                _ => {}
            }
        }
        if let Register::Vgpr(index) = input.state_value_register {
            taken_vgprs.insert(index);
        }
        if let Register::Sgpr(index) = input.shuttle {
            taken_sgprs.insert(index);
            taken_sgprs.insert(index + 1);
        }
        Self {
            register_info: input.register_info,
            taken_sgprs,
            taken_vgprs,
        }
    }

    fn acquire(&mut self, class: RegisterClass) -> Option<Register> {
        let candidate = self
            .register_info
            .allocation_order(class)
            .into_iter()
            .find(|register| match register {
                Register::Sgpr(index) => {
                    (0..class.slot_count()).all(|slot| !self.taken_sgprs.contains(&(index + slot)))
                }
                Register::Vgpr(index) => !self.taken_vgprs.contains(index),
                _ => false,
            })?;
        self.mark(candidate, class, true);
        Some(candidate)
    }

    fn release(&mut self, register: Register, class: RegisterClass) {
        self.mark(register, class, false);
    }

    fn mark(&mut self, register: Register, class: RegisterClass, taken: bool) {
        match register {
            Register::Sgpr(index) => {
                for slot in 0..class.slot_count() {
                    if taken {
                        self.taken_sgprs.insert(index + slot);
                    } else {
                        self.taken_sgprs.remove(&(index + slot));
                    }
                }
            }
            Register::Vgpr(index) => {
                if taken {
                    self.taken_vgprs.insert(index);
                } else {
                    self.taken_vgprs.remove(&index);
                }
            }
            _ => {}
        }
    }
}

///
/// Rewrites virtual operands to their physical assignment and brackets
/// accesses to spilled values with lane fills and spills.
///
fn rewrite(
    function: &mut MachineFunction,
    order: &[InstId],
    locations: &BTreeMap<VirtualRegister, Location>,
    classes: &BTreeMap<VirtualRegister, RegisterClass>,
    input: &AllocationInput<'_>,
) -> Result<(), RegAllocError> {
    let shuttle_base = match input.shuttle {
        Register::Sgpr(index) => index,
        other => panic!("the spill shuttle must be an SGPR pair, not {other}"),
    };

    for id in order.iter().copied() {
        // Distinct spilled virtual registers of this instruction, each
        // given a shuttle slot.
        let mut shuttle_map: BTreeMap<VirtualRegister, Register> = BTreeMap::new();
        let mut next_slot: u16 = 0;
        let mut fills: Vec<(VirtualRegister, Register, u32)> = Vec::new();
        let mut spills: Vec<(VirtualRegister, Register, u32)> = Vec::new();

        {
            let inst = function.inst_mut(id);
            for operand in inst.operands.iter_mut() {
                let MachineOperand::Register { register, is_def } = operand else {
                    continue;
                };
                let OperandRegister::Virtual(vreg) = *register else {
                    continue;
                };
                match locations.get(&vreg) {
                    Some(Location::Assigned(physical)) => {
                        *register = OperandRegister::Physical(*physical);
                    }
                    Some(Location::Lane(lane)) => {
                        let class = classes[&vreg];
                        let slots = class.slot_count();
                        let shuttle = *shuttle_map.entry(vreg).or_insert_with(|| {
                            // 64-bit values need the aligned base slot.
                            let slot = if slots == 2 { 0 } else { next_slot };
                            next_slot += slots;
                            Register::Sgpr(shuttle_base + slot)
                        });
                        if next_slot > 2 {
                            return Err(RegAllocError::ShuttlePressure(id));
                        }
                        if *is_def {
                            spills.push((vreg, shuttle, *lane));
                        } else {
                            fills.push((vreg, shuttle, *lane));
                        }
                        *register = OperandRegister::Physical(shuttle);
                    }
                    None => unreachable!("every virtual register has a live range"),
                }
            }
        }

        for (vreg, shuttle, lane) in fills {
            for slot in 0..classes[&vreg].slot_count() {
                function.insert_before(
                    id,
                    MachineInst::new(
                        Opcode::VReadlaneB32,
                        vec![
                            MachineOperand::def_phys(shuttle.offset_by(slot)),
                            MachineOperand::use_phys(input.state_value_register),
                            MachineOperand::Immediate((lane + slot as u32) as i64),
                        ],
                    ),
                );
            }
        }
        for (vreg, shuttle, lane) in spills {
            for slot in 0..classes[&vreg].slot_count() {
                function.insert_after(
                    id,
                    MachineInst::new(
                        Opcode::VWritelaneB32,
                        vec![
                            MachineOperand::def_phys(input.state_value_register),
                            MachineOperand::use_phys(shuttle.offset_by(slot)),
                            MachineOperand::Immediate((lane + slot as u32) as i64),
                        ],
                    ),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::mir::MachineFunction;
    use crate::mir::MachineInst;
    use crate::mir::MachineOperand;
    use crate::mir::OperandRegister;
    use crate::target::Register;
    use crate::target::RegisterClass;
    use crate::target::RegisterInfo;
    use crate::target::opcode::Opcode;

    use super::AllocationInput;
    use super::allocate;

    const REGISTER_INFO: RegisterInfo = RegisterInfo {
        sgpr_count: 102,
        vgpr_count: 256,
    };

    fn input(occupied: BTreeSet<Register>) -> AllocationInput<'static> {
        AllocationInput {
            register_info: &REGISTER_INFO,
            occupied,
            state_value_register: Register::Vgpr(255),
            shuttle: Register::Sgpr(100),
        }
    }

    #[test]
    fn assigns_free_registers_in_order() {
        let mut function = MachineFunction::new("f".to_owned(), true);
        let block = function.create_block();
        let a = function.create_vreg(RegisterClass::Sgpr32);
        let b = function.create_vreg(RegisterClass::Sgpr32);
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SMovB32,
                vec![MachineOperand::def_virt(a), MachineOperand::Immediate(1)],
            ),
        );
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SAddU32,
                vec![
                    MachineOperand::def_virt(b),
                    MachineOperand::use_virt(a),
                    MachineOperand::Immediate(2),
                ],
            ),
        );

        let occupied: BTreeSet<Register> = (0..4).map(Register::Sgpr).collect();
        let result = allocate(&mut function, &input(occupied)).expect("Always valid");
        assert_eq!(result.spill_lanes_used, 0);
        assert_eq!(result.assignments[&a], Register::Sgpr(4));
        // `a` is still live at `b`'s definition.
        assert_eq!(result.assignments[&b], Register::Sgpr(5));

        for (_, inst) in function.instructions() {
            for (register, _) in inst.registers() {
                assert!(matches!(register, OperandRegister::Physical(_)));
            }
        }
    }

    #[test]
    fn spills_to_lanes_when_the_file_is_full() {
        let mut function = MachineFunction::new("f".to_owned(), true);
        let block = function.create_block();
        // Two overlapping ranges with a single free SGPR: the longer one
        // is spilled to a lane.
        let long = function.create_vreg(RegisterClass::Sgpr32);
        let short = function.create_vreg(RegisterClass::Sgpr32);
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SMovB32,
                vec![MachineOperand::def_virt(long), MachineOperand::Immediate(1)],
            ),
        );
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SMovB32,
                vec![MachineOperand::def_virt(short), MachineOperand::Immediate(2)],
            ),
        );
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SAddU32,
                vec![
                    MachineOperand::def_virt(short),
                    MachineOperand::use_virt(short),
                    MachineOperand::Immediate(3),
                ],
            ),
        );
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SAddU32,
                vec![
                    MachineOperand::def_virt(long),
                    MachineOperand::use_virt(long),
                    MachineOperand::Immediate(4),
                ],
            ),
        );

        // Everything but s99 is occupied; s100-101 are the shuttle.
        let occupied: BTreeSet<Register> = (0..99).map(Register::Sgpr).collect();
        let result = allocate(&mut function, &input(occupied)).expect("Always valid");
        assert_eq!(result.spill_lanes_used, 1);
        assert_eq!(result.assignments[&short], Register::Sgpr(99));
        assert!(!result.assignments.contains_key(&long));

        let opcodes: Vec<Opcode> = function
            .instructions()
            .map(|(_, inst)| inst.opcode)
            .collect();
        assert!(opcodes.contains(&Opcode::VWritelaneB32));
        assert!(opcodes.contains(&Opcode::VReadlaneB32));
    }
}
