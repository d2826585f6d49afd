//!
//! The physical-register virtualization pass.
//!
//! Injected code refers to the original code's physical registers both
//! through the virtual stand-ins minted by intrinsic lowering and through
//! raw operands. This pass brackets every injected region with explicit
//! copies: values flow in through a copy before the region and out through
//! a copy after it, and raw physical operands inside the region are
//! rewritten to the stand-ins. Register allocation then sees no illegal
//! physical-register uses inside instrumentation code.
//!

use std::collections::BTreeMap;

use lyra_backend::Register;
use lyra_backend::RegisterClass;
use lyra_backend::mir::InstId;
use lyra_backend::mir::InstOrigin;
use lyra_backend::mir::MachineFunction;
use lyra_backend::mir::MachineInst;
use lyra_backend::mir::MachineOperand;
use lyra_backend::mir::OperandRegister;
use lyra_backend::mir::VirtualRegister;
use lyra_backend::target::opcode::Opcode;

use crate::codegen::lower::AccessSet;
use crate::error::Result;

/// Architectural registers left physical: the frame pass handles them.
fn is_reserved(register: Register) -> bool {
    matches!(
        register,
        Register::ExecLo
            | Register::ExecHi
            | Register::VccLo
            | Register::VccHi
            | Register::Scc
            | Register::M0
            | Register::FlatScratchLo
            | Register::FlatScratchHi
    )
}

#[derive(Debug, Clone, Default)]
struct RegionUse {
    read: bool,
    written: bool,
}

///
/// Virtualizes physical-register access inside every injected region of a
/// function.
///
pub fn virtualize(function: &mut MachineFunction, access: &AccessSet) -> Result<()> {
    // Snapshot the regions first; insertion invalidates block iteration.
    let mut regions: Vec<Vec<InstId>> = Vec::new();
    for block in function.layout().to_vec() {
        let mut current: Vec<InstId> = Vec::new();
        for inst_id in function.block(block).insts().to_vec() {
            if function.inst(inst_id).origin == InstOrigin::Injected {
                current.push(inst_id);
            } else if !current.is_empty() {
                regions.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            regions.push(current);
        }
    }

    for region in regions {
        virtualize_region(function, access, region.as_slice());
    }
    Ok(())
}

fn virtualize_region(function: &mut MachineFunction, access: &AccessSet, region: &[InstId]) {
    // Each intrinsic stand-in brackets on its own; distinct placeholders
    // may virtualize the same physical register independently.
    let mut stand_ins: BTreeMap<VirtualRegister, RegionUse> = BTreeMap::new();
    // Raw physical operands share one stand-in per register.
    let mut raw: BTreeMap<(Register, RegisterClass), RegionUse> = BTreeMap::new();

    for inst_id in region.iter().copied() {
        for (register, is_def) in function.inst(inst_id).registers() {
            let entry = match register {
                OperandRegister::Virtual(vreg) => {
                    if access.phys_vregs.contains_key(&vreg) {
                        stand_ins.entry(vreg).or_default()
                    } else {
                        continue;
                    }
                }
                OperandRegister::Physical(physical) => {
                    if is_reserved(physical) {
                        continue;
                    }
                    raw.entry((physical, physical.natural_class())).or_default()
                }
            };
            if is_def {
                entry.written = true;
            } else {
                entry.read = true;
            }
        }
    }

    // Mint stand-ins for raw physical operands and rewrite them.
    let mut minted: BTreeMap<(Register, RegisterClass), VirtualRegister> = BTreeMap::new();
    for (register, class) in raw.keys() {
        minted.insert((*register, *class), function.create_vreg(*class));
    }
    if !minted.is_empty() {
        for inst_id in region.iter().copied() {
            let inst = function.inst_mut(inst_id);
            for operand in inst.operands.iter_mut() {
                let MachineOperand::Register { register, .. } = operand else {
                    continue;
                };
                let OperandRegister::Physical(physical) = *register else {
                    continue;
                };
                if let Some(vreg) = minted.get(&(physical, physical.natural_class())) {
                    *register = OperandRegister::Virtual(*vreg);
                }
            }
        }
    }

    // Bracketing copies: values in before the region, values out after.
    let first = region[0];
    let last = *region.last().expect("Regions are never empty");
    for (vreg, entry) in stand_ins.iter() {
        let (physical, class) = access.phys_vregs[vreg];
        if entry.read {
            insert_copy_in(function, first, physical, class, *vreg);
        }
        if entry.written {
            insert_copy_out(function, last, physical, class, *vreg);
        }
    }
    for ((physical, class), entry) in raw.iter() {
        let vreg = minted[&(*physical, *class)];
        if entry.read {
            insert_copy_in(function, first, *physical, *class, vreg);
        }
        if entry.written {
            insert_copy_out(function, last, *physical, *class, vreg);
        }
    }
}

/// The copy pseudo is a 32-bit move; pair stand-ins move as `s_mov_b64`.
fn insert_copy_in(
    function: &mut MachineFunction,
    before: InstId,
    physical: Register,
    class: RegisterClass,
    vreg: VirtualRegister,
) {
    if class.slot_count() == 1 {
        function.insert_before(
            before,
            MachineInst::new(
                Opcode::Copy,
                vec![
                    MachineOperand::def_virt(vreg),
                    MachineOperand::use_phys(physical),
                ],
            ),
        );
    } else {
        function.insert_before(
            before,
            MachineInst::new(
                Opcode::SMovB64,
                vec![
                    MachineOperand::def_virt(vreg),
                    MachineOperand::use_phys(physical),
                ],
            ),
        );
    }
}

fn insert_copy_out(
    function: &mut MachineFunction,
    after: InstId,
    physical: Register,
    class: RegisterClass,
    vreg: VirtualRegister,
) {
    let opcode = if class.slot_count() == 1 {
        Opcode::Copy
    } else {
        Opcode::SMovB64
    };
    function.insert_after(
        after,
        MachineInst::new(
            opcode,
            vec![
                MachineOperand::def_phys(physical),
                MachineOperand::use_virt(vreg),
            ],
        ),
    );
}

#[cfg(test)]
mod tests {
    use lyra_backend::Register;
    use lyra_backend::RegisterClass;
    use lyra_backend::mir::MachineFunction;
    use lyra_backend::mir::MachineInst;
    use lyra_backend::mir::MachineOperand;
    use lyra_backend::mir::OperandRegister;
    use lyra_backend::target::opcode::Opcode;

    use crate::codegen::lower::AccessSet;

    use super::virtualize;

    #[test]
    fn raw_physical_reads_get_bracketed() {
        let mut function = MachineFunction::new("k".to_owned(), true);
        let block = function.create_block();
        // Injected: s_add_u32 s10, s10, 1 between two original nops.
        function.push_inst(
            block,
            MachineInst::original(Opcode::SNop, vec![MachineOperand::Immediate(0)]),
        );
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::SAddU32,
                vec![
                    MachineOperand::def_phys(Register::Sgpr(10)),
                    MachineOperand::use_phys(Register::Sgpr(10)),
                    MachineOperand::Immediate(1),
                ],
            ),
        );
        function.push_inst(
            block,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );

        virtualize(&mut function, &AccessSet::default()).expect("Always valid");

        let insts: Vec<_> = function
            .instructions()
            .map(|(_, inst)| inst.clone())
            .collect();
        // nop, copy-in, add, copy-out, endpgm.
        assert_eq!(insts.len(), 5);
        assert_eq!(insts[1].opcode, Opcode::Copy);
        assert_eq!(insts[3].opcode, Opcode::Copy);
        // The add now works on a virtual register.
        assert!(insts[2].registers().all(|(register, _)| matches!(
            register,
            OperandRegister::Virtual(_)
        )));
        // The copies bracket with the physical register.
        assert!(matches!(
            insts[1].operands[1],
            MachineOperand::Register {
                register: OperandRegister::Physical(Register::Sgpr(10)),
                is_def: false,
            }
        ));
    }

    #[test]
    fn intrinsic_stand_ins_flow_in() {
        let mut function = MachineFunction::new("k".to_owned(), true);
        let block = function.create_block();
        let stand_in = function.create_vreg(RegisterClass::Sgpr32);
        let out = function.create_vreg(RegisterClass::Sgpr32);
        function.push_inst(
            block,
            MachineInst::new(
                Opcode::Copy,
                vec![
                    MachineOperand::def_virt(out),
                    MachineOperand::use_virt(stand_in),
                ],
            ),
        );
        function.push_inst(
            block,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );

        let mut access = AccessSet::default();
        access
            .phys_vregs
            .insert(stand_in, (Register::Sgpr(4), RegisterClass::Sgpr32));

        virtualize(&mut function, &access).expect("Always valid");

        let opcodes: Vec<Opcode> = function
            .instructions()
            .map(|(_, inst)| inst.opcode)
            .collect();
        // copy-in from s4, the original copy, endpgm; no copy-out.
        assert_eq!(opcodes, vec![Opcode::Copy, Opcode::Copy, Opcode::SEndpgm]);
    }
}
