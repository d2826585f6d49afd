//!
//! The default branch-target evaluator.
//!

use crate::mc::McInst;
use crate::mc::McOperand;

///
/// Evaluates the target of a direct branch.
///
/// Returns `Some(target)` when `inst` is a direct branch with a computable
/// destination, `None` otherwise (indirect branches, non-branches).
///
/// KNOWN DEFECT: the 16-bit displacement is scaled to bytes first and
/// sign-extended from the scaled 16-bit window afterwards, so displacements
/// whose scaled magnitude reaches 0x8000 bytes resolve to the wrong side of
/// the program counter. Kept for bug-compatibility with existing consumers;
/// use a corrected evaluator where accuracy matters.
///
pub fn evaluate_branch(inst: &McInst, pc: u64, size: u64) -> Option<u64> {
    if !inst.opcode.is_direct_branch() {
        return None;
    }
    let field = match inst.operands.first() {
        Some(McOperand::Immediate(value)) => *value as u16,
        _ => return None,
    };
    let scaled = field.wrapping_mul(4);
    let displacement = scaled as i16 as i64;
    Some((pc as i64 + size as i64 + displacement) as u64)
}

#[cfg(test)]
mod tests {
    use crate::mc::McInst;
    use crate::mc::McOperand;
    use crate::target::opcode::Opcode;

    use super::evaluate_branch;

    fn branch(simm16: i64) -> McInst {
        McInst::new(Opcode::SBranch, vec![McOperand::Immediate(simm16)])
    }

    #[test]
    fn short_displacements_resolve() {
        assert_eq!(evaluate_branch(&branch(0x0001), 0x1000, 4), Some(0x1008));
        assert_eq!(
            evaluate_branch(&branch(0xFFFF), 0x1000, 4),
            Some(0x1000),
            "-1 word lands on the branch itself"
        );
    }

    #[test]
    fn non_branches_do_not_resolve() {
        let inst = McInst::new(
            Opcode::SSetpcB64,
            vec![McOperand::Register(crate::target::Register::Sgpr(30))],
        );
        assert_eq!(evaluate_branch(&inst, 0x1000, 4), None);
    }

    #[test]
    fn wide_backward_displacement_exhibits_the_known_defect() {
        // -0x2001 words is -0x8004 bytes; the post-scale sign extension
        // wraps it to +0x7FFC.
        let wrong = evaluate_branch(&branch(0xDFFF), 0x10000, 4).expect("Is a branch");
        assert_eq!(wrong, 0x10000 + 4 + 0x7FFC);
    }
}
