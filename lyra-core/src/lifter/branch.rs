//!
//! The corrected branch-target evaluator.
//!

use lyra_backend::mc::McInst;
use lyra_backend::mc::McOperand;

///
/// Evaluates the target of a direct branch.
///
/// Returns `Some(target)` if and only if `inst` is a direct branch with a
/// computable target; indirect branches and non-branches return `None`.
///
/// The backend's stock evaluator sign-extends the displacement after
/// scaling it to bytes, which wraps wide backward branches to the other
/// side of the program counter. This variant extends the raw 16-bit field
/// first and scales second.
///
pub fn evaluate_branch(inst: &McInst, pc: u64, size: u64) -> Option<u64> {
    if !inst.opcode.is_direct_branch() {
        return None;
    }
    let field = match inst.operands.first() {
        Some(McOperand::Immediate(value)) => *value as u16,
        _ => return None,
    };
    let displacement = (field as i16 as i64) * 4;
    Some((pc as i64 + size as i64 + displacement) as u64)
}

#[cfg(test)]
mod tests {
    use lyra_backend::mc::McInst;
    use lyra_backend::mc::McOperand;
    use lyra_backend::target::opcode::Opcode;

    use super::evaluate_branch;

    fn branch(field: i64) -> McInst {
        McInst::new(Opcode::SCbranchScc1, vec![McOperand::Immediate(field)])
    }

    #[test]
    fn forward_and_short_backward_agree_with_the_stock_evaluator() {
        for field in [0x0000_i64, 0x0001, 0x1FFF, 0xFFFF] {
            let inst = branch(field);
            assert_eq!(
                evaluate_branch(&inst, 0x4_0000, 4),
                lyra_backend::mc::evaluate_branch(&inst, 0x4_0000, 4),
            );
        }
    }

    #[test]
    fn wide_backward_branches_resolve_correctly() {
        // -0x2001 words, where the stock evaluator wraps forward.
        let inst = branch(0xDFFF);
        assert_eq!(evaluate_branch(&inst, 0x10000, 4), Some(0x10000 + 4 - 0x8004));
        assert_ne!(
            evaluate_branch(&inst, 0x10000, 4),
            lyra_backend::mc::evaluate_branch(&inst, 0x10000, 4),
        );
    }

    #[test]
    fn non_branches_do_not_resolve() {
        let inst = McInst::new(Opcode::SEndpgm, vec![McOperand::Immediate(0)]);
        assert_eq!(evaluate_branch(&inst, 0, 4), None);
    }
}
