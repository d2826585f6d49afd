//!
//! The instruction opcode table of the supported GPU ISA subset.
//!

///
/// The machine-code encoding family of an instruction.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Format {
    /// Scalar two-operand ALU.
    Sop2,
    /// Scalar one-operand ALU.
    Sop1,
    /// Scalar ALU with a 16-bit immediate.
    Sopk,
    /// Scalar compare, writing SCC.
    Sopc,
    /// Scalar program control with a 16-bit immediate.
    Sopp,
    /// Scalar memory, 64-bit encoding.
    Smem,
    /// Vector one-operand ALU.
    Vop1,
    /// Vector two-operand ALU.
    Vop2,
    /// Flat memory access, 64-bit encoding.
    Flat,
    /// A pseudo instruction that never reaches the encoder.
    Pseudo,
}

///
/// An instruction opcode.
///
/// The subset covers the scalar ALU, scalar memory, program control, a small
/// vector ALU slice, and flat memory: enough to express the kernels this
/// system lifts and the instrumentation sequences it injects. Pseudo opcodes
/// exist only inside machine IR and are expanded before encoding.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Opcode {
    // SOP2
    SAddU32,
    SSubU32,
    SAddcU32,
    SCselectB32,
    SCselectB64,
    SAndB32,
    SAndB64,
    SOrB32,
    SOrB64,
    SXorB32,
    SXorB64,
    SLshlB32,
    SMulI32,
    // SOP1
    SMovB32,
    SMovB64,
    SNotB64,
    SGetpcB64,
    SSetpcB64,
    SSwappcB64,
    SAndSaveexecB64,
    SOrSaveexecB64,
    // SOPK
    SMovkI32,
    // SOPC
    SCmpEqI32,
    SCmpLgI32,
    SCmpEqU32,
    SCmpLgU32,
    SCmpEqU64,
    SCmpLgU64,
    // SOPP
    SNop,
    SEndpgm,
    SBranch,
    SCbranchScc0,
    SCbranchScc1,
    SCbranchVccz,
    SCbranchVccnz,
    SCbranchExecz,
    SCbranchExecnz,
    SBarrier,
    SWaitcnt,
    // SMEM
    SLoadDword,
    SLoadDwordx2,
    SLoadDwordx4,
    SStoreDword,
    SStoreDwordx2,
    SAtomicAdd,
    // VOP1
    VNop,
    VMovB32,
    VReadfirstlaneB32,
    // VOP2
    VLshlrevB32,
    VAndB32,
    VOrB32,
    VXorB32,
    VAddU32,
    VSubU32,
    VReadlaneB32,
    VWritelaneB32,
    // FLAT
    FlatLoadDword,
    FlatLoadDwordx2,
    FlatStoreDword,
    FlatStoreDwordx2,
    // Pseudo
    /// A register-to-register copy, expanded to `s_mov`/`v_mov` after
    /// register allocation.
    Copy,
    /// An inline-asm placeholder carrying an index into the lowering
    /// side table. Survives instruction selection untouched.
    InlineAsm,
    /// Materializes the absolute address of a global symbol into an SGPR
    /// pair; expanded to a `s_getpc`/`s_add`/`s_addc` sequence with
    /// relocations at emission.
    GlobalAddr,
}

///
/// Static properties of an opcode.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionDescription {
    /// The assembly mnemonic.
    pub mnemonic: &'static str,
    /// The encoding family.
    pub format: Format,
    /// The opcode field value inside the encoding family.
    pub op: u16,
    /// Whether the instruction is a direct or indirect branch.
    pub is_branch: bool,
    /// Whether the branch is conditional.
    pub is_conditional: bool,
    /// Whether the instruction terminates a basic block.
    pub is_terminator: bool,
    /// Whether the instruction writes SCC.
    pub defs_scc: bool,
    /// Whether the instruction reads SCC.
    pub uses_scc: bool,
    /// Whether the instruction writes the EXEC mask.
    pub defs_exec: bool,
    /// Whether the instruction loads from memory.
    pub is_load: bool,
    /// Whether the instruction stores to memory.
    pub is_store: bool,
    /// The number of 32-bit slots of the destination operand, if any.
    pub dest_slots: u16,
}

/// A terse constructor keeps the table below readable.
const fn desc(
    mnemonic: &'static str,
    format: Format,
    op: u16,
    dest_slots: u16,
) -> InstructionDescription {
    InstructionDescription {
        mnemonic,
        format,
        op,
        is_branch: false,
        is_conditional: false,
        is_terminator: false,
        defs_scc: false,
        uses_scc: false,
        defs_exec: false,
        is_load: false,
        is_store: false,
        dest_slots,
    }
}

const fn scc_def(mut d: InstructionDescription) -> InstructionDescription {
    d.defs_scc = true;
    d
}

const fn scc_use(mut d: InstructionDescription) -> InstructionDescription {
    d.uses_scc = true;
    d
}

const fn branch(mut d: InstructionDescription, conditional: bool) -> InstructionDescription {
    d.is_branch = true;
    d.is_conditional = conditional;
    d.is_terminator = true;
    d
}

const fn terminator(mut d: InstructionDescription) -> InstructionDescription {
    d.is_terminator = true;
    d
}

const fn exec_def(mut d: InstructionDescription) -> InstructionDescription {
    d.defs_exec = true;
    d
}

const fn load(mut d: InstructionDescription) -> InstructionDescription {
    d.is_load = true;
    d
}

const fn store(mut d: InstructionDescription) -> InstructionDescription {
    d.is_store = true;
    d
}

impl Opcode {
    ///
    /// Returns the static description of this opcode.
    ///
    pub const fn description(&self) -> InstructionDescription {
        use Format::*;

        match self {
            Opcode::SAddU32 => scc_def(desc("s_add_u32", Sop2, 0, 1)),
            Opcode::SSubU32 => scc_def(desc("s_sub_u32", Sop2, 1, 1)),
            Opcode::SAddcU32 => scc_use(scc_def(desc("s_addc_u32", Sop2, 4, 1))),
            Opcode::SCselectB32 => scc_use(desc("s_cselect_b32", Sop2, 10, 1)),
            Opcode::SCselectB64 => scc_use(desc("s_cselect_b64", Sop2, 11, 2)),
            Opcode::SAndB32 => scc_def(desc("s_and_b32", Sop2, 12, 1)),
            Opcode::SAndB64 => scc_def(desc("s_and_b64", Sop2, 13, 2)),
            Opcode::SOrB32 => scc_def(desc("s_or_b32", Sop2, 14, 1)),
            Opcode::SOrB64 => scc_def(desc("s_or_b64", Sop2, 15, 2)),
            Opcode::SXorB32 => scc_def(desc("s_xor_b32", Sop2, 16, 1)),
            Opcode::SXorB64 => scc_def(desc("s_xor_b64", Sop2, 17, 2)),
            Opcode::SLshlB32 => scc_def(desc("s_lshl_b32", Sop2, 28, 1)),
            Opcode::SMulI32 => desc("s_mul_i32", Sop2, 36, 1),

            Opcode::SMovB32 => desc("s_mov_b32", Sop1, 0, 1),
            Opcode::SMovB64 => desc("s_mov_b64", Sop1, 1, 2),
            Opcode::SNotB64 => scc_def(desc("s_not_b64", Sop1, 5, 2)),
            Opcode::SGetpcB64 => desc("s_getpc_b64", Sop1, 28, 2),
            Opcode::SSetpcB64 => terminator(desc("s_setpc_b64", Sop1, 29, 0)),
            Opcode::SSwappcB64 => desc("s_swappc_b64", Sop1, 30, 2),
            Opcode::SAndSaveexecB64 => exec_def(scc_def(desc("s_and_saveexec_b64", Sop1, 32, 2))),
            Opcode::SOrSaveexecB64 => exec_def(scc_def(desc("s_or_saveexec_b64", Sop1, 33, 2))),

            Opcode::SMovkI32 => desc("s_movk_i32", Sopk, 0, 1),

            Opcode::SCmpEqI32 => scc_def(desc("s_cmp_eq_i32", Sopc, 0, 0)),
            Opcode::SCmpLgI32 => scc_def(desc("s_cmp_lg_i32", Sopc, 1, 0)),
            Opcode::SCmpEqU32 => scc_def(desc("s_cmp_eq_u32", Sopc, 6, 0)),
            Opcode::SCmpLgU32 => scc_def(desc("s_cmp_lg_u32", Sopc, 7, 0)),
            Opcode::SCmpEqU64 => scc_def(desc("s_cmp_eq_u64", Sopc, 18, 0)),
            Opcode::SCmpLgU64 => scc_def(desc("s_cmp_lg_u64", Sopc, 19, 0)),

            Opcode::SNop => desc("s_nop", Sopp, 0, 0),
            Opcode::SEndpgm => terminator(desc("s_endpgm", Sopp, 1, 0)),
            Opcode::SBranch => branch(desc("s_branch", Sopp, 2, 0), false),
            Opcode::SCbranchScc0 => scc_use(branch(desc("s_cbranch_scc0", Sopp, 4, 0), true)),
            Opcode::SCbranchScc1 => scc_use(branch(desc("s_cbranch_scc1", Sopp, 5, 0), true)),
            Opcode::SCbranchVccz => branch(desc("s_cbranch_vccz", Sopp, 6, 0), true),
            Opcode::SCbranchVccnz => branch(desc("s_cbranch_vccnz", Sopp, 7, 0), true),
            Opcode::SCbranchExecz => branch(desc("s_cbranch_execz", Sopp, 8, 0), true),
            Opcode::SCbranchExecnz => branch(desc("s_cbranch_execnz", Sopp, 9, 0), true),
            Opcode::SBarrier => desc("s_barrier", Sopp, 10, 0),
            Opcode::SWaitcnt => desc("s_waitcnt", Sopp, 12, 0),

            Opcode::SLoadDword => load(desc("s_load_dword", Smem, 0, 1)),
            Opcode::SLoadDwordx2 => load(desc("s_load_dwordx2", Smem, 1, 2)),
            Opcode::SLoadDwordx4 => load(desc("s_load_dwordx4", Smem, 2, 4)),
            Opcode::SStoreDword => store(desc("s_store_dword", Smem, 16, 0)),
            Opcode::SStoreDwordx2 => store(desc("s_store_dwordx2", Smem, 17, 0)),
            Opcode::SAtomicAdd => store(load(desc("s_atomic_add", Smem, 66, 1))),

            Opcode::VNop => desc("v_nop", Vop1, 0, 0),
            Opcode::VMovB32 => desc("v_mov_b32", Vop1, 1, 1),
            Opcode::VReadfirstlaneB32 => desc("v_readfirstlane_b32", Vop1, 2, 1),

            Opcode::VLshlrevB32 => desc("v_lshlrev_b32", Vop2, 16, 1),
            Opcode::VAndB32 => desc("v_and_b32", Vop2, 19, 1),
            Opcode::VOrB32 => desc("v_or_b32", Vop2, 20, 1),
            Opcode::VXorB32 => desc("v_xor_b32", Vop2, 21, 1),
            Opcode::VAddU32 => desc("v_add_u32", Vop2, 52, 1),
            Opcode::VSubU32 => desc("v_sub_u32", Vop2, 53, 1),
            Opcode::VReadlaneB32 => desc("v_readlane_b32", Vop2, 60, 1),
            Opcode::VWritelaneB32 => desc("v_writelane_b32", Vop2, 61, 1),

            Opcode::FlatLoadDword => load(desc("flat_load_dword", Flat, 20, 1)),
            Opcode::FlatLoadDwordx2 => load(desc("flat_load_dwordx2", Flat, 21, 2)),
            Opcode::FlatStoreDword => store(desc("flat_store_dword", Flat, 24, 0)),
            Opcode::FlatStoreDwordx2 => store(desc("flat_store_dwordx2", Flat, 25, 0)),

            Opcode::Copy => desc("COPY", Pseudo, 0, 1),
            Opcode::InlineAsm => desc("INLINE_ASM", Pseudo, 1, 0),
            Opcode::GlobalAddr => desc("GLOBAL_ADDR", Pseudo, 2, 2),
        }
    }

    ///
    /// Looks up the opcode for an encoding-family opcode field value.
    ///
    pub fn from_fields(format: Format, op: u16) -> Option<Self> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|opcode| {
                let description = opcode.description();
                description.format == format && description.op == op
            })
    }

    ///
    /// The assembly mnemonic.
    ///
    pub fn mnemonic(&self) -> &'static str {
        self.description().mnemonic
    }

    ///
    /// Whether the instruction is an unconditional or conditional direct
    /// branch with a PC-relative 16-bit displacement.
    ///
    pub fn is_direct_branch(&self) -> bool {
        let description = self.description();
        description.is_branch && description.format == Format::Sopp
    }
}

/// Every opcode, in declaration order. Drives reverse lookup and exhaustive
/// encoder tests.
pub const ALL_OPCODES: &[Opcode] = &[
    Opcode::SAddU32,
    Opcode::SSubU32,
    Opcode::SAddcU32,
    Opcode::SCselectB32,
    Opcode::SCselectB64,
    Opcode::SAndB32,
    Opcode::SAndB64,
    Opcode::SOrB32,
    Opcode::SOrB64,
    Opcode::SXorB32,
    Opcode::SXorB64,
    Opcode::SLshlB32,
    Opcode::SMulI32,
    Opcode::SMovB32,
    Opcode::SMovB64,
    Opcode::SNotB64,
    Opcode::SGetpcB64,
    Opcode::SSetpcB64,
    Opcode::SSwappcB64,
    Opcode::SAndSaveexecB64,
    Opcode::SOrSaveexecB64,
    Opcode::SMovkI32,
    Opcode::SCmpEqI32,
    Opcode::SCmpLgI32,
    Opcode::SCmpEqU32,
    Opcode::SCmpLgU32,
    Opcode::SCmpEqU64,
    Opcode::SCmpLgU64,
    Opcode::SNop,
    Opcode::SEndpgm,
    Opcode::SBranch,
    Opcode::SCbranchScc0,
    Opcode::SCbranchScc1,
    Opcode::SCbranchVccz,
    Opcode::SCbranchVccnz,
    Opcode::SCbranchExecz,
    Opcode::SCbranchExecnz,
    Opcode::SBarrier,
    Opcode::SWaitcnt,
    Opcode::SLoadDword,
    Opcode::SLoadDwordx2,
    Opcode::SLoadDwordx4,
    Opcode::SStoreDword,
    Opcode::SStoreDwordx2,
    Opcode::SAtomicAdd,
    Opcode::VNop,
    Opcode::VMovB32,
    Opcode::VReadfirstlaneB32,
    Opcode::VLshlrevB32,
    Opcode::VAndB32,
    Opcode::VOrB32,
    Opcode::VXorB32,
    Opcode::VAddU32,
    Opcode::VSubU32,
    Opcode::VReadlaneB32,
    Opcode::VWritelaneB32,
    Opcode::FlatLoadDword,
    Opcode::FlatLoadDwordx2,
    Opcode::FlatStoreDword,
    Opcode::FlatStoreDwordx2,
    Opcode::Copy,
    Opcode::InlineAsm,
    Opcode::GlobalAddr,
];

#[cfg(test)]
mod tests {
    use super::ALL_OPCODES;
    use super::Format;
    use super::Opcode;

    #[test]
    fn field_lookup_round_trip() {
        for opcode in ALL_OPCODES.iter().copied() {
            let description = opcode.description();
            if description.format == Format::Pseudo {
                continue;
            }
            assert_eq!(
                Opcode::from_fields(description.format, description.op),
                Some(opcode),
                "ambiguous encoding for {}",
                description.mnemonic
            );
        }
    }

    #[test]
    fn branch_classification() {
        assert!(Opcode::SBranch.is_direct_branch());
        assert!(Opcode::SCbranchScc1.is_direct_branch());
        assert!(!Opcode::SSetpcB64.is_direct_branch());
        assert!(Opcode::SSetpcB64.description().is_terminator);
        assert!(!Opcode::SEndpgm.is_direct_branch());
    }
}
