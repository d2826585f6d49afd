//!
//! Target descriptions for the supported GPU ISAs.
//!

pub mod opcode;
pub mod register;

use lyra_utils::Isa;

pub use self::register::Register;
pub use self::register::RegisterClass;
pub use self::register::SourceOperand;

///
/// The target-construction error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// The ISA name could not be parsed.
    #[error("ISA name: {0}")]
    IsaName(#[from] lyra_utils::IsaParseError),
    /// The ISA parses but the backend has no description for it.
    #[error("no target description for ISA `{0}`")]
    Unsupported(Isa),
}

///
/// The scalar/vector register file description of one ISA.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    /// The number of addressable SGPRs.
    pub sgpr_count: u16,
    /// The number of addressable VGPRs.
    pub vgpr_count: u16,
}

impl RegisterInfo {
    ///
    /// The physical registers a class allocates from, in allocation order.
    ///
    /// 64-bit scalar classes allocate even-aligned pairs and yield the low
    /// register of each pair.
    ///
    pub fn allocation_order(&self, class: RegisterClass) -> Vec<Register> {
        match class {
            RegisterClass::Sgpr32 => (0..self.sgpr_count).map(Register::Sgpr).collect(),
            RegisterClass::Sgpr64 => (0..self.sgpr_count - 1)
                .step_by(2)
                .map(Register::Sgpr)
                .collect(),
            RegisterClass::Vgpr32 => (0..self.vgpr_count).map(Register::Vgpr).collect(),
        }
    }

    ///
    /// Whether a physical register may hold a value of the given class.
    ///
    pub fn is_member(&self, register: Register, class: RegisterClass) -> bool {
        match (register, class) {
            (Register::Sgpr(index), RegisterClass::Sgpr32) => index < self.sgpr_count,
            (Register::Sgpr(index), RegisterClass::Sgpr64) => {
                index % 2 == 0 && index + 1 < self.sgpr_count
            }
            (Register::Vgpr(index), RegisterClass::Vgpr32) => index < self.vgpr_count,
            _ => false,
        }
    }
}

///
/// Per-ISA feature switches.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtargetInfo {
    /// The wavefront width in lanes.
    pub wavefront_size: u32,
    /// Whether flat-scratch addressing is available.
    pub has_flat_scratch: bool,
    /// The scratch (private segment) allocation granularity in bytes.
    pub scratch_alignment: u32,
}

///
/// The bundle of backend description objects for one ISA.
///
/// Constructed once per ISA by the target manager and shared by reference
/// afterwards.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescription {
    /// The described ISA.
    isa: Isa,
    /// The register file description.
    register_info: RegisterInfo,
    /// The subtarget feature switches.
    subtarget_info: SubtargetInfo,
}

impl TargetDescription {
    ///
    /// Builds the description bundle for an ISA.
    ///
    /// Fails when the backend does not understand the ISA.
    ///
    pub fn new(isa: Isa) -> Result<Self, TargetError> {
        if !isa.is_supported() {
            return Err(TargetError::Unsupported(isa));
        }

        let register_info = RegisterInfo {
            sgpr_count: isa.addressable_sgpr_count(),
            vgpr_count: isa.addressable_vgpr_count(),
        };
        let subtarget_info = SubtargetInfo {
            wavefront_size: isa.wavefront_size(),
            has_flat_scratch: true,
            scratch_alignment: 256,
        };

        Ok(Self {
            isa,
            register_info,
            subtarget_info,
        })
    }

    ///
    /// Returns the described ISA.
    ///
    pub fn isa(&self) -> &Isa {
        &self.isa
    }

    ///
    /// Returns the register file description.
    ///
    pub fn register_info(&self) -> &RegisterInfo {
        &self.register_info
    }

    ///
    /// Returns the subtarget feature switches.
    ///
    pub fn subtarget_info(&self) -> &SubtargetInfo {
        &self.subtarget_info
    }
}

///
/// A target-machine handle configured for one code generation run.
///
/// Minted by the target manager; owned by its consumer, unlike the shared
/// `TargetDescription`.
///
#[derive(Debug, Clone)]
pub struct TargetMachine {
    /// The underlying target description.
    description: TargetDescription,
    /// The optimization level of the IR pipeline, 0 to 2.
    optimization_level: u8,
}

impl TargetMachine {
    ///
    /// A shortcut constructor.
    ///
    pub fn new(description: TargetDescription, optimization_level: u8) -> Self {
        Self {
            description,
            optimization_level,
        }
    }

    ///
    /// Returns the underlying target description.
    ///
    pub fn description(&self) -> &TargetDescription {
        &self.description
    }

    ///
    /// Returns the target ISA.
    ///
    pub fn isa(&self) -> &Isa {
        self.description.isa()
    }

    ///
    /// Returns the optimization level of the IR pipeline.
    ///
    pub fn optimization_level(&self) -> u8 {
        self.optimization_level
    }
}

#[cfg(test)]
mod tests {
    use lyra_utils::Isa;

    use super::Register;
    use super::RegisterClass;
    use super::TargetDescription;
    use super::TargetError;

    #[test]
    fn rejects_unsupported_processor() {
        let isa = Isa::from_processor("gfx1100");
        assert_eq!(
            TargetDescription::new(isa.clone()),
            Err(TargetError::Unsupported(isa))
        );
    }

    #[test]
    fn sgpr64_pairs_are_even_aligned() {
        let description =
            TargetDescription::new(Isa::from_processor("gfx908")).expect("Always valid");
        let order = description
            .register_info()
            .allocation_order(RegisterClass::Sgpr64);
        assert!(order.iter().all(|register| match register {
            Register::Sgpr(index) => index % 2 == 0,
            _ => false,
        }));
        assert!(description
            .register_info()
            .is_member(Register::Sgpr(4), RegisterClass::Sgpr64));
        assert!(!description
            .register_info()
            .is_member(Register::Sgpr(5), RegisterClass::Sgpr64));
    }
}
