//!
//! The GPU instruction-set-architecture identifier.
//!

///
/// The GPU instruction-set-architecture identifier.
///
/// Parsed from the runtime's full ISA name of the form
/// `amdgcn-amd-amdhsa--gfx908[:feature...]`. Only the `gfx9` generation is
/// understood by the backend; other names parse but report themselves as
/// unsupported.
///
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Isa {
    /// The processor name, e.g. `gfx908`.
    processor: String,
    /// The vendor component of the triple.
    vendor: String,
    /// The OS component of the triple.
    os: String,
}

///
/// The ISA name parsing error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IsaParseError {
    /// The name does not follow the `<arch>-<vendor>-<os>--<processor>` form.
    #[error("malformed ISA name `{0}`")]
    Malformed(String),
    /// The architecture component is not `amdgcn`.
    #[error("unexpected architecture `{0}` in ISA name")]
    Architecture(String),
}

impl Isa {
    /// The architecture component every supported ISA name carries.
    pub const ARCHITECTURE: &'static str = "amdgcn";

    ///
    /// Parses a full ISA name as reported by the runtime.
    ///
    pub fn from_name(name: &str) -> Result<Self, IsaParseError> {
        let (triple, processor) = name
            .split_once("--")
            .ok_or_else(|| IsaParseError::Malformed(name.to_owned()))?;
        let mut components = triple.split('-');
        let architecture = components
            .next()
            .ok_or_else(|| IsaParseError::Malformed(name.to_owned()))?;
        if architecture != Self::ARCHITECTURE {
            return Err(IsaParseError::Architecture(architecture.to_owned()));
        }
        let vendor = components
            .next()
            .ok_or_else(|| IsaParseError::Malformed(name.to_owned()))?;
        let os = components
            .next()
            .ok_or_else(|| IsaParseError::Malformed(name.to_owned()))?;

        let processor = processor
            .split(':')
            .next()
            .expect("Split always yields at least one element")
            .to_owned();
        if processor.is_empty() {
            return Err(IsaParseError::Malformed(name.to_owned()));
        }

        Ok(Self {
            processor,
            vendor: vendor.to_owned(),
            os: os.to_owned(),
        })
    }

    ///
    /// A shortcut constructor for a bare processor name.
    ///
    pub fn from_processor(processor: &str) -> Self {
        Self {
            processor: processor.to_owned(),
            vendor: "amd".to_owned(),
            os: "amdhsa".to_owned(),
        }
    }

    ///
    /// Returns the processor name, e.g. `gfx908`.
    ///
    pub fn processor(&self) -> &str {
        self.processor.as_str()
    }

    ///
    /// Whether the backend carries a target description for this ISA.
    ///
    pub fn is_supported(&self) -> bool {
        self.processor.starts_with("gfx9")
    }

    ///
    /// The wavefront width in lanes.
    ///
    pub fn wavefront_size(&self) -> u32 {
        64
    }

    ///
    /// The number of addressable scalar registers.
    ///
    pub fn addressable_sgpr_count(&self) -> u16 {
        102
    }

    ///
    /// The number of addressable vector registers.
    ///
    pub fn addressable_vgpr_count(&self) -> u16 {
        256
    }
}

impl std::fmt::Display for Isa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}--{}",
            Self::ARCHITECTURE,
            self.vendor,
            self.os,
            self.processor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Isa;
    use super::IsaParseError;

    #[test]
    fn parses_full_name() {
        let isa = Isa::from_name("amdgcn-amd-amdhsa--gfx908:sramecc+:xnack-")
            .expect("Always valid");
        assert_eq!(isa.processor(), "gfx908");
        assert!(isa.is_supported());
        assert_eq!(isa.to_string(), "amdgcn-amd-amdhsa--gfx908");
    }

    #[test]
    fn rejects_foreign_architecture() {
        let result = Isa::from_name("spirv64-amd-amdhsa--generic");
        assert_eq!(
            result,
            Err(IsaParseError::Architecture("spirv64".to_owned()))
        );
    }

    #[test]
    fn rejects_missing_processor() {
        assert!(Isa::from_name("amdgcn-amd-amdhsa").is_err());
    }
}
