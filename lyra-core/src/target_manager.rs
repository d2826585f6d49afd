//!
//! The target manager.
//!

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use lyra_backend::TargetDescription;
use lyra_backend::TargetMachine;
use lyra_utils::Isa;
use lyra_utils::StateLock;

use crate::error::Error;
use crate::error::Result;

/// The optimization level target machines are minted with.
const DEFAULT_OPTIMIZATION_LEVEL: u8 = 2;

///
/// The target manager: a lazy map from ISA to the bundle of backend
/// description objects, one bundle per ISA for the process lifetime.
///
/// Description bundles are shared by reference; target machines are minted
/// fresh per request and owned by their consumer.
///
#[derive(Debug, Default)]
pub struct TargetManager {
    descriptions: Mutex<BTreeMap<Isa, Arc<TargetDescription>>>,
}

impl TargetManager {
    ///
    /// A shortcut constructor.
    ///
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// The description bundle for an ISA, constructed on first request.
    ///
    pub fn description(&self, isa: &Isa) -> Result<Arc<TargetDescription>> {
        let mut descriptions = self.descriptions.acquire();
        if let Some(description) = descriptions.get(isa) {
            return Ok(description.clone());
        }
        let description =
            Arc::new(TargetDescription::new(isa.clone()).map_err(Error::target)?);
        descriptions.insert(isa.clone(), description.clone());
        Ok(description)
    }

    ///
    /// Mints a fresh target machine for an ISA; the caller owns it.
    ///
    pub fn create_target_machine(&self, isa: &Isa) -> Result<TargetMachine> {
        let description = self.description(isa)?;
        Ok(TargetMachine::new(
            (*description).clone(),
            DEFAULT_OPTIMIZATION_LEVEL,
        ))
    }
}

#[cfg(test)]
mod tests {
    use lyra_utils::Isa;

    use super::TargetManager;

    #[test]
    fn descriptions_are_shared() {
        let manager = TargetManager::new();
        let isa = Isa::from_processor("gfx908");
        let first = manager.description(&isa).expect("Always valid");
        let second = manager.description(&isa).expect("Always valid");
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unsupported_isa_is_a_target_error() {
        let manager = TargetManager::new();
        let error = manager
            .description(&Isa::from_processor("gfx1030"))
            .expect_err("Must fail");
        assert!(matches!(error, crate::error::Error::Target { .. }));
    }
}
