//!
//! The error taxonomy of the instrumentation core.
//!

use lyra_backend::TargetError;
use lyra_backend::mc::DecodeError;
use lyra_runtime::RuntimeError;

///
/// The source location an error originated at.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// The source file.
    pub file: &'static str,
    /// The line inside the file.
    pub line: u32,
}

impl Location {
    ///
    /// Captures the caller's location.
    ///
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

///
/// The typed error every public operation of the core returns.
///
/// Every variant carries the source location of its origin; the underlying
/// cause is preserved where one exists. Errors are never swallowed inside
/// the core: every fallible operation returns them upward and has no side
/// effects on failure.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying GPU runtime returned failure.
    #[error("[{location}] runtime error (status {status:#x}): {source}", status = .source.status())]
    Runtime {
        /// The runtime error, carrying its status code.
        source: RuntimeError,
        /// The origin of the error.
        location: Location,
    },
    /// The backend has no description for the requested ISA or feature.
    #[error("[{location}] target error: {source}")]
    Target {
        /// The backend target error.
        source: TargetError,
        /// The origin of the error.
        location: Location,
    },
    /// An instruction byte sequence could not be disassembled.
    #[error("[{location}] decode error in `{symbol}`: {source}")]
    Decode {
        /// The symbol being disassembled.
        symbol: String,
        /// The decoder error, carrying the offending offset.
        source: DecodeError,
        /// The origin of the error.
        location: Location,
    },
    /// Lifting failed.
    #[error("[{location}] lift error: {reason}")]
    Lift {
        /// What failed.
        reason: String,
        /// The origin of the error.
        location: Location,
    },
    /// An intrinsic could not be lowered.
    #[error("[{location}] lowering error: {reason}")]
    Lowering {
        /// What failed.
        reason: String,
        /// The origin of the error.
        location: Location,
    },
    /// The backend codegen pipeline or printer reported failure.
    #[error("[{location}] codegen error: {reason}")]
    Codegen {
        /// What failed.
        reason: String,
        /// The origin of the error.
        location: Location,
    },
    /// Creating, loading into, or freezing an executable failed.
    #[error("[{location}] loader error: {reason}")]
    Loader {
        /// What failed.
        reason: String,
        /// The origin of the error.
        location: Location,
    },
    /// A queried code object or symbol has been invalidated.
    #[error("[{location}] cache miss: {what}")]
    CacheMiss {
        /// What was queried.
        what: String,
        /// The origin of the error.
        location: Location,
    },
}

impl Error {
    ///
    /// A runtime error at the caller's location.
    ///
    #[track_caller]
    pub fn runtime(source: RuntimeError) -> Self {
        Error::Runtime {
            source,
            location: Location::caller(),
        }
    }

    ///
    /// A target error at the caller's location.
    ///
    #[track_caller]
    pub fn target(source: TargetError) -> Self {
        Error::Target {
            source,
            location: Location::caller(),
        }
    }

    ///
    /// A decode error at the caller's location.
    ///
    #[track_caller]
    pub fn decode(symbol: impl ToString, source: DecodeError) -> Self {
        Error::Decode {
            symbol: symbol.to_string(),
            source,
            location: Location::caller(),
        }
    }

    ///
    /// A lift error at the caller's location.
    ///
    #[track_caller]
    pub fn lift(reason: impl ToString) -> Self {
        Error::Lift {
            reason: reason.to_string(),
            location: Location::caller(),
        }
    }

    ///
    /// A lowering error at the caller's location.
    ///
    #[track_caller]
    pub fn lowering(reason: impl ToString) -> Self {
        Error::Lowering {
            reason: reason.to_string(),
            location: Location::caller(),
        }
    }

    ///
    /// A codegen error at the caller's location.
    ///
    #[track_caller]
    pub fn codegen(reason: impl ToString) -> Self {
        Error::Codegen {
            reason: reason.to_string(),
            location: Location::caller(),
        }
    }

    ///
    /// A loader error at the caller's location.
    ///
    #[track_caller]
    pub fn loader(reason: impl ToString) -> Self {
        Error::Loader {
            reason: reason.to_string(),
            location: Location::caller(),
        }
    }

    ///
    /// A cache miss at the caller's location.
    ///
    #[track_caller]
    pub fn cache_miss(what: impl ToString) -> Self {
        Error::CacheMiss {
            what: what.to_string(),
            location: Location::caller(),
        }
    }

    ///
    /// Whether this error is a cache miss.
    ///
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss { .. })
    }
}

/// The result type of every public operation of the core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errors_carry_their_origin() {
        let error = Error::lift("unreachable control flow");
        let message = error.to_string();
        assert!(message.contains("error.rs"), "{message}");
        assert!(message.contains("unreachable control flow"), "{message}");
    }

    #[test]
    fn runtime_errors_carry_the_status_code() {
        let error = Error::runtime(lyra_runtime::RuntimeError::Frozen);
        assert!(error.to_string().contains("0x1002"), "{error}");
    }
}
