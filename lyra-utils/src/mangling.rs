//!
//! Hook-handle name mangling helpers.
//!

use crate::r#const::HOOK_HANDLE_PREFIX;

///
/// Returns the hook function name a shadow-pointer symbol refers to, or
/// `None` when the symbol is not a hook handle.
///
pub fn demangle_hook_handle(symbol_name: &str) -> Option<&str> {
    symbol_name.strip_prefix(HOOK_HANDLE_PREFIX)
}

///
/// Returns the shadow-pointer symbol name for a hook function.
///
pub fn mangle_hook_handle(hook_name: &str) -> String {
    format!("{HOOK_HANDLE_PREFIX}{hook_name}")
}

///
/// Strips template arguments from a demangled intrinsic name.
///
/// Intrinsic registry keys are demangled names without template arguments,
/// so `readReg<12>` and `readReg<34>` both resolve to the `readReg` entry.
///
pub fn intrinsic_base_name(demangled: &str) -> &str {
    match demangled.split_once('<') {
        Some((base, _)) => base,
        None => demangled,
    }
}

#[cfg(test)]
mod tests {
    use super::demangle_hook_handle;
    use super::intrinsic_base_name;
    use super::mangle_hook_handle;

    #[test]
    fn hook_handle_round_trip() {
        let mangled = mangle_hook_handle("record_branch");
        assert_eq!(demangle_hook_handle(mangled.as_str()), Some("record_branch"));
        assert_eq!(demangle_hook_handle("record_branch"), None);
    }

    #[test]
    fn intrinsic_template_arguments_are_stripped() {
        assert_eq!(intrinsic_base_name("readReg<12>"), "readReg");
        assert_eq!(intrinsic_base_name("sAtomicAdd"), "sAtomicAdd");
    }
}
