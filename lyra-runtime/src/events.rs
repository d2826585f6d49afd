//!
//! Runtime event fan-out.
//!

use std::sync::Arc;
use std::sync::RwLock;

use lyra_utils::SharedStateLock;

use crate::handle::ExecutableHandle;
use crate::handle::LoadedCodeObjectHandle;

///
/// The callbacks the interception layer drives into the instrumentation
/// system.
///
/// Observers are invoked synchronously on the thread performing the
/// runtime operation and must not call back into the operation that is
/// firing.
///
pub trait RuntimeEventObserver: Send + Sync {
    ///
    /// A code object finished loading onto an agent.
    ///
    fn code_object_loaded(&self, _lco: LoadedCodeObjectHandle) {}

    ///
    /// An executable was frozen.
    ///
    fn executable_frozen(&self, _executable: ExecutableHandle) {}

    ///
    /// An executable is about to be destroyed; its handles are still
    /// valid for the duration of the callback.
    ///
    fn executable_destroyed(&self, _executable: ExecutableHandle) {}

    ///
    /// The application registered a device function under a shadow host
    /// pointer.
    ///
    fn function_registered(&self, _shadow_pointer: u64, _device_name: &str) {}
}

///
/// The observer registry.
///
#[derive(Default)]
pub struct RuntimeEvents {
    observers: RwLock<Vec<Arc<dyn RuntimeEventObserver>>>,
}

impl RuntimeEvents {
    ///
    /// A shortcut constructor.
    ///
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Registers an observer.
    ///
    pub fn register(&self, observer: Arc<dyn RuntimeEventObserver>) {
        self.observers.acquire_write().push(observer);
    }

    ///
    /// Removes every registered observer.
    ///
    pub fn clear(&self) {
        self.observers.acquire_write().clear();
    }

    ///
    /// Fires the code-object-loaded event.
    ///
    pub fn fire_code_object_loaded(&self, lco: LoadedCodeObjectHandle) {
        for observer in self.snapshot() {
            observer.code_object_loaded(lco);
        }
    }

    ///
    /// Fires the executable-frozen event.
    ///
    pub fn fire_executable_frozen(&self, executable: ExecutableHandle) {
        for observer in self.snapshot() {
            observer.executable_frozen(executable);
        }
    }

    ///
    /// Fires the executable-destroyed event.
    ///
    pub fn fire_executable_destroyed(&self, executable: ExecutableHandle) {
        for observer in self.snapshot() {
            observer.executable_destroyed(executable);
        }
    }

    ///
    /// Fires the function-registered event.
    ///
    pub fn fire_function_registered(&self, shadow_pointer: u64, device_name: &str) {
        for observer in self.snapshot() {
            observer.function_registered(shadow_pointer, device_name);
        }
    }

    /// Observers are snapshotted so a callback can register further
    /// observers without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn RuntimeEventObserver>> {
        self.observers.acquire_read().clone()
    }
}
