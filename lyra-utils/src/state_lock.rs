//!
//! Lock acquisition for component state.
//!

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

///
/// Acquisition of the mutex guarding one component's state.
///
/// Every component takes its lock exactly once, at a public entry point,
/// and never panics while holding it. A poisoned mutex therefore means the
/// process is already broken, and acquisition surfaces that as a panic
/// instead of threading an impossible error through every caller.
///
pub trait StateLock<T> {
    ///
    /// Takes the component lock at an entry-point boundary.
    ///
    fn acquire(&self) -> MutexGuard<'_, T>;
}

impl<T> StateLock<T> for Mutex<T> {
    fn acquire(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("component state is poisoned: {poisoned}"),
        }
    }
}

///
/// Acquisition of a reader-writer lock over shared component state, under
/// the same no-panic-while-held discipline.
///
pub trait SharedStateLock<T> {
    ///
    /// Takes the lock for reading.
    ///
    fn acquire_read(&self) -> RwLockReadGuard<'_, T>;

    ///
    /// Takes the lock for writing.
    ///
    fn acquire_write(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> SharedStateLock<T> for RwLock<T> {
    fn acquire_read(&self) -> RwLockReadGuard<'_, T> {
        match self.read() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("shared component state is poisoned: {poisoned}"),
        }
    }

    fn acquire_write(&self) -> RwLockWriteGuard<'_, T> {
        match self.write() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("shared component state is poisoned: {poisoned}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::RwLock;

    use super::SharedStateLock;
    use super::StateLock;

    #[test]
    fn acquisition_hands_out_working_guards() {
        let state = Mutex::new(1);
        *state.acquire() += 1;
        assert_eq!(*state.acquire(), 2);

        let shared = RwLock::new(vec![1]);
        shared.acquire_write().push(2);
        assert_eq!(shared.acquire_read().as_slice(), &[1, 2]);
    }
}
