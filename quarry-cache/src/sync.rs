//! Lock helpers.
//!
//! Observer and query function panics are caught before they can poison a
//! lock, but a poisoned guard is still recovered rather than propagated so a
//! single bad callback never takes down every query sharing the cache.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = what, "Lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<'a, T>(rwlock: &'a RwLock<T>, what: &'static str) -> RwLockReadGuard<'a, T> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = what, "Lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write<'a, T>(rwlock: &'a RwLock<T>, what: &'static str) -> RwLockWriteGuard<'a, T> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = what, "Lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let mutex = Arc::new(Mutex::new(5));
        let poisoner = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex, "test"), 5);
    }

    #[test]
    fn test_poisoned_rwlock_is_recovered() {
        let rwlock = Arc::new(RwLock::new(vec![1]));
        let poisoner = Arc::clone(&rwlock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison");
        })
        .join();

        write(&rwlock, "test").push(2);
        assert_eq!(*read(&rwlock, "test"), vec![1, 2]);
    }
}
