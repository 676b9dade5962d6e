// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning.
//!
//! The job store and the resource phase authority are shared between the
//! dispatcher task, blocking engine threads and callers. A panic inside an
//! engine callback must not take the whole queue down with it, so every
//! `std::sync` lock in the crate is acquired through these helpers, which log
//! the poisoning and hand back the guard anyway.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "genstudio::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "genstudio::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "genstudio::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned; recovering."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(vec![1u32]);
        resilient_write(&lock).push(2);
        assert_eq!(*resilient_read(&lock), vec![1, 2]);
    }

    #[test]
    fn test_resilient_read_poisoned() {
        let lock = Arc::new(RwLock::new(7));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert_eq!(*resilient_read(&lock), 7);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(String::from("queued")));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison mutex");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        guard.push_str("-recovered");
        assert_eq!(guard.as_str(), "queued-recovered");
    }
}
