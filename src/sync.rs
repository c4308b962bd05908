// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! A poisoned mutex means some thread panicked while holding it. For the
//! structures guarded here (queue, tracker, registry) stale data is
//! preferable to taking the whole server down, so we log and recover.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                "mutex was poisoned; recovering. A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
