// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::core::{
    hint,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A raw test-and-set spinlock.
///
/// The worker lock guards the run queue and overflow list. It is deliberately
/// a raw lock rather than a guard-returning one: the dismantle path comes in
/// two flavors, one that acquires the lock and one that asserts it is already
/// held by the caller, and the latter cannot be expressed with RAII guards.
pub struct SpinLock {
    locked: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Peeks whether the lock is held.
    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Panics unless the lock is held. Callers of `_nolock` entry points are
    /// required to hold the worker lock; this is the enforcement point.
    pub fn assert_held(&self) {
        assert!(self.is_held(), "worker lock must be held by the caller");
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
