// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cycle-granularity time source. The bundle scheduler stamps run-queue
//! entries and paces stall emulation with the timestamp counter directly;
//! wall-clock time never enters the hot path.

//======================================================================================================================
// Imports
//======================================================================================================================

#[cfg(target_arch = "x86_64")]
use ::core::arch::x86_64::{
    _mm_pause,
    _rdtsc,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads the timestamp counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { _rdtsc() }
}

/// Spins until the timestamp counter reaches `deadline`.
#[cfg(target_arch = "x86_64")]
pub fn wait_until_tsc(deadline: u64) {
    while rdtsc() < deadline {
        unsafe { _mm_pause() };
    }
}

/// Spins for `cycles` timestamp-counter ticks.
#[cfg(target_arch = "x86_64")]
pub fn busy_wait_cycles(cycles: u64) {
    wait_until_tsc(rdtsc().wrapping_add(cycles))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        busy_wait_cycles,
        rdtsc,
    };

    /// Tests that the timestamp counter moves forward.
    #[test]
    fn tsc_advances() {
        let a: u64 = rdtsc();
        let b: u64 = rdtsc();
        assert!(b >= a);
    }

    /// Tests that a busy wait consumes at least the requested cycle budget.
    #[test]
    fn busy_wait_consumes_budget() {
        const BUDGET: u64 = 10_000;
        let start: u64 = rdtsc();
        busy_wait_cycles(BUDGET);
        assert!(rdtsc().wrapping_sub(start) >= BUDGET);
    }
}
