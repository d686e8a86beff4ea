// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-CPU worker. A worker is the execution context one CPU's scheduling
//! revolves around: its run queue, its lock, its statistics, and the bundle
//! of co-resident user threads the switching handler rotates through.
//!
//! Everything on a worker is mutated only from the worker's own OS thread;
//! the handful of atomically published fields (run-queue indices, queue
//! pointers) exist for the benefit of external observers, not for
//! cross-worker mutation.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::{
        run_queue::{
            QPtrs,
            RunQueue,
        },
        spin_lock::SpinLock,
    },
    runtime::{
        fail::Fail,
        thread::ThreadRef,
    },
    scheduler::bundle::Bundle,
};
use ::core::{
    cell::Cell,
    ptr,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-worker counters. Monotonic, owned by the worker, summed across
/// workers by aggregate readers.
#[derive(Default)]
pub struct WorkerStats {
    /// Handler invocations that performed a switch.
    pub lame_switches: u64,
    /// Handler invocations turned away by the gate (disabled or too few
    /// members).
    pub lame_skips: u64,
    /// Threads diverted to the overflow list during a spill.
    pub rq_overflows: u64,
}

/// A per-CPU worker.
pub struct Worker {
    index: usize,
    /// Protects the run queue and overflow list.
    pub lock: SpinLock,
    /// Ordinary scheduler queue that dismantled bundle members return to.
    pub rq: RunQueue,
    /// Externally observable queue pointers.
    pub q_ptrs: QPtrs,
    /// Per-worker counters.
    pub stats: WorkerStats,
    bundle: Bundle,
    self_thread: Option<ThreadRef>,
    preempt_cnt: u32,
    cede_requested: bool,
    yield_requested: bool,
}

//======================================================================================================================
// Thread-Local State
//======================================================================================================================

thread_local! {
    /// The worker bound to this OS thread, read implicitly by the switching
    /// handler. Null until [bind_current] runs during worker startup.
    static CURRENT_WORKER: Cell<*mut Worker> = const { Cell::new(ptr::null_mut()) };
}

/// Binds `worker` as the calling OS thread's worker.
pub fn bind_current(worker: &mut Worker) {
    CURRENT_WORKER.with(|cell| cell.set(worker as *mut Worker));
}

/// Clears the calling OS thread's worker binding.
pub fn unbind_current() {
    CURRENT_WORKER.with(|cell| cell.set(ptr::null_mut()));
}

/// Returns the worker bound to the calling OS thread.
///
/// # Safety
///
/// The returned reference aliases whatever binding [bind_current]
/// established; the caller must be running on the worker's own OS thread and
/// must not let the reference outlive the worker. The switching handler
/// satisfies this trivially: it only ever runs on the interrupted worker,
/// and reentry is excluded because preemption is disabled while it runs.
pub unsafe fn current<'a>() -> &'a mut Worker {
    let ptr: *mut Worker = CURRENT_WORKER.with(|cell| cell.get());
    debug_assert!(!ptr.is_null(), "no worker bound to this thread");
    &mut *ptr
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Worker {
    /// Creates a worker with a bundle of the configured size.
    pub fn new(index: usize, bundle_size: u32) -> Result<Box<Self>, Fail> {
        let mut bundle: Bundle = Bundle::new();
        bundle.init(bundle_size)?;
        Ok(Box::new(Self {
            index,
            lock: SpinLock::new(),
            rq: RunQueue::new(),
            q_ptrs: QPtrs::default(),
            stats: WorkerStats::default(),
            bundle,
            self_thread: None,
            preempt_cnt: 0,
            cede_requested: false,
            yield_requested: false,
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    /// The thread this worker currently considers itself to be running. The
    /// switching handler retargets this on every switch.
    pub fn self_thread(&self) -> Option<ThreadRef> {
        self.self_thread
    }

    pub fn set_self_thread(&mut self, th: Option<ThreadRef>) {
        self.self_thread = th;
    }

    pub fn preempt_disable(&mut self) {
        self.preempt_cnt += 1;
    }

    pub fn preempt_enable(&mut self) {
        debug_assert!(self.preempt_cnt > 0);
        self.preempt_cnt -= 1;
    }

    pub fn preempt_disabled(&self) -> bool {
        self.preempt_cnt > 0
    }

    /// Asks the worker to cede its CPU back to the control plane at the next
    /// safe point. Consumed by the slow return path.
    pub fn request_cede(&mut self) {
        self.cede_requested = true;
    }

    /// Asks the worker to run the ordinary scheduler at the next safe point.
    pub fn request_yield(&mut self) {
        self.yield_requested = true;
    }

    pub fn resched_pending(&self) -> bool {
        self.cede_requested || self.yield_requested
    }

    pub fn take_cede_request(&mut self) -> bool {
        ::core::mem::replace(&mut self.cede_requested, false)
    }

    pub fn take_yield_request(&mut self) -> bool {
        ::core::mem::replace(&mut self.yield_requested, false)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        bind_current,
        current,
        unbind_current,
        Worker,
    };

    /// Tests that worker creation rejects a zero-sized bundle.
    #[test]
    fn new_rejects_zero_bundle() {
        assert!(Worker::new(0, 0).is_err());
        assert!(Worker::new(0, 4).is_ok());
    }

    /// Tests the worker binding round trip.
    #[test]
    fn bind_and_read_back() {
        let mut worker: Box<Worker> = Worker::new(7, 2).unwrap();
        bind_current(&mut worker);
        let bound: &mut Worker = unsafe { current() };
        assert_eq!(bound.index(), 7);
        unbind_current();
    }

    /// Tests that the preemption counter nests.
    #[test]
    fn preempt_nesting() {
        let mut worker: Box<Worker> = Worker::new(0, 2).unwrap();
        assert!(!worker.preempt_disabled());
        worker.preempt_disable();
        worker.preempt_disable();
        worker.preempt_enable();
        assert!(worker.preempt_disabled());
        worker.preempt_enable();
        assert!(!worker.preempt_disabled());
    }

    /// Tests that reschedule requests are taken exactly once.
    #[test]
    fn resched_requests_drain() {
        let mut worker: Box<Worker> = Worker::new(0, 2).unwrap();
        assert!(!worker.resched_pending());
        worker.request_cede();
        assert!(worker.resched_pending());
        assert!(worker.take_cede_request());
        assert!(!worker.take_cede_request());
        assert!(!worker.resched_pending());
    }
}
