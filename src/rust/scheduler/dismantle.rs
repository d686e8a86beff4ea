// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bundle dismantling. When a worker is about to give up its CPU, every
//! bundle member would silently stop executing; the spill below hands each
//! one back to the worker's ordinary run queue so the runtime can migrate or
//! re-dispatch it. This is the single point where the bundle's borrow of a
//! thread frame is released back to the scheduler proper.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::run_queue::RQ_SIZE,
    runtime::{
        timer,
        worker::Worker,
    },
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Spills the worker's bundle back to its run queue, taking the worker lock
/// around the queue manipulation.
pub fn dismantle(k: &mut Worker) {
    k.lock.lock();
    spill(k);
    k.lock.unlock();
}

/// Spill variant for callers that already hold the worker lock.
pub fn dismantle_nolock(k: &mut Worker) {
    k.lock.assert_held();
    spill(k);
}

/// Moves every occupied slot, in slot-index order, onto the run queue and
/// clears the bundle's membership. The dynamic gate is left alone: whether
/// switching is allowed is a policy decision that outlives one descheduling.
fn spill(k: &mut Worker) {
    let size: usize = k.bundle().size() as usize;
    for i in 0..size {
        let th = match k.bundle_mut().spill_slot(i) {
            Some(th) => th,
            None => continue,
        };

        unsafe {
            let frame = th.frame_mut();
            frame.ready = true;
            frame.running = false;
            frame.ready_tsc = timer::rdtsc();
        }

        let diverted: bool = k.rq.len() >= RQ_SIZE || k.rq.overflow_len() > 0;
        k.rq.push(th, &k.q_ptrs);
        if diverted {
            k.stats.rq_overflows += 1;
        }
    }

    k.bundle_mut().reset_rotation();
    debug_assert_eq!(k.bundle().used_count(), 0);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        dismantle,
        dismantle_nolock,
    };
    use crate::{
        collections::run_queue::RQ_SIZE,
        runtime::{
            thread::{
                ThreadFrame,
                ThreadRef,
            },
            worker::Worker,
        },
    };

    fn mkthreads(n: usize) -> (Vec<Box<ThreadFrame>>, Vec<ThreadRef>) {
        let mut frames: Vec<Box<ThreadFrame>> = (0..n).map(|_| Box::new(ThreadFrame::new())).collect();
        let refs: Vec<ThreadRef> = frames.iter_mut().map(|f| ThreadRef::new(f)).collect();
        (frames, refs)
    }

    /// Tests that a spill delivers members to the run queue in slot order
    /// and resets the bundle.
    #[test]
    fn spill_in_slot_order() {
        let (frames, refs) = mkthreads(4);
        let mut k: Box<Worker> = Worker::new(0, 4).unwrap();
        for th in &refs {
            k.bundle_mut().add(*th, false).unwrap();
        }
        k.bundle_mut().enable();

        dismantle(&mut k);

        assert_eq!(k.bundle().used_count(), 0);
        assert_eq!(k.bundle().active(), 0);
        for i in 0..4 {
            assert!(!k.bundle().slot(i).is_present());
        }
        for th in &refs {
            assert_eq!(k.rq.pop(), Some(*th));
        }
        for frame in &frames {
            assert!(frame.ready);
            assert!(!frame.running);
            assert!(frame.ready_tsc != 0);
        }
        // The gate belongs to policy, not to one descheduling.
        assert!(k.bundle().is_dynamically_enabled());
    }

    /// Tests the overflow path: with one free slot in the ring, the first
    /// member fits and the rest land on the overflow list in order.
    #[test]
    fn spill_overflows_in_order() {
        let (_filler_frames, filler) = mkthreads(RQ_SIZE - 1);
        let (_frames, refs) = mkthreads(4);
        let mut k: Box<Worker> = Worker::new(0, 4).unwrap();
        for th in &filler {
            let q_ptrs = &k.q_ptrs;
            k.rq.push(*th, q_ptrs);
        }
        for th in &refs {
            k.bundle_mut().add(*th, false).unwrap();
        }

        dismantle(&mut k);

        assert_eq!(k.rq.len(), RQ_SIZE);
        assert_eq!(k.rq.overflow_len(), 3);
        assert_eq!(k.stats.rq_overflows, 3);

        // Draining keeps the spilled members behind the queued ones.
        for th in &filler {
            assert_eq!(k.rq.pop(), Some(*th));
        }
        assert_eq!(k.rq.pop(), Some(refs[0]));
        let q_ptrs = &k.q_ptrs;
        k.rq.drain_overflow(q_ptrs);
        for th in &refs[1..] {
            assert_eq!(k.rq.pop(), Some(*th));
        }
    }

    /// Tests that dismantling an empty bundle is a no-op.
    #[test]
    fn empty_bundle_noop() {
        let mut k: Box<Worker> = Worker::new(0, 4).unwrap();
        dismantle(&mut k);
        assert!(k.rq.is_empty());
        assert_eq!(k.bundle().used_count(), 0);
        assert_eq!(k.bundle().active(), 0);
    }

    /// Tests the lock-asserting variant under a held lock.
    #[test]
    fn nolock_variant_requires_lock() {
        let (_frames, refs) = mkthreads(2);
        let mut k: Box<Worker> = Worker::new(0, 2).unwrap();
        for th in &refs {
            k.bundle_mut().add(*th, false).unwrap();
        }

        k.lock.lock();
        dismantle_nolock(&mut k);
        k.lock.unlock();

        assert_eq!(k.rq.len(), 2);
    }

    /// Tests that the lock-asserting variant panics without the lock.
    #[test]
    #[should_panic]
    fn nolock_variant_panics_without_lock() {
        let mut k: Box<Worker> = Worker::new(0, 2).unwrap();
        dismantle_nolock(&mut k);
    }
}
