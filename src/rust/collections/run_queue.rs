// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    thread::ThreadRef,
    timer,
};
use ::core::sync::atomic::{
    AtomicU32,
    AtomicU64,
    Ordering,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Capacity of the circular run queue. Must be a power of two so that the
/// free-running head/tail counters index with a mask.
pub const RQ_SIZE: usize = 256;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Queue pointers mirrored for an external observer (the control plane polls
/// these to judge worker load without taking the worker lock).
#[derive(Default)]
pub struct QPtrs {
    /// Monotonic count of threads ever enqueued on this worker.
    pub rq_head: AtomicU64,
    /// Timestamp of the oldest entry, published when the queue goes non-empty.
    pub oldest_tsc: AtomicU64,
}

/// A worker's circular run queue with FIFO overflow.
///
/// Single producer and single consumer, both on the owning worker. The head
/// counter is published with release ordering and read back with acquire so
/// that an entry's fields are visible before the entry itself; head and tail
/// run free and wrap, with `head - tail` as the occupancy.
pub struct RunQueue {
    rq: [Option<ThreadRef>; RQ_SIZE],
    rq_head: AtomicU32,
    rq_tail: AtomicU32,
    rq_overflow: VecDeque<ThreadRef>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunQueue {
    pub fn new() -> Self {
        Self {
            rq: [None; RQ_SIZE],
            rq_head: AtomicU32::new(0),
            rq_tail: AtomicU32::new(0),
            rq_overflow: VecDeque::new(),
        }
    }

    /// Number of threads in the circular portion of the queue.
    pub fn len(&self) -> usize {
        let head: u32 = self.rq_head.load(Ordering::Acquire);
        let tail: u32 = self.rq_tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.rq_overflow.is_empty()
    }

    /// Number of threads parked on the overflow list.
    pub fn overflow_len(&self) -> usize {
        self.rq_overflow.len()
    }

    /// Offers a thread to the queue. While the overflow list is non-empty,
    /// new arrivals go behind it so that FIFO order is preserved end to end;
    /// a full ring also diverts to overflow. Every offer attempts a drain.
    pub fn push(&mut self, th: ThreadRef, q_ptrs: &QPtrs) {
        let head: u32 = self.rq_head.load(Ordering::Relaxed);
        let tail: u32 = self.rq_tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) as usize >= RQ_SIZE || !self.rq_overflow.is_empty() {
            unsafe { th.frame_mut().link_armed = true };
            self.rq_overflow.push_back(th);
            self.drain_overflow(q_ptrs);
            return;
        }

        self.enqueue_slot(th, head, tail, q_ptrs);
    }

    /// Moves overflowed threads into the ring while space remains.
    pub fn drain_overflow(&mut self, q_ptrs: &QPtrs) {
        loop {
            let head: u32 = self.rq_head.load(Ordering::Relaxed);
            let tail: u32 = self.rq_tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) as usize >= RQ_SIZE {
                return;
            }
            let th: ThreadRef = match self.rq_overflow.pop_front() {
                Some(th) => th,
                None => return,
            };
            unsafe { th.frame_mut().link_armed = false };
            self.enqueue_slot(th, head, tail, q_ptrs);
        }
    }

    /// Stores a thread at the head slot and publishes the new head.
    fn enqueue_slot(&mut self, th: ThreadRef, head: u32, tail: u32, q_ptrs: &QPtrs) {
        self.rq[head as usize & (RQ_SIZE - 1)] = Some(th);
        self.rq_head.store(head.wrapping_add(1), Ordering::Release);
        if head == tail {
            q_ptrs.oldest_tsc.store(timer::rdtsc(), Ordering::Relaxed);
        }
        q_ptrs.rq_head.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the thread at the tail of the queue, if any.
    pub fn pop(&mut self) -> Option<ThreadRef> {
        let head: u32 = self.rq_head.load(Ordering::Acquire);
        let tail: u32 = self.rq_tail.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        let th: Option<ThreadRef> = self.rq[tail as usize & (RQ_SIZE - 1)].take();
        self.rq_tail.store(tail.wrapping_add(1), Ordering::Release);
        th
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
