// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The switching handler. Entered from an entry stub with the volatile
//! integer registers already saved and preemption disabled for the duration;
//! returns by resuming the next bundle member. Reentry on the same worker
//! cannot happen while preemption stays disabled, and a reentrant delivery
//! would be a kernel-bridge bug.
//!
//! The handler never reports a soft error to anyone. It either switches,
//! returns early through the gate, or aborts the process on a corrupted
//! bundle.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::arch::{
        self,
        Trapframe,
        XsaveArea,
    },
    runtime::{
        thread::ThreadRef,
        timer,
        worker::{
            self,
            Worker,
        },
    },
    scheduler::bitmap,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Cycle budget of the stall-emulation body.
pub const LAME_STALL_CYCLES: u64 = 4096;

/// Extra stall charged by the pretend body, for overhead calibration.
pub const LAME_PRETEND_CYCLES: u64 = 2048;

//======================================================================================================================
// Entry Points
//======================================================================================================================

/// General switching body, called by the vector-delivery stub with the
/// interrupted program counter.
#[no_mangle]
pub extern "C" fn lame_handle(pc: u64) {
    handle_switch(pc, false, false);
}

/// Two-member switching body. The bundle is packed by construction at size
/// two, so the rotation fast path applies.
#[no_mangle]
pub extern "C" fn lame_handle_fast(pc: u64) {
    handle_switch(pc, true, false);
}

/// Switching body with a fixed extra stall, for overhead calibration.
#[no_mangle]
pub extern "C" fn lame_handle_pretend(pc: u64) {
    handle_switch(pc, false, true);
}

/// Counter-delivery body: the general switch, followed by the slow path
/// when a deeper reschedule has been requested.
#[no_mangle]
pub extern "C" fn lame_handle_bret(pc: u64) {
    handle_switch(pc, false, false);
    let k: &mut Worker = unsafe { worker::current() };
    if k.resched_pending() {
        lame_handle_bret_slowpath();
    }
}

/// Slow path of the counter-delivery return: hand the CPU deeper into the
/// runtime, ceding it to the control plane when that was asked for and
/// running the ordinary scheduler otherwise. Extended state is saved around
/// the excursion since arbitrary runtime code runs inside.
#[no_mangle]
pub extern "C" fn lame_handle_bret_slowpath() {
    let k: &mut Worker = unsafe { worker::current() };
    if !k.resched_pending() {
        return;
    }

    if arch::xsave_supported() {
        let mut area: XsaveArea = XsaveArea::zeroed();
        let mask: u64 = unsafe { arch::xsave_area_save(&mut area) };
        run_resched(k);
        unsafe { arch::xsave_area_restore(&area, mask) };
    } else {
        run_resched(k);
    }
}

/// Stall-emulation body: burn a fixed cycle budget instead of switching.
#[no_mangle]
pub extern "C" fn lame_stall() {
    timer::wait_until_tsc(timer::rdtsc().wrapping_add(LAME_STALL_CYCLES));
}

//======================================================================================================================
// Internal Functions
//======================================================================================================================

/// The switch itself.
///
/// Gate, pick the next member, retarget the worker's self pointer, save
/// extended state when the interrupted site needs it, and swap frames. When
/// a later rotation selects the suspended member again, control resumes
/// right after the swap and unwinds through the stub into the interrupted
/// code.
fn handle_switch(pc: u64, fast: bool, pretend: bool) {
    let k: &mut Worker = unsafe { worker::current() };
    k.preempt_disable();

    if !k.bundle().is_enabled() || k.bundle().used_count() <= 1 {
        k.stats.lame_skips += 1;
        k.preempt_enable();
        return;
    }

    k.bundle_mut().charge_active_cycles(timer::rdtsc());

    let cur: ThreadRef = match k.bundle().current() {
        Some(cur) => cur,
        None => fatal(k, "active slot is empty with members present", None),
    };
    let picked: Option<ThreadRef> = if fast {
        k.bundle_mut().next_fast()
    } else {
        k.bundle_mut().next()
    };
    let next: ThreadRef = match picked {
        Some(next) => next,
        None => fatal(k, "no next member with more than one present", Some(cur)),
    };

    k.set_self_thread(Some(next));
    k.stats.lame_switches += 1;

    let prev_tf: *mut Trapframe = unsafe { &mut cur.frame_mut().tf as *mut Trapframe };
    let next_tf: *const Trapframe = unsafe { &next.frame().tf as *const Trapframe };

    if bitmap::needs_xsave(pc) && arch::xsave_supported() {
        k.bundle_mut().count_xsave_lame();
        let mut area: XsaveArea = XsaveArea::zeroed();
        let mask: u64 = unsafe { arch::xsave_area_save(&mut area) };
        unsafe { arch::context_switch(prev_tf, next_tf) };
        unsafe { arch::xsave_area_restore(&area, mask) };
    } else {
        unsafe { arch::context_switch(prev_tf, next_tf) };
    }

    if pretend {
        timer::busy_wait_cycles(LAME_PRETEND_CYCLES);
    }

    k.preempt_enable();
}

/// Runs the requested deeper reschedule through the installed hooks.
fn run_resched(k: &mut Worker) {
    if k.take_cede_request() {
        if let Some(cede) = crate::runtime::cede_hook() {
            cede();
        }
    } else if k.take_yield_request() {
        if let Some(yield_fn) = crate::runtime::yield_hook() {
            yield_fn();
        }
    }
}

/// A corrupted bundle is unrecoverable: the active index or the membership
/// count no longer describe reality, and resuming anything would run on a
/// stale frame. Abort with enough context to find the worker.
fn fatal(k: &Worker, what: &str, cur: Option<ThreadRef>) -> ! {
    error!(
        "corrupted bundle on worker {}: {} (used={}, active={}, cur={:?})",
        k.index(),
        what,
        k.bundle().used_count(),
        k.bundle().active(),
        cur.map(|th| th.as_ptr()),
    );
    ::std::process::abort();
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
