// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The bundle scheduler's operation surface, as the surrounding runtime
//! consumes it: membership, gating, dismantling, the handler entry points,
//! and registration. Everything here is a thin veneer over the bundle
//! embedded in a worker; the veneer exists so the runtime deals in workers,
//! not in bundle internals.
//!
//! All membership and gating operations must be called from the owning
//! worker's execution context. They take no lock; see the bundle module.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod bitmap;
pub mod bundle;
pub mod dismantle;
pub mod handler;
pub mod register;

pub use self::{
    bundle::{
        Bundle,
        BUNDLE_SIZE_MAX,
    },
    handler::{
        lame_handle,
        lame_handle_bret_slowpath,
        lame_stall,
    },
    register::{
        register,
        HandlerVariant,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    thread::ThreadRef,
    worker::Worker,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Adds `th` to the worker's bundle, optionally making it the active member.
/// Adding an existing member succeeds without effect.
pub fn bundle_add(k: &mut Worker, th: ThreadRef, set_active: bool) -> Result<(), Fail> {
    k.bundle_mut().add(th, set_active)
}

/// Removes `th` from the worker's bundle.
pub fn bundle_remove(k: &mut Worker, th: ThreadRef) -> Result<(), Fail> {
    k.bundle_mut().remove(th)
}

/// Removes the member in slot `i` of the worker's bundle.
pub fn bundle_remove_by_index(k: &mut Worker, i: u32) -> Result<(), Fail> {
    k.bundle_mut().remove_by_index(i)
}

/// Removes the member in the active slot of the worker's bundle.
pub fn bundle_remove_at_active(k: &mut Worker) -> Result<(), Fail> {
    k.bundle_mut().remove_at_active()
}

/// Number of occupied slots in the worker's bundle.
pub fn bundle_used_count(k: &Worker) -> u32 {
    k.bundle().used_count()
}

/// Clears the ready flag of every bundle member.
pub fn bundle_set_ready_false_all(k: &mut Worker) {
    k.bundle_mut().set_ready_false_all()
}

/// Sets the running flag of every bundle member.
pub fn bundle_set_running_true_all(k: &mut Worker) {
    k.bundle_mut().set_running_true_all()
}

/// Opens the dynamic gate.
pub fn sched_enable(k: &mut Worker) {
    k.bundle_mut().enable()
}

/// Closes the dynamic gate.
pub fn sched_disable(k: &mut Worker) {
    k.bundle_mut().disable()
}

/// Statically and dynamically enabled.
pub fn sched_is_enabled(k: &Worker) -> bool {
    k.bundle().is_enabled()
}

/// Configured with more than one slot.
pub fn sched_is_statically_enabled(k: &Worker) -> bool {
    k.bundle().is_statically_enabled()
}

/// Dynamic gate state.
pub fn sched_is_dynamically_enabled(k: &Worker) -> bool {
    k.bundle().is_dynamically_enabled()
}

/// Spills the bundle back to the worker's run queue, taking the worker lock.
pub fn sched_bundle_dismantle(k: &mut Worker) {
    dismantle::dismantle(k)
}

/// Spill variant for callers already holding the worker lock.
pub fn sched_bundle_dismantle_nolock(k: &mut Worker) {
    dismantle::dismantle_nolock(k)
}
