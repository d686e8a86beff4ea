// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The per-worker bundle: a fixed-capacity ordered set of user threads that
//! share one CPU through asynchronous round-robin switching. Membership,
//! rotation, and gating all live here; the switching handler and the
//! dismantle path are thin orchestrations on top.
//!
//! A bundle is mutated only from its owning worker's execution context, so
//! none of these operations take a lock. The handler cannot race them
//! because preemption is disabled while it runs.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    thread::ThreadRef,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Compile-time slot capacity of a bundle. The runtime-configured effective
/// size may be anything in `[1, BUNDLE_SIZE_MAX]`.
pub const BUNDLE_SIZE_MAX: usize = 8;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One bundle slot: either empty or holding a borrowed thread frame plus its
/// per-slot accounting.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Slot {
    thread: Option<ThreadRef>,
    present: bool,
    cycles: u64,
    lame_count: u64,
}

/// A worker's bundle of co-resident user threads.
pub struct Bundle {
    slots: [Slot; BUNDLE_SIZE_MAX],
    /// Effective size configured at init.
    size: u32,
    /// Number of occupied slots.
    used: u32,
    /// Index of the currently running member.
    active: u32,
    /// Dynamic gate, independent of the configured size.
    enabled: bool,
    total_cycles: u64,
    total_lames: u64,
    total_xsave_lames: u64,
    /// Timestamp of the previous switch, for cycle attribution.
    last_lame_tsc: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Slot {
    pub fn thread(&self) -> Option<ThreadRef> {
        self.thread
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn lame_count(&self) -> u64 {
        self.lame_count
    }

    fn clear(&mut self) {
        self.thread = None;
        self.present = false;
        self.cycles = 0;
        self.lame_count = 0;
    }
}

impl Bundle {
    /// Creates a statically disabled bundle. [Self::init] configures it.
    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); BUNDLE_SIZE_MAX],
            size: 0,
            used: 0,
            active: 0,
            enabled: false,
            total_cycles: 0,
            total_lames: 0,
            total_xsave_lames: 0,
            last_lame_tsc: 0,
        }
    }

    /// Configures the bundle with an effective size and resets all state.
    pub fn init(&mut self, size: u32) -> Result<(), Fail> {
        if size == 0 || size as usize > BUNDLE_SIZE_MAX {
            return Err(Fail::new(
                libc::EINVAL,
                "bundle size must be between 1 and the slot capacity",
            ));
        }
        self.reset(size);
        Ok(())
    }

    /// Resets the bundle to its unconfigured state, disabling it.
    pub fn cleanup(&mut self) {
        self.reset(0);
    }

    fn reset(&mut self, size: u32) {
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
        self.size = size;
        self.used = 0;
        self.active = 0;
        self.enabled = false;
        self.total_cycles = 0;
        self.total_lames = 0;
        self.total_xsave_lames = 0;
        self.last_lame_tsc = 0;
    }

    //==================================================================================================================
    // Membership
    //==================================================================================================================

    /// Adds a thread to the first empty slot. Adding a thread that is
    /// already a member is not an error: the bundle is left untouched and
    /// the call succeeds. Fails with `ENOSPC` when every slot is occupied.
    pub fn add(&mut self, th: ThreadRef, set_active: bool) -> Result<(), Fail> {
        let mut first_empty: Option<usize> = None;
        for i in 0..self.size as usize {
            if self.slots[i].present {
                if self.slots[i].thread == Some(th) {
                    warn!("add(): thread {:?} is already a bundle member", th.as_ptr());
                    return Ok(());
                }
            } else if first_empty.is_none() {
                first_empty = Some(i);
            }
        }

        let i: usize = match first_empty {
            Some(i) => i,
            None => {
                debug!("add(): bundle is full, cannot add thread {:?}", th.as_ptr());
                return Err(Fail::new(libc::ENOSPC, "bundle is full"));
            },
        };

        self.slots[i] = Slot {
            thread: Some(th),
            present: true,
            cycles: 0,
            lame_count: 0,
        };
        self.used += 1;
        if set_active {
            self.active = i as u32;
        }
        trace!("add(): thread {:?} placed in slot {}", th.as_ptr(), i);
        Ok(())
    }

    /// Removes a thread from the bundle. Fails with `ENOENT` if it is not a
    /// member.
    pub fn remove(&mut self, th: ThreadRef) -> Result<(), Fail> {
        for i in 0..self.size as usize {
            if self.slots[i].present && self.slots[i].thread == Some(th) {
                self.slots[i].clear();
                self.used -= 1;
                trace!("remove(): thread {:?} cleared from slot {}", th.as_ptr(), i);
                return Ok(());
            }
        }
        Err(Fail::new(libc::ENOENT, "thread is not a bundle member"))
    }

    /// Removes the member in slot `i`.
    pub fn remove_by_index(&mut self, i: u32) -> Result<(), Fail> {
        if i >= self.size {
            return Err(Fail::new(libc::EINVAL, "slot index out of range"));
        }
        if !self.slots[i as usize].present {
            return Err(Fail::new(libc::ENOENT, "slot is empty"));
        }
        self.slots[i as usize].clear();
        self.used -= 1;
        Ok(())
    }

    /// Removes the member in the active slot.
    pub fn remove_at_active(&mut self) -> Result<(), Fail> {
        self.remove_by_index(self.active)
    }

    /// Takes the member out of slot `i` during a spill, clearing the slot.
    pub(crate) fn spill_slot(&mut self, i: usize) -> Option<ThreadRef> {
        if !self.slots[i].present {
            return None;
        }
        let th: Option<ThreadRef> = self.slots[i].thread;
        self.slots[i].clear();
        self.used -= 1;
        th
    }

    /// Resets the rotation point after a spill.
    pub(crate) fn reset_rotation(&mut self) {
        self.active = 0;
    }

    //==================================================================================================================
    // Round-Robin Selection
    //==================================================================================================================

    /// Picks the next member to run: the first occupied slot at or after
    /// `active + 1`, wrapping. Advances `active` to the returned slot and
    /// charges the rotation counters. Returns nothing on an empty bundle.
    pub fn next(&mut self) -> Option<ThreadRef> {
        if self.size == 0 {
            return None;
        }
        let start: u32 = (self.active + 1) % self.size;
        for step in 0..self.size {
            let idx: u32 = (start + step) % self.size;
            if self.slots[idx as usize].present {
                self.active = idx;
                self.total_lames += 1;
                self.slots[idx as usize].lame_count += 1;
                return self.slots[idx as usize].thread;
            }
        }
        None
    }

    /// The currently running member, if the active slot is occupied.
    pub fn current(&self) -> Option<ThreadRef> {
        if self.size == 0 || !self.slots[self.active as usize].present {
            return None;
        }
        self.slots[self.active as usize].thread
    }

    /// Rotation fast path for bundles whose occupied slots are packed in
    /// `[0, used)`. Callers must have maintained that packing; the two-member
    /// specialized entry is the only user.
    pub fn next_fast(&mut self) -> Option<ThreadRef> {
        if self.used == 0 {
            return None;
        }
        self.active = (self.active + 1) % self.used;
        let slot: &mut Slot = &mut self.slots[self.active as usize];
        debug_assert!(slot.present);
        self.total_lames += 1;
        slot.lame_count += 1;
        slot.thread
    }

    //==================================================================================================================
    // Gating
    //==================================================================================================================

    /// Sets the dynamic gate. Idempotent.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Clears the dynamic gate. Idempotent.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Statically and dynamically enabled.
    pub fn is_enabled(&self) -> bool {
        self.is_statically_enabled() && self.enabled
    }

    /// Configured with more than one slot.
    pub fn is_statically_enabled(&self) -> bool {
        self.size > 1
    }

    pub fn is_dynamically_enabled(&self) -> bool {
        self.enabled
    }

    //==================================================================================================================
    // Member Flags
    //==================================================================================================================

    /// Clears the ready flag of every member.
    pub fn set_ready_false_all(&mut self) {
        for slot in self.slots[..self.size as usize].iter() {
            if let Some(th) = slot.thread {
                unsafe { th.frame_mut().ready = false };
            }
        }
    }

    /// Sets the running flag of every member.
    pub fn set_running_true_all(&mut self) {
        for slot in self.slots[..self.size as usize].iter() {
            if let Some(th) = slot.thread {
                unsafe { th.frame_mut().running = true };
            }
        }
    }

    //==================================================================================================================
    // Accounting
    //==================================================================================================================

    /// Charges the cycles since the previous switch to the active member,
    /// both in its slot and on its thread frame.
    pub(crate) fn charge_active_cycles(&mut self, now: u64) {
        let slot: &mut Slot = &mut self.slots[self.active as usize];
        if self.last_lame_tsc != 0 && slot.present {
            let delta: u64 = now.wrapping_sub(self.last_lame_tsc);
            slot.cycles += delta;
            self.total_cycles += delta;
            if let Some(th) = slot.thread {
                unsafe { th.frame_mut().total_cycles += delta };
            }
        }
        self.last_lame_tsc = now;
    }

    /// Bumps the extended-state save counter.
    pub(crate) fn count_xsave_lame(&mut self) {
        self.total_xsave_lames += 1;
    }

    //==================================================================================================================
    // Accessors
    //==================================================================================================================

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn used_count(&self) -> u32 {
        self.used
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    pub fn slot(&self, i: usize) -> &Slot {
        &self.slots[i]
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn total_lames(&self) -> u64 {
        self.total_lames
    }

    pub fn total_xsave_lames(&self) -> u64 {
        self.total_xsave_lames
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Bundle,
        Slot,
        BUNDLE_SIZE_MAX,
    };
    use crate::runtime::thread::{
        ThreadFrame,
        ThreadRef,
    };

    fn mkthreads(n: usize) -> (Vec<Box<ThreadFrame>>, Vec<ThreadRef>) {
        let mut frames: Vec<Box<ThreadFrame>> = (0..n).map(|_| Box::new(ThreadFrame::new())).collect();
        let refs: Vec<ThreadRef> = frames.iter_mut().map(|f| ThreadRef::new(f)).collect();
        (frames, refs)
    }

    fn check_invariants(bundle: &Bundle) {
        let occupied: u32 = (0..bundle.size() as usize).filter(|&i| bundle.slot(i).is_present()).count() as u32;
        assert_eq!(bundle.used_count(), occupied);
        assert!(bundle.used_count() <= bundle.size());
        assert!(bundle.size() == 0 || bundle.active() < bundle.size());
        for i in 0..bundle.size() as usize {
            if !bundle.slot(i).is_present() {
                assert_eq!(bundle.slot(i).thread(), None);
            }
        }
    }

    /// Tests that init rejects a zero size and an oversized bundle.
    #[test]
    fn init_validates_size() {
        let mut bundle: Bundle = Bundle::new();
        assert_eq!(bundle.init(0).unwrap_err().errno, libc::EINVAL);
        assert_eq!(bundle.init(BUNDLE_SIZE_MAX as u32 + 1).unwrap_err().errno, libc::EINVAL);
        bundle.init(BUNDLE_SIZE_MAX as u32).unwrap();
        assert_eq!(bundle.size(), BUNDLE_SIZE_MAX as u32);
        assert!(!bundle.is_dynamically_enabled());
    }

    /// Tests filling the bundle, the duplicate-add success path, and the
    /// no-space failure.
    #[test]
    fn add_fill_duplicate_and_overflow() {
        let (_frames, refs) = mkthreads(5);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(4).unwrap();

        for th in &refs[..4] {
            bundle.add(*th, false).unwrap();
            check_invariants(&bundle);
        }
        assert_eq!(bundle.used_count(), 4);

        // A duplicate add succeeds without changing the membership.
        bundle.add(refs[0], false).unwrap();
        assert_eq!(bundle.used_count(), 4);

        // A fifth distinct thread does not fit.
        assert_eq!(bundle.add(refs[4], false).unwrap_err().errno, libc::ENOSPC);
        check_invariants(&bundle);
    }

    /// Tests that add respects the set-active request.
    #[test]
    fn add_set_active() {
        let (_frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(4).unwrap();
        bundle.add(refs[0], false).unwrap();
        assert_eq!(bundle.active(), 0);
        bundle.add(refs[1], true).unwrap();
        assert_eq!(bundle.active(), 1);
        assert_eq!(bundle.current(), Some(refs[1]));
    }

    /// Tests removal by thread, by index, and the not-found paths.
    #[test]
    fn remove_paths() {
        let (_frames, refs) = mkthreads(3);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(3).unwrap();
        for th in &refs {
            bundle.add(*th, false).unwrap();
        }

        bundle.remove(refs[1]).unwrap();
        assert_eq!(bundle.used_count(), 2);
        assert_eq!(bundle.remove(refs[1]).unwrap_err().errno, libc::ENOENT);

        assert_eq!(bundle.remove_by_index(3).unwrap_err().errno, libc::EINVAL);
        assert_eq!(bundle.remove_by_index(1).unwrap_err().errno, libc::ENOENT);
        bundle.remove_by_index(0).unwrap();
        assert_eq!(bundle.used_count(), 1);
        check_invariants(&bundle);
    }

    /// Tests that an add followed by a remove restores the bundle to its
    /// previous membership state.
    #[test]
    fn add_remove_round_trip() {
        let (_frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(4).unwrap();
        bundle.add(refs[0], false).unwrap();

        let before: Vec<Slot> = (0..4).map(|i| *bundle.slot(i)).collect();
        let used_before: u32 = bundle.used_count();

        bundle.add(refs[1], false).unwrap();
        bundle.remove(refs[1]).unwrap();

        let after: Vec<Slot> = (0..4).map(|i| *bundle.slot(i)).collect();
        assert_eq!(before, after);
        assert_eq!(bundle.used_count(), used_before);
    }

    /// Tests the fill-and-rotate rotation: members come back in slot order
    /// starting just past the active slot, and one full rotation touches
    /// every member exactly once.
    #[test]
    fn rotation_visits_all_in_order() {
        let (_frames, refs) = mkthreads(4);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(4).unwrap();
        for th in &refs {
            bundle.add(*th, false).unwrap();
        }

        let got: Vec<_> = (0..4).map(|_| bundle.next().unwrap()).collect();
        assert_eq!(got, vec![refs[1], refs[2], refs[3], refs[0]]);
        assert_eq!(bundle.active(), 0);
        assert_eq!(bundle.total_lames(), 4);
        for i in 0..4 {
            assert_eq!(bundle.slot(i).lame_count(), 1);
        }
    }

    /// Tests rotation across gaps: empty slots are skipped.
    #[test]
    fn rotation_skips_empty_slots() {
        let (_frames, refs) = mkthreads(3);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(3).unwrap();
        for th in &refs {
            bundle.add(*th, false).unwrap();
        }

        // Rotate onto slot 1, drop it, and confirm the rotation lands on
        // slot 2 next.
        bundle.next().unwrap();
        assert_eq!(bundle.active(), 1);
        bundle.remove_at_active().unwrap();
        assert_eq!(bundle.next(), Some(refs[2]));
        assert_eq!(bundle.active(), 2);
    }

    /// Tests the one-member boundary: the same slot comes back every call
    /// and its counter keeps climbing.
    #[test]
    fn single_member_rotation() {
        let (_frames, refs) = mkthreads(1);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(1).unwrap();
        bundle.add(refs[0], false).unwrap();

        for n in 1..=3u64 {
            assert_eq!(bundle.next(), Some(refs[0]));
            assert_eq!(bundle.slot(0).lame_count(), n);
        }
        assert_eq!(bundle.total_lames(), 3);
    }

    /// Tests that rotation on an empty bundle yields nothing.
    #[test]
    fn rotation_on_empty_bundle() {
        let mut bundle: Bundle = Bundle::new();
        bundle.init(4).unwrap();
        assert_eq!(bundle.next(), None);
        assert_eq!(bundle.current(), None);
        assert_eq!(bundle.total_lames(), 0);
    }

    /// Tests the packed fast path against the general rotation on a full
    /// two-member bundle.
    #[test]
    fn fast_path_matches_general_on_packed_pair() {
        let (_frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(2).unwrap();
        bundle.add(refs[0], false).unwrap();
        bundle.add(refs[1], false).unwrap();

        assert_eq!(bundle.next_fast(), Some(refs[1]));
        assert_eq!(bundle.next_fast(), Some(refs[0]));
        assert_eq!(bundle.next_fast(), Some(refs[1]));
        assert_eq!(bundle.total_lames(), 3);
    }

    /// Tests gate idempotence and the static/dynamic split.
    #[test]
    fn gating() {
        let mut bundle: Bundle = Bundle::new();
        bundle.init(2).unwrap();
        assert!(bundle.is_statically_enabled());
        assert!(!bundle.is_enabled());

        bundle.enable();
        bundle.enable();
        assert!(bundle.is_dynamically_enabled());
        assert!(bundle.is_enabled());

        bundle.disable();
        bundle.disable();
        assert!(!bundle.is_enabled());

        // A one-slot bundle is never statically enabled, whatever the gate
        // says.
        bundle.init(1).unwrap();
        bundle.enable();
        assert!(bundle.is_dynamically_enabled());
        assert!(!bundle.is_enabled());
    }

    /// Tests that cleanup statically disables the bundle.
    #[test]
    fn cleanup_disables() {
        let (_frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(2).unwrap();
        bundle.add(refs[0], false).unwrap();
        bundle.enable();

        bundle.cleanup();
        assert_eq!(bundle.size(), 0);
        assert_eq!(bundle.used_count(), 0);
        assert!(!bundle.is_statically_enabled());
        assert!(!bundle.is_dynamically_enabled());
    }

    /// Tests that cycle charging lands on the active slot and its frame,
    /// and that the first charge only arms the baseline.
    #[test]
    fn cycle_charging_reaches_frame() {
        let (frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(2).unwrap();
        for th in &refs {
            bundle.add(*th, false).unwrap();
        }

        bundle.charge_active_cycles(100);
        assert_eq!(bundle.total_cycles(), 0);
        assert_eq!(frames[0].total_cycles, 0);

        bundle.charge_active_cycles(150);
        assert_eq!(bundle.slot(0).cycles(), 50);
        assert_eq!(bundle.total_cycles(), 50);
        assert_eq!(frames[0].total_cycles, 50);
        assert_eq!(frames[1].total_cycles, 0);

        // Rotation moves the attribution target.
        bundle.next().unwrap();
        bundle.charge_active_cycles(175);
        assert_eq!(bundle.slot(1).cycles(), 25);
        assert_eq!(frames[1].total_cycles, 25);
        assert_eq!(bundle.total_cycles(), 75);
    }

    /// Tests the member-wide flag sweeps.
    #[test]
    fn member_flag_sweeps() {
        let (frames, refs) = mkthreads(2);
        let mut bundle: Bundle = Bundle::new();
        bundle.init(2).unwrap();
        for th in &refs {
            bundle.add(*th, false).unwrap();
        }
        unsafe {
            refs[0].frame_mut().ready = true;
            refs[1].frame_mut().ready = true;
        }

        bundle.set_ready_false_all();
        bundle.set_running_true_all();
        for frame in &frames {
            assert!(!frame.ready);
            assert!(frame.running);
        }
    }
}
