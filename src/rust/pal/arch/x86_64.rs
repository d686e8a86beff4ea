// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! x86-64 machine-state plumbing for the bundle scheduler: the trapframe
//! layout, the frame-to-frame context switch, the asynchronous entry stubs,
//! and the compact extended-state save helpers.
//!
//! The entry stubs are the only code that runs between delivery and the
//! handler. They save the volatile integer registers on the interrupted
//! stack, realign, call the handler with the interrupted program counter,
//! and unwind the same way. Vector state is deliberately not touched here;
//! the handler saves it selectively (see the scheduler's site bitmap).

//======================================================================================================================
// Imports
//======================================================================================================================

use super::{
    XSAVE_AREA_ALIGN,
    XSAVE_AREA_SIZE,
};
use ::core::arch::{
    global_asm,
    naked_asm,
    x86_64::{
        _xgetbv,
        _xrstor64,
        _xsavec64,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Saved machine state of a suspended thread.
///
/// Callee-preserved registers plus the stack pointer, in the System V ABI
/// sense: everything else is either saved by an entry stub or dead across a
/// cooperative call. The context switch reads and writes this layout by
/// explicit offsets, so field order is load-bearing.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Trapframe {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Scratch buffer for the compact extended-state save instructions. The
/// header region must be zero before the first save, so construction zeroes
/// the whole area.
#[repr(C, align(64))]
pub struct XsaveArea {
    data: [u8; XSAVE_AREA_SIZE],
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Trapframe {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Builds a frame that enters `entry` on `stack_top` when first switched
    /// to. `stack_top` must be 16-byte aligned. The switch resumes a frame
    /// with `ret`, so the entry address is planted where a return address
    /// would be and the resulting stack pointer lands at 16n+8, exactly as
    /// if `entry` had been reached by a call.
    pub fn new(stack_top: usize, entry: usize) -> Self {
        debug_assert_eq!(stack_top & 15, 0);
        let initial_rsp: usize = stack_top - 16;
        unsafe { ::core::ptr::write(initial_rsp as *mut u64, entry as u64) };
        Self {
            rsp: initial_rsp as u64,
            ..Self::zeroed()
        }
    }
}

impl XsaveArea {
    pub fn zeroed() -> Self {
        Self {
            data: [0; XSAVE_AREA_SIZE],
        }
    }
}

//======================================================================================================================
// Context Switch
//======================================================================================================================

/// Swaps the machine state of two thread frames.
///
/// Stores the callee-preserved registers and the stack pointer of the caller
/// into `prev`, loads the same set from `next`, and returns into the point
/// captured in `next`. Control comes back to the caller only when some later
/// switch selects `prev` again.
///
/// # Safety
///
/// Both pointers must reference live trapframes, and `next` must hold state
/// captured by a previous switch or built by [Trapframe::new].
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_prev: *mut Trapframe, _next: *const Trapframe) {
    naked_asm!(
        // Spill callee-preserved state into the previous frame (rdi).
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Load the next frame (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    );
}

//======================================================================================================================
// Entry Stubs
//======================================================================================================================

// Direct-delivery stubs. The kernel bridge transfers control here on the
// interrupted thread's stack with the interrupted instruction pointer pushed,
// exactly like a call. Volatile integer registers are live application state
// and are preserved around the handler; rbx doubles as the realignment save.
//
// After the eleven pushes the interrupted rip sits at [rsp + 88].
macro_rules! define_lame_entry {
    ($name:literal, $handler:literal) => {
        global_asm!(
            concat!(".globl ", $name),
            concat!($name, ":"),
            "pushfq",
            "push rax",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push rbx",
            "mov rdi, [rsp + 88]",
            "mov rbx, rsp",
            "and rsp, -16",
            concat!("call ", $handler),
            "mov rsp, rbx",
            "pop rbx",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rax",
            "popfq",
            "ret",
        );
    };
}

// Counter-overflow stubs. Delivery pushes the interrupted rip and then the
// flags, so flags live in the frame already and the return sequence is the
// encapsulated bret step: popfq followed by ret. After the ten pushes the
// saved flags sit at [rsp + 80] and the interrupted rip at [rsp + 88].
macro_rules! define_lame_entry_bret {
    ($name:literal, $handler:literal) => {
        global_asm!(
            concat!(".globl ", $name),
            concat!($name, ":"),
            "push rax",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push rbx",
            "mov rdi, [rsp + 88]",
            "mov rbx, rsp",
            "and rsp, -16",
            concat!("call ", $handler),
            "mov rsp, rbx",
            "pop rbx",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rax",
            "popfq",
            "ret",
        );
    };
}

define_lame_entry!("__lame_entry", "lame_handle");
define_lame_entry!("__lame_entry2", "lame_handle_fast");
define_lame_entry!("__lame_entry2_pretend", "lame_handle_pretend");
define_lame_entry_bret!("__lame_entry_bret", "lame_handle_bret");
define_lame_entry_bret!("__lame_entry_stall_bret", "lame_stall");

// Measurement baselines: return immediately through the matching exit
// sequence without calling into the scheduler at all.
global_asm!(".globl __lame_entry_nop", "__lame_entry_nop:", "ret",);
global_asm!(".globl __lame_entry_nop_bret", "__lame_entry_nop_bret:", "popfq", "ret",);

extern "C" {
    pub fn __lame_entry();
    pub fn __lame_entry2();
    pub fn __lame_entry2_pretend();
    pub fn __lame_entry_nop();
    pub fn __lame_entry_bret();
    pub fn __lame_entry_stall_bret();
    pub fn __lame_entry_nop_bret();
}

//======================================================================================================================
// Extended State
//======================================================================================================================

/// Peeks whether the compact save instruction family is available.
pub fn xsave_supported() -> bool {
    ::std::arch::is_x86_feature_detected!("xsavec")
}

/// Saves the active extended-state components into `area` and returns the
/// component mask used, which the matching restore must be given back.
///
/// # Safety
///
/// The caller must have verified [xsave_supported].
#[target_feature(enable = "xsave,xsavec")]
pub unsafe fn xsave_area_save(area: &mut XsaveArea) -> u64 {
    let mask: u64 = _xgetbv(0);
    _xsavec64(area.data.as_mut_ptr(), mask);
    mask
}

/// Restores extended-state components from `area`.
///
/// # Safety
///
/// `area` must hold state written by [xsave_area_save] with the same `mask`.
#[target_feature(enable = "xsave")]
pub unsafe fn xsave_area_restore(area: &XsaveArea, mask: u64) {
    _xrstor64(area.data.as_ptr(), mask);
}

//======================================================================================================================
// Static Checks
//======================================================================================================================

const _: () = assert!(::core::mem::align_of::<XsaveArea>() == XSAVE_AREA_ALIGN);
const _: () = assert!(::core::mem::size_of::<Trapframe>() == 56);

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        context_switch,
        Trapframe,
    };
    use ::core::{
        ptr::addr_of_mut,
        sync::atomic::{
            AtomicBool,
            Ordering,
        },
    };

    static mut MAIN_TF: Trapframe = Trapframe::zeroed();
    static mut TASK_TF: Trapframe = Trapframe::zeroed();
    static ENTERED: AtomicBool = AtomicBool::new(false);

    extern "C" fn task_entry() {
        ENTERED.store(true, Ordering::SeqCst);
        unsafe { context_switch(addr_of_mut!(TASK_TF), addr_of_mut!(MAIN_TF)) };
        unreachable!("resumed a frame that was never rescheduled");
    }

    /// Tests a full switch round trip: out to a freshly built frame on its
    /// own stack and back again.
    #[test]
    fn switch_round_trip() {
        let mut stack: Vec<u8> = vec![0u8; 64 * 1024];
        let stack_top: usize = (stack.as_mut_ptr() as usize + stack.len()) & !15;
        unsafe { addr_of_mut!(TASK_TF).write(Trapframe::new(stack_top, task_entry as usize)) };

        unsafe { context_switch(addr_of_mut!(MAIN_TF), addr_of_mut!(TASK_TF)) };

        assert!(ENTERED.load(Ordering::SeqCst));
    }

    /// Tests that a fresh frame points its stack just below the planted
    /// entry address.
    #[test]
    fn fresh_frame_layout() {
        let mut stack: Vec<u8> = vec![0u8; 4096];
        let stack_top: usize = (stack.as_mut_ptr() as usize + stack.len()) & !15;
        let tf: Trapframe = Trapframe::new(stack_top, 0xdead_beef);
        assert_eq!(tf.rsp as usize, stack_top - 16);
        let planted: u64 = unsafe { ::core::ptr::read(tf.rsp as *const u64) };
        assert_eq!(planted, 0xdead_beef);
    }
}
