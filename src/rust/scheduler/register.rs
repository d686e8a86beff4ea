// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Kernel-device registration. The kernel bridge exposes a character device
//! that accepts the address of an entry stub and a delivery mode; once
//! registered, the bridge transfers control to that stub on every
//! asynchronous event. Registration failure is not fatal to the process:
//! the scheduler stays inert and the runtime proceeds without switching.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::arch::{
        self,
        x86_64,
    },
    runtime::{
        config::{
            RegisterMode,
            TscMode,
        },
        fail::Fail,
    },
};
use ::std::ffi::CString;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Path of the kernel bridge's character device.
pub const LAME_DEVICE: &str = "/dev/lame";

/// Ioctl magic of the kernel bridge.
const LAME_IOC_MAGIC: u64 = b'l' as u64;

/// Registers an interrupt-vector handler.
pub const LAME_REGISTER_INT: u64 = iow(LAME_IOC_MAGIC, 1, ::core::mem::size_of::<LameArg>() as u64);

/// Registers a performance-counter-driven handler. The switch, stall, and
/// no-op bodies all use this request and differ only in the stub address.
pub const LAME_REGISTER_PMU: u64 = iow(LAME_IOC_MAGIC, 2, ::core::mem::size_of::<LameArg>() as u64);

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// The handler body installed at registration. One variant is active per
/// worker per run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerVariant {
    /// Rotate the bundle and switch.
    Switch,
    /// Switch, then stall a fixed extra budget for overhead calibration.
    SwitchPretend,
    /// Busy-wait to a deadline; no switch.
    Stall,
    /// Return immediately.
    Nop,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Registration payload handed to the kernel bridge. The fields are read on
/// the kernel side only.
#[repr(C)]
#[allow(dead_code)]
struct LameArg {
    present: u64,
    handler_addr: u64,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Encodes a write-direction ioctl request the way the kernel's _IOW does.
const fn iow(magic: u64, nr: u64, size: u64) -> u64 {
    const IOC_WRITE: u64 = 1;
    (IOC_WRITE << 30) | (size << 16) | (magic << 8) | nr
}

/// Maps the configured modes onto a handler body.
pub fn select_variant(tsc: TscMode, register: RegisterMode) -> HandlerVariant {
    match (tsc, register) {
        (TscMode::Pretend, _) => HandlerVariant::SwitchPretend,
        (TscMode::Nop, _) => HandlerVariant::Nop,
        (TscMode::Off, RegisterMode::Stall) => HandlerVariant::Stall,
        (TscMode::Off, RegisterMode::Nop) => HandlerVariant::Nop,
        (TscMode::Off, _) => HandlerVariant::Switch,
    }
}

/// Picks the entry stub for a registration. Delivery dictates the return
/// sequence (plain return for the vector path, the bret step for the
/// counter path), and a two-member bundle gets the specialized entry.
fn select_stub(mode: RegisterMode, variant: HandlerVariant, bundle_size: u32) -> u64 {
    let stub: unsafe extern "C" fn() = match (mode, variant) {
        (RegisterMode::Int, HandlerVariant::Switch) if bundle_size == 2 => x86_64::__lame_entry2,
        (RegisterMode::Int, HandlerVariant::Switch) => x86_64::__lame_entry,
        (RegisterMode::Int, HandlerVariant::SwitchPretend) => x86_64::__lame_entry2_pretend,
        (RegisterMode::Int, _) => x86_64::__lame_entry_nop,
        (_, HandlerVariant::Stall) => x86_64::__lame_entry_stall_bret,
        (_, HandlerVariant::Nop) => x86_64::__lame_entry_nop_bret,
        (_, _) => x86_64::__lame_entry_bret,
    };
    stub as usize as u64
}

/// Validates a registration request against the configured bundle size.
/// TSC measurement bodies only make sense on a two-member bundle.
pub fn validate(variant: HandlerVariant, tsc: TscMode, bundle_size: u32) -> Result<(), Fail> {
    if tsc != TscMode::Off && bundle_size != 2 {
        return Err(Fail::new(
            libc::EINVAL,
            "TSC measurement modes require a bundle size of 2",
        ));
    }
    if variant == HandlerVariant::Switch && !arch::xsave_supported() {
        return Err(Fail::new(libc::EINVAL, "compact extended-state save is unavailable"));
    }
    Ok(())
}

/// Registers the chosen handler with the kernel bridge.
///
/// Opens the device, hands it the stub address and the delivery mode, and
/// closes it again. Errors carry the kernel's errno.
pub fn register(mode: RegisterMode, variant: HandlerVariant, bundle_size: u32) -> Result<(), Fail> {
    if mode == RegisterMode::None {
        warn!("register(): handler not registered; switching disabled");
        return Ok(());
    }

    let request: u64 = match mode {
        RegisterMode::Int => LAME_REGISTER_INT,
        _ => LAME_REGISTER_PMU,
    };
    let arg: LameArg = LameArg {
        present: 1,
        handler_addr: select_stub(mode, variant, bundle_size),
    };

    let path: CString = CString::new(LAME_DEVICE).unwrap();
    let fd: i32 = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(Fail::last_os_error("failed to open the kernel bridge device"));
    }

    let ret: i32 = unsafe { libc::ioctl(fd, request as libc::c_ulong, &arg as *const LameArg) };
    let result: Result<(), Fail> = if ret < 0 {
        Err(Fail::last_os_error("handler registration rejected"))
    } else {
        info!(
            "handler registered at {:#x} (bundle size {}, mode {:?}, variant {:?})",
            arg.handler_addr, bundle_size, mode, variant
        );
        Ok(())
    };

    unsafe { libc::close(fd) };
    result
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        register,
        select_stub,
        select_variant,
        validate,
        HandlerVariant,
        LAME_REGISTER_INT,
        LAME_REGISTER_PMU,
    };
    use crate::{
        pal::arch::x86_64,
        runtime::config::{
            RegisterMode,
            TscMode,
        },
    };

    /// Tests that the measurement modes demand a two-member bundle.
    #[test]
    fn tsc_modes_require_pair() {
        assert_eq!(
            validate(HandlerVariant::SwitchPretend, TscMode::Pretend, 4)
                .unwrap_err()
                .errno,
            libc::EINVAL
        );
        assert!(validate(HandlerVariant::SwitchPretend, TscMode::Pretend, 2).is_ok());
        assert!(validate(HandlerVariant::Nop, TscMode::Nop, 2).is_ok());
    }

    /// Tests the mode-to-body mapping.
    #[test]
    fn variant_selection() {
        assert_eq!(select_variant(TscMode::Off, RegisterMode::Pmu), HandlerVariant::Switch);
        assert_eq!(select_variant(TscMode::Off, RegisterMode::Stall), HandlerVariant::Stall);
        assert_eq!(select_variant(TscMode::Off, RegisterMode::Nop), HandlerVariant::Nop);
        assert_eq!(
            select_variant(TscMode::Pretend, RegisterMode::Int),
            HandlerVariant::SwitchPretend
        );
        assert_eq!(select_variant(TscMode::Nop, RegisterMode::Pmu), HandlerVariant::Nop);
    }

    /// Tests that stub selection specializes a two-member bundle and splits
    /// the return sequences by delivery.
    #[test]
    fn stub_selection() {
        let general: u64 = select_stub(RegisterMode::Int, HandlerVariant::Switch, 4);
        let pair: u64 = select_stub(RegisterMode::Int, HandlerVariant::Switch, 2);
        assert_eq!(general, x86_64::__lame_entry as usize as u64);
        assert_eq!(pair, x86_64::__lame_entry2 as usize as u64);
        assert_ne!(general, pair);

        let pmu: u64 = select_stub(RegisterMode::Pmu, HandlerVariant::Switch, 4);
        assert_eq!(pmu, x86_64::__lame_entry_bret as usize as u64);
        let stall: u64 = select_stub(RegisterMode::Stall, HandlerVariant::Stall, 4);
        assert_eq!(stall, x86_64::__lame_entry_stall_bret as usize as u64);
    }

    /// Tests the ioctl request encoding against the kernel's layout.
    #[test]
    fn ioctl_encoding() {
        // Write direction, 16-byte payload, magic 'l', request numbers 1/2.
        assert_eq!(LAME_REGISTER_INT, (1 << 30) | (16 << 16) | ((b'l' as u64) << 8) | 1);
        assert_eq!(LAME_REGISTER_PMU, (1 << 30) | (16 << 16) | ((b'l' as u64) << 8) | 2);
    }

    /// Tests that registering with no mode is an inert success.
    #[test]
    fn none_mode_is_inert() {
        assert!(register(RegisterMode::None, HandlerVariant::Switch, 4).is_ok());
    }

    /// Tests that registration without the device propagates the kernel
    /// errno rather than panicking.
    #[test]
    fn missing_device_propagates_errno() {
        if std::path::Path::new(super::LAME_DEVICE).exists() {
            return;
        }
        let err = register(RegisterMode::Int, HandlerVariant::Switch, 4).unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }
}
