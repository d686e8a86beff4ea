// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// This module is for CPU architecture-specific things.

//======================================================================================================================
// Exports
//======================================================================================================================

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{
    context_switch,
    xsave_area_restore,
    xsave_area_save,
    xsave_supported,
    Trapframe,
    XsaveArea,
};

#[cfg(not(target_arch = "x86_64"))]
compile_error!("the bundle scheduler only supports x86_64");

//======================================================================================================================
// Constants
//======================================================================================================================

/// Alignment required by the compact extended-state save instructions.
pub const XSAVE_AREA_ALIGN: usize = 64;

/// Size of the on-stack extended-state scratch area. Large enough for the
/// legacy region, the header, and every component the compact format packs
/// on current parts.
pub const XSAVE_AREA_SIZE: usize = 4096;
