// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    scheduler::bundle::BUNDLE_SIZE_MAX,
};
use ::std::fs;
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Timestamp-counter measurement mode. Anything but `Off` replaces the
/// switching body with a calibration variant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TscMode {
    Off,
    /// Switch, plus a fixed extra stall to calibrate overhead.
    Pretend,
    /// Return immediately.
    Nop,
}

/// How the handler is registered with the kernel bridge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterMode {
    /// Do not register; the scheduler stays inert.
    None,
    /// Synchronous delivery at an interrupt vector.
    Int,
    /// Performance-counter overflow delivery, switching body.
    Pmu,
    /// Performance-counter overflow delivery, stall-emulation body.
    Stall,
    /// Performance-counter overflow delivery, no-op body.
    Nop,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration, parsed from the `lame` section of a YAML file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LameConfig {
    /// Effective bundle size per worker, in `[1, BUNDLE_SIZE_MAX]`.
    pub bundle_size: u32,
    /// TSC measurement mode.
    pub tsc: TscMode,
    /// Registration mode.
    pub register: RegisterMode,
    /// Bitmap page-size exponent; negative disables the bitmap.
    pub bitmap_pgsz_factor: i64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LameConfig {
    /// Parses a configuration file.
    pub fn from_file(path: &str) -> Result<Self, Fail> {
        let contents: String =
            fs::read_to_string(path).map_err(|_| Fail::last_os_error("failed to read configuration file"))?;
        Self::from_str(&contents)
    }

    /// Parses configuration text. Missing keys take their defaults;
    /// malformed values fail with `EINVAL`.
    pub fn from_str(contents: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> =
            YamlLoader::load_from_str(contents).map_err(|_| Fail::new(libc::EINVAL, "malformed YAML"))?;
        let root: &Yaml = match docs.first() {
            Some(root) => root,
            None => return Ok(Self::default()),
        };
        let section: &Yaml = &root["lame"];

        let mut config: LameConfig = Self::default();

        if !section["bundle_size"].is_badvalue() {
            let size: i64 = section["bundle_size"]
                .as_i64()
                .ok_or_else(|| Fail::new(libc::EINVAL, "bundle_size must be an integer"))?;
            if size < 1 || size as usize > BUNDLE_SIZE_MAX {
                return Err(Fail::new(libc::EINVAL, "bundle_size out of range"));
            }
            config.bundle_size = size as u32;
        }

        if !section["tsc"].is_badvalue() {
            config.tsc = match section["tsc"].as_str() {
                Some("off") => TscMode::Off,
                Some("pretend") => TscMode::Pretend,
                Some("nop") => TscMode::Nop,
                _ => return Err(Fail::new(libc::EINVAL, "tsc must be off, pretend, or nop")),
            };
        }

        if !section["register"].is_badvalue() {
            config.register = match section["register"].as_str() {
                Some("none") => RegisterMode::None,
                Some("int") => RegisterMode::Int,
                Some("pmu") => RegisterMode::Pmu,
                Some("stall") => RegisterMode::Stall,
                Some("nop") => RegisterMode::Nop,
                _ => {
                    return Err(Fail::new(
                        libc::EINVAL,
                        "register must be none, int, pmu, stall, or nop",
                    ))
                },
            };
        }

        if !section["bitmap_pgsz_factor"].is_badvalue() {
            config.bitmap_pgsz_factor = section["bitmap_pgsz_factor"]
                .as_i64()
                .ok_or_else(|| Fail::new(libc::EINVAL, "bitmap_pgsz_factor must be an integer"))?;
        }

        Ok(config)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LameConfig {
    fn default() -> Self {
        Self {
            bundle_size: 1,
            tsc: TscMode::Off,
            register: RegisterMode::None,
            bitmap_pgsz_factor: -1,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
