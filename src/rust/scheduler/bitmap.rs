// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Static-site bitmap. A sidecar file next to the executable lists the text
//! ranges at which vector state is live; the handler consults a
//! byte-per-page summary of those ranges, keyed by the interrupted program
//! counter, to decide whether a switch must save extended state. The bitmap
//! is an optimisation hook: when it is missing, every site is treated as
//! live and the handler always saves.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::linux,
    runtime::fail::Fail,
};
use ::byteorder::{
    LittleEndian,
    ReadBytesExt,
};
use ::std::{
    fs,
    io::Cursor,
    path::{
        Path,
        PathBuf,
    },
    sync::OnceLock,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Suffix of the sidecar file, resolved next to the main executable.
pub const SIDECAR_SUFFIX: &str = ".avxdump";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Byte-per-page summary of the live-site ranges, covering the main
/// executable's text mapping.
pub struct SiteBitmap {
    pages: Vec<u8>,
    text_start: u64,
    text_end: u64,
    pgsz_factor: u32,
}

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// The process-wide bitmap, installed once at runtime start.
static SITE_BITMAP: OnceLock<SiteBitmap> = OnceLock::new();

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SiteBitmap {
    /// Builds a bitmap from `(start, end)` byte ranges relative to the text
    /// start. Ends are exclusive. Every page a range touches is marked, so
    /// ranges smaller than one page are still represented.
    pub fn build(ranges: &[(u64, u64)], text_start: u64, text_end: u64, pgsz_factor: u32) -> Self {
        let text_len: u64 = text_end.saturating_sub(text_start);
        let num_pages: usize = ((text_len >> pgsz_factor) + 1) as usize;
        let mut pages: Vec<u8> = vec![0; num_pages];

        for &(start, end) in ranges {
            if end <= start {
                continue;
            }
            // Clamp to the text mapping before indexing.
            let end: u64 = end.min(text_len);
            if start >= text_len {
                continue;
            }
            let first: usize = (start >> pgsz_factor) as usize;
            let last: usize = (((end - 1) >> pgsz_factor) as usize).min(num_pages - 1);
            for page in pages.iter_mut().take(last + 1).skip(first) {
                *page = 1;
            }
        }

        Self {
            pages,
            text_start,
            text_end,
            pgsz_factor,
        }
    }

    /// Loads the headerless sidecar format: little-endian `(start, end)`
    /// pairs of byte offsets. The file size must be a multiple of 16.
    pub fn load_ranges(bytes: &[u8]) -> Result<Vec<(u64, u64)>, Fail> {
        if bytes.len() % 16 != 0 {
            return Err(Fail::new(libc::EINVAL, "sidecar size is not a multiple of 16"));
        }
        let mut cursor: Cursor<&[u8]> = Cursor::new(bytes);
        let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(bytes.len() / 16);
        for _ in 0..bytes.len() / 16 {
            let start: u64 = cursor.read_u64::<LittleEndian>().map_err(Fail::from)?;
            let end: u64 = cursor.read_u64::<LittleEndian>().map_err(Fail::from)?;
            ranges.push((start, end));
        }
        Ok(ranges)
    }

    /// Reads a sidecar file and builds the bitmap for the given text range.
    pub fn from_sidecar(path: &Path, text_start: u64, text_end: u64, pgsz_factor: u32) -> Result<Self, Fail> {
        let bytes: Vec<u8> = fs::read(path).map_err(|_| Fail::last_os_error("failed to read sidecar file"))?;
        let ranges: Vec<(u64, u64)> = Self::load_ranges(&bytes)?;
        info!(
            "site bitmap: {} ranges, {} pages of {} bytes, text [{:#x}, {:#x})",
            ranges.len(),
            (text_end.saturating_sub(text_start) >> pgsz_factor) + 1,
            1u64 << pgsz_factor,
            text_start,
            text_end
        );
        Ok(Self::build(&ranges, text_start, text_end, pgsz_factor))
    }

    /// Looks up the page bit for an absolute program counter. Addresses
    /// outside the covered text mapping yield nothing.
    pub fn query(&self, pc: u64) -> Option<bool> {
        if pc < self.text_start || pc >= self.text_end {
            return None;
        }
        let idx: usize = ((pc - self.text_start) >> self.pgsz_factor) as usize;
        self.pages.get(idx).map(|&b| b != 0)
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn marked_pages(&self) -> usize {
        self.pages.iter().filter(|&&b| b != 0).count()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds and installs the process-wide bitmap from the executable's sidecar.
pub fn init(pgsz_factor: u32) -> Result<(), Fail> {
    let exe: PathBuf = linux::exe_path()?;
    let mut sidecar: std::ffi::OsString = exe.into_os_string();
    sidecar.push(SIDECAR_SUFFIX);
    let (text_start, text_end): (u64, u64) = linux::main_text_range()?;
    let bitmap: SiteBitmap = SiteBitmap::from_sidecar(Path::new(&sidecar), text_start, text_end, pgsz_factor)?;
    if SITE_BITMAP.set(bitmap).is_err() {
        return Err(Fail::new(libc::EALREADY, "site bitmap already installed"));
    }
    Ok(())
}

/// Decides whether a switch at `pc` must save extended state. Without an
/// installed bitmap, or for a program counter the bitmap does not cover, the
/// answer is conservatively yes.
pub fn needs_xsave(pc: u64) -> bool {
    match SITE_BITMAP.get() {
        Some(bitmap) => bitmap.query(pc).unwrap_or(true),
        None => true,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
