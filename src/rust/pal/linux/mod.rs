// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs,
    path::PathBuf,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Resolves the path of the main executable.
pub fn exe_path() -> Result<PathBuf, Fail> {
    fs::read_link("/proc/self/exe").map_err(|_| Fail::last_os_error("failed to resolve /proc/self/exe"))
}

/// Returns the `[start, end)` virtual range of the main executable's text
/// mapping, read from `/proc/self/maps`. The end is exclusive, as the maps
/// file reports it.
pub fn main_text_range() -> Result<(u64, u64), Fail> {
    let exe: PathBuf = exe_path()?;
    let maps: String =
        fs::read_to_string("/proc/self/maps").map_err(|_| Fail::last_os_error("failed to read /proc/self/maps"))?;

    for line in maps.lines() {
        // Format: start-end perms offset dev inode path
        let mut fields = line.split_whitespace();
        let range: &str = match fields.next() {
            Some(range) => range,
            None => continue,
        };
        let perms: &str = match fields.next() {
            Some(perms) => perms,
            None => continue,
        };
        if !perms.starts_with('r') || !perms.contains('x') {
            continue;
        }
        let path: &str = match fields.nth(3) {
            Some(path) => path,
            None => continue,
        };
        if PathBuf::from(path) != exe {
            continue;
        }
        let (start, end) = match range.split_once('-') {
            Some(pair) => pair,
            None => continue,
        };
        let start: u64 = u64::from_str_radix(start, 16).map_err(|_| Fail::new(libc::EINVAL, "malformed maps line"))?;
        let end: u64 = u64::from_str_radix(end, 16).map_err(|_| Fail::new(libc::EINVAL, "malformed maps line"))?;
        return Ok((start, end));
    }

    Err(Fail::new(libc::ENOENT, "no executable text mapping for the main binary"))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        exe_path,
        main_text_range,
    };

    /// Tests that the running test binary resolves to an existing path.
    #[test]
    fn exe_path_exists() {
        let path = exe_path().unwrap();
        assert!(path.is_absolute());
    }

    /// Tests that the text range is well formed and covers this function.
    #[test]
    fn text_range_covers_code() {
        let (start, end): (u64, u64) = main_text_range().unwrap();
        assert!(start < end);
        let here: u64 = text_range_covers_code as usize as u64;
        assert!(here >= start && here < end);
    }
}
