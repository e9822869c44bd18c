//! Memory-map enumeration for a target process.
//!
//! Reads `/proc/[pid]/maps` into region records the purification scan walks.

use std::fs;
use std::io;

/// A parsed memory region from /proc/[pid]/maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    /// File offset this region maps, for file-backed regions.
    pub offset: u64,
    pub path: String,
}

impl MemoryRegion {
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the region is readable (first char of perms is 'r').
    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    /// Returns true if the region is executable (third char of perms is 'x').
    pub fn is_executable(&self) -> bool {
        self.perms.len() >= 3 && self.perms.as_bytes()[2] == b'x'
    }

    /// Returns true if the region is a named file mapping (not anonymous,
    /// stack, heap, or special).
    pub fn is_file_backed(&self) -> bool {
        !self.path.is_empty()
            && !self.path.starts_with('[')
            && !self.path.starts_with("anon_inode:")
    }
}

/// Parse /proc/[pid]/maps into a list of memory regions.
pub fn parse_proc_maps(pid: u32) -> io::Result<Vec<MemoryRegion>> {
    let maps_path = format!("/proc/{}/maps", pid);
    let content = fs::read_to_string(maps_path)?;
    Ok(parse_maps_content(&content))
}

pub fn parse_maps_content(content: &str) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // Format: start-end perms offset dev inode pathname
        // e.g.: 7f1234560000-7f1234570000 r-xp 00000000 fd:01 12345 /usr/lib/libc.so.6
        let mut parts = line.splitn(6, char::is_whitespace);

        let Some(range) = parts.next() else {
            continue;
        };
        let Some(perms) = parts.next() else {
            continue;
        };
        let Some(offset_hex) = parts.next() else {
            continue;
        };

        let Some((start_hex, end_hex)) = range.split_once('-') else {
            continue;
        };

        let Ok(start) = u64::from_str_radix(start_hex, 16) else {
            continue;
        };
        let Ok(end) = u64::from_str_radix(end_hex, 16) else {
            continue;
        };
        let Ok(offset) = u64::from_str_radix(offset_hex, 16) else {
            continue;
        };

        let _dev = parts.next();
        let _inode = parts.next();
        let path = parts
            .next()
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        regions.push(MemoryRegion {
            start,
            end,
            perms: perms.to_string(),
            offset,
            path,
        });
    }

    regions
}
