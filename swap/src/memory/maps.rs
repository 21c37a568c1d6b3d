//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` into [`Mapping`]s. The loader uses them to learn
//! where the dynamic linker and handler libraries landed and which binary
//! owns a call site.

use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{Dentry, Pid};

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    /// `None` for anonymous mappings (inode 0)
    pub dentry: Option<Dentry>,
    pub path: Option<PathBuf>,
}

impl Mapping {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// Load base of the file this mapping belongs to
    #[must_use]
    pub fn load_base(&self) -> u64 {
        self.start.saturating_sub(self.offset)
    }
}

/// Parse one maps line: "start-end perms offset major:minor inode [path]"
fn parse_line(line: &str) -> Option<Mapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.to_string();
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let (major, minor) = parts.next()?.split_once(':')?;
    let ino: u64 = parts.next()?.parse().ok()?;
    // Paths may contain spaces; everything after the inode belongs to it
    let rest: Vec<&str> = parts.collect();
    let path = (!rest.is_empty()).then(|| PathBuf::from(rest.join(" ")));

    let dentry = if ino == 0 {
        None
    } else {
        Some(Dentry::from_maps(
            u64::from_str_radix(major, 16).ok()?,
            u64::from_str_radix(minor, 16).ok()?,
            ino,
        ))
    };

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        dentry,
        path,
    })
}

/// Parse the full text of a maps file, skipping malformed lines
#[must_use]
pub fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines()
        .filter_map(|line| {
            let mapping = parse_line(line);
            if mapping.is_none() && !line.trim().is_empty() {
                debug!("Skipping malformed maps line: {line}");
            }
            mapping
        })
        .collect()
}

/// VMA lookup for a monitored process
pub trait VmaLookup: Send + Sync {
    /// All mappings of `pid` (empty if the process is gone)
    fn mappings(&self, pid: Pid) -> Vec<Mapping>;

    /// Mapping containing `addr`
    fn mapping_at(&self, pid: Pid, addr: u64) -> Option<Mapping> {
        self.mappings(pid).into_iter().find(|m| m.contains(addr))
    }
}

/// Live lookup through `/proc/<pid>/maps`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMaps;

impl VmaLookup for ProcMaps {
    fn mappings(&self, pid: Pid) -> Vec<Mapping> {
        let maps_path = format!("/proc/{}/maps", pid.0);
        match fs::read_to_string(&maps_path) {
            Ok(text) => parse_maps(&text),
            Err(e) => {
                debug!("Failed to read {maps_path}: {e}");
                Vec::new()
            }
        }
    }
}

/// Fixed set of mappings per process, updated explicitly
#[derive(Default)]
pub struct MapsSnapshot {
    maps: RwLock<HashMap<Pid, Vec<Mapping>>>,
}

impl MapsSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: Pid, mapping: Mapping) {
        self.maps.write().entry(pid).or_default().push(mapping);
    }
}

impl VmaLookup for MapsSnapshot {
    fn mappings(&self, pid: Pid) -> Vec<Mapping> {
        self.maps.read().get(&pid).cloned().unwrap_or_default()
    }
}

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Find the full range spanned by every mapping of `binary_path`
///
/// Returns `None` if the binary is not mapped in `pid`.
pub fn find_binary_range(
    lookup: &dyn VmaLookup,
    pid: Pid,
    binary_path: &Path,
) -> Option<MemoryRange> {
    let range = lookup
        .mappings(pid)
        .iter()
        .filter(|m| m.path.as_deref() == Some(binary_path))
        .fold(None, |acc: Option<MemoryRange>, m| {
            Some(acc.map_or(MemoryRange { start: m.start, end: m.end }, |r| MemoryRange {
                start: r.start.min(m.start),
                end: r.end.max(m.end),
            }))
        })?;

    info!(
        "{} mapped at 0x{:x} - 0x{:x} (size: {} KB)",
        binary_path.display(),
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
08048000-08049000 r-xp 00000000 08:01 131090     /usr/bin/app
08049000-0804a000 rw-p 00000000 08:01 131090     /usr/bin/app
b7700000-b7720000 r-xp 00000000 08:01 262150     /lib/ld-linux.so.2
b7720000-b7721000 rw-p 0001f000 08:01 262150     /lib/ld-linux.so.2
b7800000-b7801000 rw-p 00000000 00:00 0
bffdf000-c0000000 rw-p 00000000 00:00 0          [stack]
garbage line
b7900000-b7901000 r-xp 00000000 08:01 9999       /opt/My Lib/libh.so
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 7);

        let ld = &maps[3];
        assert_eq!(ld.start, 0xb772_0000);
        assert_eq!(ld.offset, 0x1f000);
        assert_eq!(ld.load_base(), 0xb770_1000);
        assert_eq!(ld.dentry, Some(Dentry::from_maps(8, 1, 262_150)));
        assert!(!ld.is_executable());
        assert!(maps[2].is_executable());

        assert_eq!(maps[4].dentry, None);
        assert_eq!(maps[4].path, None);
        assert_eq!(maps[5].path.as_deref(), Some(Path::new("[stack]")));
        assert_eq!(maps[6].path.as_deref(), Some(Path::new("/opt/My Lib/libh.so")));
    }

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_snapshot_lookup_and_range() {
        let snapshot = MapsSnapshot::new();
        for m in parse_maps(MAPS) {
            snapshot.insert(Pid(5), m);
        }

        let hit = snapshot.mapping_at(Pid(5), 0x0804_8010).unwrap();
        assert_eq!(hit.path.as_deref(), Some(Path::new("/usr/bin/app")));
        assert!(snapshot.mapping_at(Pid(5), 0x1000).is_none());
        assert!(snapshot.mapping_at(Pid(6), 0x0804_8010).is_none());

        let range = find_binary_range(&snapshot, Pid(5), Path::new("/usr/bin/app")).unwrap();
        assert_eq!((range.start, range.end), (0x0804_8000, 0x0804_a000));
        assert!(find_binary_range(&snapshot, Pid(5), Path::new("/missing")).is_none());
    }

    #[test]
    fn test_proc_maps_self() {
        // Our own maps must at least contain the stack
        #[allow(clippy::cast_possible_wrap)]
        let maps = ProcMaps.mappings(Pid(std::process::id()));
        assert!(maps.iter().any(|m| m.path.as_deref() == Some(Path::new("[stack]"))));
    }
}
