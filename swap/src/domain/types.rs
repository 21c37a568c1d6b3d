//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent passing a TID where a PID is expected and
//! make the trap-handler signatures explicit about whose address space an
//! address belongs to.

use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Process ID (TGID)
///
/// Identifies the address space a probe or descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

impl From<Pid> for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// Thread ID
///
/// Trap handlers run on behalf of one thread; per-thread state (single-step
/// control blocks, return instances, web tracking contexts) is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// File identity: device number + inode.
///
/// Two paths naming the same file (hard links, symlinks, bind mounts) yield
/// the same dentry, which is what the ignore list and the mmap interception
/// compare on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dentry {
    pub dev: u64,
    pub ino: u64,
}

impl Dentry {
    /// Resolve the dentry of an existing file
    ///
    /// # Errors
    /// Returns the underlying I/O error if the path cannot be stat'ed
    pub fn of(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self { dev: meta.dev(), ino: meta.ino() })
    }

    /// Build a dentry from the `major:minor inode` columns of `/proc/<pid>/maps`
    ///
    /// Encodes the device the way glibc's `makedev` does so the result
    /// compares equal to `st_dev`.
    #[must_use]
    pub fn from_maps(major: u64, minor: u64, ino: u64) -> Self {
        let dev = ((major & 0xffff_f000) << 32)
            | ((major & 0x0000_0fff) << 8)
            | ((minor & 0xffff_ff00) << 12)
            | (minor & 0x0000_00ff);
        Self { dev, ino }
    }
}

impl fmt::Display for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{:#x}/ino:{}", self.dev, self.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(Tid(7).to_string(), "TID:7");
    }

    #[test]
    fn test_dentry_from_maps_matches_stat() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let meta = std::fs::metadata(file.path()).unwrap();
        let dentry = Dentry::of(file.path()).unwrap();

        // Split st_dev the way glibc's major()/minor() do
        let dev = meta.dev();
        let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
        let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);

        assert_eq!(Dentry::from_maps(major, minor, meta.ino()), dentry);
    }

    #[test]
    fn test_dentry_missing_file() {
        assert!(Dentry::of("/nonexistent/swap/binary").is_err());
    }
}
