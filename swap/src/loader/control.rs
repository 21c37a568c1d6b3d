//! Ignore list of binaries whose call sites never trigger a handler load
//!
//! Entries are keyed by file identity, so adding the same file under a
//! second path (hard link, symlink) is a duplicate. Every redirection
//! check reads the list; only administrative commands write it.

use log::info;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use crate::domain::{Dentry, LoaderError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinDescriptor {
    pub dentry: Dentry,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct BinRegistry {
    bins: RwLock<Vec<BinDescriptor>>,
}

impl BinRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `path` to the ignore list
    ///
    /// # Errors
    /// - [`LoaderError::Lookup`] if the file cannot be resolved
    /// - [`LoaderError::AlreadyIgnored`] if the same file is already listed
    pub fn add_ignored_binary(&self, path: impl AsRef<Path>) -> Result<(), LoaderError> {
        let path = path.as_ref();
        let dentry = Dentry::of(path)
            .map_err(|source| LoaderError::Lookup { path: path.to_path_buf(), source })?;

        let mut bins = self.bins.write();
        if bins.iter().any(|b| b.dentry == dentry) {
            return Err(LoaderError::AlreadyIgnored(path.to_path_buf()));
        }
        bins.push(BinDescriptor { dentry, path: path.to_path_buf() });
        info!("Ignoring call sites in {} ({dentry})", path.display());
        Ok(())
    }

    /// Drop every entry, returning how many there were
    pub fn clean_ignored_bins(&self) -> usize {
        let mut bins = self.bins.write();
        let count = bins.len();
        bins.clear();
        count
    }

    #[must_use]
    pub fn contains(&self, dentry: &Dentry) -> bool {
        self.bins.read().iter().any(|b| b.dentry == *dentry)
    }

    #[must_use]
    pub fn ignored_count(&self) -> usize {
        self.bins.read().len()
    }

    #[must_use]
    pub fn ignored_names(&self) -> Vec<PathBuf> {
        self.bins.read().iter().map(|b| b.path.clone()).collect()
    }

    /// Text form of the list: one path per line
    #[must_use]
    pub fn listing(&self) -> String {
        self.bins.read().iter().fold(String::new(), |mut out, b| {
            out.push_str(&b.path.to_string_lossy());
            out.push('\n');
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_duplicate_dentry_rejected() {
        let registry = BinRegistry::new();
        let bin = NamedTempFile::new().unwrap();

        registry.add_ignored_binary(bin.path()).unwrap();
        let err = registry.add_ignored_binary(bin.path()).unwrap_err();
        assert!(matches!(err, LoaderError::AlreadyIgnored(_)));
        assert_eq!(err.errno(), -libc::EALREADY);
        assert_eq!(registry.ignored_count(), 1);
    }

    #[test]
    fn test_hard_link_is_same_binary() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("helper");
        let link = dir.path().join("helper-link");
        std::fs::write(&original, b"\x7fELF").unwrap();
        std::fs::hard_link(&original, &link).unwrap();

        let registry = BinRegistry::new();
        registry.add_ignored_binary(&original).unwrap();
        assert!(registry.add_ignored_binary(&link).is_err());
        assert!(registry.contains(&Dentry::of(&link).unwrap()));
    }

    #[test]
    fn test_count_grows_once_per_distinct_file() {
        let registry = BinRegistry::new();
        let files: Vec<_> = (0..3).map(|_| NamedTempFile::new().unwrap()).collect();
        for (i, f) in files.iter().enumerate() {
            registry.add_ignored_binary(f.path()).unwrap();
            let _ = registry.add_ignored_binary(f.path());
            assert_eq!(registry.ignored_count(), i + 1);
        }

        let names = registry.ignored_names();
        assert_eq!(names[0], files[0].path());
        assert_eq!(registry.listing().lines().count(), 3);
        assert_eq!(registry.clean_ignored_bins(), 3);
        assert_eq!(registry.ignored_count(), 0);
        assert!(registry.listing().is_empty());
    }

    #[test]
    fn test_missing_file() {
        let registry = BinRegistry::new();
        let err = registry.add_ignored_binary("/nonexistent/swap/bin").unwrap_err();
        assert!(matches!(err, LoaderError::Lookup { .. }));
        assert_eq!(err.errno(), -libc::ENOENT);
    }
}
