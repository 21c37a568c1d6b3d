//! Process and handler descriptors
//!
//! A [`ProcessDescriptor`] exists per instrumented process and holds one
//! [`HandlerDescriptor`] per handler library to load into it. Each handler
//! descriptor runs the load state machine:
//!
//! ```text
//!   NotLoaded ──entry──▶ Loading ──return, handle != 0──▶ Loaded
//!       ▲                   │
//!       │                return, handle == 0 (attempts - 1)
//!       │                   ▼
//!       └──attempts > 0── Failed   (terminal once attempts reach 0)
//! ```

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::{Dentry, Pid};
use crate::uprobes::Regs;

/// Load attempts per handler before it stays failed
pub const LOADER_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Register file and stack arguments of the call hijacked for a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedCall {
    pub regs: Regs,
    pub args: [u64; 2],
}

#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub dentry: Dentry,
    pub path: PathBuf,
    /// Address of the NUL-terminated path inside the target, once copied
    pub path_addr: Option<u64>,
    /// Value returned by the in-process load call
    pub handle: u64,
    /// Load base, once the library is seen mapped
    pub base: u64,
    attempts: u32,
    state: HandlerState,
    saved: Option<SavedCall>,
}

impl HandlerDescriptor {
    #[must_use]
    pub fn new(dentry: Dentry, path: PathBuf, max_attempts: u32) -> Self {
        Self {
            dentry,
            path,
            path_addr: None,
            handle: 0,
            base: 0,
            attempts: max_attempts,
            state: HandlerState::NotLoaded,
            saved: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn saved_call(&self) -> Option<&SavedCall> {
        self.saved.as_ref()
    }

    /// `NotLoaded -> Loading`, keeping the hijacked call
    pub(crate) fn begin_loading(&mut self, saved: SavedCall) -> bool {
        if self.state != HandlerState::NotLoaded {
            return false;
        }
        self.saved = Some(saved);
        self.state = HandlerState::Loading;
        true
    }

    /// `Loading -> Loaded | Failed`, handing back the hijacked call
    pub(crate) fn finish_loading(&mut self, handle: u64) -> Option<SavedCall> {
        if self.state != HandlerState::Loading {
            return None;
        }
        self.handle = handle;
        if handle == 0 {
            self.attempts = self.attempts.saturating_sub(1);
            self.state = HandlerState::Failed;
        } else {
            self.state = HandlerState::Loaded;
        }
        self.saved.take()
    }

    /// `Failed -> NotLoaded` while attempts remain
    pub(crate) fn retry(&mut self) -> bool {
        if self.state == HandlerState::Failed && self.attempts > 0 {
            self.state = HandlerState::NotLoaded;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub pid: Pid,
    /// Load base of the dynamic linker; 0 until it is seen mapped
    pub loader_base: u64,
    /// Target memory reserved for handler paths
    pub data_area: Option<u64>,
    pub handlers: Vec<HandlerDescriptor>,
}

impl ProcessDescriptor {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid, loader_base: 0, data_area: None, handlers: Vec::new() }
    }

    #[must_use]
    pub fn handler(&self, dentry: &Dentry) -> Option<&HandlerDescriptor> {
        self.handlers.iter().find(|hd| hd.dentry == *dentry)
    }
}

/// Descriptor table: map-level lock for insert/remove, one lock per process
#[derive(Default)]
pub struct PdStore {
    pds: RwLock<HashMap<Pid, Arc<Mutex<ProcessDescriptor>>>>,
}

impl PdStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh descriptor; `false` if `pid` already has one
    pub fn insert(&self, pd: ProcessDescriptor) -> bool {
        let mut pds = self.pds.write();
        if pds.contains_key(&pd.pid) {
            return false;
        }
        pds.insert(pd.pid, Arc::new(Mutex::new(pd)));
        true
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<Arc<Mutex<ProcessDescriptor>>> {
        self.pds.read().get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Mutex<ProcessDescriptor>>> {
        self.pds.write().remove(&pid)
    }

    #[must_use]
    pub fn pids(&self) -> Vec<Pid> {
        self.pds.read().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pds.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pds.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hd() -> HandlerDescriptor {
        HandlerDescriptor::new(Dentry { dev: 1, ino: 2 }, PathBuf::from("/lib/h.so"), 2)
    }

    fn saved() -> SavedCall {
        SavedCall { regs: Regs { ip: 0x1000, ..Regs::default() }, args: [1, 2] }
    }

    #[test]
    fn test_success_path() {
        let mut hd = hd();
        assert!(hd.begin_loading(saved()));
        assert!(!hd.begin_loading(saved()));
        assert_eq!(hd.state(), HandlerState::Loading);

        let call = hd.finish_loading(0x0805_5000).unwrap();
        assert_eq!(call.args, [1, 2]);
        assert_eq!(hd.state(), HandlerState::Loaded);
        assert_eq!(hd.handle, 0x0805_5000);
        assert!(!hd.retry());
    }

    #[test]
    fn test_failures_are_bounded() {
        let mut hd = hd();
        for left in [1, 0] {
            assert!(hd.begin_loading(saved()));
            assert!(hd.finish_loading(0).is_some());
            assert_eq!(hd.state(), HandlerState::Failed);
            assert_eq!(hd.attempts(), left);
            assert_eq!(hd.retry(), left > 0);
        }
        assert_eq!(hd.state(), HandlerState::Failed);
        assert!(!hd.begin_loading(saved()));
    }

    #[test]
    fn test_finish_requires_loading() {
        let mut hd = hd();
        assert!(hd.finish_loading(1).is_none());
        assert_eq!(hd.state(), HandlerState::NotLoaded);
    }

    #[test]
    fn test_store() {
        let store = PdStore::new();
        assert!(store.insert(ProcessDescriptor::new(Pid(4))));
        assert!(!store.insert(ProcessDescriptor::new(Pid(4))));
        store.get(Pid(4)).unwrap().lock().loader_base = 0xb770_0000;
        assert_eq!(store.get(Pid(4)).unwrap().lock().loader_base, 0xb770_0000);
        assert_eq!(store.pids(), vec![Pid(4)]);
        assert!(store.remove(Pid(4)).is_some());
        assert!(store.is_empty());
    }
}
