//! Handler library injection
//!
//! For every instrumented process the [`Loader`] waits until the dynamic
//! linker is mapped and idle, then hijacks one call of a probed function to
//! run `dlopen(handler, RTLD_NOW)` inside the target. The hijacked call is
//! replayed untouched once the load returned.
//!
//! ## Flow
//!
//! 1. [`Loader::loader_add_handler`] registers handler libraries
//! 2. [`Loader::add_process`] creates the process descriptor and
//!    [`Loader::set_data_area`] copies the handler paths into the target
//! 3. [`Loader::on_mmap`] learns where the linker and handlers land
//! 4. [`Loader::instrument`] arms the return probe that drives
//!    [`redirect`]
//!
//! Load outcomes are reported to the record sink as `HANDLER_LOADED` /
//! `HANDLER_FAILED` records; linker sightings as `LOADER_BASE`.

pub mod control;
pub mod pd;
pub mod redirect;

pub use control::{BinDescriptor, BinRegistry};
pub use pd::{HandlerDescriptor, HandlerState, PdStore, ProcessDescriptor, LOADER_MAX_ATTEMPTS};

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::{Dentry, LoaderError, Pid};
use crate::memory::{Mapping, PatchSet, ProcessMemory, VmaLookup};
use crate::record::{
    handler_failed_payload, handler_loaded_payload, loader_base_payload, RecordSink,
    MSG_HANDLER_FAILED, MSG_HANDLER_LOADED, MSG_LOADER_BASE,
};
use crate::uprobes::{
    EntryOutcome, ProbeEngine, ProbeKey, ReturnInstance, ReturnOutcome, TrapContext,
    UretprobeHandler,
};

/// Per-call data of the loader probe: index of the handler being loaded
const INSTANCE_DATA_SIZE: usize = 4;
const NO_HANDLER: u32 = u32::MAX;
/// Concurrent calls tracked per probed function
const LOADER_MAXACTIVE: usize = 16;

/// Default size of the handler path area: one page
pub const DATA_AREA_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Dynamic linker binary, matched by file identity
    pub linker: PathBuf,
    /// Offset of `dlopen` from the linker's load base
    pub dlopen_offset: u64,
    /// Offset of `_r_debug` from the linker's load base
    pub r_debug_offset: u64,
    pub max_attempts: u32,
    /// Bytes available at the data area for handler paths
    pub data_area_len: usize,
}

impl LoaderConfig {
    #[must_use]
    pub fn new(linker: impl Into<PathBuf>, dlopen_offset: u64, r_debug_offset: u64) -> Self {
        Self {
            linker: linker.into(),
            dlopen_offset,
            r_debug_offset,
            max_attempts: LOADER_MAX_ATTEMPTS,
            data_area_len: DATA_AREA_LEN,
        }
    }
}

pub struct Loader {
    config: LoaderConfig,
    linker: Dentry,
    bins: BinRegistry,
    pds: PdStore,
    handlers: RwLock<Vec<(Dentry, PathBuf)>>,
    mem: Arc<dyn ProcessMemory>,
    vma: Arc<dyn VmaLookup>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl Loader {
    /// # Errors
    /// [`LoaderError::Lookup`] if the linker binary cannot be resolved
    pub fn new(
        config: LoaderConfig,
        mem: Arc<dyn ProcessMemory>,
        vma: Arc<dyn VmaLookup>,
    ) -> Result<Self, LoaderError> {
        let linker = Dentry::of(&config.linker)
            .map_err(|source| LoaderError::Lookup { path: config.linker.clone(), source })?;
        Ok(Self {
            config,
            linker,
            bins: BinRegistry::new(),
            pds: PdStore::new(),
            handlers: RwLock::new(Vec::new()),
            mem,
            vma,
            sink: None,
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Ignore list consulted by every redirection
    #[must_use]
    pub fn bins(&self) -> &BinRegistry {
        &self.bins
    }

    /// Register a handler library to load into every instrumented process
    ///
    /// Processes already instrumented get the handler too; it is loaded
    /// once their data area holds its path.
    ///
    /// # Errors
    /// - [`LoaderError::InvalidPath`] if the path contains a NUL byte
    /// - [`LoaderError::Lookup`] if the file cannot be resolved
    /// - [`LoaderError::HandlerExists`] if the same file is registered
    pub fn loader_add_handler(&self, path: impl AsRef<Path>) -> Result<(), LoaderError> {
        let path = path.as_ref();
        if path.as_os_str().as_bytes().contains(&0) {
            return Err(LoaderError::InvalidPath(path.to_path_buf()));
        }
        let dentry = Dentry::of(path)
            .map_err(|source| LoaderError::Lookup { path: path.to_path_buf(), source })?;

        {
            let mut handlers = self.handlers.write();
            if handlers.iter().any(|(d, _)| *d == dentry) {
                return Err(LoaderError::HandlerExists(path.to_path_buf()));
            }
            handlers.push((dentry, path.to_path_buf()));
        }

        for pid in self.pds.pids() {
            if let Some(pd) = self.pds.get(pid) {
                pd.lock().handlers.push(self.descriptor(dentry, path));
            }
        }
        info!("Registered handler {} ({dentry})", path.display());
        Ok(())
    }

    fn descriptor(&self, dentry: Dentry, path: &Path) -> HandlerDescriptor {
        HandlerDescriptor::new(dentry, path.to_path_buf(), self.config.max_attempts)
    }

    /// Start tracking `pid`; mappings already present are taken into account
    ///
    /// # Errors
    /// [`LoaderError::ProcessExists`] if `pid` is already tracked
    pub fn add_process(&self, pid: Pid) -> Result<(), LoaderError> {
        let mut pd = ProcessDescriptor::new(pid);
        pd.handlers =
            self.handlers.read().iter().map(|(dentry, path)| self.descriptor(*dentry, path)).collect();
        if !self.pds.insert(pd) {
            return Err(LoaderError::ProcessExists(pid));
        }

        let present = self.vma.mappings(pid);
        for mapping in &present {
            self.on_mmap(pid, mapping);
        }
        info!("Tracking {pid} ({} existing mappings)", present.len());
        Ok(())
    }

    /// # Errors
    /// [`LoaderError::UnknownProcess`] if `pid` is not tracked
    pub fn remove_process(&self, pid: Pid) -> Result<(), LoaderError> {
        self.pds.remove(pid).ok_or(LoaderError::UnknownProcess(pid))?;
        info!("Stopped tracking {pid}");
        Ok(())
    }

    /// Copy every handler path, NUL-terminated, into target memory at `addr`
    ///
    /// # Errors
    /// - [`LoaderError::UnknownProcess`] if `pid` is not tracked
    /// - [`LoaderError::DataAreaFull`] if the paths exceed
    ///   [`LoaderConfig::data_area_len`] (nothing is written)
    /// - [`LoaderError::Fault`] if the area is not writable (nothing is
    ///   written)
    pub fn set_data_area(&self, pid: Pid, addr: u64) -> Result<(), LoaderError> {
        let pd = self.pds.get(pid).ok_or(LoaderError::UnknownProcess(pid))?;
        let mut pd = pd.lock();

        let mut patch = PatchSet::new();
        let mut cursor = addr;
        let mut placed = Vec::with_capacity(pd.handlers.len());
        let mut used = 0usize;
        for hd in &pd.handlers {
            let mut bytes = hd.path.as_os_str().as_bytes().to_vec();
            bytes.push(0);
            used += bytes.len();
            let len = bytes.len() as u64;
            patch.stage(cursor, bytes);
            placed.push(cursor);
            cursor += len;
        }
        let size = self.config.data_area_len;
        if used > size {
            return Err(LoaderError::DataAreaFull { pid, needed: used, size });
        }
        patch.commit(self.mem.as_ref(), pid)?;

        for (hd, at) in pd.handlers.iter_mut().zip(placed) {
            hd.path_addr = Some(at);
        }
        pd.data_area = Some(addr);
        debug!("{pid}: {} handler paths at {addr:#x}", pd.handlers.len());
        Ok(())
    }

    /// Mmap interception: learn the load base of the linker or a handler
    ///
    /// Returns `true` if the mapping was relevant. Only the first sighting
    /// of each file counts.
    pub fn on_mmap(&self, pid: Pid, mapping: &Mapping) -> bool {
        let Some(dentry) = mapping.dentry else {
            return false;
        };
        let Some(pd) = self.pds.get(pid) else {
            return false;
        };
        let mut pd = pd.lock();
        let base = mapping.load_base();

        if dentry == self.linker {
            if pd.loader_base != 0 {
                return false;
            }
            pd.loader_base = base;
            info!("{pid}: dynamic linker at {base:#x}");
            self.emit(MSG_LOADER_BASE, &loader_base_payload(pid, base));
            return true;
        }

        match pd.handlers.iter_mut().find(|hd| hd.dentry == dentry) {
            Some(hd) if hd.base == 0 => {
                hd.base = base;
                info!("{pid}: handler {} mapped at {base:#x}", hd.path.display());
                true
            }
            _ => false,
        }
    }

    /// Arm the loader's return probe on the function at `addr` of `pid`
    ///
    /// # Errors
    /// [`LoaderError::UnknownProcess`] if `pid` is not tracked;
    /// [`LoaderError::Probe`] if the probe cannot be armed
    pub fn instrument(
        self: &Arc<Self>,
        engine: &ProbeEngine,
        pid: Pid,
        addr: u64,
    ) -> Result<ProbeKey, LoaderError> {
        if self.pds.get(pid).is_none() {
            return Err(LoaderError::UnknownProcess(pid));
        }
        let probe = Arc::new(LoaderProbe { loader: Arc::clone(self) });
        Ok(engine.register_uretprobe(pid, addr, probe, INSTANCE_DATA_SIZE, LOADER_MAXACTIVE)?)
    }

    #[must_use]
    pub fn handler_state(&self, pid: Pid, path: &Path) -> Option<HandlerState> {
        self.with_handler(pid, path, HandlerDescriptor::state)
    }

    /// Load base of a handler in `pid`; 0 until it is seen mapped
    #[must_use]
    pub fn handler_base(&self, pid: Pid, path: &Path) -> Option<u64> {
        self.with_handler(pid, path, |hd| hd.base)
    }

    #[must_use]
    pub fn loader_base(&self, pid: Pid) -> Option<u64> {
        self.pds.get(pid).map(|pd| pd.lock().loader_base)
    }

    #[must_use]
    pub fn processes(&self) -> Vec<Pid> {
        self.pds.pids()
    }

    fn with_handler<T>(
        &self,
        pid: Pid,
        path: &Path,
        f: impl FnOnce(&HandlerDescriptor) -> T,
    ) -> Option<T> {
        let pd = self.pds.get(pid)?;
        let pd = pd.lock();
        pd.handlers.iter().find(|hd| hd.path == path).map(f)
    }

    fn emit(&self, msg_id: u32, payload: &[u8]) {
        if let Some(sink) = &self.sink {
            sink.emit(msg_id, payload);
        }
    }
}

/// Return probe driving the handler load state machine
struct LoaderProbe {
    loader: Arc<Loader>,
}

impl LoaderProbe {
    fn loader_entry(&self, pd: &ProcessDescriptor) -> u64 {
        pd.loader_base + self.loader.config.dlopen_offset
    }
}

impl UretprobeHandler for LoaderProbe {
    fn entry(&self, ctx: &mut TrapContext<'_>, ri: &mut ReturnInstance<'_>) -> EntryOutcome {
        ri.data.copy_from_slice(&NO_HANDLER.to_le_bytes());
        let loader = &self.loader;
        let Some(pd) = loader.pds.get(ctx.pid) else {
            return EntryOutcome::Skip;
        };
        let mut pd = pd.lock();

        let waiting = pd
            .handlers
            .iter()
            .position(|hd| hd.state() == HandlerState::NotLoaded && hd.path_addr.is_some());
        if let Some(idx) = waiting {
            let ready = redirect::is_ready(
                ctx.mem,
                loader.vma.as_ref(),
                &loader.bins,
                &pd,
                loader.config.r_debug_offset,
                ri.orig_ret,
            );
            if ready {
                let entry = self.loader_entry(&pd);
                match redirect::not_loaded_entry(ctx, &mut pd.handlers[idx], entry) {
                    Ok(true) => {
                        #[allow(clippy::cast_possible_truncation)]
                        ri.data.copy_from_slice(&(idx as u32).to_le_bytes());
                        info!("{}: loading {}", ctx.tid, pd.handlers[idx].path.display());
                        return EntryOutcome::Redirected;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("{}: redirect failed: {e}", ctx.pid),
                }
            }
        }

        // A failed handler is retried once this call returns
        if pd.handlers.iter().any(|hd| hd.state() == HandlerState::Failed && hd.attempts() > 0) {
            EntryOutcome::Continue
        } else {
            EntryOutcome::Skip
        }
    }

    fn ret(&self, ctx: &mut TrapContext<'_>, ri: &mut ReturnInstance<'_>) -> ReturnOutcome {
        let loader = &self.loader;
        let Some(pd) = loader.pds.get(ctx.pid) else {
            return ReturnOutcome::Resume;
        };
        let mut pd = pd.lock();
        let entry = self.loader_entry(&pd);
        let pid = pd.pid;

        let mut raw = [0u8; INSTANCE_DATA_SIZE];
        raw.copy_from_slice(&ri.data[..INSTANCE_DATA_SIZE]);
        let idx = u32::from_le_bytes(raw);
        if idx == NO_HANDLER {
            for hd in &mut pd.handlers {
                if redirect::failed_return(hd) {
                    debug!("{pid}: retrying {} ({} attempts left)", hd.path.display(), hd.attempts());
                }
            }
            return ReturnOutcome::Resume;
        }

        let Some(hd) = pd.handlers.get_mut(idx as usize) else {
            return ReturnOutcome::Resume;
        };
        match redirect::loading_return(ctx, hd, ri.redirected_to, entry) {
            Ok(Some(HandlerState::Loaded)) => {
                info!("{pid}: {} loaded, handle {:#x}", hd.path.display(), hd.handle);
                let payload = handler_loaded_payload(pid, hd.base, hd.handle, &hd.path);
                loader.emit(MSG_HANDLER_LOADED, &payload);
                ReturnOutcome::Restored
            }
            Ok(Some(_)) => {
                let payload = handler_failed_payload(pid, hd.attempts(), &hd.path);
                loader.emit(MSG_HANDLER_FAILED, &payload);
                ReturnOutcome::Restored
            }
            Ok(None) => ReturnOutcome::Resume,
            Err(e) => {
                error!("{pid}: restoring the call after loading {} failed: {e}", hd.path.display());
                ReturnOutcome::Resume
            }
        }
    }
}
