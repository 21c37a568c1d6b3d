//! Control files of the web probes
//!
//! Mirrors the debugfs directory an operator configures the web probes
//! through:
//!
//! | file           | content                          |
//! |----------------|----------------------------------|
//! | `enabled`      | `0` or `1`                       |
//! | `app_info`     | `<binary path> <application id>` |
//! | `soup_req`     | hex offset, `0` = look up symbol |
//! | `redraw_begin` | hex offset, `0` = look up symbol |
//! | `redraw_end`   | hex offset, `0` = look up symbol |
//!
//! Probe offsets come from the exported WebKit symbols of the binary in
//! `app_info`. Symbols are matched by their mangled `Class::method` prefix
//! so parameter lists may differ between WebKit builds.

use log::{debug, error, info, warn};
use object::{Object, ObjectSymbol};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::res::ResKind;
use super::tracker::WspTracker;
use crate::domain::{Pid, WspError};
use crate::uprobes::{ProbeEngine, ProbeKey, TrapContext, MAX_ARGS};

pub const FILES: [&str; 5] = ["enabled", "app_info", "soup_req", "redraw_begin", "redraw_end"];

/// Function a web probe sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WspProbe {
    WillSendRequest,
    MainWillSendRequest,
    SoupRequest,
    DidReceiveData,
    DidFinishLoading,
    MainDidFinishLoading,
    RedrawBegin,
    RedrawEnd,
}

impl WspProbe {
    pub const ALL: [WspProbe; 8] = [
        WspProbe::WillSendRequest,
        WspProbe::MainWillSendRequest,
        WspProbe::SoupRequest,
        WspProbe::DidReceiveData,
        WspProbe::DidFinishLoading,
        WspProbe::MainDidFinishLoading,
        WspProbe::RedrawBegin,
        WspProbe::RedrawEnd,
    ];

    /// Mangled name prefix up to and including the method name
    #[must_use]
    pub fn symbol_prefix(self) -> &'static str {
        match self {
            WspProbe::WillSendRequest => "_ZN7WebCore14ResourceLoader15willSendRequest",
            WspProbe::MainWillSendRequest => "_ZN7WebCore18MainResourceLoader15willSendRequest",
            WspProbe::SoupRequest => "_ZN7WebCore14ResourceHandle16sendPendingRequest",
            WspProbe::DidReceiveData => "_ZN7WebCore14ResourceLoader14didReceiveData",
            WspProbe::DidFinishLoading => "_ZN7WebCore14ResourceLoader16didFinishLoading",
            WspProbe::MainDidFinishLoading => "_ZN7WebCore18MainResourceLoader16didFinishLoading",
            WspProbe::RedrawBegin => "_ZN6WebKit20LayerTreeCoordinator19flushPendingLayerChanges",
            WspProbe::RedrawEnd => "_ZN6WebKit20LayerTreeCoordinator20didFlushRootLayer",
        }
    }

    /// The three probes an operator may place by hand are optional
    #[must_use]
    pub fn is_required(self) -> bool {
        !matches!(self, WspProbe::SoupRequest | WspProbe::RedrawBegin | WspProbe::RedrawEnd)
    }
}

impl fmt::Display for WspProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WspProbe::WillSendRequest => "ResourceLoader::willSendRequest",
            WspProbe::MainWillSendRequest => "MainResourceLoader::willSendRequest",
            WspProbe::SoupRequest => "soup_req",
            WspProbe::DidReceiveData => "ResourceLoader::didReceiveData",
            WspProbe::DidFinishLoading => "ResourceLoader::didFinishLoading",
            WspProbe::MainDidFinishLoading => "MainResourceLoader::didFinishLoading",
            WspProbe::RedrawBegin => "redraw_begin",
            WspProbe::RedrawEnd => "redraw_end",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedProbe {
    pub probe: WspProbe,
    /// Offset from the binary's load base
    pub offset: u64,
    pub from_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub path: PathBuf,
    pub app_id: String,
}

#[derive(Debug, Default)]
struct Settings {
    enabled: bool,
    app_info: Option<AppInfo>,
    soup_req: u64,
    redraw_begin: u64,
    redraw_end: u64,
}

pub struct WspControl {
    settings: Mutex<Settings>,
    tracker: Arc<WspTracker>,
}

fn parse_hex(name: &str, text: &str) -> Result<u64, WspError> {
    let text = text.trim();
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|e| WspError::InvalidInput(format!("{name}: {text:?}: {e}")))
}

fn parse_app_info(text: &str) -> Result<AppInfo, WspError> {
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(path), Some(app_id), None) => {
            Ok(AppInfo { path: PathBuf::from(path), app_id: app_id.to_string() })
        }
        _ => Err(WspError::InvalidInput(format!("app_info: expected '<path> <app_id>', got {text:?}"))),
    }
}

/// Pick probe offsets out of a symbol list
///
/// `overrides` holds the hand-set offsets of `soup_req`, `redraw_begin`
/// and `redraw_end`, zero meaning none.
///
/// # Errors
/// [`WspError::SymbolNotFound`] if a required probe has no symbol
pub fn select_probes<'a>(
    symbols: impl IntoIterator<Item = (&'a str, u64)>,
    overrides: [u64; 3],
    path: &Path,
) -> Result<Vec<ResolvedProbe>, WspError> {
    let symbols: Vec<(&str, u64)> = symbols.into_iter().filter(|&(_, addr)| addr != 0).collect();
    let mut out = Vec::with_capacity(WspProbe::ALL.len());

    for probe in WspProbe::ALL {
        let manual = match probe {
            WspProbe::SoupRequest => overrides[0],
            WspProbe::RedrawBegin => overrides[1],
            WspProbe::RedrawEnd => overrides[2],
            _ => 0,
        };
        if manual != 0 {
            out.push(ResolvedProbe { probe, offset: manual, from_override: true });
            continue;
        }

        let prefix = probe.symbol_prefix();
        match symbols.iter().find(|(name, _)| name.starts_with(prefix)) {
            Some(&(name, offset)) => {
                debug!("{probe}: {name} at {offset:#x}");
                out.push(ResolvedProbe { probe, offset, from_override: false });
            }
            None if probe.is_required() => {
                return Err(WspError::SymbolNotFound { name: prefix.to_string(), path: path.to_path_buf() });
            }
            None => warn!("{probe}: no symbol in {} and no override, skipping", path.display()),
        }
    }
    Ok(out)
}

impl WspControl {
    #[must_use]
    pub fn new(tracker: Arc<WspTracker>) -> Self {
        Self { settings: Mutex::new(Settings::default()), tracker }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<WspTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.lock().enabled
    }

    #[must_use]
    pub fn app_info(&self) -> Option<AppInfo> {
        self.settings.lock().app_info.clone()
    }

    /// Write one control file
    ///
    /// # Errors
    /// - [`WspError::InvalidInput`] for an unknown file or malformed text
    /// - [`WspError::NotConfigured`] when enabling without `app_info`
    pub fn write_file(&self, name: &str, text: &str) -> Result<(), WspError> {
        let mut settings = self.settings.lock();
        match name {
            "enabled" => match text.trim() {
                "1" => {
                    let Some(app) = &settings.app_info else {
                        return Err(WspError::NotConfigured("app_info"));
                    };
                    info!("Web probes enabled for {} ({})", app.app_id, app.path.display());
                    settings.enabled = true;
                }
                "0" => settings.enabled = false,
                other => {
                    return Err(WspError::InvalidInput(format!("enabled: expected 0 or 1, got {other:?}")))
                }
            },
            "app_info" => settings.app_info = Some(parse_app_info(text)?),
            "soup_req" => settings.soup_req = parse_hex(name, text)?,
            "redraw_begin" => settings.redraw_begin = parse_hex(name, text)?,
            "redraw_end" => settings.redraw_end = parse_hex(name, text)?,
            other => return Err(WspError::InvalidInput(format!("no control file {other:?}"))),
        }
        Ok(())
    }

    /// Read one control file back
    ///
    /// # Errors
    /// [`WspError::InvalidInput`] for an unknown file
    pub fn read_file(&self, name: &str) -> Result<String, WspError> {
        let settings = self.settings.lock();
        Ok(match name {
            "enabled" => format!("{}\n", u8::from(settings.enabled)),
            "app_info" => settings
                .app_info
                .as_ref()
                .map(|a| format!("{} {}\n", a.path.display(), a.app_id))
                .unwrap_or_default(),
            "soup_req" => format!("{:#x}\n", settings.soup_req),
            "redraw_begin" => format!("{:#x}\n", settings.redraw_begin),
            "redraw_end" => format!("{:#x}\n", settings.redraw_end),
            other => return Err(WspError::InvalidInput(format!("no control file {other:?}"))),
        })
    }

    fn overrides(&self) -> [u64; 3] {
        let s = self.settings.lock();
        [s.soup_req, s.redraw_begin, s.redraw_end]
    }

    /// Resolve every probe offset in the ELF file at `path`
    ///
    /// # Errors
    /// - [`WspError::Io`] if the file cannot be read
    /// - [`WspError::Elf`] if it is not a parsable object
    /// - [`WspError::SymbolNotFound`] for a missing required symbol
    pub fn resolve_probes(&self, path: &Path) -> Result<Vec<ResolvedProbe>, WspError> {
        let data = std::fs::read(path)?;
        let obj = object::File::parse(&*data)
            .map_err(|e| WspError::Elf { path: path.to_path_buf(), reason: e.to_string() })?;

        let symbols: Vec<(&str, u64)> = obj
            .dynamic_symbols()
            .chain(obj.symbols())
            .filter(|s| s.is_definition())
            .filter_map(|s| s.name().ok().map(|name| (name, s.address())))
            .collect();
        debug!("{}: {} defined symbols", path.display(), symbols.len());

        select_probes(symbols, self.overrides(), path)
    }

    /// Resolve the probes of the configured binary and arm them in `pid`,
    /// whose copy of the binary is loaded at `base`
    ///
    /// # Errors
    /// - [`WspError::NotConfigured`] unless enabled
    /// - see [`WspControl::resolve_probes`] and [`WspControl::arm_probes`]
    pub fn arm(&self, engine: &ProbeEngine, pid: Pid, base: u64) -> Result<Vec<ProbeKey>, WspError> {
        let app = {
            let settings = self.settings.lock();
            if !settings.enabled {
                return Err(WspError::NotConfigured("enabled"));
            }
            settings.app_info.clone().ok_or(WspError::NotConfigured("app_info"))?
        };
        let probes = self.resolve_probes(&app.path)?;
        self.arm_probes(engine, pid, base, &probes)
    }

    /// Register an entry probe per resolved function
    ///
    /// All or nothing: when one registration fails, the probes armed before
    /// it are unregistered again.
    ///
    /// # Errors
    /// [`WspError::Probe`] from the engine
    pub fn arm_probes(
        &self,
        engine: &ProbeEngine,
        pid: Pid,
        base: u64,
        probes: &[ResolvedProbe],
    ) -> Result<Vec<ProbeKey>, WspError> {
        let mut keys = Vec::with_capacity(probes.len());
        for resolved in probes {
            let probe = resolved.probe;
            let tracker = Arc::clone(&self.tracker);
            let handler = move |ctx: &mut TrapContext<'_>, args: &[u64; MAX_ARGS]| {
                dispatch(&tracker, probe, ctx, args);
            };
            let addr = base.wrapping_add(resolved.offset);
            match engine.register_uprobe(pid, addr, Some(Arc::new(handler))) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    warn!("{probe} at {addr:#x} in {pid}: {e}, disarming {} web probes", keys.len());
                    for key in keys {
                        if let Err(e) = engine.unregister(key) {
                            error!("Failed to disarm web probe at {:#x}: {e}", key.addr);
                        }
                    }
                    return Err(e.into());
                }
            }
            debug!("{probe} armed at {addr:#x} in {pid}");
        }
        info!("Armed {} web probes in {pid}", keys.len());
        Ok(keys)
    }
}

/// Feed one probe hit to the tracker; `args[0]` is the loader object
fn dispatch(tracker: &WspTracker, probe: WspProbe, ctx: &TrapContext<'_>, args: &[u64; MAX_ARGS]) {
    let tid = ctx.tid;
    let this = args[0];
    let result = match probe {
        WspProbe::WillSendRequest => tracker.on_will_request(tid, this, ResKind::Any).map(|_| ()),
        WspProbe::MainWillSendRequest => tracker.on_will_request(tid, this, ResKind::Main).map(|_| ()),
        WspProbe::SoupRequest => tracker.on_soup_request(tid, this),
        WspProbe::DidReceiveData => tracker.on_add_data(tid, this),
        WspProbe::DidFinishLoading => tracker.on_finish_loading(tid, this, ResKind::Any),
        WspProbe::MainDidFinishLoading => tracker.on_finish_loading(tid, this, ResKind::Main),
        WspProbe::RedrawBegin => {
            tracker.on_redraw_begin(tid);
            Ok(())
        }
        WspProbe::RedrawEnd => {
            tracker.on_redraw_end(tid);
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!("{probe} in {tid}: {e}, event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProbeError, Tid};
    use crate::memory::{ProcessMemory, ScratchMemory};
    use crate::uprobes::{Regs, TrapAction};
    use std::io::Write;

    const PID: Pid = Pid(300);
    const TID: Tid = Tid(301);
    const BASE: u64 = 0xb600_0000;
    const SLOTS: u64 = 0x4000_0000;
    const SP: u64 = 0xbfff_e000;

    fn all_symbols() -> Vec<(String, u64)> {
        WspProbe::ALL
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("{}ERKNS_15ResourceRequestE", p.symbol_prefix()), 0x1000 + 0x100 * i as u64))
            .collect()
    }

    fn control() -> WspControl {
        WspControl::new(Arc::new(WspTracker::new()))
    }

    #[test]
    fn test_enable_requires_app_info() {
        let control = control();
        assert!(matches!(control.write_file("enabled", "1"), Err(WspError::NotConfigured("app_info"))));
        assert!(!control.is_enabled());

        control.write_file("app_info", "/usr/lib/libewebkit2.so org.example.browser\n").unwrap();
        control.write_file("enabled", "1\n").unwrap();
        assert!(control.is_enabled());
        assert_eq!(control.read_file("enabled").unwrap(), "1\n");
        assert_eq!(
            control.read_file("app_info").unwrap(),
            "/usr/lib/libewebkit2.so org.example.browser\n"
        );
    }

    #[test]
    fn test_control_file_input_errors() {
        let control = control();
        assert!(control.write_file("app_info", "/only/a/path").is_err());
        assert!(control.write_file("enabled", "yes").is_err());
        assert!(control.write_file("soup_req", "0xzz").is_err());
        assert!(control.write_file("trace", "1").is_err());
        assert!(control.read_file("trace").is_err());

        control.write_file("soup_req", "0x1f40").unwrap();
        control.write_file("redraw_end", "2a").unwrap();
        assert_eq!(control.read_file("soup_req").unwrap(), "0x1f40\n");
        assert_eq!(control.read_file("redraw_end").unwrap(), "0x2a\n");
    }

    #[test]
    fn test_select_probes_with_overrides() {
        let symbols = all_symbols();
        let path = Path::new("libewebkit2.so");
        let resolved =
            select_probes(symbols.iter().map(|(n, a)| (n.as_str(), *a)), [0x9000, 0, 0], path).unwrap();

        assert_eq!(resolved.len(), WspProbe::ALL.len());
        let soup = resolved.iter().find(|r| r.probe == WspProbe::SoupRequest).unwrap();
        assert_eq!((soup.offset, soup.from_override), (0x9000, true));
        let finish = resolved.iter().find(|r| r.probe == WspProbe::DidFinishLoading).unwrap();
        assert_eq!((finish.offset, finish.from_override), (0x1400, false));
    }

    #[test]
    fn test_select_probes_missing_symbols() {
        let path = Path::new("libewebkit2.so");
        let required: Vec<(String, u64)> =
            all_symbols().into_iter().filter(|(n, _)| !n.contains("LayerTree") && !n.contains("Handle")).collect();
        let resolved =
            select_probes(required.iter().map(|(n, a)| (n.as_str(), *a)), [0; 3], path).unwrap();
        assert_eq!(resolved.len(), 5);

        let err = select_probes(required.iter().skip(1).map(|(n, a)| (n.as_str(), *a)), [0; 3], path)
            .unwrap_err();
        assert_eq!(err.errno(), -libc::ENOENT);
    }

    #[test]
    fn test_resolve_rejects_non_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho not an object\n").unwrap();
        let err = control().resolve_probes(file.path()).unwrap_err();
        assert!(matches!(err, WspError::Elf { .. }));

        let err = control().resolve_probes(Path::new("/nonexistent/libewebkit2.so")).unwrap_err();
        assert!(matches!(err, WspError::Io(_)));
    }

    #[test]
    fn test_arm_requires_enabled() {
        let mem = Arc::new(ScratchMemory::new());
        let engine = ProbeEngine::new(mem);
        assert!(matches!(control().arm(&engine, PID, BASE), Err(WspError::NotConfigured("enabled"))));
    }

    #[test]
    fn test_failed_arm_disarms_earlier_probes() {
        let mem = Arc::new(ScratchMemory::new());
        let mut text = vec![0x55; 0x2000];
        // The last function starts with a call rel32, which cannot be probed
        text[0x1700] = 0xe8;
        mem.map(PID, BASE, &text);
        mem.map_zeroed(PID, SLOTS, 32 * 16);
        let engine = ProbeEngine::new(mem.clone());
        engine.attach_process(PID, SLOTS, 32 * 16).unwrap();

        let symbols = all_symbols();
        let probes =
            select_probes(symbols.iter().map(|(n, a)| (n.as_str(), *a)), [0; 3], Path::new("lib")).unwrap();
        assert!(probes.iter().any(|r| r.offset == 0x1700));

        let err = control().arm_probes(&engine, PID, BASE, &probes).unwrap_err();
        assert!(matches!(err, WspError::Probe(ProbeError::RelativeCall { .. })));
        assert_eq!(engine.probe_count(PID), 0);
        for offset in (0x1000..0x1700).step_by(0x100) {
            assert_eq!(mem.read(PID, BASE + offset, 1).unwrap(), vec![0x55]);
        }
    }

    #[test]
    fn test_armed_probes_drive_tracker() {
        let mem = Arc::new(ScratchMemory::new());
        mem.map(PID, BASE, &[0x55; 0x2000]);
        mem.map_zeroed(PID, SLOTS, 32 * 16);
        let this: u32 = 0x0a10_2000;
        let mut stack = 0x0804_8f00u32.to_le_bytes().to_vec();
        stack.extend_from_slice(&this.to_le_bytes());
        stack.resize(64, 0);
        mem.map(PID, SP, &stack);

        let engine = ProbeEngine::new(mem.clone());
        engine.attach_process(PID, SLOTS, 32 * 16).unwrap();

        let control = control();
        let symbols = all_symbols();
        let probes =
            select_probes(symbols.iter().map(|(n, a)| (n.as_str(), *a)), [0; 3], Path::new("lib")).unwrap();
        let keys = control.arm_probes(&engine, PID, BASE, &probes).unwrap();
        assert_eq!(keys.len(), 8);
        assert_eq!(mem.read(PID, BASE + 0x1000, 1).unwrap(), vec![0xcc]);

        let hit = |probe: WspProbe| {
            let offset = probes.iter().find(|r| r.probe == probe).unwrap().offset;
            let mut regs = Regs { ip: BASE + offset + 1, sp: SP, ..Regs::default() };
            assert_eq!(engine.handle_breakpoint(PID, TID, &mut regs).unwrap(), TrapAction::SingleStep);
            // Finish the single step over the copied push
            regs.ip += 1;
            engine.handle_single_step(PID, TID, &mut regs).unwrap();
        };
        hit(WspProbe::MainWillSendRequest);
        hit(WspProbe::SoupRequest);
        let tracker = control.tracker();
        assert_eq!(tracker.find_resource(TID, u64::from(this), ResKind::Main).unwrap().id, 1);

        hit(WspProbe::MainDidFinishLoading);
        assert!(tracker.find_resource(TID, u64::from(this), ResKind::Any).is_err());
        assert_eq!(tracker.page_state(TID), Some(crate::wsp::PageState::FinishMainLoad));
    }
}
