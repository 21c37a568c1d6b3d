//! # swap - Main Entry Point
//!
//! Three subcommands:
//! - **watch** (`swap watch --pid <PID> ...`): instrument a live process and
//!   record its trace
//! - **decode** (`swap decode trace.bin`): recorded trace as JSON lines
//! - **symbols** (`swap symbols libewebkit2.so`): resolved web probe offsets

// Main function is intentionally long for clarity
#![allow(clippy::too_many_lines)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use swap::cli::{Args, Command, WatchArgs};
use swap::device::{BufferInitialize, DeviceFile, SwapDevice, WriterPipe};
use swap::domain::{DeviceError, Pid};
use swap::loader::{Loader, LoaderConfig};
use swap::memory::{find_binary_range, ProcMaps, ProcMem, ProcessMemory, VmaLookup};
use swap::mmap_watch::{
    attach_mmap_probe, init_ebpf_logger, load_mmap_watcher, monitor_pid, parse_mmap_event,
    resolve_mmap_event, take_events,
};
use swap::preflight::{check_proc_access, check_process_exists, run_preflight_checks};
use swap::record::{JsonLinesExporter, RecordSink};
use swap::uprobes::{ProbeEngine, ProbeKey};
use swap::wsp::{WspControl, WspTracker};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// One page of trampoline slots
const SLOT_AREA_LEN: usize = 4096;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("requires --slot-area") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Watch(watch) => run_watch(watch, args.quiet).await,
        Command::Decode { input } => decode(&input),
        Command::Symbols { library, soup_req, redraw_begin, redraw_end } => {
            symbols(&library, [soup_req, redraw_begin, redraw_end])
        }
    }
}

fn decode(input: &Path) -> Result<()> {
    let stream =
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let stdout = std::io::stdout();
    let mut exporter = JsonLinesExporter::new(BufWriter::new(stdout.lock()));
    let result = exporter.export_stream(&stream);
    let malformed = exporter.malformed();
    exporter.finish()?;
    let written = result?;
    if malformed > 0 {
        eprintln!("{written} records, {malformed} with undecodable payloads");
    }
    Ok(())
}

fn symbols(library: &Path, overrides: [u64; 3]) -> Result<()> {
    let control = WspControl::new(Arc::new(WspTracker::new()));
    for (name, value) in ["soup_req", "redraw_begin", "redraw_end"].into_iter().zip(overrides) {
        control.write_file(name, &format!("{value:x}"))?;
    }
    let probes = control
        .resolve_probes(library)
        .with_context(|| format!("Failed to resolve web probes in {}", library.display()))?;
    for probe in probes {
        let source = if probe.from_override { "override" } else { "symbol" };
        println!("{:#010x}  {:<40} ({source})", probe.offset, probe.probe.to_string());
    }
    Ok(())
}

/// Splice every readable sub-buffer into `out`; returns the bytes moved
fn drain_device<W: Write>(file: &DeviceFile, out: &mut WriterPipe<W>, subbuf: usize) -> Result<usize> {
    let mut total = 0;
    loop {
        match file.splice(out, subbuf) {
            Ok(0) | Err(DeviceError::WouldBlock) => return Ok(total),
            Ok(n) => total += n,
            Err(e) => return Err(e).context("Failed to drain trace device"),
        }
    }
}

/// Trap delivery thread; returns once `stop` is set or the target is gone
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn spawn_tracer(
    pid: Pid,
    engine: Arc<ProbeEngine>,
    stop: Arc<AtomicBool>,
    tracker: Option<Arc<WspTracker>>,
) -> Result<std::thread::JoinHandle<()>> {
    use swap::tracer::Tracer;

    let (ready_tx, ready_rx) = bounded::<std::io::Result<()>>(1);
    let handle = std::thread::Builder::new()
        .name("swap-tracer".into())
        .spawn(move || {
            let mut tracer = match Tracer::seize(pid, engine) {
                Ok(tracer) => {
                    let _ = ready_tx.send(Ok(()));
                    tracer
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Some(tracker) = tracker {
                tracer = tracer.with_exit_hook(Box::new(move |tid| {
                    tracker.remove_thread(tid);
                }));
            }
            while !stop.load(Ordering::Acquire) && tracer.thread_count() > 0 {
                match tracer.pump() {
                    Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Trap delivery failed: {e}");
                        break;
                    }
                }
            }
            let stats = tracer.stats();
            info!(
                "Tracer: {} breakpoints, {} single steps, {} foreign traps, {} threads",
                stats.breakpoints, stats.single_steps, stats.foreign, stats.threads_seen
            );
            tracer.detach();
        })
        .context("Failed to spawn tracer thread")?;

    ready_rx
        .recv()
        .context("Tracer thread exited early")?
        .with_context(|| format!("Failed to seize {pid}"))?;
    Ok(handle)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn spawn_tracer(
    _pid: Pid,
    _engine: Arc<ProbeEngine>,
    _stop: Arc<AtomicBool>,
    _tracker: Option<Arc<WspTracker>>,
) -> Result<std::thread::JoinHandle<()>> {
    bail!("Trap delivery is only supported on x86-64 hosts")
}

/// Probes armed in the target and the thread delivering their traps
///
/// Dropping it takes every probe out before the tracer lets go, so the
/// target is left clean on every exit path.
struct ArmedTarget {
    pid: Pid,
    engine: Arc<ProbeEngine>,
    keys: Vec<ProbeKey>,
    stop: Arc<AtomicBool>,
    tracer: Option<std::thread::JoinHandle<()>>,
    attached: bool,
}

impl ArmedTarget {
    fn new(pid: Pid, engine: Arc<ProbeEngine>) -> Self {
        Self {
            pid,
            engine,
            keys: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            tracer: None,
            attached: false,
        }
    }

    fn teardown(&mut self) {
        for key in self.keys.drain(..) {
            if let Err(e) = self.engine.unregister(key) {
                warn!("Unregistering {key:?}: {e}");
            }
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.tracer.take() {
            if handle.join().is_err() {
                warn!("Tracer thread panicked");
            }
        }
        if std::mem::take(&mut self.attached) {
            self.engine.detach_process(self.pid);
        }
    }
}

impl Drop for ArmedTarget {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Totals reported when watching ends
struct WatchSummary {
    exit_reason: &'static str,
    mmap_events: u64,
    drained: usize,
}

async fn run_watch(args: WatchArgs, quiet: bool) -> Result<()> {
    let pid = args.target();

    // Run pre-flight checks before anything else
    run_preflight_checks(&args.linker, &args.handlers, quiet)?;
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    if (args.hook.is_some() || args.webkit.is_some()) && args.slot_area.is_none() {
        bail!("--hook/--webkit requires --slot-area");
    }

    if !quiet {
        println!("swap v{}", env!("CARGO_PKG_VERSION"));
        println!("pid: {}", pid.0);
        println!("linker: {}", args.linker.display());
    }

    // ── Trace device ────────────────────────────────────────────────────
    let device = SwapDevice::new();
    device
        .initialize(BufferInitialize { size: args.subbuf_size, count: args.subbuf_count })
        .context("Failed to initialize trace buffer")?;
    let file = device.open(true).context("Failed to open trace device")?;
    let sink: Arc<dyn RecordSink> = Arc::new(device.writer());

    // ── Loader ──────────────────────────────────────────────────────────
    let mem: Arc<dyn ProcessMemory> = Arc::new(ProcMem::new());
    let vma: Arc<dyn VmaLookup> = Arc::new(ProcMaps);
    let config = LoaderConfig {
        max_attempts: args.max_attempts,
        data_area_len: args.data_area_len,
        ..LoaderConfig::new(&args.linker, args.dlopen_offset, args.r_debug_offset)
    };
    let loader = Arc::new(
        Loader::new(config, Arc::clone(&mem), Arc::clone(&vma))
            .context("Failed to set up loader")?
            .with_sink(Arc::clone(&sink)),
    );
    for bin in &args.ignored {
        loader.bins().add_ignored_binary(bin)?;
    }
    for handler in &args.handlers {
        loader.loader_add_handler(handler)?;
    }
    loader.add_process(pid)?;
    if let Some(addr) = args.data_area {
        loader.set_data_area(pid, addr).context("Failed to write handler paths")?;
    }

    let wsp = args.webkit.as_ref().map(|lib| -> Result<WspControl> {
        let control = WspControl::new(Arc::new(WspTracker::new().with_sink(Arc::clone(&sink))));
        control.write_file("app_info", &format!("{} {}", lib.display(), args.app_id))?;
        control.write_file("enabled", "1")?;
        Ok(control)
    });
    let wsp = wsp.transpose()?;

    // ── mmap watcher ────────────────────────────────────────────────────
    // Everything that can fail without touching the target comes first
    let mut bpf = load_mmap_watcher(&args.ebpf_object)?;
    init_ebpf_logger(&mut bpf);
    attach_mmap_probe(&mut bpf)?;
    monitor_pid(&mut bpf, pid)?;
    let mut ring_buf = take_events(&mut bpf)?;

    let mut output = args
        .output
        .as_ref()
        .map(|path| -> Result<_> {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Ok(WriterPipe::new(BufWriter::new(file)))
        })
        .transpose()?;
    let mut discarded = WriterPipe::new(std::io::sink());
    let subbuf = args.subbuf_size as usize;

    // ── Probes ──────────────────────────────────────────────────────────
    let engine = Arc::new(ProbeEngine::new(Arc::clone(&mem)));
    let mut armed = ArmedTarget::new(pid, Arc::clone(&engine));
    let start = Instant::now();
    let mut summary = WatchSummary { exit_reason: "interrupted", mmap_events: 0, drained: 0 };

    let watched: Result<()> = async {
        if let Some(slot_area) = args.slot_area {
            engine.attach_process(pid, slot_area, SLOT_AREA_LEN)?;
            armed.attached = true;
            let tracker = wsp.as_ref().map(|control| Arc::clone(control.tracker()));
            armed.tracer =
                Some(spawn_tracer(pid, Arc::clone(&engine), Arc::clone(&armed.stop), tracker)?);
            if let Some(hook) = args.hook {
                armed.keys.push(loader.instrument(&engine, pid, hook)?);
                if !quiet {
                    println!("hook: {hook:#x}");
                }
            }
        }
        let mut wsp_armed = false;

        // Setup Ctrl+C handler
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let duration_limit =
            if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
        let proc_path = format!("/proc/{}", pid.0);

        loop {
            if let Some(limit) = duration_limit {
                if start.elapsed() >= limit {
                    summary.exit_reason = "duration limit reached";
                    break;
                }
            }
            if !Path::new(&proc_path).exists() {
                summary.exit_reason = "process exited";
                break;
            }

            while let Some(item) = ring_buf.next() {
                let Some(event) = parse_mmap_event(&item) else {
                    continue;
                };
                summary.mmap_events += 1;
                let Some(mapping) = resolve_mmap_event(vma.as_ref(), &event) else {
                    continue;
                };
                loader.on_mmap(Pid(event.pid), &mapping);
            }

            if let (Some(control), false) = (&wsp, wsp_armed) {
                if let Some(app) = control.app_info() {
                    if let Some(range) = find_binary_range(vma.as_ref(), pid, &app.path) {
                        // A failed arm leaves no web probe behind
                        match control.arm(&engine, pid, range.start) {
                            Ok(keys) => armed.keys.extend(keys),
                            Err(e) => warn!("Web probes not armed: {e}"),
                        }
                        wsp_armed = true;
                    }
                }
            }

            summary.drained += match output.as_mut() {
                Some(out) => drain_device(&file, out, subbuf)?,
                None => drain_device(&file, &mut discarded, subbuf)?,
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = &mut ctrl_c => {
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    // ── Teardown: probes out before the tracer lets go ──────────────────
    armed.teardown();
    let handler_states: Vec<_> =
        args.handlers.iter().map(|h| (h, loader.handler_state(pid, h))).collect();
    if let Err(e) = loader.remove_process(pid) {
        debug!("{e}");
    }

    if let Err(e) = file.ioctl(swap::device::ioctl::SWAP_DRIVER_FLUSH_BUFFER, &[]) {
        debug!("Final flush: {e}");
    }
    let last = match output.as_mut() {
        Some(out) => drain_device(&file, out, subbuf),
        None => drain_device(&file, &mut discarded, subbuf),
    };
    let flushed = output.map_or(Ok(()), |out| {
        out.into_inner().flush().context("Failed to flush trace output")
    });
    watched?;
    summary.drained += last?;
    flushed?;

    if !quiet {
        let stats = engine.stats();
        let lost = device.pool().map_or(0, |pool| pool.lost());
        eprintln!(
            "\n{}: {:.1}s, {} mappings, {} trace bytes ({lost} records lost), \
             probes: {} hits / {} returns / {} missed / {} faults",
            summary.exit_reason,
            start.elapsed().as_secs_f64(),
            summary.mmap_events,
            summary.drained,
            stats.hits,
            stats.return_hits,
            stats.missed,
            stats.faults,
        );
        for (handler, state) in handler_states {
            eprintln!("  {}: {state:?}", handler.display());
        }
        if let Some(path) = &args.output {
            println!("saved: {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swap::domain::ProbeError;
    use swap::memory::ScratchMemory;
    use swap::uprobes::slots::SLOT_SIZE;

    const PID: Pid = Pid(900);
    const TEXT: u64 = 0x0804_a000;
    const SLOTS: u64 = 0x4000_0000;

    #[test]
    fn test_dropped_target_is_left_clean() {
        let mem = Arc::new(ScratchMemory::new());
        mem.map(PID, TEXT, &[0x55; 32]);
        mem.map_zeroed(PID, SLOTS, SLOT_SIZE * 2);
        let engine = Arc::new(ProbeEngine::new(mem.clone()));
        engine.attach_process(PID, SLOTS, SLOT_SIZE * 2).unwrap();

        {
            let mut armed = ArmedTarget::new(PID, Arc::clone(&engine));
            armed.attached = true;
            armed.keys.push(engine.register_uprobe(PID, TEXT, None).unwrap());
            assert_eq!(mem.read(PID, TEXT, 1).unwrap(), vec![0xcc]);
            // Leaving the scope early, as an error in the watch loop would
        }

        assert_eq!(mem.read(PID, TEXT, 1).unwrap(), vec![0x55]);
        assert_eq!(
            engine.register_uprobe(PID, TEXT, None).unwrap_err(),
            ProbeError::NotAttached(PID)
        );
    }

    #[test]
    fn test_teardown_runs_once() {
        let mem = Arc::new(ScratchMemory::new());
        let engine = Arc::new(ProbeEngine::new(mem));
        let mut armed = ArmedTarget::new(PID, engine);
        armed.teardown();
        assert!(armed.stop.load(Ordering::Acquire));
        assert!(!armed.attached);
        drop(armed);
    }
}
