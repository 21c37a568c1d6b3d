//! Pre-flight checks for swap
//!
//! Validates system requirements before the mmap watcher is loaded and any
//! process is patched. Errors say what to do about them.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Architecture, Object};
use std::path::Path;

use crate::domain::Pid;

/// Oldest kernel with BPF ring buffers
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run every check that does not depend on the target process
///
/// # Errors
/// Returns the first failing check
pub fn run_preflight_checks(linker: &Path, handlers: &[impl AsRef<Path>], quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary(linker, "--linker", quiet)?;
    for handler in handlers {
        check_binary(handler.as_ref(), "--handler", quiet)?;
    }
    Ok(())
}

/// Patching another process and loading eBPF both need root
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    bail!(
        "Permission denied: swap requires root privileges to load eBPF programs \
         and write /proc/<pid>/mem.\n\n\
         Run with: sudo swap ..."
    );
}

/// Kernel release as reported by `/proc/version`, e.g. `(6, 1)`
fn parse_kernel_release(version: &str) -> Option<(u32, u32)> {
    let release = version.split_whitespace().nth(2)?;
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_kernel_version() -> Result<()> {
    let version = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // Unparsable version strings are let through
    let Some((major, minor)) = parse_kernel_release(&version) else {
        return Ok(());
    };
    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             swap requires Linux {}.{} or newer for eBPF ring buffer support.",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }
    Ok(())
}

/// The file must exist and be an object file; a non-i386 object only warns
fn check_binary(path: &Path, flag: &str, quiet: bool) -> Result<()> {
    if !path.is_file() {
        bail!(
            "Binary not found: {}\n\n\
             {flag} must point to an existing shared object.",
            path.display()
        );
    }
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read binary: {}", path.display()))?;
    let obj = object::File::parse(&*data)
        .with_context(|| format!("{} is not an ELF object", path.display()))?;
    if !quiet && obj.architecture() != Architecture::I386 {
        eprintln!(
            "warning: {} is {:?}, trampolines are generated for i386",
            path.display(),
            obj.architecture()
        );
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}
