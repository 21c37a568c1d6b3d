//! Build helpers for the swap workspace
//!
//! ```bash
//! cargo run -p xtask -- build-ebpf   # compile the mmap watcher
//! cargo run -p xtask -- ebpf-path    # where `swap watch --ebpf-object` finds it
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

// Package and binary name of the kernel-side program
const EBPF_PACKAGE: &str = "swap-ebpf";
const EBPF_BINARY: &str = "swap";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Compile the do_mmap return probe
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
    /// Print the object path the watcher is loaded from
    EbpfPath {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    match Args::parse().command {
        Cmd::BuildEbpf { target } => build_ebpf(&target),
        Cmd::EbpfPath { target } => {
            let path = object_path(&target);
            if !path.is_file() {
                bail!("{} not built yet; run `cargo run -p xtask -- build-ebpf`", path.display());
            }
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn object_path(target: &str) -> PathBuf {
    ["target", target, "release", EBPF_BINARY].iter().collect()
}

fn build_ebpf(target: &str) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .args(["+nightly", "build", "--package", EBPF_PACKAGE, "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to run cargo for the eBPF build")?;
    if !status.success() {
        bail!("Failed to build {EBPF_PACKAGE}");
    }

    let path = object_path(target);
    println!("✓ mmap watcher built: {}", path.display());
    println!("  Load it with: sudo swap watch --ebpf-object {} ...", path.display());
    Ok(())
}
