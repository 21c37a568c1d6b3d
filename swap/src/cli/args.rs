//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::Pid;
use crate::loader::{DATA_AREA_LEN, LOADER_MAX_ATTEMPTS};

/// Hex number with or without a `0x` prefix
///
/// # Errors
/// Returns a message clap prints next to the offending flag
pub fn parse_hex(text: &str) -> Result<u64, String> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex number {text:?}: {e}"))
}

#[derive(Parser)]
#[command(
    name = "swap",
    version,
    about = "Inject handler libraries into running processes and trace them",
    after_help = "\
EXAMPLES:
    sudo swap watch --pid 1234 --handler /usr/lib/libprobe.so --output trace.bin
    swap decode trace.bin > trace.jsonl
    swap symbols /usr/lib/libewebkit2.so"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Instrument a process and record its trace
    Watch(WatchArgs),

    /// Print a recorded trace as JSON lines
    Decode {
        /// Trace file written by `swap watch --output`
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Print the web probe offsets resolved in a WebKit library
    Symbols {
        #[arg(value_name = "LIB")]
        library: PathBuf,

        /// Offset of the network request probe (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        soup_req: u64,

        /// Offset of the redraw begin probe (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        redraw_begin: u64,

        /// Offset of the redraw end probe (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        redraw_end: u64,
    },
}

#[derive(clap::Args)]
pub struct WatchArgs {
    /// Process ID to instrument
    #[arg(short, long)]
    pub pid: u32,

    /// Dynamic linker of the target
    #[arg(long, default_value = "/lib/ld-linux.so.2")]
    pub linker: PathBuf,

    /// Offset of the linker's `dlopen` entry (hex)
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub dlopen_offset: u64,

    /// Offset of the linker's `r_debug` structure (hex)
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub r_debug_offset: u64,

    /// Function whose calls carry the handler load (hex address in the target)
    #[arg(long, value_parser = parse_hex)]
    pub hook: Option<u64>,

    /// Handler library to load into the target (repeatable)
    #[arg(long = "handler", value_name = "LIB")]
    pub handlers: Vec<PathBuf>,

    /// Binary whose call sites never trigger a handler load (repeatable)
    #[arg(long = "ignore", value_name = "BIN")]
    pub ignored: Vec<PathBuf>,

    /// Writable target address for handler path strings (hex)
    #[arg(long, value_parser = parse_hex)]
    pub data_area: Option<u64>,

    /// Bytes writable at --data-area
    #[arg(long, default_value_t = DATA_AREA_LEN, requires = "data_area")]
    pub data_area_len: usize,

    /// Writable target area for trampoline slots (hex)
    #[arg(long, value_parser = parse_hex)]
    pub slot_area: Option<u64>,

    /// WebKit library to place the web page probes in once it is mapped
    #[arg(long, value_name = "LIB", requires = "slot_area")]
    pub webkit: Option<PathBuf>,

    /// Application id reported with the web probes
    #[arg(long, default_value = "app")]
    pub app_id: String,

    /// Load attempts per handler before giving up
    #[arg(long, default_value_t = LOADER_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Sub-buffer size in bytes
    #[arg(long, default_value = "65536")]
    pub subbuf_size: u32,

    /// Number of sub-buffers
    #[arg(long, default_value = "64")]
    pub subbuf_count: u32,

    /// Write the raw trace stream here
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Compiled mmap watcher
    #[arg(long, default_value = crate::mmap_watch::DEFAULT_OBJECT_PATH)]
    pub ebpf_object: PathBuf,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,
}

impl WatchArgs {
    #[must_use]
    pub fn target(&self) -> Pid {
        Pid(self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1f0"), Ok(0x1f0));
        assert_eq!(parse_hex("B7700000"), Ok(0xb770_0000));
        assert!(parse_hex("0xg").is_err());
    }

    #[test]
    fn test_watch_args() {
        let args = Args::try_parse_from([
            "swap",
            "watch",
            "--pid",
            "812",
            "--handler",
            "/usr/lib/a.so",
            "--handler",
            "/usr/lib/b.so",
            "--dlopen-offset",
            "0x1c40",
            "--ignore",
            "/usr/bin/app",
        ])
        .unwrap();
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        assert_eq!(watch.target(), Pid(812));
        assert_eq!(watch.handlers.len(), 2);
        assert_eq!(watch.dlopen_offset, 0x1c40);
        assert_eq!(watch.max_attempts, LOADER_MAX_ATTEMPTS);
        assert_eq!(watch.data_area_len, DATA_AREA_LEN);
        assert_eq!(watch.subbuf_size, 65536);
        assert!(watch.hook.is_none());
    }

    #[test]
    fn test_watch_requires_pid() {
        assert!(Args::try_parse_from(["swap", "watch"]).is_err());
    }

    #[test]
    fn test_symbols_overrides() {
        let args =
            Args::try_parse_from(["swap", "symbols", "lib.so", "--redraw-end", "2a", "-q"]).unwrap();
        let Command::Symbols { redraw_end, soup_req, .. } = args.command else {
            panic!("expected symbols");
        };
        assert_eq!((redraw_end, soup_req), (0x2a, 0));
        assert!(args.quiet);
    }
}
