//! `netplay` streams compressed audio from an HTTP URL or a local file and plays it while it
//! downloads.
//!
//! ## Pipeline
//! 1. **Transfer**: the response body is written into a bounded ring buffer. A flow controller
//!    pauses the download while too many bytes are waiting to be decoded.
//! 2. **Decode**: Symphonia is fed from the ring on demand and produces 8/16-bit PCM.
//! 3. **Output**: PCM blocks are queued on a small set of device buffers; playback starts once
//!    they are primed, and each buffer is refilled after it plays.
//!
//! By default the transfer's progress callback drives playback on a single thread;
//! `--threaded` downloads on a separate thread instead.

mod cli;
mod config;
mod http_stream;
mod runtime;
mod terminal;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,netplay=info,stream_player=info")
        }))
        .with_writer(|| terminal::RawModeStderr)
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let config = config::NetplayConfig::from_args(&args)?;
    runtime::run(config)
}
