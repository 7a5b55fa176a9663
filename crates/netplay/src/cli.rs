use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

/// Play a compressed audio stream (MP3, AAC, Ogg, FLAC, WAV) from an HTTP URL or a local file.
///
/// Keys while playing: space/p pause, r rewind, q/Esc quit.
#[derive(Parser, Debug)]
#[command(name = "netplay", version = VERSION)]
pub struct Args {
    /// Stream URL (http:// or https://) or path to a local file
    pub source: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Device buffers primed before playback starts
    #[arg(long, default_value_t = 5)]
    pub buffers: usize,

    /// Audio carried by each device buffer, in seconds
    #[arg(long, default_value_t = 0.25)]
    pub buffer_seconds: f32,

    /// Compressed-byte ring capacity
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    pub ring_capacity: usize,

    /// Undecoded bytes above which the download is paused
    #[arg(long, default_value_t = 1_000_000)]
    pub max_gap: u64,

    /// Sleep between idle ticks, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub tick_ms: u64,

    /// Download on a separate thread instead of ticking from the transfer callback
    #[arg(long)]
    pub threaded: bool,

    /// Print the final session status as JSON on stdout
    #[arg(long)]
    pub status_json: bool,

    /// HTTP connect and response timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}
