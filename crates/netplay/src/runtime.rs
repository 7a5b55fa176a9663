//! Netplay runtime: source selection, pipeline wiring, and the final report.

use std::fs::File;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use stream_player::decode::SymphoniaDecoder;
use stream_player::device;
use stream_player::pipeline::{PlaybackReport, StreamPipeline};
use stream_player::playback::CpalQueueDevice;
use stream_player::session::UserCommand;
use stream_player::transfer::{ByteTransfer, ReaderTransfer};
use symphonia::core::probe::Hint;

use crate::config::NetplayConfig;
use crate::http_stream::{HttpOptions, HttpTransfer};
use crate::terminal::KeyInput;

/// Bytes read per chunk from a local file.
const FILE_CHUNK: usize = 16 * 1024;

/// Print output devices to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for name in device::list_devices(&host)? {
        println!("{name}");
    }
    Ok(())
}

/// Stream `config.source` to the output device until it ends or the user quits.
///
/// Connection and device failures are returned as errors; a session that fails while
/// playing is logged and counts as a normal exit.
pub fn run(config: NetplayConfig) -> Result<()> {
    let (mut transfer, hint) = open_source(&config)?;

    let decoder = SymphoniaDecoder::new(hint, config.playback.decode_lookahead);
    let device = CpalQueueDevice::new(config.device.clone(), config.playback.chunk_frames);
    let pipeline = StreamPipeline::new(config.playback.clone(), decoder, device)
        .context("initialize playback")?
        .with_source(config.source.clone());

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    {
        let cmd_tx = cmd_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = cmd_tx.send(UserCommand::Quit);
        }) {
            tracing::warn!("ctrl-c handler not installed: {e}");
        }
    }
    let keys = KeyInput::spawn(cmd_tx)?;
    if keys.is_some() {
        tracing::info!("keys: space/p pause, r rewind, q quit");
    }

    let mut commands = command_poller(cmd_rx);
    let report = if config.threaded {
        pipeline.run_threaded(transfer, &mut commands)
    } else {
        pipeline.run_cooperative(&mut *transfer, &mut commands)
    };
    drop(keys);

    finish(&config, &report)
}

fn command_poller(rx: Receiver<UserCommand>) -> impl FnMut() -> Option<UserCommand> {
    move || rx.try_recv().ok()
}

fn finish(config: &NetplayConfig, report: &PlaybackReport) -> Result<()> {
    if let Some(err) = &report.error {
        tracing::error!("playback stopped: {err}");
    }
    if let Some(err) = &report.transfer_error {
        tracing::warn!("stream ended early: {err}");
    }
    if config.status_json {
        let json = serde_json::to_string_pretty(&report.status).context("encode status")?;
        println!("{json}");
    }
    Ok(())
}

/// Open the byte source and build the container hint for it.
fn open_source(config: &NetplayConfig) -> Result<(Box<dyn ByteTransfer + Send>, Hint)> {
    let source = config.source.as_str();
    let idle = config.playback.tick_interval;
    if is_http_url(source) {
        let options = HttpOptions {
            timeout: config.http_timeout,
            idle,
        };
        let transfer =
            HttpTransfer::connect(source, &options).with_context(|| format!("connect {source}"))?;
        let hint = hint_for(source, transfer.content_type());
        Ok((Box::new(transfer), hint))
    } else {
        let file = File::open(source).with_context(|| format!("open {source}"))?;
        tracing::info!(path = source, "playing local file");
        let transfer = ReaderTransfer::new(file, FILE_CHUNK, idle);
        Ok((Box::new(transfer), hint_for(source, None)))
    }
}

fn is_http_url(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn hint_for(source: &str, mime: Option<&str>) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = extension_of(source) {
        hint.with_extension(&ext);
    }
    if let Some(mime) = mime.filter(|m| !m.is_empty()) {
        hint.mime_type(mime);
    }
    hint
}

/// File extension of a path or of a URL's path component.
fn extension_of(source: &str) -> Option<String> {
    let path = match source.split_once("://") {
        Some((_, rest)) => {
            let rest = rest.split(['?', '#']).next().unwrap_or_default();
            rest.split_once('/').map(|(_, path)| path).unwrap_or_default()
        }
        None => source,
    };
    let name = path.rsplit(['/', '\\']).next().unwrap_or_default();
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
