//! Keyboard controls for an interactive terminal.
//!
//! Raw mode is entered only when stdin is a TTY; otherwise only Ctrl-C (via `ctrlc`) can
//! stop playback.

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use stream_player::session::UserCommand;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Key reader thread plus the raw-mode guard. Dropping it restores the terminal.
pub struct KeyInput {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyInput {
    /// Start reading keys into `tx`. Returns `None` when stdin is not a terminal.
    pub fn spawn(tx: Sender<UserCommand>) -> Result<Option<Self>> {
        if !io::stdin().is_terminal() {
            tracing::debug!("stdin is not a terminal; key controls disabled");
            return Ok(None);
        }
        enable_raw_mode().context("enable raw mode")?;
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("key-input".into())
                .spawn(move || read_keys(&tx, &stop))
        };
        match handle {
            Ok(handle) => Ok(Some(Self {
                stop,
                handle: Some(handle),
            })),
            Err(e) => {
                disable_raw_mode().ok();
                Err(e).context("spawn key input thread")
            }
        }
    }
}

impl Drop for KeyInput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        disable_raw_mode().ok();
    }
}

fn read_keys(tx: &Sender<UserCommand>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                tracing::warn!("terminal poll failed: {e}");
                return;
            }
        }
        let key = match event::read() {
            Ok(Event::Key(key)) => key,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("terminal read failed: {e}");
                return;
            }
        };
        if let Some(cmd) = command_for_key(key) {
            if tx.send(cmd).is_err() {
                return;
            }
        }
    }
}

/// Key binding table.
pub fn command_for_key(key: KeyEvent) -> Option<UserCommand> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(UserCommand::Quit)
        }
        KeyCode::Char('q') | KeyCode::Esc => Some(UserCommand::Quit),
        KeyCode::Char(' ') | KeyCode::Char('p') => Some(UserCommand::TogglePause),
        KeyCode::Char('r') => Some(UserCommand::Rewind),
        _ => None,
    }
}

/// Stderr writer that emits `\r\n` line endings, so log lines stay aligned in raw mode.
pub struct RawModeStderr;

impl Write for RawModeStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut err = io::stderr().lock();
        for (i, line) in buf.split(|&b| b == b'\n').enumerate() {
            if i > 0 {
                err.write_all(b"\r\n")?;
            }
            err.write_all(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn bindings_map_to_commands() {
        assert_eq!(command_for_key(press(KeyCode::Char(' '))), Some(UserCommand::TogglePause));
        assert_eq!(command_for_key(press(KeyCode::Char('p'))), Some(UserCommand::TogglePause));
        assert_eq!(command_for_key(press(KeyCode::Char('r'))), Some(UserCommand::Rewind));
        assert_eq!(command_for_key(press(KeyCode::Char('q'))), Some(UserCommand::Quit));
        assert_eq!(command_for_key(press(KeyCode::Esc)), Some(UserCommand::Quit));
        assert_eq!(command_for_key(press(KeyCode::Char('x'))), None);
    }

    #[test]
    fn ctrl_c_quits_but_plain_c_does_not() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(command_for_key(ctrl_c), Some(UserCommand::Quit));
        assert_eq!(command_for_key(press(KeyCode::Char('c'))), None);
    }

    #[test]
    fn key_release_is_ignored() {
        let mut key = press(KeyCode::Char('q'));
        key.kind = KeyEventKind::Release;
        assert_eq!(command_for_key(key), None);
    }
}
