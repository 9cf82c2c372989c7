//! PTY plumbing: handle, dirty pipe, reader worker.
//!
//! Each session owns a PTY pair, a terminal emulator, and one reader
//! thread doing blocking reads from the master. The thread feeds the
//! emulator, writes any emulator replies straight back to the master,
//! and then pokes a single byte through the session's dirty pipe:
//!
//! ```text
//! reader thread ── read(2) ──> Terminal::process ──> dirty pipe ──> reactor
//!        └───────── replies (DA answers) ─────> PTY master
//! ```
//!
//! The pipe byte is the happens-before edge: the main thread only locks
//! the terminal for a snapshot after observing it.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};

use crate::term::Terminal;

/// Reader buffer size; one blocking read moves at most this much.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Dirty-pipe byte: the terminal changed, a render may be due.
pub const DIRTY_BYTE: u8 = 0x01;
/// Dirty-pipe byte: the worker hit EOF or a fatal error and exited.
pub const EXIT_BYTE: u8 = 0x7f;

/// Writer to the PTY master, shared between the server (input, resize
/// echo) and the reader worker (emulator replies).
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Options for spawning a PTY session, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// `KEY=VALUE` strings added to the child environment.
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            cwd: None,
            env: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// An open PTY with a spawned child.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: SharedWriter,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("child_alive", &self.child.is_some())
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Open a PTY and spawn the child described by `opts`.
    ///
    /// Returns the handle and the blocking reader for the worker thread.
    /// On any failure nothing is left behind — the pair closes on drop.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty argv, a failed PTY allocation, or a
    /// failed exec.
    pub fn open(opts: &SpawnOptions) -> Result<(Self, Box<dyn Read + Send>)> {
        if opts.argv.is_empty() {
            bail!("spawn requires a non-empty argv");
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&opts.argv[0]);
        cmd.args(&opts.argv[1..]);
        if let Some(cwd) = &opts.cwd {
            cmd.cwd(cwd);
        }
        for entry in opts.env.iter().flatten() {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn child in PTY")?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                child: Some(child),
            },
            reader,
        ))
    }

    /// Shared writer for the reader worker's reply path.
    #[must_use]
    pub fn shared_writer(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    /// Write input bytes to the PTY.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write or flush fails.
    pub fn write(&self, input: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().expect("PTY writer lock poisoned");
        writer.write_all(input)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY window.
    ///
    /// # Errors
    ///
    /// Returns an error if the ioctl fails.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")
    }

    /// Kill the child if still running and reap it.
    ///
    /// Returns the exit status when one could be collected. Idempotent;
    /// also called on drop to prevent zombies.
    pub fn kill(&mut self) -> Option<u32> {
        let mut child = self.child.take()?;
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => {
                if let Err(e) = child.kill() {
                    log::warn!("Failed to kill PTY child: {e}");
                }
            }
            Err(e) => log::warn!("PTY child try_wait failed: {e}"),
        }
        match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                log::warn!("Failed to reap PTY child: {e}");
                None
            }
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Create the dirty pipe: non-blocking on both ends.
///
/// The read end goes to the reactor; the write end to the worker. A full
/// pipe means a signal is already pending, so `EAGAIN` on the write side
/// carries no information and is ignored.
///
/// # Errors
///
/// Returns an error if the pipe cannot be created.
pub fn dirty_pipe() -> Result<(OwnedFd, File)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
        .context("Failed to create dirty pipe")?;
    Ok((read_end, File::from(write_end)))
}

/// Write one signal byte, ignoring a full pipe.
fn signal(pipe: &mut File, byte: u8) {
    match pipe.write(&[byte]) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => log::warn!("dirty pipe write failed: {e}"),
    }
}

/// Spawn the per-session reader worker.
///
/// The worker is the only writer to `terminal`. It terminates on PTY EOF
/// or a fatal read error, after signalling [`EXIT_BYTE`].
pub fn spawn_reader(
    session_id: u64,
    reader: Box<dyn Read + Send>,
    terminal: Arc<Mutex<Terminal>>,
    writer: SharedWriter,
    mut dirty: File,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("pty-reader-{session_id}"))
        .spawn(move || {
            let mut reader = reader;
            log::debug!("[pty {session_id}] reader thread started");
            let mut buf = vec![0u8; READ_BUFFER_SIZE];

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let replies = {
                            let mut term =
                                terminal.lock().expect("terminal lock poisoned");
                            term.process(&buf[..n]);
                            term.take_replies()
                        };
                        if !replies.is_empty() {
                            // Query answers are small and synchronous;
                            // they bypass the reactor on purpose.
                            let mut w = writer.lock().expect("PTY writer lock poisoned");
                            if let Err(e) = w.write_all(&replies).and_then(|()| w.flush()) {
                                log::warn!("[pty {session_id}] reply write failed: {e}");
                            }
                        }
                        signal(&mut dirty, DIRTY_BYTE);
                    }
                    Err(e) => {
                        // EIO is the normal master-side read result once
                        // the child side is gone.
                        if e.raw_os_error() != Some(libc::EIO) {
                            log::warn!("[pty {session_id}] read error: {e}");
                        }
                        break;
                    }
                }
            }

            signal(&mut dirty, EXIT_BYTE);
            log::debug!("[pty {session_id}] reader thread exiting");
        })
        .expect("Failed to spawn PTY reader thread")
}
