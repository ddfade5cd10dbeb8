//! Session management
//!
//! Runs one child in a pane: relays keystrokes to the pty, translates the
//! child's output onto the host terminal, follows host resizes, and restores
//! the terminal when the session ends.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::host::{self, HostError, TerminalMode};
use super::pty::{describe_status, ChildProcess, PtyError};
use super::signals::{Pending, SignalFlags};
use super::term::Translator;
use crate::config::ErasePolicy;
use crate::wm::PaneGeometry;

const READ_BUFFER_SIZE: usize = 16 * 1024;
/// Flush without waiting for a pause once this much output is pending
const FLUSH_THRESHOLD: usize = 64 * 1024;
/// Form feed; asks most full-screen programs to repaint
const REDRAW: &[u8] = b"\x0c";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("Failed to write to terminal: {0}")]
    Output(#[source] io::Error),

    #[error("Failed to read from terminal: {0}")]
    Input(#[source] nix::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),
}

impl SessionError {
    /// The child program could not be started
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, SessionError::Pty(PtyError::Spawn { .. }))
    }
}

/// What the session was asked to run
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Program and arguments
    pub command: Vec<String>,
    /// Requested pane height
    pub height: u16,
    /// Byte that ends the session
    pub quit_key: u8,
    /// Poll timeout, i.e. how long output may wait before it is painted
    pub flush_interval_ms: u16,
    pub redraw_on_resize: bool,
    pub erase_policy: ErasePolicy,
}

/// Why the relay loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    QuitKey,
    ChildExited,
    /// The host terminal's input reached end of file
    InputClosed,
    Signal(Pending),
}

#[derive(Debug)]
pub struct Outcome {
    pub reason: ShutdownReason,
    /// Child exit status, if it could be collected
    pub status: Option<ExitStatus>,
}

/// A running pane session.
///
/// Owns the host terminal between [`Session::start`] and teardown. Teardown
/// runs exactly once, from [`Session::run`] or on drop. Keystrokes are read
/// from `input` and the pane is painted to `output`.
pub struct Session<W: Write> {
    options: SessionOptions,
    child: ChildProcess,
    translator: Translator,
    mode: TerminalMode,
    signals: SignalFlags,
    input: OwnedFd,
    output: W,
    host_rows: u16,
    torn_down: bool,
}

impl Session<io::Stdout> {
    /// Check the host terminal, start the child and take over the pane.
    ///
    /// The child is started before raw mode is entered, so a command that
    /// cannot be run leaves the terminal untouched.
    pub fn start(options: SessionOptions) -> Result<Self, SessionError> {
        host::ensure_interactive()?;
        let input = io::stdin().as_fd().try_clone_to_owned().map_err(HostError::Open)?;
        Self::attach(options, input, io::stdout())
    }
}

impl<W: Write> Session<W> {
    /// Take over the terminal behind `input`, painting to `output`
    fn attach(options: SessionOptions, input: OwnedFd, output: W) -> Result<Self, SessionError> {
        let (cols, rows) = host::size(input.as_fd())?;
        let geometry = PaneGeometry::anchored_bottom(cols, rows, options.height);
        info!(
            "Host terminal {}x{}, pane rows {}..={}",
            cols,
            rows,
            geometry.top(),
            geometry.bottom()
        );

        let signals = SignalFlags::register().map_err(SessionError::Signals)?;
        let child = ChildProcess::start(&options.command, geometry.width, geometry.height)?;
        let mode = TerminalMode::enter_raw(input.as_fd())?;

        let translator = Translator::new(geometry, options.erase_policy);
        let mut session = Self {
            options,
            child,
            translator,
            mode,
            signals,
            input,
            output,
            host_rows: rows,
            torn_down: false,
        };

        // From here on a failure unwinds through Drop
        host::enter_pane(&mut session.output, geometry).map_err(HostError::Write)?;
        Ok(session)
    }

    /// Relay until the quit key, child exit or a terminating signal, then
    /// tear down.
    ///
    /// Errors inside the loop end the session the same way; the terminal is
    /// restored before the error is returned.
    pub fn run(mut self) -> Result<Outcome, SessionError> {
        let result = self.relay();
        let status = self.teardown();
        let reason = result?;
        info!("Session ended: {:?}", reason);
        Ok(Outcome { reason, status })
    }

    fn relay(&mut self) -> Result<ShutdownReason, SessionError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let timeout = PollTimeout::from(self.options.flush_interval_ms);

        loop {
            let pending = self.signals.take();
            if pending.wants_shutdown() {
                return Ok(ShutdownReason::Signal(pending));
            }
            if pending.contains(Pending::RESIZE) {
                self.handle_resize()?;
            }

            let (child_ready, input_ready) = {
                let mut fds = [
                    PollFd::new(self.child.master_fd(), PollFlags::POLLIN),
                    PollFd::new(self.input.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, timeout) {
                    Ok(0) => {
                        // Quiet period: paint what has accumulated
                        self.translator.flush(&mut self.output).map_err(SessionError::Output)?;
                        continue;
                    }
                    Ok(_) => {}
                    // A signal arrived; check the flags again
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(SessionError::Poll(e)),
                }
                (is_ready(&fds[0]), is_ready(&fds[1]))
            };

            if child_ready {
                let n = self.child.read(&mut buf)?;
                if n == 0 {
                    return Ok(ShutdownReason::ChildExited);
                }
                self.translator.write(&buf[..n]);

                let replies = self.translator.take_replies();
                if !replies.is_empty() {
                    self.child.write_all(&replies)?;
                }
                if self.translator.pending().len() >= FLUSH_THRESHOLD {
                    self.translator.flush(&mut self.output).map_err(SessionError::Output)?;
                }
            }

            if input_ready {
                match unistd::read(self.input.as_raw_fd(), &mut buf) {
                    Ok(0) => return Ok(ShutdownReason::InputClosed),
                    Ok(n) => {
                        let input = &buf[..n];
                        // Only a read that starts with the key quits
                        if input.starts_with(&[self.options.quit_key]) {
                            return Ok(ShutdownReason::QuitKey);
                        }
                        self.child.write_all(input)?;
                    }
                    Err(Errno::EINTR | Errno::EAGAIN) => {}
                    Err(e) => return Err(SessionError::Input(e)),
                }
            }
        }
    }

    /// Follow a host resize: move the pane, re-confine the host and tell the
    /// child its new size
    fn handle_resize(&mut self) -> Result<(), SessionError> {
        let (cols, rows) = host::size(self.input.as_fd())?;
        let geometry = PaneGeometry::anchored_bottom(cols, rows, self.options.height);
        if geometry == self.translator.geometry() && rows == self.host_rows {
            return Ok(());
        }
        info!(
            "Host resized to {}x{}, pane rows {}..={}",
            cols,
            rows,
            geometry.top(),
            geometry.bottom()
        );

        // Output produced for the old geometry goes out first
        self.translator.flush(&mut self.output).map_err(SessionError::Output)?;
        self.translator.set_geometry(geometry);
        self.host_rows = rows;
        host::confine(&mut self.output, geometry)
            .and_then(|_| self.output.flush())
            .map_err(SessionError::Output)?;

        self.child.resize(geometry.width, geometry.height)?;
        if self.options.redraw_on_resize {
            self.child.write_all(REDRAW)?;
        }
        Ok(())
    }

    /// Hand the terminal back. Best effort: each step runs even if an
    /// earlier one failed. Only the first call does anything.
    fn teardown(&mut self) -> Option<ExitStatus> {
        if self.torn_down {
            return self.child.try_wait().ok().flatten();
        }
        self.torn_down = true;
        debug!("Tearing down session");

        self.translator.finish();
        if let Err(e) = self.translator.flush(&mut self.output) {
            warn!("Failed to flush pane output: {}", e);
        }
        if let Err(e) = host::release(&mut self.output) {
            warn!("Failed to reset scroll region: {}", e);
        }
        if let Err(e) = self.mode.restore() {
            error!("Failed to restore terminal mode: {}", e);
        }

        let status = match self.child.terminate() {
            Ok(status) => {
                info!("Child {}", describe_status(&status));
                Some(status)
            }
            Err(e) => {
                warn!("Failed to stop child: {}", e);
                None
            }
        };

        if let Err(e) = host::park_cursor(&mut self.output, self.host_rows) {
            warn!("Failed to move cursor below pane: {}", e);
        }
        status
    }
}

impl<W: Write> Drop for Session<W> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn is_ready(fd: &PollFd) -> bool {
    fd.revents()
        .map_or(false, |events| events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}
