//! Unix pseudo-terminal wrapper
//!
//! Allocates a pty pair, starts the child program as a session leader with
//! the slave as its controlling terminal, and owns the master side plus the
//! child's lifecycle.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long the child gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const TERMINATE_POLL: Duration = Duration::from_millis(10);

nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, libc::winsize);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("No command given")]
    EmptyCommand,

    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] nix::Error),

    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] nix::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// A child program running on its own pseudo terminal
pub struct ChildProcess {
    master: File,
    child: Child,
    /// Set once the child has been reaped
    status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Start `argv` on a new pty of `cols` x `rows`.
    ///
    /// A program that cannot be executed is reported here as
    /// [`PtyError::Spawn`]; the child never runs in that case.
    pub fn start(argv: &[String], cols: u16, rows: u16) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(PtyError::EmptyCommand)?;

        let winsize = window_size(cols, rows);
        let pty = openpty(&winsize, None).map_err(PtyError::Open)?;
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;

        let stdio = |fd: &OwnedFd| -> Result<Stdio> {
            fd.try_clone().map(Stdio::from).map_err(|source| PtyError::Spawn {
                command: program.clone(),
                source,
            })
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(stdio(&pty.slave)?)
            .stdout(stdio(&pty.slave)?)
            .stderr(stdio(&pty.slave)?);

        // Safety: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| PtyError::Spawn {
            command: program.clone(),
            source,
        })?;
        // The child holds its own copies of the slave now
        drop(pty.slave);

        info!("Started `{}` as pid {} on a {}x{} pty", program, child.id(), cols, rows);

        Ok(Self {
            master: File::from(pty.master),
            child,
            status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Master side, for polling
    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Read child output.
    ///
    /// Returns `Ok(0)` once the child side is gone: Linux reports that as
    /// `EIO` on the master rather than a zero-length read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match (&self.master).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => return Ok(0),
                Err(e) => return Err(PtyError::Read(e)),
            }
        }
    }

    /// Write input to the child
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        (&self.master).write_all(data).map_err(PtyError::Write)
    }

    /// Update the pty window size; the kernel delivers SIGWINCH to the child
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        set_size(self.master.as_fd(), cols, rows)?;
        debug!("Resized pty to {}x{}", cols, rows);
        Ok(())
    }

    /// Check whether the child has exited, reaping it if so
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait().map_err(PtyError::Wait)?;
        }
        Ok(self.status)
    }

    /// Stop the child and reap it.
    ///
    /// Sends SIGTERM, waits up to a short grace period, then SIGKILLs. Safe to
    /// call more than once; later calls return the recorded status.
    pub fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        debug!("Sending SIGTERM to pid {}", self.pid());
        match kill(self.pid(), Signal::SIGTERM) {
            // Already exited but not yet reaped
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(PtyError::Signal(e)),
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            thread::sleep(TERMINATE_POLL);
        }

        warn!("pid {} ignored SIGTERM, killing it", self.pid());
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(PtyError::Wait(e)),
        }
        let status = self.child.wait().map_err(PtyError::Wait)?;
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Failed to stop child: {}", e);
        }
    }
}

/// Describe an exit status for the log
pub fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        _ => "exited".to_string(),
    }
}

/// Set the window size of any pty side
pub fn set_size(fd: BorrowedFd<'_>, cols: u16, rows: u16) -> Result<()> {
    let winsize = window_size(cols, rows);
    // Safety: winsize outlives the call; a non-tty fd fails with ENOTTY
    unsafe { set_window_size(fd.as_raw_fd(), &winsize) }
        .map(|_| ())
        .map_err(PtyError::Resize)
}

fn window_size(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows.max(1),
        ws_col: cols.max(1),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(PtyError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn read_to_end(child: &ChildProcess) -> Vec<u8> {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match child.read(&mut buf).unwrap() {
                0 => break,
                n => output.extend_from_slice(&buf[..n]),
            }
        }
        output
    }

    #[test]
    fn test_child_output() {
        let mut child = ChildProcess::start(&sh("printf hello"), 80, 24).unwrap();
        let output = read_to_end(&child);
        assert_eq!(output, b"hello");
        assert!(child.terminate().unwrap().success());
    }

    #[test]
    fn test_initial_window_size() {
        let mut child = ChildProcess::start(&sh("stty size"), 91, 17).unwrap();
        let output = String::from_utf8(read_to_end(&child)).unwrap();
        assert_eq!(output.trim(), "17 91");
        child.terminate().unwrap();
    }

    #[test]
    fn test_input_reaches_child() {
        let mut child = ChildProcess::start(&sh("read line; printf \"got:%s\" \"$line\""), 80, 24).unwrap();
        child.write_all(b"ping\n").unwrap();
        let output = String::from_utf8(read_to_end(&child)).unwrap();
        assert!(output.ends_with("got:ping"), "{:?}", output);
        child.terminate().unwrap();
    }

    #[test]
    fn test_missing_program() {
        let argv = vec!["/nonexistent/panebox-test-binary".to_string()];
        match ChildProcess::start(&argv, 80, 24) {
            Err(PtyError::Spawn { source, .. }) => assert_eq!(source.kind(), io::ErrorKind::NotFound),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("missing program started"),
        }
        assert!(matches!(ChildProcess::start(&[], 80, 24), Err(PtyError::EmptyCommand)));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut child = ChildProcess::start(&sh("sleep 30"), 80, 24).unwrap();
        let status = child.terminate().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(child.terminate().unwrap(), status);
        assert_eq!(child.try_wait().unwrap(), Some(status));
    }

    #[test]
    fn test_terminate_kills_stubborn_child() {
        let mut child = ChildProcess::start(&sh("trap '' TERM; printf ready; sleep 30"), 80, 24).unwrap();
        let mut buf = [0u8; 16];
        // Wait until the trap is installed
        assert!(child.read(&mut buf).unwrap() > 0);
        let status = child.terminate().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_resize() {
        let mut child = ChildProcess::start(&sh("read _; stty size"), 80, 24).unwrap();
        child.resize(120, 40).unwrap();
        child.write_all(b"\n").unwrap();
        let output = String::from_utf8(read_to_end(&child)).unwrap();
        assert!(output.trim_end().ends_with("40 120"), "{:?}", output);
        child.terminate().unwrap();
    }

    #[test]
    fn test_describe_status() {
        let mut child = ChildProcess::start(&sh("exit 3"), 80, 24).unwrap();
        read_to_end(&child);
        let status = child.terminate().unwrap();
        assert_eq!(describe_status(&status), "exited with status 3");
    }
}
