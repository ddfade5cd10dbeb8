//! Host terminal handling
//!
//! Precondition checks, the raw-mode snapshot, and the escape sequences that
//! set up and tear down the pane on the real terminal.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::queue;
use crossterm::terminal;
use crossterm::tty::IsTty;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use thiserror::Error;
use tracing::debug;

use crate::wm::PaneGeometry;

/// Reset the scroll margins to the whole screen
const RELEASE_REGION: &[u8] = b"\x1b[r";

nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, libc::winsize);

#[derive(Error, Debug)]
pub enum HostError {
    #[error("stdin and stdout must be an interactive terminal")]
    NotATerminal,

    #[error("Failed to open terminal: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to query terminal size: {0}")]
    Size(#[source] io::Error),

    #[error("Failed to change terminal mode: {0}")]
    Mode(#[source] nix::Error),

    #[error("Failed to write to terminal: {0}")]
    Write(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Refuse to run unless both ends are a terminal
pub fn ensure_interactive() -> Result<()> {
    if io::stdin().is_tty() && io::stdout().is_tty() {
        Ok(())
    } else {
        Err(HostError::NotATerminal)
    }
}

/// Size of the terminal behind `tty` as (cols, rows)
pub fn size(tty: BorrowedFd<'_>) -> Result<(u16, u16)> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // Safety: winsize is a valid, writable winsize for the whole call
    unsafe { get_window_size(tty.as_raw_fd(), &mut winsize) }
        .map_err(|e| HostError::Size(io::Error::from(e)))?;
    if winsize.ws_row == 0 || winsize.ws_col == 0 {
        // Some terminals leave the kernel size unset
        return terminal::size().map_err(HostError::Size);
    }
    Ok((winsize.ws_col, winsize.ws_row))
}

/// Terminal Mode Snapshot: the input mode in effect before raw mode.
/// Restored on [`TerminalMode::restore`] or drop.
pub struct TerminalMode {
    tty: OwnedFd,
    saved: Option<Termios>,
}

impl TerminalMode {
    /// Save the current mode of `tty` and switch it to raw
    pub fn enter_raw(tty: BorrowedFd<'_>) -> Result<Self> {
        let tty = tty.try_clone_to_owned().map_err(HostError::Open)?;
        let saved = tcgetattr(tty.as_fd()).map_err(HostError::Mode)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(tty.as_fd(), SetArg::TCSANOW, &raw).map_err(HostError::Mode)?;
        debug!("Entered raw mode");
        Ok(Self {
            tty,
            saved: Some(saved),
        })
    }

    /// Put the saved mode back. Only the first call does anything.
    pub fn restore(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            tcsetattr(self.tty.as_fd(), SetArg::TCSADRAIN, &saved).map_err(HostError::Mode)?;
            debug!("Restored terminal mode");
        }
        Ok(())
    }
}

impl Drop for TerminalMode {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Make room for the pane and confine the host to it.
///
/// Scrolls the existing screen up by the pane height so nothing is drawn
/// over, then hides the cursor, sets the scroll margins to the pane and
/// parks the cursor at its top-left cell.
pub fn enter_pane<W: Write>(out: &mut W, geometry: PaneGeometry) -> io::Result<()> {
    queue!(out, MoveTo(0, geometry.bottom() - 1))?;
    for _ in 0..geometry.height {
        out.write_all(b"\n")?;
    }
    queue!(out, Hide)?;
    confine(out, geometry)?;
    out.flush()
}

/// Set the host scroll margins to the pane rows and home the cursor in it
pub fn confine<W: Write>(out: &mut W, geometry: PaneGeometry) -> io::Result<()> {
    write!(out, "\x1b[{};{}r", geometry.top(), geometry.bottom())?;
    queue!(out, MoveTo(0, geometry.top() - 1))
}

/// Undo [`enter_pane`]'s margins and cursor hiding
pub fn release<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(RELEASE_REGION)?;
    queue!(out, Show)?;
    out.flush()
}

/// Leave the cursor on a fresh line below the pane
pub fn park_cursor<W: Write>(out: &mut W, host_rows: u16) -> io::Result<()> {
    queue!(out, MoveTo(0, host_rows.saturating_sub(1)))?;
    out.write_all(b"\r\n")?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_pane() {
        let mut out = Vec::new();
        enter_pane(&mut out, PaneGeometry::new(38, 3, 80)).unwrap();
        assert_eq!(out, b"\x1b[40;1H\n\n\n\x1b[?25l\x1b[38;40r\x1b[38;1H");
    }

    #[test]
    fn test_confine_after_resize() {
        let mut out = Vec::new();
        confine(&mut out, PaneGeometry::anchored_bottom(80, 50, 20)).unwrap();
        assert_eq!(out, b"\x1b[31;50r\x1b[31;1H");
    }

    #[test]
    fn test_size_and_raw_mode_on_pty() {
        use nix::pty::{openpty, Winsize};
        use nix::sys::termios::{LocalFlags, InputFlags};

        let winsize = Winsize {
            ws_row: 33,
            ws_col: 101,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(&winsize, None).unwrap();
        assert_eq!(size(pty.slave.as_fd()).unwrap(), (101, 33));

        let mut mode = TerminalMode::enter_raw(pty.slave.as_fd()).unwrap();
        let raw = tcgetattr(pty.slave.as_fd()).unwrap();
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.input_flags.contains(InputFlags::IXON));

        mode.restore().unwrap();
        mode.restore().unwrap();
        let restored = tcgetattr(pty.slave.as_fd()).unwrap();
        assert!(restored.local_flags.contains(LocalFlags::ICANON));
    }

    #[test]
    fn test_release_and_park() {
        let mut out = Vec::new();
        release(&mut out).unwrap();
        park_cursor(&mut out, 24).unwrap();
        assert_eq!(out, b"\x1b[r\x1b[?25h\x1b[24;1H\r\n");
    }
}
