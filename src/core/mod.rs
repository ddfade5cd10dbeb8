//! Core pane components.
//!
//! - **term**: escape sequence scanner and pane translator
//! - **pty**: Unix pseudo-terminal and child process lifecycle
//! - **host**: host terminal checks, raw mode, pane setup/teardown bytes
//! - **signals**: flag-based signal delivery
//! - **session**: the relay loop tying them together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── ChildProcess (pty master + child)
//! ├── Translator
//! │   └── Scanner
//! ├── TerminalMode (raw mode snapshot)
//! └── SignalFlags
//! ```

pub mod term;

#[cfg(unix)]
pub mod host;
#[cfg(unix)]
pub mod pty;
#[cfg(unix)]
pub mod session;
#[cfg(unix)]
pub mod signals;
