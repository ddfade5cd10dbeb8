//! Asynchronous signal delivery
//!
//! Handlers only set flags; the relay loop collects them with
//! [`SignalFlags::take`] at the top of each iteration and does all terminal
//! work itself.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGWINCH};
use signal_hook::{flag, low_level, SigId};

bitflags! {
    /// Signals received since the last check
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Pending: u8 {
        const RESIZE    = 0b0001;
        const INTERRUPT = 0b0010;
        const TERMINATE = 0b0100;
        const HANGUP    = 0b1000;
    }
}

impl Pending {
    /// Any signal that ends the session
    pub fn wants_shutdown(self) -> bool {
        self.intersects(Self::INTERRUPT | Self::TERMINATE | Self::HANGUP)
    }
}

/// Flag-setting handlers for the signals the relay loop cares about.
/// The handlers are removed on drop.
pub struct SignalFlags {
    flags: Vec<(Pending, Arc<AtomicBool>)>,
    ids: Vec<SigId>,
}

impl SignalFlags {
    pub fn register() -> io::Result<Self> {
        let mut this = Self {
            flags: Vec::new(),
            ids: Vec::new(),
        };
        for (signal, pending) in [
            (SIGWINCH, Pending::RESIZE),
            (SIGINT, Pending::INTERRUPT),
            (SIGTERM, Pending::TERMINATE),
            (SIGHUP, Pending::HANGUP),
        ] {
            let raised = Arc::new(AtomicBool::new(false));
            this.ids.push(flag::register(signal, Arc::clone(&raised))?);
            this.flags.push((pending, raised));
        }
        Ok(this)
    }

    /// Collect and clear the received signals
    pub fn take(&self) -> Pending {
        self.flags
            .iter()
            .filter(|(_, raised)| raised.swap(false, Ordering::SeqCst))
            .fold(Pending::empty(), |acc, (pending, _)| acc | *pending)
    }
}

impl Drop for SignalFlags {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
    }
}
