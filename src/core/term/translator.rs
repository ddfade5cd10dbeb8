//! Pane translator
//!
//! Rewrites the child's output so a full-screen program that believes it owns
//! an N-row terminal draws inside the pane instead of over the host screen.
//! Only sequences that could reach outside the pane are rewritten; everything
//! else is forwarded byte-for-byte.

use std::io::{self, Write};

use tracing::debug;

use super::parser::{ControlSequence, Event, Scanner};
use crate::config::ErasePolicy;
use crate::wm::PaneGeometry;

const ESC: u8 = 0x1B;
/// DECSC / DECRC
const SAVE_CURSOR: &[u8] = b"\x1b7";
const RESTORE_CURSOR: &[u8] = b"\x1b8";
const ERASE_LINE: &[u8] = b"\x1b[2K";
const CURSOR_UP: &[u8] = b"\x1b[A";
const CURSOR_DOWN: &[u8] = b"\x1b[B";

/// Private modes that switch the host to its alternate screen
const ALT_SCREEN_MODES: [u16; 3] = [1049, 1047, 47];

/// DECRQM queries answered locally instead of by the host, as
/// `(mode, status)`. Status 0 reports the mode as not recognised.
const LOCAL_MODE_REPLIES: &[(u16, u8)] = &[(2026, 0)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScrollDirection {
    Up,
    Down,
}

/// Cursor saved by the child with DECSC or SCOSC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SavedCursor {
    row: u16,
    /// The host's save slot still holds this position. Cleared when the
    /// pane moves, since the slot then points at the old host rows.
    on_host: bool,
}

/// Confines a child's terminal output to a [`PaneGeometry`].
///
/// Translated bytes accumulate until [`Translator::flush`]; replies to
/// terminal queries the child is waiting on accumulate separately and must
/// be written back to the pty (see [`Translator::take_replies`]).
#[derive(Debug)]
pub struct Translator {
    geometry: PaneGeometry,
    erase_policy: ErasePolicy,
    scanner: Scanner,
    output: Vec<u8>,
    replies: Vec<u8>,
    /// Cursor row as the child sees it (1-based, pane coordinates)
    cursor_row: u16,
    /// Child's scroll margins in pane coordinates. The host margins always
    /// mirror these, so host scrolling never leaves the pane.
    scroll_region: (u16, u16),
    saved_cursor: Option<SavedCursor>,
}

impl Translator {
    pub fn new(geometry: PaneGeometry, erase_policy: ErasePolicy) -> Self {
        Self {
            geometry,
            erase_policy,
            scanner: Scanner::new(),
            output: Vec::with_capacity(8192),
            replies: Vec::new(),
            cursor_row: 1,
            scroll_region: (1, geometry.height),
            saved_cursor: None,
        }
    }

    pub fn geometry(&self) -> PaneGeometry {
        self.geometry
    }

    #[allow(dead_code)]
    pub fn cursor_row(&self) -> u16 {
        self.cursor_row
    }

    /// Switch to a new pane rectangle. The child's margins fall back to the
    /// whole pane, matching the region the host is re-confined to.
    pub fn set_geometry(&mut self, geometry: PaneGeometry) {
        self.geometry = geometry;
        self.scroll_region = (1, geometry.height);
        self.cursor_row = geometry.clamp_row(self.cursor_row);
        if let Some(saved) = &mut self.saved_cursor {
            saved.row = geometry.clamp_row(saved.row);
            saved.on_host = false;
        }
    }

    /// Feed child output
    pub fn write(&mut self, data: &[u8]) {
        for &byte in data {
            if let Some(event) = self.scanner.feed(byte) {
                self.dispatch(event);
            }
        }
    }

    /// End of the child's stream: drop any half-received sequence
    pub fn finish(&mut self) {
        if self.scanner.is_mid_sequence() {
            debug!("Child output ended inside an escape sequence");
        }
        self.scanner.reset();
    }

    /// Translated bytes not yet flushed
    pub fn pending(&self) -> &[u8] {
        &self.output
    }

    /// Write buffered output to the host terminal in one batch
    pub fn flush<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        out.write_all(&self.output)?;
        out.flush()?;
        self.output.clear();
        Ok(())
    }

    /// Take replies destined for the child's terminal input
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Literal(byte) => {
                self.output.push(byte);
                // LF, VT and FF all move down a line
                if matches!(byte, b'\n' | 0x0B | 0x0C) {
                    self.line_feed();
                }
            }
            Event::ReverseIndex => self.reverse_index(),
            Event::Escape(b'c') => self.full_reset(),
            Event::Escape(b'7') => self.save_cursor(SAVE_CURSOR),
            Event::Escape(b'8') => self.restore_cursor(RESTORE_CURSOR),
            Event::Escape(byte) => {
                self.output.extend_from_slice(&[ESC, byte]);
                // IND / NEL
                if matches!(byte, b'D' | b'E') {
                    self.line_feed();
                }
            }
            Event::Csi(seq) => self.control_sequence(&seq),
        }
    }

    fn control_sequence(&mut self, seq: &ControlSequence) {
        match (seq.private_marker(), seq.intermediates(), seq.final_byte()) {
            // CUP / HVP
            (None, [], b'H' | b'f') => self.cursor_position(seq),
            // VPA
            (None, [], b'd') => self.line_position(seq),
            // DECSTBM
            (None, [], b'r') => self.set_scroll_region(seq),
            // ED / DECSED
            (None | Some(b'?'), [], b'J') => self.erase_in_display(seq),
            // SU
            (None, [], b'S') => self.scroll(seq.param_or(0, 1), ScrollDirection::Up),
            // SD (the five-parameter form is an old mouse tracking request)
            (None, [], b'T') if seq.params().len() <= 1 => {
                self.scroll(seq.param_or(0, 1), ScrollDirection::Down);
            }
            // CUU / CPL
            (None, [], b'A' | b'F') => {
                self.cursor_up(seq.param_or(0, 1));
                self.passthrough(seq);
            }
            // CUD / CNL
            (None, [], b'B' | b'E') => {
                self.cursor_down(seq.param_or(0, 1));
                self.passthrough(seq);
            }
            // SCOSC / SCORC
            (None, [], b's') if seq.params().is_empty() => self.save_cursor(seq.as_bytes()),
            (None, [], b'u') if seq.params().is_empty() => self.restore_cursor(seq.as_bytes()),
            // DECSET / DECRST
            (Some(b'?'), [], b'h' | b'l') => self.private_mode(seq),
            // DECRQM
            (Some(b'?'), [b'$'], b'p') => self.mode_query(seq),
            // DECSTR
            (None, [b'!'], b'p') => self.soft_reset(seq),
            _ => self.passthrough(seq),
        }
    }

    fn passthrough(&mut self, seq: &ControlSequence) {
        self.output.extend_from_slice(seq.as_bytes());
    }

    fn cursor_position(&mut self, seq: &ControlSequence) {
        let row = self.geometry.clamp_row(seq.param_or(0, 1));
        let col = self.geometry.clamp_col(seq.param_or(1, 1));
        self.cursor_row = row;
        self.move_to(row, col);
    }

    fn line_position(&mut self, seq: &ControlSequence) {
        let row = self.geometry.clamp_row(seq.param_or(0, 1));
        self.cursor_row = row;
        self.output
            .extend_from_slice(format!("\x1b[{}d", self.geometry.host_row(row)).as_bytes());
    }

    fn set_scroll_region(&mut self, seq: &ControlSequence) {
        let height = self.geometry.height;
        let top = self.geometry.clamp_row(seq.param_or(0, 1));
        let bottom = self.geometry.clamp_row(seq.param_or(1, height));
        self.scroll_region = if top < bottom { (top, bottom) } else { (1, height) };
        self.push_region();
        // DECSTBM homes the cursor to the top of the host screen
        self.move_to(1, 1);
        self.cursor_row = 1;
    }

    fn erase_in_display(&mut self, seq: &ControlSequence) {
        let mode = seq.param(0).unwrap_or(0);
        match (self.erase_policy, mode) {
            (_, 2 | 3) | (ErasePolicy::Pane, 0 | 1) => self.clear_pane(),
            (ErasePolicy::Cursor, 0) => self.erase_below(),
            (ErasePolicy::Cursor, 1) => self.erase_above(),
            _ => debug!("Dropping erase-in-display with unknown mode {}", mode),
        }
    }

    /// Clear every pane row and home the cursor to the pane origin
    fn clear_pane(&mut self) {
        for row in 1..=self.geometry.height {
            self.move_to(row, 1);
            self.output.extend_from_slice(ERASE_LINE);
        }
        self.move_to(1, 1);
        self.cursor_row = 1;
    }

    /// Erase from the cursor to the end of the pane. Relative moves keep the
    /// column without touching the host's cursor save slot.
    fn erase_below(&mut self) {
        let (_, bottom) = self.scroll_region;
        let last = if self.cursor_row <= bottom { bottom } else { self.geometry.height };
        let rows = last.saturating_sub(self.cursor_row);

        self.output.extend_from_slice(b"\x1b[K");
        for _ in 0..rows {
            self.output.extend_from_slice(CURSOR_DOWN);
            self.output.extend_from_slice(ERASE_LINE);
        }
        if rows > 0 {
            self.output
                .extend_from_slice(format!("\x1b[{}A", rows).as_bytes());
        }
    }

    /// Erase from the top of the pane to the cursor
    fn erase_above(&mut self) {
        let (top, _) = self.scroll_region;
        let first = if self.cursor_row >= top { top } else { 1 };
        let rows = self.cursor_row.saturating_sub(first);

        self.output.extend_from_slice(b"\x1b[1K");
        for _ in 0..rows {
            self.output.extend_from_slice(CURSOR_UP);
            self.output.extend_from_slice(ERASE_LINE);
        }
        if rows > 0 {
            self.output
                .extend_from_slice(format!("\x1b[{}B", rows).as_bytes());
        }
    }

    /// Scroll the child's region. The host margins already match it, so a
    /// plain SU/SD stays inside the pane and leaves the cursor alone.
    fn scroll(&mut self, count: u16, direction: ScrollDirection) {
        let (top, bottom) = self.scroll_region;
        let count = count.clamp(1, bottom - top + 1);
        let final_byte = match direction {
            ScrollDirection::Up => 'S',
            ScrollDirection::Down => 'T',
        };
        self.output
            .extend_from_slice(format!("\x1b[{}{}", count, final_byte).as_bytes());
    }

    fn reverse_index(&mut self) {
        let (top, _) = self.scroll_region;
        if self.cursor_row == top {
            self.scroll(1, ScrollDirection::Down);
        } else if self.cursor_row > 1 {
            self.cursor_row -= 1;
            self.output.extend_from_slice(CURSOR_UP);
        }
    }

    fn save_cursor(&mut self, sequence: &[u8]) {
        self.saved_cursor = Some(SavedCursor {
            row: self.cursor_row,
            on_host: true,
        });
        self.output.extend_from_slice(sequence);
    }

    fn restore_cursor(&mut self, sequence: &[u8]) {
        match self.saved_cursor {
            Some(SavedCursor { row, on_host: true }) => {
                self.cursor_row = row;
                self.output.extend_from_slice(sequence);
            }
            // The host slot is stale or holds nothing of the child's; either
            // would land outside the pane
            Some(SavedCursor { row, on_host: false }) => {
                self.cursor_row = row;
                self.move_to(row, 1);
            }
            None => {
                self.cursor_row = 1;
                self.move_to(1, 1);
            }
        }
    }

    fn line_feed(&mut self) {
        let (_, bottom) = self.scroll_region;
        if self.cursor_row != bottom {
            self.cursor_row = self.geometry.clamp_row(self.cursor_row.saturating_add(1));
        }
    }

    fn cursor_up(&mut self, count: u16) {
        let (top, _) = self.scroll_region;
        let floor = if self.cursor_row >= top { top } else { 1 };
        self.cursor_row = self.cursor_row.saturating_sub(count).max(floor);
    }

    fn cursor_down(&mut self, count: u16) {
        let (_, bottom) = self.scroll_region;
        let ceiling = if self.cursor_row <= bottom { bottom } else { self.geometry.height };
        self.cursor_row = self.cursor_row.saturating_add(count).min(ceiling);
    }

    fn private_mode(&mut self, seq: &ControlSequence) {
        let kept: Vec<u16> = seq
            .params()
            .iter()
            .copied()
            .filter(|mode| !ALT_SCREEN_MODES.contains(mode))
            .collect();
        if kept.len() == seq.params().len() {
            self.passthrough(seq);
            return;
        }

        debug!(
            "Swallowing alternate screen switch: {:?}{}",
            seq.params(),
            seq.final_byte() as char
        );
        if !kept.is_empty() {
            let rest = ControlSequence::new(Some(b'?'), &kept, &[], seq.final_byte());
            self.output.extend_from_slice(rest.as_bytes());
        }
    }

    fn mode_query(&mut self, seq: &ControlSequence) {
        let mut answered = false;
        for &(mode, status) in LOCAL_MODE_REPLIES {
            if seq.has_param(mode) {
                debug!("Answering mode query {} locally", mode);
                self.replies
                    .extend_from_slice(format!("\x1b[?{};{}$y", mode, status).as_bytes());
                answered = true;
            }
        }
        if !answered {
            self.passthrough(seq);
        }
    }

    /// DECSTR resets the host margins to the full screen; put them back.
    /// It also resets the saved cursor, so the save slot is free to use here.
    fn soft_reset(&mut self, seq: &ControlSequence) {
        self.passthrough(seq);
        self.scroll_region = (1, self.geometry.height);
        self.saved_cursor = None;
        self.output.extend_from_slice(SAVE_CURSOR);
        self.push_region();
        self.output.extend_from_slice(RESTORE_CURSOR);
    }

    /// RIS would wipe the host screen and scrollback; reset the pane instead
    fn full_reset(&mut self) {
        debug!("Replacing full reset with pane clear");
        self.scroll_region = (1, self.geometry.height);
        self.saved_cursor = None;
        self.push_region();
        self.clear_pane();
    }

    fn move_to(&mut self, row: u16, col: u16) {
        let host_row = self.geometry.host_row(row);
        self.output
            .extend_from_slice(format!("\x1b[{};{}H", host_row, col).as_bytes());
    }

    fn push_region(&mut self) {
        let (top, bottom) = self.scroll_region;
        let region = format!(
            "\x1b[{};{}r",
            self.geometry.host_row(top),
            self.geometry.host_row(bottom)
        );
        self.output.extend_from_slice(region.as_bytes());
    }
}
