//! Escape sequence scanner
//!
//! Splits the child's output into literal bytes and parsed CSI control
//! sequences. Only the parts of ECMA-48 that can move the cursor or touch the
//! screen outside the pane need decoding; everything else is handed back as
//! bytes so the translator can forward it untouched.

const ESC: u8 = 0x1B;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1A;

/// Longest sequence kept in the raw buffer before it is considered garbage.
const MAX_SEQUENCE_LEN: usize = 256;

/// A complete CSI sequence: `ESC [ <marker> <params> <intermediates> <final>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSequence {
    params: Vec<u16>,
    intermediates: Vec<u8>,
    final_byte: u8,
    private_marker: Option<u8>,
    /// Bytes the sequence was parsed from, `ESC [` included
    raw: Vec<u8>,
}

impl ControlSequence {
    /// Build a sequence from its parts. Used when a sequence has to be
    /// re-emitted with modified parameters.
    pub fn new(private_marker: Option<u8>, params: &[u16], intermediates: &[u8], final_byte: u8) -> Self {
        let mut raw = vec![ESC, b'['];
        if let Some(marker) = private_marker {
            raw.push(marker);
        }
        let joined = params
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(";");
        raw.extend_from_slice(joined.as_bytes());
        raw.extend_from_slice(intermediates);
        raw.push(final_byte);

        Self {
            params: params.to_vec(),
            intermediates: intermediates.to_vec(),
            final_byte,
            private_marker,
            raw,
        }
    }

    pub fn params(&self) -> &[u16] {
        &self.params
    }

    /// Parameter at `index` as written, `None` when absent
    pub fn param(&self, index: usize) -> Option<u16> {
        self.params.get(index).copied()
    }

    /// Parameter at `index`, with an absent or zero value replaced by `default`
    pub fn param_or(&self, index: usize, default: u16) -> u16 {
        match self.param(index) {
            Some(0) | None => default,
            Some(value) => value,
        }
    }

    pub fn has_param(&self, value: u16) -> bool {
        self.params.contains(&value)
    }

    pub fn intermediates(&self) -> &[u8] {
        &self.intermediates
    }

    pub fn final_byte(&self) -> u8 {
        self.final_byte
    }

    pub fn private_marker(&self) -> Option<u8> {
        self.private_marker
    }

    /// The exact bytes this sequence was parsed from
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// One unit of scanner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A byte outside any escape sequence (printable text, UTF-8, C0 controls)
    Literal(u8),
    /// `ESC <byte>` for anything other than CSI and RI (charsets, DECSC, OSC start, ...)
    Escape(u8),
    /// `ESC M`
    ReverseIndex,
    /// A complete CSI sequence
    Csi(ControlSequence),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    /// Rest of an oversized CSI, consumed up to its final byte
    CsiIgnore,
}

/// Byte-at-a-time CSI scanner
///
/// Each call to [`Scanner::feed`] yields at most one event, so a sequence
/// split across two `read()` calls parses exactly like one delivered whole.
#[derive(Debug, Default)]
pub struct Scanner {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    private_marker: Option<u8>,
    raw: Vec<u8>,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(16),
            intermediates: Vec::with_capacity(4),
            private_marker: None,
            raw: Vec::with_capacity(32),
        }
    }

    /// Feed a whole buffer, handing every event to `dispatch` in order
    #[allow(dead_code)]
    pub fn advance<F: FnMut(Event)>(&mut self, bytes: &[u8], mut dispatch: F) {
        for &byte in bytes {
            if let Some(event) = self.feed(byte) {
                dispatch(event);
            }
        }
    }

    /// Feed a single byte to the scanner
    pub fn feed(&mut self, byte: u8) -> Option<Event> {
        match self.state {
            ParserState::Ground => self.ground(byte),
            ParserState::Escape => self.escape(byte),
            ParserState::CsiEntry
            | ParserState::CsiParam
            | ParserState::CsiIntermediate
            | ParserState::CsiIgnore => {
                // C0 controls inside a CSI are executed in place (VT500 behaviour)
                if byte < 0x20 {
                    return self.control_in_csi(byte);
                }
                if self.state != ParserState::CsiIgnore && self.raw.len() >= MAX_SEQUENCE_LEN {
                    tracing::debug!("Dropping oversized CSI ({} bytes)", self.raw.len());
                    self.clear_sequence();
                    self.state = ParserState::CsiIgnore;
                }
                match self.state {
                    ParserState::CsiEntry => self.csi_entry(byte),
                    ParserState::CsiParam => self.csi_param(byte),
                    ParserState::CsiIgnore => self.csi_ignore(byte),
                    _ => self.csi_intermediate(byte),
                }
            }
        }
    }

    /// Discard any partially scanned sequence (end of stream)
    pub fn reset(&mut self) {
        self.state = ParserState::Ground;
        self.clear_sequence();
    }

    /// Whether the scanner is in the middle of an escape sequence
    pub fn is_mid_sequence(&self) -> bool {
        self.state != ParserState::Ground
    }

    fn clear_sequence(&mut self) {
        self.params.clear();
        self.intermediates.clear();
        self.private_marker = None;
        self.raw.clear();
    }

    fn ground(&mut self, byte: u8) -> Option<Event> {
        if byte == ESC {
            self.state = ParserState::Escape;
            None
        } else {
            Some(Event::Literal(byte))
        }
    }

    fn escape(&mut self, byte: u8) -> Option<Event> {
        match byte {
            b'[' => {
                self.clear_sequence();
                self.raw.extend_from_slice(&[ESC, b'[']);
                self.state = ParserState::CsiEntry;
                None
            }
            b'M' => {
                self.state = ParserState::Ground;
                Some(Event::ReverseIndex)
            }
            // A second ESC restarts the escape
            ESC => None,
            CAN | SUB => {
                self.state = ParserState::Ground;
                Some(Event::Literal(byte))
            }
            0x00..=0x1F => Some(Event::Literal(byte)),
            _ => {
                self.state = ParserState::Ground;
                Some(Event::Escape(byte))
            }
        }
    }

    fn control_in_csi(&mut self, byte: u8) -> Option<Event> {
        match byte {
            ESC => {
                tracing::debug!("ESC interrupted CSI: {:?}", self.raw);
                self.clear_sequence();
                self.state = ParserState::Escape;
                None
            }
            CAN | SUB => {
                self.clear_sequence();
                self.state = ParserState::Ground;
                Some(Event::Literal(byte))
            }
            _ => Some(Event::Literal(byte)),
        }
    }

    fn csi_ignore(&mut self, byte: u8) -> Option<Event> {
        if (0x40..=0x7E).contains(&byte) {
            self.state = ParserState::Ground;
        }
        None
    }

    fn csi_entry(&mut self, byte: u8) -> Option<Event> {
        self.raw.push(byte);
        match byte {
            b'0'..=b'9' => {
                self.params.push(u16::from(byte - b'0'));
                self.state = ParserState::CsiParam;
            }
            b';' | b':' => {
                self.params.push(0);
            }
            b'?' | b'<' | b'=' | b'>' => {
                self.private_marker = Some(byte);
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => return Some(self.dispatch(byte)),
            _ => {}
        }
        None
    }

    fn csi_param(&mut self, byte: u8) -> Option<Event> {
        self.raw.push(byte);
        match byte {
            b'0'..=b'9' => {
                let digit = u16::from(byte - b'0');
                if let Some(last) = self.params.last_mut() {
                    *last = last.saturating_mul(10).saturating_add(digit);
                }
            }
            // Colon sub-parameters count as separate parameters
            b';' | b':' => {
                self.params.push(0);
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => return Some(self.dispatch(byte)),
            _ => {}
        }
        None
    }

    fn csi_intermediate(&mut self, byte: u8) -> Option<Event> {
        self.raw.push(byte);
        match byte {
            0x20..=0x2F => {
                self.intermediates.push(byte);
            }
            0x40..=0x7E => return Some(self.dispatch(byte)),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self, final_byte: u8) -> Event {
        self.state = ParserState::Ground;
        let sequence = ControlSequence {
            params: std::mem::take(&mut self.params),
            intermediates: std::mem::take(&mut self.intermediates),
            final_byte,
            private_marker: self.private_marker.take(),
            raw: std::mem::take(&mut self.raw),
        };
        Event::Csi(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scan(bytes: &[u8]) -> Vec<Event> {
        let mut scanner = Scanner::new();
        let mut events = Vec::new();
        scanner.advance(bytes, |event| events.push(event));
        events
    }

    fn csi(event: &Event) -> &ControlSequence {
        match event {
            Event::Csi(seq) => seq,
            other => panic!("expected CSI, got {:?}", other),
        }
    }

    #[test]
    fn test_cursor_position() {
        let events = scan(b"\x1b[5;10H");
        assert_eq!(events.len(), 1);
        let seq = csi(&events[0]);
        assert_eq!(seq.params(), &[5, 10]);
        assert_eq!(seq.final_byte(), b'H');
        assert_eq!(seq.private_marker(), None);
        assert!(seq.intermediates().is_empty());
    }

    #[test]
    fn test_literals_pass_as_single_bytes() {
        let events = scan(b"ab\r\n");
        assert_eq!(
            events,
            vec![
                Event::Literal(b'a'),
                Event::Literal(b'b'),
                Event::Literal(b'\r'),
                Event::Literal(b'\n'),
            ]
        );
    }

    #[test]
    fn test_private_marker_and_intermediate() {
        let events = scan(b"\x1b[?2026$p");
        let seq = csi(&events[0]);
        assert_eq!(seq.private_marker(), Some(b'?'));
        assert_eq!(seq.params(), &[2026]);
        assert_eq!(seq.intermediates(), b"$");
        assert_eq!(seq.final_byte(), b'p');
    }

    #[test]
    fn test_empty_params() {
        let seq = scan(b"\x1b[H").remove(0);
        assert!(csi(&seq).params().is_empty());
        assert_eq!(csi(&seq).param_or(0, 1), 1);

        // Leading empty parameter is an implicit zero
        let seq = scan(b"\x1b[;5H").remove(0);
        assert_eq!(csi(&seq).params(), &[0, 5]);
        assert_eq!(csi(&seq).param_or(0, 1), 1);
        assert_eq!(csi(&seq).param_or(1, 1), 5);

        let seq = scan(b"\x1b[1;;2m").remove(0);
        assert_eq!(csi(&seq).params(), &[1, 0, 2]);
    }

    #[test]
    fn test_parameter_saturates() {
        let seq = scan(b"\x1b[99999999H").remove(0);
        assert_eq!(csi(&seq).params(), &[u16::MAX]);
    }

    #[test]
    fn test_reverse_index_and_other_escapes() {
        assert_eq!(scan(b"\x1bM"), vec![Event::ReverseIndex]);
        assert_eq!(scan(b"\x1b7\x1b8"), vec![Event::Escape(b'7'), Event::Escape(b'8')]);
        assert_eq!(
            scan(b"\x1b(B"),
            vec![Event::Escape(b'('), Event::Literal(b'B')]
        );
    }

    #[test]
    fn test_double_escape_restarts() {
        let events = scan(b"\x1b\x1b[2J");
        assert_eq!(events.len(), 1);
        assert_eq!(csi(&events[0]).final_byte(), b'J');
    }

    #[test]
    fn test_split_sequence() {
        let mut scanner = Scanner::new();
        let mut events = Vec::new();
        scanner.advance(b"x\x1b[1", |e| events.push(e));
        assert_eq!(events, vec![Event::Literal(b'x')]);
        assert!(scanner.is_mid_sequence());
        scanner.advance(b"2;4", |e| events.push(e));
        scanner.advance(b"0H", |e| events.push(e));
        assert_eq!(events.len(), 2);
        assert_eq!(csi(&events[1]).params(), &[12, 40]);
        assert!(!scanner.is_mid_sequence());
    }

    #[test]
    fn test_incomplete_sequence_discarded_on_reset() {
        let mut scanner = Scanner::new();
        let mut events = Vec::new();
        scanner.advance(b"\x1b[?104", |e| events.push(e));
        assert!(events.is_empty());
        scanner.reset();
        scanner.advance(b"9h", |e| events.push(e));
        assert_eq!(events, vec![Event::Literal(b'9'), Event::Literal(b'h')]);
    }

    #[test]
    fn test_controls_inside_csi() {
        // Line feed executes without aborting the sequence
        let events = scan(b"\x1b[5\nH");
        assert_eq!(events[0], Event::Literal(b'\n'));
        assert_eq!(csi(&events[1]).params(), &[5]);
        assert_eq!(csi(&events[1]).as_bytes(), b"\x1b[5H");

        // CAN aborts
        let events = scan(b"\x1b[5\x18H");
        assert_eq!(events, vec![Event::Literal(0x18), Event::Literal(b'H')]);

        // ESC starts over
        let events = scan(b"\x1b[5\x1b[7H");
        assert_eq!(events.len(), 1);
        assert_eq!(csi(&events[0]).params(), &[7]);
    }

    #[test]
    fn test_raw_bytes_preserved() {
        for input in [
            &b"\x1b[;1m"[..],
            b"\x1b[38:2:10:20:30m",
            b"\x1b[1;m",
            b"\x1b[ q",
            b"\x1b[>4;1m",
        ] {
            let events = scan(input);
            assert_eq!(events.len(), 1, "{:?}", input);
            assert_eq!(csi(&events[0]).as_bytes(), input);
        }
    }

    #[test]
    fn test_constructed_sequence() {
        let seq = ControlSequence::new(Some(b'?'), &[25, 1000], &[], b'h');
        assert_eq!(seq.as_bytes(), b"\x1b[?25;1000h");
        assert_eq!(scan(seq.as_bytes()), vec![Event::Csi(seq)]);
    }

    #[test]
    fn test_ignored_bytes_kept_in_raw() {
        let events = scan(b"\x1b[1\x7f\xc3m");
        assert_eq!(events.len(), 1);
        assert_eq!(csi(&events[0]).params(), &[1]);
        assert_eq!(csi(&events[0]).as_bytes(), b"\x1b[1\x7f\xc3m");
    }

    #[test]
    fn test_oversized_sequence_swallowed() {
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b'1').take(300));
        input.extend_from_slice(b";2Hok");
        assert_eq!(scan(&input), vec![Event::Literal(b'o'), Event::Literal(b'k')]);

        // Controls still execute and ESC still aborts
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b';').take(300));
        input.extend_from_slice(b"\n9\x1b[3H");
        let events = scan(&input);
        assert_eq!(events[0], Event::Literal(b'\n'));
        assert_eq!(csi(&events[1]).params(), &[3]);
        assert_eq!(events.len(), 2);

        // A sequence split at the limit behaves the same
        let mut scanner = Scanner::new();
        let mut events = Vec::new();
        scanner.advance(&[b"\x1b[".as_slice(), &[b'5'; 280]].concat(), |e| events.push(e));
        assert!(scanner.is_mid_sequence());
        scanner.advance(b"5mx", |e| events.push(e));
        assert_eq!(events, vec![Event::Literal(b'x')]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(
            bytes in proptest::collection::vec(
                prop_oneof![
                    Just(0x1Bu8), Just(b'['), Just(b';'), Just(b'?'), Just(b'$'),
                    b'0'..=b'9', 0x20u8..=0x7E, any::<u8>(),
                ],
                0..256,
            ),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let whole = scan(&bytes);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            let mut scanner = Scanner::new();
            let mut chunked = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                scanner.advance(&bytes[start..point], |e| chunked.push(e));
                start = point;
            }
            prop_assert_eq!(whole, chunked);
        }

        #[test]
        fn byte_at_a_time_matches_whole(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let whole = scan(&bytes);
            let mut scanner = Scanner::new();
            let single: Vec<Event> = bytes.iter().filter_map(|&b| scanner.feed(b)).collect();
            prop_assert_eq!(whole, single);
        }
    }
}
