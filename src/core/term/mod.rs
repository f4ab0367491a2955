//! Terminal emulation: scrollback buffer, escape interpreter, selection and search.

pub mod buffer;
pub mod parser;
pub mod search;

pub use buffer::{ScreenBuffer, DEFAULT_ATTR};
pub use parser::{EscapeInterpreter, Response};
pub use search::Direction;

/// A screen buffer driven by an escape interpreter
pub struct Terminal {
    pub buffer: ScreenBuffer,
    parser: EscapeInterpreter,
}

impl Terminal {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            buffer: ScreenBuffer::new(cols, rows),
            parser: EscapeInterpreter::new(),
        }
    }

    /// Process host output, returning whatever needs a reaction
    pub fn feed(&mut self, data: &[u8]) -> Vec<Response> {
        let mut out = Vec::new();
        for &byte in data {
            if let Some(response) = self.parser.feed(byte, &mut self.buffer) {
                out.push(response);
            }
        }
        out
    }

    /// Recognise telnet IAC sequences in the stream
    pub fn set_telnet(&mut self, on: bool) {
        self.parser.set_telnet(on);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.buffer.resize(cols, rows);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_collects_responses() {
        let mut term = Terminal::new(80, 24);
        let out = term.feed(b"hi\x1b[6n\x07");
        assert_eq!(out, vec![Response::CursorPosition(1, 3), Response::Bell]);
    }

    #[test]
    fn test_split_sequence_across_feeds() {
        let mut term = Terminal::new(80, 24);
        term.feed(b"\x1b[");
        term.feed(b"2;");
        term.feed(b"4H*");
        assert_eq!(term.buffer.cursor_position(), (1, 4));
    }

    #[test]
    fn test_maximal_scroll_counts() {
        let mut term = Terminal::new(80, 24);
        term.feed(b"prompt$ ");
        term.feed(b"\x1b[65535T\x1b[65535S");
        let buf = &term.buffer;
        assert!(buf.cursor() <= buf.end());
        assert!(buf.cursor_row() < buf.line_count());
        assert_eq!(buf.cursor_position(), (0, 8));
    }
}
