//! Escape interpreter
//!
//! Byte-at-a-time state machine that turns a host stream into ScreenBuffer
//! operations. Telnet IAC sequences are recognised only when enabled for the
//! session and are handed back as responses rather than displayed.

use super::buffer::{is_continuation, ScreenBuffer, DEFAULT_ATTR};

/// Escape sequences longer than this are abandoned
const MAX_SEQUENCE: usize = 31;
/// Longest title kept from an OSC sequence
const MAX_TITLE: usize = 127;
/// Longest telnet subnegotiation kept
const MAX_SUBNEGOTIATION: usize = 64;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

/// Something the session has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Primary device attributes
    DeviceAttributes,
    /// Secondary device attributes
    SecondaryDeviceAttributes,
    /// Status report: terminal OK
    DeviceStatus,
    /// Window title changed
    Title(String),
    /// Telnet command: `[cmd, opt]` or `[SB, payload...]`
    Telnet(Vec<u8>),
    Bell,
}

impl Response {
    /// Bytes to send back to the host, if this is a reply
    pub fn reply(&self) -> Option<Vec<u8>> {
        match self {
            Response::CursorPosition(row, col) => {
                Some(format!("\x1b[{};{}R", row, col).into_bytes())
            }
            Response::DeviceAttributes => Some(b"\x1b[?1;2c".to_vec()),
            Response::SecondaryDeviceAttributes => Some(b"\x1b[>0;10;0c".to_vec()),
            Response::DeviceStatus => Some(b"\x1b[0n".to_vec()),
            Response::Title(_) | Response::Telnet(_) | Response::Bell => None,
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Debug)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    OscString,
    /// ESC received within OSC, waiting for backslash
    EscapeInOsc,
    Iac,
    IacOption(u8),
    IacSub,
    IacSubIac,
    /// Collecting a U+25xx box-drawing glyph on the alternate screen
    Box,
}

/// VT escape interpreter
pub struct EscapeInterpreter {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    current_param: Option<u16>,
    seq_len: usize,
    osc: Vec<u8>,
    sub: Vec<u8>,
    glyph: Vec<u8>,
    telnet: bool,
    reversed: bool,
}

impl Default for EscapeInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl EscapeInterpreter {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(16),
            intermediates: Vec::with_capacity(4),
            current_param: None,
            seq_len: 0,
            osc: Vec::with_capacity(MAX_TITLE + 1),
            sub: Vec::with_capacity(MAX_SUBNEGOTIATION),
            glyph: Vec::with_capacity(3),
            telnet: false,
            reversed: false,
        }
    }

    /// Enable IAC recognition for telnet sessions
    pub fn set_telnet(&mut self, on: bool) {
        self.telnet = on;
        if !on && matches!(
            self.state,
            ParserState::Iac | ParserState::IacOption(_) | ParserState::IacSub | ParserState::IacSubIac
        ) {
            self.state = ParserState::Ground;
        }
    }

    pub fn telnet(&self) -> bool {
        self.telnet
    }

    /// Feed a single byte
    pub fn feed(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if self.telnet && byte == IAC && !self.in_telnet() {
            self.state = ParserState::Iac;
            return None;
        }

        // C0 controls act immediately, even inside a sequence
        if byte < 0x20 && self.accepts_controls() {
            return self.control(byte, buf);
        }

        match self.state {
            ParserState::Ground => self.ground(byte, buf),
            ParserState::Escape => self.escape(byte, buf),
            ParserState::EscapeIntermediate => self.escape_intermediate(byte, buf),
            ParserState::CsiEntry => self.csi_entry(byte, buf),
            ParserState::CsiParam => self.csi_param(byte, buf),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, buf),
            ParserState::OscString => self.osc_string(byte),
            ParserState::EscapeInOsc => self.escape_in_osc(byte, buf),
            ParserState::Iac => self.iac(byte),
            ParserState::IacOption(cmd) => {
                self.state = ParserState::Ground;
                Some(Response::Telnet(vec![cmd, byte]))
            }
            ParserState::IacSub => {
                if byte == IAC {
                    self.state = ParserState::IacSubIac;
                } else if self.sub.len() < MAX_SUBNEGOTIATION {
                    self.sub.push(byte);
                }
                None
            }
            ParserState::IacSubIac => self.iac_sub_iac(byte),
            ParserState::Box => self.box_glyph(byte, buf),
        }
    }

    fn in_telnet(&self) -> bool {
        matches!(
            self.state,
            ParserState::Iac | ParserState::IacOption(_) | ParserState::IacSub | ParserState::IacSubIac
        )
    }

    fn accepts_controls(&self) -> bool {
        !matches!(
            self.state,
            ParserState::OscString
                | ParserState::EscapeInOsc
                | ParserState::Iac
                | ParserState::IacOption(_)
                | ParserState::IacSub
                | ParserState::IacSubIac
                | ParserState::Box
        )
    }

    fn control(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        match byte {
            0x1B => self.enter_escape(),
            0x07 => return Some(Response::Bell),
            0x08 => buf.backspace(),
            0x09 => buf.tab(),
            0x0A..=0x0C => buf.line_feed(),
            0x0D => buf.carriage_return(),
            0x0E => buf.modes.graphic = true,
            0x0F => buf.modes.graphic = false,
            _ => {}
        }
        None
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
        self.seq_len = 0;
    }

    /// Count a sequence byte; false when the sequence ran too long
    fn advance(&mut self) -> bool {
        self.seq_len += 1;
        if self.seq_len > MAX_SEQUENCE {
            tracing::debug!("escape sequence too long, dropped");
            self.state = ParserState::Ground;
            return false;
        }
        true
    }

    fn ground(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if byte == 0xE2 && buf.modes.alternate {
            self.glyph.clear();
            self.state = ParserState::Box;
            return None;
        }
        if buf.modes.graphic && (0x60..=0x7E).contains(&byte) {
            buf.put_glyph(line_drawing(byte));
        } else if byte != 0x7F {
            buf.put_glyph(byte);
        }
        None
    }

    fn box_glyph(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if !is_continuation(byte) {
            self.state = ParserState::Ground;
            buf.put_glyph(0xE2);
            for &b in &self.glyph {
                buf.put_glyph(b);
            }
            return self.feed(byte, buf);
        }
        self.glyph.push(byte);
        if self.glyph.len() < 2 {
            return None;
        }
        self.state = ParserState::Ground;
        match box_ascii(self.glyph[0], self.glyph[1]) {
            Some(ch) => buf.put_glyph(ch),
            None => {
                buf.put_glyph(0xE2);
                buf.put_glyph(self.glyph[0]);
                buf.put_glyph(self.glyph[1]);
            }
        }
        None
    }

    fn escape(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        self.state = ParserState::Ground;
        match byte {
            b'[' => {
                self.state = ParserState::CsiEntry;
            }
            b']' => {
                self.state = ParserState::OscString;
                self.osc.clear();
            }
            // DECSC / DECRC
            b'7' => buf.save_cursor(),
            b'8' => buf.restore_cursor(),
            // IND
            b'D' => buf.index(),
            // NEL
            b'E' => {
                buf.carriage_return();
                buf.index();
            }
            // Cursor to lower left
            b'F' => buf.cursor_home_down(),
            // HTS
            b'H' => buf.set_tab(),
            // RI
            b'M' => buf.reverse_index(),
            // RIS
            b'c' => {
                buf.reset();
                self.reversed = false;
            }
            // DECKPAM / DECKPNM
            b'=' | b'>' => {}
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => tracing::debug!("unknown ESC {:?}", byte as char),
        }
        None
    }

    fn escape_intermediate(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if !self.advance() {
            return None;
        }
        match byte {
            0x20..=0x2F => self.intermediates.push(byte),
            0x30..=0x7E => {
                self.state = ParserState::Ground;
                match (self.intermediates.first(), byte) {
                    (Some(b'('), b'0') => buf.modes.graphic = true,
                    (Some(b'('), _) => buf.modes.graphic = false,
                    (Some(b'#'), b'8') => buf.fill_alignment(),
                    _ => {}
                }
            }
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_entry(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if !self.advance() {
            return None;
        }
        match byte {
            b'0'..=b'9' => {
                self.current_param = Some((byte - b'0') as u16);
                self.state = ParserState::CsiParam;
            }
            b';' => {
                self.params.push(0);
                self.state = ParserState::CsiParam;
            }
            b'?' | b'>' | b'!' | b'=' => self.intermediates.push(byte),
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => return self.execute_csi(byte, buf),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_param(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if !self.advance() {
            return None;
        }
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param.unwrap_or(0).saturating_mul(10).saturating_add(digit),
                );
            }
            b';' | b':' => {
                self.params.push(self.current_param.unwrap_or(0));
                self.current_param = None;
            }
            0x20..=0x2F => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                return self.execute_csi(byte, buf);
            }
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_intermediate(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        if !self.advance() {
            return None;
        }
        match byte {
            0x20..=0x2F => self.intermediates.push(byte),
            0x40..=0x7E => return self.execute_csi(byte, buf),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn osc_string(&mut self, byte: u8) -> Option<Response> {
        match byte {
            0x07 | 0x9C => {
                self.state = ParserState::Ground;
                self.execute_osc()
            }
            0x1B => {
                self.state = ParserState::EscapeInOsc;
                None
            }
            _ => {
                if self.osc.len() < MAX_TITLE + 4 {
                    self.osc.push(byte);
                }
                None
            }
        }
    }

    fn escape_in_osc(&mut self, byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        let title = self.execute_osc();
        if byte == b'\\' {
            self.state = ParserState::Ground;
        } else {
            // Not ST: the ESC starts a new sequence
            self.enter_escape();
            self.escape(byte, buf);
        }
        title
    }

    fn execute_osc(&mut self) -> Option<Response> {
        let text = String::from_utf8_lossy(&self.osc).into_owned();
        let (code, title) = text.split_once(';')?;
        match code {
            "0" | "1" | "2" => {
                let title: String = title.chars().filter(|c| !c.is_control()).collect();
                let mut end = title.len().min(MAX_TITLE);
                while !title.is_char_boundary(end) {
                    end -= 1;
                }
                Some(Response::Title(title[..end].to_string()))
            }
            _ => None,
        }
    }

    fn iac(&mut self, byte: u8) -> Option<Response> {
        self.state = match byte {
            WILL | WONT | DO | DONT => ParserState::IacOption(byte),
            SB => {
                self.sub.clear();
                ParserState::IacSub
            }
            _ => ParserState::Ground,
        };
        None
    }

    fn iac_sub_iac(&mut self, byte: u8) -> Option<Response> {
        match byte {
            SE => {
                self.state = ParserState::Ground;
                let mut cmd = Vec::with_capacity(self.sub.len() + 1);
                cmd.push(SB);
                cmd.append(&mut self.sub);
                Some(Response::Telnet(cmd))
            }
            IAC => {
                if self.sub.len() < MAX_SUBNEGOTIATION {
                    self.sub.push(IAC);
                }
                self.state = ParserState::IacSub;
                None
            }
            _ => {
                self.state = ParserState::Ground;
                None
            }
        }
    }

    fn execute_csi(&mut self, final_byte: u8, buf: &mut ScreenBuffer) -> Option<Response> {
        self.state = ParserState::Ground;
        let is_private = self.intermediates.contains(&b'?');
        let is_gt = self.intermediates.contains(&b'>');
        let params = std::mem::take(&mut self.params);
        // Count parameters default to 1, and 0 means 1 as well
        let n = params.first().copied().unwrap_or(1).max(1);
        let p0 = params.first().copied().unwrap_or(0);

        let response = match (is_private, is_gt, final_byte) {
            (false, false, b'A') => {
                buf.cursor_up(n);
                None
            }
            (false, false, b'B') | (false, false, b'e') => {
                buf.cursor_down(n);
                None
            }
            (false, false, b'C') | (false, false, b'a') => {
                buf.cursor_forward(n);
                None
            }
            (false, false, b'D') => {
                buf.cursor_backward(n);
                None
            }
            // CNL / CPL
            (false, false, b'E') => {
                buf.cursor_down(n);
                buf.carriage_return();
                None
            }
            (false, false, b'F') => {
                buf.cursor_up(n);
                buf.carriage_return();
                None
            }
            (false, false, b'G') | (false, false, b'`') => {
                buf.set_column(n);
                None
            }
            (false, false, b'H') | (false, false, b'f') => {
                let row = params.first().copied().unwrap_or(1);
                let col = params.get(1).copied().unwrap_or(1);
                buf.cursor_position_set(row, col);
                None
            }
            (false, false, b'd') => {
                buf.set_row(n);
                None
            }
            (false, false, b'J') => {
                buf.clear_screen(p0);
                None
            }
            (false, false, b'K') => {
                buf.erase_line(p0);
                None
            }
            (false, false, b'L') => {
                buf.insert_lines(n);
                None
            }
            (false, false, b'M') => {
                buf.delete_lines(n);
                None
            }
            (false, false, b'@') => {
                buf.insert_chars(n);
                None
            }
            (false, false, b'P') => {
                buf.delete_chars(n);
                None
            }
            (false, false, b'X') => {
                buf.erase_chars(n);
                None
            }
            (false, false, b'S') => {
                let within = buf.modes.alternate || buf.margins().is_some();
                buf.scroll_up(n, within);
                None
            }
            (false, false, b'T') => {
                buf.scroll_down(n);
                None
            }
            (false, false, b'r') => {
                let top = params.first().copied().unwrap_or(1);
                let bottom = params
                    .get(1)
                    .copied()
                    .filter(|&b| b > 0)
                    .unwrap_or(buf.rows() as u16);
                buf.set_margins(top, bottom);
                None
            }
            (false, false, b'm') => {
                self.execute_sgr(&params, buf);
                None
            }
            (false, false, b's') => {
                buf.save_cursor();
                None
            }
            (false, false, b'u') => {
                buf.restore_cursor();
                None
            }
            (false, false, b'g') => {
                buf.clear_tab(p0);
                None
            }
            (false, false, b'n') => match p0 {
                5 => Some(Response::DeviceStatus),
                6 => {
                    let (row, col) = buf.cursor_position();
                    let col = col.min(buf.cols() - 1);
                    Some(Response::CursorPosition(row as u16 + 1, col as u16 + 1))
                }
                _ => None,
            },
            (false, false, b'c') => Some(Response::DeviceAttributes),
            (false, true, b'c') => Some(Response::SecondaryDeviceAttributes),
            (true, false, b'h') => {
                for &p in &params {
                    self.set_private_mode(p, true, buf);
                }
                None
            }
            (true, false, b'l') => {
                for &p in &params {
                    self.set_private_mode(p, false, buf);
                }
                None
            }
            (false, false, b'h') | (false, false, b'l') => {
                let on = final_byte == b'h';
                for &p in &params {
                    match p {
                        4 => buf.modes.insert = on,
                        20 => buf.modes.newline = on,
                        _ => {}
                    }
                }
                None
            }
            _ => {
                tracing::debug!(
                    "unknown CSI: intermediates={:?}, params={:?}, final={:?}",
                    self.intermediates,
                    params,
                    final_byte as char
                );
                None
            }
        };
        self.params = params;
        response
    }

    fn set_private_mode(&mut self, mode: u16, on: bool, buf: &mut ScreenBuffer) {
        match mode {
            1 => buf.modes.app_cursor = on,
            3 => {
                let rows = buf.rows() as u16;
                buf.resize(if on { 132 } else { 80 }, rows);
                buf.clear_screen(2);
            }
            6 => {
                buf.modes.origin = on;
                buf.cursor_position_set(1, 1);
            }
            7 => buf.modes.autowrap = on,
            25 => buf.modes.cursor_visible = on,
            47 | 1047 | 1049 => {
                if on {
                    buf.enter_alternate();
                } else {
                    buf.leave_alternate();
                }
            }
            2004 => buf.modes.bracketed_paste = on,
            _ => tracing::debug!("unhandled private mode {} = {}", mode, on),
        }
    }

    fn execute_sgr(&mut self, params: &[u16], buf: &mut ScreenBuffer) {
        if params.is_empty() {
            buf.current_attr = DEFAULT_ATTR;
            self.reversed = false;
            return;
        }
        let mut iter = params.iter().copied();
        while let Some(param) = iter.next() {
            let attr = buf.current_attr;
            let (fg, bg) = (attr & 0x0F, attr >> 4);
            buf.current_attr = match param {
                0 => {
                    self.reversed = false;
                    DEFAULT_ATTR
                }
                1 => attr | 0x08,
                22 => attr & !0x08,
                7 if !self.reversed => {
                    self.reversed = true;
                    (fg << 4) | bg
                }
                27 if self.reversed => {
                    self.reversed = false;
                    (fg << 4) | bg
                }
                30..=37 => (bg << 4) | (fg & 0x08) | (param - 30) as u8,
                39 => (bg << 4) | 0x07,
                40..=47 => (((param - 40) as u8) << 4) | fg,
                49 => fg,
                90..=97 => (bg << 4) | (8 + (param - 90) as u8),
                100..=107 => ((8 + (param - 100) as u8) << 4) | fg,
                38 | 48 => match iter.next() {
                    Some(5) => match iter.next() {
                        Some(n) if n < 16 && param == 38 => (bg << 4) | n as u8,
                        Some(n) if n < 16 => ((n as u8) << 4) | fg,
                        _ => attr,
                    },
                    Some(2) => {
                        iter.next();
                        iter.next();
                        iter.next();
                        attr
                    }
                    _ => attr,
                },
                _ => attr,
            };
        }
    }
}

/// DEC special graphics approximated with ASCII
fn line_drawing(byte: u8) -> u8 {
    match byte {
        b'j' | b'k' | b'l' | b'm' | b'n' | b't' | b'u' | b'v' | b'w' => b'+',
        b'q' => b'-',
        b'x' => b'|',
        b'`' => b'*',
        b'a' => b'#',
        b'~' => b'.',
        _ => byte,
    }
}

/// ASCII stand-in for a U+2500..U+257F box-drawing glyph given its last two
/// UTF-8 bytes
fn box_ascii(b1: u8, b2: u8) -> Option<u8> {
    if !(0x94..=0x95).contains(&b1) {
        return None;
    }
    let cp = 0x2500 + (u32::from(b1 - 0x94) << 6) + u32::from(b2 & 0x3F);
    let ch = match cp {
        0x2500 | 0x2501 | 0x2504 | 0x2505 | 0x2508 | 0x2509 | 0x254C | 0x254D | 0x2550 => b'-',
        0x2502 | 0x2503 | 0x2506 | 0x2507 | 0x250A | 0x250B | 0x254E | 0x254F | 0x2551 => b'|',
        0x2571 => b'/',
        0x2572 => b'\\',
        0x2573 => b'X',
        0x2574..=0x257F => {
            if cp % 2 == 0 {
                b'-'
            } else {
                b'|'
            }
        }
        _ => b'+',
    };
    Some(ch)
}
