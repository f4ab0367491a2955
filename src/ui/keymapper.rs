//! Key mapping for terminal input
//!
//! Turns crossterm key events into the bytes a remote host expects, and
//! picks out the handful of keys the client keeps for itself.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::core::term::buffer::Modes;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// Keys handled by the client instead of being sent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalAction {
    /// Ctrl+]
    CommandPrompt,
    /// Ctrl+Q
    Quit,
    /// Shift+PageUp / Shift+PageDown
    ScrollPage(isize),
    /// Shift+Up / Shift+Down
    ScrollLine(isize),
}

/// Classify a key the client keeps for itself
pub fn local_action(event: &KeyEvent) -> Option<LocalAction> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let mods = Modifiers::from(event.modifiers);
    match (event.code, mods) {
        // unix consoles report Ctrl+] as Ctrl+5
        (KeyCode::Char(']') | KeyCode::Char('5'), Modifiers::CTRL) => {
            Some(LocalAction::CommandPrompt)
        }
        (KeyCode::Char('q') | KeyCode::Char('Q'), Modifiers::CTRL) => Some(LocalAction::Quit),
        (KeyCode::PageUp, Modifiers::SHIFT) => Some(LocalAction::ScrollPage(-1)),
        (KeyCode::PageDown, Modifiers::SHIFT) => Some(LocalAction::ScrollPage(1)),
        (KeyCode::Up, Modifiers::SHIFT) => Some(LocalAction::ScrollLine(-1)),
        (KeyCode::Down, Modifiers::SHIFT) => Some(LocalAction::ScrollLine(1)),
        _ => None,
    }
}

/// Map a key event to bytes for the host
pub fn map_key(event: &KeyEvent, modes: &Modes) -> Option<Vec<u8>> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let mods = Modifiers::from(event.modifiers);

    match event.code {
        KeyCode::Char(ch) => Some(map_char(ch, mods)),
        KeyCode::Enter if modes.newline => Some(b"\r\n".to_vec()),
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Backspace if mods.contains(Modifiers::ALT) => Some(vec![0x1B, 0x7F]),
        KeyCode::Backspace => Some(vec![0x7F]),
        KeyCode::Tab if mods.contains(Modifiers::SHIFT) => Some(b"\x1b[Z".to_vec()),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
        KeyCode::Esc => Some(vec![0x1B]),

        KeyCode::Up => Some(cursor_key(b'A', mods, modes)),
        KeyCode::Down => Some(cursor_key(b'B', mods, modes)),
        KeyCode::Right => Some(cursor_key(b'C', mods, modes)),
        KeyCode::Left => Some(cursor_key(b'D', mods, modes)),
        KeyCode::Home => Some(cursor_key(b'H', mods, modes)),
        KeyCode::End => Some(cursor_key(b'F', mods, modes)),

        KeyCode::Insert => Some(tilde_key(2, mods)),
        KeyCode::Delete => Some(tilde_key(3, mods)),
        KeyCode::PageUp => Some(tilde_key(5, mods)),
        KeyCode::PageDown => Some(tilde_key(6, mods)),

        KeyCode::F(n) => function_key(n, mods),
        _ => None,
    }
}

/// Wrap pasted text in bracketed-paste markers when the host asked for them
pub fn paste(text: &str, modes: &Modes) -> Vec<u8> {
    let body = text.replace("\r\n", "\r").replace('\n', "\r");
    if modes.bracketed_paste {
        format!("\x1b[200~{}\x1b[201~", body).into_bytes()
    } else {
        body.into_bytes()
    }
}

fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
    let ctrl = mods.contains(Modifiers::CTRL);
    let alt = mods.contains(Modifiers::ALT);
    if ctrl {
        let code = if ch.is_ascii_alphabetic() {
            Some(ch.to_ascii_lowercase() as u8 - b'a' + 1)
        } else {
            match ch {
                '@' | '`' | ' ' | '2' => Some(0x00),
                '[' | '3' => Some(0x1B),
                '\\' | '4' => Some(0x1C),
                ']' | '5' => Some(0x1D),
                '^' | '~' | '6' => Some(0x1E),
                '_' | '?' | '7' => Some(0x1F),
                _ => None,
            }
        };
        if let Some(code) = code {
            return if alt { vec![0x1B, code] } else { vec![code] };
        }
    }

    let mut bytes = Vec::with_capacity(5);
    if alt {
        bytes.push(0x1B);
    }
    let mut utf8 = [0u8; 4];
    bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
    bytes
}

/// Arrows, Home and End: `ESC O x` in application-cursor mode
fn cursor_key(key: u8, mods: Modifiers, modes: &Modes) -> Vec<u8> {
    if !mods.is_empty() {
        format!("\x1b[1;{}{}", modifier_code(mods), key as char).into_bytes()
    } else if modes.app_cursor {
        vec![0x1B, b'O', key]
    } else {
        vec![0x1B, b'[', key]
    }
}

fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        format!("\x1b[{}~", code).into_bytes()
    } else {
        format!("\x1b[{};{}~", code, modifier_code(mods)).into_bytes()
    }
}

fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
    let code = match n {
        1..=4 => {
            let key = b"PQRS"[(n - 1) as usize];
            return Some(if mods.is_empty() {
                vec![0x1B, b'O', key]
            } else {
                format!("\x1b[1;{}{}", modifier_code(mods), key as char).into_bytes()
            });
        }
        5 => 15,
        6..=10 => n + 11,
        11 | 12 => n + 12,
        _ => return None,
    };
    Some(tilde_key(code, mods))
}

/// xterm modifier parameter
fn modifier_code(mods: Modifiers) -> u8 {
    1 + if mods.contains(Modifiers::SHIFT) { 1 } else { 0 }
        + if mods.contains(Modifiers::ALT) { 2 } else { 0 }
        + if mods.contains(Modifiers::CTRL) { 4 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    #[test]
    fn test_char_keys() {
        let modes = Modes::default();
        assert_eq!(map_key(&key(KeyCode::Char('a'), KeyModifiers::NONE), &modes), Some(b"a".to_vec()));
        assert_eq!(map_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL), &modes), Some(vec![0x03]));
        assert_eq!(map_key(&key(KeyCode::Char('x'), KeyModifiers::ALT), &modes), Some(vec![0x1B, b'x']));
        assert_eq!(
            map_key(&key(KeyCode::Char('é'), KeyModifiers::NONE), &modes),
            Some("é".as_bytes().to_vec())
        );
    }

    #[test]
    fn test_cursor_keys_follow_mode() {
        let mut modes = Modes::default();
        let up = key(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(map_key(&up, &modes), Some(b"\x1b[A".to_vec()));
        modes.app_cursor = true;
        assert_eq!(map_key(&up, &modes), Some(b"\x1bOA".to_vec()));
        assert_eq!(
            map_key(&key(KeyCode::Up, KeyModifiers::CONTROL), &modes),
            Some(b"\x1b[1;5A".to_vec())
        );
    }

    #[test]
    fn test_enter_in_newline_mode() {
        let mut modes = Modes::default();
        let enter = key(KeyCode::Enter, KeyModifiers::NONE);
        assert_eq!(map_key(&enter, &modes), Some(b"\r".to_vec()));
        modes.newline = true;
        assert_eq!(map_key(&enter, &modes), Some(b"\r\n".to_vec()));
    }

    #[test]
    fn test_function_keys() {
        let modes = Modes::default();
        assert_eq!(map_key(&key(KeyCode::F(1), KeyModifiers::NONE), &modes), Some(b"\x1bOP".to_vec()));
        assert_eq!(map_key(&key(KeyCode::F(5), KeyModifiers::NONE), &modes), Some(b"\x1b[15~".to_vec()));
        assert_eq!(map_key(&key(KeyCode::F(10), KeyModifiers::NONE), &modes), Some(b"\x1b[21~".to_vec()));
        assert_eq!(map_key(&key(KeyCode::F(12), KeyModifiers::SHIFT), &modes), Some(b"\x1b[24;2~".to_vec()));
        assert_eq!(map_key(&key(KeyCode::F(13), KeyModifiers::NONE), &modes), None);
    }

    #[test]
    fn test_local_actions() {
        assert_eq!(
            local_action(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            Some(LocalAction::CommandPrompt)
        );
        assert_eq!(local_action(&key(KeyCode::Char('q'), KeyModifiers::CONTROL)), Some(LocalAction::Quit));
        assert_eq!(
            local_action(&key(KeyCode::PageUp, KeyModifiers::SHIFT)),
            Some(LocalAction::ScrollPage(-1))
        );
        assert_eq!(local_action(&key(KeyCode::PageUp, KeyModifiers::NONE)), None);
    }

    #[test]
    fn test_bracketed_paste() {
        let mut modes = Modes::default();
        assert_eq!(paste("a\nb", &modes), b"a\rb".to_vec());
        modes.bracketed_paste = true;
        assert_eq!(paste("x", &modes), b"\x1b[200~x\x1b[201~".to_vec());
    }
}
