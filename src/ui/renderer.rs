//! Terminal renderer using crossterm
//!
//! Draws the visible rows of a [`ScreenBuffer`] to the console.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute, queue,
    style::{
        Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor,
        SetForegroundColor,
    },
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use unicode_width::UnicodeWidthChar;

use crate::core::term::buffer::{bg, fg, is_continuation, ScreenBuffer, DEFAULT_ATTR};

/// A run of glyphs sharing one attribute
#[derive(Clone, Debug, PartialEq)]
pub struct Run {
    pub text: String,
    pub attr: u8,
    pub selected: bool,
}

/// Split one buffer row into attribute runs, clipped to `cols` columns
pub fn compose_row(buf: &ScreenBuffer, row: usize, cols: usize) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    let Some((text, attrs)) = buf.row(row) else {
        return runs;
    };
    let base = buf.line_start(row);
    let (sel_left, sel_right) = buf.normalized_selection();
    let mut width = 0;
    let mut i = 0;
    while i < text.len() {
        let mut end = i + 1;
        while end < text.len() && is_continuation(text[end]) {
            end += 1;
        }
        let glyph = match std::str::from_utf8(&text[i..end]) {
            Ok(s) if !s.starts_with(|c: char| c.is_control()) => s,
            _ => "?",
        };
        let w = glyph.chars().next().and_then(|c| c.width()).unwrap_or(1).max(1);
        if width + w > cols {
            break;
        }
        width += w;

        let offset = base + i;
        let selected = offset >= sel_left && offset < sel_right;
        let attr = attrs[i];
        match runs.last_mut() {
            Some(run) if run.attr == attr && run.selected == selected => run.text.push_str(glyph),
            _ => runs.push(Run { text: glyph.to_string(), attr, selected }),
        }
        i = end;
    }
    runs
}

/// Map a packed colour nibble to a console colour
fn color(nibble: u8) -> Color {
    match nibble & 0x0F {
        0 => Color::Black,
        1 => Color::DarkRed,
        2 => Color::DarkGreen,
        3 => Color::DarkYellow,
        4 => Color::DarkBlue,
        5 => Color::DarkMagenta,
        6 => Color::DarkCyan,
        7 => Color::Grey,
        8 => Color::DarkGrey,
        9 => Color::Red,
        10 => Color::Green,
        11 => Color::Yellow,
        12 => Color::Blue,
        13 => Color::Magenta,
        14 => Color::Cyan,
        _ => Color::White,
    }
}

/// Terminal renderer
pub struct Renderer {
    /// Whether the terminal has been initialized
    initialized: bool,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self { initialized: false }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the console
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            DisableBracketedPaste,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();
        terminal::disable_raw_mode()?;
        println!();
        Ok(())
    }

    /// Draw the view. `status` replaces the bottom row when set (command
    /// prompt or notices); the cursor then sits at its end.
    pub fn render(&mut self, buf: &ScreenBuffer, status: Option<&str>) -> io::Result<()> {
        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(65536, stdout.lock());

        // synchronized update
        write!(stdout, "\x1b[?2026h")?;
        queue!(stdout, Hide)?;

        let cols = buf.cols();
        let rows = buf.rows();
        let drawn = if status.is_some() { rows.saturating_sub(1) } else { rows };
        for screen_row in 0..drawn {
            queue!(stdout, MoveTo(0, screen_row as u16), ResetColor, SetAttribute(Attribute::Reset))?;
            write!(stdout, "\x1b[K")?;
            for run in compose_row(buf, buf.view_row() + screen_row, cols) {
                self.apply_attr(&mut stdout, run.attr, run.selected)?;
                queue!(stdout, Print(&run.text))?;
            }
        }

        let scrolled = buf.screen_top() - buf.view_row().min(buf.screen_top());
        if scrolled > 0 {
            queue!(stdout, MoveTo(0, 0))?;
            self.apply_attr(&mut stdout, DEFAULT_ATTR, true)?;
            queue!(stdout, Print(format!("[history -{}]", scrolled)))?;
        }
        queue!(stdout, ResetColor, SetAttribute(Attribute::Reset))?;

        match status {
            Some(line) => {
                let row = rows.saturating_sub(1) as u16;
                let shown: String = line.chars().take(cols.saturating_sub(1)).collect();
                queue!(stdout, MoveTo(0, row), Print(&shown))?;
                write!(stdout, "\x1b[K")?;
                queue!(stdout, MoveTo(shown.chars().count() as u16, row), Show)?;
            }
            None if buf.modes.cursor_visible && scrolled == 0 => {
                let (row, col) = buf.cursor_position();
                let col = col.min(cols.saturating_sub(1));
                queue!(stdout, MoveTo(col as u16, row as u16), Show)?;
            }
            None => {}
        }

        write!(stdout, "\x1b[?2026l")?;
        stdout.flush()
    }

    /// Apply a packed attribute; selection shows reversed
    fn apply_attr<W: Write>(&self, stdout: &mut W, attr: u8, selected: bool) -> io::Result<()> {
        queue!(stdout, SetAttribute(Attribute::Reset))?;
        if selected {
            queue!(stdout, SetAttribute(Attribute::Reverse))?;
        }
        if attr == DEFAULT_ATTR {
            return queue!(stdout, ResetColor);
        }
        queue!(
            stdout,
            SetForegroundColor(color(fg(attr))),
            SetBackgroundColor(color(bg(attr)))
        )
    }

    /// Get terminal size
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_split_on_attribute() {
        let mut buf = ScreenBuffer::new(20, 5);
        buf.append(b"ab");
        buf.current_attr = 0x0A;
        buf.append(b"cd");
        let runs = compose_row(&buf, 0, 20);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].text, "ab");
        assert_eq!(runs[1], Run { text: "cd".into(), attr: 0x0A, selected: false });
    }

    #[test]
    fn test_wide_glyphs_are_clipped() {
        let mut buf = ScreenBuffer::new(10, 5);
        buf.append("a漢字".as_bytes());
        let runs = compose_row(&buf, 0, 4);
        assert_eq!(runs[0].text, "a漢");
    }

    #[test]
    fn test_selection_marks_run() {
        let mut buf = ScreenBuffer::new(20, 5);
        buf.append(b"hello world");
        buf.set_selection(6, 11);
        let runs = compose_row(&buf, 0, 20);
        assert_eq!(runs[0].text, "hello ");
        assert!(runs[1].selected);
        assert_eq!(runs[1].text, "world");
    }

    #[test]
    fn test_missing_row_is_empty() {
        let buf = ScreenBuffer::new(20, 5);
        assert!(compose_row(&buf, 100, 20).is_empty());
    }

    #[test]
    fn test_colour_nibbles() {
        assert_eq!(color(fg(0x0A)), Color::Green);
        assert_eq!(color(bg(0x47)), Color::DarkBlue);
    }
}
