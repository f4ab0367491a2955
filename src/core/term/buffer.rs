//! Screen buffer
//!
//! Flat attributed byte storage with a line-start table. Row `r` occupies
//! `text[line[r]..line[r + 1]]`; the table always carries one trailing entry
//! holding the end of content, so `line.len() == line_count + 1`.
//!
//! Multi-byte UTF-8 glyphs are opaque: continuation bytes (`10xxxxxx`) belong
//! to the glyph that precedes them and never count as a column.

use tracing::{debug, warn};

/// Default attribute: white on black, not bright
pub const DEFAULT_ATTR: u8 = 0x07;
/// Initial row capacity
pub const DEFAULT_ROWS: usize = 4096;
/// Row ceiling; beyond this the buffer compacts instead of growing
pub const MAX_ROWS: usize = 65536;
/// Byte budget per row used to size the text storage
pub const BYTES_PER_ROW: usize = 64;
/// Byte ceiling paired with `MAX_ROWS`
pub const MAX_BYTES: usize = MAX_ROWS * BYTES_PER_ROW;
/// Continuation bytes allowed after one lead byte
const MAX_CONTINUATION: usize = 3;
/// Columns covered by the tab-stop table
pub const TAB_COLUMNS: usize = 256;

/// True for UTF-8 continuation bytes
#[inline]
pub fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Foreground nibble of a packed attribute (bit 3 is the bright flag)
#[inline]
pub fn fg(attr: u8) -> u8 {
    attr & 0x0F
}

/// Background nibble of a packed attribute
#[inline]
pub fn bg(attr: u8) -> u8 {
    attr >> 4
}

/// Terminal modes
#[derive(Clone, Debug)]
pub struct Modes {
    pub insert: bool,
    /// DEC special graphics (line drawing) selected
    pub graphic: bool,
    pub alternate: bool,
    pub app_cursor: bool,
    pub origin: bool,
    pub autowrap: bool,
    pub bracketed_paste: bool,
    pub cursor_visible: bool,
    /// LNM: line feed also returns the carriage
    pub newline: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            insert: false,
            graphic: false,
            alternate: false,
            app_cursor: false,
            origin: false,
            autowrap: true,
            bracketed_paste: false,
            cursor_visible: true,
            newline: false,
        }
    }
}

/// Saved cursor: row relative to the screen top, column, attribute
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SavedCursor {
    pub row: usize,
    pub col: usize,
    pub attr: u8,
}

/// State stashed while the alternate screen is active
#[derive(Clone, Copy, Debug)]
struct AltStash {
    line_count: usize,
    screen_top: usize,
}

/// Growable scrollback buffer
pub struct ScreenBuffer {
    pub(super) text: Vec<u8>,
    pub(super) attr: Vec<u8>,
    pub(super) line: Vec<usize>,
    byte_capacity: usize,
    row_capacity: usize,
    pub(super) cursor: usize,
    pub(super) cursor_row: usize,
    /// First row of the addressable screen
    pub(super) screen_top: usize,
    /// Topmost displayed row
    pub(super) view_row: usize,
    pub(super) recv_mark: usize,
    pub(super) sel_left: usize,
    pub(super) sel_right: usize,
    pub(super) cols: usize,
    pub(super) rows: usize,
    pub modes: Modes,
    pub current_attr: u8,
    tabs: Vec<bool>,
    /// Scroll margins relative to the screen top, inclusive
    margins: Option<(usize, usize)>,
    saved: Option<SavedCursor>,
    alt: Option<AltStash>,
    /// Set when a CR performed a soft wrap, so the LF that follows is absorbed
    cr_wrapped: bool,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        let byte_capacity = DEFAULT_ROWS * BYTES_PER_ROW;
        let mut text = Vec::new();
        let mut attr = Vec::new();
        // An allocation failure here just leaves the Vecs to grow on demand.
        let _ = text.try_reserve(byte_capacity);
        let _ = attr.try_reserve(byte_capacity);
        Self {
            text,
            attr,
            line: vec![0, 0],
            byte_capacity,
            row_capacity: DEFAULT_ROWS,
            cursor: 0,
            cursor_row: 0,
            screen_top: 0,
            view_row: 0,
            recv_mark: 0,
            sel_left: 0,
            sel_right: 0,
            cols: usize::from(cols.max(1)),
            rows: usize::from(rows.max(1)),
            modes: Modes::default(),
            current_attr: DEFAULT_ATTR,
            tabs: default_tabs(),
            margins: None,
            saved: None,
            alt: None,
            cr_wrapped: false,
        }
    }

    // ---- accessors ------------------------------------------------------

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn cursor_row(&self) -> usize {
        self.cursor_row
    }

    pub fn line_count(&self) -> usize {
        self.line.len() - 1
    }

    pub fn screen_top(&self) -> usize {
        self.screen_top
    }

    pub fn view_row(&self) -> usize {
        self.view_row
    }

    pub fn capacity(&self) -> usize {
        self.byte_capacity
    }

    pub fn row_capacity(&self) -> usize {
        self.row_capacity
    }

    /// End of content
    pub fn end(&self) -> usize {
        self.line[self.line_count()]
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn attrs(&self) -> &[u8] {
        &self.attr
    }

    /// Start offset of a row
    pub fn line_start(&self, row: usize) -> usize {
        self.line[row.min(self.line_count())]
    }

    /// Bytes and attributes of a row
    pub fn row(&self, row: usize) -> Option<(&[u8], &[u8])> {
        if row >= self.line_count() {
            return None;
        }
        let (s, e) = (self.line[row], self.line[row + 1]);
        Some((&self.text[s..e], &self.attr[s..e]))
    }

    /// Cursor position as (row relative to screen top, column)
    pub fn cursor_position(&self) -> (usize, usize) {
        (self.cursor_row - self.screen_top, self.cursor_col())
    }

    /// Column of the cursor, counting lead bytes only
    pub fn cursor_col(&self) -> usize {
        columns(&self.text[self.line[self.cursor_row]..self.cursor])
    }

    pub fn recv_mark(&self) -> usize {
        self.recv_mark
    }

    /// Mark the end of content as the start of the next command's output
    pub fn set_recv_mark(&mut self) {
        self.recv_mark = self.end();
    }

    /// Everything received since the mark
    pub fn received_text(&self) -> &[u8] {
        &self.text[self.recv_mark.min(self.end())..self.end()]
    }

    pub fn saved_cursor(&self) -> Option<SavedCursor> {
        self.saved
    }

    /// Row containing an offset (the last row when rows share a start)
    pub fn row_of(&self, offset: usize) -> usize {
        let idx = self.line[..self.line_count()].partition_point(|&s| s <= offset);
        idx.saturating_sub(1)
    }

    // ---- storage management ---------------------------------------------

    /// Make room for `extra` more bytes; clears the buffer if allocation fails
    fn grow_bytes(&mut self, extra: usize) -> bool {
        let need = self.end() + extra;
        if need < self.byte_capacity && self.text.capacity() >= need {
            return true;
        }
        while need >= self.byte_capacity {
            self.byte_capacity *= 2;
        }
        let want = self.byte_capacity - self.text.len();
        if self.text.try_reserve(want).is_err() || self.attr.try_reserve(want).is_err() {
            warn!("screen buffer allocation of {} bytes failed, clearing", self.byte_capacity);
            self.byte_capacity = DEFAULT_ROWS * BYTES_PER_ROW;
            self.clear();
            return false;
        }
        true
    }

    /// Append an empty row at the end; returns how many rows were discarded
    fn append_row(&mut self) -> usize {
        let mut shift = 0;
        if self.line.len() + 1 >= self.row_capacity || self.end() >= MAX_BYTES {
            if self.row_capacity < MAX_ROWS && self.end() < MAX_BYTES {
                self.row_capacity *= 2;
                debug!("screen buffer grown to {} rows", self.row_capacity);
            } else {
                shift = self.compact();
                if shift == 0 && self.line.len() + 1 >= self.row_capacity {
                    self.row_capacity = self.line.len() + 2;
                }
            }
        }
        let end = self.end();
        self.line.push(end);
        self.track_screen();
        shift
    }

    /// Discard the oldest half of the rows and shift every offset
    fn compact(&mut self) -> usize {
        let mut k = (self.line_count() / 2).min(self.screen_top).min(self.cursor_row);
        if let Some(alt) = self.alt {
            k = k.min(alt.screen_top);
        }
        if k == 0 {
            return 0;
        }
        let d = self.line[k];
        self.text.drain(..d);
        self.attr.drain(..d);
        self.line.drain(..k);
        for s in &mut self.line {
            *s -= d;
        }
        self.cursor -= d;
        self.cursor_row -= k;
        self.screen_top -= k;
        self.view_row = self.view_row.saturating_sub(k);
        self.recv_mark = self.recv_mark.saturating_sub(d);
        self.sel_left = self.sel_left.saturating_sub(d);
        self.sel_right = self.sel_right.saturating_sub(d);
        if let Some(alt) = &mut self.alt {
            alt.line_count -= k;
            alt.screen_top -= k;
        }
        debug!("screen buffer compacted: dropped {} rows, {} bytes", k, d);
        k
    }

    /// Replace `remove` bytes at `at` (inside `row`) with `insert`
    fn splice(&mut self, row: usize, at: usize, remove: usize, insert: &[u8], attr: u8) -> bool {
        debug_assert!(at + remove <= self.line[row + 1]);
        if insert.len() > remove && !self.grow_bytes(insert.len() - remove) {
            return false;
        }
        self.text.splice(at..at + remove, insert.iter().copied());
        self.attr
            .splice(at..at + remove, std::iter::repeat(attr).take(insert.len()));
        let add = insert.len();
        for s in &mut self.line[row + 1..] {
            *s = *s - remove + add;
        }
        let shift = |o: usize| -> usize {
            if o > at && o >= at + remove {
                o - remove + add
            } else if o > at {
                at
            } else {
                o
            }
        };
        self.cursor = shift(self.cursor);
        self.recv_mark = shift(self.recv_mark);
        self.sel_left = shift(self.sel_left);
        self.sel_right = shift(self.sel_right);
        true
    }

    /// Ensure row exists; returns its index after any compaction
    fn ensure_row(&mut self, mut row: usize) -> usize {
        while self.line_count() <= row {
            row -= self.append_row();
        }
        row
    }

    fn insert_row(&mut self, row: usize) {
        let start = self.line[row];
        self.line.insert(row, start);
    }

    fn remove_row(&mut self, row: usize) {
        let (s, e) = (self.line[row], self.line[row + 1]);
        if self.splice(row, s, e - s, &[], DEFAULT_ATTR) {
            self.line.remove(row);
        }
    }

    fn empty_row(&mut self, row: usize) {
        let (s, e) = (self.line[row], self.line[row + 1]);
        self.splice(row, s, e - s, &[], DEFAULT_ATTR);
    }

    /// Keep the screen over the tail of the buffer and the view following it
    fn track_screen(&mut self) {
        let following = self.view_row >= self.screen_top;
        let min_top = self.line_count().saturating_sub(self.rows);
        if self.screen_top < min_top {
            self.screen_top = min_top;
        }
        if following || self.view_row > self.screen_top {
            self.view_row = self.screen_top;
        }
    }

    /// Byte length of the glyph at `offset` within the cursor row
    fn glyph_len_at(&self, offset: usize) -> usize {
        let end = self.line[self.cursor_row + 1];
        if offset >= end {
            return 0;
        }
        let mut o = offset + 1;
        while o < end && is_continuation(self.text[o]) {
            o += 1;
        }
        o - offset
    }

    /// Offset of glyph `col` in `row`, or the row end if the row is shorter
    fn offset_at(&self, row: usize, col: usize) -> usize {
        let (mut o, end) = (self.line[row], self.line[row + 1]);
        let mut c = 0;
        while o < end && c < col {
            o += 1;
            while o < end && is_continuation(self.text[o]) {
                o += 1;
            }
            c += 1;
        }
        o
    }

    /// Place the cursor at (absolute row, column), padding the row with spaces
    fn move_to_abs(&mut self, row: usize, col: usize) {
        let row = self.ensure_row(row);
        self.cursor_row = row;
        let o = self.offset_at(row, col);
        let have = columns(&self.text[self.line[row]..o]);
        if have < col {
            let pad = vec![b' '; col - have];
            if !self.splice(row, o, 0, &pad, DEFAULT_ATTR) {
                return;
            }
            self.cursor = o + pad.len();
        } else {
            self.cursor = o;
        }
        self.cr_wrapped = false;
    }

    fn margins_abs(&self) -> (usize, usize) {
        let (t, b) = self.margins.unwrap_or((0, self.rows - 1));
        (self.screen_top + t, self.screen_top + b)
    }

    /// Drop glyphs beyond the column width from a row
    fn trim_row(&mut self, row: usize) {
        let cut = self.offset_at(row, self.cols);
        let end = self.line[row + 1];
        if cut < end {
            self.splice(row, cut, end - cut, &[], DEFAULT_ATTR);
        }
    }

    // ---- glyph output -----------------------------------------------------

    /// Write one byte at the cursor, honouring insert mode and autowrap
    pub fn put_glyph(&mut self, b: u8) {
        let attr = self.current_attr;
        if is_continuation(b) {
            let start = self.line[self.cursor_row];
            let run = self.text[start..self.cursor]
                .iter()
                .rev()
                .take_while(|&&c| is_continuation(c))
                .count();
            if run >= MAX_CONTINUATION || self.cursor - run == start {
                self.put_replacement();
                return;
            }
            let at = self.cursor;
            if self.splice(self.cursor_row, at, 0, &[b], attr) {
                self.cursor = at + 1;
            }
            return;
        }
        self.cr_wrapped = false;
        if self.cursor_col() >= self.cols {
            if self.modes.autowrap {
                self.line_down();
                self.cursor = self.line[self.cursor_row];
            } else {
                self.cursor = self.offset_at(self.cursor_row, self.cols - 1);
            }
        }
        let at = self.cursor;
        let remove = if self.modes.insert { 0 } else { self.glyph_len_at(at) };
        if self.splice(self.cursor_row, at, remove, &[b], attr) {
            self.cursor = at + 1;
            if self.modes.insert {
                self.trim_row(self.cursor_row);
            }
        }
    }

    /// U+FFFD for a stray or overlong continuation byte
    fn put_replacement(&mut self) {
        let [lead, rest @ ..] = "\u{FFFD}".as_bytes() else {
            return;
        };
        self.put_glyph(*lead);
        for &b in rest {
            let at = self.cursor;
            if self.splice(self.cursor_row, at, 0, &[b], self.current_attr) {
                self.cursor = at + 1;
            }
        }
    }

    /// Raw append at the cursor, byte by byte
    pub fn append(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_glyph(b);
        }
    }

    /// Advance to the start of the next row, appending one when at the end
    pub fn next_line(&mut self) {
        if self.cursor_row + 1 >= self.line_count() {
            let shift = self.append_row();
            self.cursor_row -= shift;
        }
        self.cursor_row += 1;
        self.cursor = self.line[self.cursor_row];
        self.track_screen();
    }

    /// Down one row, scrolling the margin region when at its bottom
    fn line_down(&mut self) {
        let (_, bottom) = self.margins_abs();
        if self.cursor_row == bottom && (self.modes.alternate || self.margins.is_some()) {
            let col = self.cursor_col();
            self.scroll_up(1, true);
            let row = self.cursor_row;
            self.move_to_abs(row, col);
        } else {
            self.next_line();
        }
    }

    /// LF/VT/FF
    pub fn line_feed(&mut self) {
        if std::mem::take(&mut self.cr_wrapped) {
            return;
        }
        let col = if self.modes.newline { 0 } else { self.cursor_col() };
        if self.modes.alternate {
            self.index();
        } else {
            self.line_down();
        }
        let row = self.cursor_row;
        self.move_to_abs(row, col);
    }

    /// CR; a cursor parked one past the last column wraps softly instead
    pub fn carriage_return(&mut self) {
        if self.modes.autowrap && self.cursor_col() == self.cols && !self.modes.alternate {
            self.line_down();
            self.cursor = self.line[self.cursor_row];
            self.cr_wrapped = true;
        } else {
            self.cursor = self.line[self.cursor_row];
            self.cr_wrapped = false;
        }
    }

    /// BS: one glyph left, never past the row start
    pub fn backspace(&mut self) {
        let start = self.line[self.cursor_row];
        if self.cursor > start {
            self.cursor -= 1;
            while self.cursor > start && is_continuation(self.text[self.cursor]) {
                self.cursor -= 1;
            }
        }
        self.cr_wrapped = false;
    }

    /// HT: spaces with the current attribute up to the next tab stop
    pub fn tab(&mut self) {
        let col = self.cursor_col();
        let stop = self.next_tab(col);
        for _ in col..stop {
            let at = self.cursor;
            let remove = self.glyph_len_at(at);
            let attr = self.current_attr;
            if !self.splice(self.cursor_row, at, remove, b" ", attr) {
                return;
            }
            self.cursor = at + 1;
        }
    }

    fn next_tab(&self, col: usize) -> usize {
        let last = self.cols - 1;
        (col + 1..self.cols.min(TAB_COLUMNS))
            .find(|&c| self.tabs[c])
            .unwrap_or(last)
            .max(col)
    }

    pub fn set_tab(&mut self) {
        let col = self.cursor_col();
        if col < TAB_COLUMNS {
            self.tabs[col] = true;
        }
    }

    /// TBC: 0 clears the stop at the cursor, 3 clears all
    pub fn clear_tab(&mut self, mode: u16) {
        match mode {
            0 => {
                let col = self.cursor_col();
                if col < TAB_COLUMNS {
                    self.tabs[col] = false;
                }
            }
            3 => self.tabs.iter_mut().for_each(|t| *t = false),
            _ => {}
        }
    }

    // ---- cursor motion --------------------------------------------------

    /// CUP with 1-based screen coordinates; origin mode offsets by the top margin
    pub fn cursor_position_set(&mut self, row: u16, col: u16) {
        let row = usize::from(row.max(1)) - 1;
        let col = (usize::from(col.max(1)) - 1).min(self.cols - 1);
        let (top, bottom) = match (self.modes.origin, self.margins) {
            (true, Some((t, b))) => (t, b),
            _ => (0, self.rows - 1),
        };
        let row = (top + row).min(bottom);
        self.move_to_abs(self.screen_top + row, col);
    }

    pub fn cursor_up(&mut self, n: u16) {
        let (top, _) = self.margins_abs();
        let floor = if self.cursor_row >= top { top } else { self.screen_top };
        let row = self.cursor_row.saturating_sub(usize::from(n)).max(floor);
        let col = self.cursor_col().min(self.cols - 1);
        self.move_to_abs(row, col);
    }

    pub fn cursor_down(&mut self, n: u16) {
        let (_, bottom) = self.margins_abs();
        let ceiling = if self.cursor_row <= bottom {
            bottom
        } else {
            self.screen_top + self.rows - 1
        };
        let row = (self.cursor_row + usize::from(n)).min(ceiling);
        let col = self.cursor_col().min(self.cols - 1);
        self.move_to_abs(row, col);
    }

    pub fn cursor_forward(&mut self, n: u16) {
        let col = (self.cursor_col() + usize::from(n)).min(self.cols - 1);
        self.move_to_abs(self.cursor_row, col);
    }

    pub fn cursor_backward(&mut self, n: u16) {
        let col = self.cursor_col().min(self.cols).saturating_sub(usize::from(n));
        self.move_to_abs(self.cursor_row, col);
    }

    /// CHA / HPA, 1-based
    pub fn set_column(&mut self, col: u16) {
        let col = (usize::from(col.max(1)) - 1).min(self.cols - 1);
        self.move_to_abs(self.cursor_row, col);
    }

    /// VPA, 1-based
    pub fn set_row(&mut self, row: u16) {
        let row = (usize::from(row.max(1)) - 1).min(self.rows - 1);
        let col = self.cursor_col().min(self.cols - 1);
        self.move_to_abs(self.screen_top + row, col);
    }

    /// Cursor to the lower-left corner of the screen
    pub fn cursor_home_down(&mut self) {
        self.move_to_abs(self.screen_top + self.rows - 1, 0);
    }

    pub fn save_cursor(&mut self) {
        let (row, col) = self.cursor_position();
        self.saved = Some(SavedCursor {
            row,
            col,
            attr: self.current_attr,
        });
    }

    pub fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved {
            self.current_attr = saved.attr;
            let row = self.screen_top + saved.row.min(self.rows - 1);
            self.move_to_abs(row, saved.col.min(self.cols - 1));
        }
    }

    // ---- scrolling ------------------------------------------------------

    /// IND: down one line, scrolling the margin region at its bottom
    pub fn index(&mut self) {
        let (_, bottom) = self.margins_abs();
        let col = self.cursor_col().min(self.cols - 1);
        if self.cursor_row == bottom {
            self.scroll_up(1, self.modes.alternate || self.margins.is_some());
            let row = self.cursor_row;
            self.move_to_abs(row, col);
        } else {
            let row = self.cursor_row + 1;
            self.move_to_abs(row, col);
        }
    }

    /// RI: up one line, scrolling the margin region down at its top
    pub fn reverse_index(&mut self) {
        let (top, _) = self.margins_abs();
        let col = self.cursor_col().min(self.cols - 1);
        if self.cursor_row == top {
            self.scroll_down(1);
            self.move_to_abs(top, col);
        } else if self.cursor_row > self.screen_top {
            let row = self.cursor_row - 1;
            self.move_to_abs(row, col);
        }
    }

    /// Scroll content up `n` lines. Outside a region on the primary screen
    /// the lines go to history instead of being discarded.
    pub fn scroll_up(&mut self, n: u16, within_region: bool) {
        let (row, col) = self.cursor_position();
        if within_region {
            let (_, bottom) = self.margins_abs();
            self.ensure_row(bottom);
            let (top, bottom) = self.margins_abs();
            for _ in 0..usize::from(n).min(bottom - top + 1) {
                self.remove_row(top);
                self.insert_row(bottom);
            }
        } else {
            let last = self.screen_top + self.rows - 1;
            self.ensure_row(last);
            // beyond a screenful only blank rows are pushed
            for _ in 0..usize::from(n).min(self.rows) {
                self.append_row();
            }
        }
        self.move_to_abs(self.screen_top + row, col);
    }

    /// Scroll the margin region down `n` lines
    pub fn scroll_down(&mut self, n: u16) {
        let (row, col) = self.cursor_position();
        let (_, bottom) = self.margins_abs();
        self.ensure_row(bottom);
        let (top, bottom) = self.margins_abs();
        for _ in 0..usize::from(n).min(bottom - top + 1) {
            self.remove_row(bottom);
            self.insert_row(top);
        }
        self.move_to_abs(self.screen_top + row, col);
    }

    /// DECSTBM with 1-based parameters; homes the cursor
    pub fn set_margins(&mut self, top: u16, bottom: u16) {
        let top = usize::from(top.max(1)) - 1;
        let bottom = (usize::from(bottom.max(1)) - 1).min(self.rows - 1);
        self.margins = if top < bottom && !(top == 0 && bottom == self.rows - 1) {
            Some((top, bottom))
        } else {
            None
        };
        self.cursor_position_set(1, 1);
    }

    pub fn margins(&self) -> Option<(usize, usize)> {
        self.margins
    }

    // ---- erase ----------------------------------------------------------

    /// Blank the glyphs starting inside `offset..offset + len`, keeping columns
    pub fn clear_region(&mut self, offset: usize, len: usize) {
        if len == 0 || offset >= self.end() {
            return;
        }
        let row = self.row_of(offset);
        let row_end = self.line[row + 1];
        let mut stop = (offset + len).min(row_end);
        while stop < row_end && is_continuation(self.text[stop]) {
            stop += 1;
        }
        let glyphs = columns(&self.text[offset..stop]);
        let blanks = vec![b' '; glyphs];
        let attr = self.current_attr;
        let inside = (self.cursor > offset && self.cursor < stop)
            .then(|| columns(&self.text[offset..self.cursor]));
        if self.splice(row, offset, stop - offset, &blanks, attr) {
            if let Some(col) = inside {
                self.cursor = offset + col;
            }
        }
    }

    /// ED: 0 = cursor to end, 1 = start to cursor, 2/3 = entire screen
    pub fn clear_screen(&mut self, mode: u16) {
        match mode {
            0 => {
                self.erase_line(0);
                for r in self.cursor_row + 1..self.line_count() {
                    self.empty_row(r);
                }
            }
            1 => {
                for r in self.screen_top..self.cursor_row {
                    self.empty_row(r);
                }
                self.erase_line(1);
            }
            2 | 3 => {
                for r in self.screen_top..self.line_count() {
                    self.empty_row(r);
                }
                self.move_to_abs(self.screen_top, 0);
            }
            _ => {}
        }
    }

    /// EL: 0 = cursor to end, 1 = start to cursor, 2 = whole line
    pub fn erase_line(&mut self, mode: u16) {
        let row = self.cursor_row;
        let (start, end) = (self.line[row], self.line[row + 1]);
        match mode {
            0 => {
                let at = self.cursor;
                self.splice(row, at, end - at, &[], DEFAULT_ATTR);
            }
            1 => {
                let len = self.cursor - start + self.glyph_len_at(self.cursor).max(1);
                self.clear_region(start, len);
            }
            2 => self.clear_region(start, end - start),
            _ => {}
        }
    }

    /// ICH: insert blanks at the cursor, dropping glyphs pushed past the width
    pub fn insert_chars(&mut self, n: u16) {
        let at = self.cursor;
        let blanks = vec![b' '; usize::from(n)];
        let attr = self.current_attr;
        if self.splice(self.cursor_row, at, 0, &blanks, attr) {
            self.cursor = at;
            self.trim_row(self.cursor_row);
        }
    }

    /// DCH: delete glyphs at the cursor
    pub fn delete_chars(&mut self, n: u16) {
        let at = self.cursor;
        let col = self.cursor_col();
        let stop = self.offset_at(self.cursor_row, col + usize::from(n));
        self.splice(self.cursor_row, at, stop - at, &[], DEFAULT_ATTR);
        self.cursor = at;
    }

    /// ECH: blank glyphs at the cursor
    pub fn erase_chars(&mut self, n: u16) {
        let at = self.cursor;
        let col = self.cursor_col();
        let stop = self.offset_at(self.cursor_row, col + usize::from(n));
        self.clear_region(at, stop - at);
        self.cursor = at;
    }

    /// IL: insert blank lines at the cursor row inside the margins
    pub fn insert_lines(&mut self, n: u16) {
        let (top, bottom) = self.margins_abs();
        if self.cursor_row < top || self.cursor_row > bottom {
            return;
        }
        let shift = bottom - self.ensure_row(bottom);
        let (row, bottom) = (self.cursor_row, bottom - shift);
        for _ in 0..usize::from(n).min(bottom - row + 1) {
            self.remove_row(bottom);
            self.insert_row(row);
        }
        self.move_to_abs(row, 0);
    }

    /// DL: delete lines at the cursor row inside the margins
    pub fn delete_lines(&mut self, n: u16) {
        let (top, bottom) = self.margins_abs();
        if self.cursor_row < top || self.cursor_row > bottom {
            return;
        }
        let shift = bottom - self.ensure_row(bottom);
        let (row, bottom) = (self.cursor_row, bottom - shift);
        for _ in 0..usize::from(n).min(bottom - row + 1) {
            self.remove_row(row);
            self.insert_row(bottom);
        }
        self.move_to_abs(row, 0);
    }

    /// DECALN: fill the screen with `E`
    pub fn fill_alignment(&mut self) {
        let last = self.ensure_row(self.screen_top + self.rows - 1);
        let fill = vec![b'E'; self.cols];
        for r in self.screen_top..=last {
            self.empty_row(r);
            let at = self.line[r];
            if !self.splice(r, at, 0, &fill, DEFAULT_ATTR) {
                return;
            }
        }
        self.margins = None;
        self.move_to_abs(self.screen_top, 0);
    }

    // ---- screens and geometry -------------------------------------------

    /// Switch to the alternate screen: fresh rows appended after the content
    pub fn enter_alternate(&mut self) {
        if self.modes.alternate {
            return;
        }
        self.save_cursor();
        self.alt = Some(AltStash {
            line_count: self.line_count(),
            screen_top: self.screen_top,
        });
        for _ in 0..self.rows {
            self.append_row();
        }
        self.screen_top = self.line_count() - self.rows;
        self.view_row = self.screen_top;
        self.modes.alternate = true;
        self.margins = None;
        self.move_to_abs(self.screen_top, 0);
    }

    /// Leave the alternate screen, discarding its rows
    pub fn leave_alternate(&mut self) {
        let Some(alt) = self.alt.take() else {
            return;
        };
        let keep = alt.line_count.min(self.line_count());
        let end = self.line[keep];
        self.text.truncate(end);
        self.attr.truncate(end);
        self.line.truncate(keep + 1);
        self.recv_mark = self.recv_mark.min(end);
        self.sel_left = self.sel_left.min(end);
        self.sel_right = self.sel_right.min(end);
        self.screen_top = alt.screen_top.min(self.line_count() - 1);
        self.view_row = self.screen_top;
        self.modes.alternate = false;
        self.margins = None;
        self.cursor_row = self.line_count() - 1;
        self.cursor = end;
        self.restore_cursor();
    }

    /// New geometry. Rows are not reflowed: a wrapped line stays split where
    /// it was wrapped.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = usize::from(cols.max(1));
        self.rows = usize::from(rows.max(1));
        self.margins = None;
        let lc = self.line_count();
        let mut top = lc.saturating_sub(self.rows).min(self.cursor_row);
        if self.cursor_row >= top + self.rows {
            top = self.cursor_row + 1 - self.rows;
        }
        self.screen_top = top;
        self.view_row = top;
    }

    /// Drop everything and start over with the same geometry and modes
    pub fn clear(&mut self) {
        self.text.clear();
        self.attr.clear();
        self.line.clear();
        self.line.extend([0, 0]);
        self.row_capacity = DEFAULT_ROWS;
        self.cursor = 0;
        self.cursor_row = 0;
        self.screen_top = 0;
        self.view_row = 0;
        self.recv_mark = 0;
        self.sel_left = 0;
        self.sel_right = 0;
        self.margins = None;
        self.alt = None;
        self.modes.alternate = false;
        self.cr_wrapped = false;
    }

    /// RIS
    pub fn reset(&mut self) {
        self.clear();
        self.modes = Modes::default();
        self.current_attr = DEFAULT_ATTR;
        self.tabs = default_tabs();
        self.saved = None;
    }

    /// Scroll the view by `delta` rows (negative = towards history)
    pub fn scroll_view(&mut self, delta: isize) {
        let target = self.view_row as isize + delta;
        self.view_row = target.clamp(0, self.screen_top as isize) as usize;
    }

    /// Set the view so `row` is visible
    pub fn show_row(&mut self, row: usize) {
        if row < self.view_row || row >= self.view_row + self.rows {
            self.view_row = row.saturating_sub(self.rows / 2).min(self.screen_top);
        }
    }
}

fn default_tabs() -> Vec<bool> {
    (0..TAB_COLUMNS).map(|c| c > 0 && c % 8 == 0).collect()
}

/// Visible columns in a byte run: lead bytes only
pub fn columns(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| !is_continuation(b)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_text(buf: &ScreenBuffer, row: usize) -> String {
        String::from_utf8_lossy(buf.row(row).map(|r| r.0).unwrap_or_default()).into_owned()
    }

    #[test]
    fn test_put_and_cursor() {
        let mut buf = ScreenBuffer::new(80, 24);
        buf.append(b"hello");
        assert_eq!(buf.cursor_col(), 5);
        assert_eq!(row_text(&buf, 0), "hello");
        assert_eq!(buf.cursor(), 5);
    }

    #[test]
    fn test_no_autowrap_stays_on_row() {
        let mut buf = ScreenBuffer::new(10, 5);
        buf.modes.autowrap = false;
        buf.append(b"abcdefghijklm");
        assert_eq!(buf.cursor_row(), 0);
        assert_eq!(row_text(&buf, 0), "abcdefghim");
    }

    #[test]
    fn test_autowrap_on_width() {
        let mut buf = ScreenBuffer::new(4, 5);
        buf.append(b"abcdef");
        assert_eq!(row_text(&buf, 0), "abcd");
        assert_eq!(row_text(&buf, 1), "ef");
        assert_eq!(buf.cursor_row(), 1);
    }

    #[test]
    fn test_utf8_counts_lead_bytes_only() {
        let mut buf = ScreenBuffer::new(4, 5);
        buf.append("ééé".as_bytes());
        assert_eq!(buf.cursor_col(), 3);
        buf.backspace();
        assert_eq!(buf.cursor_col(), 2);
        assert!(!is_continuation(buf.text()[buf.cursor()]));
    }

    #[test]
    fn test_overwrite_multibyte_with_ascii() {
        let mut buf = ScreenBuffer::new(10, 5);
        buf.append("aéb".as_bytes());
        buf.carriage_return();
        buf.cursor_forward(1);
        buf.put_glyph(b'x');
        assert_eq!(row_text(&buf, 0), "axb");
    }

    #[test]
    fn test_line_feed_appends_rows() {
        let mut buf = ScreenBuffer::new(80, 3);
        for i in 0..5 {
            buf.append(format!("line{i}").as_bytes());
            buf.carriage_return();
            buf.line_feed();
        }
        assert_eq!(buf.line_count(), 6);
        assert_eq!(buf.screen_top(), 3);
        assert_eq!(buf.view_row(), 3);
        assert_eq!(row_text(&buf, 4), "line4");
    }

    #[test]
    fn test_cr_soft_wrap_absorbs_following_lf() {
        let mut buf = ScreenBuffer::new(4, 5);
        buf.append(b"abcd");
        buf.carriage_return();
        buf.line_feed();
        buf.append(b"x");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(row_text(&buf, 1), "x");
    }

    #[test]
    fn test_clear_screen_idempotent() {
        let mut buf = ScreenBuffer::new(10, 4);
        buf.append(b"abc");
        buf.carriage_return();
        buf.line_feed();
        buf.append(b"def");
        buf.clear_screen(2);
        let once = (buf.text().to_vec(), buf.line.clone(), buf.cursor());
        buf.clear_screen(2);
        let twice = (buf.text().to_vec(), buf.line.clone(), buf.cursor());
        assert_eq!(once, twice);
        assert_eq!(buf.cursor_position(), (0, 0));
    }

    #[test]
    fn test_cursor_position_pads() {
        let mut buf = ScreenBuffer::new(10, 4);
        buf.cursor_position_set(3, 5);
        assert_eq!(buf.cursor_position(), (2, 4));
        assert_eq!(row_text(&buf, 2), "    ");
    }

    #[test]
    fn test_insert_and_delete_chars() {
        let mut buf = ScreenBuffer::new(5, 4);
        buf.append(b"abcde");
        buf.cursor_position_set(1, 2);
        buf.insert_chars(2);
        assert_eq!(row_text(&buf, 0), "a  bc");
        buf.delete_chars(2);
        assert_eq!(row_text(&buf, 0), "abc");
    }

    #[test]
    fn test_scroll_region() {
        let mut buf = ScreenBuffer::new(10, 4);
        buf.enter_alternate();
        for (i, ch) in [b'a', b'b', b'c', b'd'].iter().enumerate() {
            buf.cursor_position_set(i as u16 + 1, 1);
            buf.put_glyph(*ch);
        }
        buf.set_margins(2, 3);
        buf.scroll_up(1, true);
        let top = buf.screen_top();
        assert_eq!(row_text(&buf, top), "a");
        assert_eq!(row_text(&buf, top + 1), "c");
        assert_eq!(row_text(&buf, top + 2), "");
        assert_eq!(row_text(&buf, top + 3), "d");
    }

    #[test]
    fn test_alternate_screen_restores_content() {
        let mut buf = ScreenBuffer::new(10, 4);
        buf.append(b"$ vi");
        let before = buf.line_count();
        buf.enter_alternate();
        buf.append(b"editor");
        buf.leave_alternate();
        assert_eq!(buf.line_count(), before);
        assert_eq!(row_text(&buf, 0), "$ vi");
        assert_eq!(buf.cursor_position(), (0, 4));
    }

    #[test]
    fn test_tab_stops() {
        let mut buf = ScreenBuffer::new(40, 4);
        buf.append(b"ab");
        buf.tab();
        assert_eq!(buf.cursor_col(), 8);
        buf.clear_tab(3);
        buf.tab();
        assert_eq!(buf.cursor_col(), 39);
    }

    #[test]
    fn test_compaction_keeps_invariants() {
        let mut buf = ScreenBuffer::new(20, 10);
        buf.append(b"start");
        buf.set_recv_mark();
        for _ in 0..(MAX_ROWS + 100) {
            buf.put_glyph(b'x');
            buf.carriage_return();
            buf.line_feed();
        }
        assert!(buf.cursor_row() < buf.line_count());
        assert!(buf.line_count() <= MAX_ROWS);
        assert!(buf.cursor() < buf.capacity());
        assert!(buf.line.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(buf.recv_mark(), 0);
    }

    #[test]
    fn test_huge_scroll_counts_are_bounded() {
        let mut buf = ScreenBuffer::new(80, 24);
        for _ in 0..(MAX_ROWS / 2) {
            buf.put_glyph(b'x');
            buf.carriage_return();
            buf.line_feed();
        }
        buf.cursor_position_set(1, 1);
        buf.scroll_down(u16::MAX);
        buf.scroll_up(u16::MAX, false);
        buf.scroll_up(u16::MAX, false);
        assert!(buf.cursor_row() < buf.line_count());
        assert!(buf.cursor() <= buf.end());
        assert!(buf.line_count() <= MAX_ROWS);
        assert_eq!(buf.cursor_position(), (0, 0));
        assert!(buf.line.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_scroll_past_compaction_keeps_cursor_in_buffer() {
        let mut buf = ScreenBuffer::new(80, 24);
        for _ in 0..(MAX_ROWS - 10) {
            buf.carriage_return();
            buf.line_feed();
        }
        buf.append(b"tail");
        buf.scroll_up(u16::MAX, false);
        assert!(buf.cursor() <= buf.end());
        assert!(buf.cursor_row() >= buf.screen_top());
        assert_eq!(buf.cursor_position().1, 4);
    }

    #[test]
    fn test_continuation_run_is_capped() {
        let mut buf = ScreenBuffer::new(8, 4);
        buf.append(b"a");
        buf.append(&[0x80; 5]);
        assert_eq!(&buf.text()[..4], &[b'a', 0x80, 0x80, 0x80]);
        assert_eq!(&buf.text()[4..7], "\u{FFFD}".as_bytes());
        assert_eq!(buf.cursor_col(), 2);

        let mut buf = ScreenBuffer::new(8, 4);
        buf.append(&vec![0x80; 4096]);
        assert!(buf.line_count() > 1);
        assert!(buf.row(0).map_or(0, |r| r.0.len()) <= 8 * 4);
    }

    #[test]
    fn test_resize_does_not_reflow() {
        let mut buf = ScreenBuffer::new(4, 5);
        buf.append(b"abcdef");
        buf.resize(10, 5);
        assert_eq!(row_text(&buf, 0), "abcd");
        assert_eq!(row_text(&buf, 1), "ef");
        assert!(buf.cursor_row() >= buf.view_row());
    }
}
