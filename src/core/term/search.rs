//! Selection and search over buffer offsets

use super::buffer::{is_continuation, ScreenBuffer};

/// Search direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

fn is_boundary(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n' || b == b'\r'
}

impl ScreenBuffer {
    /// Raw selection as set; may be reversed
    pub fn selection(&self) -> (usize, usize) {
        (self.sel_left, self.sel_right)
    }

    pub fn set_selection(&mut self, left: usize, right: usize) {
        let end = self.end();
        self.sel_left = left.min(end);
        self.sel_right = right.min(end);
    }

    /// Ordered selection
    pub fn normalized_selection(&self) -> (usize, usize) {
        if self.sel_left > self.sel_right {
            (self.sel_right, self.sel_left)
        } else {
            (self.sel_left, self.sel_right)
        }
    }

    pub fn clear_selection(&mut self) {
        self.sel_left = self.cursor;
        self.sel_right = self.cursor;
    }

    /// Offset of a (row, column) coordinate, clamped to the row
    pub fn offset_of(&self, row: usize, col: usize) -> usize {
        let row = row.min(self.line_count() - 1);
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

    /// Select the word around (row, column): the run between the nearest
    /// whitespace on either side within the row. Returns `(left, right)`
    /// with `left <= right`, both on lead bytes; `right` is exclusive.
    pub fn select_word(&mut self, row: usize, col: usize) -> (usize, usize) {
        let row = row.min(self.line_count() - 1);
        let (start, end) = (self.line[row], self.line[row + 1]);
        let at = self.offset_of(row, col);
        if at >= end || is_boundary(self.text[at]) {
            self.sel_left = at;
            self.sel_right = at;
            return (at, at);
        }

        let mut left = at;
        while left > start {
            let mut prev = left - 1;
            while prev > start && is_continuation(self.text[prev]) {
                prev -= 1;
            }
            if is_boundary(self.text[prev]) {
                break;
            }
            left = prev;
        }

        let mut right = at;
        while right < end && !is_boundary(self.text[right]) {
            right += 1;
            while right < end && is_continuation(self.text[right]) {
                right += 1;
            }
        }

        self.sel_left = left;
        self.sel_right = right;
        (left, right)
    }

    /// Bytes covered by the selection
    pub fn selected_text(&self) -> &[u8] {
        let (l, r) = self.normalized_selection();
        let end = self.end();
        &self.text[l.min(end)..r.min(end)]
    }

    /// Find `needle` starting from the selection (or the cursor when nothing
    /// is selected). A match becomes the selection and is scrolled into view;
    /// no match collapses the selection.
    pub fn search(&mut self, needle: &[u8], direction: Direction) -> bool {
        if needle.is_empty() {
            return false;
        }
        let (left, right) = self.normalized_selection();
        let (left, right) = if left == right {
            (self.cursor, self.cursor)
        } else {
            (left, right)
        };
        let end = self.end();
        let found = match direction {
            Direction::Backward => {
                let limit = left.min(end);
                self.text[..limit]
                    .windows(needle.len())
                    .rposition(|w| w == needle)
            }
            Direction::Forward => {
                let from = right.min(end);
                self.text[from..end]
                    .windows(needle.len())
                    .position(|w| w == needle)
                    .map(|p| p + from)
            }
        };
        match found {
            Some(pos) => {
                self.sel_left = pos;
                self.sel_right = pos + needle.len();
                let row = self.row_of(pos);
                self.show_row(row);
                true
            }
            None => {
                let at = match direction {
                    Direction::Backward => left,
                    Direction::Forward => right,
                };
                self.sel_left = at;
                self.sel_right = at;
                false
            }
        }
    }
}
