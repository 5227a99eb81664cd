//! Search over the logical file.
//!
//! Searching projects the file through tiled windows twice the pattern length
//! limit wide and scans each window with a Boyer-Moore-Horspool skip table.
//! Successive windows overlap by `pattern_length - 1` bytes so matches
//! straddling a window boundary are not missed. Case-insensitive search folds
//! both the pattern and each projected window to ASCII lower case.

use crate::error::Result;
use crate::model::Model;
use crate::SEARCH_PATTERN_LENGTH_LIMIT;

/// Generation-checked handle to a search context owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug)]
pub(crate) struct SearchContext {
    pattern: Vec<u8>,
    skip: [usize; 256],
    session_offset: i64,
    session_length: i64,
    match_offset: i64,
    case_insensitive: bool,
}

/// Horspool bad-character table: how far the window may shift when its last
/// byte is `b`.
fn build_skip_table(pattern: &[u8]) -> [usize; 256] {
    let m = pattern.len();
    let mut table = [m; 256];
    for (i, &byte) in pattern[..m - 1].iter().enumerate() {
        table[byte as usize] = m - 1 - i;
    }
    table
}

/// Leftmost occurrence of `pattern` in `haystack`, or None.
fn find(haystack: &[u8], pattern: &[u8], skip: &[usize; 256]) -> Option<usize> {
    let m = pattern.len();
    if m == 0 || haystack.len() < m {
        return None;
    }
    let mut i = 0;
    while i + m <= haystack.len() {
        if &haystack[i..i + m] == pattern {
            return Some(i);
        }
        i += skip[haystack[i + m - 1] as usize];
    }
    None
}

impl SearchContext {
    /// `sentinel` is the resolved session length; `match_offset` rests there
    /// whenever no match position is pending.
    pub(crate) fn new(
        pattern: &[u8],
        session_offset: i64,
        session_length: i64,
        case_insensitive: bool,
        sentinel: i64,
    ) -> Self {
        let mut pattern = pattern.to_vec();
        if case_insensitive {
            pattern.make_ascii_lowercase();
        }
        let skip = build_skip_table(&pattern);
        Self {
            pattern,
            skip,
            session_offset,
            session_length,
            match_offset: sentinel,
            case_insensitive,
        }
    }

    pub(crate) fn match_offset(&self) -> i64 {
        self.match_offset
    }

    pub(crate) fn pattern_length(&self) -> i64 {
        self.pattern.len() as i64
    }

    /// Advance to the next match, resuming `advance_by` bytes past the
    /// previous match offset. Returns true when a match was found, leaving
    /// its offset in `match_offset`; otherwise the offset returns to the
    /// sentinel and subsequent calls restart from the session offset.
    pub(crate) fn next_match(&mut self, model: &Model, advance_by: i64) -> Result<bool> {
        let session_length = if self.session_length != 0 {
            self.session_length
        } else {
            model.computed_size()
        };
        let mut window_offset = if self.match_offset == session_length {
            self.session_offset
        } else {
            self.match_offset + advance_by
        };
        let capacity = (SEARCH_PATTERN_LENGTH_LIMIT << 1) as usize;
        let mut window = vec![0u8; capacity];
        let pattern_length = self.pattern.len() as i64;
        // Keep pattern_length - 1 bytes of trailing overlap per advance
        let skip_size = 1 + capacity as i64 - pattern_length;
        let mut skip = 0i64;
        loop {
            window_offset += skip;
            let length = model.project_into(window_offset, &mut window)?;
            if self.case_insensitive {
                window[..length].make_ascii_lowercase();
            }
            if let Some(pos) = find(&window[..length], &self.pattern, &self.skip) {
                self.match_offset = window_offset + pos as i64;
                return Ok(true);
            }
            skip = skip_size;
            if length < capacity {
                break;
            }
        }
        self.match_offset = session_length;
        Ok(false)
    }
}
