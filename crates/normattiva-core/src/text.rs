//! Text helpers: whitespace normalization, hashing, snippets, and Italian
//! date parsing.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// SHA-256 of `bytes`, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max_chars` characters of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Character window of `width` chars on each side of `[start, end)`.
pub fn char_window(text: &str, start: usize, end: usize, width: usize) -> String {
    let from = start.saturating_sub(width);
    let to = end + width;
    text.chars().skip(from).take(to - from).collect()
}

/// Builds a node's cleaned text from a sequence of text pieces.
///
/// Ordinary pieces have whitespace collapsed across piece boundaries;
/// verbatim pieces (cross-reference text) are copied as-is.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    out: String,
    /// Length of `out` in chars.
    chars: usize,
    pending_space: bool,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, piece: &str) {
        for c in piece.chars() {
            if c.is_whitespace() {
                self.pending_space = true;
            } else {
                self.flush_space();
                self.out.push(c);
                self.chars += 1;
            }
        }
    }

    /// Append `piece` trimmed, returning the char offset where it starts.
    pub fn push_verbatim(&mut self, piece: &str) -> usize {
        if piece.starts_with(char::is_whitespace) {
            self.pending_space = true;
        }
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            return self.chars;
        }
        self.flush_space();
        let offset = self.chars;
        self.out.push_str(trimmed);
        self.chars += trimmed.chars().count();
        if piece.ends_with(char::is_whitespace) {
            self.pending_space = true;
        }
        offset
    }

    fn flush_space(&mut self) {
        if self.pending_space && !self.out.is_empty() {
            self.out.push(' ');
            self.chars += 1;
        }
        self.pending_space = false;
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn finish(self) -> String {
        self.out
    }
}

static MONTHS: [&str; 12] = [
    "gennaio",
    "febbraio",
    "marzo",
    "aprile",
    "maggio",
    "giugno",
    "luglio",
    "agosto",
    "settembre",
    "ottobre",
    "novembre",
    "dicembre",
];

static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").unwrap());
static SLASH_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap());
static WORD_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})°?\s+(gennaio|febbraio|marzo|aprile|maggio|giugno|luglio|agosto|settembre|ottobre|novembre|dicembre)\s+(\d{4})\b",
    )
    .unwrap()
});

/// Parse `YYYY-MM-DD`, `DD/MM/YYYY`, or `D mese YYYY` (Italian month names).
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Some(c) = ISO_DATE.captures(text) {
        return ymd(&c[1], &c[2], &c[3]);
    }
    if let Some(c) = SLASH_DATE.captures(text) {
        return ymd(&c[3], &c[2], &c[1]);
    }
    if let Some(c) = WORD_DATE.captures(text) {
        let month = c[2].to_lowercase();
        let idx = MONTHS.iter().position(|m| *m == month)? + 1;
        return ymd(&c[3], &idx.to_string(), &c[1]);
    }
    None
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

/// Expand a two-digit year: `< 50` is 20xx, otherwise 19xx.
pub fn normalize_year(raw: &str) -> Option<i32> {
    let y: i32 = raw.trim().parse().ok()?;
    match raw.trim().len() {
        2 if y < 50 => Some(2000 + y),
        2 => Some(1900 + y),
        4 => Some(y),
        _ => None,
    }
}

/// Lowercase alphanumeric tokens of at least three characters.
pub fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}
