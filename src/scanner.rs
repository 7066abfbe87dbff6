//! Wildcard byte-pattern scanning.
//!
//! Patterns are written as space-separated hex bytes with `??` (or `?`) for
//! "any byte", e.g. `"E8 ?? ?? ?? ?? 5F"`. Scanning is best-effort: helpers that
//! take a pattern string treat a malformed pattern as "no match" so a single
//! bad table entry never aborts a larger scan.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};

/// A compiled byte pattern. `None` tokens match any byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Option<u8>>,
    /// Index of the first exact token, used to skip quickly through the haystack.
    anchor: Option<usize>,
}

impl Pattern {
    /// Compile a pattern from its textual form.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPattern {
            pattern: text.to_string(),
            reason,
        };

        let mut tokens = Vec::new();
        for token in text.split_whitespace() {
            if token.chars().all(|c| c == '?') && token.len() <= 2 {
                tokens.push(None);
                continue;
            }
            if token.len() != 2 {
                return Err(invalid(format!("token '{}' is not a byte", token)));
            }
            let byte = u8::from_str_radix(token, 16)
                .map_err(|_| invalid(format!("token '{}' is not hex", token)))?;
            tokens.push(Some(byte));
        }

        if tokens.is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }

        let anchor = tokens.iter().position(Option::is_some);
        Ok(Self { tokens, anchor })
    }

    /// Number of bytes the pattern spans.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check whether the pattern matches `haystack` at `offset`.
    #[inline]
    pub fn matches_at(&self, haystack: &[u8], offset: usize) -> bool {
        let Some(window) = offset
            .checked_add(self.tokens.len())
            .and_then(|end| haystack.get(offset..end))
        else {
            return false;
        };

        self.tokens
            .iter()
            .zip(window)
            .all(|(token, byte)| token.map_or(true, |t| t == *byte))
    }

    /// Offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        self.find_from(haystack, 0)
    }

    /// Offsets of every match in `haystack`, overlapping matches included.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        let mut results = Vec::new();
        let mut from = 0;
        while let Some(found) = self.find_from(haystack, from) {
            results.push(found);
            from = found + 1;
        }
        results
    }

    fn find_from(&self, haystack: &[u8], from: usize) -> Option<usize> {
        let last = haystack.len().checked_sub(self.tokens.len())?;
        if from > last {
            return None;
        }

        match self.anchor {
            // All wildcards: every position with enough room matches.
            None => Some(from),
            Some(anchor) => {
                let anchor_byte = self.tokens[anchor]?;
                let mut start = from;
                while start <= last {
                    let rel = haystack[start + anchor..=last + anchor]
                        .iter()
                        .position(|&b| b == anchor_byte)?;
                    let candidate = start + rel;
                    if self.matches_at(haystack, candidate) {
                        return Some(candidate);
                    }
                    start = candidate + 1;
                }
                None
            }
        }
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Clamp a `[start, start + size)` window to `data`.
pub fn region(data: &[u8], start: usize, size: usize) -> &[u8] {
    let start = start.min(data.len());
    let end = start.saturating_add(size).min(data.len());
    &data[start..end]
}

fn compile(pattern: &str) -> Option<Pattern> {
    match Pattern::parse(pattern) {
        Ok(p) => Some(p),
        Err(e) => {
            debug!(error = %e, "skipping malformed pattern");
            None
        }
    }
}

/// First match of `pattern` in `region`, or `None` (also for malformed patterns).
pub fn find_pattern(pattern: &str, region: &[u8]) -> Option<usize> {
    compile(pattern)?.find(region)
}

/// All matches of every pattern, appended in list order.
pub fn find_all_patterns<S: AsRef<str>>(patterns: &[S], region: &[u8]) -> Vec<usize> {
    patterns
        .iter()
        .filter_map(|p| compile(p.as_ref()))
        .flat_map(|p| p.find_all(region))
        .collect()
}

/// First match of the first pattern (in priority order) that matches at all.
///
/// Returns the index of the winning pattern with its offset.
pub fn find_first_of<S: AsRef<str>>(patterns: &[S], region: &[u8]) -> Option<(usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .find_map(|(i, p)| find_pattern(p.as_ref(), region).map(|offset| (i, offset)))
}
