//! Helpers for scanning byte windows without copying them.
//!
//! The parser works directly on the bytes received from the transport, so
//! these helpers only return offsets and sub-slices of their input.

use std::borrow::Cow;

/// Position of a line terminator inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineEnd {
    /// Length of the line content, without `\r\n` or `\n`.
    pub(crate) content: usize,
    /// Offset of the first byte after the terminator.
    pub(crate) next: usize,
}

/// Finds the first line terminator, accepting both `CRLF` and bare `LF`.
pub(crate) fn find_line_end(window: &[u8]) -> Option<LineEnd> {
    let lf = window.iter().position(|&b| b == b'\n')?;
    let content = if lf > 0 && window[lf - 1] == b'\r' { lf - 1 } else { lf };
    Some(LineEnd { content, next: lf + 1 })
}

/// Checks that no physical line of `window` is longer than `max_line_size`.
///
/// The trailing line does not need to be terminated yet, so a peer streaming
/// an endless line is rejected before the terminator ever arrives.
pub(crate) fn longest_line_within(window: &[u8], max_line_size: usize) -> bool {
    let mut rest = window;
    loop {
        match find_line_end(rest) {
            Some(end) => {
                if end.content > max_line_size {
                    return false;
                }
                rest = &rest[end.next..];
            }
            None => return rest.len() <= max_line_size,
        }
    }
}

#[inline]
pub(crate) fn is_ows(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Trims spaces and tabs on both sides.
pub(crate) fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !is_ows(*first) {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !is_ows(*last) {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Joins obsolete line folding: every line break together with the
/// whitespace around it becomes one space.
pub(crate) fn unfold(value: &[u8]) -> Cow<'_, [u8]> {
    if !value.iter().any(|&b| b == b'\n' || b == b'\r') {
        return Cow::Borrowed(trim_ows(value));
    }

    let mut unfolded = Vec::with_capacity(value.len());
    for line in value.split(|&b| b == b'\n') {
        let line = trim_ows(line.strip_suffix(b"\r").unwrap_or(line));
        if line.is_empty() {
            continue;
        }
        if !unfolded.is_empty() {
            unfolded.push(b' ');
        }
        unfolded.extend_from_slice(line);
    }
    Cow::Owned(unfolded)
}

/// Splits a header value on commas that are not inside a quoted string.
///
/// Elements are trimmed; empty elements (`a,,b`) are skipped.
pub(crate) fn split_commas(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    CommaSplit { rest: Some(value) }
}

struct CommaSplit<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for CommaSplit<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.rest?;
            let mut quoted = false;
            let mut escaped = false;
            let mut split_at = None;

            for (i, &b) in rest.iter().enumerate() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match b {
                    b'\\' if quoted => escaped = true,
                    b'"' => quoted = !quoted,
                    b',' if !quoted => {
                        split_at = Some(i);
                        break;
                    }
                    _ => {}
                }
            }

            let element = match split_at {
                Some(i) => {
                    self.rest = Some(&rest[i + 1..]);
                    &rest[..i]
                }
                None => {
                    self.rest = None;
                    rest
                }
            };

            let element = trim_ows(element);
            if !element.is_empty() {
                return Some(element);
            }
        }
    }
}
