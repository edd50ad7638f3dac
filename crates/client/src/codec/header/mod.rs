//! Header section processing for responses and request heads
//!
//! - [`HeaderDecoder`] turns the status line and header section of a response
//!   into a [`ResponseHead`](crate::protocol::ResponseHead)
//! - [`decode_trailers`] parses the trailer section that follows the last chunk
//! - [`RequestEncoder`](crate::codec::RequestEncoder) does the opposite direction
//!   and lives next to the message level codecs
//!
//! Both decoders share the same field grammar: obsolete line folding is
//! joined into one space, and comma separated values are split into separate
//! entries of the header map unless the header is one of the
//! [`INSEPARABLE_HEADERS`], whose values legitimately contain commas.

mod header_decoder;
mod trailer_decoder;

pub use header_decoder::HeaderDecoder;
pub(crate) use header_decoder::parse_payload;
pub use trailer_decoder::decode_trailers;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::codec::window::{split_commas, unfold};
use crate::protocol::ParseError;

/// Default limit for the status line plus the header section.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default limit for any single line in the header section.
pub const DEFAULT_MAX_LINE_SIZE: usize = 8 * 1024;

/// Default limit for the number of header lines in one section.
pub const DEFAULT_MAX_HEADER_COUNT: usize = 100;

/// Headers whose values are never split on commas.
///
/// Their grammar allows commas inside a single value (dates, cookies,
/// authentication challenges), so splitting would corrupt them.
pub const INSEPARABLE_HEADERS: [&str; 9] = [
    "www-authenticate",
    "proxy-authenticate",
    "set-cookie",
    "date",
    "expires",
    "last-modified",
    "if-modified-since",
    "if-unmodified-since",
    "retry-after",
];

/// Size limits enforced while decoding a header or trailer section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLimits {
    pub max_header_size: usize,
    pub max_line_size: usize,
    pub max_header_count: usize,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            max_header_count: DEFAULT_MAX_HEADER_COUNT,
        }
    }
}

pub(crate) fn is_inseparable(name: &HeaderName) -> bool {
    INSEPARABLE_HEADERS.contains(&name.as_str())
}

/// Appends one raw header field to `headers`.
///
/// The value is unfolded first, then split on commas unless the header is
/// inseparable. A field with an empty value is kept as a single empty value.
pub(crate) fn append_field(headers: &mut HeaderMap, name: &str, raw_value: &[u8]) -> Result<(), ParseError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ParseError::invalid_header(format!("header name {name:?}: {e}")))?;

    let value = unfold(raw_value);

    if is_inseparable(&name) {
        headers.append(name, header_value(&value)?);
        return Ok(());
    }

    let mut appended = false;
    for element in split_commas(&value) {
        headers.append(&name, header_value(element)?);
        appended = true;
    }
    if !appended {
        headers.append(name, HeaderValue::from_static(""));
    }
    Ok(())
}

fn header_value(bytes: &[u8]) -> Result<HeaderValue, ParseError> {
    HeaderValue::from_bytes(bytes).map_err(|e| ParseError::invalid_header(format!("header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_separable_values() {
        let mut headers = HeaderMap::new();
        append_field(&mut headers, "name2", b"value2, value4").unwrap();
        let values: Vec<_> = headers.get_all("name2").iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(values, vec!["value2", "value4"]);
    }

    #[test]
    fn keeps_inseparable_values() {
        let mut headers = HeaderMap::new();
        append_field(&mut headers, "WWW-Authenticate", b"Digest realm=\"x\", nonce=\"y\"").unwrap();
        append_field(&mut headers, "Date", b"Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(headers.get_all("www-authenticate").iter().count(), 1);
        assert_eq!(headers["date"], "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn keeps_empty_value() {
        let mut headers = HeaderMap::new();
        append_field(&mut headers, "X-Empty", b"").unwrap();
        assert_eq!(headers["x-empty"], "");
    }

    #[test]
    fn rejects_invalid_name() {
        let mut headers = HeaderMap::new();
        let error = append_field(&mut headers, "bad name", b"v").unwrap_err();
        assert!(matches!(error, ParseError::InvalidHeader { .. }));
    }
}
