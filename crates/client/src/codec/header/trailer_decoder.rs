use bytes::{Buf, BytesMut};
use http::HeaderMap;
use tracing::trace;

use super::{HeaderLimits, append_field};
use crate::codec::window::{find_line_end, is_ows, longest_line_within};
use crate::ensure;
use crate::protocol::ParseError;

/// Decodes the trailer section that follows the last chunk of a chunked body.
///
/// Returns `Ok(None)` without consuming anything until the blank line that
/// ends the section has arrived. An empty section (just the blank line)
/// yields an empty map. Lines starting with a space or a tab continue the
/// previous field, as in the header section.
pub fn decode_trailers(src: &mut BytesMut, limits: HeaderLimits) -> Result<Option<HeaderMap>, ParseError> {
    let Some(size) = section_len(src) else {
        ensure!(src.len() <= limits.max_header_size, ParseError::too_large_header(src.len(), limits.max_header_size));
        ensure!(longest_line_within(src, limits.max_line_size), ParseError::line_too_long(limits.max_line_size));
        return Ok(None);
    };

    ensure!(size <= limits.max_header_size, ParseError::too_large_header(size, limits.max_header_size));
    ensure!(longest_line_within(&src[..size], limits.max_line_size), ParseError::line_too_long(limits.max_line_size));

    let mut trailers = HeaderMap::new();
    let mut field: Option<(&[u8], Vec<u8>)> = None;
    let mut count = 0;
    let mut rest = &src[..size];

    while let Some(end) = find_line_end(rest) {
        let line = &rest[..end.content];
        rest = &rest[end.next..];

        if line.first().copied().is_some_and(is_ows) {
            let Some((_, value)) = field.as_mut() else {
                return Err(ParseError::invalid_header("trailer section starts with a continuation line"));
            };
            value.push(b'\n');
            value.extend_from_slice(line);
            continue;
        }

        if let Some((name, value)) = field.take() {
            append_trailer(&mut trailers, name, &value)?;
        }
        if line.is_empty() {
            break;
        }

        count += 1;
        ensure!(count <= limits.max_header_count, ParseError::too_many_headers(limits.max_header_count));
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ParseError::invalid_header("trailer line without a colon"))?;
        field = Some((&line[..colon], line[colon + 1..].to_vec()));
    }

    trace!(size, trailers = trailers.len(), "decoded trailer section");
    src.advance(size);
    Ok(Some(trailers))
}

/// Length of the section up to and including its terminating blank line.
fn section_len(src: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        let end = find_line_end(&src[offset..])?;
        offset += end.next;
        if end.content == 0 {
            return Some(offset);
        }
    }
}

fn append_trailer(trailers: &mut HeaderMap, name: &[u8], value: &[u8]) -> Result<(), ParseError> {
    let name = std::str::from_utf8(name).map_err(|e| ParseError::invalid_header(format!("trailer name: {e}")))?;
    append_field(trailers, name, value)
}
