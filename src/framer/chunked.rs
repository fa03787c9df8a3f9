//! Chunked transfer-encoding completeness check and `max-age=` extraction.
//!
//! Mirrors the reference parser's two-step check: a cheap suffix probe first,
//! then a full chunk walk from the start of the body — in that order, not
//! merged into one pass (§9 Open Questions: preserved as specified).

use super::FramingError;

const TERMINATOR: &[u8] = b"0\r\n\r\n";

/// `true` iff `buf[body_start..]` is a complete, validly framed chunked body.
pub(super) fn is_complete(buf: &[u8], body_start: usize) -> Result<bool, FramingError> {
    let body = &buf[body_start..];

    if body.len() < TERMINATOR.len() || &body[body.len() - TERMINATOR.len()..] != TERMINATOR {
        return Ok(false);
    }

    walk_chunks(body)
}

/// Walks `<hex-size> CRLF <size-bytes> CRLF` chunks until the terminator
/// chunk (`0 CRLF CRLF`) or a truncation/format violation is found.
fn walk_chunks(body: &[u8]) -> Result<bool, FramingError> {
    let mut pos = 0;

    loop {
        let (size, after_size) = parse_chunk_size(&body[pos..]).ok_or(FramingError::MalformedChunk)?;
        pos += after_size;

        if size == 0 {
            // Terminator chunk: exactly one more CRLF and nothing else.
            return Ok(&body[pos..] == b"\r\n");
        }

        if body.len() - pos < size {
            return Ok(false);
        }
        pos += size;

        if body.len() - pos < 2 {
            return Ok(false);
        }
        if &body[pos..pos + 2] != b"\r\n" {
            return Err(FramingError::MalformedChunk);
        }
        pos += 2;
    }
}

/// Parses a leading hexadecimal chunk-size terminated by `CRLF`, returning the
/// size and the byte offset of the first byte after that `CRLF`.
fn parse_chunk_size(src: &[u8]) -> Option<(usize, usize)> {
    let digits_end = src.iter().position(|b| !b.is_ascii_hexdigit())?;
    if digits_end == 0 {
        return None;
    }
    let size = usize::from_str_radix(std::str::from_utf8(&src[..digits_end]).ok()?, 16).ok()?;

    if src.get(digits_end..digits_end + 2)? != b"\r\n" {
        return None;
    }
    Some((size, digits_end + 2))
}

/// Extracts the decimal integer following the first `max-age=` substring.
pub(super) fn parse_max_age(cache_control: &[u8]) -> Option<u64> {
    const PREFIX: &[u8] = b"max-age=";

    let pos = cache_control
        .windows(PREFIX.len())
        .position(|w| w == PREFIX)?;
    let digits_start = pos + PREFIX.len();
    let digits_end = cache_control[digits_start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map(|rel| digits_start + rel)
        .unwrap_or(cache_control.len());

    if digits_end == digits_start {
        return None;
    }
    std::str::from_utf8(&cache_control[digits_start..digits_end])
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_complete() {
        let body = b"5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(is_complete(body, 0), Ok(true));
    }

    #[test]
    fn truncated_chunk_incomplete() {
        let body = b"5\r\nhel";
        assert_eq!(is_complete(body, 0), Ok(false));
    }

    #[test]
    fn missing_terminator_incomplete() {
        let body = b"5\r\nhello\r\n";
        assert_eq!(is_complete(body, 0), Ok(false));
    }

    #[test]
    fn bad_chunk_delimiter_is_malformed() {
        let body = b"5\r\nhelloXX0\r\n\r\n";
        assert_eq!(is_complete(body, 0), Err(FramingError::MalformedChunk));
    }

    #[test]
    fn multiple_chunks() {
        let body = b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        assert_eq!(is_complete(body, 0), Ok(true));
    }

    #[test]
    fn max_age_parsed() {
        assert_eq!(parse_max_age(b"max-age=60"), Some(60));
        assert_eq!(parse_max_age(b"public, max-age=120, must-revalidate"), Some(120));
        assert_eq!(parse_max_age(b"no-cache"), None);
        assert_eq!(parse_max_age(b"max-age="), None);
    }
}
