//! Stateless extraction of complete HTTP/1.x messages out of a growing byte buffer.
//!
//! Every function here is a pure transformation: given a buffer, either the first
//! complete message is sliced off the front and returned, or the buffer is left
//! untouched and the caller is told to read more. There is no parser state that
//! survives a call other than what's threaded through explicitly (`chunked`).

mod chunked;

use memchr::memchr;

/// Parsed pieces of an HTTP/1.x request line, enough to route the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Connect,
    /// Any other method; the proxy forwards it opaquely without caching.
    Other,
}

impl Method {
    fn from_bytes(src: &[u8]) -> Self {
        match src {
            b"GET" => Method::Get,
            b"CONNECT" => Method::Connect,
            _ => Method::Other,
        }
    }
}

/// A parsed request head: method, request-target (url) and `Host` field, split
/// into hostname and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request-target exactly as it appeared on the wire (the `url` field).
    pub url: Vec<u8>,
    pub hostname: Vec<u8>,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// The request/status line, a header line, or the head terminator was malformed.
    MalformedHead,
    /// Chunk framing violated the `<hex-size> CRLF <bytes> CRLF` grammar.
    MalformedChunk,
}

/// Outcome of attempting to pull one complete message off the front of a buffer.
pub enum Extracted<T> {
    /// A full message was found; `T` carries the parsed metadata, the raw bytes
    /// have already been drained from `buf`.
    Complete(T),
    /// Not enough data yet. `buf` is untouched.
    Incomplete,
}

const CRLF: &[u8] = b"\r\n";
const CRLFCRLF: &[u8] = b"\r\n\r\n";

/// Find the first occurrence of `needle` in `haystack`, returning the index of
/// the byte right after the match (i.e. the start of whatever follows it).
fn find_after(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + needle.len())
}

/// Splices `insertion` into `raw` immediately before the head terminator's
/// `CRLF CRLF`, i.e. appended to the head rather than replacing anything in
/// it (§4.5 get-path: `Age:` is appended, never substituted for an
/// origin-supplied `Age`, §9 Open Questions).
pub(crate) fn insert_before_terminator(raw: &[u8], insertion: &[u8]) -> Vec<u8> {
    let Some(head_end) = find_after(raw, CRLFCRLF) else {
        // No terminator found; nothing sensible to splice into, hand the
        // caller back what it gave us.
        return raw.to_vec();
    };
    let split_at = head_end - CRLFCRLF.len();

    let mut out = Vec::with_capacity(raw.len() + insertion.len());
    out.extend_from_slice(&raw[..split_at]);
    out.extend_from_slice(insertion);
    out.extend_from_slice(&raw[split_at..]);
    out
}

/// Extracts the first complete HTTP request from `buf`.
///
/// A request is complete the moment its head terminator (`CRLF CRLF`) appears;
/// any body is not framed here (§4.1 — `GET`/`CONNECT` carry no body, and other
/// methods are forwarded opaquely by the caller). On success, the consumed
/// prefix — including the terminator — is drained from `buf` and returned.
///
/// `default_port` governs the fallback used when a `Host` header carries no
/// explicit port: `80` on a plaintext connection, `443` when the request
/// arrived over an already-intercepted MITM TLS leg (§4.1 — "443 for `GET`
/// over intercepted TLS"). `CONNECT` always defaults to `443` regardless,
/// since an inner `CONNECT` never occurs inside a MITM tunnel.
pub fn extract_first_request(
    buf: &mut Vec<u8>,
    default_port: u16,
) -> Result<Extracted<(RequestHead, Vec<u8>)>, FramingError> {
    let Some(head_end) = find_after(buf, CRLFCRLF) else {
        return Ok(Extracted::Incomplete);
    };

    let raw = buf.drain(..head_end).collect::<Vec<u8>>();
    // A malformed head is fatal for the socket (§4.1); propagate it rather than
    // inventing a placeholder head, mirroring `extract_first_response` below.
    let head = parse_request_head(&raw, default_port)?;
    Ok(Extracted::Complete((head, raw)))
}

fn parse_request_head(raw: &[u8], default_port: u16) -> Result<RequestHead, FramingError> {
    let line_end = find_after(raw, CRLF).ok_or(FramingError::MalformedHead)?;
    let line = &raw[..line_end - CRLF.len()];

    let sp1 = memchr(b' ', line).ok_or(FramingError::MalformedHead)?;
    let method = Method::from_bytes(&line[..sp1]);
    let rest = &line[sp1 + 1..];
    let sp2 = memchr(b' ', rest).ok_or(FramingError::MalformedHead)?;
    let url = rest[..sp2].to_vec();
    // `rest[sp2 + 1..]` holds the version field; the framer has no use for it
    // since replies to CONNECT echo the request's own version bytes back
    // unparsed by the caller.

    let (hostname, port) = parse_host(raw, &method, &url, default_port);

    Ok(RequestHead {
        method,
        url,
        hostname,
        port,
    })
}

/// Locates the `Host` header and splits it into hostname and port, defaulting
/// the port per method (`default_port` for `GET`/other, always `443` for
/// `CONNECT`) when absent.
fn parse_host(raw: &[u8], method: &Method, url: &[u8], default_port: u16) -> (Vec<u8>, u16) {
    let default_port = match method {
        Method::Connect => 443,
        _ => default_port,
    };

    let mut pos = 0;
    while let Some(rel) = memchr(b'\n', &raw[pos..]) {
        let line_start = pos;
        let line_end = pos + rel + 1;
        pos = line_end;

        let line = trim_crlf(&raw[line_start..line_end]);
        if let Some(value) = strip_header_name(line, b"Host") {
            return split_host_port(value, default_port);
        }
    }

    // No Host header: for CONNECT the authority is the url itself
    // (`host:port`); for everything else there's nothing to go on.
    if matches!(method, Method::Connect) {
        split_host_port(url, default_port)
    } else {
        (Vec::new(), default_port)
    }
}

/// `CONNECT`'s authority-form target and `Host` header values share the same
/// `hostname[":" port]` grammar; split on the first `:`.
fn split_host_port(value: &[u8], default_port: u16) -> (Vec<u8>, u16) {
    match memchr(b':', value) {
        Some(colon) => {
            let port = crate::util::slice_to_u16(&value[colon + 1..]).unwrap_or(default_port);
            (value[..colon].to_vec(), port)
        }
        None => (value.to_vec(), default_port),
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(CRLF)
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

/// If `line` is `"{name}: {value}"` (case-sensitive on `name`), returns `value`.
fn strip_header_name<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(name)?;
    rest.strip_prefix(b": ")
}

/// Outcome of [`extract_first_response`]: the raw response bytes and the
/// `Cache-Control: max-age` value to apply if the caller wants to cache it.
pub struct ResponseHead {
    pub max_age: u64,
}

/// Extracts the first complete HTTP response from `buf`.
///
/// Unlike requests, origin sockets are expected to close after exactly one
/// response, so on completion the *entire* buffer is drained and returned —
/// there is no "remainder" to leave behind (§4.1 point 5).
pub fn extract_first_response(
    buf: &mut Vec<u8>,
    chunked: &mut bool,
) -> Result<Extracted<(ResponseHead, Vec<u8>)>, FramingError> {
    let Some(head_end) = find_after(buf, CRLFCRLF) else {
        return Ok(Extracted::Incomplete);
    };

    let mut max_age = 3600u64;
    let mut content_length = 0usize;

    let status_line_end = find_after(buf, CRLF).ok_or(FramingError::MalformedHead)?;
    let mut pos = status_line_end;
    while pos < head_end - CRLF.len() {
        let rel = memchr(b'\n', &buf[pos..head_end]).ok_or(FramingError::MalformedHead)?;
        let line_end = pos + rel + 1;
        let line = trim_crlf(&buf[pos..line_end]);
        pos = line_end;

        if let Some(value) = strip_header_name(line, b"Content-Length") {
            content_length = crate::util::slice_to_usize(value).ok_or(FramingError::MalformedHead)?;
        } else if let Some(value) = strip_header_name(line, b"Cache-Control") {
            if let Some(age) = chunked::parse_max_age(value) {
                max_age = age;
            }
        } else if let Some(value) = strip_header_name(line, b"Transfer-Encoding") {
            if value == b"chunked" {
                *chunked = true;
            }
        }
    }

    let body_start = head_end;
    let complete = if *chunked {
        chunked::is_complete(buf, body_start)?
    } else {
        buf.len() - body_start >= content_length
    };

    if !complete {
        return Ok(Extracted::Incomplete);
    }

    let raw = std::mem::take(buf);
    Ok(Extracted::Complete((ResponseHead { max_age }, raw)))
}
