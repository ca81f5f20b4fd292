//! HTTP/1.x request head parsing.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tracing::{debug, trace};

use crate::error::Parse;

/// Caps applied while reading a request head.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParseLimits {
    pub(crate) max_header_size: usize,
    pub(crate) max_header_count: usize,
}

/// A fully parsed request head, plus everything the connection needs to
/// know that was derived from it.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// Byte-exact request target before the `?`.
    pub(crate) raw_path: Bytes,
    /// Percent-decoded path.
    pub(crate) path: String,
    /// Bytes after the first `?`, excluding the `?`.
    pub(crate) query: Bytes,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    pub(crate) expect_continue: bool,
    pub(crate) framing: BodyFraming,
    pub(crate) upgrade: UpgradeRequest,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// What kind of conversation the head asks for.
#[derive(Debug)]
pub(crate) enum UpgradeRequest {
    None,
    Websocket {
        /// `Sec-WebSocket-Key`, when present exactly once.
        key: Option<String>,
        /// True only for `Sec-WebSocket-Version: 13`.
        version_ok: bool,
        subprotocols: Vec<String>,
    },
    Sse,
}

const MAX_URI_LEN: usize = 8192;

/// Try to parse one request head out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the head's
/// bytes are consumed from `buf`; the remainder is body (and possibly the
/// next pipelined request).
pub(crate) fn parse_head(
    buf: &mut BytesMut,
    limits: &ParseLimits,
) -> crate::Result<Option<RequestHead>> {
    consume_leading_lines(buf);
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_header_count];
    let mut req = httparse::Request::new(&mut headers);
    trace!("parse_head([Header; {}], [u8; {}])", limits.max_header_count, buf.len());

    let (head_len, method, target, version, header_count) = match req.parse(buf.as_ref()) {
        Ok(httparse::Status::Complete(len)) => {
            trace!("parse_head complete, {} bytes", len);
            if len > limits.max_header_size {
                return Err(crate::Error::new_headers_too_large());
            }
            let method = Method::from_bytes(req.method.unwrap().as_bytes())
                .map_err(|_| crate::Error::new_parse(Parse::RequestLine))?;
            let target = req.path.unwrap();
            if target.len() > MAX_URI_LEN {
                return Err(crate::Error::new_parse(Parse::Uri));
            }
            let version = match req.version.unwrap() {
                0 => Version::HTTP_10,
                1 => Version::HTTP_11,
                _ => return Err(crate::Error::new_parse(Parse::Version)),
            };
            let bytes_ptr = buf.as_ref().as_ptr() as usize;
            let target_start = target.as_ptr() as usize - bytes_ptr;
            let target_end = target_start + target.len();
            (len, method, (target_start, target_end), version, req.headers.len())
        }
        Ok(httparse::Status::Partial) => {
            return if buf.len() > limits.max_header_size {
                Err(crate::Error::new_headers_too_large())
            } else {
                Ok(None)
            };
        }
        Err(httparse::Error::TooManyHeaders) => {
            return Err(crate::Error::new_parse(Parse::Header));
        }
        Err(httparse::Error::Version) => {
            return Err(crate::Error::new_parse(Parse::Version));
        }
        Err(httparse::Error::HeaderName) | Err(httparse::Error::HeaderValue) => {
            return Err(crate::Error::new_parse(Parse::Header));
        }
        Err(e) => {
            debug!("request line parse error: {}", e);
            return Err(crate::Error::new_parse(Parse::RequestLine));
        }
    };

    let mut header_indices = vec![HeaderIndices::default(); header_count];
    record_header_indices(buf.as_ref(), &req.headers[..header_count], &mut header_indices);

    let slice = buf.split_to(head_len).freeze();

    let target = slice.slice(target.0..target.1);
    let (raw_path, query) = match target.iter().position(|&b| b == b'?') {
        Some(i) => (target.slice(..i), target.slice(i + 1..)),
        None => (target.clone(), Bytes::new()),
    };
    let path = percent_decode(&raw_path).ok_or_else(|| crate::Error::new_parse(Parse::Uri))?;

    let mut head_headers = HeaderMap::with_capacity(header_count);
    for indices in &header_indices {
        let name = HeaderName::from_bytes(&slice[indices.name.0..indices.name.1])
            .map_err(|_| crate::Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_maybe_shared(slice.slice(indices.value.0..indices.value.1))
            .map_err(|_| crate::Error::new_parse(Parse::Header))?;
        head_headers.append(name, value);
    }

    let framing = body_framing(&head_headers, version)?;
    let keep_alive = wants_keep_alive(&head_headers, version);
    let expect_continue = version == Version::HTTP_11
        && header_eq_ignore_case(&head_headers, http::header::EXPECT, b"100-continue");
    let upgrade = detect_upgrade(&head_headers);

    Ok(Some(RequestHead {
        method,
        raw_path,
        path,
        query,
        version,
        headers: head_headers,
        keep_alive,
        expect_continue,
        framing,
        upgrade,
    }))
}

#[derive(Debug, Clone, Copy, Default)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

fn record_header_indices(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    indices: &mut [HeaderIndices],
) {
    let bytes_ptr = bytes.as_ptr() as usize;
    for (header, indices) in headers.iter().zip(indices.iter_mut()) {
        let name_start = header.name.as_ptr() as usize - bytes_ptr;
        let name_end = name_start + header.name.len();
        indices.name = (name_start, name_end);
        let value_start = header.value.as_ptr() as usize - bytes_ptr;
        let value_end = value_start + header.value.len();
        indices.value = (value_start, value_end);
    }
}

fn consume_leading_lines(buf: &mut BytesMut) {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\r' | b'\n' => i += 1,
            _ => break,
        }
    }
    if i > 0 {
        let _ = buf.split_to(i);
    }
}

/// Strict percent-decoding of a path: an invalid or truncated triplet, or
/// a decode that is not UTF-8, is a malformed request.
pub(crate) fn percent_decode(raw: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hi = hex_val(*raw.get(i + 1)?)?;
                let lo = hex_val(*raw.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// RFC 7230 §3.3.3 for requests: chunked wins, then content-length, then
/// no body. Conflicting or unparseable framing is a hard 400.
fn body_framing(headers: &HeaderMap, version: Version) -> crate::Result<BodyFraming> {
    let te_chunked = {
        let mut values = headers.get_all(http::header::TRANSFER_ENCODING).iter();
        match values.next() {
            None => false,
            Some(value) => {
                if version == Version::HTTP_10 {
                    debug!("HTTP/1.0 request with transfer-encoding");
                    return Err(crate::Error::new_parse(Parse::Framing));
                }
                // chunked must be the final (and only supported) coding
                let mut last = value;
                for v in values {
                    last = v;
                }
                let ok = last
                    .as_bytes()
                    .rsplit(|&b| b == b',')
                    .next()
                    .map(|tok| trim(tok).eq_ignore_ascii_case(b"chunked"))
                    .unwrap_or(false);
                if !ok {
                    debug!("transfer-encoding without final chunked");
                    return Err(crate::Error::new_parse(Parse::Framing));
                }
                true
            }
        }
    };

    let content_length = {
        let mut found: Option<u64> = None;
        for value in headers.get_all(http::header::CONTENT_LENGTH) {
            let parsed = std::str::from_utf8(value.as_bytes())
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| crate::Error::new_parse(Parse::Framing))?;
            match found {
                Some(prev) if prev != parsed => {
                    debug!("conflicting content-length headers");
                    return Err(crate::Error::new_parse(Parse::Framing));
                }
                _ => found = Some(parsed),
            }
        }
        found
    };

    match (te_chunked, content_length) {
        (true, Some(_)) => {
            debug!("both transfer-encoding and content-length");
            Err(crate::Error::new_parse(Parse::Framing))
        }
        (true, None) => Ok(BodyFraming::Chunked),
        (false, Some(0)) | (false, None) => Ok(BodyFraming::Empty),
        (false, Some(len)) => Ok(BodyFraming::Length(len)),
    }
}

fn wants_keep_alive(headers: &HeaderMap, version: Version) -> bool {
    match version {
        Version::HTTP_11 => !connection_has_token(headers, b"close"),
        _ => connection_has_token(headers, b"keep-alive"),
    }
}

fn connection_has_token(headers: &HeaderMap, token: &[u8]) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .any(|value| {
            value
                .as_bytes()
                .split(|&b| b == b',')
                .any(|tok| trim(tok).eq_ignore_ascii_case(token))
        })
}

fn header_eq_ignore_case(headers: &HeaderMap, name: http::header::HeaderName, value: &[u8]) -> bool {
    headers
        .get(name)
        .map(|v| trim(v.as_bytes()).eq_ignore_ascii_case(value))
        .unwrap_or(false)
}

fn detect_upgrade(headers: &HeaderMap) -> UpgradeRequest {
    let is_upgrade = connection_has_token(headers, b"upgrade")
        && headers
            .get(http::header::UPGRADE)
            .map(|v| trim(v.as_bytes()).eq_ignore_ascii_case(b"websocket"))
            .unwrap_or(false);
    if is_upgrade {
        let mut keys = headers.get_all(http::header::SEC_WEBSOCKET_KEY).iter();
        let key = match (keys.next(), keys.next()) {
            (Some(k), None) => std::str::from_utf8(k.as_bytes())
                .ok()
                .map(|s| s.trim().to_owned()),
            _ => None,
        };
        let version_ok = header_eq_ignore_case(headers, http::header::SEC_WEBSOCKET_VERSION, b"13");
        let subprotocols = headers
            .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .flat_map(|v| v.as_bytes().split(|&b| b == b','))
            .filter_map(|tok| std::str::from_utf8(trim(tok)).ok())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        return UpgradeRequest::Websocket {
            key,
            version_ok,
            subprotocols,
        };
    }

    let wants_sse = headers
        .get_all(http::header::ACCEPT)
        .iter()
        .any(|v| contains_ignore_case(v.as_bytes(), b"text/event-stream"));
    if wants_sse {
        UpgradeRequest::Sse
    } else {
        UpgradeRequest::None
    }
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParseLimits {
        ParseLimits {
            max_header_size: 16_384,
            max_header_count: 100,
        }
    }

    fn parse(raw: &[u8]) -> crate::Result<Option<RequestHead>> {
        let mut buf = BytesMut::from(raw);
        parse_head(&mut buf, &limits())
    }

    #[test]
    fn parses_simple_get() {
        let head = parse(b"GET /a/b?x=1&y=2 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(&head.raw_path[..], b"/a/b");
        assert_eq!(head.path, "/a/b");
        assert_eq!(&head.query[..], b"x=1&y=2");
        assert_eq!(head.version, Version::HTTP_11);
        assert!(head.keep_alive);
        assert_eq!(head.framing, BodyFraming::Empty);
        assert_eq!(head.headers["host"], "example.com");
    }

    #[test]
    fn partial_returns_none_and_consumes_nothing() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: exa"[..]);
        assert!(parse_head(&mut buf, &limits()).unwrap().is_none());
        assert_eq!(buf.len(), 25);
    }

    #[test]
    fn consumes_leading_crlf() {
        let head = parse(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.path, "/");
    }

    #[test]
    fn percent_decodes_path() {
        let head = parse(b"GET /hello%20world%2Fx HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.path, "/hello world/x");
        assert_eq!(&head.raw_path[..], b"/hello%20world%2Fx");
    }

    #[test]
    fn invalid_percent_triplet_is_bad_request() {
        let err = parse(b"GET /bad%zz HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
        let err = parse(b"GET /truncated%a HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn duplicate_headers_preserved_in_order() {
        let head = parse(b"GET / HTTP/1.1\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n")
            .unwrap()
            .unwrap();
        let values: Vec<_> = head.headers.get_all("x-tag").iter().collect();
        assert_eq!(values, ["one", "two"]);
    }

    #[test]
    fn header_block_over_cap_is_431() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(b"X-Fill: ");
        raw.extend(std::iter::repeat(b'a').take(20_000));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = parse(&raw).unwrap_err();
        assert!(err.is_too_large());
    }

    #[test]
    fn header_block_exactly_at_cap_succeeds() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        let so_far = raw.len();
        let cap = 16_384;
        raw.extend(std::iter::repeat(b'a').take(cap - so_far - 4));
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(raw.len(), cap);
        assert!(parse(&raw).unwrap().is_some());

        // One byte more fails.
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(cap - so_far - 3));
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(raw.len(), cap + 1);
        assert!(parse(&raw).unwrap_err().is_too_large());
    }

    #[test]
    fn too_many_headers_is_400() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            raw.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = parse(&raw).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_framing() {
        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.framing, BodyFraming::Chunked);
    }

    #[test]
    fn conflicting_framing_is_400() {
        let err = parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn differing_content_lengths_are_400() {
        let err = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn http10_defaults_to_close() {
        let head = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!head.keep_alive);
        let head = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn connection_close_honored_on_11() {
        let head = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn expect_continue_detected() {
        let head = parse(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.expect_continue);
    }

    #[test]
    fn websocket_upgrade_detected() {
        let head = parse(
            b"GET /chat HTTP/1.1\r\n\
              Connection: keep-alive, Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Protocol: chat, superchat\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        match head.upgrade {
            UpgradeRequest::Websocket {
                key,
                version_ok,
                subprotocols,
            } => {
                assert_eq!(key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
                assert!(version_ok);
                assert_eq!(subprotocols, ["chat", "superchat"]);
            }
            other => panic!("expected websocket upgrade, got {:?}", other),
        }
    }

    #[test]
    fn sse_detected_from_accept() {
        let head = parse(b"GET /live HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(matches!(head.upgrade, UpgradeRequest::Sse));
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let head = parse(b"GET / HTTP/1.1\r\nAccept: text/html\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(matches!(head.upgrade, UpgradeRequest::None));
    }
}
