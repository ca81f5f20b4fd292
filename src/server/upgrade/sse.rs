//! Server-Sent Events stream framing.

use bytes::{BufMut, BytesMut};
use http::{HeaderName, HeaderValue};

use crate::event::SseMessage;

/// Serialize one event: optional `event:`, `id:`, `retry:` fields, then
/// `data:` lines (one per embedded newline), then the blank terminator.
pub(crate) fn serialize_event(message: &SseMessage, dst: &mut BytesMut) {
    let mut field = |name: &[u8], value: &[u8]| {
        dst.put_slice(name);
        dst.put_slice(b": ");
        dst.put_slice(value);
        dst.put_u8(b'\n');
    };

    if let Some(event) = &message.event {
        field(b"event", event.as_bytes());
    }
    if let Some(id) = &message.id {
        field(b"id", id.as_bytes());
    }
    if let Some(retry) = message.retry {
        let mut buf = itoa::Buffer::new();
        field(b"retry", buf.format(retry).as_bytes());
    }
    if let Some(data) = &message.data {
        for line in data.split('\n') {
            field(b"data", line.as_bytes());
        }
    }
    dst.put_u8(b'\n');
}

/// A keep-alive comment line.
pub(crate) fn serialize_keepalive(dst: &mut BytesMut) {
    dst.put_slice(b":keepalive\n\n");
}

/// The response headers for the stream head: the application's own, with
/// the `text/event-stream` essentials forced in when absent.
pub(crate) fn stream_headers(
    mut headers: Vec<(HeaderName, HeaderValue)>,
) -> Vec<(HeaderName, HeaderValue)> {
    force_header(
        &mut headers,
        http::header::CONTENT_TYPE,
        "text/event-stream",
    );
    force_header(&mut headers, http::header::CACHE_CONTROL, "no-cache");
    force_header(&mut headers, http::header::CONNECTION, "keep-alive");
    headers
}

fn force_header(
    headers: &mut Vec<(HeaderName, HeaderValue)>,
    name: HeaderName,
    value: &'static str,
) {
    match headers.iter_mut().find(|(n, _)| *n == name) {
        Some((_, existing)) => *existing = HeaderValue::from_static(value),
        None => headers.push((name, HeaderValue::from_static(value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized(message: &SseMessage) -> String {
        let mut dst = BytesMut::new();
        serialize_event(message, &mut dst);
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn data_only() {
        assert_eq!(serialized(&SseMessage::data("ping")), "data: ping\n\n");
    }

    #[test]
    fn multiline_data_splits() {
        assert_eq!(
            serialized(&SseMessage::data("line one\nline two")),
            "data: line one\ndata: line two\n\n"
        );
    }

    #[test]
    fn all_fields_ordered() {
        let message = SseMessage::data("x").event("update").id("42").retry(1500);
        assert_eq!(
            serialized(&message),
            "event: update\nid: 42\nretry: 1500\ndata: x\n\n"
        );
    }

    #[test]
    fn empty_message_is_blank_line() {
        assert_eq!(serialized(&SseMessage::default()), "\n");
    }

    #[test]
    fn keepalive_comment() {
        let mut dst = BytesMut::new();
        serialize_keepalive(&mut dst);
        assert_eq!(&dst[..], b":keepalive\n\n");
    }

    #[test]
    fn forced_headers_added_and_overridden() {
        let headers = stream_headers(vec![(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )]);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].1, "text/event-stream");
        assert!(headers
            .iter()
            .any(|(n, v)| *n == http::header::CACHE_CONTROL && v == "no-cache"));
        assert!(headers
            .iter()
            .any(|(n, v)| *n == http::header::CONNECTION && v == "keep-alive"));
    }
}
