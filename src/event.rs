//! Protocol events exchanged between server and application.
//!
//! Inbound events arrive through [`Receiver::next`](crate::Receiver::next);
//! outbound events are committed with [`Sender::send`](crate::Sender::send).
//! Each variant is legal only for the scope family it belongs to.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};

/// An inbound protocol event, server to application.
#[derive(Debug)]
pub enum Event {
    /// A chunk of the HTTP request body. `more` is true while further
    /// chunks follow; the body is complete at the first `more == false`.
    HttpRequest {
        body: Bytes,
        more: bool,
    },
    /// The peer is gone (or the body has been fully delivered and the
    /// request is over).
    HttpDisconnect,
    /// A WebSocket handshake is pending the application's accept/close.
    WsConnect,
    /// One complete WebSocket message.
    WsMessage(Message),
    /// The WebSocket conversation ended. Delivered at most once.
    WsDisconnect {
        code: u16,
        reason: String,
    },
    /// An SSE stream is ready for `SseStart`.
    SseConnect,
    /// The SSE peer closed the stream.
    SseDisconnect,
    /// The process is starting; respond with `StartupComplete` or
    /// `StartupFailed`.
    LifespanStartup,
    /// The process is shutting down; respond with `ShutdownComplete` or
    /// `ShutdownFailed`.
    LifespanShutdown,
}

/// An outbound protocol event, application to server.
#[derive(Debug)]
pub enum SendEvent {
    /// Begin the HTTP response. Must be sent exactly once, before any
    /// body event. `trailers` declares that `ResponseTrailers` will follow
    /// the final body chunk.
    ResponseStart {
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
        trailers: bool,
    },
    /// One response body chunk. The response is terminal at the first
    /// `more == false`.
    ResponseBody {
        chunk: BodyChunk,
        more: bool,
    },
    /// Trailer headers; legal only after a `ResponseStart` with
    /// `trailers: true` and after the final body event. May be sent
    /// multiple times with `more: true`; the trailer section is written
    /// once, at the first `more == false`.
    ResponseTrailers {
        headers: Vec<(HeaderName, HeaderValue)>,
        more: bool,
    },
    /// Complete the WebSocket handshake, optionally picking one of the
    /// offered subprotocols and adding response headers.
    WsAccept {
        subprotocol: Option<String>,
        headers: Vec<(HeaderName, HeaderValue)>,
    },
    /// One outbound WebSocket message, written as a single unfragmented
    /// frame.
    WsSend(Message),
    /// Close the WebSocket (or reject the pending handshake).
    WsClose {
        code: u16,
        reason: String,
    },
    /// Begin the SSE stream. The server forces `content-type`,
    /// `cache-control` and `connection` headers appropriate for
    /// `text/event-stream`.
    SseStart {
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
    },
    /// One server-sent event.
    SseSend(SseMessage),
    /// Startup finished successfully.
    StartupComplete,
    /// Startup failed; the worker logs the message and exits nonzero.
    StartupFailed {
        message: String,
    },
    /// Shutdown finished successfully.
    ShutdownComplete,
    /// Shutdown failed; the message is logged.
    ShutdownFailed {
        message: String,
    },
}

impl SendEvent {
    /// A `ResponseStart` without trailers.
    pub fn response_start(
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
    ) -> SendEvent {
        SendEvent::ResponseStart {
            status,
            headers,
            trailers: false,
        }
    }

    /// A terminal `ResponseBody` carrying the whole body.
    pub fn response_body(body: impl Into<Bytes>) -> SendEvent {
        SendEvent::ResponseBody {
            chunk: BodyChunk::Data(body.into()),
            more: false,
        }
    }

    /// A normal close with code 1000 and no reason.
    pub fn ws_close() -> SendEvent {
        SendEvent::WsClose {
            code: 1000,
            reason: String::new(),
        }
    }
}

/// The payload source for one `ResponseBody` event.
///
/// Exactly one source per event, by construction.
pub enum BodyChunk {
    /// In-memory bytes.
    Data(Bytes),
    /// A file the server opens and streams.
    File {
        path: PathBuf,
        /// Byte offset to start from.
        offset: u64,
        /// Bytes to send; `None` streams to EOF.
        length: Option<u64>,
    },
    /// An already-open file handle the server reads from.
    Handle {
        file: std::fs::File,
        /// Byte offset to seek to; `None` reads from the current position.
        offset: Option<u64>,
        /// Bytes to send; `None` streams to EOF.
        length: Option<u64>,
    },
}

impl BodyChunk {
    /// A whole-file chunk streaming from the beginning to EOF.
    pub fn file(path: impl Into<PathBuf>) -> BodyChunk {
        BodyChunk::File {
            path: path.into(),
            offset: 0,
            length: None,
        }
    }

    /// A file range chunk.
    pub fn file_range(path: impl Into<PathBuf>, offset: u64, length: u64) -> BodyChunk {
        BodyChunk::File {
            path: path.into(),
            offset,
            length: Some(length),
        }
    }
}

impl fmt::Debug for BodyChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyChunk::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            BodyChunk::File {
                path,
                offset,
                length,
            } => f
                .debug_struct("File")
                .field("path", path)
                .field("offset", offset)
                .field("length", length)
                .finish(),
            BodyChunk::Handle { offset, length, .. } => f
                .debug_struct("Handle")
                .field("offset", offset)
                .field("length", length)
                .finish(),
        }
    }
}

/// A WebSocket message payload: text or binary, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Message {
        Message::Text(text.into())
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Message {
        Message::Binary(bytes.into())
    }
}

/// One server-sent event, serialized as `event:`/`id:`/`retry:`/`data:`
/// lines followed by a blank line. Multi-line `data` is split across
/// repeated `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    /// The `data` field. `None` sends an event with no data lines.
    pub data: Option<String>,
    /// The `event` (type) field.
    pub event: Option<String>,
    /// The `id` field.
    pub id: Option<String>,
    /// The `retry` field, in milliseconds.
    pub retry: Option<u64>,
}

impl SseMessage {
    /// An event carrying only data.
    pub fn data(data: impl Into<String>) -> SseMessage {
        SseMessage {
            data: Some(data.into()),
            ..SseMessage::default()
        }
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }
}
