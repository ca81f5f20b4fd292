//! The per-conversation envelope handed to applications.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::{HeaderMap, Method, Version};

/// Immutable metadata describing one conversation.
///
/// Produced by the server before the application is invoked; the
/// discriminant tells the application which event family the paired
/// [`Receiver`](crate::Receiver) and [`Sender`](crate::Sender) speak.
#[derive(Debug, Clone)]
pub enum Scope {
    /// A plain HTTP request/response cycle.
    Http(HttpScope),
    /// A WebSocket upgrade request.
    Websocket(WsScope),
    /// A Server-Sent Events stream request.
    Sse(SseScope),
    /// The once-per-process startup/shutdown conversation.
    Lifespan(LifespanScope),
}

/// The URL scheme the conversation was accepted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        })
    }
}

/// Scope for an HTTP conversation.
#[derive(Debug, Clone)]
pub struct HttpScope {
    /// Request method.
    pub method: Method,
    /// Percent-decoded request path.
    pub path: String,
    /// The byte-exact path as it appeared on the wire, before the `?`.
    pub raw_path: Bytes,
    /// Bytes after the first `?`, without the `?` itself.
    pub query_string: Bytes,
    /// `http` or `https`.
    pub scheme: Scheme,
    /// Negotiated HTTP version.
    pub http_version: Version,
    /// Request headers, names lowercased, insertion order and duplicates
    /// preserved. Never empty-initialized to anything but a map.
    pub headers: HeaderMap,
    /// Peer address.
    pub client: SocketAddr,
    /// Local address the connection was accepted on.
    pub server: SocketAddr,
    /// Request trailers, populated once the final body chunk has been
    /// consumed (chunked requests only).
    pub trailers: Trailers,
}

/// Scope for a WebSocket conversation.
#[derive(Debug, Clone)]
pub struct WsScope {
    /// Percent-decoded request path.
    pub path: String,
    /// The byte-exact path as it appeared on the wire, before the `?`.
    pub raw_path: Bytes,
    /// Bytes after the first `?`, without the `?` itself.
    pub query_string: Bytes,
    /// `ws` or `wss`.
    pub scheme: Scheme,
    /// Version of the upgrade request.
    pub http_version: Version,
    /// Upgrade request headers.
    pub headers: HeaderMap,
    /// Peer address.
    pub client: SocketAddr,
    /// Local address the connection was accepted on.
    pub server: SocketAddr,
    /// Offered subprotocols from `Sec-WebSocket-Protocol`, in order.
    pub subprotocols: Vec<String>,
}

/// Scope for a Server-Sent Events conversation.
#[derive(Debug, Clone)]
pub struct SseScope {
    /// Percent-decoded request path.
    pub path: String,
    /// The byte-exact path as it appeared on the wire, before the `?`.
    pub raw_path: Bytes,
    /// Bytes after the first `?`, without the `?` itself.
    pub query_string: Bytes,
    /// `http` or `https`.
    pub scheme: Scheme,
    /// Version of the initiating request.
    pub http_version: Version,
    /// Request headers.
    pub headers: HeaderMap,
    /// Peer address.
    pub client: SocketAddr,
    /// Local address the connection was accepted on.
    pub server: SocketAddr,
}

/// Scope for the lifespan conversation. Carries no connection metadata.
#[derive(Debug, Clone, Default)]
pub struct LifespanScope {
    _priv: (),
}

impl LifespanScope {
    pub(crate) fn new() -> LifespanScope {
        LifespanScope { _priv: () }
    }
}

/// Request trailer headers, set at most once when the final chunk of a
/// chunked request body has been read.
///
/// The scope itself is immutable, so late-arriving trailers are exposed
/// through this shared cell instead of an in-place header append.
#[derive(Clone, Default)]
pub struct Trailers {
    cell: Arc<OnceLock<HeaderMap>>,
}

impl Trailers {
    pub(crate) fn new() -> Trailers {
        Trailers::default()
    }

    /// The trailer headers, if the request declared and finished a chunked
    /// body carrying any.
    pub fn get(&self) -> Option<&HeaderMap> {
        self.cell.get()
    }

    pub(crate) fn set(&self, headers: HeaderMap) {
        let _ = self.cell.set(headers);
    }
}

impl fmt::Debug for Trailers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(map) => f.debug_tuple("Trailers").field(map).finish(),
            None => f.write_str("Trailers(<pending>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailers_set_once() {
        let trailers = Trailers::new();
        assert!(trailers.get().is_none());

        let mut map = HeaderMap::new();
        map.insert("x-checksum", "abc".parse().unwrap());
        trailers.set(map);
        assert_eq!(trailers.get().unwrap()["x-checksum"], "abc");

        // A second set is ignored.
        trailers.set(HeaderMap::new());
        assert_eq!(trailers.get().unwrap().len(), 1);
    }

    #[test]
    fn scheme_display() {
        assert_eq!(Scheme::Http.to_string(), "http");
        assert_eq!(Scheme::Wss.to_string(), "wss");
    }
}
