//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have `pagi` `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving PAGI conversations.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A malformed request line, header block, or chunked framing.
    Parse(Parse),
    /// A request exceeded a configured size limit.
    TooLarge(TooLarge),
    /// The per-request idle timeout expired.
    Timeout,
    /// The application used the send/receive contract out of order.
    InvalidState,
    /// The peer (or the server itself) closed the connection.
    Closed,
    /// The application returned an error or panicked.
    App,
    /// An `io::Error` on the socket or on a streamed file.
    Io,
    /// Error creating or binding the listener.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// The lifespan conversation reported startup or shutdown failure.
    Lifespan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    RequestLine,
    Uri,
    Header,
    Version,
    /// Conflicting or invalid body framing headers.
    Framing,
    /// Invalid chunk size line or chunk terminator.
    Chunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TooLarge {
    /// Header block over `max_header_size` (431).
    Headers,
    /// Request body over `max_body_size` (413).
    Body,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_headers_too_large() -> Error {
        Error::new(Kind::TooLarge(TooLarge::Headers))
    }

    pub(crate) fn new_body_too_large() -> Error {
        Error::new(Kind::TooLarge(TooLarge::Body))
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_invalid_state(msg: &'static str) -> Error {
        Error::new(Kind::InvalidState).with(msg)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_app<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::App).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        // A peer reset is a disconnect, not an I/O fault of ours.
        match cause.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Error::new(Kind::Closed).with(cause),
            _ => Error::new(Kind::Io).with(cause),
        }
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    #[allow(unused)]
    pub(crate) fn new_accept(cause: std::io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_lifespan(message: String) -> Error {
        Error::new(Kind::Lifespan).with(message)
    }

    /// The status to synthesize on the wire for this error, when a response
    /// is still legal at the point the error surfaced.
    pub(crate) fn response_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::TooLarge(TooLarge::Headers) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Kind::TooLarge(TooLarge::Body) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            _ => None,
        }
    }

    /// Returns true if this was caused by a malformed request.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if a request exceeded a configured size limit.
    pub fn is_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::TooLarge(_))
    }

    /// Returns true if the per-request idle timeout expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the application violated the event ordering contract.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }

    /// Returns true if the conversation's connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if the application itself failed.
    pub fn is_app(&self) -> bool {
        matches!(self.inner.kind, Kind::App)
    }

    /// Returns true if this was an I/O error on the socket or a file.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the lifespan conversation failed.
    pub fn is_lifespan(&self) -> bool {
        matches!(self.inner.kind, Kind::Lifespan)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::RequestLine) => "invalid request line",
            Kind::Parse(Parse::Uri) => "invalid request target",
            Kind::Parse(Parse::Header) => "invalid header",
            Kind::Parse(Parse::Version) => "unsupported HTTP version",
            Kind::Parse(Parse::Framing) => "invalid body framing",
            Kind::Parse(Parse::Chunk) => "invalid chunked encoding",
            Kind::TooLarge(TooLarge::Headers) => "request header block too large",
            Kind::TooLarge(TooLarge::Body) => "request body too large",
            Kind::Timeout => "request timed out",
            Kind::InvalidState => "event sent in invalid state",
            Kind::Closed => "connection closed",
            Kind::App => "application error",
            Kind::Io => "connection I/O error",
            Kind::Listen => "error binding listener",
            Kind::Accept => "error accepting connection",
            Kind::Lifespan => "lifespan failure",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("pagi::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}
