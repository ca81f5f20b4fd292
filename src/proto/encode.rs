//! Response body encoders and head serialization.

use std::fmt::{self, Write};

use bytes::{BufMut, BytesMut};
use http::{HeaderName, HeaderValue, StatusCode, Version};
use tracing::trace;

/// Encoders to handle different Transfer-Encodings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq, Clone)]
enum Kind {
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// A declared `Content-Length`.
    ///
    /// Enforces that the body matches the declared length exactly.
    Length(u64),
    /// Neither length nor chunked: the body runs until the connection
    /// closes. Used for HTTP/1.0 peers and SSE streams.
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Kind::CloseDelimited)
    }

    /// Frame one body chunk into `dst`.
    pub(crate) fn encode(&mut self, data: &[u8], dst: &mut BytesMut) -> crate::Result<()> {
        if data.is_empty() {
            // An empty chunk would read as the chunked terminator.
            return Ok(());
        }
        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", data.len());
                let mut size = ChunkSize::new(data.len());
                dst.reserve(size.len() + data.len() + 2);
                dst.put_slice(size.as_slice());
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
                Ok(())
            }
            Kind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", data.len());
                if data.len() as u64 > *remaining {
                    return Err(crate::Error::new_invalid_state(
                        "body longer than declared content-length",
                    ));
                }
                *remaining -= data.len() as u64;
                dst.put_slice(data);
                Ok(())
            }
            Kind::CloseDelimited => {
                trace!("close delimited write {}B", data.len());
                dst.put_slice(data);
                Ok(())
            }
        }
    }

    /// Terminate the body. Chunked bodies emit the zero-length chunk and,
    /// when present, the trailer section.
    pub(crate) fn end(
        &mut self,
        trailers: Option<&[(HeaderName, HeaderValue)]>,
        dst: &mut BytesMut,
    ) -> crate::Result<()> {
        match self.kind {
            Kind::Chunked => {
                dst.put_slice(b"0\r\n");
                if let Some(trailers) = trailers {
                    for (name, value) in trailers {
                        dst.put_slice(name.as_str().as_bytes());
                        dst.put_slice(b": ");
                        dst.put_slice(value.as_bytes());
                        dst.put_slice(b"\r\n");
                    }
                }
                dst.put_slice(b"\r\n");
                Ok(())
            }
            Kind::Length(0) => Ok(()),
            Kind::Length(_) => Err(crate::Error::new_invalid_state(
                "body ended short of declared content-length",
            )),
            Kind::CloseDelimited => Ok(()),
        }
    }
}

/// Serialize a response head.
///
/// Writes `<version> <status> <reason>\r\n`, the given headers verbatim
/// and in order, then the blank line.
pub(crate) fn encode_head(
    dst: &mut BytesMut,
    version: Version,
    status: StatusCode,
    headers: &[(HeaderName, HeaderValue)],
) {
    const AVERAGE_HEADER_SIZE: usize = 30;
    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);

    if version == Version::HTTP_10 {
        dst.put_slice(b"HTTP/1.0 ");
    } else {
        dst.put_slice(b"HTTP/1.1 ");
    }
    let mut status_buf = itoa::Buffer::new();
    dst.put_slice(status_buf.format(status.as_u16()).as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");

    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

/// A minimal synthesized response: status line, `connection: close`, and
/// a one-line plain-text body naming the status.
pub(crate) fn encode_minimal_response(dst: &mut BytesMut, status: StatusCode) {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body_len = reason.len() + 1;
    let mut len_buf = itoa::Buffer::new();
    let headers = [
        (
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        ),
        (
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(len_buf.format(body_len)).expect("integer header value"),
        ),
        (http::header::CONNECTION, HeaderValue::from_static("close")),
    ];
    encode_head(dst, Version::HTTP_11, status, &headers);
    dst.put_slice(reason.as_bytes());
    dst.put_slice(b"\n");
}

/// The `<hex-size>\r\n` prefix of one chunk, formatted without allocating.
struct ChunkSize {
    bytes: [u8; 18],
    len: usize,
}

impl ChunkSize {
    fn new(len: usize) -> ChunkSize {
        let mut size = ChunkSize {
            bytes: [0; 18],
            len: 0,
        };
        write!(&mut size, "{:X}\r\n", len).expect("chunk size fits buffer");
        size
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Write for ChunkSize {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.bytes.len() - self.len;
        if s.len() > remaining {
            return Err(fmt::Error);
        }
        self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}
