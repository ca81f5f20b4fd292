//! Request body decoders for the supported transfer encodings.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace};

use crate::error::Parse;

use self::Kind::{Chunked, Length};

/// Decoders to handle different Transfer-Encodings.
///
/// The decoder is a pure state machine over buffered bytes: it consumes
/// what it can and reports [`Progress::Blocked`] when it needs more input,
/// which keeps it independent of the transport and trivially testable.
#[derive(Clone, Debug)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Clone, Debug)]
enum Kind {
    /// Reading a body delimited by `Content-Length`.
    Length(u64),
    /// Reading a `Transfer-Encoding: chunked` body.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        trailers_buf: Option<BytesMut>,
        max_trailer_size: usize,
        max_trailer_count: usize,
    },
}

/// One step of decode progress.
#[derive(Debug)]
pub(crate) enum Progress {
    Frame(BodyFrame),
    /// More input is required before the next frame.
    Blocked,
}

/// A decoded piece of the request body.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    Data(Bytes),
    /// The body is complete. Chunked bodies may carry trailer headers.
    End { trailers: HeaderMap },
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked(max_trailer_size: usize, max_trailer_count: usize) -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                trailers_buf: None,
                max_trailer_size,
                max_trailer_count,
            },
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
        )
    }

    /// Advance the decoder over `buf`, consuming decoded bytes.
    pub(crate) fn poll_frame(&mut self, buf: &mut BytesMut) -> crate::Result<Progress> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Progress::Frame(BodyFrame::End {
                        trailers: HeaderMap::new(),
                    }));
                }
                if buf.is_empty() {
                    return Ok(Progress::Blocked);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Progress::Frame(BodyFrame::Data(buf.split_to(take).freeze())))
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut trailers_buf,
                max_trailer_size,
                max_trailer_count,
            } => {
                loop {
                    if *state == ChunkedState::End {
                        let trailers = parse_trailers(
                            trailers_buf.take(),
                            max_trailer_count,
                        )?;
                        return Ok(Progress::Frame(BodyFrame::End { trailers }));
                    }
                    let mut data = None;
                    *state = match state.step(
                        buf,
                        chunk_len,
                        &mut data,
                        trailers_buf,
                        max_trailer_size,
                    )? {
                        Some(next) => next,
                        None => return Ok(Progress::Blocked),
                    };
                    if let Some(data) = data {
                        return Ok(Progress::Frame(BodyFrame::Data(data)));
                    }
                }
            }
        }
    }

    /// If the already-buffered bytes prove the body is complete, consume
    /// the terminator and return the trailers. Leaves `self` and `buf`
    /// untouched when the next frame is more data or undecidable.
    pub(crate) fn try_finish(&mut self, buf: &mut BytesMut) -> crate::Result<Option<HeaderMap>> {
        if self.is_eof() {
            return match self.poll_frame(buf)? {
                Progress::Frame(BodyFrame::End { trailers }) => Ok(Some(trailers)),
                _ => unreachable!("eof decoder yielded data"),
            };
        }
        let mut probe = self.clone();
        let mut view = BytesMut::from(&buf[..]);
        match probe.poll_frame(&mut view) {
            Ok(Progress::Frame(BodyFrame::End { trailers })) => {
                let consumed = buf.len() - view.len();
                let _ = buf.split_to(consumed);
                *self = probe;
                Ok(Some(trailers))
            }
            Ok(_) => Ok(None),
            // A framing error will resurface on the real decode path.
            Err(_) => Ok(None),
        }
    }
}

macro_rules! next_byte {
    ($buf:expr) => {
        match $buf.first() {
            Some(&b) => {
                let _ = $buf.split_to(1);
                b
            }
            None => return Ok(None),
        }
    };
}

impl ChunkedState {
    /// Drive one state transition, or return `None` when out of input.
    fn step(
        &self,
        buf: &mut BytesMut,
        size: &mut u64,
        data: &mut Option<Bytes>,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> crate::Result<Option<ChunkedState>> {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(buf, size),
            Size => ChunkedState::read_size(buf, size),
            SizeLws => ChunkedState::read_size_lws(buf),
            Extension => ChunkedState::read_extension(buf),
            SizeLf => ChunkedState::read_size_lf(buf, *size),
            Body => ChunkedState::read_body(buf, size, data),
            BodyCr => ChunkedState::expect(buf, b'\r', BodyLf),
            BodyLf => ChunkedState::expect(buf, b'\n', Start),
            EndCr => ChunkedState::read_end_cr(buf, trailers_buf, max_trailer_size),
            EndLf => ChunkedState::expect(buf, b'\n', End),
            Trailer => ChunkedState::read_trailer(buf, trailers_buf, max_trailer_size),
            TrailerLf => ChunkedState::read_trailer_lf(buf, trailers_buf, max_trailer_size),
            End => Ok(Some(End)),
        }
    }

    fn read_start(buf: &mut BytesMut, size: &mut u64) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        match hex_digit(b) {
            Some(d) => {
                *size = d as u64;
                Ok(Some(ChunkedState::Size))
            }
            None => {
                debug!("chunk size line must start with a hex digit");
                Err(crate::Error::new_parse(Parse::Chunk))
            }
        }
    }

    fn read_size(buf: &mut BytesMut, size: &mut u64) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        if let Some(d) = hex_digit(b) {
            *size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(d as u64))
                .ok_or_else(|| crate::Error::new_parse(Parse::Chunk))?;
            return Ok(Some(ChunkedState::Size));
        }
        match b {
            b'\t' | b' ' => Ok(Some(ChunkedState::SizeLws)),
            b';' => Ok(Some(ChunkedState::Extension)),
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            _ => {
                debug!("invalid chunk size byte: {:?}", b);
                Err(crate::Error::new_parse(Parse::Chunk))
            }
        }
    }

    fn read_size_lws(buf: &mut BytesMut) -> crate::Result<Option<ChunkedState>> {
        match next_byte!(buf) {
            b'\t' | b' ' => Ok(Some(ChunkedState::SizeLws)),
            b';' => Ok(Some(ChunkedState::Extension)),
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            _ => Err(crate::Error::new_parse(Parse::Chunk)),
        }
    }

    fn read_extension(buf: &mut BytesMut) -> crate::Result<Option<ChunkedState>> {
        // Extensions are skipped, but a stray newline inside one would
        // desynchronize the framing.
        match next_byte!(buf) {
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            b'\n' => Err(crate::Error::new_parse(Parse::Chunk)),
            _ => Ok(Some(ChunkedState::Extension)),
        }
    }

    fn read_size_lf(buf: &mut BytesMut, size: u64) -> crate::Result<Option<ChunkedState>> {
        match next_byte!(buf) {
            b'\n' if size > 0 => Ok(Some(ChunkedState::Body)),
            b'\n' => Ok(Some(ChunkedState::EndCr)),
            _ => Err(crate::Error::new_parse(Parse::Chunk)),
        }
    }

    fn read_body(
        buf: &mut BytesMut,
        size: &mut u64,
        data: &mut Option<Bytes>,
    ) -> crate::Result<Option<ChunkedState>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let take = std::cmp::min(*size, buf.len() as u64) as usize;
        *size -= take as u64;
        *data = Some(buf.split_to(take).freeze());
        if *size == 0 {
            Ok(Some(ChunkedState::BodyCr))
        } else {
            Ok(Some(ChunkedState::Body))
        }
    }

    fn expect(
        buf: &mut BytesMut,
        expected: u8,
        next: ChunkedState,
    ) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        if b == expected {
            Ok(Some(next))
        } else {
            debug!("expected {:?} in chunk framing, found {:?}", expected as char, b);
            Err(crate::Error::new_parse(Parse::Chunk))
        }
    }

    fn read_end_cr(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        if b == b'\r' {
            return Ok(Some(ChunkedState::EndLf));
        }
        // A trailer field instead of the final CRLF.
        push_trailer_byte(trailers_buf, b, max_trailer_size)?;
        Ok(Some(ChunkedState::Trailer))
    }

    fn read_trailer(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        push_trailer_byte(trailers_buf, b, max_trailer_size)?;
        if b == b'\r' {
            Ok(Some(ChunkedState::TrailerLf))
        } else {
            Ok(Some(ChunkedState::Trailer))
        }
    }

    fn read_trailer_lf(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> crate::Result<Option<ChunkedState>> {
        let b = next_byte!(buf);
        if b != b'\n' {
            return Err(crate::Error::new_parse(Parse::Chunk));
        }
        push_trailer_byte(trailers_buf, b, max_trailer_size)?;
        Ok(Some(ChunkedState::EndCr))
    }
}

fn push_trailer_byte(
    trailers_buf: &mut Option<BytesMut>,
    b: u8,
    max_trailer_size: usize,
) -> crate::Result<()> {
    let buf = trailers_buf.get_or_insert_with(BytesMut::new);
    if buf.len() >= max_trailer_size {
        return Err(crate::Error::new_headers_too_large());
    }
    buf.extend_from_slice(&[b]);
    Ok(())
}

fn parse_trailers(
    trailers_buf: Option<BytesMut>,
    max_trailer_count: usize,
) -> crate::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    let Some(mut raw) = trailers_buf else {
        return Ok(map);
    };
    // parse_headers needs the terminating blank line.
    raw.extend_from_slice(b"\r\n");
    let mut headers = vec![httparse::EMPTY_HEADER; max_trailer_count];
    match httparse::parse_headers(&raw, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            for header in parsed {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| crate::Error::new_parse(Parse::Header))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| crate::Error::new_parse(Parse::Header))?;
                map.append(name, value);
            }
            Ok(map)
        }
        Ok(httparse::Status::Partial) => Err(crate::Error::new_parse(Parse::Chunk)),
        Err(httparse::Error::TooManyHeaders) => Err(crate::Error::new_headers_too_large()),
        Err(_) => Err(crate::Error::new_parse(Parse::Header)),
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
