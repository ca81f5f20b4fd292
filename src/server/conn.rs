//! The per-connection HTTP/1.x state machine.
//!
//! A [`Conn`] owns the stream exclusively and runs zero or more
//! request/response cycles over it until the peer goes away, a timeout
//! expires, or an upgrade hands the stream to the WebSocket or SSE
//! driver. The conversation driver in `dispatch` calls into it; it never
//! calls out.

use std::mem;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Config;
use crate::event::{BodyChunk, Event};
use crate::proto::{
    encode, parse, BodyFrame, BodyFraming, Decoder, Encoder, ParseLimits, Progress, RequestHead,
};
use crate::scope::Trailers;
use crate::server::io::Buffered;

/// Bytes of a streamed file read per write cycle.
const FILE_CHUNK_SIZE: usize = 65_536;

pub(crate) struct Conn<T> {
    io: Buffered<T>,
    timeout: Duration,
    deadline: Instant,
    parse_limits: ParseLimits,
    max_body_size: u64,
    state: State,
}

struct State {
    version: Version,
    keep_alive: bool,
    head_request: bool,
    expect_continue: bool,
    continue_sent: bool,
    expects_trailers: bool,
    bytes_seen: u64,
    status: Option<StatusCode>,
    trailers_cell: Option<Trailers>,
    reading: Reading,
    writing: Writing,
}

enum Reading {
    Init,
    Body(Decoder),
    KeepAlive,
    Closed,
}

enum Writing {
    Init,
    /// `ResponseStart` accepted; head bytes are not serialized until the
    /// first body event fixes the framing.
    Head(PendingHead),
    /// Body streaming. `None` suppresses payload bytes (HEAD).
    Body(Option<Encoder>),
    /// Final body event seen with trailers declared; accumulating
    /// trailer headers until the terminal trailer event.
    Trailers(Option<Encoder>, Vec<(HeaderName, HeaderValue)>),
    Ended,
    Closed,
}

struct PendingHead {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    trailers: bool,
}

/// What the first body event looks like, for picking the encoding.
enum BodyHint {
    Data { len: u64, terminal: bool },
    Stream,
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T, config: &Config) -> Conn<T> {
        let max_read_buf = config
            .max_receive_queue
            .max(config.max_header_size.saturating_add(1));
        Conn {
            io: Buffered::new(io, max_read_buf),
            timeout: config.timeout,
            deadline: Instant::now() + config.timeout,
            parse_limits: ParseLimits {
                max_header_size: config.max_header_size,
                max_header_count: config.max_header_count,
            },
            max_body_size: config.max_body_size,
            state: State {
                version: Version::HTTP_11,
                keep_alive: true,
                head_request: false,
                expect_continue: false,
                continue_sent: false,
                expects_trailers: false,
                bytes_seen: 0,
                status: None,
                trailers_cell: None,
                reading: Reading::Init,
                writing: Writing::Init,
            },
        }
    }

    pub(crate) fn io_mut(&mut self) -> &mut Buffered<T> {
        &mut self.io
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn bump_deadline(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.state.keep_alive
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.state.keep_alive &= keep_alive;
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.state.status
    }

    /// True once response head bytes have been serialized toward the wire.
    pub(crate) fn wire_started(&self) -> bool {
        matches!(
            self.state.writing,
            Writing::Body(_) | Writing::Trailers(..) | Writing::Ended
        )
    }

    /// True once the application has issued `ResponseStart`, whether or
    /// not head bytes have been serialized yet.
    pub(crate) fn response_started(&self) -> bool {
        !matches!(self.state.writing, Writing::Init)
    }

    pub(crate) fn response_complete(&self) -> bool {
        matches!(self.state.writing, Writing::Ended)
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state.reading = Reading::Closed;
        self.state.writing = Writing::Closed;
        self.state.keep_alive = false;
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state.writing, Writing::Closed)
    }

    /// Read into the buffer, bounded by the rolling idle deadline.
    pub(crate) async fn fill_read(&mut self) -> crate::Result<usize> {
        let fut = self.io.fill_read_buf();
        match tokio::time::timeout_at(self.deadline, fut).await {
            Err(_) => Err(crate::Error::new_timeout()),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(crate::Error::new_io(e))
            }
            Ok(Ok(n)) => {
                if n > 0 {
                    self.bump_deadline();
                }
                Ok(n)
            }
        }
    }

    /// Flush buffered output, bounded by the rolling idle deadline.
    pub(crate) async fn flush(&mut self) -> crate::Result<()> {
        if !self.io.has_pending_writes() {
            return Ok(());
        }
        let fut = self.io.flush();
        match tokio::time::timeout_at(self.deadline, fut).await {
            Err(_) => {
                self.mark_closed();
                Err(crate::Error::new_timeout())
            }
            Ok(Err(e)) => {
                self.mark_closed();
                Err(crate::Error::new_io(e))
            }
            Ok(Ok(())) => {
                self.bump_deadline();
                Ok(())
            }
        }
    }

    pub(crate) async fn shutdown_write(&mut self) {
        let _ = self.io.shutdown().await;
    }

    // ===== request side =====

    /// Read and parse the next request head.
    ///
    /// `Ok(None)` means the peer closed cleanly between requests.
    pub(crate) async fn read_head(&mut self) -> crate::Result<Option<RequestHead>> {
        loop {
            match parse::parse_head(self.io.read_buf_mut(), &self.parse_limits)? {
                Some(head) => return Ok(Some(head)),
                None => {
                    let n = self.fill_read().await?;
                    if n == 0 {
                        return if self.io.read_buf().is_empty() {
                            trace!("read eof between requests");
                            Ok(None)
                        } else {
                            debug!(
                                "connection closed mid-head with {} bytes",
                                self.io.read_buf().len()
                            );
                            Err(crate::Error::new_parse(crate::error::Parse::RequestLine))
                        };
                    }
                }
            }
        }
    }

    /// Arm the per-request state for a freshly parsed head.
    pub(crate) fn prepare_request(
        &mut self,
        head: &RequestHead,
        trailers_cell: Trailers,
    ) -> crate::Result<()> {
        self.state.version = head.version;
        self.state.keep_alive = head.keep_alive;
        self.state.head_request = head.method == Method::HEAD;
        self.state.expect_continue = head.expect_continue;
        self.state.continue_sent = false;
        self.state.expects_trailers = false;
        self.state.bytes_seen = 0;
        self.state.status = None;
        self.state.trailers_cell = Some(trailers_cell);
        self.state.writing = Writing::Init;
        self.state.reading = match head.framing {
            BodyFraming::Empty => Reading::Body(Decoder::length(0)),
            BodyFraming::Length(n) => {
                if n > self.max_body_size {
                    self.state.keep_alive = false;
                    self.state.reading = Reading::Closed;
                    return Err(crate::Error::new_body_too_large());
                }
                Reading::Body(Decoder::length(n))
            }
            BodyFraming::Chunked => Reading::Body(Decoder::chunked(
                self.parse_limits.max_header_size,
                self.parse_limits.max_header_count,
            )),
        };
        Ok(())
    }

    /// Produce the next inbound event for an HTTP conversation.
    pub(crate) async fn next_body_event(&mut self) -> crate::Result<Event> {
        if self.state.expect_continue
            && !self.state.continue_sent
            && matches!(self.state.writing, Writing::Init)
        {
            trace!("writing 100 Continue");
            self.io.buffer(b"HTTP/1.1 100 Continue\r\n\r\n");
            self.state.continue_sent = true;
            self.flush().await?;
        }

        loop {
            enum Step {
                Data(Bytes),
                End(HeaderMap),
                Blocked,
                Done,
            }

            let step = match &mut self.state.reading {
                Reading::Body(decoder) => match decoder.poll_frame(self.io.read_buf_mut()) {
                    Ok(Progress::Frame(BodyFrame::Data(data))) => Step::Data(data),
                    Ok(Progress::Frame(BodyFrame::End { trailers })) => Step::End(trailers),
                    Ok(Progress::Blocked) => Step::Blocked,
                    Err(e) => {
                        self.state.reading = Reading::Closed;
                        self.state.keep_alive = false;
                        return Err(e);
                    }
                },
                Reading::KeepAlive | Reading::Closed => Step::Done,
                Reading::Init => unreachable!("body read before request"),
            };

            match step {
                Step::Data(data) => {
                    self.state.bytes_seen += data.len() as u64;
                    if self.state.bytes_seen > self.max_body_size {
                        debug!("request body over limit ({} bytes)", self.state.bytes_seen);
                        self.state.reading = Reading::Closed;
                        self.state.keep_alive = false;
                        return Err(crate::Error::new_body_too_large());
                    }
                    // Peek for a buffered terminator so the final data
                    // chunk can carry `more: false` directly.
                    let finished = match &mut self.state.reading {
                        Reading::Body(decoder) => {
                            match decoder.try_finish(self.io.read_buf_mut()) {
                                Ok(finished) => finished,
                                Err(e) => {
                                    self.state.reading = Reading::Closed;
                                    self.state.keep_alive = false;
                                    return Err(e);
                                }
                            }
                        }
                        _ => None,
                    };
                    let more = match finished {
                        Some(trailers) => {
                            self.finish_body_read(trailers);
                            false
                        }
                        None => true,
                    };
                    return Ok(Event::HttpRequest { body: data, more });
                }
                Step::End(trailers) => {
                    self.finish_body_read(trailers);
                    return Ok(Event::HttpRequest {
                        body: Bytes::new(),
                        more: false,
                    });
                }
                Step::Blocked => {
                    let n = self.fill_read().await?;
                    if n == 0 {
                        debug!("peer closed mid-body");
                        self.state.reading = Reading::Closed;
                        self.state.keep_alive = false;
                        return Ok(Event::HttpDisconnect);
                    }
                }
                Step::Done => return Ok(Event::HttpDisconnect),
            }
        }
    }

    fn finish_body_read(&mut self, trailers: HeaderMap) {
        if !trailers.is_empty() {
            if let Some(cell) = &self.state.trailers_cell {
                cell.set(trailers);
            }
        }
        self.state.reading = Reading::KeepAlive;
    }

    // ===== response side =====

    pub(crate) fn start_response(
        &mut self,
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
        trailers: bool,
    ) -> crate::Result<()> {
        match self.state.writing {
            Writing::Init => {}
            Writing::Closed => return Err(crate::Error::new_closed()),
            _ => return Err(crate::Error::new_invalid_state("response already started")),
        }
        if status.as_u16() > 599 {
            return Err(crate::Error::new_invalid_state("status out of range"));
        }
        self.state.status = Some(status);
        self.state.expects_trailers = trailers;
        self.state.writing = Writing::Head(PendingHead {
            status,
            headers,
            trailers,
        });
        Ok(())
    }

    pub(crate) async fn send_body(&mut self, chunk: BodyChunk, more: bool) -> crate::Result<()> {
        match chunk {
            BodyChunk::Data(data) => self.send_body_data(data, more).await,
            BodyChunk::File {
                path,
                offset,
                length,
            } => {
                self.check_body_writable()?;
                if self.suppressing_payload() {
                    return self.skip_payload(more).await;
                }
                let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                    debug!("failed to open {:?}: {}", path, e);
                    crate::Error::new_io(e)
                })?;
                if offset > 0 {
                    file.seek(std::io::SeekFrom::Start(offset))
                        .await
                        .map_err(crate::Error::new_io)?;
                }
                self.stream_file(file, length, more).await
            }
            BodyChunk::Handle {
                file,
                offset,
                length,
            } => {
                self.check_body_writable()?;
                if self.suppressing_payload() {
                    return self.skip_payload(more).await;
                }
                let mut file = tokio::fs::File::from_std(file);
                if let Some(offset) = offset {
                    file.seek(std::io::SeekFrom::Start(offset))
                        .await
                        .map_err(crate::Error::new_io)?;
                }
                self.stream_file(file, length, more).await
            }
        }
    }

    async fn send_body_data(&mut self, data: Bytes, more: bool) -> crate::Result<()> {
        self.check_body_writable()?;
        if let Writing::Head(_) = self.state.writing {
            self.commit_head(BodyHint::Data {
                len: data.len() as u64,
                terminal: !more,
            })?;
        }
        if let Writing::Body(Some(encoder)) = &mut self.state.writing {
            encoder.encode(&data, self.io.write_buf_mut())?;
        }
        if !more {
            self.finish_body()?;
        }
        self.flush().await
    }

    async fn stream_file(
        &mut self,
        mut file: tokio::fs::File,
        length: Option<u64>,
        more: bool,
    ) -> crate::Result<()> {
        if let Writing::Head(_) = self.state.writing {
            self.commit_head(BodyHint::Stream)?;
            self.flush().await?;
        }

        let mut remaining = length;
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let want = match remaining {
                Some(0) => break,
                Some(r) => std::cmp::min(r, FILE_CHUNK_SIZE as u64) as usize,
                None => FILE_CHUNK_SIZE,
            };
            let n = match file.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    debug!("file read failed mid-stream: {}", e);
                    self.mark_closed();
                    return Err(crate::Error::new_io(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Writing::Body(Some(encoder)) = &mut self.state.writing {
                encoder.encode(&buf[..n], self.io.write_buf_mut())?;
            }
            // One chunk on the wire before the next disk read keeps memory
            // bounded by the transport's acceptance rate.
            self.flush().await?;
            if let Some(r) = &mut remaining {
                *r -= n as u64;
            }
        }

        if !more {
            self.finish_body()?;
        }
        self.flush().await
    }

    async fn skip_payload(&mut self, more: bool) -> crate::Result<()> {
        if let Writing::Head(_) = self.state.writing {
            self.commit_head(BodyHint::Stream)?;
        }
        if !more {
            self.finish_body()?;
        }
        self.flush().await
    }

    pub(crate) async fn send_trailers(
        &mut self,
        headers: Vec<(HeaderName, HeaderValue)>,
        more: bool,
    ) -> crate::Result<()> {
        match &mut self.state.writing {
            Writing::Trailers(_, accumulated) => accumulated.extend(headers),
            Writing::Closed => return Err(crate::Error::new_closed()),
            _ => {
                return Err(crate::Error::new_invalid_state(
                    "trailers without declaration or before final body event",
                ))
            }
        }
        if more {
            return Ok(());
        }
        let (encoder, accumulated) = match mem::replace(&mut self.state.writing, Writing::Ended) {
            Writing::Trailers(encoder, accumulated) => (encoder, accumulated),
            _ => unreachable!("checked above"),
        };
        if let Some(mut encoder) = encoder {
            encoder.end(Some(&accumulated), self.io.write_buf_mut())?;
        }
        self.flush().await
    }

    fn check_body_writable(&self) -> crate::Result<()> {
        match self.state.writing {
            Writing::Head(_) | Writing::Body(_) => Ok(()),
            Writing::Init => Err(crate::Error::new_invalid_state(
                "body event before response start",
            )),
            Writing::Trailers(..) | Writing::Ended => Err(crate::Error::new_invalid_state(
                "body event after response complete",
            )),
            Writing::Closed => Err(crate::Error::new_closed()),
        }
    }

    fn suppressing_payload(&self) -> bool {
        self.state.head_request
    }

    /// Fix the response framing and serialize the head.
    fn commit_head(&mut self, hint: BodyHint) -> crate::Result<()> {
        let pending = match mem::replace(&mut self.state.writing, Writing::Closed) {
            Writing::Head(pending) => pending,
            _ => unreachable!("commit_head outside Head state"),
        };
        let PendingHead {
            status,
            mut headers,
            trailers,
        } = pending;

        let app_content_length = content_length_of(&headers)?;

        let encoder = if self.state.head_request {
            None
        } else if trailers {
            if app_content_length.is_some() {
                return Err(crate::Error::new_invalid_state(
                    "content-length declared alongside trailers",
                ));
            }
            headers.push((
                http::header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            ));
            Some(Encoder::chunked())
        } else if let Some(len) = app_content_length {
            Some(Encoder::length(len))
        } else if let BodyHint::Data {
            len,
            terminal: true,
        } = hint
        {
            let mut len_buf = itoa::Buffer::new();
            headers.push((
                http::header::CONTENT_LENGTH,
                HeaderValue::from_str(len_buf.format(len)).expect("integer header value"),
            ));
            Some(Encoder::length(len))
        } else if self.state.version == Version::HTTP_11 {
            headers.push((
                http::header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            ));
            Some(Encoder::chunked())
        } else {
            self.state.keep_alive = false;
            Some(Encoder::close_delimited())
        };

        let has_connection = headers
            .iter()
            .any(|(name, _)| *name == http::header::CONNECTION);
        if !has_connection {
            if !self.state.keep_alive {
                headers.push((http::header::CONNECTION, HeaderValue::from_static("close")));
            } else if self.state.version == Version::HTTP_10 {
                headers.push((
                    http::header::CONNECTION,
                    HeaderValue::from_static("keep-alive"),
                ));
            }
        }

        trace!(
            "committing head: {} chunked={} suppress={}",
            status,
            encoder.as_ref().map(Encoder::is_chunked).unwrap_or(false),
            self.state.head_request,
        );
        encode::encode_head(self.io.write_buf_mut(), self.state.version, status, &headers);
        self.state.writing = Writing::Body(encoder);
        Ok(())
    }

    fn finish_body(&mut self) -> crate::Result<()> {
        let encoder = match mem::replace(&mut self.state.writing, Writing::Closed) {
            Writing::Body(encoder) => encoder,
            _ => unreachable!("finish_body outside Body state"),
        };
        if self.state.expects_trailers {
            self.state.writing = Writing::Trailers(encoder, Vec::new());
            return Ok(());
        }
        if let Some(mut encoder) = encoder {
            if encoder.is_close_delimited() {
                self.state.keep_alive = false;
            }
            encoder.end(None, self.io.write_buf_mut())?;
        }
        self.state.writing = Writing::Ended;
        Ok(())
    }

    /// Write a synthesized minimal response. Only legal while nothing of
    /// the application's response has reached the wire.
    pub(crate) async fn write_minimal_response(
        &mut self,
        status: StatusCode,
    ) -> crate::Result<()> {
        debug_assert!(!self.wire_started());
        self.state.status = Some(status);
        self.state.keep_alive = false;
        encode::encode_minimal_response(self.io.write_buf_mut(), status);
        self.state.writing = Writing::Ended;
        self.flush().await
    }

    /// Serialize a head immediately, outside the deferred-framing path.
    /// Used for upgrade handshakes and SSE stream heads.
    pub(crate) fn write_head_now(
        &mut self,
        status: StatusCode,
        headers: &[(HeaderName, HeaderValue)],
    ) {
        self.state.status = Some(status);
        encode::encode_head(self.io.write_buf_mut(), self.state.version, status, headers);
    }

    /// After a completed response: discard whatever request body remains,
    /// then report whether the connection may serve another request.
    pub(crate) async fn finish_cycle(&mut self) -> crate::Result<bool> {
        if !self.state.keep_alive {
            return Ok(false);
        }
        if self.state.expect_continue && !self.state.continue_sent {
            // The peer is still waiting for permission to send the body it
            // announced; the response stands alone and the stream closes.
            debug!("expect: 100-continue body never read; closing after response");
            return Ok(false);
        }
        loop {
            enum Step {
                Data(usize),
                End(HeaderMap),
                Blocked,
                Done,
            }
            let step = match &mut self.state.reading {
                Reading::Body(decoder) => match decoder.poll_frame(self.io.read_buf_mut()) {
                    Ok(Progress::Frame(BodyFrame::Data(data))) => Step::Data(data.len()),
                    Ok(Progress::Frame(BodyFrame::End { trailers })) => Step::End(trailers),
                    Ok(Progress::Blocked) => Step::Blocked,
                    Err(_) => return Ok(false),
                },
                Reading::KeepAlive => Step::Done,
                Reading::Closed | Reading::Init => return Ok(false),
            };
            match step {
                Step::Data(len) => {
                    self.state.bytes_seen += len as u64;
                    if self.state.bytes_seen > self.max_body_size {
                        debug!("unread body over drain limit; closing");
                        return Ok(false);
                    }
                }
                Step::End(trailers) => {
                    self.finish_body_read(trailers);
                    return Ok(true);
                }
                Step::Blocked => {
                    let n = self.fill_read().await?;
                    if n == 0 {
                        return Ok(false);
                    }
                }
                Step::Done => return Ok(true),
            }
        }
    }

    /// Reset per-request state ahead of the next pipelined request.
    pub(crate) fn reset_cycle(&mut self) {
        self.state.reading = Reading::Init;
        self.state.writing = Writing::Init;
        self.state.trailers_cell = None;
        self.state.status = None;
        self.state.expect_continue = false;
        self.state.continue_sent = false;
        self.state.expects_trailers = false;
        self.state.head_request = false;
        self.state.bytes_seen = 0;
    }
}

fn content_length_of(headers: &[(HeaderName, HeaderValue)]) -> crate::Result<Option<u64>> {
    let mut found = None;
    for (name, value) in headers {
        if *name == http::header::CONTENT_LENGTH {
            let parsed = std::str::from_utf8(value.as_bytes())
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    crate::Error::new_invalid_state("unparseable content-length header")
                })?;
            if found.is_some() && found != Some(parsed) {
                return Err(crate::Error::new_invalid_state(
                    "conflicting content-length headers",
                ));
            }
            found = Some(parsed);
        }
    }
    Ok(found)
}
