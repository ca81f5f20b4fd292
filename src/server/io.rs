//! Buffered reads and writes over the connection's stream.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// The initial buffer size allocated before trying to read from IO.
const INIT_BUFFER_SIZE: usize = 8192;

/// A stream wrapper owning the read and write buffers.
///
/// Reads land in `read_buf` for the parser and decoders to consume;
/// writes accumulate in `write_buf` (flatten strategy) and leave in a
/// single syscall per flush.
pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_read_buf: usize,
}

impl<T> Buffered<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T, max_read_buf: usize) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(0),
            write_buf: BytesMut::with_capacity(0),
            max_read_buf: max_read_buf.max(INIT_BUFFER_SIZE),
        }
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.read_buf.as_ref()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Read more bytes into the read buffer. Returns the number read;
    /// zero means EOF (or a full buffer applying backpressure).
    pub(crate) async fn fill_read_buf(&mut self) -> io::Result<usize> {
        if self.read_buf.len() >= self.max_read_buf {
            trace!("read buffer at capacity ({}B)", self.read_buf.len());
            return Ok(0);
        }
        let headroom = self.max_read_buf - self.read_buf.len();
        self.read_buf
            .reserve(std::cmp::min(INIT_BUFFER_SIZE, headroom));
        let n = self
            .io
            .read_buf(&mut (&mut self.read_buf).limit(headroom))
            .await?;
        trace!("received {} bytes", n);
        Ok(n)
    }

    pub(crate) fn buffer(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    pub(crate) fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Write the whole outbound buffer to the stream and flush it.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while self.write_buf.has_remaining() {
            let n = self.io.write(self.write_buf.as_ref()).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            trace!("flushed {} bytes", n);
            self.write_buf.advance(n);
        }
        self.write_buf.clear();
        self.io.flush().await
    }

    /// Gracefully shut down the write side.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}
