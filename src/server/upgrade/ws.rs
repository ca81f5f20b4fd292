//! WebSocket handshake and frame codec (RFC 6455, version 13).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::event::Message;
use crate::server::conn::Conn;

pub(crate) const OP_CONTINUATION: u8 = 0x0;
pub(crate) const OP_TEXT: u8 = 0x1;
pub(crate) const OP_BINARY: u8 = 0x2;
pub(crate) const OP_CLOSE: u8 = 0x8;
pub(crate) const OP_PING: u8 = 0x9;
pub(crate) const OP_PONG: u8 = 0xA;

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sign a `Sec-WebSocket-Key` into the `Sec-WebSocket-Accept` value.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// Response headers for a successful handshake.
pub(crate) fn handshake_headers(
    key: &str,
    subprotocol: Option<&str>,
    extra: Vec<(HeaderName, HeaderValue)>,
) -> crate::Result<Vec<(HeaderName, HeaderValue)>> {
    let mut headers = vec![
        (http::header::UPGRADE, HeaderValue::from_static("websocket")),
        (http::header::CONNECTION, HeaderValue::from_static("Upgrade")),
        (
            http::header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&accept_key(key))
                .map_err(|_| crate::Error::new_invalid_state("sec-websocket-key not a token"))?,
        ),
    ];
    if let Some(proto) = subprotocol {
        headers.push((
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(proto)
                .map_err(|_| crate::Error::new_invalid_state("subprotocol not a token"))?,
        ));
    }
    headers.extend(extra);
    Ok(headers)
}

/// One inbound event from the frame layer.
#[derive(Debug)]
pub(crate) enum WsIncoming {
    Message(Message),
    /// Peer sent a close frame (not yet echoed).
    Close { code: u16, reason: String },
    /// Peer vanished without a close frame.
    Disconnected,
    /// Peer violated the protocol; close with `code` and stop reading.
    Violation {
        code: u16,
        message: &'static str,
    },
}

#[derive(Debug, PartialEq)]
struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: [u8; 4],
    len: u64,
}

/// Try to parse one frame header out of `buf`, consuming it on success.
fn parse_frame_header(
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<FrameHeader>, (u16, &'static str)> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    if b0 & 0x70 != 0 {
        return Err((1002, "reserved bits set"));
    }
    let opcode = b0 & 0x0F;
    let fin = b0 & 0x80 != 0;
    match opcode {
        OP_CONTINUATION | OP_TEXT | OP_BINARY => {}
        OP_CLOSE | OP_PING | OP_PONG => {
            if !fin {
                return Err((1002, "fragmented control frame"));
            }
            if b1 & 0x7F > 125 {
                return Err((1002, "control frame over 125 bytes"));
            }
        }
        _ => return Err((1002, "unknown opcode")),
    }
    if b1 & 0x80 == 0 {
        return Err((1002, "client frame not masked"));
    }

    let (len, len_bytes) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 2)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err((1002, "frame length high bit set"));
            }
            (len, 8)
        }
        n => (n as u64, 0),
    };
    if len > max_frame_size as u64 {
        return Err((1009, "frame over size limit"));
    }

    let header_len = 2 + len_bytes + 4;
    if buf.len() < header_len {
        return Ok(None);
    }
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[2 + len_bytes..header_len]);
    let _ = buf.split_to(header_len);
    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        len,
    }))
}

/// Apply the client mask in place, starting at `offset` within the frame.
fn unmask(payload: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) & 3];
    }
}

/// Reads complete (reassembled) messages, handling control frames
/// transparently: ping is answered with an identical pong, pong is
/// ignored.
///
/// All partial progress (the current frame header, a partially read
/// payload, collected fragments) lives in the reader itself, so the
/// in-flight `read` future can be dropped at any await and resumed by
/// calling `read` again.
#[derive(Default)]
pub(crate) struct MessageReader {
    current: Option<(FrameHeader, BytesMut)>,
    fragments: Option<(u8, BytesMut)>,
}

impl MessageReader {
    pub(crate) fn new() -> MessageReader {
        MessageReader::default()
    }

    pub(crate) async fn read<T>(
        &mut self,
        conn: &mut Conn<T>,
        max_frame_size: usize,
    ) -> crate::Result<WsIncoming>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if self.current.is_none() {
                let header = loop {
                    match parse_frame_header(conn.io_mut().read_buf_mut(), max_frame_size) {
                        Err((code, message)) => {
                            return Ok(WsIncoming::Violation { code, message })
                        }
                        Ok(Some(header)) => break header,
                        Ok(None) => {
                            let n = conn.fill_read().await?;
                            if n == 0 {
                                return Ok(WsIncoming::Disconnected);
                            }
                        }
                    }
                };
                trace!(
                    "ws frame: opcode={:#x} fin={} len={}",
                    header.opcode,
                    header.fin,
                    header.len
                );
                let capacity = header.len as usize;
                self.current = Some((header, BytesMut::with_capacity(capacity)));
            }

            {
                let (header, payload) = self.current.as_mut().expect("current frame");
                while (payload.len() as u64) < header.len {
                    let available = conn.io_mut().read_buf_mut();
                    if available.is_empty() {
                        let n = conn.fill_read().await?;
                        if n == 0 {
                            return Ok(WsIncoming::Disconnected);
                        }
                        continue;
                    }
                    let take = std::cmp::min(
                        header.len - payload.len() as u64,
                        available.len() as u64,
                    ) as usize;
                    let mut chunk = available.split_to(take);
                    unmask(&mut chunk, header.mask, payload.len());
                    payload.unsplit(chunk);
                }
            }
            let (header, payload) = self.current.take().expect("current frame");

            match header.opcode {
                OP_PING => {
                    write_frame(conn, OP_PONG, &payload).await?;
                    continue;
                }
                OP_PONG => continue,
                OP_CLOSE => {
                    let (code, reason) = if payload.len() >= 2 {
                        let code = u16::from_be_bytes([payload[0], payload[1]]);
                        (code, String::from_utf8_lossy(&payload[2..]).into_owned())
                    } else {
                        (1005, String::new())
                    };
                    return Ok(WsIncoming::Close { code, reason });
                }
                OP_TEXT | OP_BINARY => {
                    if self.fragments.is_some() {
                        return Ok(WsIncoming::Violation {
                            code: 1002,
                            message: "data frame inside fragmented message",
                        });
                    }
                    if header.fin {
                        return finish_message(header.opcode, payload.freeze());
                    }
                    self.fragments = Some((header.opcode, payload));
                }
                OP_CONTINUATION => {
                    let Some((opcode, mut assembled)) = self.fragments.take() else {
                        return Ok(WsIncoming::Violation {
                            code: 1002,
                            message: "continuation without initial frame",
                        });
                    };
                    if assembled.len() + payload.len() > max_frame_size {
                        return Ok(WsIncoming::Violation {
                            code: 1009,
                            message: "fragmented message over size limit",
                        });
                    }
                    assembled.unsplit(payload);
                    if header.fin {
                        return finish_message(opcode, assembled.freeze());
                    }
                    self.fragments = Some((opcode, assembled));
                }
                _ => unreachable!("opcode validated in header parse"),
            }
        }
    }
}

fn finish_message(opcode: u8, payload: Bytes) -> crate::Result<WsIncoming> {
    if opcode == OP_TEXT {
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => Ok(WsIncoming::Message(Message::Text(text))),
            Err(_) => {
                debug!("invalid utf-8 in text frame");
                Ok(WsIncoming::Violation {
                    code: 1007,
                    message: "invalid utf-8 in text frame",
                })
            }
        }
    } else {
        Ok(WsIncoming::Message(Message::Binary(payload)))
    }
}

/// Write a single unmasked, unfragmented frame and flush it.
pub(crate) async fn write_frame<T>(
    conn: &mut Conn<T>,
    opcode: u8,
    payload: &[u8],
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let dst = conn.io_mut().write_buf_mut();
    dst.put_u8(0x80 | opcode);
    match payload.len() {
        n if n <= 125 => dst.put_u8(n as u8),
        n if n <= u16::MAX as usize => {
            dst.put_u8(126);
            dst.put_u16(n as u16);
        }
        n => {
            dst.put_u8(127);
            dst.put_u64(n as u64);
        }
    }
    dst.put_slice(payload);
    conn.flush().await
}

/// Write a close frame carrying `code` and `reason`.
pub(crate) async fn write_close<T>(
    conn: &mut Conn<T>,
    code: u16,
    reason: &str,
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    write_frame(conn, OP_CLOSE, &payload).await
}

pub(crate) async fn write_message<T>(conn: &mut Conn<T>, message: &Message) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match message {
        Message::Text(text) => write_frame(conn, OP_TEXT, text.as_bytes()).await,
        Message::Binary(bytes) => write_frame(conn, OP_BINARY, bytes).await,
    }
}
