#![allow(dead_code)]

use std::net::SocketAddr;

use pagi::{Application, Config, Handle, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: Handle,
    pub task: JoinHandle<pagi::Result<()>>,
}

/// Bind an ephemeral port and serve `app` in the background.
pub fn serve<A: Application>(config: Config, app: A) -> TestServer {
    let _ = pretty_env_logger::try_init();
    let bound = Server::new(config).bind().expect("bind");
    let addr = bound.local_addr();
    let handle = bound.handle();
    let task = tokio::spawn(bound.serve(app));
    TestServer { addr, handle, task }
}

impl TestServer {
    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect")
    }

    pub async fn shutdown(self) -> pagi::Result<()> {
        self.handle.shutdown();
        self.task.await.expect("server task")
    }
}

/// Read until the peer closes.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read_to_end");
    out
}

/// Read until the blank line ending a response head, returning everything
/// read so far (head plus any body bytes that arrived with it).
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read head");
        if n == 0 {
            break;
        }
        out.push(byte[0]);
        if out.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read exactly `n` bytes.
pub async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    stream.read_exact(&mut out).await.expect("read_exact");
    out
}

pub async fn write_all(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).await.expect("write_all");
}

/// Split a raw response into (head, body) at the header terminator.
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    (
        String::from_utf8_lossy(&raw[..pos + 4]).into_owned(),
        raw[pos + 4..].to_vec(),
    )
}

/// Build a masked client WebSocket frame.
pub fn ws_client_frame(fin: bool, opcode: u8, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(if fin { 0x80 } else { 0x00 } | opcode);
    match payload.len() {
        n if n <= 125 => frame.push(0x80 | n as u8),
        n if n <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&mask);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i & 3]),
    );
    frame
}

/// Parse one unmasked server frame from the front of `raw`; returns
/// (opcode, payload, bytes_consumed).
pub fn parse_server_frame(raw: &[u8]) -> (u8, Vec<u8>, usize) {
    assert!(raw.len() >= 2, "short frame: {:?}", raw);
    let opcode = raw[0] & 0x0F;
    assert_eq!(raw[1] & 0x80, 0, "server frames must be unmasked");
    let (len, header) = match raw[1] & 0x7F {
        126 => (u16::from_be_bytes([raw[2], raw[3]]) as usize, 4),
        127 => {
            let mut be = [0u8; 8];
            be.copy_from_slice(&raw[2..10]);
            (u64::from_be_bytes(be) as usize, 10)
        }
        n => (n as usize, 2),
    };
    assert!(raw.len() >= header + len, "incomplete frame");
    (opcode, raw[header..header + len].to_vec(), header + len)
}
