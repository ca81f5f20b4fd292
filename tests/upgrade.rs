//! WebSocket and SSE conversations over real sockets.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use http::StatusCode;
use pagi::{app_fn, Config, Event, Scope, SendEvent, SseMessage};

mod support;
use support::*;

const OP_TEXT: u8 = 0x1;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const WS_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
    Host: t\r\n\
    Connection: Upgrade\r\n\
    Upgrade: websocket\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

/// Accepts, echoes messages, closes when the peer does.
fn ws_echo_app() -> impl pagi::Application {
    app_fn(|scope, mut receiver, mut sender| async move {
        let Scope::Websocket(_) = scope else { return Ok(()) };
        match receiver.next().await? {
            Event::WsConnect => {}
            other => panic!("expected connect, got {other:?}"),
        }
        sender
            .send(SendEvent::WsAccept {
                subprotocol: None,
                headers: vec![],
            })
            .await?;
        loop {
            match receiver.next().await? {
                Event::WsMessage(message) => {
                    sender.send(SendEvent::WsSend(message)).await?;
                }
                Event::WsDisconnect { .. } => return Ok(()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    })
}

#[tokio::test]
async fn websocket_handshake_and_echo() {
    let server = serve(Config::new(0), ws_echo_app());
    let mut client = server.connect().await;

    write_all(&mut client, WS_REQUEST).await;
    let head = read_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "head: {head}"
    );
    // RFC 6455 sample key digest.
    assert!(
        head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
        "head: {head}"
    );

    write_all(
        &mut client,
        &ws_client_frame(true, OP_TEXT, [1, 2, 3, 4], b"round trip"),
    )
    .await;
    let raw = read_exact(&mut client, 2 + 10).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_TEXT);
    assert_eq!(&payload, b"round trip");

    // Close handshake: the server echoes and the app sees the disconnect.
    let mut close_payload = 1000u16.to_be_bytes().to_vec();
    close_payload.extend_from_slice(b"bye");
    write_all(
        &mut client,
        &ws_client_frame(true, OP_CLOSE, [9, 9, 9, 9], &close_payload),
    )
    .await;
    let raw = read_to_end(&mut client).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_CLOSE);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
}

#[tokio::test]
async fn websocket_ping_answered_transparently() {
    let server = serve(Config::new(0), ws_echo_app());
    let mut client = server.connect().await;

    write_all(&mut client, WS_REQUEST).await;
    let _ = read_head(&mut client).await;

    // Ping while the app is blocked in receive; pong comes back with the
    // same payload and no message event reaches the app.
    write_all(
        &mut client,
        &ws_client_frame(true, OP_PING, [0, 0, 0, 0], b"tick"),
    )
    .await;
    let raw = read_exact(&mut client, 2 + 4).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_PONG);
    assert_eq!(&payload, b"tick");
}

#[tokio::test]
async fn websocket_fragmented_message_reassembled() {
    let server = serve(Config::new(0), ws_echo_app());
    let mut client = server.connect().await;

    write_all(&mut client, WS_REQUEST).await;
    let _ = read_head(&mut client).await;

    write_all(
        &mut client,
        &ws_client_frame(false, OP_TEXT, [5, 6, 7, 8], b"frag"),
    )
    .await;
    write_all(
        &mut client,
        &ws_client_frame(true, 0x0, [5, 6, 7, 8], b"mented"),
    )
    .await;
    let raw = read_exact(&mut client, 2 + 10).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_TEXT);
    assert_eq!(&payload, b"fragmented");
}

#[tokio::test]
async fn websocket_oversized_frame_closes_1009() {
    let server = serve(Config::new(0).max_ws_frame_size(64), ws_echo_app());
    let mut client = server.connect().await;

    write_all(&mut client, WS_REQUEST).await;
    let _ = read_head(&mut client).await;

    write_all(
        &mut client,
        &ws_client_frame(true, OP_TEXT, [1, 1, 1, 1], &[b'x'; 128]),
    )
    .await;
    let raw = read_to_end(&mut client).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_CLOSE);
    assert_eq!(&payload[..2], &1009u16.to_be_bytes());
}

#[tokio::test]
async fn websocket_rejection_is_403_without_accept_header() {
    let app = app_fn(|scope, mut receiver, mut sender| async move {
        let Scope::Websocket(ws) = scope else { return Ok(()) };
        assert_eq!(ws.path, "/admin");
        let _ = receiver.next().await?;
        sender
            .send(SendEvent::WsClose {
                code: 4003,
                reason: "not allowed".into(),
            })
            .await?;
        Ok(())
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET /admin HTTP/1.1\r\n\
          Host: t\r\n\
          Connection: Upgrade\r\n\
          Upgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\r\n",
    )
    .await;
    let raw = read_to_end(&mut client).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {text}");
    assert!(!text.contains("sec-websocket-accept"), "got: {text}");
}

#[tokio::test]
async fn websocket_wrong_version_is_426() {
    let server = serve(Config::new(0), ws_echo_app());
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET / HTTP/1.1\r\n\
          Host: t\r\n\
          Connection: Upgrade\r\n\
          Upgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 8\r\n\r\n",
    )
    .await;
    let raw = read_to_end(&mut client).await;
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 426"));
}

#[tokio::test]
async fn websocket_subprotocol_negotiated() {
    let app = app_fn(|scope, mut receiver, mut sender| async move {
        let Scope::Websocket(ws) = scope else { return Ok(()) };
        assert_eq!(ws.subprotocols, ["chat", "superchat"]);
        let _ = receiver.next().await?;
        sender
            .send(SendEvent::WsAccept {
                subprotocol: Some("superchat".into()),
                headers: vec![],
            })
            .await?;
        sender.send(SendEvent::ws_close()).await?;
        let _ = receiver.next().await?;
        Ok(())
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET / HTTP/1.1\r\n\
          Host: t\r\n\
          Connection: Upgrade\r\n\
          Upgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          Sec-WebSocket-Protocol: chat, superchat\r\n\r\n",
    )
    .await;
    let head = read_head(&mut client).await;
    assert!(head.contains("sec-websocket-protocol: superchat\r\n"), "head: {head}");
    let raw = read_to_end(&mut client).await;
    let (opcode, payload, _) = parse_server_frame(&raw);
    assert_eq!(opcode, OP_CLOSE);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
}

#[tokio::test]
async fn sse_stream_headers_and_events() {
    let app = app_fn(|scope, mut receiver, mut sender| async move {
        let Scope::Sse(_) = scope else { return Ok(()) };
        let _ = receiver.next().await?;
        sender
            .send(SendEvent::SseStart {
                status: StatusCode::OK,
                headers: vec![],
            })
            .await?;
        sender
            .send(SendEvent::SseSend(
                SseMessage::data("one").event("count").id("1"),
            ))
            .await?;
        sender
            .send(SendEvent::SseSend(SseMessage::data("two\nand more")))
            .await?;
        Ok(())
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET /live HTTP/1.1\r\nHost: t\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    let raw = read_to_end(&mut client).await;
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("content-type: text/event-stream\r\n"), "head: {head}");
    assert!(head.contains("cache-control: no-cache\r\n"), "head: {head}");
    assert!(head.contains("connection: keep-alive\r\n"), "head: {head}");
    assert_eq!(
        String::from_utf8_lossy(&body),
        "event: count\nid: 1\ndata: one\n\ndata: two\ndata: and more\n\n"
    );
}

#[tokio::test]
async fn sse_client_drop_reaches_the_application() {
    let disconnected = Arc::new(AtomicBool::new(false));
    let dropped_sends_ok = Arc::new(AtomicBool::new(false));
    let (seen_disconnect, seen_sends) = (disconnected.clone(), dropped_sends_ok.clone());

    let app = app_fn(move |scope, mut receiver, mut sender| {
        let disconnected = seen_disconnect.clone();
        let dropped_sends_ok = seen_sends.clone();
        async move {
            let Scope::Sse(_) = scope else { return Ok(()) };
            let _ = receiver.next().await?;
            sender
                .send(SendEvent::SseStart {
                    status: StatusCode::OK,
                    headers: vec![],
                })
                .await?;
            for i in 0..3 {
                sender
                    .send(SendEvent::SseSend(SseMessage::data(format!("n{i}"))))
                    .await?;
            }
            if let Event::SseDisconnect = receiver.next().await? {
                disconnected.store(true, Ordering::SeqCst);
            }
            // Sends after the peer is gone are swallowed, not errors.
            let late = sender
                .send(SendEvent::SseSend(SseMessage::data("late")))
                .await;
            dropped_sends_ok.store(late.is_ok(), Ordering::SeqCst);
            Ok(())
        }
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET /live HTTP/1.1\r\nHost: t\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    let events = read_exact(&mut client, 3 * "data: n0\n\n".len()).await;
    assert_eq!(
        String::from_utf8_lossy(&events),
        "data: n0\n\ndata: n1\n\ndata: n2\n\n"
    );
    drop(client);

    server.shutdown().await.unwrap();
    assert!(disconnected.load(Ordering::SeqCst), "app never saw the drop");
    assert!(dropped_sends_ok.load(Ordering::SeqCst), "late send errored");
}

#[tokio::test]
async fn sse_send_before_start_is_invalid() {
    let invalid = Arc::new(AtomicUsize::new(0));
    let seen = invalid.clone();
    let app = app_fn(move |scope, mut receiver, mut sender| {
        let invalid = seen.clone();
        async move {
            let Scope::Sse(_) = scope else { return Ok(()) };
            let _ = receiver.next().await?;
            let err = sender
                .send(SendEvent::SseSend(SseMessage::data("early")))
                .await
                .unwrap_err();
            if err.is_invalid_state() {
                invalid.fetch_add(1, Ordering::SeqCst);
            }
            sender
                .send(SendEvent::SseStart {
                    status: StatusCode::OK,
                    headers: vec![],
                })
                .await?;
            Ok(())
        }
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;

    write_all(
        &mut client,
        b"GET /live HTTP/1.1\r\nHost: t\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    let raw = read_to_end(&mut client).await;
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 200 OK\r\n"));

    server.shutdown().await.unwrap();
    assert_eq!(invalid.load(Ordering::SeqCst), 1);
}
