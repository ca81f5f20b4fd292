//! Drives one connection's conversations between the wire and the
//! application.
//!
//! The dispatcher is the only task touching the stream. The application
//! runs as its own task and reaches the wire exclusively through the
//! acknowledged op channel built in `app::conversation`; the dispatcher
//! services those ops, watches the drain signal, and enforces the idle
//! deadline.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::app::{conversation, Application, Op};
use crate::config::Config;
use crate::event::{Event, SendEvent};
use crate::proto::{RequestHead, UpgradeRequest};
use crate::scope::{HttpScope, Scheme, Scope, SseScope, Trailers, WsScope};
use crate::server::accesslog::AccessLog;
use crate::server::conn::Conn;
use crate::server::drain::Watch;
use crate::server::upgrade::{sse, ws};
use crate::server::worker::RequestCounter;

/// Everything a connection task needs besides the stream itself.
pub(crate) struct ConnContext {
    pub(crate) config: Arc<Config>,
    pub(crate) client: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) log: Weak<AccessLog>,
    pub(crate) watch: Watch,
    pub(crate) counter: Arc<RequestCounter>,
}

pub(crate) async fn serve_connection<T, A>(io: T, app: Arc<A>, ctx: ConnContext)
where
    T: AsyncRead + AsyncWrite + Unpin,
    A: Application,
{
    let mut dispatcher = Dispatcher {
        conn: Conn::new(io, &ctx.config),
        app,
        ctx,
    };
    dispatcher.run().await;
}

enum NextStep {
    KeepAlive,
    Close,
}

struct Dispatcher<T, A> {
    conn: Conn<T>,
    app: Arc<A>,
    ctx: ConnContext,
}

impl<T, A> Dispatcher<T, A>
where
    T: AsyncRead + AsyncWrite + Unpin,
    A: Application,
{
    async fn run(&mut self) {
        loop {
            let head = {
                let mut watch = self.ctx.watch.clone();
                tokio::select! {
                    biased;
                    res = self.conn.read_head() => res,
                    _ = watch.signaled() => {
                        trace!("drain signaled while idle");
                        break;
                    }
                }
            };
            let head = match head {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    self.synthesize_error(&e).await;
                    break;
                }
            };

            let started = Instant::now();
            let method = head.method.clone();
            let raw_path = head.raw_path.clone();
            let query = head.query.clone();
            let upgraded = !matches!(head.upgrade, UpgradeRequest::None);

            let step = match head.upgrade {
                UpgradeRequest::None => self.serve_http(head).await,
                UpgradeRequest::Websocket { .. } => {
                    self.serve_ws(head).await;
                    NextStep::Close
                }
                UpgradeRequest::Sse => {
                    self.serve_sse(head).await;
                    NextStep::Close
                }
            };

            if let Some(log) = self.ctx.log.upgrade() {
                log.record(
                    self.ctx.client.ip(),
                    &method,
                    &raw_path,
                    &query,
                    self.conn.status(),
                    started.elapsed(),
                );
            }
            let cap_reached = self.ctx.counter.completed();
            if cap_reached {
                debug!("request cap reached on this worker");
            }

            match step {
                NextStep::KeepAlive if !cap_reached && !upgraded => self.conn.reset_cycle(),
                _ => break,
            }
        }
        self.conn.shutdown_write().await;
    }

    /// Write the synthesized response for a pre-dispatch failure.
    async fn synthesize_error(&mut self, err: &crate::Error) {
        if err.is_closed() || err.is_io() {
            return;
        }
        let empty_timeout = err.is_timeout() && self.conn.io_mut().read_buf().is_empty();
        if let Some(status) = err.response_status() {
            warn!("request failed before dispatch: {}", err);
            if !self.conn.wire_started() && !empty_timeout {
                let _ = self.conn.write_minimal_response(status).await;
            }
        } else {
            error!("connection error: {}", err);
        }
    }

    // ===== HTTP =====

    async fn serve_http(&mut self, head: RequestHead) -> NextStep {
        let trailers = Trailers::new();
        if let Err(e) = self.conn.prepare_request(&head, trailers.clone()) {
            self.synthesize_error(&e).await;
            return NextStep::Close;
        }
        let scope = Scope::Http(self.http_scope(&head, trailers));

        let (receiver, sender, mut ops) = conversation();
        let mut app_task = tokio::spawn(self.app.call(scope, receiver, sender));

        let mut pending_receive: Option<oneshot::Sender<crate::Result<Event>>> = None;
        let mut drained = false;
        let mut violated = false;
        // Set once the server itself has concluded the exchange (413, 408,
        // bad chunk framing): the response on the wire is final and the
        // application's fate no longer changes it.
        let mut settled = false;

        loop {
            let deadline = self.conn.deadline();
            let conn_closed = self.conn.is_closed();
            let service_receive = pending_receive.is_some() && !settled;
            let mut watch = self.ctx.watch.clone();
            tokio::select! {
                biased;
                op = ops.recv() => match op {
                    Some(Op::Receive(cb)) => {
                        if settled {
                            let _ = cb.send(Ok(Event::HttpDisconnect));
                        } else {
                            pending_receive = Some(cb);
                        }
                    }
                    Some(Op::Send(event, cb)) => {
                        let result = self.handle_http_send(event).await;
                        if let Err(e) = &result {
                            violated |= e.is_invalid_state();
                        }
                        let _ = cb.send(result);
                    }
                    None => break,
                },
                event = self.conn.next_body_event(), if service_receive => {
                    let cb = pending_receive.take().expect("pending receive");
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            self.synthesize_error(&e).await;
                            self.conn.mark_closed();
                            settled = true;
                            Event::HttpDisconnect
                        }
                    };
                    let _ = cb.send(Ok(event));
                }
                _ = watch.signaled(), if !drained => {
                    trace!("drain signaled mid-request");
                    drained = true;
                    self.conn.set_keep_alive(false);
                }
                _ = tokio::time::sleep_until(deadline), if !conn_closed => {
                    debug!("idle deadline expired mid-conversation");
                    if !self.conn.wire_started() {
                        let _ = self.conn.write_minimal_response(
                            StatusCode::REQUEST_TIMEOUT,
                        ).await;
                    }
                    self.conn.mark_closed();
                    settled = true;
                    if let Some(cb) = pending_receive.take() {
                        let _ = cb.send(Ok(Event::HttpDisconnect));
                    }
                }
            }
        }

        // The channel is gone; settle the application task itself.
        let app_failed = self.await_app(&mut app_task).await;

        if settled {
            return NextStep::Close;
        }

        if app_failed {
            if !self.conn.response_started() && !self.conn.is_closed() {
                let _ = self
                    .conn
                    .write_minimal_response(StatusCode::INTERNAL_SERVER_ERROR)
                    .await;
            } else if !self.conn.response_complete() {
                self.conn.mark_closed();
            }
            return NextStep::Close;
        }

        if !self.conn.response_complete() {
            error!("application finished without completing the response");
            if !self.conn.response_started() && !self.conn.is_closed() {
                let _ = self
                    .conn
                    .write_minimal_response(StatusCode::INTERNAL_SERVER_ERROR)
                    .await;
            } else {
                self.conn.mark_closed();
            }
            return NextStep::Close;
        }

        if violated || drained {
            return NextStep::Close;
        }
        match self.conn.finish_cycle().await {
            Ok(true) => NextStep::KeepAlive,
            _ => NextStep::Close,
        }
    }

    async fn handle_http_send(&mut self, event: SendEvent) -> crate::Result<()> {
        match event {
            SendEvent::ResponseStart {
                status,
                headers,
                trailers,
            } => self.conn.start_response(status, headers, trailers),
            SendEvent::ResponseBody { chunk, more } => {
                let wire_started = self.conn.wire_started();
                let result = self.conn.send_body(chunk, more).await;
                if let Err(e) = &result {
                    if e.is_io() && !wire_started && !self.conn.is_closed() {
                        // A body source failed before any response bytes
                        // left; the peer still gets a clean 500.
                        let _ = self
                            .conn
                            .write_minimal_response(StatusCode::INTERNAL_SERVER_ERROR)
                            .await;
                        self.conn.mark_closed();
                    }
                }
                result
            }
            SendEvent::ResponseTrailers { headers, more } => {
                self.conn.send_trailers(headers, more).await
            }
            _ => Err(crate::Error::new_invalid_state(
                "event not valid for an http conversation",
            )),
        }
    }

    /// Await the application task, logging failures. Returns true if the
    /// application failed or panicked.
    async fn await_app(
        &mut self,
        app_task: &mut tokio::task::JoinHandle<crate::Result<()>>,
    ) -> bool {
        let grace = self.ctx.config.shutdown_grace;
        match tokio::time::timeout(grace, &mut *app_task).await {
            Ok(Ok(Ok(()))) => false,
            Ok(Ok(Err(e))) => {
                if e.is_closed() {
                    // The conversation was cancelled under the app.
                    debug!("application ended on closed conversation: {}", e);
                } else {
                    error!("application error: {}", e);
                }
                !e.is_closed()
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    error!("application panicked: {}", panic_message(&join_err));
                } else {
                    error!("application task cancelled");
                }
                true
            }
            Err(_) => {
                warn!("application still running {}s after its conversation closed; aborting", grace.as_secs());
                app_task.abort();
                true
            }
        }
    }

    // ===== WebSocket =====

    async fn serve_ws(&mut self, head: RequestHead) {
        let UpgradeRequest::Websocket {
            key,
            version_ok,
            subprotocols,
        } = &head.upgrade
        else {
            unreachable!("serve_ws without websocket upgrade");
        };

        if head.method != http::Method::GET || key.is_none() {
            debug!("malformed websocket handshake");
            let _ = self
                .conn
                .write_minimal_response(StatusCode::BAD_REQUEST)
                .await;
            return;
        }
        if !*version_ok {
            debug!("unsupported websocket version");
            let _ = self
                .conn
                .write_minimal_response(StatusCode::UPGRADE_REQUIRED)
                .await;
            return;
        }
        let key = key.clone().expect("checked above");
        let max_frame_size = self.ctx.config.max_ws_frame_size;

        // An upgraded stream never reuses the HTTP cycle.
        self.conn.set_keep_alive(false);
        if let Err(e) = self.conn.prepare_request(&head, Trailers::new()) {
            self.synthesize_error(&e).await;
            return;
        }
        let scope = Scope::Websocket(self.ws_scope(&head, subprotocols.clone()));

        let (receiver, sender, mut ops) = conversation();
        let mut app_task = tokio::spawn(self.app.call(scope, receiver, sender));

        let mut reader = ws::MessageReader::new();
        let mut pending_receive: Option<oneshot::Sender<crate::Result<Event>>> = None;
        let mut connect_delivered = false;
        let mut accepted = false;
        let mut rejected = false;
        let mut local_close: Option<u16> = None;
        let mut disconnect_delivered = false;

        loop {
            let deadline = self.conn.deadline();
            let conn_closed = self.conn.is_closed();
            let service_receive = pending_receive.is_some()
                && connect_delivered
                && accepted
                && local_close.is_none()
                && !disconnect_delivered
                && !conn_closed;
            tokio::select! {
                biased;
                op = ops.recv() => match op {
                    Some(Op::Receive(cb)) => {
                        if !connect_delivered {
                            connect_delivered = true;
                            let _ = cb.send(Ok(Event::WsConnect));
                        } else if disconnect_delivered || rejected {
                            let _ = cb.send(Err(crate::Error::new_closed()));
                        } else if let Some(code) = local_close {
                            disconnect_delivered = true;
                            let _ = cb.send(Ok(Event::WsDisconnect {
                                code,
                                reason: String::new(),
                            }));
                        } else if !accepted {
                            let _ = cb.send(Err(crate::Error::new_invalid_state(
                                "receive before websocket accept",
                            )));
                        } else if self.conn.is_closed() {
                            disconnect_delivered = true;
                            let _ = cb.send(Ok(Event::WsDisconnect {
                                code: 1006,
                                reason: String::new(),
                            }));
                        } else {
                            pending_receive = Some(cb);
                        }
                    }
                    Some(Op::Send(event, cb)) => {
                        let result = self
                            .handle_ws_send(
                                event,
                                &key,
                                &mut accepted,
                                &mut rejected,
                                &mut local_close,
                                disconnect_delivered,
                            )
                            .await;
                        let _ = cb.send(result);
                        if rejected {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = reader.read(&mut self.conn, max_frame_size), if service_receive => {
                    let cb = pending_receive.take().expect("pending receive");
                    let event = self
                        .settle_ws_incoming(incoming, local_close.is_some())
                        .await;
                    disconnect_delivered |=
                        matches!(event, Ok(Event::WsDisconnect { .. }));
                    let _ = cb.send(event);
                }
                _ = tokio::time::sleep_until(deadline), if !conn_closed => {
                    debug!("websocket idle deadline expired");
                    self.conn.mark_closed();
                    if let Some(cb) = pending_receive.take() {
                        disconnect_delivered = true;
                        let _ = cb.send(Ok(Event::WsDisconnect {
                            code: 1006,
                            reason: String::new(),
                        }));
                    }
                }
            }
        }

        // A conversation the application walked away from still closes
        // cleanly on the wire.
        if accepted && local_close.is_none() && !self.conn.is_closed() {
            let _ = ws::write_close(&mut self.conn, 1000, "").await;
        }
        let _ = self.await_app(&mut app_task).await;
    }

    async fn settle_ws_incoming(
        &mut self,
        incoming: crate::Result<ws::WsIncoming>,
        closed_locally: bool,
    ) -> crate::Result<Event> {
        match incoming {
            Ok(ws::WsIncoming::Message(message)) => Ok(Event::WsMessage(message)),
            Ok(ws::WsIncoming::Close { code, reason }) => {
                // Echo the close, unless this is the peer answering ours.
                if !closed_locally {
                    let echo = if code == 1005 { 1000 } else { code };
                    let _ = ws::write_close(&mut self.conn, echo, "").await;
                }
                self.conn.mark_closed();
                Ok(Event::WsDisconnect { code, reason })
            }
            Ok(ws::WsIncoming::Disconnected) => {
                self.conn.mark_closed();
                Ok(Event::WsDisconnect {
                    code: 1006,
                    reason: String::new(),
                })
            }
            Ok(ws::WsIncoming::Violation { code, message }) => {
                debug!("websocket protocol violation: {}", message);
                let _ = ws::write_close(&mut self.conn, code, message).await;
                self.conn.mark_closed();
                Ok(Event::WsDisconnect {
                    code,
                    reason: message.to_owned(),
                })
            }
            Err(e) => {
                debug!("websocket read failed: {}", e);
                self.conn.mark_closed();
                Ok(Event::WsDisconnect {
                    code: 1006,
                    reason: String::new(),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_ws_send(
        &mut self,
        event: SendEvent,
        key: &str,
        accepted: &mut bool,
        rejected: &mut bool,
        local_close: &mut Option<u16>,
        disconnect_delivered: bool,
    ) -> crate::Result<()> {
        match event {
            SendEvent::WsAccept {
                subprotocol,
                headers,
            } => {
                if *accepted {
                    return Err(crate::Error::new_invalid_state(
                        "websocket already accepted",
                    ));
                }
                let headers = ws::handshake_headers(key, subprotocol.as_deref(), headers)?;
                self.conn
                    .write_head_now(StatusCode::SWITCHING_PROTOCOLS, &headers);
                self.conn.flush().await?;
                *accepted = true;
                Ok(())
            }
            SendEvent::WsClose { code, .. } if !*accepted => {
                // Rejecting the pending handshake.
                debug!("websocket handshake rejected by application ({})", code);
                *rejected = true;
                self.conn
                    .write_minimal_response(StatusCode::FORBIDDEN)
                    .await
            }
            SendEvent::WsClose { code, reason } => {
                if local_close.is_some() {
                    // close() is idempotent; one frame goes out.
                    return Ok(());
                }
                *local_close = Some(code);
                if !self.conn.is_closed() {
                    ws::write_close(&mut self.conn, code, &reason).await?;
                }
                Ok(())
            }
            SendEvent::WsSend(message) => {
                if !*accepted {
                    return Err(crate::Error::new_invalid_state(
                        "send before websocket accept",
                    ));
                }
                if local_close.is_some() || disconnect_delivered {
                    return Err(crate::Error::new_invalid_state(
                        "send after websocket close",
                    ));
                }
                if self.conn.is_closed() {
                    return Err(crate::Error::new_closed());
                }
                ws::write_message(&mut self.conn, &message).await
            }
            _ => Err(crate::Error::new_invalid_state(
                "event not valid for a websocket conversation",
            )),
        }
    }

    // ===== SSE =====

    async fn serve_sse(&mut self, head: RequestHead) {
        self.conn.set_keep_alive(false);
        if let Err(e) = self.conn.prepare_request(&head, Trailers::new()) {
            self.synthesize_error(&e).await;
            return;
        }
        let scope = Scope::Sse(self.sse_scope(&head));

        let (receiver, sender, mut ops) = conversation();
        let mut app_task = tokio::spawn(self.app.call(scope, receiver, sender));

        let mut pending_receive: Option<oneshot::Sender<crate::Result<Event>>> = None;
        let mut connect_delivered = false;
        let mut started = false;
        let mut disconnect_delivered = false;
        let mut keepalive: Option<tokio::time::Interval> = None;

        loop {
            let conn_closed = self.conn.is_closed();
            let peer_watch = pending_receive.is_some()
                && connect_delivered
                && !disconnect_delivered
                && !conn_closed;
            tokio::select! {
                biased;
                op = ops.recv() => match op {
                    Some(Op::Receive(cb)) => {
                        if !connect_delivered {
                            connect_delivered = true;
                            let _ = cb.send(Ok(Event::SseConnect));
                        } else if disconnect_delivered {
                            let _ = cb.send(Err(crate::Error::new_closed()));
                        } else if self.conn.is_closed() {
                            disconnect_delivered = true;
                            let _ = cb.send(Ok(Event::SseDisconnect));
                        } else {
                            pending_receive = Some(cb);
                        }
                    }
                    Some(Op::Send(event, cb)) => {
                        let result = self.handle_sse_send(event, &mut started).await;
                        if started && keepalive.is_none() {
                            if let Some(every) = self.ctx.config.sse_keepalive {
                                let mut interval = tokio::time::interval(every);
                                interval
                                    .set_missed_tick_behavior(
                                        tokio::time::MissedTickBehavior::Delay,
                                    );
                                interval.reset();
                                keepalive = Some(interval);
                            }
                        }
                        let _ = cb.send(result);
                    }
                    None => break,
                },
                // The only bytes an SSE peer produces are its close.
                filled = self.conn.fill_read(), if peer_watch => {
                    match filled {
                        Ok(0) | Err(_) => {
                            self.conn.mark_closed();
                            disconnect_delivered = true;
                            let cb = pending_receive.take().expect("pending receive");
                            let _ = cb.send(Ok(Event::SseDisconnect));
                        }
                        Ok(_) => {
                            // Stray request bytes on an event stream are
                            // discarded.
                            self.conn.io_mut().read_buf_mut().clear();
                        }
                    }
                }
                _ = tick(&mut keepalive), if started && !conn_closed => {
                    sse::serialize_keepalive(self.conn.io_mut().write_buf_mut());
                    if self.conn.flush().await.is_err() {
                        self.conn.mark_closed();
                    }
                }
            }
        }

        let _ = self.conn.flush().await;
        let _ = self.await_app(&mut app_task).await;
    }

    async fn handle_sse_send(
        &mut self,
        event: SendEvent,
        started: &mut bool,
    ) -> crate::Result<()> {
        match event {
            SendEvent::SseStart { status, headers } => {
                if *started {
                    return Err(crate::Error::new_invalid_state(
                        "sse stream already started",
                    ));
                }
                let headers = sse::stream_headers(headers);
                self.conn.write_head_now(status, &headers);
                self.conn.flush().await?;
                *started = true;
                Ok(())
            }
            SendEvent::SseSend(message) => {
                if !*started {
                    return Err(crate::Error::new_invalid_state(
                        "sse event before sse start",
                    ));
                }
                if self.conn.is_closed() {
                    // A gone peer swallows events without failing the app.
                    return Ok(());
                }
                sse::serialize_event(&message, self.conn.io_mut().write_buf_mut());
                if let Err(e) = self.conn.flush().await {
                    debug!("sse peer gone: {}", e);
                    self.conn.mark_closed();
                }
                Ok(())
            }
            _ => Err(crate::Error::new_invalid_state(
                "event not valid for an sse conversation",
            )),
        }
    }

    // ===== scope builders =====

    fn http_scope(&self, head: &RequestHead, trailers: Trailers) -> HttpScope {
        HttpScope {
            method: head.method.clone(),
            path: head.path.clone(),
            raw_path: head.raw_path.clone(),
            query_string: head.query.clone(),
            scheme: if self.ctx.tls {
                Scheme::Https
            } else {
                Scheme::Http
            },
            http_version: head.version,
            headers: head.headers.clone(),
            client: self.ctx.client,
            server: self.ctx.local,
            trailers,
        }
    }

    fn ws_scope(&self, head: &RequestHead, subprotocols: Vec<String>) -> WsScope {
        WsScope {
            path: head.path.clone(),
            raw_path: head.raw_path.clone(),
            query_string: head.query.clone(),
            scheme: if self.ctx.tls { Scheme::Wss } else { Scheme::Ws },
            http_version: head.version,
            headers: head.headers.clone(),
            client: self.ctx.client,
            server: self.ctx.local,
            subprotocols,
        }
    }

    fn sse_scope(&self, head: &RequestHead) -> SseScope {
        SseScope {
            path: head.path.clone(),
            raw_path: head.raw_path.clone(),
            query_string: head.query.clone(),
            scheme: if self.ctx.tls {
                Scheme::Https
            } else {
                Scheme::Http
            },
            http_version: head.version,
            headers: head.headers.clone(),
            client: self.ctx.client,
            server: self.ctx.local,
        }
    }
}

async fn tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn panic_message(join_err: &tokio::task::JoinError) -> String {
    // JoinError exposes the payload only by value; render what it shows.
    format!("{}", join_err)
}
