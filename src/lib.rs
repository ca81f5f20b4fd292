//! # pagi
//!
//! An asynchronous gateway protocol for web workloads, and the reference
//! server that speaks it.
//!
//! The protocol decouples applications from servers through a
//! three-callable contract: the server builds a [`Scope`] describing one
//! conversation (an HTTP exchange, a WebSocket, an SSE stream, or the
//! process lifespan) and invokes the application with it plus a
//! [`Receiver`] of inbound [`Event`]s and a [`Sender`] of outbound
//! [`SendEvent`]s. Everything the application can observe or effect flows
//! through those two handles.
//!
//! The bundled server implements the contract over HTTP/1.1 with
//! keep-alive and pipelining, chunked transfer coding in both directions,
//! zero-copy-ish file responses with range support, RFC 6455 WebSocket
//! upgrades, `text/event-stream` streams, a prefork multi-worker process
//! model with graceful shutdown, and buffered access logging.
//!
//! ## Example
//!
//! ```no_run
//! use http::StatusCode;
//! use pagi::{app_fn, Config, Scope, SendEvent, Server};
//!
//! let app = app_fn(|scope, mut receiver, mut sender| async move {
//!     match scope {
//!         Scope::Http(_) => {
//!             // Drain the request body.
//!             loop {
//!                 match receiver.next().await? {
//!                     pagi::Event::HttpRequest { more: false, .. } => break,
//!                     pagi::Event::HttpRequest { .. } => {}
//!                     _ => return Ok(()),
//!                 }
//!             }
//!             sender
//!                 .send(SendEvent::response_start(StatusCode::OK, vec![]))
//!                 .await?;
//!             sender.send(SendEvent::response_body("hello world\n")).await?;
//!         }
//!         _ => {}
//!     }
//!     Ok(())
//! });
//!
//! Server::new(Config::new(8080)).run(app).unwrap();
//! ```

#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod app;
mod config;
mod error;
mod event;
mod proto;
mod scope;
mod server;

pub use crate::app::{app_fn, AppFn, Application, Receiver, Sender};
pub use crate::config::Config;
#[cfg(feature = "tls")]
pub use crate::config::TlsConfig;
pub use crate::error::{Error, Result};
pub use crate::event::{BodyChunk, Event, Message, SendEvent, SseMessage};
pub use crate::scope::{
    HttpScope, LifespanScope, Scheme, Scope, SseScope, Trailers, WsScope,
};
pub use crate::server::{Bound, Handle, Server};
