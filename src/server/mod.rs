//! The reference server: listener, connection driver, worker model.

use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use crate::app::Application;
use crate::config::Config;

pub(crate) mod accesslog;
pub(crate) mod conn;
pub(crate) mod dispatch;
pub(crate) mod drain;
pub(crate) mod io;
pub(crate) mod lifespan;
pub(crate) mod supervisor;
pub(crate) mod tcp;
#[cfg(feature = "tls")]
pub(crate) mod tls;
pub(crate) mod upgrade;
pub(crate) mod worker;

/// A configured server, ready to run or bind.
///
/// ```no_run
/// use http::StatusCode;
/// use pagi::{app_fn, Config, SendEvent, Server};
///
/// let app = app_fn(|_scope, mut receiver, mut sender| async move {
///     let _ = receiver.next().await?;
///     sender
///         .send(SendEvent::response_start(StatusCode::OK, vec![]))
///         .await?;
///     sender.send(SendEvent::response_body("hello\n")).await?;
///     Ok(())
/// });
///
/// Server::new(Config::new(8080)).run(app).unwrap();
/// ```
#[derive(Debug)]
pub struct Server {
    config: Config,
    hooks: Hooks,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            config,
            hooks: Hooks::default(),
        }
    }

    /// Register a hook to run in each worker process before the lifespan
    /// conversation and the accept loop. Hooks run in registration order.
    pub fn on_startup<F, R>(mut self, hook: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Future<Output = ()> + Send + 'static,
    {
        self.hooks.startup.push(Box::new(move || Box::pin(hook())));
        self
    }

    /// Register a hook to run in each worker process after the drain and
    /// the lifespan shutdown. Hooks run in registration order.
    pub fn on_shutdown<F, R>(mut self, hook: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Future<Output = ()> + Send + 'static,
    {
        self.hooks.shutdown.push(Box::new(move || Box::pin(hook())));
        self
    }

    /// Bind and serve, blocking the calling thread until shutdown.
    ///
    /// With `workers == 0` the accept loop runs in-process on its own
    /// single-threaded runtime; with `workers >= 1` (unix) the process
    /// forks that many workers sharing the listen socket and supervises
    /// them until signaled.
    pub fn run<A: Application>(self, app: A) -> crate::Result<()> {
        supervisor::run(self.config, Arc::new(self.hooks), app)
    }

    /// Bind the listen socket without serving yet.
    ///
    /// Useful for ephemeral ports and embedding: the bound address is
    /// known and a [`Handle`] can stop the server programmatically.
    pub fn bind(self) -> crate::Result<Bound> {
        let listener = tcp::bind(&self.config)?;
        let local_addr = listener.local_addr().map_err(crate::Error::new_listen)?;
        Ok(Bound {
            config: self.config,
            hooks: Arc::new(self.hooks),
            listener,
            local_addr,
            handle: Handle::new(),
        })
    }
}

type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered worker-side startup and shutdown callbacks.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) startup: Vec<Hook>,
    pub(crate) shutdown: Vec<Hook>,
}

impl Hooks {
    pub(crate) async fn run_startup(&self) {
        for hook in &self.startup {
            hook().await;
        }
    }

    pub(crate) async fn run_shutdown(&self) {
        for hook in &self.shutdown {
            hook().await;
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("startup", &self.startup.len())
            .field("shutdown", &self.shutdown.len())
            .finish()
    }
}

/// A server with its listen socket bound, not yet serving.
#[derive(Debug)]
pub struct Bound {
    config: Config,
    hooks: Arc<Hooks>,
    listener: StdTcpListener,
    local_addr: SocketAddr,
    handle: Handle,
}

impl Bound {
    /// The actually-bound address (resolves ephemeral ports).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A cloneable handle that can stop this server.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serve single-worker on the current runtime until the [`Handle`]
    /// fires or a shutdown signal arrives.
    pub async fn serve<A: Application>(self, app: A) -> crate::Result<()> {
        let handle = self.handle;
        self.listener
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        let listener =
            tokio::net::TcpListener::from_std(self.listener).map_err(crate::Error::new_listen)?;
        let shutdown = async move {
            tokio::select! {
                _ = handle.signaled() => {}
                _ = supervisor::shutdown_signal() => {}
            }
        };
        worker::serve(
            Arc::new(self.config),
            self.hooks,
            listener,
            Arc::new(app),
            shutdown,
        )
        .await
    }
}

/// Requests a graceful stop of the server it was taken from.
#[derive(Debug, Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl Handle {
    fn new() -> Handle {
        Handle {
            inner: Arc::new(HandleInner {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Begin graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) async fn signaled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_signals_before_and_after_wait() {
        let handle = Handle::new();
        handle.shutdown();
        handle.signaled().await;

        let handle = Handle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.signaled().await })
        };
        tokio::task::yield_now().await;
        handle.shutdown();
        waiter.await.unwrap();
    }

    #[test]
    fn bind_reports_ephemeral_addr() {
        let bound = Server::new(Config::new(0)).bind().unwrap();
        assert_ne!(bound.local_addr().port(), 0);
    }
}
