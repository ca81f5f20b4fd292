//! The once-per-process startup/shutdown conversation.

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::app::{conversation, Application, Op};
use crate::event::{Event, SendEvent};
use crate::scope::{LifespanScope, Scope};

/// Driver side of the lifespan conversation.
///
/// Started before the accept loop; `startup` must resolve before any
/// connection is served, and `shutdown` runs after the drain. The
/// conversation shares nothing with connection conversations.
pub(crate) struct Lifespan {
    ops: mpsc::Receiver<Op>,
    task: tokio::task::JoinHandle<crate::Result<()>>,
    gone: bool,
}

impl Lifespan {
    pub(crate) fn start<A: Application>(app: &A) -> Lifespan {
        let (receiver, sender, ops) = conversation();
        let scope = Scope::Lifespan(LifespanScope::new());
        let task = tokio::spawn(app.call(scope, receiver, sender));
        Lifespan {
            ops,
            task,
            gone: false,
        }
    }

    /// Deliver `LifespanStartup` and wait for the application's verdict.
    ///
    /// An application that finishes its lifespan conversation without
    /// sending any startup event simply doesn't participate; serving
    /// proceeds. An explicit `StartupFailed` is an error and the worker
    /// must not serve.
    pub(crate) async fn startup(&mut self) -> crate::Result<()> {
        loop {
            match self.ops.recv().await {
                None => {
                    self.gone = true;
                    self.log_early_exit().await;
                    return Ok(());
                }
                Some(Op::Receive(cb)) => {
                    let _ = cb.send(Ok(Event::LifespanStartup));
                }
                Some(Op::Send(SendEvent::StartupComplete, cb)) => {
                    debug!("lifespan startup complete");
                    let _ = cb.send(Ok(()));
                    return Ok(());
                }
                Some(Op::Send(SendEvent::StartupFailed { message }, cb)) => {
                    error!("lifespan startup failed: {}", message);
                    let _ = cb.send(Ok(()));
                    return Err(crate::Error::new_lifespan(message));
                }
                Some(Op::Send(_, cb)) => {
                    let _ = cb.send(Err(crate::Error::new_invalid_state(
                        "event not valid for a lifespan conversation",
                    )));
                }
            }
        }
    }

    /// Deliver `LifespanShutdown` and wait for the completion event.
    /// The caller bounds this with the shutdown grace window.
    pub(crate) async fn shutdown(&mut self) -> crate::Result<()> {
        if self.gone {
            return Ok(());
        }
        loop {
            match self.ops.recv().await {
                None => {
                    self.gone = true;
                    return Ok(());
                }
                Some(Op::Receive(cb)) => {
                    let _ = cb.send(Ok(Event::LifespanShutdown));
                }
                Some(Op::Send(SendEvent::ShutdownComplete, cb)) => {
                    debug!("lifespan shutdown complete");
                    let _ = cb.send(Ok(()));
                    return Ok(());
                }
                Some(Op::Send(SendEvent::ShutdownFailed { message }, cb)) => {
                    error!("lifespan shutdown failed: {}", message);
                    let _ = cb.send(Ok(()));
                    return Err(crate::Error::new_lifespan(message));
                }
                Some(Op::Send(_, cb)) => {
                    let _ = cb.send(Err(crate::Error::new_invalid_state(
                        "event not valid for a lifespan conversation",
                    )));
                }
            }
        }
    }

    /// Tear the conversation down; the application task gets no further
    /// events.
    pub(crate) async fn finish(mut self) {
        self.ops.close();
        drop(self.ops);
        if !self.task.is_finished() {
            self.task.abort();
        }
        match (&mut self.task).await {
            Ok(Ok(())) | Err(_) => {}
            Ok(Err(e)) if e.is_closed() => {}
            Ok(Err(e)) => warn!("lifespan application error: {}", e),
        }
    }

    async fn log_early_exit(&mut self) {
        if !self.task.is_finished() {
            return;
        }
        match (&mut self.task).await {
            Ok(Ok(())) => debug!("application does not participate in lifespan"),
            Ok(Err(e)) => warn!("lifespan application error: {}", e),
            Err(e) if e.is_panic() => error!("lifespan application panicked: {}", e),
            Err(_) => {}
        }
    }
}
