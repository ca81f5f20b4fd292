//! The application entry contract.
//!
//! An application is one callable invoked per conversation with
//! `(scope, receiver, sender)`. It drives the conversation by awaiting
//! [`Receiver::next`] for inbound events and [`Sender::send`] for
//! outbound ones; the server mediates between those calls and the wire.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::event::{Event, SendEvent};
use crate::scope::Scope;

/// A PAGI application.
///
/// Implemented for free by [`app_fn`] closures; implement it directly when
/// the application carries state.
pub trait Application: Send + Sync + 'static {
    /// Handle one conversation to completion.
    fn call(
        &self,
        scope: Scope,
        receiver: Receiver,
        sender: Sender,
    ) -> BoxFuture<'static, crate::Result<()>>;
}

impl<A: Application + ?Sized> Application for Arc<A> {
    fn call(
        &self,
        scope: Scope,
        receiver: Receiver,
        sender: Sender,
    ) -> BoxFuture<'static, crate::Result<()>> {
        (**self).call(scope, receiver, sender)
    }
}

/// Create an [`Application`] from an async function.
///
/// # Example
///
/// ```
/// use pagi::{app_fn, Scope, SendEvent};
/// use http::StatusCode;
///
/// let app = app_fn(|scope, mut receiver, mut sender| async move {
///     if let Scope::Http(_) = scope {
///         let _ = receiver.next().await?;
///         sender
///             .send(SendEvent::response_start(StatusCode::OK, vec![]))
///             .await?;
///         sender.send(SendEvent::response_body("hello")).await?;
///     }
///     Ok(())
/// });
/// ```
pub fn app_fn<F, R>(f: F) -> AppFn<F>
where
    F: Fn(Scope, Receiver, Sender) -> R + Send + Sync + 'static,
    R: Future<Output = crate::Result<()>> + Send + 'static,
{
    AppFn { f }
}

/// Application returned by [`app_fn`].
pub struct AppFn<F> {
    f: F,
}

impl<F, R> Application for AppFn<F>
where
    F: Fn(Scope, Receiver, Sender) -> R + Send + Sync + 'static,
    R: Future<Output = crate::Result<()>> + Send + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receiver: Receiver,
        sender: Sender,
    ) -> BoxFuture<'static, crate::Result<()>> {
        Box::pin((self.f)(scope, receiver, sender))
    }
}

impl<F> fmt::Debug for AppFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppFn")
    }
}

/// One operation travelling from the application task to the connection
/// driver. Each carries a completion slot so the caller observes exactly
/// when (and whether) the driver honored it.
pub(crate) enum Op {
    Receive(oneshot::Sender<crate::Result<Event>>),
    Send(SendEvent, oneshot::Sender<crate::Result<()>>),
}

/// Build the paired application handles and the driver-side op stream for
/// one conversation.
pub(crate) fn conversation() -> (Receiver, Sender, mpsc::Receiver<Op>) {
    // Capacity 1 keeps the application lock-step with the driver: an op is
    // only in flight once the driver is ready to look at it.
    let (tx, rx) = mpsc::channel(1);
    (
        Receiver { tx: tx.clone() },
        Sender { tx },
        rx,
    )
}

/// The application-facing source of inbound [`Event`]s.
///
/// Events are produced lazily: the server reads from the transport only
/// when `next` is awaited.
pub struct Receiver {
    tx: mpsc::Sender<Op>,
}

impl Receiver {
    /// Await the next inbound event for this conversation.
    ///
    /// Returns [`Error::is_closed`](crate::Error::is_closed) once the
    /// conversation's connection is gone and all terminal events have been
    /// delivered.
    pub async fn next(&mut self) -> crate::Result<Event> {
        let (cb, answer) = oneshot::channel();
        self.tx
            .send(Op::Receive(cb))
            .await
            .map_err(|_| crate::Error::new_closed())?;
        answer.await.map_err(|_| crate::Error::new_closed())?
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Receiver")
    }
}

/// The application-facing sink for outbound [`SendEvent`]s.
pub struct Sender {
    tx: mpsc::Sender<Op>,
}

impl Sender {
    /// Commit one outbound event.
    ///
    /// Resolves once the event has been accepted into the outbound buffer.
    /// Fails with [`Error::is_invalid_state`](crate::Error::is_invalid_state)
    /// when the event is illegal for the conversation's current phase, and
    /// with [`Error::is_closed`](crate::Error::is_closed) when the
    /// connection is gone.
    pub async fn send(&mut self, event: SendEvent) -> crate::Result<()> {
        let (cb, answer) = oneshot::channel();
        self.tx
            .send(Op::Send(event, cb))
            .await
            .map_err(|_| crate::Error::new_closed())?;
        answer.await.map_err(|_| crate::Error::new_closed())?
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sender")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[tokio::test]
    async fn ops_preserve_call_order() {
        let (mut receiver, mut sender, mut ops) = conversation();

        let driver = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(op) = ops.recv().await {
                match op {
                    Op::Receive(cb) => {
                        seen.push("receive");
                        let _ = cb.send(Ok(Event::HttpDisconnect));
                    }
                    Op::Send(_, cb) => {
                        seen.push("send");
                        let _ = cb.send(Ok(()));
                    }
                }
            }
            seen
        });

        let _ = receiver.next().await.unwrap();
        sender
            .send(SendEvent::response_body("x"))
            .await
            .unwrap();
        let _ = receiver.next().await.unwrap();
        drop(receiver);
        drop(sender);

        assert_eq!(driver.await.unwrap(), vec!["receive", "send", "receive"]);
    }

    #[tokio::test]
    async fn dropped_driver_reports_closed() {
        let (mut receiver, mut sender, ops) = conversation();
        drop(ops);

        assert!(receiver.next().await.unwrap_err().is_closed());
        assert!(sender
            .send(SendEvent::response_body("x"))
            .await
            .unwrap_err()
            .is_closed());
    }
}
