//! Graceful-shutdown plumbing: one signal side, many watchers.

use tokio::sync::{mpsc, watch};

/// Uninhabited; the drained channel only ever closes.
enum Never {}

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = watch::channel(false);
    let (drained_tx, drained_rx) = mpsc::channel::<Never>(1);
    (
        Signal { tx, drained_rx },
        Watch {
            rx,
            _drained_tx: drained_tx,
        },
    )
}

/// Held by the worker. Signals the drain and then waits until every
/// [`Watch`] has been dropped.
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
    drained_rx: mpsc::Receiver<Never>,
}

/// Held (cloned) by every in-flight connection.
#[derive(Clone)]
pub(crate) struct Watch {
    rx: watch::Receiver<bool>,
    _drained_tx: mpsc::Sender<Never>,
}

impl Signal {
    /// Begin draining and resolve once all watchers are gone.
    pub(crate) async fn drain(mut self) {
        let _ = self.tx.send(true);
        match self.drained_rx.recv().await {
            Some(never) => match never {},
            None => {}
        }
    }
}

impl Watch {
    /// Resolves when the drain is signaled. Resolves immediately if it
    /// already was.
    pub(crate) async fn signaled(&mut self) {
        // An error means the Signal is gone, which also means drain.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub(crate) fn is_signaled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_resolves_after_watchers_drop() {
        let (signal, watch) = channel();
        let extra = watch.clone();

        let task = tokio::spawn(async move {
            let mut watch = watch;
            watch.signaled().await;
            drop(watch);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(extra);
        });

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn signaled_resolves_immediately_when_already_drained() {
        let (signal, mut watch) = channel();
        let drain = tokio::spawn(signal.drain());
        watch.signaled().await;
        assert!(watch.is_signaled());
        drop(watch);
        drain.await.unwrap();
    }
}
