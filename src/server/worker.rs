//! One worker: accept loop, connection tasks, request cap, graceful drain.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::config::Config;
use crate::server::accesslog::AccessLog;
use crate::server::dispatch::{self, ConnContext};
use crate::server::lifespan::Lifespan;
use crate::server::{drain, tcp, Hooks};

/// Counts completed requests against the per-worker cap.
pub(crate) struct RequestCounter {
    count: AtomicU64,
    max: u64,
    hit: AtomicBool,
    notify: Notify,
}

impl RequestCounter {
    pub(crate) fn new(max: u64) -> Arc<RequestCounter> {
        Arc::new(RequestCounter {
            count: AtomicU64::new(0),
            max,
            hit: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Record one completed request. Returns true once the cap is hit.
    pub(crate) fn completed(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max == 0 || count < self.max {
            return false;
        }
        if !self.hit.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
        true
    }

    /// Resolves once the cap has been reached; never, when uncapped.
    pub(crate) async fn cap_reached(&self) {
        if self.max == 0 {
            return std::future::pending().await;
        }
        loop {
            if self.hit.load(Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Serve until `shutdown` resolves, the request cap is reached, or the
/// listener dies. Runs the startup hooks and the lifespan conversation
/// around the accept loop and drains with the configured grace on the
/// way out.
pub(crate) async fn serve<A, F>(
    config: Arc<Config>,
    hooks: Arc<Hooks>,
    listener: TcpListener,
    app: Arc<A>,
    shutdown: F,
) -> crate::Result<()>
where
    A: Application,
    F: Future<Output = ()>,
{
    let log = Arc::new(
        AccessLog::open(
            config.access_log_path.as_deref(),
            config.access_log_buffer_size,
        )
        .map_err(crate::Error::new_io)?,
    );
    let flush_timer = spawn_flush_timer(&config, &log);

    hooks.run_startup().await;

    let mut lifespan = Lifespan::start(&app);
    if let Err(e) = lifespan.startup().await {
        lifespan.finish().await;
        if let Some(task) = flush_timer {
            task.abort();
        }
        return Err(e);
    }

    #[cfg(feature = "tls")]
    let tls_acceptor = match &config.tls {
        Some(tls) => Some(crate::server::tls::acceptor(tls)?),
        None => None,
    };

    let (signal, watch) = drain::channel();
    let counter = RequestCounter::new(config.max_requests);
    let tcp_keepalive = tcp::TcpKeepaliveConfig::from_config(&config).into_socket2();
    let mut tasks: JoinSet<()> = JoinSet::new();
    let listener_addr = listener.local_addr().map_err(crate::Error::new_listen)?;
    info!("worker {} serving on {}", std::process::id(), listener_addr);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("worker {} shutting down", std::process::id());
                break;
            }
            _ = counter.cap_reached() => {
                info!(
                    "worker {} served its request cap; recycling",
                    std::process::id()
                );
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tcp::configure_stream(&stream, &tcp_keepalive);
                    let local = stream.local_addr().unwrap_or(listener_addr);
                    let ctx = ConnContext {
                        config: config.clone(),
                        client: peer,
                        local,
                        tls: config.is_tls(),
                        log: Arc::downgrade(&log),
                        watch: watch.clone(),
                        counter: counter.clone(),
                    };
                    let app = app.clone();
                    #[cfg(feature = "tls")]
                    if let Some(acceptor) = tls_acceptor.clone() {
                        tasks.spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    dispatch::serve_connection(stream, app, ctx).await
                                }
                                Err(e) => debug!("tls handshake failed: {}", e),
                            }
                        });
                        continue;
                    }
                    tasks.spawn(dispatch::serve_connection(stream, app, ctx));
                }
                Err(e) => {
                    if tcp::is_connection_error(&e) {
                        continue;
                    }
                    // Likely fd exhaustion; back off instead of spinning.
                    error!("accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            },
            // Reap finished connection tasks; a `None` (empty set) simply
            // disables this branch for the round.
            Some(_) = tasks.join_next() => {}
        }
    }

    drop(listener);
    drop(watch);
    debug!("draining {} connections", tasks.len());
    if tokio::time::timeout(config.shutdown_grace, signal.drain())
        .await
        .is_err()
    {
        warn!("drain grace expired; closing {} connections", tasks.len());
        tasks.abort_all();
    }
    while tasks.join_next().await.is_some() {}

    match tokio::time::timeout(config.shutdown_grace, lifespan.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("lifespan shutdown reported failure: {}", e),
        Err(_) => warn!("lifespan shutdown did not finish within grace"),
    }
    lifespan.finish().await;

    hooks.run_shutdown().await;

    log.flush();
    if let Some(task) = flush_timer {
        task.abort();
    }
    Ok(())
}

fn spawn_flush_timer(
    config: &Config,
    log: &Arc<AccessLog>,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.access_log_flush_interval.is_zero() {
        return None;
    }
    let interval = config.access_log_flush_interval;
    let log = Arc::downgrade(log);
    Some(tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;
        loop {
            timer.tick().await;
            match log.upgrade() {
                Some(log) => log.flush(),
                None => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_uncapped_never_fires() {
        let counter = RequestCounter::new(0);
        for _ in 0..100 {
            assert!(!counter.completed());
        }
        let reached = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            counter.cap_reached(),
        )
        .await;
        assert!(reached.is_err());
    }

    #[tokio::test]
    async fn counter_fires_at_cap() {
        let counter = RequestCounter::new(3);
        assert!(!counter.completed());
        assert!(!counter.completed());
        assert!(counter.completed());
        counter.cap_reached().await;
        // Further completions stay capped.
        assert!(counter.completed());
    }
}
