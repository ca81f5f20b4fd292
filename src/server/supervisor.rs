//! Process-level supervision: the single-worker runtime and the unix
//! prefork parent.
//!
//! The parent binds the listen socket, forks the configured number of
//! workers, and then only harvests exits, enforces the respawn rate
//! limit, and forwards shutdown signals. Workers inherit the socket and
//! accept from it directly; the kernel arbitrates.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use tracing::info;

use crate::app::Application;
use crate::config::Config;
use crate::server::{tcp, worker, Hooks};

pub(crate) fn run<A: Application>(
    config: Config,
    hooks: Arc<Hooks>,
    app: A,
) -> crate::Result<()> {
    let listener = tcp::bind(&config)?;
    if config.workers == 0 {
        return run_single(config, hooks, listener, app);
    }
    #[cfg(unix)]
    {
        prefork::run(config, hooks, listener, app)
    }
    #[cfg(not(unix))]
    {
        tracing::warn!("multi-worker mode requires unix; serving single-worker");
        run_single(config, hooks, listener, app)
    }
}

/// Serve in-process on a fresh current-thread runtime until a signal.
fn run_single<A: Application>(
    config: Config,
    hooks: Arc<Hooks>,
    listener: StdTcpListener,
    app: A,
) -> crate::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(crate::Error::new_io)?;
    runtime.block_on(async move {
        listener
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        let listener =
            tokio::net::TcpListener::from_std(listener).map_err(crate::Error::new_listen)?;
        worker::serve(
            Arc::new(config),
            hooks,
            listener,
            Arc::new(app),
            shutdown_signal(),
        )
        .await
    })
}

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(_) => return std::future::pending().await,
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

#[cfg(unix)]
mod prefork {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use tracing::{debug, error, warn};

    /// Consecutive sub-second exits of one slot before the parent quits.
    const MAX_STRIKES: u32 = 5;
    /// Minimum spacing between respawns of the same slot.
    const RESPAWN_INTERVAL: Duration = Duration::from_secs(1);

    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_shutdown_signal(_signum: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    struct Slot {
        pid: libc::pid_t,
        spawned_at: Instant,
        strikes: u32,
    }

    pub(super) fn run<A: Application>(
        config: Config,
        hooks: Arc<Hooks>,
        listener: StdTcpListener,
        app: A,
    ) -> crate::Result<()> {
        let app = Arc::new(app);
        unsafe {
            libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
            // Reaping happens via waitpid in the supervision loop.
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        info!(
            "supervisor {} starting {} workers",
            std::process::id(),
            config.workers
        );
        let mut slots = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            slots.push(spawn_worker(&config, &hooks, &listener, &app)?);
        }

        let exit = loop {
            if SHUTDOWN.load(Ordering::SeqCst) {
                break Ok(());
            }
            match harvest() {
                Some((pid, status)) => {
                    let Some(slot) = slots.iter_mut().find(|s| s.pid == pid) else {
                        debug!("reaped unknown child {}", pid);
                        continue;
                    };
                    if status != 0 {
                        warn!("worker {} exited with status {}", pid, status);
                    } else {
                        info!("worker {} exited", pid);
                    }
                    let lived = slot.spawned_at.elapsed();
                    if lived < RESPAWN_INTERVAL {
                        slot.strikes += 1;
                        if slot.strikes >= MAX_STRIKES {
                            error!(
                                "worker slot failed {} times in under {:?} each; giving up",
                                slot.strikes, RESPAWN_INTERVAL
                            );
                            break Err(crate::Error::new_lifespan(
                                "worker slot keeps failing at startup".into(),
                            ));
                        }
                        std::thread::sleep(RESPAWN_INTERVAL - lived);
                    } else {
                        slot.strikes = 0;
                    }
                    if SHUTDOWN.load(Ordering::SeqCst) {
                        break Ok(());
                    }
                    *slot = spawn_worker(&config, &hooks, &listener, &app)?;
                }
                None => std::thread::sleep(Duration::from_millis(100)),
            }
        };

        shutdown_workers(&mut slots, config.shutdown_grace);
        exit
    }

    /// One non-blocking reap. Returns the pid and exit status.
    fn harvest() -> Option<(libc::pid_t, i32)> {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return None;
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            0
        };
        Some((pid, code))
    }

    fn spawn_worker<A: Application>(
        config: &Config,
        hooks: &Arc<Hooks>,
        listener: &StdTcpListener,
        app: &Arc<A>,
    ) -> crate::Result<Slot> {
        let child_listener = listener.try_clone().map_err(crate::Error::new_listen)?;
        match unsafe { libc::fork() } {
            -1 => Err(crate::Error::new_listen(std::io::Error::last_os_error())),
            0 => {
                // Child: inherit the socket, run a worker runtime, and
                // never return into the supervision loop.
                unsafe {
                    libc::signal(libc::SIGINT, libc::SIG_DFL);
                    libc::signal(libc::SIGTERM, libc::SIG_DFL);
                }
                let code = match run_single_child(
                    config.clone(),
                    hooks.clone(),
                    child_listener,
                    app.clone(),
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("worker failed: {}", e);
                        1
                    }
                };
                std::process::exit(code);
            }
            pid => {
                info!("spawned worker {}", pid);
                Ok(Slot {
                    pid,
                    spawned_at: Instant::now(),
                    strikes: 0,
                })
            }
        }
    }

    fn run_single_child<A: Application>(
        config: Config,
        hooks: Arc<Hooks>,
        listener: StdTcpListener,
        app: Arc<A>,
    ) -> crate::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(crate::Error::new_io)?;
        runtime.block_on(async move {
            listener
                .set_nonblocking(true)
                .map_err(crate::Error::new_listen)?;
            let listener = tokio::net::TcpListener::from_std(listener)
                .map_err(crate::Error::new_listen)?;
            worker::serve(
                Arc::new(config),
                hooks,
                listener,
                app,
                super::shutdown_signal(),
            )
            .await
        })
    }

    fn shutdown_workers(slots: &mut [Slot], grace: Duration) {
        let mut live: Vec<libc::pid_t> = slots.iter().map(|s| s.pid).collect();
        info!("stopping {} workers", live.len());
        for pid in &live {
            unsafe {
                libc::kill(*pid, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + grace;
        while !live.is_empty() && Instant::now() < deadline {
            if let Some((pid, _)) = harvest() {
                live.retain(|p| *p != pid);
            } else {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        if !live.is_empty() {
            warn!("{} workers still alive after grace; killing", live.len());
            for pid in &live {
                unsafe {
                    libc::kill(*pid, libc::SIGKILL);
                }
            }
            while !live.is_empty() {
                if let Some((pid, _)) = harvest() {
                    live.retain(|p| *p != pid);
                } else {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}
