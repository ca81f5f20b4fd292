//! Listener socket setup and per-connection socket options.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Config;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct TcpKeepaliveConfig {
    time: Option<Duration>,
    interval: Option<Duration>,
    retries: Option<u32>,
}

impl TcpKeepaliveConfig {
    pub(crate) fn from_config(config: &Config) -> TcpKeepaliveConfig {
        TcpKeepaliveConfig {
            time: config.tcp_keepalive,
            interval: config.tcp_keepalive_interval,
            retries: config.tcp_keepalive_retries,
        }
    }

    /// Converts into a `socket2::TcpKeepalive` if there is any keep alive configuration.
    pub(crate) fn into_socket2(self) -> Option<TcpKeepalive> {
        let mut dirty = false;
        let mut ka = TcpKeepalive::new();
        if let Some(time) = self.time {
            ka = ka.with_time(time);
            dirty = true
        }
        if let Some(interval) = self.interval {
            ka = Self::ka_with_interval(ka, interval, &mut dirty)
        };
        if let Some(retries) = self.retries {
            ka = Self::ka_with_retries(ka, retries, &mut dirty)
        };
        if dirty {
            Some(ka)
        } else {
            None
        }
    }

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_vendor = "apple",
        windows,
    ))]
    fn ka_with_interval(ka: TcpKeepalive, interval: Duration, dirty: &mut bool) -> TcpKeepalive {
        *dirty = true;
        ka.with_interval(interval)
    }

    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_vendor = "apple",
        windows,
    )))]
    fn ka_with_interval(ka: TcpKeepalive, _: Duration, _: &mut bool) -> TcpKeepalive {
        ka // no-op as keepalive interval is not supported on this platform
    }

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_vendor = "apple",
    ))]
    fn ka_with_retries(ka: TcpKeepalive, retries: u32, dirty: &mut bool) -> TcpKeepalive {
        *dirty = true;
        ka.with_retries(retries)
    }

    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_vendor = "apple",
    )))]
    fn ka_with_retries(ka: TcpKeepalive, _: u32, _: &mut bool) -> TcpKeepalive {
        ka // no-op as keepalive retries is not supported on this platform
    }
}

/// Apply socket options to a freshly accepted stream.
pub(crate) fn configure_stream(stream: &TcpStream, keepalive: &Option<TcpKeepalive>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("error trying to set TCP_NODELAY: {}", e);
    }
    if let Some(ka) = keepalive {
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(ka) {
            debug!("error trying to set TCP keepalive: {}", e);
        }
    }
}

/// Bind the configured address.
///
/// The listener is returned in blocking mode so it can be inherited
/// across a fork; workers flip it to non-blocking before handing it to
/// the runtime.
pub(crate) fn bind(config: &Config) -> crate::Result<StdTcpListener> {
    let addr = config.addr();
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::Error::new_listen)?;
    socket.bind(&addr.into()).map_err(crate::Error::new_listen)?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(crate::Error::new_listen)?;
    let listener: StdTcpListener = socket.into();
    debug!("listening on {}", listener.local_addr().map_err(crate::Error::new_listen)?);
    Ok(listener)
}

/// Whether an accept error concerns only the connection that failed, not
/// the listener itself.
pub(crate) fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
