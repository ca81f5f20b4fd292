//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`Server`](crate::Server).
///
/// Every limit has a production-safe default; only the port is required.
///
/// ```
/// use pagi::Config;
/// use std::time::Duration;
///
/// let config = Config::new(8080)
///     .workers(4)
///     .max_requests(10_000)
///     .timeout(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) host: IpAddr,
    pub(crate) port: u16,
    pub(crate) workers: usize,
    pub(crate) max_requests: u64,
    pub(crate) timeout: Duration,
    pub(crate) max_header_size: usize,
    pub(crate) max_header_count: usize,
    pub(crate) max_body_size: u64,
    pub(crate) max_ws_frame_size: usize,
    pub(crate) max_receive_queue: usize,
    pub(crate) access_log_path: Option<PathBuf>,
    pub(crate) access_log_buffer_size: usize,
    pub(crate) access_log_flush_interval: Duration,
    pub(crate) shutdown_grace: Duration,
    pub(crate) sse_keepalive: Option<Duration>,
    pub(crate) tcp_keepalive: Option<Duration>,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) tcp_keepalive_retries: Option<u32>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsConfig>,
}

impl Config {
    /// Creates a configuration listening on `127.0.0.1:port`.
    ///
    /// A port of `0` binds an ephemeral port.
    pub fn new(port: u16) -> Config {
        Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            workers: 0,
            max_requests: 0,
            timeout: Duration::from_secs(30),
            max_header_size: 16_384,
            max_header_count: 100,
            max_body_size: 1024 * 1024,
            max_ws_frame_size: 1024 * 1024,
            max_receive_queue: 1024 * 1024,
            access_log_path: None,
            access_log_buffer_size: 100,
            access_log_flush_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            sse_keepalive: None,
            tcp_keepalive: None,
            tcp_keepalive_interval: None,
            tcp_keepalive_retries: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Sets the bind address.
    ///
    /// Default is `127.0.0.1`.
    pub fn host(mut self, host: impl Into<IpAddr>) -> Self {
        self.host = host.into();
        self
    }

    /// Number of forked worker processes. `0` serves in-process.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Per-worker request cap before the worker exits and is respawned.
    /// `0` means unlimited.
    pub fn max_requests(mut self, max: u64) -> Self {
        self.max_requests = max;
        self
    }

    /// Per-request idle timeout, reset on every byte read or written.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Byte cap on a request's header block. Exceeding it fails with 431.
    pub fn max_header_size(mut self, bytes: usize) -> Self {
        self.max_header_size = bytes;
        self
    }

    /// Cap on the number of request headers. Exceeding it fails with 400.
    pub fn max_header_count(mut self, count: usize) -> Self {
        self.max_header_count = count;
        self
    }

    /// Byte cap on a request body. Exceeding it fails with 413.
    pub fn max_body_size(mut self, bytes: u64) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Cap on a single inbound WebSocket frame (and on a reassembled
    /// fragmented message).
    pub fn max_ws_frame_size(mut self, bytes: usize) -> Self {
        self.max_ws_frame_size = bytes;
        self
    }

    /// Backpressure threshold for inbound buffering.
    pub fn max_receive_queue(mut self, bytes: usize) -> Self {
        self.max_receive_queue = bytes;
        self
    }

    /// Appends access log entries to the given file. `None` logs to stdout.
    pub fn access_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.access_log_path = Some(path.into());
        self
    }

    /// Entries buffered before a size-triggered flush. A value of `1` or
    /// less disables buffering entirely.
    pub fn access_log_buffer_size(mut self, entries: usize) -> Self {
        self.access_log_buffer_size = entries;
        self
    }

    /// Interval between timed access log flushes, honored to millisecond
    /// precision. A zero duration disables the flush timer.
    pub fn access_log_flush_interval(mut self, interval: Duration) -> Self {
        self.access_log_flush_interval = interval;
        self
    }

    /// Drain window for graceful shutdown before in-flight connections are
    /// forcibly closed.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Emit `:keepalive` comment lines on idle SSE streams at this
    /// interval. Disabled by default.
    pub fn sse_keepalive(mut self, interval: Duration) -> Self {
        self.sse_keepalive = Some(interval);
        self
    }

    /// Enable TCP keepalive probes on accepted connections, starting
    /// after the connection has been idle for `time`. Disabled by
    /// default.
    pub fn tcp_keepalive(mut self, time: Duration) -> Self {
        self.tcp_keepalive = Some(time);
        self
    }

    /// Duration between successive TCP keepalive probes.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Number of unacknowledged TCP keepalive probes before the
    /// connection is dropped.
    pub fn tcp_keepalive_retries(mut self, retries: u32) -> Self {
        self.tcp_keepalive_retries = Some(retries);
        self
    }

    /// Serve TLS with the given certificate chain and private key.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub(crate) fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

/// TLS material locations for the `tls` feature.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub(crate) cert: PathBuf,
    pub(crate) key: PathBuf,
    pub(crate) ca: Option<PathBuf>,
}

#[cfg(feature = "tls")]
impl TlsConfig {
    /// PEM certificate chain and PEM private key.
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> TlsConfig {
        TlsConfig {
            cert: cert.into(),
            key: key.into(),
            ca: None,
        }
    }

    /// Optional CA bundle for client certificate verification.
    pub fn ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.ca = Some(ca.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new(0);
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_requests, 0);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_header_size, 16_384);
        assert_eq!(config.max_header_count, 100);
        assert_eq!(config.max_body_size, 1024 * 1024);
        assert_eq!(config.max_ws_frame_size, 1024 * 1024);
        assert_eq!(config.access_log_buffer_size, 100);
        assert_eq!(config.access_log_flush_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert!(config.sse_keepalive.is_none());
        assert!(config.tcp_keepalive.is_none());
        assert!(config.tcp_keepalive_interval.is_none());
        assert!(config.tcp_keepalive_retries.is_none());
    }

    #[test]
    fn fractional_flush_interval() {
        let config = Config::new(0).access_log_flush_interval(Duration::from_millis(250));
        assert_eq!(config.access_log_flush_interval.as_millis(), 250);
    }
}
