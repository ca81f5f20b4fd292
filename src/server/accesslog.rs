//! Per-worker buffered access logging.
//!
//! Entries accumulate in a bounded in-memory buffer and leave in a single
//! write syscall per flush: when the buffer fills, when the flush timer
//! fires, and when the worker drains on shutdown.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use http::{Method, StatusCode};
use tracing::{error, trace};

pub(crate) struct AccessLog {
    inner: Mutex<Inner>,
    buffer_size: usize,
}

struct Inner {
    entries: Vec<String>,
    target: Target,
}

enum Target {
    Stdout,
    File(File),
}

impl AccessLog {
    pub(crate) fn open(path: Option<&Path>, buffer_size: usize) -> std::io::Result<AccessLog> {
        let target = match path {
            Some(path) => Target::File(
                OpenOptions::new().create(true).append(true).open(path)?,
            ),
            None => Target::Stdout,
        };
        Ok(AccessLog {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                target,
            }),
            buffer_size,
        })
    }

    /// Record one completed conversation.
    pub(crate) fn record(
        &self,
        client: IpAddr,
        method: &Method,
        raw_path: &[u8],
        query: &[u8],
        status: Option<StatusCode>,
        duration: Duration,
    ) {
        let entry = format_entry(client, method, raw_path, query, status, duration);
        let mut inner = self.inner.lock().unwrap();
        if self.buffer_size <= 1 {
            inner.write_out(&entry);
            return;
        }
        inner.entries.push(entry);
        if inner.entries.len() >= self.buffer_size {
            trace!("access log size flush ({} entries)", inner.entries.len());
            inner.flush();
        }
    }

    /// Write out everything buffered.
    pub(crate) fn flush(&self) {
        self.inner.lock().unwrap().flush();
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Inner {
    fn flush(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let combined = self.entries.concat();
        self.entries.clear();
        self.write_out(&combined);
    }

    fn write_out(&mut self, data: &str) {
        let result = match &mut self.target {
            Target::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(data.as_bytes()).and_then(|_| lock.flush())
            }
            Target::File(file) => file.write_all(data.as_bytes()),
        };
        if let Err(e) = result {
            error!("access log write failed: {}", e);
        }
    }
}

fn format_entry(
    client: IpAddr,
    method: &Method,
    raw_path: &[u8],
    query: &[u8],
    status: Option<StatusCode>,
    duration: Duration,
) -> String {
    let timestamp = Utc::now().format("%d/%b/%Y:%H:%M:%S +0000");
    let target = String::from_utf8_lossy(raw_path);
    let status = match status {
        Some(status) => status.as_u16().to_string(),
        None => "-".to_owned(),
    };
    let millis = duration.subsec_millis();
    if query.is_empty() {
        format!(
            "{} - - [{}] \"{} {}\" {} {}.{:03}s\n",
            client,
            timestamp,
            method,
            target,
            status,
            duration.as_secs(),
            millis,
        )
    } else {
        format!(
            "{} - - [{}] \"{} {}?{}\" {} {}.{:03}s\n",
            client,
            timestamp,
            method,
            target,
            String::from_utf8_lossy(query),
            status,
            duration.as_secs(),
            millis,
        )
    }
}
