//! Connection counters shared across all workers.
//!
//! The four accumulators are the only mutable state the workers share.
//! Per-connection counters buffer increments locally and flush into the
//! shared accumulators at most every [`FLUSH_INTERVAL`], so the relay
//! loop never contends on the shared counters per chunk.

use crate::{config::Config, consts, error::Error, tls};
use log::debug;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Minimum wall time between two flushes of per-connection partials.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Broker-wide counters, shared by every worker through an `Arc`.
#[derive(Debug)]
pub struct StatsRegistry {
    connections_current: AtomicI64,
    connections_total: AtomicI64,
    accum_sent: AtomicI64,
    accum_recv: AtomicI64,
    /// Live connections per worker; feeds both the dispatcher's
    /// least-loaded selection and the detailed stats reply.
    worker_live: Vec<AtomicUsize>,
}

impl StatsRegistry {
    pub fn new(workers: usize) -> Arc<Self> {
        Arc::new(StatsRegistry {
            connections_current: AtomicI64::new(0),
            connections_total: AtomicI64::new(0),
            accum_sent: AtomicI64::new(0),
            accum_recv: AtomicI64::new(0),
            worker_live: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        })
    }

    pub fn increment_connections(&self) {
        self.connections_current.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        self.connections_current.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_accum(&self, sent: i64, recv: i64) {
        if sent != 0 {
            self.accum_sent.fetch_add(sent, Ordering::Relaxed);
        }
        if recv != 0 {
            self.accum_recv.fetch_add(recv, Ordering::Relaxed);
        }
    }

    pub fn connections_current(&self) -> i64 {
        self.connections_current.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> i64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn accum_sent(&self) -> i64 {
        self.accum_sent.load(Ordering::Relaxed)
    }

    pub fn accum_recv(&self) -> i64 {
        self.accum_recv.load(Ordering::Relaxed)
    }

    /// One unsynchronized reading of the four counters.
    ///
    /// Readers deliberately get an approximation; the counters move while
    /// this line is being assembled.
    pub fn snapshot(&self) -> String {
        format!(
            "{};{};{};{}",
            self.connections_current(),
            self.connections_total(),
            self.accum_sent(),
            self.accum_recv(),
        )
    }

    /// The summary line followed by one line per worker.
    pub fn detailed_snapshot(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(1 + self.worker_live.len());
        lines.push(self.snapshot());
        for (idx, live) in self.worker_live.iter().enumerate() {
            lines.push(format!("worker {}: {}", idx, live.load(Ordering::Relaxed)));
        }
        lines
    }

    pub fn worker_count(&self) -> usize {
        self.worker_live.len()
    }

    pub fn worker_started(&self, idx: usize) {
        self.worker_live[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_finished(&self, idx: usize) {
        self.worker_live[idx].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn worker_live(&self, idx: usize) -> usize {
        self.worker_live[idx].load(Ordering::Relaxed)
    }

    /// Index of the worker currently owning the fewest live connections.
    pub fn least_loaded(&self) -> usize {
        self.worker_live
            .iter()
            .enumerate()
            .min_by_key(|(_, live)| live.load(Ordering::Relaxed))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

/// Counters owned by a single connection state machine.
#[derive(Debug)]
pub struct ConnStats {
    registry: Arc<StatsRegistry>,
    local_sent: AtomicU64,
    local_recv: AtomicU64,
    partial_sent: AtomicU64,
    partial_recv: AtomicU64,
    last_flush: Mutex<Instant>,
    start: Instant,
    end: Mutex<Option<Instant>>,
    counted: AtomicBool,
    closed: AtomicBool,
}

impl ConnStats {
    pub fn new(registry: Arc<StatsRegistry>) -> Self {
        let now = Instant::now();
        ConnStats {
            registry,
            local_sent: AtomicU64::new(0),
            local_recv: AtomicU64::new(0),
            partial_sent: AtomicU64::new(0),
            partial_recv: AtomicU64::new(0),
            last_flush: Mutex::new(now),
            start: now,
            end: Mutex::new(None),
            counted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &StatsRegistry {
        &self.registry
    }

    pub fn add_sent(&self, n: u64) {
        self.local_sent.fetch_add(n, Ordering::Relaxed);
        self.partial_sent.fetch_add(n, Ordering::Relaxed);
        self.maybe_flush(false);
    }

    pub fn add_recv(&self, n: u64) {
        self.local_recv.fetch_add(n, Ordering::Relaxed);
        self.partial_recv.fetch_add(n, Ordering::Relaxed);
        self.maybe_flush(false);
    }

    fn maybe_flush(&self, force: bool) {
        let mut last = self.last_flush.lock().unwrap();
        if force || last.elapsed() >= FLUSH_INTERVAL {
            let sent = self.partial_sent.swap(0, Ordering::Relaxed);
            let recv = self.partial_recv.swap(0, Ordering::Relaxed);
            self.registry.add_accum(sent as i64, recv as i64);
            *last = Instant::now();
        }
    }

    /// Marks this connection as counted in the shared gauges.
    pub fn increment_connections(&self) {
        self.counted.store(true, Ordering::Relaxed);
        self.registry.increment_connections();
    }

    /// Idempotent: flushes partials, records the end time, and undoes the
    /// connection count iff this connection was ever counted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.maybe_flush(true);
        if self.counted.load(Ordering::Relaxed) {
            self.registry.decrement_connections();
        }
        *self.end.lock().unwrap() = Some(Instant::now());
    }

    pub fn local_sent(&self) -> u64 {
        self.local_sent.load(Ordering::Relaxed)
    }

    pub fn local_recv(&self) -> u64 {
        self.local_recv.load(Ordering::Relaxed)
    }

    /// Connection lifetime; keeps running until [`close`](Self::close).
    pub fn elapsed(&self) -> Duration {
        match *self.end.lock().unwrap() {
            Some(end) => end.duration_since(self.start),
            None => self.start.elapsed(),
        }
    }
}

/// Query a running broker for its stats line(s) and return the raw reply.
///
/// Speaks the same wire protocol as any other client: preamble, TLS
/// (certificate checks disabled, the broker usually presents a cert for
/// its public name, not for loopback), then `STAT` or `INFO` plus the
/// shared secret.
pub async fn query_server_stats(cfg: &Config, detailed: bool) -> Result<String, Error> {
    let host = cfg.stats_host();
    let mut tcp = TcpStream::connect((host, cfg.listen_port)).await?;
    tcp.write_all(consts::HANDSHAKE_V1).await?;

    let mut stream = tls::connect_insecure(host, tcp).await?;
    let command = if detailed {
        consts::COMMAND_STAT
    } else {
        consts::COMMAND_INFO
    };
    stream.write_all(command).await?;
    stream.write_all(cfg.secret.as_bytes()).await?;
    stream.flush().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    debug!("stats reply: {} bytes", reply.len());
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
