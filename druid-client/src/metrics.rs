//! Client-side counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Thread-safe counters shared by a client and the streams it returns
#[derive(Debug)]
pub struct ClientMetrics {
    /// Queries sent to the broker
    pub queries_total: AtomicU64,

    /// Queries that failed before or while streaming
    pub errors_total: AtomicU64,

    /// Response streams read to the end
    pub streams_completed_total: AtomicU64,

    /// Response streams dropped before the end
    pub streams_abandoned_total: AtomicU64,

    /// Top-level result elements decoded
    pub elements_decoded_total: AtomicU64,

    /// Response body bytes received
    pub bytes_received_total: AtomicU64,

    /// Time from request to end of stream, summed over completed streams
    pub stream_time_total_ms: AtomicU64,

    start_time: Instant,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self {
            queries_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            streams_completed_total: AtomicU64::new(0),
            streams_abandoned_total: AtomicU64::new(0),
            elements_decoded_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            stream_time_total_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_element(&self) {
        self.elements_decoded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_received_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.streams_completed_total.fetch_add(1, Ordering::Relaxed);
        self.stream_time_total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.streams_abandoned_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        let completed = self.streams_completed_total.load(Ordering::Relaxed);
        let total_time = self.stream_time_total_ms.load(Ordering::Relaxed);

        ClientMetricsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            streams_completed_total: completed,
            streams_abandoned_total: self.streams_abandoned_total.load(Ordering::Relaxed),
            elements_decoded_total: self.elements_decoded_total.load(Ordering::Relaxed),
            bytes_received_total: self.bytes_received_total.load(Ordering::Relaxed),
            avg_stream_time_ms: if completed > 0 {
                total_time as f64 / completed as f64
            } else {
                0.0
            },
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub queries_total: u64,
    pub errors_total: u64,
    pub streams_completed_total: u64,
    pub streams_abandoned_total: u64,
    pub elements_decoded_total: u64,
    pub bytes_received_total: u64,
    pub avg_stream_time_ms: f64,
    pub uptime_seconds: u64,
}
