//! Block connection timing counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    read_us: AtomicU64,
    read_blocks: AtomicU64,
    connect_us: AtomicU64,
    connect_blocks: AtomicU64,
    script_us: AtomicU64,
    script_blocks: AtomicU64,
    flush_us: AtomicU64,
    flush_blocks: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectMetricsSnapshot {
    pub read_us: u64,
    pub read_blocks: u64,
    pub connect_us: u64,
    pub connect_blocks: u64,
    pub script_us: u64,
    pub script_blocks: u64,
    pub flush_us: u64,
    pub flush_blocks: u64,
}

impl ConnectMetrics {
    pub fn record_read(&self, elapsed: Duration) {
        self.read_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.read_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.connect_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_script(&self, elapsed: Duration) {
        self.script_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.script_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.flush_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            read_us: self.read_us.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connect_blocks: self.connect_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_blocks: self.script_blocks.load(Ordering::Relaxed),
            flush_us: self.flush_us.load(Ordering::Relaxed),
            flush_blocks: self.flush_blocks.load(Ordering::Relaxed),
        }
    }
}
