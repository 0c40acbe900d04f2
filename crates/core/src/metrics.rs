use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub duplicates_skipped: u64,
    pub unknown_payloads: u64,
    pub acks_applied: u64,
    pub integration_failures: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    duplicates_skipped: AtomicU64,
    unknown_payloads: AtomicU64,
    acks_applied: AtomicU64,
    integration_failures: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            unknown_payloads: AtomicU64::new(0),
            acks_applied: AtomicU64::new(0),
            integration_failures: AtomicU64::new(0),
        })
    }

    pub fn inc_messages_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_payloads(&self) {
        self.unknown_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acks(&self) {
        self.acks_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_integration_failures(&self) {
        self.integration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            unknown_payloads: self.unknown_payloads.load(Ordering::Relaxed),
            acks_applied: self.acks_applied.load(Ordering::Relaxed),
            integration_failures: self.integration_failures.load(Ordering::Relaxed),
        }
    }
}
