//! Pipeline counters shared by ingestion, workers and the status surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineStats {
    ingested: AtomicU64,
    enqueued: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    dropped_overflow: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    retried: AtomicU64,
    rules_disabled: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub ingested: u64,
    pub enqueued: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub dropped_overflow: u64,
    /// Messages refused while ingestion was paused.
    pub rejected: u64,
    pub requeued: u64,
    pub retried: u64,
    pub rules_disabled: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ingested(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_overflow(&self) {
        self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rules_disabled(&self) {
        self.rules_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rules_disabled: self.rules_disabled.load(Ordering::Relaxed),
        }
    }
}
