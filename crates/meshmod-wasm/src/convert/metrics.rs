//! Conversion outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::Outcome;

/// Per-outcome counters plus conversion time. Shared across batches.
#[derive(Debug, Default)]
pub struct ConversionMetrics {
    success: AtomicU64,
    unmarshal_failure: AtomicU64,
    fetch_failure: AtomicU64,
    checksum_failure: AtomicU64,
    no_remote_load: AtomicU64,
    miss_remote_fetch_hint: AtomicU64,
    marshal_failure: AtomicU64,
    batches: AtomicU64,
    duration_us: AtomicU64,
}

/// Point-in-time copy of [`ConversionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversionMetricsSnapshot {
    pub success: u64,
    pub unmarshal_failure: u64,
    pub fetch_failure: u64,
    pub checksum_failure: u64,
    pub no_remote_load: u64,
    pub miss_remote_fetch_hint: u64,
    pub marshal_failure: u64,
    pub batches: u64,
    pub duration_ms: u64,
}

impl ConversionMetricsSnapshot {
    /// Count recorded for `outcome`.
    pub fn count(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success,
            Outcome::UnmarshalFailure => self.unmarshal_failure,
            Outcome::FetchFailure => self.fetch_failure,
            Outcome::ChecksumFailure => self.checksum_failure,
            Outcome::NoRemoteLoad => self.no_remote_load,
            Outcome::MissRemoteFetchHint => self.miss_remote_fetch_hint,
            Outcome::MarshalFailure => self.marshal_failure,
        }
    }
}

impl ConversionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Success => &self.success,
            Outcome::UnmarshalFailure => &self.unmarshal_failure,
            Outcome::FetchFailure => &self.fetch_failure,
            Outcome::ChecksumFailure => &self.checksum_failure,
            Outcome::NoRemoteLoad => &self.no_remote_load,
            Outcome::MissRemoteFetchHint => &self.miss_remote_fetch_hint,
            Outcome::MarshalFailure => &self.marshal_failure,
        }
    }

    pub fn record(&self, outcome: Outcome) {
        self.counter(outcome).fetch_add(1, Ordering::Relaxed);
    }

    /// Record one batch and its wall time.
    pub fn record_batch(&self, elapsed: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.duration_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConversionMetricsSnapshot {
        ConversionMetricsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            unmarshal_failure: self.unmarshal_failure.load(Ordering::Relaxed),
            fetch_failure: self.fetch_failure.load(Ordering::Relaxed),
            checksum_failure: self.checksum_failure.load(Ordering::Relaxed),
            no_remote_load: self.no_remote_load.load(Ordering::Relaxed),
            miss_remote_fetch_hint: self.miss_remote_fetch_hint.load(Ordering::Relaxed),
            marshal_failure: self.marshal_failure.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            duration_ms: self.duration_us.load(Ordering::Relaxed) / 1000,
        }
    }
}
