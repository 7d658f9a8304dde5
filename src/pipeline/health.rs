//! Health metrics for one source's decode pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Health metrics for one source
///
/// Tracks counters and timestamps used for stall detection and for the
/// per-cell stats surfaced by the session tick. All fields use atomic
/// operations for thread-safe access: the source worker writes, the
/// presentation tick reads.
pub struct PipelineHealth {
    /// Number of units dropped due to backpressure
    drops: AtomicU64,

    /// Number of decode failures
    decode_failures: AtomicU64,

    /// Number of transient network errors
    network_errors: AtomicU64,

    /// Timestamp (Unix microseconds) of the last successfully decoded unit
    last_output_time: AtomicU64,

    /// Number of video frames successfully decoded
    frames_decoded: AtomicU64,

    /// Number of audio blocks successfully decoded
    blocks_decoded: AtomicU64,

    /// Number of resync rounds this source has gone through
    resyncs: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            drops: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            last_output_time: AtomicU64::new(now_micros()),
            frames_decoded: AtomicU64::new(0),
            blocks_decoded: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        }
    }

    /// Record a dropped packet/frame/block
    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode failure
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transient network error
    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully decoded video frame
    pub fn record_frame(&self) {
        self.last_output_time.store(now_micros(), Ordering::Relaxed);
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully decoded audio block
    pub fn record_block(&self) {
        self.last_output_time.store(now_micros(), Ordering::Relaxed);
        self.blocks_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a resync round
    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn blocks_decoded(&self) -> u64 {
        self.blocks_decoded.load(Ordering::Relaxed)
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Check if the pipeline has stalled (no decoded output for `threshold`)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_output_time.load(Ordering::Relaxed);
        let elapsed = now_micros().saturating_sub(last);
        elapsed > threshold.as_micros() as u64
    }

    /// Snapshot of the metrics for UI display
    pub fn summary(&self) -> SourceStats {
        SourceStats {
            frames_decoded: self.frames_decoded(),
            blocks_decoded: self.blocks_decoded(),
            drops: self.drops(),
            decode_failures: self.decode_failures(),
            network_errors: self.network_errors(),
            resyncs: self.resyncs(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-source stats snapshot surfaced through the session tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_decoded: u64,
    pub blocks_decoded: u64,
    pub drops: u64,
    pub decode_failures: u64,
    pub network_errors: u64,
    pub resyncs: u64,
}

impl std::fmt::Display for SourceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames, {} blocks, {} drops, {} decode failures, {} network errors, {} resyncs",
            self.frames_decoded,
            self.blocks_decoded,
            self.drops,
            self.decode_failures,
            self.network_errors,
            self.resyncs
        )
    }
}
