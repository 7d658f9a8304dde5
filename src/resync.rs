//! Per-source resync state machine
//!
//! Detects desynchronization and stall, and drives buffer-clear +
//! reconnect recovery for one source. Every controller instance is
//! independent: nothing here is shared across sources, so one source's
//! recovery can never stall another's playback.

use log::{info, warn};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Health state of one source, surfaced per cell through the session tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceHealth {
    /// Decoding and flowing normally
    Healthy,
    /// Trouble observed, waiting for the confirmation window before
    /// tearing anything down
    Degraded,
    /// Buffers flushed, session dropped, reconnect in progress
    Resyncing,
    /// Reconnect budget exhausted or stream ended; terminal until an
    /// operator retry or room removal
    Failed,
}

impl std::fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceHealth::Healthy => "Healthy",
            SourceHealth::Degraded => "Degraded",
            SourceHealth::Resyncing => "Resyncing",
            SourceHealth::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Why a source left Healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    /// Escalation from the decode pipeline (consecutive failures)
    PipelineUnhealthy,
    /// Jitter buffer full beyond the dwell time
    BufferPressure,
    /// Timestamp discontinuity from the connection
    ProtocolDesync,
    /// Repeated transient stream errors / output stall
    StreamStall,
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DegradeReason::PipelineUnhealthy => "pipeline unhealthy",
            DegradeReason::BufferPressure => "buffer pressure",
            DegradeReason::ProtocolDesync => "protocol desync",
            DegradeReason::StreamStall => "stream stall",
        };
        write!(f, "{s}")
    }
}

/// Resync controller configuration
#[derive(Debug, Clone)]
pub struct ResyncConfig {
    /// How long a source stays Degraded before recovery starts, to avoid
    /// flapping on single transient glitches
    pub confirmation_window: Duration,
    /// Jitter-buffer-full dwell before the buffer pressure signal fires
    pub buffer_full_dwell: Duration,
    /// No decoded output for this long counts as a stall
    pub stall_threshold: Duration,
    /// Consecutive reconnect attempts before giving up
    pub max_attempts: u32,
    /// Exponential backoff base between reconnect attempts
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            confirmation_window: Duration::from_millis(500),
            buffer_full_dwell: Duration::from_secs(2),
            stall_threshold: Duration::from_secs(3),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Command issued to the source worker by `poll`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncAction {
    /// Flush the decode pipeline, drop the session, start reconnecting
    BeginResync,
}

/// State machine driving one source's recovery
///
/// The source worker feeds it signals (degrade reasons, reconnect
/// outcomes, recovery) and polls it for actions; the worker performs all
/// actual I/O.
pub struct ResyncController {
    config: ResyncConfig,
    state: SourceHealth,
    degraded_since: Option<Instant>,
    attempts: u32,
}

impl ResyncController {
    pub fn new(config: ResyncConfig) -> Self {
        Self {
            config,
            state: SourceHealth::Healthy,
            degraded_since: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> SourceHealth {
        self.state
    }

    /// Valid transitions of the health machine
    fn can_transition(from: SourceHealth, to: SourceHealth) -> bool {
        use SourceHealth::*;
        match (from, to) {
            (Healthy, Degraded) => true,
            // Operator-triggered resync is allowed from anywhere
            (Healthy, Resyncing) | (Degraded, Resyncing) | (Failed, Resyncing) => true,
            (Resyncing, Healthy) => true,
            // Budget exhaustion or terminal stream end
            (_, Failed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    fn set_state(&mut self, to: SourceHealth) {
        debug_assert!(
            Self::can_transition(self.state, to),
            "invalid transition {} -> {}",
            self.state,
            to
        );
        if self.state != to {
            info!("health {} -> {}", self.state, to);
            self.state = to;
        }
    }

    /// A degrade signal from the worker. Only acts from Healthy; recovery
    /// in progress is not interrupted.
    pub fn on_degraded(&mut self, reason: DegradeReason) {
        if self.state == SourceHealth::Healthy {
            warn!("degraded: {}", reason);
            self.set_state(SourceHealth::Degraded);
            self.degraded_since = Some(Instant::now());
        }
    }

    /// Operator resync / clear-buffer action. Valid from any state; on a
    /// Failed source this is the explicit retry and resets the budget.
    pub fn operator_resync(&mut self) -> ResyncAction {
        self.attempts = 0;
        self.degraded_since = None;
        self.set_state(SourceHealth::Resyncing);
        ResyncAction::BeginResync
    }

    /// Advance time-based transitions; returns an action when the
    /// confirmation window elapsed
    pub fn poll(&mut self) -> Option<ResyncAction> {
        if self.state == SourceHealth::Degraded
            && let Some(since) = self.degraded_since
            && since.elapsed() >= self.config.confirmation_window
        {
            self.degraded_since = None;
            self.attempts = 0;
            self.set_state(SourceHealth::Resyncing);
            return Some(ResyncAction::BeginResync);
        }
        None
    }

    /// Claim the next reconnect attempt while Resyncing.
    ///
    /// Returns the backoff to sleep before the attempt, or `None` when the
    /// budget is exhausted (the source is then Failed). The worker calls
    /// this before every (re)connect and again after a post-connect
    /// setback, so failed attempts and bad sessions draw from the same
    /// budget.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        debug_assert_eq!(self.state, SourceHealth::Resyncing);
        self.attempts += 1;
        if self.attempts > self.config.max_attempts {
            warn!("reconnect budget exhausted after {} attempts", self.config.max_attempts);
            self.set_state(SourceHealth::Failed);
            return None;
        }
        if self.attempts == 1 {
            return Some(Duration::ZERO);
        }
        let exp = self.attempts.saturating_sub(2).min(20);
        let backoff = self.config.backoff_base.saturating_mul(1 << exp);
        Some(backoff.min(self.config.backoff_cap))
    }

    /// First decoded frame+block pair arrived after reconnect
    pub fn on_recovered(&mut self) {
        if self.state == SourceHealth::Resyncing {
            self.attempts = 0;
            self.set_state(SourceHealth::Healthy);
        }
    }

    /// Terminal stream end (room closed or banned)
    pub fn on_stream_ended(&mut self) {
        self.set_state(SourceHealth::Failed);
    }
}
