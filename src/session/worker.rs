//! Per-source worker task
//!
//! One tokio task per source owns the whole read → classify → decode →
//! hand-off path: the stream connection, the decode pipeline, and the
//! resync controller. Decoded units leave through bounded drop-oldest
//! queues that the tick loop drains without blocking, so a stalled or
//! resyncing source can never stall a tick.

use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::decode::{DecodeConfig, DecodePipeline};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::types::{MediaKind, Packet, SampleBlock, VideoFrame};
use crate::resync::{DegradeReason, ResyncConfig, ResyncController, SourceHealth};
use crate::source::backend::SourceBackend;
use crate::source::{Room, SourceId, StreamConnection, StreamFault};

/// Source worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub decode: DecodeConfig,
    pub resync: ResyncConfig,
    /// Timestamp discontinuity classified as a protocol desync
    pub desync_threshold: Duration,
    /// Periodic wakeup driving the time-based checks when no packets
    /// arrive
    pub poll_interval: Duration,
    /// Consecutive transient read faults before a degrade signal
    pub transient_escalation: u32,
    /// Decoded video frames buffered for the tick loop
    pub video_queue_depth: usize,
    /// Decoded audio blocks buffered for the tick loop
    pub audio_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            decode: DecodeConfig::default(),
            resync: ResyncConfig::default(),
            desync_threshold: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            transient_escalation: 3,
            video_queue_depth: 4,
            audio_queue_depth: 8,
        }
    }
}

/// Bounded drop-oldest hand-off queue between a worker and the tick loop
///
/// The lock is held only for a push or pop, never across decode or I/O.
pub(crate) struct SharedQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    cap: usize,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cap: self.cap,
        }
    }
}

impl<T> SharedQueue<T> {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(cap))),
            cap: cap.max(1),
        }
    }

    /// Push, evicting the oldest entry when full
    pub(crate) fn push(&self, item: T) -> Option<T> {
        let mut q = self.inner.lock().expect("queue lock poisoned");
        let evicted = if q.len() >= self.cap { q.pop_front() } else { None };
        q.push_back(item);
        evicted
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.lock().expect("queue lock poisoned").pop_front()
    }

    /// Drain the queue and keep only the newest entry
    pub(crate) fn take_latest(&self) -> Option<T> {
        self.inner.lock().expect("queue lock poisoned").drain(..).last()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().expect("queue lock poisoned").clear();
    }
}

/// Manager-side handle to one running source worker
pub(crate) struct WorkerHandle {
    pub(crate) id: SourceId,
    pub(crate) room: Room,
    pub(crate) video: SharedQueue<VideoFrame>,
    pub(crate) audio: SharedQueue<SampleBlock>,
    pub(crate) health_rx: watch::Receiver<SourceHealth>,
    pub(crate) stats: Arc<PipelineHealth>,
    pub(crate) resync_tx: mpsc::Sender<()>,
    pub(crate) enabled: Arc<AtomicBool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

/// Spawn the worker task for one room
pub(crate) fn spawn(
    id: SourceId,
    room: Room,
    backend: Arc<dyn SourceBackend>,
    config: WorkerConfig,
) -> WorkerHandle {
    let video = SharedQueue::new(config.video_queue_depth);
    let audio = SharedQueue::new(config.audio_queue_depth);
    let (health_tx, health_rx) = watch::channel(SourceHealth::Resyncing);
    let (resync_tx, resync_rx) = mpsc::channel(1);
    let enabled = Arc::new(AtomicBool::new(true));
    let cancel = CancellationToken::new();

    let stats = Arc::new(PipelineHealth::new());
    let pipeline = DecodePipeline::new(backend.new_decoder(), config.decode.clone(), Arc::clone(&stats));

    let worker = SourceWorker {
        id,
        room: room.clone(),
        backend,
        pipeline,
        controller: ResyncController::new(config.resync.clone()),
        config: config.clone(),
        video: video.clone(),
        audio: audio.clone(),
        health_tx,
        enabled: Arc::clone(&enabled),
        consecutive_transients: 0,
        awaiting_recovery: false,
        recovery_deadline: None,
        video_since_resync: false,
        audio_since_resync: false,
    };
    let join = tokio::spawn(worker.run(cancel.clone(), resync_rx));

    WorkerHandle {
        id,
        room,
        video,
        audio,
        health_rx,
        stats,
        resync_tx,
        enabled,
        cancel,
        join,
    }
}

enum Event {
    Shutdown,
    OperatorResync,
    Read(Result<Packet, StreamFault>),
    Tick,
}

struct SourceWorker {
    id: SourceId,
    room: Room,
    backend: Arc<dyn SourceBackend>,
    pipeline: DecodePipeline,
    controller: ResyncController,
    config: WorkerConfig,
    video: SharedQueue<VideoFrame>,
    audio: SharedQueue<SampleBlock>,
    health_tx: watch::Sender<SourceHealth>,
    enabled: Arc<AtomicBool>,
    consecutive_transients: u32,
    /// Set while a resync round waits for its first decoded frame+block
    /// pair, the recovery signal
    awaiting_recovery: bool,
    /// A session still awaiting recovery past this point is considered
    /// dead and dropped, drawing the next attempt from the same budget
    recovery_deadline: Option<Instant>,
    video_since_resync: bool,
    audio_since_resync: bool,
}

impl SourceWorker {
    async fn run(mut self, cancel: CancellationToken, mut resync_rx: mpsc::Receiver<()>) {
        info!("{}: worker started for room {}", self.id, self.room.id);

        // Startup runs through the same resync path as recovery: connect
        // with the full attempt budget and report Healthy on the first
        // decoded pair.
        self.controller.operator_resync();
        self.awaiting_recovery = true;
        let mut conn: Option<StreamConnection> = None;

        loop {
            if conn.is_none() && self.controller.state() == SourceHealth::Resyncing {
                conn = self.reconnect(&cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                if conn.is_some() {
                    self.recovery_deadline =
                        Some(Instant::now() + self.config.resync.stall_threshold);
                }
            }
            self.publish_health();

            // The select only picks the event; handling happens below so
            // the read future's borrow of the connection is released
            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Shutdown,
                Some(_) = resync_rx.recv() => Event::OperatorResync,
                result = Self::read_next(&mut conn) => Event::Read(result),
                _ = tokio::time::sleep(self.config.poll_interval) => Event::Tick,
            };
            match event {
                Event::Shutdown => break,
                Event::OperatorResync => {
                    info!("{}: operator resync", self.id);
                    self.controller.operator_resync();
                    self.begin_resync(&mut conn).await;
                }
                Event::Read(result) => self.on_read(result, &mut conn).await,
                Event::Tick => {}
            }

            self.check_signals(&mut conn).await;
            self.drain_outputs();
            self.publish_health();
        }

        if let Some(c) = conn.take() {
            c.close().await;
        }
        info!("{}: worker stopped", self.id);
    }

    /// Next packet from the live session; parked when there is none
    async fn read_next(conn: &mut Option<StreamConnection>) -> Result<Packet, StreamFault> {
        match conn {
            Some(c) => c.read().await,
            None => std::future::pending().await,
        }
    }

    async fn on_read(&mut self, result: Result<Packet, StreamFault>, conn: &mut Option<StreamConnection>) {
        match result {
            Ok(packet) => {
                self.consecutive_transients = 0;
                // A disabled source keeps its thumbnail alive but skips
                // the audio decode work entirely
                if packet.kind == MediaKind::Audio && !self.enabled.load(Ordering::Relaxed) {
                    self.pipeline.note_audio_skipped(packet.pts);
                    return;
                }
                self.pipeline.push(packet);
            }
            Err(StreamFault::Ended) => {
                info!("{}: stream ended", self.id);
                self.controller.on_stream_ended();
                if let Some(c) = conn.take() {
                    c.close().await;
                }
            }
            Err(StreamFault::Transient(reason)) => {
                self.pipeline.health().record_network_error();
                self.consecutive_transients += 1;
                warn!("{}: transient fault: {reason}", self.id);
                if self.consecutive_transients >= self.config.transient_escalation {
                    self.controller.on_degraded(DegradeReason::StreamStall);
                }
            }
            Err(StreamFault::Desync(jump)) => {
                warn!("{}: protocol desync of {jump:?}", self.id);
                self.controller.on_degraded(DegradeReason::ProtocolDesync);
            }
        }
    }

    /// Time-based degrade signals plus the controller's own clock
    async fn check_signals(&mut self, conn: &mut Option<StreamConnection>) {
        if self.pipeline.take_unhealthy() {
            self.controller.on_degraded(DegradeReason::PipelineUnhealthy);
        }
        if let Some(dwell) = self.pipeline.buffer_full_for()
            && dwell >= self.config.resync.buffer_full_dwell
        {
            self.controller.on_degraded(DegradeReason::BufferPressure);
        }
        if conn.is_some()
            && self.controller.state() == SourceHealth::Healthy
            && self.pipeline.health().is_stalled(self.config.resync.stall_threshold)
        {
            self.controller.on_degraded(DegradeReason::StreamStall);
        }

        // A session that opened but never produced the first decoded pair
        // is dead; drop it so the next attempt comes out of the budget
        if self.awaiting_recovery
            && conn.is_some()
            && self.controller.state() == SourceHealth::Resyncing
            && let Some(deadline) = self.recovery_deadline
            && Instant::now() >= deadline
        {
            warn!(
                "{}: no decoded output within {:?} of connecting, dropping session",
                self.id, self.config.resync.stall_threshold
            );
            self.begin_resync(conn).await;
        }

        if self.controller.poll().is_some() {
            self.begin_resync(conn).await;
        }
    }

    /// Flush everything buffered and drop the session; the main loop
    /// reconnects on the next iteration
    async fn begin_resync(&mut self, conn: &mut Option<StreamConnection>) {
        self.pipeline.flush();
        self.pipeline.health().record_resync();
        self.video.clear();
        self.audio.clear();
        self.consecutive_transients = 0;
        self.awaiting_recovery = true;
        self.recovery_deadline = None;
        self.video_since_resync = false;
        self.audio_since_resync = false;
        if let Some(c) = conn.take() {
            c.close().await;
        }
    }

    /// Drive the reconnect attempt budget until a session opens, the
    /// budget is exhausted, or the worker is cancelled
    async fn reconnect(&mut self, cancel: &CancellationToken) -> Option<StreamConnection> {
        loop {
            let Some(backoff) = self.controller.next_backoff() else {
                // Budget spent, the controller is now Failed
                self.publish_health();
                return None;
            };
            if !backoff.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let attempt = StreamConnection::open(&self.backend, &self.room, self.config.desync_threshold);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                result = attempt => match result {
                    Ok(conn) => return Some(conn),
                    Err(e) => warn!("{}: {e}", self.id),
                },
            }
        }
    }

    /// Move decoded units into the hand-off queues and detect recovery
    fn drain_outputs(&mut self) {
        while let Some(frame) = self.pipeline.poll_video() {
            self.video_since_resync = true;
            if self.video.push(frame).is_some() {
                self.pipeline.health().record_drop();
            }
        }
        while let Some(block) = self.pipeline.poll_audio() {
            self.audio_since_resync = true;
            if self.audio.push(block).is_some() {
                self.pipeline.health().record_drop();
            }
        }

        // First frame+block pair after a (re)connect confirms recovery; a
        // disabled source recovers on video alone
        let audio_ok = self.audio_since_resync || !self.enabled.load(Ordering::Relaxed);
        if self.awaiting_recovery && self.video_since_resync && audio_ok {
            self.awaiting_recovery = false;
            self.recovery_deadline = None;
            self.controller.on_recovered();
        }
    }

    fn publish_health(&self) {
        let state = self.controller.state();
        if *self.health_tx.borrow() != state {
            let _ = self.health_tx.send(state);
        }
    }
}
