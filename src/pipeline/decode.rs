//! Per-source decode pipeline
//!
//! Turns one source's packet stream into timestamped video frames and
//! audio blocks. Owns the jitter buffer, reconciles audio and video
//! release so that units covering the same presentation time leave in the
//! same poll cycle, and escalates sustained decode failure to the resync
//! controller.

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::codec::{DecodeError, MediaDecoder};
use super::health::PipelineHealth;
use super::jitter::{JitterBuffer, JitterConfig};
use super::types::{MediaKind, Packet, SampleBlock, Timestamp, VideoFrame};

/// Decode pipeline configuration
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Jitter buffer bounds
    pub jitter: JitterConfig,
    /// A/V sync window: a frame and the block covering the same
    /// presentation time are released together within this tolerance
    /// (default one frame interval at 25 fps)
    pub sync_window: Duration,
    /// Maximum decoded units held per kind before decoding pauses
    pub max_ready: usize,
    /// Consecutive decode failures before the pipeline reports unhealthy
    pub failure_escalation: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            jitter: JitterConfig::default(),
            sync_window: Duration::from_millis(40),
            max_ready: 16,
            failure_escalation: 3,
        }
    }
}

/// One source's packet-to-presentation pipeline
///
/// `push` feeds demuxed packets in, `poll_video`/`poll_audio` are drained
/// by the source worker every cycle. All operations are non-blocking; the
/// decoder runs inline on the source's own task.
pub struct DecodePipeline {
    decoder: Box<dyn MediaDecoder>,
    jitter: JitterBuffer,
    config: DecodeConfig,
    health: Arc<PipelineHealth>,

    video_ready: VecDeque<VideoFrame>,
    audio_ready: VecDeque<SampleBlock>,

    /// Last released pts per kind, for the monotonicity clamp
    last_video_pts: Option<Timestamp>,
    last_audio_pts: Option<Timestamp>,

    /// Last pts actually released to the consumer per kind; the
    /// counterpart side may release against this watermark in the same
    /// poll cycle
    video_released: Option<Timestamp>,
    audio_released: Option<Timestamp>,

    /// When the head unit started waiting for its counterpart
    video_held_since: Option<Instant>,
    audio_held_since: Option<Instant>,

    consecutive_failures: u32,
    /// Latched escalation flag, consumed by the worker via `take_unhealthy`
    unhealthy: bool,
}

impl DecodePipeline {
    pub fn new(
        decoder: Box<dyn MediaDecoder>,
        config: DecodeConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            decoder,
            jitter: JitterBuffer::new(config.jitter.clone()),
            config,
            health,
            video_ready: VecDeque::new(),
            audio_ready: VecDeque::new(),
            last_video_pts: None,
            last_audio_pts: None,
            video_released: None,
            audio_released: None,
            video_held_since: None,
            audio_held_since: None,
            consecutive_failures: 0,
            unhealthy: false,
        }
    }

    /// Feed one demuxed packet and run the decoder as far as backpressure
    /// allows
    pub fn push(&mut self, packet: Packet) {
        if self.jitter.push(packet).is_some() {
            self.health.record_drop();
        }
        self.decode_buffered();
    }

    /// Decode buffered packets until a ready queue fills up
    fn decode_buffered(&mut self) {
        while let Some(front) = self.jitter.peek() {
            let blocked = match front.kind {
                MediaKind::Video => self.video_ready.len() >= self.config.max_ready,
                MediaKind::Audio => self.audio_ready.len() >= self.config.max_ready,
            };
            if blocked {
                break;
            }
            let packet = self.jitter.pop().expect("peeked packet present");
            self.decode_one(&packet);
        }
    }

    fn decode_one(&mut self, packet: &Packet) {
        match packet.kind {
            MediaKind::Video => match self.decoder.decode_video(packet) {
                // A packet can complete several frames when the codec
                // flushes buffered references, or none while buffering
                Ok(frames) => {
                    for mut frame in frames {
                        self.consecutive_failures = 0;
                        // Clamp small regressions so released pts never go
                        // backwards
                        if let Some(last) = self.last_video_pts
                            && frame.pts < last
                        {
                            frame.pts = last;
                        }
                        self.last_video_pts = Some(frame.pts);
                        self.health.record_frame();
                        self.video_ready.push_back(frame);
                    }
                }
                Err(e) => self.on_decode_failure(&e),
            },
            MediaKind::Audio => match self.decoder.decode_audio(packet) {
                Ok(Some(mut block)) => {
                    self.consecutive_failures = 0;
                    if let Some(last) = self.last_audio_pts
                        && block.pts < last
                    {
                        block.pts = last;
                    }
                    self.last_audio_pts = Some(block.pts);
                    self.health.record_block();
                    self.audio_ready.push_back(block);
                }
                Ok(None) => {
                    // Codec is buffering, nothing released yet
                }
                Err(e) => self.on_decode_failure(&e),
            },
        }
    }

    fn on_decode_failure(&mut self, e: &DecodeError) {
        debug!("dropping undecodable packet: {}", e);
        self.health.record_decode_failure();
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.failure_escalation {
            warn!(
                "{} consecutive decode failures, flagging pipeline unhealthy",
                self.consecutive_failures
            );
            self.unhealthy = true;
            self.consecutive_failures = 0;
        }
    }

    /// Poll the next video frame whose counterpart audio is ready (or
    /// whose hold window expired)
    pub fn poll_video(&mut self) -> Option<VideoFrame> {
        self.decode_buffered();

        let v_pts = self.video_ready.front()?.pts;
        // Audio has caught up to within the sync window, either queued or
        // already released this cycle
        let audio_mark = self.audio_ready.front().map(|a| a.pts).or(self.audio_released);
        let release = audio_mark
            .map(|pts| pts.add(self.config.sync_window) >= v_pts)
            .unwrap_or(false);

        if release || self.held_too_long(self.video_held_since) {
            self.video_held_since = None;
            let frame = self.video_ready.pop_front();
            if let Some(f) = &frame {
                self.video_released = Some(f.pts);
            }
            return frame;
        }
        if self.video_held_since.is_none() {
            self.video_held_since = Some(Instant::now());
        }
        None
    }

    /// Poll the next audio block whose counterpart video is ready (or
    /// whose hold window expired)
    pub fn poll_audio(&mut self) -> Option<SampleBlock> {
        self.decode_buffered();

        let a_pts = self.audio_ready.front()?.pts;
        let video_mark = self.video_ready.front().map(|v| v.pts).or(self.video_released);
        let release = video_mark
            .map(|pts| pts.add(self.config.sync_window) >= a_pts)
            .unwrap_or(false);

        if release || self.held_too_long(self.audio_held_since) {
            self.audio_held_since = None;
            let block = self.audio_ready.pop_front();
            if let Some(b) = &block {
                self.audio_released = Some(b.pts);
            }
            return block;
        }
        if self.audio_held_since.is_none() {
            self.audio_held_since = Some(Instant::now());
        }
        None
    }

    fn held_too_long(&self, held_since: Option<Instant>) -> bool {
        held_since
            .map(|since| since.elapsed() > self.config.sync_window)
            .unwrap_or(false)
    }

    /// Advance the audio watermark for a packet whose decode was
    /// intentionally skipped (disabled source), so video release keeps
    /// flowing against it
    pub fn note_audio_skipped(&mut self, pts: Timestamp) {
        if self.audio_released.map_or(true, |mark| pts > mark) {
            self.audio_released = Some(pts);
        }
    }

    /// Discard everything buffered and reset codec state (resync)
    pub fn flush(&mut self) {
        self.jitter.clear();
        self.video_ready.clear();
        self.audio_ready.clear();
        self.decoder.reset();
        self.last_video_pts = None;
        self.last_audio_pts = None;
        self.video_released = None;
        self.audio_released = None;
        self.video_held_since = None;
        self.audio_held_since = None;
        self.consecutive_failures = 0;
        self.unhealthy = false;
    }

    /// Consume the latched unhealthy flag
    pub fn take_unhealthy(&mut self) -> bool {
        std::mem::take(&mut self.unhealthy)
    }

    /// How long the jitter buffer has been continuously full
    pub fn buffer_full_for(&self) -> Option<Duration> {
        self.jitter.full_for()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::codec::{
        DecodeError, RawCodec, corrupt_packet, raw_audio_packet, raw_video_packet,
    };

    fn pipeline(config: DecodeConfig) -> DecodePipeline {
        DecodePipeline::new(
            Box::new(RawCodec::new()),
            config,
            Arc::new(PipelineHealth::new()),
        )
    }

    fn video_at(pts_ms: i64) -> Packet {
        let planes = vec![0u8; 4 * 2 + 2 * 1 * 2]; // 4x2 YUV420p
        raw_video_packet(4, 2, &planes, Timestamp::from_micros(pts_ms * 1_000), true)
    }

    fn audio_at(pts_ms: i64) -> Packet {
        raw_audio_packet(
            48_000,
            1,
            &[0.1; 48],
            Timestamp::from_micros(pts_ms * 1_000),
        )
    }

    #[test]
    fn test_paired_release_within_sync_window() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(video_at(100));
        p.push(audio_at(100));

        let frame = p.poll_video().expect("video released with matching audio");
        let block = p.poll_audio().expect("audio released with matching video");
        assert_eq!(frame.pts.diff(block.pts), Duration::ZERO);
    }

    #[test]
    fn test_video_waits_for_lagging_audio() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(video_at(500));
        p.push(audio_at(100));

        // Audio is 400ms behind: video must hold, audio drains first
        assert!(p.poll_video().is_none());
        assert!(p.poll_audio().is_some());

        // Audio caught up: both sides flow
        p.push(audio_at(480));
        assert!(p.poll_video().is_some());
    }

    #[test]
    fn test_monotonic_release_clamps_regressions() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(audio_at(100));
        p.push(video_at(100));
        p.push(video_at(90)); // regression within the stream
        p.push(video_at(120));
        p.push(audio_at(200));

        let mut last = Timestamp::from_micros(i64::MIN);
        let mut released = 0;
        while let Some(frame) = p.poll_video() {
            assert!(frame.pts >= last, "pts must be non-decreasing");
            last = frame.pts;
            released += 1;
        }
        assert_eq!(released, 3);
    }

    /// Holds frames back like a codec buffering references, then flushes
    /// them all on the third packet
    struct BufferingCodec {
        raw: RawCodec,
        held: Vec<VideoFrame>,
    }

    impl MediaDecoder for BufferingCodec {
        fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
            let mut frames = self.raw.decode_video(packet)?;
            self.held.append(&mut frames);
            if self.held.len() < 3 {
                Ok(Vec::new())
            } else {
                Ok(std::mem::take(&mut self.held))
            }
        }

        fn decode_audio(&mut self, packet: &Packet) -> Result<Option<SampleBlock>, DecodeError> {
            self.raw.decode_audio(packet)
        }

        fn reset(&mut self) {
            self.held.clear();
        }
    }

    #[test]
    fn test_burst_of_buffered_frames_all_release() {
        let mut p = DecodePipeline::new(
            Box::new(BufferingCodec {
                raw: RawCodec::new(),
                held: Vec::new(),
            }),
            DecodeConfig::default(),
            Arc::new(PipelineHealth::new()),
        );
        p.push(audio_at(120));
        p.push(video_at(100));
        p.push(video_at(110));
        p.push(video_at(120));

        let mut released = Vec::new();
        while let Some(frame) = p.poll_video() {
            released.push(frame.pts.micros);
        }
        assert_eq!(released, vec![100_000, 110_000, 120_000]);
        assert_eq!(p.health().frames_decoded(), 3);
    }

    #[test]
    fn test_three_consecutive_failures_escalate() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(0)));
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(1)));
        assert!(!p.take_unhealthy());

        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(2)));
        assert!(p.take_unhealthy());
        // Flag is consumed
        assert!(!p.take_unhealthy());
        assert_eq!(p.health().decode_failures(), 3);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(0)));
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(1)));
        p.push(video_at(10));
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(2)));
        assert!(!p.take_unhealthy(), "streak broken by a good packet");
    }

    #[test]
    fn test_backpressure_drops_oldest_and_counts() {
        let config = DecodeConfig {
            jitter: JitterConfig { max_depth: 2 },
            max_ready: 2,
            ..Default::default()
        };
        let mut p = pipeline(config);

        // 2 ready + 2 jittered fit; further pushes evict the oldest
        for i in 0..6 {
            p.push(audio_at(i * 10));
        }
        assert!(p.health().drops() > 0);
    }

    #[test]
    fn test_skipped_audio_still_releases_video() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(video_at(100));

        // No decoded audio, but the stream position is known
        p.note_audio_skipped(Timestamp::from_micros(100_000));
        assert!(p.poll_video().is_some());
    }

    #[test]
    fn test_flush_discards_state() {
        let mut p = pipeline(DecodeConfig::default());
        p.push(video_at(100));
        p.push(audio_at(100));
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(0)));
        p.push(corrupt_packet(MediaKind::Video, Timestamp::from_micros(1)));

        p.flush();
        assert!(p.poll_video().is_none());
        assert!(p.poll_audio().is_none());
        assert!(!p.take_unhealthy());

        // Timestamps may restart after a flush without tripping the clamp
        p.push(video_at(5));
        p.push(audio_at(5));
        assert_eq!(p.poll_video().unwrap().pts.micros, 5_000);
    }
}
