//! Synthetic tone backend
//!
//! Generates a paced sine tone plus a flat test-card video stream per
//! room, so a full wall can run without any upstream platform. Used by the
//! demo binary.

use async_trait::async_trait;
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::time::Instant;

use crate::pipeline::codec::{MediaDecoder, RawCodec, raw_audio_packet, raw_video_packet};
use crate::pipeline::types::{Packet, Timestamp};

use super::backend::{BackendSession, SourceBackend};
use super::{ConnectError, Room, StreamFault};

const FRAME_WIDTH: u32 = 32;
const FRAME_HEIGHT: u32 = 18;

/// Backend producing one synthetic A/V stream per open
pub struct SynthBackend {
    sample_rate: u32,
    block: Duration,
}

impl SynthBackend {
    pub fn new(sample_rate: u32, block: Duration) -> Self {
        Self { sample_rate, block }
    }
}

impl Default for SynthBackend {
    fn default() -> Self {
        Self::new(48_000, Duration::from_millis(20))
    }
}

#[async_trait]
impl SourceBackend for SynthBackend {
    async fn open(&self, room: &Room) -> Result<Box<dyn BackendSession>, ConnectError> {
        Ok(Box::new(SynthSession {
            sample_rate: self.sample_rate,
            block: self.block,
            freq: tone_for_room(&room.id.0),
            phase: 0.0,
            tick: 0,
            video_pending: true,
            started: Instant::now(),
        }))
    }

    fn new_decoder(&self) -> Box<dyn MediaDecoder> {
        Box::new(RawCodec::new())
    }
}

/// Map a room id to a stable tone in a musical-ish range
fn tone_for_room(id: &str) -> f32 {
    let hash: u32 = id.bytes().fold(17u32, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as u32)
    });
    220.0 + (hash % 12) as f32 * 55.0
}

struct SynthSession {
    sample_rate: u32,
    block: Duration,
    freq: f32,
    phase: f32,
    tick: u64,
    /// Each tick emits one video frame then one audio block
    video_pending: bool,
    started: Instant,
}

#[async_trait]
impl BackendSession for SynthSession {
    async fn read(&mut self) -> Result<Packet, StreamFault> {
        let pts = Timestamp::from_micros((self.tick as u128 * self.block.as_micros()) as i64);

        if self.video_pending {
            self.video_pending = false;
            // Test card: luma sweeps over time
            let luma = (self.tick % 256) as u8;
            let y_size = (FRAME_WIDTH * FRAME_HEIGHT) as usize;
            let uv_size = y_size / 4;
            let mut planes = vec![luma; y_size];
            planes.resize(y_size + uv_size * 2, 128);
            return Ok(raw_video_packet(
                FRAME_WIDTH,
                FRAME_HEIGHT,
                &planes,
                pts,
                self.tick == 0,
            ));
        }

        // Pace the audio block against the wall clock
        let due = self.started + self.block * self.tick as u32;
        tokio::time::sleep_until(due).await;

        let frames = (self.sample_rate as u128 * self.block.as_micros() / 1_000_000) as usize;
        let step = TAU * self.freq / self.sample_rate as f32;
        let samples: Vec<f32> = (0..frames)
            .map(|_| {
                let s = self.phase.sin() * 0.2;
                self.phase = (self.phase + step) % TAU;
                s
            })
            .collect();

        self.tick += 1;
        self.video_pending = true;
        Ok(raw_audio_packet(self.sample_rate, 1, &samples, pts))
    }

    async fn close(&mut self) {}
}
