//! Spatial audio mixer
//!
//! Folds every enabled source's audio into one interleaved stereo block
//! per tick, placing each source in the soundstage by its (x, y, z)
//! position relative to the listener at the grid center.
//!
//! Gain model (documented decision; the platform only prescribes
//! monotonicity and continuity):
//! - attenuation `1 / (1 + distance)`, unity at the listener origin
//! - linear equal-sum pan from the azimuth in the horizontal x–z plane,
//!   clamped to ±90°; `x > 0` pans right, `z` is depth, `y` only adds
//!   distance. The two channel gains always sum to the attenuated volume,
//!   so a centered source at distance zero reconstructs its input exactly
//!   when the channels are summed.
//!
//! Control changes (position, volume) are ramped linearly across the next
//! block to avoid clicks; enable/disable switches contribution immediately
//! as required by the session contract.
//!
//! Source blocks rarely land on the tick size (AAC delivers 1024-frame
//! blocks), so each voice carries its residual input frames into the next
//! tick rather than discarding them. The backlog is bounded; a source
//! running faster than the output clock loses its oldest frames.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::f32::consts::FRAC_PI_2;

use crate::pipeline::types::{SampleBlock, Timestamp};
use crate::source::SourceId;

/// Spatial position of one source relative to the listener origin
///
/// Semantically unbounded; interpreted against a unit listening sphere.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn distance(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Mixer output format
#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub sample_rate: u32,
    /// Output frames per mix call (one tick)
    pub block_frames: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_frames: 960, // 20ms
        }
    }
}

/// Backlog bound per voice, in output blocks
const PENDING_CAP_BLOCKS: usize = 8;

/// Read-only snapshot of one voice's control state, for persistence
#[derive(Debug, Clone, Copy)]
pub struct VoiceState {
    pub position: Position,
    pub volume: f32,
    pub enabled: bool,
    pub muted: bool,
}

impl Default for VoiceState {
    fn default() -> Self {
        Self {
            position: Position::default(),
            volume: 1.0,
            enabled: true,
            muted: false,
        }
    }
}

/// Per-source mixing control state
struct Voice {
    position: Position,
    volume: f32,
    enabled: bool,
    muted: bool,
    /// Stereo gains applied at the end of the previous block; `None`
    /// means the next block starts at its target directly (fresh voice or
    /// re-enable, no residual ramp)
    current_gains: Option<[f32; 2]>,
    /// Mono input frames at the output rate not yet folded into a tick
    pending: VecDeque<f32>,
}

impl Voice {
    fn new() -> Self {
        Self {
            position: Position::default(),
            volume: 1.0,
            enabled: true,
            muted: false,
            current_gains: None,
            pending: VecDeque::new(),
        }
    }

    /// Fold the block to mono at the output rate and append it to the
    /// backlog, dropping the oldest frames past the cap
    fn queue_block(&mut self, block: &SampleBlock, out_rate: u32, cap: usize) {
        let in_frames = block.frames();
        if in_frames == 0 {
            return;
        }
        let channels = block.channels.max(1) as usize;
        let out_frames = if block.sample_rate == out_rate {
            in_frames
        } else {
            (in_frames as u64 * out_rate as u64 / block.sample_rate.max(1) as u64) as usize
        };

        for i in 0..out_frames {
            // Nearest-frame fetch, rate-converting if the source differs
            let j = if block.sample_rate == out_rate {
                i
            } else {
                (i as u64 * block.sample_rate as u64 / out_rate as u64) as usize
            };
            let base = j.min(in_frames - 1) * channels;
            let mut s = 0.0f32;
            for c in 0..channels {
                s += block.samples[base + c];
            }
            self.pending.push_back(s / channels as f32);
        }

        if self.pending.len() > cap {
            let excess = self.pending.len() - cap;
            self.pending.drain(..excess);
            debug!("audio backlog over {cap} frames, dropped {excess}");
        }
    }
}

/// Combines per-source audio blocks into the output soundstage
///
/// Purely a function of the registered control state and the input
/// blocks; the only carried state is the per-voice gain ramp and the
/// output timestamp counter. Control mutation and `mix` are both brief,
/// tick-scoped operations; the session serializes them with a short lock.
pub struct SpatialMixer {
    config: MixerConfig,
    voices: HashMap<SourceId, Voice>,
    solo: Option<SourceId>,
    /// Output frames produced so far, the mix clock
    frames_out: u64,
}

impl SpatialMixer {
    pub fn new(config: MixerConfig) -> Self {
        Self {
            config,
            voices: HashMap::new(),
            solo: None,
            frames_out: 0,
        }
    }

    pub fn add_source(&mut self, id: SourceId) {
        self.voices.insert(id, Voice::new());
    }

    pub fn remove_source(&mut self, id: SourceId) {
        self.voices.remove(&id);
        if self.solo == Some(id) {
            self.solo = None;
        }
    }

    pub fn set_position(&mut self, id: SourceId, position: Position) {
        if let Some(voice) = self.voices.get_mut(&id) {
            voice.position = position;
        }
    }

    pub fn set_volume(&mut self, id: SourceId, volume: f32) {
        if let Some(voice) = self.voices.get_mut(&id) {
            voice.volume = volume.max(0.0);
        }
    }

    /// Enable or disable a source's contribution. Takes effect on the very
    /// next mix call; disabling drops the ramp state so re-enabling
    /// restores the source without residual offset.
    pub fn set_enabled(&mut self, id: SourceId, enabled: bool) {
        if let Some(voice) = self.voices.get_mut(&id) {
            voice.enabled = enabled;
            if !enabled {
                voice.current_gains = None;
                voice.pending.clear();
            }
        }
    }

    pub fn set_muted(&mut self, id: SourceId, muted: bool) {
        if let Some(voice) = self.voices.get_mut(&id) {
            voice.muted = muted;
            if muted {
                voice.current_gains = None;
                voice.pending.clear();
            }
        }
    }

    /// Solo one source (or clear with `None`); at mix time solo overrides
    /// every other source's contribution without touching their state
    pub fn set_solo(&mut self, id: Option<SourceId>) {
        self.solo = id;
    }

    pub fn is_enabled(&self, id: SourceId) -> bool {
        self.voices.get(&id).map(|v| v.enabled).unwrap_or(false)
    }

    /// Control snapshot of one voice, for saving the wall layout
    pub fn voice_state(&self, id: SourceId) -> Option<VoiceState> {
        self.voices.get(&id).map(|v| VoiceState {
            position: v.position,
            volume: v.volume,
            enabled: v.enabled,
            muted: v.muted,
        })
    }

    /// Fold the given per-source blocks into one stereo output block.
    ///
    /// Sources with no buffered audio this tick contribute silence for
    /// this tick only; disabled, muted, and non-solo sources are excluded
    /// from the summation entirely and their backlog is discarded.
    pub fn mix(&mut self, inputs: &[(SourceId, SampleBlock)]) -> SampleBlock {
        let frames = self.config.block_frames;
        let mut out = vec![0.0f32; frames * 2];
        let cap = frames * PENDING_CAP_BLOCKS;

        for (id, block) in inputs {
            let Some(voice) = self.voices.get_mut(id) else {
                debug!("block from unregistered {id}, skipping");
                continue;
            };
            voice.queue_block(block, self.config.sample_rate, cap);
        }

        for (id, voice) in self.voices.iter_mut() {
            let excluded = !voice.enabled
                || voice.muted
                || self.solo.is_some_and(|solo| solo != *id);
            if excluded {
                voice.pending.clear();
                continue;
            }
            if voice.pending.is_empty() {
                continue;
            }

            let target = stereo_gains(voice.position, voice.volume);
            let start = voice.current_gains.unwrap_or(target);

            fold_block(&mut out, &mut voice.pending, start, target);
            voice.current_gains = Some(target);
        }

        let pts = Timestamp::from_micros(
            (self.frames_out as i64) * 1_000_000 / self.config.sample_rate as i64,
        );
        self.frames_out += frames as u64;

        SampleBlock {
            samples: out,
            sample_rate: self.config.sample_rate,
            channels: 2,
            pts,
        }
    }
}

/// Stereo gains for a position and volume
fn stereo_gains(position: Position, volume: f32) -> [f32; 2] {
    let attenuation = 1.0 / (1.0 + position.distance());
    // Azimuth in the horizontal plane; sources behind fold to the sides
    let azimuth = position.x.atan2(position.z);
    let pan = (azimuth / FRAC_PI_2).clamp(-1.0, 1.0);
    let right = 0.5 * (1.0 + pan);
    let gain = attenuation * volume;
    [gain * (1.0 - right), gain * right]
}

/// Add one voice's backlog into the stereo accumulator with a linear gain
/// ramp from `start` to `target` across the block; frames beyond the
/// block stay queued for the next tick
fn fold_block(out: &mut [f32], pending: &mut VecDeque<f32>, start: [f32; 2], target: [f32; 2]) {
    let frames = out.len() / 2;
    if frames == 0 {
        return;
    }

    let n = pending.len().min(frames);
    for (i, s) in pending.drain(..n).enumerate() {
        let t = i as f32 / frames as f32;
        let gl = start[0] + (target[0] - start[0]) * t;
        let gr = start[1] + (target[1] - start[1]) * t;
        out[2 * i] += s * gl;
        out[2 * i + 1] += s * gr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;
    const FRAMES: usize = 64;

    fn mixer() -> SpatialMixer {
        SpatialMixer::new(MixerConfig {
            sample_rate: RATE,
            block_frames: FRAMES,
        })
    }

    fn mono_block(value: f32) -> SampleBlock {
        SampleBlock {
            samples: vec![value; FRAMES],
            sample_rate: RATE,
            channels: 1,
            pts: Timestamp::from_micros(0),
        }
    }

    fn id(n: u64) -> SourceId {
        SourceId(n)
    }

    #[test]
    fn test_identity_at_origin() {
        let mut m = mixer();
        m.add_source(id(1));

        let out = m.mix(&[(id(1), mono_block(0.5))]);
        assert_eq!(out.channels, 2);
        assert_eq!(out.frames(), FRAMES);
        // Centered at distance zero: channel sum reconstructs the input
        for i in 0..FRAMES {
            let sum = out.samples[2 * i] + out.samples[2 * i + 1];
            assert!((sum - 0.5).abs() < 1e-6, "frame {i}: {sum}");
        }
    }

    #[test]
    fn test_attenuation_monotonic_in_distance() {
        let g_near = stereo_gains(Position::new(0.0, 0.0, 0.5), 1.0);
        let g_far = stereo_gains(Position::new(0.0, 0.0, 2.0), 1.0);
        assert!(g_near[0] + g_near[1] > g_far[0] + g_far[1]);
    }

    #[test]
    fn test_pan_follows_x() {
        let left = stereo_gains(Position::new(-1.0, 0.0, 1.0), 1.0);
        let right = stereo_gains(Position::new(1.0, 0.0, 1.0), 1.0);
        assert!(left[0] > left[1]);
        assert!(right[1] > right[0]);
        // Hard sides reach full separation
        let hard_left = stereo_gains(Position::new(-1.0, 0.0, 0.0), 1.0);
        assert!(hard_left[1].abs() < 1e-6);
    }

    #[test]
    fn test_disable_removes_next_tick_enable_restores() {
        let mut m = mixer();
        m.add_source(id(1));
        m.mix(&[(id(1), mono_block(0.5))]);

        m.set_enabled(id(1), false);
        let muted = m.mix(&[(id(1), mono_block(0.5))]);
        assert!(muted.samples.iter().all(|&s| s == 0.0));

        m.set_enabled(id(1), true);
        let restored = m.mix(&[(id(1), mono_block(0.5))]);
        // Restored without residual ramp offset
        let sum = restored.samples[0] + restored.samples[1];
        assert!((sum - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_block_is_silence_for_that_tick_only() {
        let mut m = mixer();
        m.add_source(id(1));
        m.add_source(id(2));

        // Source 2 stalls this tick; source 1 unaffected
        let out = m.mix(&[(id(1), mono_block(0.25))]);
        let sum = out.samples[0] + out.samples[1];
        assert!((sum - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_oversized_block_carries_into_next_tick() {
        let mut m = mixer();
        m.add_source(id(1));

        // 16 frames more than one tick holds
        let big = SampleBlock {
            samples: vec![0.5; FRAMES + 16],
            sample_rate: RATE,
            channels: 1,
            pts: Timestamp::from_micros(0),
        };
        let first = m.mix(&[(id(1), big)]);
        let sum = first.samples[0] + first.samples[1];
        assert!((sum - 0.5).abs() < 1e-6);

        // The leftover frames come out on the next tick, nothing dropped
        let second = m.mix(&[]);
        for i in 0..16 {
            let sum = second.samples[2 * i] + second.samples[2 * i + 1];
            assert!((sum - 0.5).abs() < 1e-6, "frame {i}: {sum}");
        }
        assert!(second.samples[2 * 16..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut m = mixer();
        m.add_source(id(1));

        // Far more input than the backlog may hold; the mixer must not
        // accumulate it without bound
        let inputs: Vec<(SourceId, SampleBlock)> =
            (0..32).map(|_| (id(1), mono_block(0.5))).collect();
        m.mix(&inputs);

        let voice = m.voices.get(&id(1)).unwrap();
        assert!(voice.pending.len() <= FRAMES * PENDING_CAP_BLOCKS);
    }

    #[test]
    fn test_volume_and_mute() {
        let mut m = mixer();
        m.add_source(id(1));
        m.set_volume(id(1), 0.5);

        let out = m.mix(&[(id(1), mono_block(1.0))]);
        let sum = out.samples[0] + out.samples[1];
        assert!((sum - 0.5).abs() < 1e-6);

        m.set_muted(id(1), true);
        let silent = m.mix(&[(id(1), mono_block(1.0))]);
        assert!(silent.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_solo_overrides_others() {
        let mut m = mixer();
        m.add_source(id(1));
        m.add_source(id(2));
        m.set_solo(Some(id(2)));

        let out = m.mix(&[(id(1), mono_block(1.0)), (id(2), mono_block(0.25))]);
        let sum = out.samples[0] + out.samples[1];
        assert!((sum - 0.25).abs() < 1e-6);

        m.set_solo(None);
        let both = m.mix(&[(id(1), mono_block(1.0)), (id(2), mono_block(0.25))]);
        let sum = both.samples[0] + both.samples[1];
        assert!((sum - 1.25).abs() < 1e-5);
    }

    #[test]
    fn test_position_change_ramps_across_one_block() {
        let mut m = mixer();
        m.add_source(id(1));
        m.mix(&[(id(1), mono_block(1.0))]);

        // Move hard right: block starts near center, ends near target
        m.set_position(id(1), Position::new(1.0, 0.0, 0.0));
        let out = m.mix(&[(id(1), mono_block(1.0))]);
        let first_left = out.samples[0];
        let last_left = out.samples[2 * (FRAMES - 1)];
        assert!(first_left > last_left, "left gain must ramp down");

        // Next block is steady at the target
        let steady = m.mix(&[(id(1), mono_block(1.0))]);
        assert!(steady.samples[0].abs() < 0.05);
    }

    #[test]
    fn test_output_pts_monotone() {
        let mut m = mixer();
        m.add_source(id(1));
        let a = m.mix(&[]);
        let b = m.mix(&[]);
        assert!(b.pts > a.pts);
        assert_eq!(b.pts.micros - a.pts.micros, FRAMES as i64 * 1_000_000 / RATE as i64);
    }
}
