//! Core media unit types shared across the engine

use bytes::Bytes;
use std::time::Duration;

/// Timestamp representation for media units
///
/// Source-relative presentation time. Within one source, packets and
/// decoded units carry non-decreasing timestamps; across sources there is
/// no relation (each room has its own clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since the source's stream start
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since stream start
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Convert to duration (negative timestamps clamp to zero)
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Absolute difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Encoded elementary packet demuxed from one source's transport
#[derive(Clone)]
pub struct Packet {
    /// Kind of media (video or audio)
    pub kind: MediaKind,

    /// Encoded payload
    pub data: Bytes,

    /// Presentation timestamp, source-relative
    pub pts: Timestamp,

    /// Whether this is a keyframe (video) or other sync point
    pub keyframe: bool,
}

impl Packet {
    /// Create a new video packet
    pub fn video(data: Bytes, pts: Timestamp, keyframe: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            data,
            pts,
            keyframe,
        }
    }

    /// Create a new audio packet
    pub fn audio(data: Bytes, pts: Timestamp) -> Self {
        Self {
            kind: MediaKind::Audio,
            data,
            pts,
            keyframe: false,
        }
    }

    /// Get the size of the payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("keyframe", &self.keyframe)
            .field("size", &self.size())
            .finish()
    }
}

/// Decoded video frame: packed YUV420p planes, consumed exactly once by
/// the renderer for its grid cell
#[derive(Clone)]
pub struct VideoFrame {
    /// Y plane (w*h) + U plane (w/2 * h/2) + V plane (w/2 * h/2), contiguous
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp, source-relative
    pub pts: Timestamp,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Decoded audio block: interleaved f32 samples, consumed exactly once by
/// the mixer
#[derive(Debug, Clone)]
pub struct SampleBlock {
    /// Interleaved samples, `frames() * channels` long
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Presentation timestamp of the first sample, source-relative
    pub pts: Timestamp,
}

impl SampleBlock {
    /// Create a block of silence
    pub fn silence(frames: usize, sample_rate: u32, channels: u16, pts: Timestamp) -> Self {
        Self {
            samples: vec![0.0; frames * channels as usize],
            sample_rate,
            channels,
            pts,
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Wall-clock duration covered by this block
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.frames() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_micros(1_000);
        let later = ts.add(Duration::from_millis(5));
        assert_eq!(later.micros, 6_000);
        assert_eq!(later.diff(ts), Duration::from_micros(5_000));
        assert_eq!(ts.diff(later), Duration::from_micros(5_000));
    }

    #[test]
    fn test_sample_block_frames() {
        let block = SampleBlock::silence(480, 48_000, 2, Timestamp::from_micros(0));
        assert_eq!(block.samples.len(), 960);
        assert_eq!(block.frames(), 480);
        assert_eq!(block.duration(), Duration::from_millis(10));
    }
}
