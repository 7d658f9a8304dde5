//! Per-source decode pipeline
//!
//! Everything between a source's demuxed packets and its presentation
//! units:
//! - `types`: timestamped packets, frames, and sample blocks
//! - `jitter`: bounded arrival-order packet buffering with drop accounting
//! - `codec`: the `MediaDecoder` seam plus the raw passthrough codec
//! - `ffmpeg`: the H.264/AAC codec for real streams
//! - `decode`: the pipeline itself, with A/V release reconciliation and
//!   failure escalation
//! - `health`: per-source metrics and stall detection

pub mod codec;
pub mod decode;
pub mod ffmpeg;
pub mod health;
pub mod jitter;
pub mod types;

pub use codec::{DecodeError, MediaDecoder, RawCodec};
pub use decode::{DecodeConfig, DecodePipeline};
pub use health::{PipelineHealth, SourceStats};
pub use jitter::{JitterBuffer, JitterConfig};
pub use types::{MediaKind, Packet, SampleBlock, Timestamp, VideoFrame};
