//! Decoder seam between the pipeline and concrete codecs
//!
//! `MediaDecoder` is implemented by the FFmpeg-backed codec for real
//! streams and by `RawCodec` for synthetic sources, packet logs written in
//! raw form, and tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::types::{MediaKind, Packet, SampleBlock, Timestamp, VideoFrame};

/// Per-packet decode failure. The pipeline drops the packet, counts the
/// failure, and keeps going; it never propagates out of the source.
#[derive(Debug, Error)]
#[error("decode failed ({kind}): {reason}")]
pub struct DecodeError {
    pub kind: MediaKind,
    pub reason: String,
}

impl DecodeError {
    pub fn new(kind: MediaKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Decodes one source's elementary packets into presentation units.
///
/// Implementations keep per-stream codec state and must tolerate arbitrary
/// (corrupt) payloads by returning `DecodeError` rather than panicking.
/// `decode_video` returns every frame the packet completed, which can be
/// several when the codec flushes buffered reference frames, or none while
/// it is still buffering; `Ok(None)` from `decode_audio` means the same.
pub trait MediaDecoder: Send {
    fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError>;

    fn decode_audio(&mut self, packet: &Packet) -> Result<Option<SampleBlock>, DecodeError>;

    /// Drop all internal codec state (buffer-clear on resync)
    fn reset(&mut self);
}

const RAW_VIDEO_HEADER: usize = 8; // width u32 LE + height u32 LE
const RAW_AUDIO_HEADER: usize = 8; // sample_rate u32 LE + channels u16 LE + reserved u16

/// Passthrough codec for raw packets
///
/// Video payload: `width u32 | height u32 | YUV420p planes`.
/// Audio payload: `sample_rate u32 | channels u16 | reserved u16 | f32 samples`.
/// Malformed payloads produce `DecodeError`, which is how tests inject
/// corrupt packets deterministically.
#[derive(Debug, Default)]
pub struct RawCodec;

impl RawCodec {
    pub fn new() -> Self {
        Self
    }
}

impl MediaDecoder for RawCodec {
    fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
        let data = &packet.data;
        if data.len() < RAW_VIDEO_HEADER {
            return Err(DecodeError::new(MediaKind::Video, "truncated header"));
        }
        let mut header = &data[..RAW_VIDEO_HEADER];
        let width = header.get_u32_le();
        let height = header.get_u32_le();
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(DecodeError::new(
                MediaKind::Video,
                format!("bad dimensions {width}x{height}"),
            ));
        }
        let expected = (width * height + (width / 2) * (height / 2) * 2) as usize;
        let payload = data.slice(RAW_VIDEO_HEADER..);
        if payload.len() != expected {
            return Err(DecodeError::new(
                MediaKind::Video,
                format!("payload {} bytes, expected {expected}", payload.len()),
            ));
        }
        Ok(vec![VideoFrame {
            data: payload,
            width,
            height,
            pts: packet.pts,
        }])
    }

    fn decode_audio(&mut self, packet: &Packet) -> Result<Option<SampleBlock>, DecodeError> {
        let data = &packet.data;
        if data.len() < RAW_AUDIO_HEADER {
            return Err(DecodeError::new(MediaKind::Audio, "truncated header"));
        }
        let mut header = &data[..RAW_AUDIO_HEADER];
        let sample_rate = header.get_u32_le();
        let channels = header.get_u16_le();
        if sample_rate == 0 || channels == 0 {
            return Err(DecodeError::new(MediaKind::Audio, "bad stream parameters"));
        }
        let payload = &data[RAW_AUDIO_HEADER..];
        if payload.len() % (4 * channels as usize) != 0 {
            return Err(DecodeError::new(
                MediaKind::Audio,
                format!("payload {} bytes not frame-aligned", payload.len()),
            ));
        }
        let samples = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(SampleBlock {
            samples,
            sample_rate,
            channels,
            pts: packet.pts,
        }))
    }

    fn reset(&mut self) {}
}

/// Build a raw-format video packet (synthetic sources, packet logs, tests)
pub fn raw_video_packet(
    width: u32,
    height: u32,
    planes: &[u8],
    pts: Timestamp,
    keyframe: bool,
) -> Packet {
    let mut buf = BytesMut::with_capacity(RAW_VIDEO_HEADER + planes.len());
    buf.put_u32_le(width);
    buf.put_u32_le(height);
    buf.put_slice(planes);
    Packet::video(buf.freeze(), pts, keyframe)
}

/// Build a raw-format audio packet
pub fn raw_audio_packet(sample_rate: u32, channels: u16, samples: &[f32], pts: Timestamp) -> Packet {
    let mut buf = BytesMut::with_capacity(RAW_AUDIO_HEADER + samples.len() * 4);
    buf.put_u32_le(sample_rate);
    buf.put_u16_le(channels);
    buf.put_u16_le(0);
    for &s in samples {
        buf.put_f32_le(s);
    }
    Packet::audio(buf.freeze(), pts)
}

/// A video packet no decoder can parse (tests and fault injection)
pub fn corrupt_packet(kind: MediaKind, pts: Timestamp) -> Packet {
    Packet {
        kind,
        data: Bytes::from_static(&[0xde, 0xad]),
        pts,
        keyframe: false,
    }
}
