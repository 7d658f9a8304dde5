//! FFmpeg-backed codec for real live streams
//!
//! H.264 video and AAC audio via `ac-ffmpeg`, implementing the pipeline's
//! `MediaDecoder` seam. Video output is packed YUV420p with stride padding
//! stripped; audio output is interleaved f32.

use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::codec::audio::AudioDecoder;
use ac_ffmpeg::codec::video::VideoDecoder;
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp as FfTimestamp};
use bytes::Bytes;
use log::warn;

use super::codec::{DecodeError, MediaDecoder};
use super::types::{MediaKind, Packet, SampleBlock, VideoFrame};

const I16_TO_F32: f32 = 1.0 / 32768.0;

/// FFmpeg decoder pair for one source
pub struct FfmpegCodec {
    video: VideoDecoder,
    audio: AudioDecoder,
    /// Output sample rate reported on decoded blocks
    sample_rate: u32,
    /// Reusable buffer for packed YUV output to avoid per-frame allocation
    packed_buffer: Vec<u8>,
    cached_dims: Option<(usize, usize)>,
}

// The raw FFmpeg contexts are only touched from the owning source task.
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
    /// Create decoders for an H.264 + AAC stream
    pub fn new(sample_rate: u32) -> Result<Self, ac_ffmpeg::Error> {
        Ok(Self {
            video: Self::new_video_decoder()?,
            audio: AudioDecoder::new("aac")?,
            sample_rate,
            packed_buffer: Vec::new(),
            cached_dims: None,
        })
    }

    fn new_video_decoder() -> Result<VideoDecoder, ac_ffmpeg::Error> {
        VideoDecoder::builder("h264")?
            .time_base(TimeBase::new(1, 1_000_000))
            .build()
    }

    fn pack_current_frame(&mut self, frame: &ac_ffmpeg::codec::video::VideoFrame) -> (usize, usize) {
        let w = frame.width();
        let h = frame.height();
        let planes = frame.planes();
        let (uw, uh) = (w / 2, h / 2);
        let total = w * h + uw * uh * 2;

        if self.cached_dims != Some((w, h)) {
            self.packed_buffer.resize(total, 0);
            self.cached_dims = Some((w, h));
        }

        let y_size = w * h;
        let u_size = uw * uh;
        extract_plane(
            &mut self.packed_buffer[..y_size],
            planes[0].data(),
            planes[0].line_size(),
            w,
            h,
        );
        extract_plane(
            &mut self.packed_buffer[y_size..y_size + u_size],
            planes[1].data(),
            planes[1].line_size(),
            uw,
            uh,
        );
        extract_plane(
            &mut self.packed_buffer[y_size + u_size..total],
            planes[2].data(),
            planes[2].line_size(),
            uw,
            uh,
        );
        (w, h)
    }
}

impl MediaDecoder for FfmpegCodec {
    fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
        let pts = FfTimestamp::new(packet.pts.micros, TimeBase::new(1, 1_000_000));
        let ff_packet = PacketMut::from(packet.data.as_ref()).with_pts(pts).freeze();

        if let Err(e) = self.video.try_push(ff_packet) {
            if !e.is_again() {
                return Err(DecodeError::new(MediaKind::Video, e.to_string()));
            }
        }

        // Drain every frame this packet completed; the decoder can flush a
        // burst of buffered reference frames at once
        let mut frames = Vec::new();
        loop {
            match self.video.take() {
                Ok(Some(frame)) => {
                    let (w, h) = self.pack_current_frame(&frame);
                    frames.push(VideoFrame {
                        data: Bytes::from(self.packed_buffer.clone()),
                        width: w as u32,
                        height: h as u32,
                        pts: packet.pts,
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DecodeError::new(MediaKind::Video, e.to_string())),
            }
        }
        Ok(frames)
    }

    fn decode_audio(&mut self, packet: &Packet) -> Result<Option<SampleBlock>, DecodeError> {
        let ff_packet = PacketMut::from(packet.data.as_ref()).freeze();
        if let Err(e) = self.audio.try_push(ff_packet) {
            if !e.is_again() {
                return Err(DecodeError::new(MediaKind::Audio, e.to_string()));
            }
        }

        let mut samples: Vec<f32> = Vec::new();
        let mut channels = 2u16;
        while let Ok(Some(frame)) = self.audio.take() {
            let planes = frame.planes();
            let sample_count = frame.samples();
            if sample_count == 0 {
                continue;
            }

            if planes.len() >= 2 {
                // Planar stereo
                if !append_planar_stereo(&mut samples, planes[0].data(), planes[1].data(), sample_count) {
                    return Err(DecodeError::new(MediaKind::Audio, "short audio planes"));
                }
            } else if let Some(data) = planes.first().map(|p| p.data()) {
                // Interleaved or mono
                if !append_interleaved(&mut samples, data, sample_count) {
                    return Err(DecodeError::new(MediaKind::Audio, "short audio plane"));
                }
                channels = 1;
            }
        }

        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(SampleBlock {
            samples,
            sample_rate: self.sample_rate,
            channels,
            pts: packet.pts,
        }))
    }

    fn reset(&mut self) {
        match Self::new_video_decoder() {
            Ok(v) => self.video = v,
            Err(e) => warn!("could not rebuild video decoder, keeping stale state: {}", e),
        }
        match AudioDecoder::new("aac") {
            Ok(a) => self.audio = a,
            Err(e) => warn!("could not rebuild audio decoder, keeping stale state: {}", e),
        }
        self.cached_dims = None;
    }
}

/// Extract a plane from padded source to contiguous destination
#[inline]
fn extract_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    // Fast path: no stride padding
    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }

    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}

fn append_planar_stereo(out: &mut Vec<f32>, left: &[u8], right: &[u8], sample_count: usize) -> bool {
    let min_bytes_f32 = sample_count * 4;
    if left.len() >= min_bytes_f32 && right.len() >= min_bytes_f32 {
        let left_f32: &[f32] =
            unsafe { std::slice::from_raw_parts(left.as_ptr() as *const f32, sample_count) };
        let right_f32: &[f32] =
            unsafe { std::slice::from_raw_parts(right.as_ptr() as *const f32, sample_count) };
        for i in 0..sample_count {
            out.push(left_f32[i]);
            out.push(right_f32[i]);
        }
        return true;
    }

    let min_bytes_i16 = sample_count * 2;
    if left.len() >= min_bytes_i16 && right.len() >= min_bytes_i16 {
        let left_i16: &[i16] =
            unsafe { std::slice::from_raw_parts(left.as_ptr() as *const i16, sample_count) };
        let right_i16: &[i16] =
            unsafe { std::slice::from_raw_parts(right.as_ptr() as *const i16, sample_count) };
        for i in 0..sample_count {
            out.push(left_i16[i] as f32 * I16_TO_F32);
            out.push(right_i16[i] as f32 * I16_TO_F32);
        }
        return true;
    }
    false
}

fn append_interleaved(out: &mut Vec<f32>, data: &[u8], sample_count: usize) -> bool {
    let min_bytes_f32 = sample_count * 4;
    if data.len() >= min_bytes_f32 {
        let data_f32: &[f32] =
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const f32, sample_count) };
        out.extend_from_slice(data_f32);
        return true;
    }

    let min_bytes_i16 = sample_count * 2;
    if data.len() >= min_bytes_i16 {
        let data_i16: &[i16] =
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i16, sample_count) };
        out.extend(data_i16.iter().map(|&s| s as f32 * I16_TO_F32));
        return true;
    }
    false
}
