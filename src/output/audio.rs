//! Speaker sink for the mixed output
//!
//! A cpal output stream fed from a ring buffer of interleaved stereo f32
//! samples. The tick loop pushes each mixed block; the audio callback
//! reads at device pace and fills with silence when the buffer runs dry.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};

use crate::pipeline::types::SampleBlock;

/// Ring capacity in samples; bounds both memory and added output latency
/// (~170ms at 48kHz stereo)
const RING_CAPACITY: usize = 16384;

/// Fixed-capacity sample ring with drop-oldest overflow
struct SampleRing {
    buffer: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    len: usize,
    capacity: usize,
    samples_dropped: u64,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0f32; capacity],
            write_pos: 0,
            read_pos: 0,
            len: 0,
            capacity,
            samples_dropped: 0,
        }
    }

    /// Append samples, evicting the oldest when full
    fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.len >= self.capacity {
                self.read_pos = (self.read_pos + 1) % self.capacity;
                self.samples_dropped += 1;
            } else {
                self.len += 1;
            }
            self.buffer[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
    }

    /// Fill `output`, padding with silence when the ring runs dry
    fn read(&mut self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            if self.len > 0 {
                *sample = self.buffer[self.read_pos];
                self.read_pos = (self.read_pos + 1) % self.capacity;
                self.len -= 1;
            } else {
                *sample = 0.0;
            }
        }
    }
}

/// Default-device speaker output for mixed stereo blocks
pub struct AudioSink {
    ring: Arc<Mutex<SampleRing>>,
    _stream: cpal::Stream, // kept alive
}

unsafe impl Send for AudioSink {}

impl AudioSink {
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no output audio device"))?;
        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = Arc::new(Mutex::new(SampleRing::new(RING_CAPACITY)));
        let ring_clone = Arc::clone(&ring);

        let stream = device.build_output_stream(
            &config,
            move |output: &mut [f32], _| {
                if let Ok(mut ring) = ring_clone.lock() {
                    ring.read(output);
                } else {
                    output.fill(0.0);
                }
            },
            |err| log::error!("audio output error: {err}"),
            None,
        )?;
        stream.play()?;

        Ok(Self {
            ring,
            _stream: stream,
        })
    }

    /// Queue one mixed block for playback
    pub fn push(&self, block: &SampleBlock) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(&block.samples);
        }
    }

    /// Samples evicted because the tick loop outpaced the device
    pub fn dropped(&self) -> u64 {
        self.ring
            .lock()
            .map(|ring| ring.samples_dropped)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_read_pads_with_silence() {
        let mut ring = SampleRing::new(8);
        ring.push(&[1.0, 2.0, 3.0]);

        let mut out = [9.0f32; 5];
        ring.read(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_ring_overflow_drops_oldest() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ring.samples_dropped, 2);

        let mut out = [0.0f32; 4];
        ring.read(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_ring_wraparound() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0]);
        let mut out = [0.0f32; 2];
        ring.read(&mut out);

        ring.push(&[4.0, 5.0, 6.0]);
        let mut rest = [0.0f32; 4];
        ring.read(&mut rest);
        assert_eq!(rest, [3.0, 4.0, 5.0, 6.0]);
    }
}
