//! Packet-log file backend
//!
//! Replays a recorded stream from disk. The log is a flat sequence of
//! records: `kind u8 | keyframe u8 | pts i64 LE | len u32 LE | payload`.
//! Payloads are either raw-codec packets or encoded H.264/AAC, chosen at
//! backend construction.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::pipeline::codec::{MediaDecoder, RawCodec};
use crate::pipeline::ffmpeg::FfmpegCodec;
use crate::pipeline::types::{MediaKind, Packet, Timestamp};

use super::backend::{BackendSession, SourceBackend};
use super::{ConnectError, Room, StreamFault};

/// Payload encoding of a packet log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCodec {
    /// Raw-codec packets (as written by `write_packet_log`)
    Raw,
    /// H.264 video + AAC audio elementary packets
    H264Aac,
}

/// Backend replaying packet logs; the room id is the file path relative to
/// the backend's base directory
pub struct FileBackend {
    base_dir: PathBuf,
    codec: LogCodec,
    /// Pace reads against packet pts instead of replaying at full speed
    realtime: bool,
}

impl FileBackend {
    pub fn new(base_dir: impl Into<PathBuf>, codec: LogCodec) -> Self {
        Self {
            base_dir: base_dir.into(),
            codec,
            realtime: false,
        }
    }

    pub fn with_realtime_pacing(mut self) -> Self {
        self.realtime = true;
        self
    }
}

#[async_trait]
impl SourceBackend for FileBackend {
    async fn open(&self, room: &Room) -> Result<Box<dyn BackendSession>, ConnectError> {
        let path = self.base_dir.join(&room.id.0);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ConnectError::new(&room.id, format!("{}: {e}", path.display())))?;
        Ok(Box::new(FileSession {
            reader: BufReader::new(file),
            realtime: self.realtime,
            started: Instant::now(),
        }))
    }

    fn new_decoder(&self) -> Box<dyn MediaDecoder> {
        match self.codec {
            LogCodec::Raw => Box::new(RawCodec::new()),
            LogCodec::H264Aac => match FfmpegCodec::new(48_000) {
                Ok(codec) => Box::new(codec),
                Err(e) => {
                    // No way to decode this log; RawCodec will fault every
                    // packet and the controller marks the source Failed.
                    log::error!("ffmpeg codec unavailable ({e}), source will fail");
                    Box::new(RawCodec::new())
                }
            },
        }
    }
}

struct FileSession {
    reader: BufReader<tokio::fs::File>,
    realtime: bool,
    started: Instant,
}

#[async_trait]
impl BackendSession for FileSession {
    async fn read(&mut self) -> Result<Packet, StreamFault> {
        let mut header = [0u8; 14];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(StreamFault::Ended);
            }
            Err(e) => return Err(StreamFault::Transient(e.to_string())),
        }

        let kind = match header[0] {
            0 => MediaKind::Video,
            1 => MediaKind::Audio,
            other => {
                return Err(StreamFault::Transient(format!("bad record kind {other}")));
            }
        };
        let keyframe = header[1] != 0;
        let pts = Timestamp::from_micros(i64::from_le_bytes(header[2..10].try_into().unwrap()));
        let len = u32::from_le_bytes(header[10..14].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| StreamFault::Transient(e.to_string()))?;

        if self.realtime {
            tokio::time::sleep_until(self.started + pts.as_duration()).await;
        }

        Ok(Packet {
            kind,
            data: Bytes::from(payload),
            pts,
            keyframe,
        })
    }

    async fn close(&mut self) {}
}

/// Write a packet log in the format `FileBackend` replays
pub fn write_packet_log(path: &Path, packets: &[Packet]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for packet in packets {
        let kind = match packet.kind {
            MediaKind::Video => 0u8,
            MediaKind::Audio => 1u8,
        };
        file.write_all(&[kind, packet.keyframe as u8])?;
        file.write_all(&packet.pts.micros.to_le_bytes())?;
        file.write_all(&(packet.data.len() as u32).to_le_bytes())?;
        file.write_all(&packet.data)?;
    }
    Ok(())
}
