//! Stream connection: a backend session plus timestamp policing
//!
//! Enforces the per-source invariant that packets carry non-decreasing
//! timestamps, and turns large discontinuities into `StreamFault::Desync`
//! for the resync controller.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::types::{MediaKind, Packet, Timestamp};

use super::backend::{BackendSession, SourceBackend};
use super::{ConnectError, Room, StreamFault};

/// One live network session to one room
pub struct StreamConnection {
    session: Box<dyn BackendSession>,
    room_id: String,
    /// Discontinuity beyond this threshold (either direction) is a
    /// protocol desync; smaller regressions are clamped
    desync_threshold: Duration,
    /// Last accepted pts per kind (video and audio interleave freely)
    last_video_pts: Option<Timestamp>,
    last_audio_pts: Option<Timestamp>,
}

impl StreamConnection {
    /// Open a session for `room` through its backend
    pub async fn open(
        backend: &Arc<dyn SourceBackend>,
        room: &Room,
        desync_threshold: Duration,
    ) -> Result<Self, ConnectError> {
        let session = backend.open(room).await?;
        info!("{}: session opened", room.id);
        Ok(Self {
            session,
            room_id: room.id.to_string(),
            desync_threshold,
            last_video_pts: None,
            last_audio_pts: None,
        })
    }

    /// Read the next packet, with the timestamp policy applied
    pub async fn read(&mut self) -> Result<Packet, StreamFault> {
        let mut packet = self.session.read().await?;

        let last = match packet.kind {
            MediaKind::Video => &mut self.last_video_pts,
            MediaKind::Audio => &mut self.last_audio_pts,
        };

        if let Some(prev) = *last {
            let jump = packet.pts.diff(prev);
            if jump > self.desync_threshold {
                debug!(
                    "{}: {} pts jumped {} -> {} ({:?})",
                    self.room_id, packet.kind, prev, packet.pts, jump
                );
                return Err(StreamFault::Desync(jump));
            }
            // Small regressions clamp so downstream sees a monotone stream
            if packet.pts < prev {
                packet.pts = prev;
            }
        }
        *last = Some(packet.pts);

        Ok(packet)
    }

    /// Tear the session down
    pub async fn close(mut self) {
        self.session.close().await;
        info!("{}: session closed", self.room_id);
    }
}
