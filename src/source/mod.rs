//! Upstream sources: rooms, backends, and the stream connection
//!
//! A `Room` names one live broadcast on some platform; a `SourceBackend`
//! knows how to open it and demux its transport into elementary packets;
//! `StreamConnection` wraps the backend session with timestamp policing
//! and failure classification.

pub mod backend;
pub mod connection;
pub mod file;
pub mod scripted;
pub mod synth;

pub use backend::{BackendRegistry, BackendSession, SourceBackend};
pub use connection::StreamConnection;
pub use file::{FileBackend, LogCodec};
pub use scripted::{Script, ScriptItem, ScriptedBackend};
pub use synth::SynthBackend;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform-specific room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Engine-assigned identifier for one live source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// One upstream live room
///
/// Immutable once created, except the display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub display_name: String,
    /// Registered backend name that can open this room
    pub backend: String,
}

impl Room {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: RoomId(id.into()),
            display_name: display_name.into(),
            backend: backend.into(),
        }
    }
}

/// Session establishment failure. Surfaced per attempt; the resync
/// controller decides whether the attempt budget allows a retry.
#[derive(Debug, Clone, Error)]
#[error("cannot connect to room {room}: {reason}")]
pub struct ConnectError {
    pub room: RoomId,
    pub reason: String,
}

impl ConnectError {
    pub fn new(room: &RoomId, reason: impl Into<String>) -> Self {
        Self {
            room: room.clone(),
            reason: reason.into(),
        }
    }
}

/// Failure classes a read can surface
///
/// `Transient` and `Desync` are recoverable by the resync controller;
/// `Ended` is terminal (room closed or banned) and propagates to the
/// session as a user-visible event. Backends only ever report `Ended` and
/// `Transient`; `Desync` is raised by `StreamConnection` itself.
#[derive(Debug, Clone, Error)]
pub enum StreamFault {
    #[error("stream ended")]
    Ended,

    #[error("transient stream error: {0}")]
    Transient(String),

    #[error("timestamp discontinuity of {0:?}")]
    Desync(std::time::Duration),
}
