//! Multi-room live-stream wall engine
//!
//! Ingests several live streams at once, keeps each one's audio and video
//! paired, places every room in a grid cell, and mixes all audio into one
//! spatial soundstage. The embedder drives `GridSessionManager::tick` at
//! its own cadence and renders the returned frames however it likes; the
//! demo binary just plays the mixed audio.

pub mod config;
pub mod mixer;
pub mod output;
pub mod pipeline;
pub mod resync;
pub mod session;
pub mod source;

pub use config::EngineConfig;
pub use mixer::{MixerConfig, Position, SpatialMixer, VoiceState};
pub use pipeline::decode::{DecodeConfig, DecodePipeline};
pub use pipeline::health::SourceStats;
pub use pipeline::types::{SampleBlock, Timestamp, VideoFrame};
pub use resync::{ResyncConfig, SourceHealth};
pub use session::{
    CellStatus, GridCell, GridSessionManager, PlacedRoom, SessionConfig, SessionError, TickOutput,
};
pub use source::{BackendRegistry, Room, RoomId, SourceId, StreamConnection};
