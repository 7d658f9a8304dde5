//! Engine configuration
//!
//! Wall layout (grid dimensions, rooms, their cells and positions) plus
//! timing tunables, serialized as JSON. The demo binary loads one of
//! these at startup; `capture` turns a running wall back into a config
//! for saving.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::mixer::{MixerConfig, Position};
use crate::pipeline::decode::DecodeConfig;
use crate::resync::ResyncConfig;
use crate::session::worker::WorkerConfig;
use crate::session::{GridCell, GridSessionManager, SessionConfig};
use crate::source::Room;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub rows: u32,
    pub cols: u32,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
    #[serde(default)]
    pub tuning: Tuning,
}

/// One room on the wall
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEntry {
    pub room: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub backend: String,
    /// Fixed cell; omitted means first free cell at load time
    #[serde(default)]
    pub cell: Option<GridCell>,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

impl RoomEntry {
    pub fn to_room(&self) -> Room {
        Room::new(
            self.room.clone(),
            self.display_name.clone().unwrap_or_else(|| self.room.clone()),
            self.backend.clone(),
        )
    }
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

/// Timing tunables, all optional in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Presentation tick interval
    pub tick_ms: u64,
    /// A/V pairing tolerance inside each source's pipeline
    pub sync_window_ms: u64,
    /// Timestamp discontinuity treated as a protocol desync
    pub desync_threshold_ms: u64,
    /// Dwell in Degraded before recovery starts
    pub confirmation_window_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub sample_rate: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            sync_window_ms: 40,
            desync_threshold_ms: 5_000,
            confirmation_window_ms: 500,
            max_reconnect_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            sample_rate: 48_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("writing config {}", path.display()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tuning.tick_ms.max(1))
    }

    /// Session manager configuration derived from this file
    pub fn session_config(&self) -> SessionConfig {
        let t = &self.tuning;
        let block_frames = (t.sample_rate as u64 * t.tick_ms.max(1) / 1_000).max(1) as usize;
        SessionConfig {
            rows: self.rows,
            cols: self.cols,
            worker: WorkerConfig {
                decode: DecodeConfig {
                    sync_window: Duration::from_millis(t.sync_window_ms),
                    ..Default::default()
                },
                resync: ResyncConfig {
                    confirmation_window: Duration::from_millis(t.confirmation_window_ms),
                    max_attempts: t.max_reconnect_attempts,
                    backoff_base: Duration::from_millis(t.backoff_base_ms),
                    backoff_cap: Duration::from_millis(t.backoff_cap_ms),
                    ..Default::default()
                },
                desync_threshold: Duration::from_millis(t.desync_threshold_ms),
                ..Default::default()
            },
            mixer: MixerConfig {
                sample_rate: t.sample_rate,
                block_frames,
            },
            ..Default::default()
        }
    }

    /// Snapshot a running wall's layout, including each room's position,
    /// volume, and enabled state, preserving this file's tunables
    pub fn capture(&self, manager: &GridSessionManager) -> Self {
        let (rows, cols) = manager.dims();
        let rooms = manager
            .layout()
            .into_iter()
            .map(|placed| RoomEntry {
                room: placed.room.id.0.clone(),
                display_name: Some(placed.room.display_name),
                backend: placed.room.backend,
                cell: Some(placed.cell),
                position: placed.position,
                enabled: placed.enabled,
                muted: placed.muted,
                volume: placed.volume,
            })
            .collect();
        Self {
            rows,
            cols,
            rooms,
            tuning: self.tuning.clone(),
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "rows": 2,
                "cols": 3,
                "rooms": [{"room": "r1", "backend": "synth"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.tuning.tick_ms, 20);
        assert_eq!(config.tuning.max_reconnect_attempts, 5);
        let entry = &config.rooms[0];
        assert!(entry.enabled);
        assert_eq!(entry.volume, 1.0);
        assert!(entry.cell.is_none());
        assert_eq!(entry.to_room().display_name, "r1");
    }

    #[test]
    fn test_session_config_mapping() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "rows": 1,
                "cols": 1,
                "tuning": {"tick_ms": 10, "sample_rate": 24000, "sync_window_ms": 25}
            }"#,
        )
        .unwrap();

        let session = config.session_config();
        assert_eq!(session.mixer.block_frames, 240);
        assert_eq!(session.worker.decode.sync_window, Duration::from_millis(25));
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_capture_preserves_room_control_state() {
        use crate::source::scripted::{Script, ScriptItem, ScriptedBackend};
        use crate::source::BackendRegistry;
        use std::sync::Arc;

        let mut registry = BackendRegistry::new();
        registry.register(
            "scripted",
            Arc::new(ScriptedBackend::new(vec![Script::from_items(vec![ScriptItem::Hang])])),
        );
        let manager = GridSessionManager::new(SessionConfig::default(), registry);

        let id = manager
            .add_room(Room::new("r1", "Room 1", "scripted"), Some(GridCell::new(1, 0)))
            .unwrap();
        manager.set_position(id, Position::new(-1.0, 0.0, 1.0)).unwrap();
        manager.set_volume(id, 0.4).unwrap();
        manager.set_enabled(id, false).unwrap();

        let config: EngineConfig =
            serde_json::from_str(r#"{"rows": 2, "cols": 2}"#).unwrap();
        let captured = config.capture(&manager);

        let entry = &captured.rooms[0];
        assert_eq!(entry.cell, Some(GridCell::new(1, 0)));
        assert_eq!(entry.position.x, -1.0);
        assert_eq!(entry.volume, 0.4);
        assert!(!entry.enabled);
        assert!(!entry.muted);

        manager.clear();
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir().join("streamwall-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config-roundtrip.json");

        let config: EngineConfig = serde_json::from_str(
            r#"{
                "rows": 2,
                "cols": 2,
                "rooms": [{"room": "r1", "backend": "synth",
                           "cell": {"row": 1, "col": 0},
                           "position": {"x": -1.0, "y": 0.0, "z": 1.0}}]
            }"#,
        )
        .unwrap();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.rows, 2);
        assert_eq!(loaded.rooms[0].cell, Some(GridCell::new(1, 0)));
        assert_eq!(loaded.rooms[0].position.x, -1.0);
    }
}
