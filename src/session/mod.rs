//! Grid session manager
//!
//! Owns every source on the wall: creates a worker task per room,
//! maintains the cell layout, and assembles the per-tick presentation
//! output (latest frame per cell, one mixed audio block, health and stats
//! per cell). All methods are synchronous and non-blocking; connection
//! and decode I/O happens only inside the worker tasks.

pub mod grid;
pub mod worker;

pub use grid::{GridCell, GridMap, SessionError};
pub use worker::WorkerConfig;

use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::mixer::{MixerConfig, Position, SpatialMixer};
use crate::pipeline::health::SourceStats;
use crate::pipeline::types::{SampleBlock, VideoFrame};
use crate::resync::SourceHealth;
use crate::source::{BackendRegistry, Room, RoomId, SourceId};

use worker::WorkerHandle;

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rows: u32,
    pub cols: u32,
    pub worker: WorkerConfig,
    pub mixer: MixerConfig,
    /// How long a cancelled worker may take to finish before it is
    /// abandoned and only logged
    pub join_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rows: 2,
            cols: 2,
            worker: WorkerConfig::default(),
            mixer: MixerConfig::default(),
            join_grace: Duration::from_secs(2),
        }
    }
}

/// One occupied cell with its control state, for layout persistence
#[derive(Debug, Clone)]
pub struct PlacedRoom {
    pub room: Room,
    pub cell: GridCell,
    pub position: Position,
    pub volume: f32,
    pub enabled: bool,
    pub muted: bool,
}

/// Presentation state of one occupied cell
#[derive(Debug, Clone)]
pub struct CellStatus {
    pub room: RoomId,
    pub display_name: String,
    pub health: SourceHealth,
    pub stats: SourceStats,
}

/// Output of one presentation tick
///
/// Both maps carry an entry for every mapped cell: a cell whose source
/// produced nothing this tick is present with `None` / its last health,
/// never silently absent.
pub struct TickOutput {
    pub frames: HashMap<GridCell, Option<VideoFrame>>,
    pub mixed: SampleBlock,
    pub cells: HashMap<GridCell, CellStatus>,
}

struct Inner {
    map: GridMap,
    sources: HashMap<SourceId, WorkerHandle>,
}

/// The wall: layout plus one worker per source
///
/// Sole owner of sources; nothing outside this type spawns or stops
/// workers. Must live inside a tokio runtime.
pub struct GridSessionManager {
    registry: BackendRegistry,
    worker_config: WorkerConfig,
    join_grace: Duration,
    inner: Mutex<Inner>,
    mixer: Mutex<SpatialMixer>,
    next_id: AtomicU64,
}

impl GridSessionManager {
    pub fn new(config: SessionConfig, registry: BackendRegistry) -> Self {
        Self {
            registry,
            worker_config: config.worker,
            join_grace: config.join_grace,
            inner: Mutex::new(Inner {
                map: GridMap::new(config.rows, config.cols),
                sources: HashMap::new(),
            }),
            mixer: Mutex::new(SpatialMixer::new(config.mixer)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Put a room on the wall, in `cell` or the first free cell
    pub fn add_room(&self, room: Room, cell: Option<GridCell>) -> Result<SourceId, SessionError> {
        let mut inner = self.lock_inner();

        if inner.sources.values().any(|h| h.room.id == room.id) {
            return Err(SessionError::DuplicateRoom(room.id));
        }
        let backend = self
            .registry
            .get(&room.backend)
            .ok_or_else(|| SessionError::UnknownBackend(room.backend.clone()))?;
        let cell = match cell {
            Some(cell) => cell,
            None => inner.map.first_free().ok_or(SessionError::GridFull)?,
        };

        let id = SourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        inner.map.assign(cell, id)?;

        info!("{id}: room {} placed at {cell}", room.id);
        let handle = worker::spawn(id, room, backend, self.worker_config.clone());
        inner.sources.insert(id, handle);
        self.mixer.lock().expect("mixer lock poisoned").add_source(id);

        Ok(id)
    }

    /// Take a source off the wall and stop its worker
    pub fn remove_room(&self, id: SourceId) -> Result<(), SessionError> {
        let handle = {
            let mut inner = self.lock_inner();
            let handle = inner
                .sources
                .remove(&id)
                .ok_or(SessionError::UnknownSource(id))?;
            inner.map.unassign(id);
            handle
        };
        self.mixer.lock().expect("mixer lock poisoned").remove_source(id);
        self.retire(handle);
        Ok(())
    }

    /// Change the grid dimensions. Shrinking removes exactly the sources
    /// whose cell falls outside the new bounds; their ids are returned.
    pub fn resize(&self, rows: u32, cols: u32) -> Result<Vec<SourceId>, SessionError> {
        let (evicted, handles) = {
            let mut inner = self.lock_inner();
            let evicted = inner.map.resize(rows, cols)?;
            let handles: Vec<WorkerHandle> = evicted
                .iter()
                .filter_map(|id| inner.sources.remove(id))
                .collect();
            (evicted, handles)
        };

        let mut mixer = self.mixer.lock().expect("mixer lock poisoned");
        for id in &evicted {
            mixer.remove_source(*id);
        }
        drop(mixer);

        for handle in handles {
            info!("{}: evicted by resize to {rows}x{cols}", handle.id);
            self.retire(handle);
        }
        Ok(evicted)
    }

    /// Move a source to a free cell
    pub fn move_to_cell(&self, id: SourceId, cell: GridCell) -> Result<(), SessionError> {
        self.lock_inner().map.move_to(id, cell)
    }

    /// Operator-triggered resync: flush and reconnect, from any state
    pub fn trigger_resync(&self, id: SourceId) -> Result<(), SessionError> {
        let inner = self.lock_inner();
        let handle = inner.sources.get(&id).ok_or(SessionError::UnknownSource(id))?;
        // A second trigger while one is pending is a no-op
        let _ = handle.resync_tx.try_send(());
        Ok(())
    }

    /// Place a source in the listening space
    pub fn set_position(&self, id: SourceId, position: Position) -> Result<(), SessionError> {
        self.check_source(id)?;
        self.mixer
            .lock()
            .expect("mixer lock poisoned")
            .set_position(id, position);
        Ok(())
    }

    /// Enable or disable a source's audio contribution; disabling also
    /// skips its audio decode work
    pub fn set_enabled(&self, id: SourceId, enabled: bool) -> Result<(), SessionError> {
        {
            let inner = self.lock_inner();
            let handle = inner.sources.get(&id).ok_or(SessionError::UnknownSource(id))?;
            handle.enabled.store(enabled, Ordering::Relaxed);
        }
        self.mixer
            .lock()
            .expect("mixer lock poisoned")
            .set_enabled(id, enabled);
        Ok(())
    }

    pub fn set_volume(&self, id: SourceId, volume: f32) -> Result<(), SessionError> {
        self.check_source(id)?;
        self.mixer
            .lock()
            .expect("mixer lock poisoned")
            .set_volume(id, volume);
        Ok(())
    }

    pub fn set_muted(&self, id: SourceId, muted: bool) -> Result<(), SessionError> {
        self.check_source(id)?;
        self.mixer
            .lock()
            .expect("mixer lock poisoned")
            .set_muted(id, muted);
        Ok(())
    }

    /// Solo one source (or clear); overrides all other contributions at
    /// mix time without touching their decode throttling
    pub fn set_solo(&self, id: Option<SourceId>) -> Result<(), SessionError> {
        if let Some(id) = id {
            self.check_source(id)?;
        }
        self.mixer.lock().expect("mixer lock poisoned").set_solo(id);
        Ok(())
    }

    pub fn set_display_name(&self, id: SourceId, name: impl Into<String>) -> Result<(), SessionError> {
        let mut inner = self.lock_inner();
        let handle = inner
            .sources
            .get_mut(&id)
            .ok_or(SessionError::UnknownSource(id))?;
        handle.room.display_name = name.into();
        Ok(())
    }

    /// One presentation tick: drain every source's hand-off queues and mix.
    ///
    /// Non-blocking; a stalled or resyncing source contributes an empty
    /// frame slot and silence but never delays the tick.
    pub fn tick(&self) -> TickOutput {
        let mut frames = HashMap::new();
        let mut cells = HashMap::new();
        let mut audio_inputs = Vec::new();

        {
            let inner = self.lock_inner();
            for (cell, id) in inner.map.iter() {
                let Some(handle) = inner.sources.get(&id) else {
                    continue;
                };
                frames.insert(cell, handle.video.take_latest());
                if let Some(block) = handle.audio.pop() {
                    audio_inputs.push((id, block));
                }
                cells.insert(
                    cell,
                    CellStatus {
                        room: handle.room.id.clone(),
                        display_name: handle.room.display_name.clone(),
                        health: *handle.health_rx.borrow(),
                        stats: handle.stats.summary(),
                    },
                );
            }
        }

        let mixed = self
            .mixer
            .lock()
            .expect("mixer lock poisoned")
            .mix(&audio_inputs);

        TickOutput { frames, mixed, cells }
    }

    pub fn dims(&self) -> (u32, u32) {
        self.lock_inner().map.dims()
    }

    pub fn cell_of(&self, id: SourceId) -> Option<GridCell> {
        self.lock_inner().map.cell_of(id)
    }

    pub fn source_count(&self) -> usize {
        self.lock_inner().sources.len()
    }

    /// Current layout with each room's control state, for saving to a
    /// config file
    pub fn layout(&self) -> Vec<PlacedRoom> {
        let placements: Vec<(Room, GridCell, SourceId)> = {
            let inner = self.lock_inner();
            inner
                .map
                .iter()
                .filter_map(|(cell, id)| {
                    inner.sources.get(&id).map(|h| (h.room.clone(), cell, id))
                })
                .collect()
        };
        let mixer = self.mixer.lock().expect("mixer lock poisoned");
        let mut layout: Vec<PlacedRoom> = placements
            .into_iter()
            .map(|(room, cell, id)| {
                let state = mixer.voice_state(id).unwrap_or_default();
                PlacedRoom {
                    room,
                    cell,
                    position: state.position,
                    volume: state.volume,
                    enabled: state.enabled,
                    muted: state.muted,
                }
            })
            .collect();
        layout.sort_by_key(|placed| placed.cell);
        layout
    }

    /// Stop every source (shutdown)
    pub fn clear(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut inner = self.lock_inner();
            let ids: Vec<SourceId> = inner.sources.keys().copied().collect();
            ids.iter()
                .filter_map(|id| {
                    inner.map.unassign(*id);
                    inner.sources.remove(id)
                })
                .collect()
        };
        let mut mixer = self.mixer.lock().expect("mixer lock poisoned");
        for handle in &handles {
            mixer.remove_source(handle.id);
        }
        drop(mixer);
        for handle in handles {
            self.retire(handle);
        }
    }

    fn check_source(&self, id: SourceId) -> Result<(), SessionError> {
        if self.lock_inner().sources.contains_key(&id) {
            Ok(())
        } else {
            Err(SessionError::UnknownSource(id))
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session state poisoned")
    }

    /// Cancel a worker and wait for it off to the side; a hung worker is
    /// abandoned after the grace period, never blocking the manager
    fn retire(&self, handle: WorkerHandle) {
        handle.cancel.cancel();
        let grace = self.join_grace;
        let id = handle.id;
        tokio::spawn(async move {
            if tokio::time::timeout(grace, handle.join).await.is_err() {
                warn!("{id}: worker did not stop within {grace:?}, abandoning");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::scripted::{Script, ScriptItem, ScriptedBackend};
    use std::sync::Arc;

    fn hang_script() -> Script {
        Script::from_items(vec![ScriptItem::Hang])
    }

    fn manager_with(scripts: Vec<Script>) -> GridSessionManager {
        let mut registry = BackendRegistry::new();
        registry.register("scripted", Arc::new(ScriptedBackend::new(scripts)));
        GridSessionManager::new(SessionConfig::default(), registry)
    }

    fn room(n: u32) -> Room {
        Room::new(format!("room-{n}"), format!("Room {n}"), "scripted")
    }

    #[tokio::test]
    async fn test_add_fills_cells_row_major() {
        let m = manager_with(vec![hang_script(), hang_script()]);

        let a = m.add_room(room(1), None).unwrap();
        let b = m.add_room(room(2), None).unwrap();
        assert_eq!(m.cell_of(a), Some(GridCell::new(0, 0)));
        assert_eq!(m.cell_of(b), Some(GridCell::new(0, 1)));

        m.clear();
    }

    #[tokio::test]
    async fn test_duplicate_room_rejected() {
        let m = manager_with(vec![hang_script(), hang_script()]);
        m.add_room(room(1), None).unwrap();

        assert!(matches!(
            m.add_room(room(1), None),
            Err(SessionError::DuplicateRoom(_))
        ));
        m.clear();
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let m = manager_with(vec![]);
        let bad = Room::new("r", "R", "no-such-backend");
        assert!(matches!(
            m.add_room(bad, None),
            Err(SessionError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_occupied_cell_rejected() {
        let m = manager_with(vec![hang_script(), hang_script()]);
        m.add_room(room(1), Some(GridCell::new(0, 0))).unwrap();

        assert!(matches!(
            m.add_room(room(2), Some(GridCell::new(0, 0))),
            Err(SessionError::OccupiedCell(_))
        ));
        m.clear();
    }

    #[tokio::test]
    async fn test_tick_covers_every_mapped_cell() {
        let m = manager_with(vec![hang_script(), hang_script()]);
        m.add_room(room(1), None).unwrap();
        m.add_room(room(2), None).unwrap();

        let out = m.tick();
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.cells.len(), 2);
        assert_eq!(out.mixed.channels, 2);
        // Idle sources are present, just empty
        assert!(out.frames.values().all(|f| f.is_none()));

        m.clear();
    }

    #[tokio::test]
    async fn test_remove_room_releases_source() {
        let m = manager_with(vec![hang_script()]);
        let id = m.add_room(room(1), None).unwrap();
        assert_eq!(m.source_count(), 1);

        m.remove_room(id).unwrap();
        assert_eq!(m.source_count(), 0);
        assert!(m.cell_of(id).is_none());
        assert!(matches!(
            m.remove_room(id),
            Err(SessionError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_shrink_evicts_out_of_bounds_sources() {
        let m = manager_with(vec![hang_script(), hang_script(), hang_script(), hang_script()]);
        let ids: Vec<SourceId> = (1..=4).map(|n| m.add_room(room(n), None).unwrap()).collect();

        let evicted = m.resize(1, 1).unwrap();
        assert_eq!(evicted, vec![ids[1], ids[2], ids[3]]);
        assert_eq!(m.source_count(), 1);
        assert_eq!(m.cell_of(ids[0]), Some(GridCell::new(0, 0)));

        // Evicted sources are fully gone
        assert!(matches!(
            m.trigger_resync(ids[1]),
            Err(SessionError::UnknownSource(_))
        ));
        m.clear();
    }

    #[tokio::test]
    async fn test_layout_reports_control_state() {
        let m = manager_with(vec![hang_script()]);
        let id = m.add_room(room(1), Some(GridCell::new(0, 1))).unwrap();
        m.set_position(id, Position::new(-1.0, 0.0, 1.0)).unwrap();
        m.set_volume(id, 0.3).unwrap();
        m.set_enabled(id, false).unwrap();

        let layout = m.layout();
        assert_eq!(layout.len(), 1);
        let placed = &layout[0];
        assert_eq!(placed.cell, GridCell::new(0, 1));
        assert_eq!(placed.position.x, -1.0);
        assert_eq!(placed.volume, 0.3);
        assert!(!placed.enabled);
        assert!(!placed.muted);

        m.clear();
    }

    #[tokio::test]
    async fn test_control_ops_require_known_source() {
        let m = manager_with(vec![]);
        let ghost = SourceId(99);
        assert!(m.set_position(ghost, Position::default()).is_err());
        assert!(m.set_enabled(ghost, false).is_err());
        assert!(m.set_volume(ghost, 0.5).is_err());
        assert!(m.set_solo(Some(ghost)).is_err());
        assert!(m.set_solo(None).is_ok());
    }
}
