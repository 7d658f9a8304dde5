//! Backend plugin contract
//!
//! A backend owns the platform-specific protocol negotiation for one kind
//! of upstream (scripted, file log, a real live platform); everything past
//! `open` is opaque to the engine beyond the packet stream.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::codec::MediaDecoder;
use crate::pipeline::types::Packet;

use super::{ConnectError, Room, StreamFault};

/// Factory for sessions to rooms of one backend kind
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Establish a session to the given room
    async fn open(&self, room: &Room) -> Result<Box<dyn BackendSession>, ConnectError>;

    /// Decoder matching the packet encoding this backend produces
    fn new_decoder(&self) -> Box<dyn MediaDecoder>;
}

/// One established network session to one room
#[async_trait]
pub trait BackendSession: Send {
    /// Read the next demuxed elementary packet.
    ///
    /// This is the engine's only suspension point per source; it must be
    /// cancel-safe (the worker selects on it together with shutdown).
    async fn read(&mut self) -> Result<Packet, StreamFault>;

    /// Tear the session down
    async fn close(&mut self);
}

/// Registry of backends by name, shared by the session manager
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn SourceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn SourceBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceBackend>> {
        self.backends.get(name).cloned()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
