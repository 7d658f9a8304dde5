//! Scripted in-memory backend
//!
//! Deterministic packet source used by the engine tests and available to
//! embedders for dry runs: each `open` consumes the next `Script`, whose
//! items replay packets, transient faults, pacing delays, stalls, and
//! stream end.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::pipeline::codec::{MediaDecoder, RawCodec, raw_audio_packet, raw_video_packet};
use crate::pipeline::types::{Packet, Timestamp};

use super::backend::{BackendSession, SourceBackend};
use super::{ConnectError, Room, StreamFault};

/// One step of a scripted session
pub enum ScriptItem {
    /// Deliver this packet
    Packet(Packet),
    /// Surface a transient fault, then continue with the next item
    Fault(String),
    /// Sleep before the next item (pacing)
    Delay(Duration),
    /// Stall: never deliver anything again (until the worker is cancelled)
    Hang,
    /// Clean end of stream
    End,
}

/// A replayable session script
pub struct Script {
    items: VecDeque<ScriptItem>,
}

impl Script {
    pub fn from_items(items: Vec<ScriptItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// A paired audio+video stream: `ticks` blocks of `block_ms`, with one
    /// tiny video frame per block, then a stall
    pub fn av_stream(ticks: usize, block_ms: u64, sample_rate: u32) -> Self {
        let mut items = Vec::with_capacity(ticks * 2 + 1);
        let frames = (sample_rate as u64 * block_ms / 1_000) as usize;
        let planes = vec![128u8; 4 * 2 + 2 * 1 * 2]; // 4x2 YUV420p
        for i in 0..ticks {
            let pts = Timestamp::from_micros((i as u64 * block_ms * 1_000) as i64);
            items.push(ScriptItem::Packet(raw_video_packet(4, 2, &planes, pts, i == 0)));
            items.push(ScriptItem::Packet(raw_audio_packet(
                sample_rate,
                1,
                &vec![0.5f32; frames],
                pts,
            )));
        }
        items.push(ScriptItem::Hang);
        Self::from_items(items)
    }
}

/// Backend replaying a queue of scripts, one per `open`
///
/// When the queue is exhausted further opens fail, which is how tests
/// exercise the reconnect attempt budget.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    /// Number of opens to fail before handing out scripts
    fail_opens: AtomicU32,
    opens: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fail_opens: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` opens with a ConnectError
    pub fn with_fail_opens(self, n: u32) -> Self {
        self.fail_opens.store(n, Ordering::Relaxed);
        self
    }

    /// Total `open` calls observed (successful or not)
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceBackend for ScriptedBackend {
    async fn open(&self, room: &Room) -> Result<Box<dyn BackendSession>, ConnectError> {
        self.opens.fetch_add(1, Ordering::Relaxed);

        let failures_left = self.fail_opens.load(Ordering::Relaxed);
        if failures_left > 0 {
            self.fail_opens.store(failures_left - 1, Ordering::Relaxed);
            return Err(ConnectError::new(&room.id, "scripted connect failure"));
        }

        let script = self
            .scripts
            .lock()
            .expect("script queue poisoned")
            .pop_front()
            .ok_or_else(|| ConnectError::new(&room.id, "no scripts left"))?;

        Ok(Box::new(ScriptedSession { script }))
    }

    fn new_decoder(&self) -> Box<dyn MediaDecoder> {
        Box::new(RawCodec::new())
    }
}

struct ScriptedSession {
    script: Script,
}

#[async_trait]
impl BackendSession for ScriptedSession {
    async fn read(&mut self) -> Result<Packet, StreamFault> {
        loop {
            match self.script.items.pop_front() {
                Some(ScriptItem::Packet(packet)) => return Ok(packet),
                Some(ScriptItem::Fault(reason)) => return Err(StreamFault::Transient(reason)),
                Some(ScriptItem::Delay(d)) => {
                    tokio::time::sleep(d).await;
                }
                Some(ScriptItem::Hang) => {
                    self.script.items.push_front(ScriptItem::Hang);
                    // Parked until the owning worker is cancelled
                    std::future::pending::<()>().await;
                }
                Some(ScriptItem::End) | None => return Err(StreamFault::Ended),
            }
        }
    }

    async fn close(&mut self) {
        self.script.items.clear();
    }
}
