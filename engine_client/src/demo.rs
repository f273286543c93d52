//! Demo recording and playback.
//!
//! A demo is a sequence of length-prefixed JSON frames: a header, then
//! snapshots and game messages in tick order. Recording taps the main
//! session's tick boundary through [`DemoSink`]; playback is a
//! [`SnapshotProducer`] that replaces the network for the main session.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::{Buf, BufMut, BytesMut};
use engine_shared::{
    error::{ClientError, ClientResult},
    net::{MapDescriptor, MsgFlags, Packet, NET_VERSION},
    snapshot::{encode_items, SnapshotBuffer, StaticSizeTable},
};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::producer::{Produced, SnapshotProducer};

/// Demo format version.
pub const DEMO_VERSION: u32 = 1;

/// Largest frame accepted when reading a demo.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One demo record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DemoFrame {
    Header {
        version: u32,
        net_version: String,
        map: Option<MapDescriptor>,
        tick_hz: u32,
        /// RFC 3339 creation time.
        created: String,
    },
    Snapshot {
        tick: i32,
        data: Vec<u8>,
    },
    Message {
        tick: i32,
        msg_id: u16,
        system: bool,
        data: Vec<u8>,
    },
}

impl DemoFrame {
    /// Header stamped with the current local time.
    pub fn header(map: Option<MapDescriptor>, tick_hz: u32) -> Self {
        DemoFrame::Header {
            version: DEMO_VERSION,
            net_version: NET_VERSION.to_string(),
            map,
            tick_hz,
            created: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn tick(&self) -> Option<i32> {
        match self {
            DemoFrame::Header { .. } => None,
            DemoFrame::Snapshot { tick, .. } | DemoFrame::Message { tick, .. } => Some(*tick),
        }
    }
}

/// `u32` big-endian length, then the JSON frame.
pub fn encode_frame(frame: &DemoFrame) -> ClientResult<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    let mut out = BytesMut::with_capacity(4 + json.len());
    out.put_u32(json.len() as u32);
    out.extend_from_slice(&json);
    Ok(out.to_vec())
}

pub fn decode_frames(mut data: &[u8]) -> ClientResult<Vec<DemoFrame>> {
    let mut frames = Vec::new();
    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(ClientError::protocol("truncated demo frame length"));
        }
        let len = data.get_u32() as usize;
        if len > MAX_FRAME_SIZE || len > data.remaining() {
            return Err(ClientError::protocol(format!("bad demo frame length {len}")));
        }
        let (frame, rest) = data.split_at(len);
        frames.push(serde_json::from_slice(frame)?);
        data = rest;
    }
    Ok(frames)
}

/// `<dir>/<name>[_<timestamp>].demo`
pub fn demo_path(dir: &Path, name: &str, with_timestamp: bool) -> PathBuf {
    let file = if with_timestamp {
        format!(
            "{}_{}.demo",
            name,
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        )
    } else {
        format!("{name}.demo")
    };
    dir.join(file)
}

/// Background work still writing a stopped recording. Resolves to the
/// number of frames written.
pub type DemoFlush = JoinHandle<anyhow::Result<u64>>;

/// Receives the recorded stream. Writes must not block the caller.
pub trait DemoSink {
    fn write_frame(&mut self, frame: DemoFrame);

    /// Records a finished snapshot buffer. Every item carries its length,
    /// so playback does not depend on the recording session's static sizes.
    fn record_snapshot(&mut self, tick: i32, snapshot: &SnapshotBuffer) {
        let mut data = BytesMut::new();
        encode_items(snapshot, &StaticSizeTable::new(), &mut data);
        self.write_frame(DemoFrame::Snapshot {
            tick,
            data: data.to_vec(),
        });
    }

    /// Records a message when `persist` is set.
    fn record_message(&mut self, tick: i32, packet: &Packet, persist: bool) {
        if !persist {
            return;
        }
        self.write_frame(DemoFrame::Message {
            tick,
            msg_id: packet.msg_id,
            system: packet.system,
            data: packet.payload.to_vec(),
        });
    }

    /// No more frames follow. Sinks that write in the background hand back
    /// the task so the owner can wait for it before shutting down.
    fn finish(&mut self) -> Option<DemoFlush> {
        None
    }
}

/// Collects frames in memory. Clones share the same frame list.
#[derive(Debug, Clone, Default)]
pub struct MemoryDemo {
    frames: Arc<Mutex<Vec<DemoFrame>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemoryDemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<DemoFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.lock().map(|f| *f).unwrap_or(false)
    }
}

impl DemoSink for MemoryDemo {
    fn write_frame(&mut self, frame: DemoFrame) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
    }

    fn finish(&mut self) -> Option<DemoFlush> {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = true;
        }
        None
    }
}

/// Appends frames to a file from a background task.
pub struct DemoWriter {
    path: PathBuf,
    tx: Option<mpsc::UnboundedSender<DemoFrame>>,
    task: Option<DemoFlush>,
}

impl DemoWriter {
    /// Spawns the writer task on the current tokio runtime.
    pub fn create(path: PathBuf) -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .context("demo recording needs a tokio runtime")?;
        let (tx, mut rx) = mpsc::unbounded_channel::<DemoFrame>();

        let task_path = path.clone();
        let task = handle.spawn(async move {
            if let Some(parent) = task_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let mut file = tokio::fs::File::create(&task_path)
                .await
                .with_context(|| format!("create demo {}", task_path.display()))?;
            let mut written = 0u64;
            while let Some(frame) = rx.recv().await {
                let bytes = encode_frame(&frame)?;
                file.write_all(&bytes).await.context("write demo frame")?;
                written += 1;
            }
            file.flush().await.context("flush demo")?;
            info!(path = %task_path.display(), frames = written, "Demo file closed");
            Ok(written)
        });

        info!(path = %path.display(), "Recording demo");
        Ok(Self {
            path,
            tx: Some(tx),
            task: Some(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting frames and waits for the file to be flushed.
    /// Returns the number of frames written.
    pub async fn close(mut self) -> anyhow::Result<u64> {
        match self.finish() {
            Some(task) => task.await.context("demo writer task")?,
            None => Ok(0),
        }
    }
}

impl DemoSink for DemoWriter {
    fn write_frame(&mut self, frame: DemoFrame) {
        if let Some(tx) = &self.tx {
            if tx.send(frame).is_err() {
                warn!(path = %self.path.display(), "Demo writer stopped; dropping frame");
                self.tx = None;
            }
        }
    }

    fn finish(&mut self) -> Option<DemoFlush> {
        self.tx.take();
        self.task.take()
    }
}

/// Plays a recorded demo back at the recorded tick rate.
#[derive(Debug)]
pub struct DemoPlayer {
    map: Option<MapDescriptor>,
    tick_hz: u32,
    frames: VecDeque<DemoFrame>,
    total: usize,
    tick_duration: Duration,
    first_tick: Option<i32>,
    /// Demo time played so far.
    position: Duration,
    last_update: Option<Instant>,
    paused: bool,
    speed: f32,
}

impl DemoPlayer {
    /// The first frame must be a header.
    pub fn from_frames(frames: Vec<DemoFrame>) -> ClientResult<Self> {
        let mut frames = VecDeque::from(frames);
        let (map, tick_hz) = match frames.pop_front() {
            Some(DemoFrame::Header {
                version,
                map,
                tick_hz,
                ..
            }) => {
                if version != DEMO_VERSION {
                    return Err(ClientError::protocol(format!(
                        "demo version {version} not supported"
                    )));
                }
                (map, tick_hz.max(1))
            }
            _ => return Err(ClientError::protocol("demo has no header")),
        };
        Ok(Self {
            map,
            tick_hz,
            total: frames.len(),
            frames,
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(tick_hz)),
            first_tick: None,
            position: Duration::ZERO,
            last_update: None,
            paused: false,
            speed: 1.0,
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read demo {}", path.display()))?;
        let frames =
            decode_frames(&data).with_context(|| format!("parse demo {}", path.display()))?;
        Ok(Self::from_frames(frames)?)
    }

    pub fn map(&self) -> Option<&MapDescriptor> {
        self.map.as_ref()
    }

    pub fn tick_hz(&self) -> u32 {
        self.tick_hz
    }

    /// Frames left to play.
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Playback speed multiplier; non-positive values are ignored.
    pub fn set_speed(&mut self, speed: f32) {
        if speed > 0.0 && speed.is_finite() {
            self.speed = speed;
        }
    }

    fn advance(&mut self, now: Instant) {
        if let Some(last) = self.last_update {
            if !self.paused {
                let dt = now.saturating_duration_since(last);
                self.position += dt.mul_f64(f64::from(self.speed));
            }
        }
        self.last_update = Some(now);
    }

    fn is_due(&mut self, tick: i32) -> bool {
        let first = *self.first_tick.get_or_insert(tick);
        let offset = (i64::from(tick) - i64::from(first)).max(0);
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        self.tick_duration.saturating_mul(offset) <= self.position
    }
}

impl SnapshotProducer for DemoPlayer {
    fn poll_next(&mut self, now: Instant) -> Option<Produced> {
        self.advance(now);
        loop {
            let tick = match self.frames.front()?.tick() {
                Some(tick) => tick,
                None => {
                    self.frames.pop_front();
                    continue;
                }
            };
            if !self.is_due(tick) {
                return None;
            }
            return match self.frames.pop_front()? {
                DemoFrame::Snapshot { tick, data } => Some(Produced::Snapshot { tick, data }),
                DemoFrame::Message {
                    msg_id,
                    system,
                    data,
                    ..
                } => Some(Produced::Message(Packet::new(
                    system,
                    msg_id,
                    MsgFlags::empty(),
                    data.into(),
                ))),
                DemoFrame::Header { .. } => None,
            };
        }
    }

    fn is_finished(&self) -> bool {
        self.frames.is_empty()
    }
}
