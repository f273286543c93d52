//! Snapshot producers.
//!
//! A producer yields encoded snapshots (and, for demos, recorded messages)
//! for a session to apply. The live network path and demo playback are the
//! two implementations; both go through the same store build/commit path.

use std::collections::VecDeque;
use std::time::Instant;

use engine_shared::net::Packet;

/// One unit of producer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced {
    /// Encoded items for `tick`; empty `data` means no items.
    Snapshot { tick: i32, data: Vec<u8> },
    /// A recorded game message.
    Message(Packet),
}

pub trait SnapshotProducer {
    /// Next output due at `now`, or `None` if nothing is due this frame.
    fn poll_next(&mut self, now: Instant) -> Option<Produced>;

    /// No more output will ever be produced.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Snapshots received from the network, in arrival order.
#[derive(Debug, Default)]
pub struct NetSnapshotQueue {
    pending: VecDeque<Produced>,
}

impl NetSnapshotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tick: i32, data: Vec<u8>) {
        self.pending.push_back(Produced::Snapshot { tick, data });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl SnapshotProducer for NetSnapshotQueue {
    fn poll_next(&mut self, _now: Instant) -> Option<Produced> {
        self.pending.pop_front()
    }
}
