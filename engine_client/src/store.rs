//! Double-buffered snapshot store.
//!
//! Each session owns three buffers: `current`, `prev` and `building`. A
//! producer fills `building` through `begin`/`new_item`/`commit`; `commit`
//! rotates the buffers (current becomes prev, building becomes current) by
//! swapping, never by copying. Consumers only ever see fully built buffers.

use std::collections::HashSet;
use std::mem;

use bytes::BytesMut;
use engine_shared::{
    config::SnapshotLimits,
    error::{ClientError, ClientResult},
    snapshot::{decode_items, encode_items, DecodeReport, SnapItem, SnapshotBuffer, StaticSizeTable},
};

/// Which finished buffer a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapSelector {
    Current,
    Prev,
}

#[derive(Debug)]
pub struct SnapshotStore {
    limits: SnapshotLimits,
    current: SnapshotBuffer,
    prev: SnapshotBuffer,
    building: SnapshotBuffer,
    is_building: bool,
    statics: StaticSizeTable,
    /// Types that already had an item produced in this session.
    produced_types: HashSet<u16>,
}

impl SnapshotStore {
    pub fn new(limits: SnapshotLimits) -> Self {
        Self {
            limits,
            current: SnapshotBuffer::with_limits(limits),
            prev: SnapshotBuffer::with_limits(limits),
            building: SnapshotBuffer::with_limits(limits),
            is_building: false,
            statics: StaticSizeTable::new(),
            produced_types: HashSet::new(),
        }
    }

    /// New limits apply from the next `begin`.
    pub fn set_limits(&mut self, limits: SnapshotLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> SnapshotLimits {
        self.limits
    }

    fn buffer(&self, sel: SnapSelector) -> &SnapshotBuffer {
        match sel {
            SnapSelector::Current => &self.current,
            SnapSelector::Prev => &self.prev,
        }
    }

    fn buffer_mut(&mut self, sel: SnapSelector) -> &mut SnapshotBuffer {
        match sel {
            SnapSelector::Current => &mut self.current,
            SnapSelector::Prev => &mut self.prev,
        }
    }

    /// Read-only view of a finished buffer.
    pub fn snapshot(&self, sel: SnapSelector) -> &SnapshotBuffer {
        self.buffer(sel)
    }

    /// Tick of the selected buffer, `-1` if it was never filled.
    pub fn tick(&self, sel: SnapSelector) -> i32 {
        self.buffer(sel).tick()
    }

    pub fn count(&self, sel: SnapSelector) -> usize {
        self.buffer(sel).count()
    }

    pub fn slot_count(&self, sel: SnapSelector) -> usize {
        self.buffer(sel).slot_count()
    }

    pub fn find(&self, sel: SnapSelector, type_id: u16, id: u16) -> Option<&[u8]> {
        self.buffer(sel).find(type_id, id)
    }

    pub fn find_index(&self, sel: SnapSelector, type_id: u16, id: u16) -> Option<usize> {
        self.buffer(sel).find_index(type_id, id)
    }

    pub fn get(&self, sel: SnapSelector, index: usize) -> Option<(SnapItem, &[u8])> {
        self.buffer(sel).get(index)
    }

    pub fn size(&self, sel: SnapSelector, index: usize) -> Option<usize> {
        self.buffer(sel).size(index)
    }

    /// Marks one item unusable. Idempotent.
    pub fn invalidate(&mut self, sel: SnapSelector, index: usize) -> bool {
        self.buffer_mut(sel).invalidate(index)
    }

    pub fn iter(&self, sel: SnapSelector) -> impl Iterator<Item = (usize, SnapItem, &[u8])> + '_ {
        self.buffer(sel).iter()
    }

    /// Starts building the buffer for `tick`, dropping any unfinished build.
    pub fn begin(&mut self, tick: i32) {
        self.building.clear();
        self.building.set_tick(tick);
        self.is_building = true;
    }

    pub fn is_building(&self) -> bool {
        self.is_building
    }

    /// Items added so far to the building buffer.
    pub fn building(&self) -> &SnapshotBuffer {
        &self.building
    }

    /// Adds an item to the building buffer and returns its zeroed payload.
    pub fn new_item(&mut self, type_id: u16, id: u16, size: usize) -> ClientResult<&mut [u8]> {
        if !self.is_building {
            return Err(ClientError::NotBuilding);
        }
        let data = self.building.push_item(type_id, id, size, &self.limits)?;
        self.produced_types.insert(type_id);
        Ok(data)
    }

    /// Publishes the building buffer as `current`. Returns its tick.
    pub fn commit(&mut self) -> ClientResult<i32> {
        if !self.is_building {
            return Err(ClientError::NotBuilding);
        }
        mem::swap(&mut self.prev, &mut self.current);
        mem::swap(&mut self.current, &mut self.building);
        self.building.clear();
        self.is_building = false;
        Ok(self.current.tick())
    }

    /// Abandons the building buffer; `current` and `prev` are untouched.
    pub fn discard(&mut self) {
        self.building.clear();
        self.is_building = false;
    }

    /// Declares a fixed payload size for `type_id`.
    ///
    /// Must happen before any item of that type is produced in the session.
    pub fn register_static_size(&mut self, type_id: u16, size: usize) -> ClientResult<()> {
        if self.produced_types.contains(&type_id) && self.statics.get(type_id) != Some(size) {
            return Err(ClientError::StaticSizeTooLate { type_id });
        }
        self.statics.register(type_id, size)
    }

    /// Builds `tick` from an encoded item list and commits it.
    ///
    /// A framing error discards the build and leaves the finished buffers as
    /// they were. Items with duplicate keys are dropped one by one.
    pub fn decode_snapshot(&mut self, tick: i32, data: &[u8]) -> ClientResult<DecodeReport> {
        self.begin(tick);
        if data.is_empty() {
            self.commit()?;
            return Ok(DecodeReport::default());
        }

        let Self {
            building,
            limits,
            statics,
            produced_types,
            ..
        } = self;
        let decoded = decode_items(data, statics, |item, payload| {
            building
                .push_item(item.type_id, item.id, item.data_size, limits)?
                .copy_from_slice(payload);
            produced_types.insert(item.type_id);
            Ok(())
        });

        match decoded {
            Ok(report) => {
                self.commit()?;
                Ok(report)
            }
            Err(err) => {
                self.discard();
                Err(err)
            }
        }
    }

    /// Encodes the current buffer with this session's static sizes.
    pub fn encode_current(&self, out: &mut BytesMut) {
        encode_items(&self.current, &self.statics, out);
    }

    /// Empties every buffer. Static sizes stay registered.
    pub fn clear(&mut self) {
        self.current.clear();
        self.prev.clear();
        self.building.clear();
        self.is_building = false;
    }

    /// `clear` plus forgetting which types were produced; used on a new connection.
    pub fn reset_session(&mut self) {
        self.clear();
        self.produced_types.clear();
    }
}
