//! Snapshot items, buffers and the item codec.
//!
//! A [`SnapshotBuffer`] is an ordered sequence of typed, identified items
//! whose payloads live in one backing byte arena; items reference the arena
//! by offset. Invalidation marks a slot instead of removing it, so indices
//! stay stable while a consumer iterates.
//!
//! Buffers are allocated once and reused: `clear` keeps every allocation.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::config::SnapshotLimits;
use crate::error::{ClientError, ClientResult};

/// Largest payload one item can carry; the wire length is a `u16`.
pub const MAX_ITEM_SIZE: usize = u16::MAX as usize;

/// Most items one buffer can hold; the wire count is a `u16`.
pub const MAX_ITEMS: usize = u16::MAX as usize;

/// Header of one snapshot item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapItem {
    pub type_id: u16,
    pub id: u16,
    pub data_size: usize,
}

impl SnapItem {
    /// Combined `(type, id)` key, unique within one buffer.
    pub fn key(&self) -> u32 {
        item_key(self.type_id, self.id)
    }
}

#[inline]
pub fn item_key(type_id: u16, id: u16) -> u32 {
    (u32::from(type_id) << 16) | u32::from(id)
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    item: SnapItem,
    offset: usize,
    valid: bool,
}

/// One tick's worth of items.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    tick: i32,
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
    arena: Vec<u8>,
    valid: usize,
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer whose arena is reserved up front.
    pub fn with_limits(limits: SnapshotLimits) -> Self {
        Self {
            tick: -1,
            slots: Vec::with_capacity(limits.max_items),
            index: HashMap::with_capacity(limits.max_items),
            arena: Vec::with_capacity(limits.max_bytes),
            valid: 0,
        }
    }

    /// Drops all items, keeping the allocations.
    pub fn clear(&mut self) {
        self.tick = -1;
        self.slots.clear();
        self.index.clear();
        self.arena.clear();
        self.valid = 0;
    }

    pub fn tick(&self) -> i32 {
        self.tick
    }

    pub fn set_tick(&mut self, tick: i32) {
        self.tick = tick;
    }

    /// Number of valid items.
    pub fn count(&self) -> usize {
        self.valid
    }

    /// Number of slots, including invalidated ones. Use for positional iteration.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Payload bytes in use.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }

    pub fn contains(&self, type_id: u16, id: u16) -> bool {
        self.index.contains_key(&item_key(type_id, id))
    }

    /// Index of the valid item with this key.
    pub fn find_index(&self, type_id: u16, id: u16) -> Option<usize> {
        let index = *self.index.get(&item_key(type_id, id))?;
        self.slots[index].valid.then_some(index)
    }

    /// Payload of the valid item with this key.
    pub fn find(&self, type_id: u16, id: u16) -> Option<&[u8]> {
        self.find_index(type_id, id).map(|i| self.payload(i))
    }

    /// Header and payload at `index`; `None` if out of range or invalidated.
    pub fn get(&self, index: usize) -> Option<(SnapItem, &[u8])> {
        let slot = self.slots.get(index)?;
        slot.valid.then(|| (slot.item, self.payload(index)))
    }

    /// Payload length at `index`; `None` if out of range or invalidated.
    pub fn size(&self, index: usize) -> Option<usize> {
        let slot = self.slots.get(index)?;
        slot.valid.then_some(slot.item.data_size)
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.valid)
    }

    /// Marks the slot unusable. Returns `true` if the slot was valid before.
    pub fn invalidate(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.valid => {
                slot.valid = false;
                self.valid -= 1;
                true
            }
            _ => false,
        }
    }

    /// Valid items in received order, with their slot index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, SnapItem, &[u8])> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.valid)
            .map(|(i, slot)| (i, slot.item, self.payload(i)))
    }

    /// Appends a zeroed item and returns its payload for writing.
    pub fn push_item(
        &mut self,
        type_id: u16,
        id: u16,
        size: usize,
        limits: &SnapshotLimits,
    ) -> ClientResult<&mut [u8]> {
        let key = item_key(type_id, id);
        if self.index.contains_key(&key) {
            return Err(ClientError::DuplicateItem { type_id, id });
        }
        let max_items = limits.max_items.min(MAX_ITEMS);
        if self.slots.len() >= max_items {
            return Err(ClientError::TooManyItems { limit: max_items });
        }
        if size > MAX_ITEM_SIZE {
            return Err(ClientError::ItemTooLarge {
                size,
                limit: MAX_ITEM_SIZE,
            });
        }
        let available = limits.max_bytes.saturating_sub(self.arena.len());
        if size > available {
            return Err(ClientError::ArenaExhausted {
                needed: size,
                available,
            });
        }

        let offset = self.arena.len();
        self.arena.resize(offset + size, 0);
        self.index.insert(key, self.slots.len());
        self.slots.push(Slot {
            item: SnapItem {
                type_id,
                id,
                data_size: size,
            },
            offset,
            valid: true,
        });
        self.valid += 1;
        Ok(&mut self.arena[offset..offset + size])
    }

    fn payload(&self, index: usize) -> &[u8] {
        let slot = &self.slots[index];
        &self.arena[slot.offset..slot.offset + slot.item.data_size]
    }
}

/// Fixed payload sizes declared per item type.
#[derive(Debug, Clone, Default)]
pub struct StaticSizeTable {
    sizes: HashMap<u16, usize>,
}

impl StaticSizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a size for `type_id`. Registering the same size again is a no-op.
    pub fn register(&mut self, type_id: u16, size: usize) -> ClientResult<()> {
        match self.sizes.get(&type_id) {
            Some(&registered) if registered != size => Err(ClientError::StaticSizeConflict {
                type_id,
                registered,
                requested: size,
            }),
            Some(_) => Ok(()),
            None => {
                self.sizes.insert(type_id, size);
                Ok(())
            }
        }
    }

    pub fn get(&self, type_id: u16) -> Option<usize> {
        self.sizes.get(&type_id).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

const ITEM_FLAG_EXPLICIT_LEN: u8 = 1;

/// Outcome of decoding one snapshot payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Items accepted by the sink.
    pub accepted: usize,
    /// Items the sink rejected with a protocol error.
    pub dropped: usize,
}

/// Encodes the valid items of `buffer`.
///
/// Layout: `u16 count`, then per item `u16 type, u16 id, u8 flags
/// [, u16 len], payload`. The length is omitted when the type has a
/// registered static size equal to the item size. `push_item` keeps the
/// count and every size within `u16`.
pub fn encode_items(buffer: &SnapshotBuffer, statics: &StaticSizeTable, out: &mut BytesMut) {
    out.put_u16(buffer.count() as u16);
    for (_, item, data) in buffer.iter() {
        out.put_u16(item.type_id);
        out.put_u16(item.id);
        if statics.get(item.type_id) == Some(item.data_size) {
            out.put_u8(0);
        } else {
            out.put_u8(ITEM_FLAG_EXPLICIT_LEN);
            out.put_u16(item.data_size as u16);
        }
        out.extend_from_slice(data);
    }
}

/// Decodes items and hands each to `sink`.
///
/// Framing errors abort the whole payload. A sink error of kind `Protocol`
/// (e.g. a duplicate key) drops only that item; any other sink error aborts.
pub fn decode_items<F>(
    mut data: &[u8],
    statics: &StaticSizeTable,
    mut sink: F,
) -> ClientResult<DecodeReport>
where
    F: FnMut(SnapItem, &[u8]) -> ClientResult<()>,
{
    let mut report = DecodeReport::default();
    if data.remaining() < 2 {
        return Err(ClientError::protocol("snapshot payload missing item count"));
    }
    let count = data.get_u16() as usize;

    for n in 0..count {
        if data.remaining() < 5 {
            return Err(ClientError::protocol(format!("item {n}: truncated header")));
        }
        let type_id = data.get_u16();
        let id = data.get_u16();
        let flags = data.get_u8();
        let size = if flags & ITEM_FLAG_EXPLICIT_LEN != 0 {
            if data.remaining() < 2 {
                return Err(ClientError::protocol(format!("item {n}: truncated length")));
            }
            data.get_u16() as usize
        } else {
            statics.get(type_id).ok_or_else(|| {
                ClientError::protocol(format!("item {n}: type {type_id} has no static size"))
            })?
        };
        if data.remaining() < size {
            return Err(ClientError::protocol(format!(
                "item {n}: payload needs {size} bytes, {} left",
                data.remaining()
            )));
        }
        let (payload, rest) = data.split_at(size);
        data = rest;

        let item = SnapItem {
            type_id,
            id,
            data_size: size,
        };
        match sink(item, payload) {
            Ok(()) => report.accepted += 1,
            Err(err) if err.kind() == crate::error::ErrorKind::Protocol => {
                tracing::debug!(type_id, id, error = %err, "Dropping snapshot item");
                report.dropped += 1;
            }
            Err(err) => return Err(err),
        }
    }

    if data.has_remaining() {
        return Err(ClientError::protocol(format!(
            "{} trailing bytes after snapshot items",
            data.remaining()
        )));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SnapshotLimits {
        SnapshotLimits {
            max_items: 8,
            max_bytes: 64,
        }
    }

    #[test]
    fn push_then_find() {
        let mut buf = SnapshotBuffer::with_limits(limits());
        buf.push_item(5, 1, 4, &limits())
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.find(5, 1), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(buf.count(), 1);
        assert!(buf.find(5, 2).is_none());
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut buf = SnapshotBuffer::with_limits(limits());
        buf.push_item(5, 1, 4, &limits()).unwrap();
        let err = buf.push_item(5, 1, 2, &limits()).unwrap_err();
        assert_eq!(err, ClientError::DuplicateItem { type_id: 5, id: 1 });
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn arena_and_item_limits() {
        let mut buf = SnapshotBuffer::with_limits(limits());
        buf.push_item(1, 0, 60, &limits()).unwrap();
        assert!(matches!(
            buf.push_item(1, 1, 8, &limits()),
            Err(ClientError::ArenaExhausted { needed: 8, available: 4 })
        ));

        let mut buf = SnapshotBuffer::with_limits(limits());
        for id in 0..8 {
            buf.push_item(2, id, 0, &limits()).unwrap();
        }
        assert!(matches!(
            buf.push_item(2, 8, 0, &limits()),
            Err(ClientError::TooManyItems { limit: 8 })
        ));
    }

    #[test]
    fn items_fit_the_wire_format() {
        let roomy = SnapshotLimits {
            max_items: 8,
            max_bytes: 128 * 1024,
        };
        let mut buf = SnapshotBuffer::with_limits(roomy);
        assert_eq!(
            buf.push_item(1, 0, MAX_ITEM_SIZE + 1, &roomy).unwrap_err(),
            ClientError::ItemTooLarge {
                size: MAX_ITEM_SIZE + 1,
                limit: MAX_ITEM_SIZE
            }
        );
        assert_eq!(buf.count(), 0);
        buf.push_item(1, 0, MAX_ITEM_SIZE, &roomy).unwrap();

        let mut out = BytesMut::new();
        encode_items(&buf, &StaticSizeTable::new(), &mut out);
        let report = decode_items(&out, &StaticSizeTable::new(), |item, data| {
            assert_eq!(item.data_size, MAX_ITEM_SIZE);
            assert_eq!(data.len(), MAX_ITEM_SIZE);
            Ok(())
        })
        .unwrap();
        assert_eq!(report.accepted, 1);

        let many = SnapshotLimits {
            max_items: usize::MAX,
            max_bytes: 0,
        };
        let mut buf = SnapshotBuffer::new();
        for id in 0..=u16::MAX - 1 {
            buf.push_item(0, id, 0, &many).unwrap();
        }
        assert_eq!(
            buf.push_item(0, u16::MAX, 0, &many).unwrap_err(),
            ClientError::TooManyItems { limit: MAX_ITEMS }
        );
    }

    #[test]
    fn invalidate_keeps_indices_stable() {
        let mut buf = SnapshotBuffer::with_limits(limits());
        for id in 0..3u16 {
            buf.push_item(3, id, 2, &limits())
                .unwrap()
                .copy_from_slice(&[id as u8; 2]);
        }
        assert!(buf.invalidate(1));
        assert!(!buf.invalidate(1));
        assert_eq!(buf.count(), 2);
        assert_eq!(buf.slot_count(), 3);
        assert!(buf.find(3, 1).is_none());
        assert!(buf.get(1).is_none());
        assert_eq!(buf.get(2).unwrap().1, &[2, 2]);
        assert_eq!(buf.size(0), Some(2));
        assert_eq!(buf.iter().map(|(i, _, _)| i).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = SnapshotBuffer::with_limits(limits());
        buf.push_item(1, 1, 16, &limits()).unwrap();
        buf.clear();
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.arena_len(), 0);
        assert!(buf.arena.capacity() >= 64);
        assert_eq!(buf.tick(), -1);
    }

    #[test]
    fn static_size_registration() {
        let mut table = StaticSizeTable::new();
        table.register(5, 12).unwrap();
        table.register(5, 12).unwrap();
        assert!(matches!(
            table.register(5, 16),
            Err(ClientError::StaticSizeConflict { type_id: 5, registered: 12, requested: 16 })
        ));
        assert_eq!(table.get(5), Some(12));
    }

    #[test]
    fn codec_omits_static_lengths() {
        let mut statics = StaticSizeTable::new();
        statics.register(5, 4).unwrap();

        let mut buf = SnapshotBuffer::with_limits(limits());
        buf.push_item(5, 1, 4, &limits()).unwrap().copy_from_slice(b"abcd");
        buf.push_item(5, 2, 2, &limits()).unwrap().copy_from_slice(b"xy");
        buf.push_item(9, 0, 3, &limits()).unwrap().copy_from_slice(b"123");

        let mut out = BytesMut::new();
        encode_items(&buf, &statics, &mut out);
        // count + (5 + 4) + (7 + 2) + (7 + 3)
        assert_eq!(out.len(), 2 + 9 + 9 + 10);

        let mut decoded = SnapshotBuffer::with_limits(limits());
        let report = decode_items(&out, &statics, |item, data| {
            decoded
                .push_item(item.type_id, item.id, item.data_size, &limits())?
                .copy_from_slice(data);
            Ok(())
        })
        .unwrap();
        assert_eq!(report, DecodeReport { accepted: 3, dropped: 0 });
        assert_eq!(decoded.find(5, 2), Some(&b"xy"[..]));
        assert_eq!(decoded.find(9, 0), Some(&b"123"[..]));
    }

    #[test]
    fn decode_drops_duplicates_but_keeps_going() {
        let statics = StaticSizeTable::new();
        let mut out = BytesMut::new();
        out.put_u16(3);
        for (type_id, id) in [(1u16, 1u16), (1, 1), (1, 2)] {
            out.put_u16(type_id);
            out.put_u16(id);
            out.put_u8(ITEM_FLAG_EXPLICIT_LEN);
            out.put_u16(1);
            out.put_u8(7);
        }

        let mut decoded = SnapshotBuffer::with_limits(limits());
        let report = decode_items(&out, &statics, |item, data| {
            decoded
                .push_item(item.type_id, item.id, item.data_size, &limits())?
                .copy_from_slice(data);
            Ok(())
        })
        .unwrap();
        assert_eq!(report, DecodeReport { accepted: 2, dropped: 1 });
        assert_eq!(decoded.count(), 2);
    }

    #[test]
    fn decode_rejects_unknown_static_type() {
        let mut out = BytesMut::new();
        out.put_u16(1);
        out.put_u16(42);
        out.put_u16(0);
        out.put_u8(0);
        let err = decode_items(&out, &StaticSizeTable::new(), |_, _| Ok(())).unwrap_err();
        assert!(err.to_string().contains("no static size"));
    }
}
