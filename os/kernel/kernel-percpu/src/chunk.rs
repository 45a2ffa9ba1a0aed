//! Chunks and the slot lists that index them by free space.

use crate::area_map::{AreaMap, MIN_AREA_SIZE};
use alloc::vec::Vec;
use bitvec::prelude::*;
use core::fmt;
use core::mem;
use kernel_memory_addresses::VirtualAddress;

/// Bytes of free space covered by slot 1 and below are `1 << SLOT_BASE_SHIFT`.
const SLOT_BASE_SHIFT: usize = 5;

/// Handle of a chunk.
///
/// The first chunk and the reserved chunk have fixed ids; dynamic chunks
/// are numbered from there in creation order, reusing ids of destroyed
/// chunks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
    /// The chunk serving dynamic allocations out of the first chunk.
    pub const FIRST: Self = Self(0);
    /// The chunk serving reserved allocations.
    pub const RESERVED: Self = Self(1);

    pub(crate) const fn dynamic(index: usize) -> Self {
        Self(index + 2)
    }

    pub(crate) const fn dynamic_index(self) -> Option<usize> {
        self.0.checked_sub(2)
    }

    /// Whether the chunk was created after boot and may be destroyed.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        self.0 >= 2
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FIRST => f.write_str("Chunk(first)"),
            Self::RESERVED => f.write_str("Chunk(reserved)"),
            Self(id) => write!(f, "Chunk({id})"),
        }
    }
}

const fn fls(value: usize) -> usize {
    (usize::BITS - value.leading_zeros()) as usize
}

/// Slot for `size` bytes, ignoring the special last slot.
pub(crate) const fn size_to_slot_raw(size: usize) -> usize {
    let slot = (fls(size) + 2).saturating_sub(SLOT_BASE_SHIFT);
    if slot == 0 { 1 } else { slot }
}

/// Number of slots for units of `unit_size` bytes; the last one holds
/// completely free chunks.
pub(crate) const fn nr_slots(unit_size: usize) -> usize {
    size_to_slot_raw(unit_size) + 2
}

pub(crate) struct Chunk<'m> {
    pub(crate) base: VirtualAddress,
    pub(crate) map: AreaMap<'m>,
    /// Pages of the unit backed by memory; `None` for chunks that are
    /// fully populated for their whole lifetime.
    pub(crate) populated: Option<BitVec>,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
    slot: Option<usize>,
}

impl<'m> Chunk<'m> {
    /// A chunk backed by memory from the start.
    pub(crate) const fn immutable(base: VirtualAddress, map: AreaMap<'m>) -> Self {
        Self {
            base,
            map,
            populated: None,
            prev: None,
            next: None,
            slot: None,
        }
    }

    /// A chunk whose pages are mapped on demand.
    pub(crate) fn unpopulated(base: VirtualAddress, map: AreaMap<'m>, unit_pages: usize) -> Self {
        Self {
            base,
            map,
            populated: Some(BitVec::repeat(false, unit_pages)),
            prev: None,
            next: None,
            slot: None,
        }
    }

    pub(crate) const fn is_immutable(&self) -> bool {
        self.populated.is_none()
    }

    /// Successor in the chunk's slot list.
    pub(crate) const fn next_in_slot(&self) -> Option<ChunkId> {
        self.next
    }
}

/// Head and tail of one slot's chunk list.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct SlotList {
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
}

impl SlotList {
    pub(crate) const EMPTY: Self = Self {
        head: None,
        tail: None,
    };
}

/// Every chunk, and the slot lists ordering them by free space.
///
/// Chunks in a slot are scanned in list order; a chunk whose free space
/// shrank goes to the head of its new slot, one that grew to the tail.
pub(crate) struct ChunkIndex<'m> {
    unit_size: usize,
    slots: &'m mut [SlotList],
    first: Chunk<'m>,
    reserved: Option<Chunk<'m>>,
    dynamic: Vec<Option<Chunk<'m>>>,
}

impl<'m> ChunkIndex<'m> {
    pub(crate) fn new(
        unit_size: usize,
        slots: &'m mut [SlotList],
        first: Chunk<'m>,
        reserved: Option<Chunk<'m>>,
    ) -> Self {
        debug_assert_eq!(slots.len(), nr_slots(unit_size));
        slots.fill(SlotList::EMPTY);
        let mut index = Self {
            unit_size,
            slots,
            first,
            reserved,
            dynamic: Vec::new(),
        };
        index.relocate(ChunkId::FIRST);
        index
    }

    pub(crate) fn nr_slots(&self) -> usize {
        self.slots.len()
    }

    /// Lowest slot that can hold a chunk with `size` free bytes.
    pub(crate) fn size_to_slot(&self, size: usize) -> usize {
        if size == self.unit_size {
            self.nr_slots() - 1
        } else {
            size_to_slot_raw(size)
        }
    }

    fn chunk_slot(&self, chunk: &Chunk<'_>) -> usize {
        if chunk.map.free_size() < MIN_AREA_SIZE || chunk.map.contig_hint() < MIN_AREA_SIZE {
            0
        } else {
            self.size_to_slot(chunk.map.free_size())
        }
    }

    pub(crate) fn get(&self, id: ChunkId) -> Option<&Chunk<'m>> {
        match id {
            ChunkId::FIRST => Some(&self.first),
            ChunkId::RESERVED => self.reserved.as_ref(),
            _ => self.dynamic.get(id.dynamic_index()?)?.as_ref(),
        }
    }

    pub(crate) fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk<'m>> {
        match id {
            ChunkId::FIRST => Some(&mut self.first),
            ChunkId::RESERVED => self.reserved.as_mut(),
            _ => self.dynamic.get_mut(id.dynamic_index()?)?.as_mut(),
        }
    }

    /// # Panics
    /// If `id` names no live chunk.
    pub(crate) fn chunk(&self, id: ChunkId) -> &Chunk<'m> {
        match self.get(id) {
            Some(chunk) => chunk,
            None => panic!("percpu: {id:?} does not exist"),
        }
    }

    /// # Panics
    /// If `id` names no live chunk.
    pub(crate) fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk<'m> {
        match self.get_mut(id) {
            Some(chunk) => chunk,
            None => panic!("percpu: {id:?} does not exist"),
        }
    }

    pub(crate) const fn has_reserved(&self) -> bool {
        self.reserved.is_some()
    }

    pub(crate) fn slot_head(&self, slot: usize) -> Option<ChunkId> {
        self.slots[slot].head
    }

    /// Chunks of `slot`, head first.
    pub(crate) fn slot_iter(&self, slot: usize) -> SlotIter<'_, 'm> {
        SlotIter {
            index: self,
            next: self.slots[slot].head,
        }
    }

    /// All live chunks.
    pub(crate) fn chunks(&self) -> impl Iterator<Item = (ChunkId, &Chunk<'m>)> {
        let fixed = [
            Some((ChunkId::FIRST, &self.first)),
            self.reserved.as_ref().map(|c| (ChunkId::RESERVED, c)),
        ];
        let dynamic = self
            .dynamic
            .iter()
            .enumerate()
            .filter_map(|(i, c)| Some((ChunkId::dynamic(i), c.as_ref()?)));
        fixed.into_iter().flatten().chain(dynamic)
    }

    fn unlink(&mut self, id: ChunkId) {
        let (prev, next, slot) = {
            let chunk = self.chunk_mut(id);
            let links = (chunk.prev.take(), chunk.next.take(), chunk.slot.take());
            match links.2 {
                Some(slot) => (links.0, links.1, slot),
                None => return,
            }
        };
        match prev {
            Some(prev) => self.chunk_mut(prev).next = next,
            None => self.slots[slot].head = next,
        }
        match next {
            Some(next) => self.chunk_mut(next).prev = prev,
            None => self.slots[slot].tail = prev,
        }
    }

    fn link(&mut self, id: ChunkId, slot: usize, at_head: bool) {
        let list = self.slots[slot];
        let (prev, next) = if at_head {
            (None, list.head)
        } else {
            (list.tail, None)
        };
        {
            let chunk = self.chunk_mut(id);
            chunk.prev = prev;
            chunk.next = next;
            chunk.slot = Some(slot);
        }
        match prev {
            Some(prev) => self.chunk_mut(prev).next = Some(id),
            None => self.slots[slot].head = Some(id),
        }
        match next {
            Some(next) => self.chunk_mut(next).prev = Some(id),
            None => self.slots[slot].tail = Some(id),
        }
    }

    /// Put chunk `id` into the slot matching its free space.
    ///
    /// The reserved chunk is never listed; it is only reached directly.
    pub(crate) fn relocate(&mut self, id: ChunkId) {
        if id == ChunkId::RESERVED {
            return;
        }
        let chunk = self.chunk(id);
        let old = chunk.slot;
        let new = self.chunk_slot(chunk);
        if old == Some(new) {
            return;
        }
        self.unlink(id);
        self.link(id, new, old.is_some_and(|old| old > new));
    }

    /// Allocate from chunk `id` and relocate it. A failed attempt updates
    /// the contig hint, which may move the chunk too.
    pub(crate) fn alloc_area(&mut self, id: ChunkId, size: usize, align: usize) -> Option<usize> {
        let off = self.chunk_mut(id).map.alloc(size, align);
        self.relocate(id);
        off
    }

    /// Free the area at `off` of chunk `id` and relocate it.
    pub(crate) fn free_area(&mut self, id: ChunkId, off: usize) -> usize {
        let size = self.chunk_mut(id).map.free(off);
        self.relocate(id);
        size
    }

    /// Whether a fully free chunk other than `id` is waiting in the last slot.
    pub(crate) fn other_empty_chunk(&self, id: ChunkId) -> bool {
        self.slot_iter(self.nr_slots() - 1).any(|(other, _)| other != id)
    }

    /// Fully free chunks beyond the one kept around for the next request.
    pub(crate) fn reclaimable(&self) -> usize {
        let keep = self.slots[self.nr_slots() - 1].tail;
        self.slot_iter(self.nr_slots() - 1)
            .filter(|(id, _)| id.is_dynamic() && Some(*id) != keep)
            .count()
    }

    /// Move fully free dynamic chunks into `out` until its spare capacity
    /// runs out. The tail of the last slot, the chunk that became free
    /// most recently, stays.
    pub(crate) fn take_reclaimable(&mut self, out: &mut Vec<(ChunkId, Chunk<'m>)>) {
        let last = self.nr_slots() - 1;
        let keep = self.slots[last].tail;
        let mut next = self.slots[last].head;
        while let Some(id) = next {
            if Some(id) == keep || out.len() == out.capacity() {
                break;
            }
            next = self.chunk(id).next;
            if !id.is_dynamic() {
                continue;
            }
            debug_assert!(!self.chunk(id).is_immutable());
            if let Some(chunk) = self.remove(id) {
                out.push((id, chunk));
            }
        }
    }

    /// Place a new dynamic chunk and list it.
    ///
    /// Hands the chunk back when the arena has no room left without
    /// allocating; grow it with [`grow_arena`](Self::grow_arena) first.
    pub(crate) fn insert(&mut self, chunk: Chunk<'m>) -> Result<ChunkId, Chunk<'m>> {
        let index = match self.dynamic.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.dynamic.len() < self.dynamic.capacity() => {
                self.dynamic.push(None);
                self.dynamic.len() - 1
            }
            None => return Err(chunk),
        };
        self.dynamic[index] = Some(chunk);
        let id = ChunkId::dynamic(index);
        self.relocate(id);
        Ok(id)
    }

    /// Capacity the arena should grow to when [`insert`](Self::insert) fails.
    pub(crate) fn arena_grow_target(&self) -> usize {
        (self.dynamic.capacity() * 2).max(4)
    }

    /// Swap in `larger` as the arena and return the old storage so the
    /// caller can drop it after unlocking.
    pub(crate) fn grow_arena(
        &mut self,
        mut larger: Vec<Option<Chunk<'m>>>,
    ) -> Vec<Option<Chunk<'m>>> {
        if larger.capacity() <= self.dynamic.capacity() {
            return larger;
        }
        larger.clear();
        larger.extend(self.dynamic.drain(..));
        mem::replace(&mut self.dynamic, larger)
    }

    /// Unlist and take out dynamic chunk `id`.
    pub(crate) fn remove(&mut self, id: ChunkId) -> Option<Chunk<'m>> {
        let index = id.dynamic_index()?;
        self.dynamic.get(index)?.as_ref()?;
        self.unlink(id);
        self.dynamic[index].take()
    }
}

pub(crate) struct SlotIter<'a, 'm> {
    index: &'a ChunkIndex<'m>,
    next: Option<ChunkId>,
}

impl<'a, 'm> Iterator for SlotIter<'a, 'm> {
    type Item = (ChunkId, &'a Chunk<'m>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let chunk = self.index.chunk(id);
        self.next = chunk.next;
        Some((id, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area_map::{Area, MapStorage, heap_storage};

    const UNIT: usize = 32 << 10;

    fn dynamic(free: usize) -> Chunk<'static> {
        let areas: &[Area] = if free == UNIT {
            &[Area::Free(UNIT)]
        } else {
            &[Area::Used(UNIT - free), Area::Free(free)]
        };
        let map = AreaMap::new(MapStorage::Heap(heap_storage(16).unwrap()), areas);
        Chunk::unpopulated(VirtualAddress::new(0x10_0000), map, UNIT >> 12)
    }

    fn index(slots: &mut [SlotList]) -> ChunkIndex<'_> {
        ChunkIndex::new(UNIT, slots, dynamic(20 << 10), None)
    }

    fn ids(index: &ChunkIndex<'_>, slot: usize) -> Vec<ChunkId> {
        index.slot_iter(slot).map(|(id, _)| id).collect()
    }

    #[test]
    fn slots_grow_logarithmically() {
        assert_eq!(size_to_slot_raw(0), 1);
        assert_eq!(size_to_slot_raw(4), 1);
        assert_eq!(size_to_slot_raw(8), 1);
        assert_eq!(size_to_slot_raw(16), 2);
        assert_eq!(size_to_slot_raw(8 << 10), 11);
        assert_eq!(size_to_slot_raw(24 << 10), 12);
        assert_eq!(size_to_slot_raw(UNIT), 13);
        assert_eq!(nr_slots(UNIT), 15);
    }

    #[test]
    fn first_chunk_is_listed_by_free_space() {
        let mut slots = [SlotList::EMPTY; nr_slots(UNIT)];
        let index = index(&mut slots);
        assert_eq!(ids(&index, 12), [ChunkId::FIRST]);
        assert_eq!(index.size_to_slot(UNIT), 14);
    }

    #[test]
    fn new_chunks_append_and_shrinking_chunks_move_to_head() {
        let mut slots = [SlotList::EMPTY; nr_slots(UNIT)];
        let mut index = index(&mut slots);
        drop(index.grow_arena(Vec::with_capacity(4)));

        let a = index.insert(dynamic(UNIT)).ok().unwrap();
        let b = index.insert(dynamic(UNIT)).ok().unwrap();
        assert_eq!(ids(&index, 14), [a, b]);

        assert_eq!(index.alloc_area(b, 4 << 10, 8), Some(0));
        assert_eq!(ids(&index, 14), [a]);
        assert_eq!(ids(&index, 12), [b, ChunkId::FIRST]);

        assert_eq!(index.free_area(b, 0), 4 << 10);
        assert_eq!(ids(&index, 14), [a, b]);
        assert!(index.other_empty_chunk(a));
        assert_eq!(index.reclaimable(), 1);
    }

    #[test]
    fn insert_hands_back_chunk_when_arena_is_full() {
        let mut slots = [SlotList::EMPTY; nr_slots(UNIT)];
        let mut index = index(&mut slots);
        let chunk = index.insert(dynamic(UNIT)).err().unwrap();

        let old = index.grow_arena(Vec::with_capacity(index.arena_grow_target()));
        assert_eq!(old.capacity(), 0);
        let id = index.insert(chunk).ok().unwrap();
        assert_eq!(id, ChunkId::dynamic(0));
        assert!(id.is_dynamic());
    }

    #[test]
    fn reclaim_spares_most_recently_freed_chunk() {
        let mut slots = [SlotList::EMPTY; nr_slots(UNIT)];
        let mut index = index(&mut slots);
        drop(index.grow_arena(Vec::with_capacity(4)));
        let ids_in: Vec<_> = (0..3)
            .map(|_| index.insert(dynamic(UNIT)).ok().unwrap())
            .collect();
        for &id in &ids_in {
            assert_eq!(index.alloc_area(id, 8, 8), Some(0));
        }
        for &id in &ids_in {
            index.free_area(id, 0);
        }
        assert_eq!(ids(&index, 14), ids_in);

        let mut out = Vec::with_capacity(index.reclaimable());
        index.take_reclaimable(&mut out);
        let taken: Vec<_> = out.iter().map(|(id, _)| *id).collect();
        assert_eq!(taken, ids_in[..2]);
        assert_eq!(ids(&index, 14), [ids_in[2]]);
        assert_eq!(index.reclaimable(), 0);

        // Freed ids are reused.
        assert_eq!(index.insert(dynamic(UNIT)).ok().unwrap(), ids_in[0]);
    }
}
