//! Allocation map of one chunk.
//!
//! A chunk's unit is described by a sequence of [`Area`]s whose lengths sum
//! to the portion of the unit the chunk manages. Allocation is first fit
//! with alignment; freeing merges with free neighbours. The map keeps a
//! `contig_hint`, an upper bound on the largest free area, so callers can
//! skip chunks that cannot possibly fit a request.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;
use kernel_memory_addresses::align_up_usize;

/// Smallest head or tail split off an allocation. Anything smaller is
/// absorbed into a neighbour.
pub const MIN_AREA_SIZE: usize = size_of::<i32>();

/// Capacity of a map created after late init.
pub const DEFAULT_MAP_ALLOC: usize = 16;

/// One run of bytes within a unit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Area {
    Free(usize),
    Used(usize),
}

impl Area {
    /// Unused capacity entries.
    pub(crate) const EMPTY: Self = Self::Free(0);

    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Free(size) | Self::Used(size) => size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free(_))
    }
}

/// Where a map's entries live.
pub(crate) enum MapStorage<'m> {
    /// Carved out of boot memory before the heap exists. Never freed.
    Early(&'m mut [Area]),
    Heap(Box<[Area]>),
}

impl MapStorage<'_> {
    fn as_slice(&self) -> &[Area] {
        match self {
            Self::Early(slice) => slice,
            Self::Heap(boxed) => boxed,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Area] {
        match self {
            Self::Early(slice) => slice,
            Self::Heap(boxed) => boxed,
        }
    }

    fn capacity(&self) -> usize {
        self.as_slice().len()
    }
}

/// Allocate a zeroed heap map of `capacity` entries without aborting on
/// exhaustion.
pub(crate) fn heap_storage(capacity: usize) -> Option<Box<[Area]>> {
    let mut entries = Vec::new();
    entries.try_reserve_exact(capacity).ok()?;
    entries.resize(capacity, Area::EMPTY);
    Some(entries.into_boxed_slice())
}

pub struct AreaMap<'m> {
    storage: MapStorage<'m>,
    used: usize,
    free_size: usize,
    contig_hint: usize,
}

impl<'m> AreaMap<'m> {
    /// Build a map over `storage` holding `areas`.
    ///
    /// # Panics
    /// If `storage` cannot hold `areas`.
    pub(crate) fn new(mut storage: MapStorage<'m>, areas: &[Area]) -> Self {
        assert!(storage.capacity() >= areas.len(), "percpu: area map too small");
        let entries = storage.as_mut_slice();
        entries[..areas.len()].copy_from_slice(areas);
        entries[areas.len()..].fill(Area::EMPTY);

        let free = areas.iter().filter(|a| a.is_free()).map(|a| a.size());
        Self {
            used: areas.len(),
            free_size: free.clone().sum(),
            contig_hint: free.max().unwrap_or(0),
            storage,
        }
    }

    /// Entries in use, in address order.
    #[must_use]
    pub fn areas(&self) -> &[Area] {
        &self.storage.as_slice()[..self.used]
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Sum of all free areas.
    #[must_use]
    pub const fn free_size(&self) -> usize {
        self.free_size
    }

    /// No free area is larger than this.
    #[must_use]
    pub const fn contig_hint(&self) -> usize {
        self.contig_hint
    }

    pub(crate) const fn is_early(&self) -> bool {
        matches!(self.storage, MapStorage::Early(_))
    }

    fn entries_mut(&mut self) -> &mut [Area] {
        self.storage.as_mut_slice()
    }

    /// Capacity a map must grow to before the next allocation, if any.
    ///
    /// An allocation splits at most one area into three, so two spare
    /// entries always suffice.
    #[must_use]
    pub fn need_to_extend(&self) -> Option<usize> {
        let needed = self.used + 2;
        if self.capacity() >= needed {
            return None;
        }
        let mut new_alloc = DEFAULT_MAP_ALLOC;
        while new_alloc < needed {
            new_alloc *= 2;
        }
        Some(new_alloc)
    }

    /// Move the entries into `larger` and return the storage that was
    /// replaced. When `larger` is not larger after all, nothing changes
    /// and `larger` is handed back.
    pub(crate) fn install(&mut self, larger: Box<[Area]>) -> MapStorage<'m> {
        if larger.len() <= self.capacity() {
            return MapStorage::Heap(larger);
        }
        self.move_to(larger)
    }

    /// Move the entries into `storage` and return the old storage.
    ///
    /// # Panics
    /// If `storage` is smaller than the current capacity.
    pub(crate) fn move_to(&mut self, mut storage: Box<[Area]>) -> MapStorage<'m> {
        assert!(storage.len() >= self.capacity(), "percpu: area map would shrink");
        storage[..self.used].copy_from_slice(self.areas());
        storage[self.used..].fill(Area::EMPTY);
        mem::replace(&mut self.storage, MapStorage::Heap(storage))
    }

    /// Split the free area at `i` into `[head] alloc [tail]`.
    fn split(&mut self, mut i: usize, head: usize, tail: usize) {
        let extra = usize::from(head != 0) + usize::from(tail != 0);
        let used = self.used;
        assert!(
            self.capacity() >= used + extra,
            "percpu: area map out of entries"
        );

        let entries = self.entries_mut();
        entries.copy_within(i..used, i + extra);
        if head != 0 {
            entries[i + 1] = Area::Free(entries[i].size() - head);
            entries[i] = Area::Free(head);
            i += 1;
        }
        if tail != 0 {
            entries[i] = Area::Free(entries[i].size() - tail);
            entries[i + 1] = Area::Free(tail);
        }
        self.used += extra;
    }

    /// Allocate `size` bytes aligned to `align` and return their offset.
    ///
    /// The caller must have made room with [`need_to_extend`](Self::need_to_extend).
    /// On failure the contig hint is made exact.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        let mut max_contig = 0;
        let mut off = 0;
        let mut i = 0;

        while i < self.used {
            let is_last = i + 1 == self.used;
            let area = self.areas()[i];
            let Area::Free(len) = area else {
                off += area.size();
                i += 1;
                continue;
            };

            let mut head = align_up_usize(off, align) - off;
            debug_assert!(i > 0 || head == 0);
            if len < head + size {
                max_contig = max_contig.max(len);
                off += len;
                i += 1;
                continue;
            }

            // A head too small to track, or next to a free area, goes to
            // the previous entry.
            if head != 0 && (head < MIN_AREA_SIZE || self.areas()[i - 1].is_free()) {
                let entries = self.entries_mut();
                entries[i - 1] = match entries[i - 1] {
                    Area::Free(prev) => Area::Free(prev + head),
                    Area::Used(prev) => Area::Used(prev + head),
                };
                entries[i] = Area::Free(len - head);
                if !self.areas()[i - 1].is_free() {
                    self.free_size -= head;
                }
                off += head;
                head = 0;
            }

            let len = self.areas()[i].size();
            let mut tail = len - head - size;
            if tail < MIN_AREA_SIZE {
                tail = 0;
            }

            if head != 0 || tail != 0 {
                self.split(i, head, tail);
                if head != 0 {
                    i += 1;
                    off += head;
                    max_contig = max_contig.max(head);
                }
                if tail != 0 {
                    max_contig = max_contig.max(tail);
                }
            }

            // Everything past the last entry was scanned, so the hint can
            // only shrink to what was seen.
            self.contig_hint = if is_last {
                max_contig
            } else {
                self.contig_hint.max(max_contig)
            };

            let len = self.areas()[i].size();
            self.free_size -= len;
            self.entries_mut()[i] = Area::Used(len);
            return Some(off);
        }

        self.contig_hint = max_contig;
        None
    }

    /// Free the area starting at `off` and return its length.
    ///
    /// # Panics
    /// If no area starts at `off` or the area there is already free.
    pub fn free(&mut self, off: usize) -> usize {
        let mut pos = 0;
        let found = self.areas().iter().position(|area| {
            let hit = pos == off;
            pos += area.size();
            hit
        });
        let Some(mut i) = found else {
            panic!("percpu: no area starts at offset {off:#x}");
        };
        let Area::Used(len) = self.areas()[i] else {
            panic!("percpu: area at offset {off:#x} is already free");
        };

        self.free_size += len;
        let used = self.used;
        let entries = self.entries_mut();
        entries[i] = Area::Free(len);

        let mut merged = 0;
        if i > 0 && entries[i - 1].is_free() {
            entries[i - 1] = Area::Free(entries[i - 1].size() + len);
            entries.copy_within(i + 1..used, i);
            entries[used - 1] = Area::EMPTY;
            merged += 1;
            i -= 1;
        }
        let used = used - merged;
        if i + 1 < used && entries[i + 1].is_free() {
            entries[i] = Area::Free(entries[i].size() + entries[i + 1].size());
            entries.copy_within(i + 2..used, i + 1);
            entries[used - 1] = Area::EMPTY;
            merged += 1;
        }
        self.used -= merged;

        self.contig_hint = self.contig_hint.max(self.areas()[i].size());
        len
    }
}

impl core::fmt::Debug for AreaMap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AreaMap")
            .field("free_size", &self.free_size)
            .field("contig_hint", &self.contig_hint)
            .field("capacity", &self.capacity())
            .field("areas", &self.areas())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(unit: usize) -> AreaMap<'static> {
        AreaMap::new(
            MapStorage::Heap(heap_storage(DEFAULT_MAP_ALLOC).unwrap()),
            &[Area::Free(unit)],
        )
    }

    #[test]
    fn aligned_allocations_split_and_merge_back() {
        let mut map = map(4096);

        assert_eq!(map.alloc(100, 8), Some(0));
        assert_eq!(map.areas(), &[Area::Used(100), Area::Free(3996)]);
        assert_eq!(map.contig_hint(), 3996);

        assert_eq!(map.alloc(50, 16), Some(112));
        assert_eq!(
            map.areas(),
            &[
                Area::Used(100),
                Area::Free(12),
                Area::Used(50),
                Area::Free(3934)
            ]
        );
        assert_eq!(map.free_size(), 3946);

        assert_eq!(map.free(112), 50);
        assert_eq!(map.areas(), &[Area::Used(100), Area::Free(3996)]);
        assert_eq!(map.free(0), 100);
        assert_eq!(map.areas(), &[Area::Free(4096)]);
        assert_eq!(map.free_size(), 4096);
        assert_eq!(map.contig_hint(), 4096);
    }

    #[test]
    fn small_head_is_absorbed_by_previous_allocation() {
        let mut map = map(64);
        assert_eq!(map.alloc(1, 1), Some(0));
        assert_eq!(map.alloc(4, 4), Some(4));

        assert_eq!(map.areas(), &[Area::Used(4), Area::Used(4), Area::Free(56)]);
        assert_eq!(map.free_size(), 56);

        // The padding goes back with the first allocation.
        assert_eq!(map.free(0), 4);
        assert_eq!(map.areas(), &[Area::Free(4), Area::Used(4), Area::Free(56)]);
    }

    #[test]
    fn small_tail_is_absorbed_by_allocation() {
        let mut map = map(10);
        assert_eq!(map.alloc(8, 1), Some(0));
        assert_eq!(map.areas(), &[Area::Used(10)]);
        assert_eq!(map.free_size(), 0);
        assert_eq!(map.free(0), 10);
    }

    #[test]
    fn failed_search_makes_contig_hint_exact() {
        let mut map = map(256);
        for _ in 0..4 {
            map.alloc(64, 64).unwrap();
        }
        map.free(64);
        map.free(192);
        assert_eq!(map.alloc(128, 1), None);
        assert_eq!(map.contig_hint(), 64);
        assert_eq!(map.free_size(), 128);
    }

    #[test]
    fn freeing_merges_both_neighbours() {
        let mut map = map(96);
        for off in [0, 32, 64] {
            assert_eq!(map.alloc(32, 32), Some(off));
        }
        map.free(0);
        map.free(64);
        assert_eq!(map.areas().len(), 3);
        map.free(32);
        assert_eq!(map.areas(), &[Area::Free(96)]);
        assert_eq!(map.contig_hint(), 96);
    }

    #[test]
    #[should_panic(expected = "no area starts at offset")]
    fn freeing_inside_an_area_panics() {
        let mut map = map(64);
        map.alloc(16, 1).unwrap();
        map.free(8);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let mut map = map(64);
        map.alloc(16, 1).unwrap();
        map.free(0);
        map.free(0);
    }

    #[test]
    fn extension_doubles_from_default() {
        let mut map = map(1024);
        assert_eq!(map.need_to_extend(), None);
        for _ in 0..13 {
            map.alloc(4, 4).unwrap();
        }
        assert_eq!(map.areas().len(), 14);
        assert_eq!(map.need_to_extend(), None);
        map.alloc(4, 4).unwrap();
        assert_eq!(map.need_to_extend(), Some(32));

        let old = map.install(heap_storage(32).unwrap());
        assert!(matches!(old, MapStorage::Heap(ref b) if b.len() == DEFAULT_MAP_ALLOC));
        assert_eq!(map.capacity(), 32);
        assert_eq!(map.areas().len(), 15);
        assert_eq!(map.need_to_extend(), None);
        assert_eq!(map.areas().iter().map(|a| a.size()).sum::<usize>(), 1024);
    }

    /// xorshift64, enough to drive reproducible operation sequences.
    struct Rng(u64);

    impl Rng {
        fn below(&mut self, n: usize) -> usize {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            (self.0 % n as u64) as usize
        }
    }

    /// `(offset, area)` for every entry.
    fn placed(map: &AreaMap<'_>) -> Vec<(usize, Area)> {
        let mut off = 0;
        map.areas()
            .iter()
            .map(|&area| {
                let at = off;
                off += area.size();
                (at, area)
            })
            .collect()
    }

    fn check_invariants(map: &AreaMap<'_>, unit: usize) {
        let areas = map.areas();
        assert_eq!(areas.iter().map(|a| a.size()).sum::<usize>(), unit);
        let free: usize = areas.iter().filter(|a| a.is_free()).map(|a| a.size()).sum();
        assert_eq!(map.free_size(), free, "{map:?}");
        assert!(
            areas.windows(2).all(|w| !(w[0].is_free() && w[1].is_free())),
            "adjacent free areas in {map:?}"
        );
        let largest = areas.iter().filter(|a| a.is_free()).map(|a| a.size()).max();
        assert!(map.contig_hint() >= largest.unwrap_or(0), "{map:?}");
    }

    #[test]
    fn random_alloc_free_keeps_the_map_consistent() {
        const UNIT: usize = 8 << 10;

        for seed in 1..=40u64 {
            let mut rng = Rng(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut map = map(UNIT);
            let mut live: Vec<(usize, usize)> = Vec::new();

            for _ in 0..400 {
                if live.is_empty() || rng.below(3) != 0 {
                    let size = 1 + rng.below(512);
                    let align = 1 << rng.below(8);
                    if let Some(new_alloc) = map.need_to_extend() {
                        drop(map.install(heap_storage(new_alloc).unwrap()));
                    }
                    let fits = placed(&map).iter().any(|&(off, area)| {
                        area.is_free() && align_up_usize(off, align) - off + size <= area.size()
                    });
                    match map.alloc(size, align) {
                        Some(off) => {
                            assert!(off.is_multiple_of(align), "seed {seed}: {off:#x} misaligned");
                            let area = placed(&map).into_iter().find(|&(at, _)| at == off);
                            assert!(
                                matches!(area, Some((_, Area::Used(len))) if len >= size),
                                "seed {seed}: no used area of {size} at {off:#x}"
                            );
                            assert!(live.iter().all(|&(o, s)| off + size <= o || o + s <= off));
                            live.push((off, size));
                        }
                        None => {
                            assert!(!fits, "seed {seed}: {size}/{align} fits but failed");
                            let largest = placed(&map)
                                .iter()
                                .filter(|(_, a)| a.is_free())
                                .map(|(_, a)| a.size())
                                .max();
                            assert_eq!(map.contig_hint(), largest.unwrap_or(0));
                        }
                    }
                } else {
                    let (off, size) = live.swap_remove(rng.below(live.len()));
                    assert!(map.free(off) >= size);
                }
                check_invariants(&map, UNIT);
            }

            for (off, _) in live {
                map.free(off);
            }
            assert_eq!(map.areas(), &[Area::Free(UNIT)]);
        }
    }

    #[test]
    fn installing_a_smaller_map_is_a_no_op() {
        let mut early = [Area::EMPTY; 8];
        let mut map = AreaMap::new(MapStorage::Early(&mut early), &[Area::Used(8), Area::Free(8)]);
        assert!(map.is_early());

        let rejected = map.install(heap_storage(8).unwrap());
        assert!(matches!(rejected, MapStorage::Heap(ref b) if b.len() == 8));
        assert!(map.is_early());
        assert_eq!(map.areas(), &[Area::Used(8), Area::Free(8)]);
    }
}
