//! Laying out and building the first chunk at boot.
//!
//! [`build_alloc_info`] decides how many units make up a chunk and how CPUs
//! are grouped into them, [`embed_first_chunk`] backs the first chunk with
//! boot memory and copies the static image into every unit, and
//! [`setup_first_chunk`] turns the result into a working [`Percpu`].

use crate::area_map::{Area, AreaMap, MapStorage};
use crate::chunk::{Chunk, ChunkIndex, SlotList, nr_slots};
use crate::layout::{ChunkLayout, CpuUnit, GroupSpan};
use crate::{CpuTopology, Percpu, PercpuBackend, PercpuError};
use core::fmt;
use core::ptr::NonNull;
use kernel_bootmem::{BootSlice, Bootmem, BootmemHooks, NodeId, PhysMapper};
use kernel_info::memory::{
    LOCAL_DISTANCE, MAX_DMA_ADDRESS, NR_CPUS, PCPU_MIN_UNIT_SIZE, PERCPU_DYNAMIC_EARLY_SIZE,
    PERCPU_DYNAMIC_EARLY_SLOTS, PERCPU_DYNAMIC_RESERVE, PERCPU_MODULE_RESERVE, VMALLOC_SIZE,
};
use kernel_info::params::FirstChunkKind;
use kernel_memory_addresses::{PAGE_BYTES, PAGE_SHIFT, PhysicalAddress, VirtualAddress, align_up_usize};
use log::{Level, error, info, log, warn};

/// One group of units allocated together.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct GroupInfo {
    /// Units in the group, a multiple of the units per allocation.
    pub nr_units: usize,
    /// Byte offset of the group's first unit from the chunk base.
    pub base_offset: usize,
    /// Index of the group's first entry in [`AllocInfo::cpu_map`].
    pub first_unit: usize,
}

/// Geometry of the first chunk, before it is set up.
pub struct AllocInfo<'m> {
    pub static_size: usize,
    pub reserved_size: usize,
    pub dyn_size: usize,
    pub unit_size: usize,
    /// Allocation granularity; groups are allocated in multiples of it.
    pub atom_size: usize,
    /// Bytes per allocation, i.e. units per allocation times `unit_size`.
    pub alloc_size: usize,
    /// Possible CPUs, numbered `0..nr_cpus`.
    pub nr_cpus: usize,
    pub groups: BootSlice<'m, GroupInfo>,
    /// CPU served by each unit, `None` for units no CPU uses.
    pub cpu_map: BootSlice<'m, Option<usize>>,
}

impl<'m> AllocInfo<'m> {
    /// Empty info with room for `nr_groups` groups and `nr_units` units.
    ///
    /// # Errors
    /// When boot memory runs out.
    pub fn new<M: PhysMapper, H: BootmemHooks>(
        bootmem: &mut Bootmem<'m, M, H>,
        nr_groups: usize,
        nr_units: usize,
        nr_cpus: usize,
    ) -> Result<Self, PercpuError> {
        let groups = bootmem.alloc_slice(nr_groups, GroupInfo::default())?;
        let cpu_map = match bootmem.alloc_slice(nr_units, None) {
            Ok(map) => map,
            Err(err) => {
                bootmem.free_slice(groups);
                return Err(err.into());
            }
        };
        Ok(Self {
            static_size: 0,
            reserved_size: 0,
            dyn_size: 0,
            unit_size: 0,
            atom_size: 0,
            alloc_size: 0,
            nr_cpus,
            groups,
            cpu_map,
        })
    }

    #[must_use]
    pub fn nr_groups(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn nr_units(&self) -> usize {
        self.cpu_map.len()
    }

    /// Unit-to-CPU entries of `group`.
    #[must_use]
    pub fn group_cpus(&self, group: usize) -> &[Option<usize>] {
        let gi = self.groups[group];
        &self.cpu_map[gi.first_unit..gi.first_unit + gi.nr_units]
    }

    pub fn group_cpus_mut(&mut self, group: usize) -> &mut [Option<usize>] {
        let gi = self.groups[group];
        &mut self.cpu_map[gi.first_unit..gi.first_unit + gi.nr_units]
    }

    /// Bytes every unit actually uses.
    #[must_use]
    pub const fn size_sum(&self) -> usize {
        self.static_size + self.reserved_size + self.dyn_size
    }

    /// Return the tables to boot memory.
    pub fn free<M: PhysMapper, H: BootmemHooks>(self, bootmem: &mut Bootmem<'m, M, H>) {
        bootmem.free_slice(self.cpu_map);
        bootmem.free_slice(self.groups);
    }
}

impl fmt::Debug for AllocInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocInfo")
            .field("static_size", &self.static_size)
            .field("reserved_size", &self.reserved_size)
            .field("dyn_size", &self.dyn_size)
            .field("unit_size", &self.unit_size)
            .field("atom_size", &self.atom_size)
            .field("alloc_size", &self.alloc_size)
            .field("groups", &&*self.groups)
            .field("cpu_map", &&*self.cpu_map)
            .finish()
    }
}

/// Work out unit size, CPU grouping and units per allocation.
///
/// CPUs further apart than [`LOCAL_DISTANCE`] in either direction end up in
/// different groups. Each group is allocated in pieces of `atom_size`
/// bytes holding as many units as fit without wasting more than a third of
/// the possible CPUs' worth of units.
///
/// # Errors
/// When boot memory runs out.
///
/// # Panics
/// On zero or more than [`NR_CPUS`] possible CPUs, or an `atom_size` that
/// is not a multiple of the page size.
pub fn build_alloc_info<'m, M: PhysMapper, H: BootmemHooks>(
    bootmem: &mut Bootmem<'m, M, H>,
    static_size: usize,
    reserved_size: usize,
    dyn_size: usize,
    atom_size: usize,
    topology: &impl CpuTopology,
) -> Result<AllocInfo<'m>, PercpuError> {
    let nr_cpus = topology.nr_possible_cpus();
    assert!(
        (1..=NR_CPUS).contains(&nr_cpus),
        "percpu: {nr_cpus} possible cpus"
    );
    assert!(
        atom_size != 0 && atom_size.is_multiple_of(PAGE_BYTES),
        "percpu: atom size {atom_size:#x} is not page granular"
    );

    let size_sum = align_up_usize(
        static_size + reserved_size + dyn_size.max(PERCPU_DYNAMIC_EARLY_SIZE),
        PAGE_BYTES,
    );
    let dyn_size = size_sum - static_size - reserved_size;

    // Units per allocation must divide the allocation into whole pages.
    let min_unit_size = size_sum.max(PCPU_MIN_UNIT_SIZE);
    let alloc_size = min_unit_size.next_multiple_of(atom_size);
    let fits = |upa: usize| alloc_size % upa == 0 && (alloc_size / upa) % PAGE_BYTES == 0;
    let mut max_upa = alloc_size / min_unit_size;
    while !fits(max_upa) {
        max_upa -= 1;
    }

    let mut group_of = [0usize; NR_CPUS];
    let mut group_cnt = [0usize; NR_CPUS];
    let mut nr_groups = 1;
    for cpu in 0..nr_cpus {
        let mut group = 0;
        while (0..cpu).any(|tcpu| {
            group_of[tcpu] == group
                && (topology.distance(cpu, tcpu) > LOCAL_DISTANCE
                    || topology.distance(tcpu, cpu) > LOCAL_DISTANCE)
        }) {
            group += 1;
            nr_groups = nr_groups.max(group + 1);
        }
        group_of[cpu] = group;
        group_cnt[group] += 1;
    }
    let group_cnt = &group_cnt[..nr_groups];

    // Fewer allocations win; among equals, fewer units per allocation.
    let mut last_allocs = usize::MAX;
    let mut best_upa = 1;
    for upa in (1..=max_upa).rev().filter(|&upa| fits(upa)) {
        let (allocs, wasted) = group_cnt.iter().fold((0, 0), |(allocs, wasted), &cnt| {
            let this_allocs = cnt.div_ceil(upa);
            (allocs + this_allocs, wasted + this_allocs * upa - cnt)
        });
        if wasted > nr_cpus / 3 {
            continue;
        }
        if allocs > last_allocs {
            break;
        }
        last_allocs = allocs;
        best_upa = upa;
    }
    let upa = best_upa;

    let nr_units = group_cnt.iter().map(|cnt| cnt.next_multiple_of(upa)).sum();
    let mut ai = AllocInfo::new(bootmem, nr_groups, nr_units, nr_cpus)?;
    ai.static_size = static_size;
    ai.reserved_size = reserved_size;
    ai.dyn_size = dyn_size;
    ai.unit_size = alloc_size / upa;
    ai.atom_size = atom_size;
    ai.alloc_size = alloc_size;

    let mut unit = 0;
    for (group, &cnt) in group_cnt.iter().enumerate() {
        let first_unit = unit;
        let members = (0..nr_cpus).filter(|&cpu| group_of[cpu] == group);
        for (slot, cpu) in ai.cpu_map[first_unit..].iter_mut().zip(members) {
            *slot = Some(cpu);
        }
        let nr_units = cnt.next_multiple_of(upa);
        ai.groups[group] = GroupInfo {
            nr_units,
            base_offset: unit * ai.unit_size,
            first_unit,
        };
        unit += nr_units;
    }

    Ok(ai)
}

/// One log line assembled without allocating.
struct LineBuf {
    buf: [u8; 160],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; 160],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    const fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let take = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

const fn decimal_width(mut value: usize) -> usize {
    let mut width = 1;
    while value >= 10 {
        value /= 10;
        width += 1;
    }
    width
}

/// Log `ai` at `level`: a summary line, then the CPUs of every allocation,
/// grouped as `[group] cpu cpu ...` with `--` for unused units.
pub fn dump_alloc_info(level: Level, ai: &AllocInfo<'_>) {
    use fmt::Write;

    const EMPTY: &str = "--------";

    let group_width = decimal_width(ai.nr_groups());
    let cpu_width = decimal_width(ai.nr_cpus).min(EMPTY.len());
    let upa = (ai.alloc_size / ai.unit_size.max(1)).max(1);
    let width = upa * (cpu_width + 1) + group_width + 3;
    let per_line = 1usize << (60 / width).max(1).ilog2();

    log!(
        level,
        "pcpu-alloc: s{} r{} d{} u{} alloc={}*{}",
        ai.static_size,
        ai.reserved_size,
        ai.dyn_size,
        ai.unit_size,
        ai.alloc_size / ai.atom_size.max(1),
        ai.atom_size
    );

    let mut line = LineBuf::new();
    let mut alloc = 0;
    for group in 0..ai.nr_groups() {
        for units in ai.group_cpus(group).chunks(upa) {
            if alloc % per_line == 0 {
                if line.len != 0 {
                    log!(level, "{}", line.as_str().trim_end());
                }
                line.clear();
                let _ = line.write_str("pcpu-alloc: ");
            }
            let _ = write!(line, "[{group:0group_width$}] ");
            for cpu in units {
                let _ = match cpu {
                    Some(cpu) => write!(line, "{cpu:0cpu_width$} "),
                    None => write!(line, "{} ", &EMPTY[..cpu_width]),
                };
            }
            alloc += 1;
        }
    }
    if line.len != 0 {
        log!(level, "{}", line.as_str().trim_end());
    }
}

/// Turn an [`AllocInfo`] and the first chunk's base address into a
/// working allocator.
///
/// The first chunk serves the static image, then the reserved area through
/// a chunk of its own if `reserved_size` is set, then the dynamic area.
/// Its memory must be in place and every unit must hold the static image.
///
/// # Errors
/// When boot memory runs out for the allocator's tables.
///
/// # Panics
/// If `ai` is inconsistent: no groups, an empty static image, a unit too
/// small or not page granular, a CPU mapped twice or not at all.
pub fn setup_first_chunk<'m, M: PhysMapper, H: BootmemHooks, B: PercpuBackend>(
    bootmem: &mut Bootmem<'m, M, H>,
    ai: &AllocInfo<'m>,
    base: VirtualAddress,
    backend: B,
) -> Result<Percpu<'m, B>, PercpuError> {
    macro_rules! setup_bug_on {
        ($cond:expr) => {
            if $cond {
                error!("PERCPU: failed to initialize, {}", stringify!($cond));
                dump_alloc_info(Level::Error, ai);
                panic!("percpu: invalid first chunk layout");
            }
        };
    }

    let size_sum = ai.size_sum();
    setup_bug_on!(ai.nr_groups() == 0);
    setup_bug_on!(ai.nr_cpus == 0 || ai.nr_cpus > NR_CPUS);
    setup_bug_on!(ai.static_size == 0);
    setup_bug_on!(base.is_null());
    setup_bug_on!(ai.unit_size < size_sum);
    setup_bug_on!(!ai.unit_size.is_multiple_of(PAGE_BYTES));
    setup_bug_on!(ai.unit_size < PCPU_MIN_UNIT_SIZE);
    setup_bug_on!(ai.dyn_size < PERCPU_DYNAMIC_EARLY_SIZE);

    let FirstChunkTables {
        mut cpus,
        mut groups,
        slots,
        smap,
        dmap,
    } = FirstChunkTables::alloc(bootmem, ai)?;

    let mut low: Option<(usize, usize)> = None;
    let mut high: Option<(usize, usize)> = None;
    let mut unit = 0;
    for (group, gi) in ai.groups.iter().enumerate() {
        groups[group] = GroupSpan {
            offset: gi.base_offset,
            size: gi.nr_units * ai.unit_size,
        };
        for (i, cpu) in ai.group_cpus(group).iter().enumerate() {
            let Some(cpu) = *cpu else {
                continue;
            };
            setup_bug_on!(cpu >= ai.nr_cpus);
            setup_bug_on!(cpus[cpu].is_some());

            let offset = gi.base_offset + i * ai.unit_size;
            cpus[cpu] = Some(CpuUnit {
                unit: unit + i,
                offset,
            });
            if low.is_none_or(|(_, off)| offset < off) {
                low = Some((cpu, offset));
            }
            if high.is_none_or(|(_, off)| offset > off) {
                high = Some((cpu, offset));
            }
        }
        unit += gi.nr_units;
    }
    setup_bug_on!(cpus.iter().any(Option::is_none));
    let (Some((low_unit_cpu, _)), Some((high_unit_cpu, _))) = (low, high) else {
        unreachable!("percpu: every cpu is mapped");
    };

    dump_alloc_info(Level::Debug, ai);

    let (first, reserved) = if let Some(dmap) = dmap {
        let reserved = AreaMap::new(
            MapStorage::Early(smap.leak()),
            &[Area::Used(ai.static_size), Area::Free(ai.reserved_size)],
        );
        let first = AreaMap::new(
            MapStorage::Early(dmap.leak()),
            &[
                Area::Used(ai.static_size + ai.reserved_size),
                Area::Free(ai.dyn_size),
            ],
        );
        (
            Chunk::immutable(base, first),
            Some(Chunk::immutable(base, reserved)),
        )
    } else {
        let first = AreaMap::new(
            MapStorage::Early(smap.leak()),
            &[Area::Used(ai.static_size), Area::Free(ai.dyn_size)],
        );
        (Chunk::immutable(base, first), None)
    };

    let layout = ChunkLayout {
        unit_size: ai.unit_size,
        nr_units: unit,
        static_size: ai.static_size,
        reserved_size: ai.reserved_size,
        dyn_size: ai.dyn_size,
        cpus: cpus.leak(),
        groups: groups.leak(),
        low_unit_cpu,
        high_unit_cpu,
    };
    let index = ChunkIndex::new(ai.unit_size, slots.leak(), first, reserved);
    Ok(Percpu::new(backend, base, layout, index))
}

/// Boot memory tables the first chunk keeps for good.
struct FirstChunkTables<'m> {
    cpus: BootSlice<'m, Option<CpuUnit>>,
    groups: BootSlice<'m, GroupSpan>,
    slots: BootSlice<'m, SlotList>,
    smap: BootSlice<'m, Area>,
    /// Map of the first chunk's dynamic area, only with a reserved chunk.
    dmap: Option<BootSlice<'m, Area>>,
}

impl<'m> FirstChunkTables<'m> {
    /// Allocate every table, or none of them.
    fn alloc<M: PhysMapper, H: BootmemHooks>(
        bootmem: &mut Bootmem<'m, M, H>,
        ai: &AllocInfo<'_>,
    ) -> Result<Self, PercpuError> {
        let cpus = bootmem.alloc_slice::<Option<CpuUnit>>(ai.nr_cpus, None);
        let groups = bootmem.alloc_slice(ai.nr_groups(), GroupSpan::default());
        let slots = bootmem.alloc_slice(nr_slots(ai.unit_size), SlotList::EMPTY);
        let smap = bootmem.alloc_slice(PERCPU_DYNAMIC_EARLY_SLOTS, Area::EMPTY);
        let dmap = (ai.reserved_size > 0)
            .then(|| bootmem.alloc_slice(PERCPU_DYNAMIC_EARLY_SLOTS, Area::EMPTY))
            .transpose();

        let err = cpus
            .as_ref()
            .err()
            .or(groups.as_ref().err())
            .or(slots.as_ref().err())
            .or(smap.as_ref().err())
            .or(dmap.as_ref().err())
            .copied();
        match (cpus, groups, slots, smap, dmap) {
            (Ok(cpus), Ok(groups), Ok(slots), Ok(smap), Ok(dmap)) => Ok(Self {
                cpus,
                groups,
                slots,
                smap,
                dmap,
            }),
            (cpus, groups, slots, smap, dmap) => {
                if let Ok(cpus) = cpus {
                    bootmem.free_slice(cpus);
                }
                if let Ok(groups) = groups {
                    bootmem.free_slice(groups);
                }
                if let Ok(slots) = slots {
                    bootmem.free_slice(slots);
                }
                if let Ok(smap) = smap {
                    bootmem.free_slice(smap);
                }
                if let Ok(Some(dmap)) = dmap {
                    bootmem.free_slice(dmap);
                }
                Err(err.map_or(PercpuError::OutOfMemory, PercpuError::from))
            }
        }
    }
}

fn alloc_group<M: PhysMapper, H: BootmemHooks>(
    bootmem: &mut Bootmem<'_, M, H>,
    topology: &impl CpuTopology,
    cpu: usize,
    size: usize,
    align: usize,
) -> Result<NonNull<u8>, PercpuError> {
    let goal = Some(PhysicalAddress::new(MAX_DMA_ADDRESS));
    let node: Option<NodeId> = topology.node_of(cpu);
    let result = match node {
        Some(nid) if bootmem.node(nid).is_some() => {
            bootmem.alloc_node_nopanic(nid, size as u64, align as u64, goal)
        }
        Some(nid) => {
            info!("cpu {cpu} has no node {nid} or node-local memory");
            bootmem.alloc(size as u64, align as u64, goal)
        }
        None => bootmem.alloc(size as u64, align as u64, goal),
    };
    result.map_err(PercpuError::from)
}

/// Embed the first chunk in boot memory.
///
/// Each group gets one contiguous, `atom_size` aligned allocation, close to
/// its CPUs' node when the topology says where that is. Every used unit
/// receives a copy of `static_image`; unused units and the unused tail of
/// every unit go back to boot memory.
///
/// # Errors
/// When boot memory runs out. Everything allocated so far is returned.
pub fn embed_first_chunk<'m, M: PhysMapper, H: BootmemHooks, B: PercpuBackend>(
    bootmem: &mut Bootmem<'m, M, H>,
    static_image: &[u8],
    reserved_size: usize,
    dyn_size: usize,
    atom_size: usize,
    topology: &impl CpuTopology,
    backend: B,
) -> Result<Percpu<'m, B>, PercpuError> {
    let mut ai = build_alloc_info(
        bootmem,
        static_image.len(),
        reserved_size,
        dyn_size,
        atom_size,
        topology,
    )?;
    let base = match embed_groups(bootmem, &mut ai, static_image, topology) {
        Ok(base) => base,
        Err(err) => {
            ai.free(bootmem);
            return Err(err);
        }
    };

    info!(
        "PERCPU: Embedded {} pages/cpu @{:p} s{} r{} d{} u{}",
        ai.size_sum() >> PAGE_SHIFT,
        base,
        ai.static_size,
        ai.reserved_size,
        ai.dyn_size,
        ai.unit_size
    );

    let percpu = setup_first_chunk(bootmem, &ai, base, backend);
    if percpu.is_err() {
        free_groups(bootmem, &ai, base);
    }
    ai.free(bootmem);
    percpu
}

/// Give back what [`embed_groups`] kept of the groups at `base`: the used
/// part of every unit that serves a CPU.
fn free_groups<M: PhysMapper, H: BootmemHooks>(
    bootmem: &mut Bootmem<'_, M, H>,
    ai: &AllocInfo<'_>,
    base: VirtualAddress,
) {
    let mapper = bootmem.mapper();
    let size_sum = ai.size_sum();
    for (group, gi) in ai.groups.iter().enumerate() {
        let area = base.byte_add(gi.base_offset);
        let Some(ptr) = NonNull::new(area.as_mut_ptr::<u8>()) else {
            continue;
        };
        let phys = mapper.virt_to_phys(ptr);
        for (i, cpu) in ai.group_cpus(group).iter().enumerate() {
            if cpu.is_some() {
                bootmem.free(phys + (i * ai.unit_size) as u64, size_sum as u64);
            }
        }
    }
}

/// Allocate and fill the groups of `ai`, set their base offsets and return
/// the chunk base.
fn embed_groups<M: PhysMapper, H: BootmemHooks>(
    bootmem: &mut Bootmem<'_, M, H>,
    ai: &mut AllocInfo<'_>,
    static_image: &[u8],
    topology: &impl CpuTopology,
) -> Result<VirtualAddress, PercpuError> {
    let mapper = bootmem.mapper();
    let mut areas = bootmem.alloc_slice::<Option<NonNull<u8>>>(ai.nr_groups(), None)?;

    for group in 0..ai.nr_groups() {
        let Some(cpu) = ai.group_cpus(group).iter().find_map(|cpu| *cpu) else {
            panic!("percpu: group {group} serves no cpu");
        };
        let size = ai.groups[group].nr_units * ai.unit_size;
        match alloc_group(bootmem, topology, cpu, size, ai.atom_size) {
            Ok(ptr) => areas[group] = Some(ptr),
            Err(err) => {
                for (group, ptr) in areas.iter().enumerate() {
                    if let Some(ptr) = ptr {
                        let size = ai.groups[group].nr_units * ai.unit_size;
                        bootmem.free(mapper.virt_to_phys(*ptr), size as u64);
                    }
                }
                bootmem.free_slice(areas);
                return Err(err);
            }
        }
    }

    let size_sum = ai.size_sum();
    let mut base: Option<VirtualAddress> = None;
    for (group, ptr) in areas.iter().enumerate() {
        let Some(ptr) = *ptr else {
            unreachable!("percpu: group {group} was allocated");
        };
        let area = VirtualAddress::from_nonnull(ptr);
        let phys = mapper.virt_to_phys(ptr);
        base = Some(base.map_or(area, |base| base.min(area)));

        for (i, cpu) in ai.group_cpus(group).iter().enumerate() {
            let offset = i * ai.unit_size;
            let unit_phys = phys + offset as u64;
            if cpu.is_none() {
                bootmem.free(unit_phys, ai.unit_size as u64);
                continue;
            }
            // SAFETY: the unit lies inside the group allocation, which is
            // ours and at least `size_sum` bytes per unit.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    static_image.as_ptr(),
                    area.byte_add(offset).as_mut_ptr::<u8>(),
                    static_image.len(),
                );
            }
            bootmem.free(
                unit_phys + size_sum as u64,
                (ai.unit_size - size_sum) as u64,
            );
        }
    }
    let Some(base) = base else {
        unreachable!("percpu: at least one group");
    };

    let mut max_distance = 0;
    for (group, ptr) in areas.iter().enumerate() {
        let Some(ptr) = *ptr else {
            continue;
        };
        let offset = VirtualAddress::from_nonnull(ptr).offset_from(base);
        ai.groups[group].base_offset = offset;
        max_distance = max_distance.max(offset);
    }
    max_distance += ai.unit_size;
    if max_distance as u64 > VMALLOC_SIZE / 4 * 3 {
        warn!(
            "PERCPU: max_distance={max_distance:#x} too large for vmalloc space {VMALLOC_SIZE:#x}"
        );
    }

    bootmem.free_slice(areas);
    Ok(base)
}

/// Set up the per-CPU areas the generic way: an embedded first chunk of
/// page-sized atoms with the default reserved and dynamic sizes.
///
/// # Panics
/// When the first chunk cannot be built.
pub fn setup_per_cpu_areas<'m, M: PhysMapper, H: BootmemHooks, B: PercpuBackend>(
    bootmem: &mut Bootmem<'m, M, H>,
    static_image: &[u8],
    topology: &impl CpuTopology,
    backend: B,
    kind: FirstChunkKind,
) -> Percpu<'m, B> {
    if kind == FirstChunkKind::Page {
        info!(
            "PERCPU: {} first chunk is not supported, using embed",
            kind.as_str()
        );
    }

    match embed_first_chunk(
        bootmem,
        static_image,
        PERCPU_MODULE_RESERVE,
        PERCPU_DYNAMIC_RESERVE,
        PAGE_BYTES,
        topology,
        backend,
    ) {
        Ok(percpu) => percpu,
        Err(err) => {
            error!("PERCPU: embed allocator failed: {err}");
            panic!("Failed to initialize percpu areas.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_widths() {
        assert_eq!(decimal_width(0), 1);
        assert_eq!(decimal_width(9), 1);
        assert_eq!(decimal_width(10), 2);
        assert_eq!(decimal_width(64), 2);
        assert_eq!(decimal_width(100), 3);
    }

    #[test]
    fn line_buffer_truncates() {
        use fmt::Write;

        let mut line = LineBuf::new();
        for _ in 0..40 {
            write!(line, "[{:02}] ", 7).unwrap();
        }
        assert_eq!(line.as_str().len(), 160);
        assert!(line.as_str().starts_with("[07] [07] "));
        line.clear();
        assert_eq!(line.as_str(), "");
    }
}
