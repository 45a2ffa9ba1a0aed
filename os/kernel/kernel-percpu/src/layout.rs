//! Geometry shared by every chunk.

use kernel_memory_addresses::PAGE_SHIFT;

/// Where a CPU's unit sits within every chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CpuUnit {
    /// Global unit index.
    pub unit: usize,
    /// Byte offset of the unit from the chunk base.
    pub offset: usize,
}

/// One group's contiguous range of units within a chunk.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct GroupSpan {
    pub offset: usize,
    pub size: usize,
}

/// Unit geometry fixed when the first chunk is set up.
///
/// A chunk consists of one unit per CPU, laid out in groups; a unit of
/// CPU `c` starts `cpu_unit(c).offset` bytes into the chunk.
#[derive(Debug, Clone)]
pub struct ChunkLayout<'m> {
    pub(crate) unit_size: usize,
    pub(crate) nr_units: usize,
    pub(crate) static_size: usize,
    pub(crate) reserved_size: usize,
    pub(crate) dyn_size: usize,
    pub(crate) cpus: &'m [Option<CpuUnit>],
    pub(crate) groups: &'m [GroupSpan],
    pub(crate) low_unit_cpu: usize,
    pub(crate) high_unit_cpu: usize,
}

impl ChunkLayout<'_> {
    #[must_use]
    pub const fn unit_size(&self) -> usize {
        self.unit_size
    }

    #[must_use]
    pub const fn unit_pages(&self) -> usize {
        self.unit_size >> PAGE_SHIFT
    }

    /// Units per chunk, including those no CPU uses.
    #[must_use]
    pub const fn nr_units(&self) -> usize {
        self.nr_units
    }

    #[must_use]
    pub const fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub const fn static_size(&self) -> usize {
        self.static_size
    }

    #[must_use]
    pub const fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    #[must_use]
    pub const fn dyn_size(&self) -> usize {
        self.dyn_size
    }

    /// End of the reserved area within the first chunk's units, or zero
    /// without a reserved chunk.
    #[must_use]
    pub const fn reserved_limit(&self) -> usize {
        if self.reserved_size == 0 {
            0
        } else {
            self.static_size + self.reserved_size
        }
    }

    #[must_use]
    pub fn cpu_unit(&self, cpu: usize) -> Option<CpuUnit> {
        self.cpus.get(cpu).copied().flatten()
    }

    /// Byte offset of `cpu`'s unit.
    ///
    /// # Panics
    /// If `cpu` is not a possible CPU.
    #[must_use]
    pub fn unit_offset(&self, cpu: usize) -> usize {
        match self.cpu_unit(cpu) {
            Some(unit) => unit.offset,
            None => panic!("percpu: cpu {cpu} is not possible"),
        }
    }

    /// `(cpu, unit offset)` for every possible CPU.
    pub fn unit_offsets(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cpus
            .iter()
            .enumerate()
            .filter_map(|(cpu, unit)| Some((cpu, unit.as_ref()?.offset)))
    }

    #[must_use]
    pub const fn groups(&self) -> &[GroupSpan] {
        self.groups
    }

    /// Bytes a chunk spans from its base to the end of the last group.
    #[must_use]
    pub fn span(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.offset + g.size)
            .max()
            .unwrap_or(0)
    }

    /// CPU whose unit sits lowest in a chunk.
    #[must_use]
    pub const fn low_unit_cpu(&self) -> usize {
        self.low_unit_cpu
    }

    /// CPU whose unit sits highest in a chunk.
    #[must_use]
    pub const fn high_unit_cpu(&self) -> usize {
        self.high_unit_cpu
    }
}
