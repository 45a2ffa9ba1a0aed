//! # Memory Layout

use kernel_memory_addresses::{PAGE_BYTES, PAGE_SHIFT, PAGE_SIZE};

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Size of the kernel's vmalloc window. Per-CPU first chunk groups that
/// spread further apart than three quarters of it cannot be mirrored there.
pub const VMALLOC_SIZE: u64 = 32 << 40; // 32 TiB

/// Highest number of memory nodes the boot memory allocator tracks.
pub const MAX_NUMNODES: usize = 8;

/// Highest number of possible CPUs.
pub const NR_CPUS: usize = 64;

/// Cache line size; the default alignment of boot allocations.
pub const SMP_CACHE_BYTES: u64 = 64;

/// End of the legacy ISA DMA zone (physical).
pub const MAX_DMA_ADDRESS: u64 = 16 << 20; // 16 MiB

/// First frame above the 32-bit DMA zone.
pub const MAX_DMA32_PFN: u64 = (4 << 30) >> PAGE_SHIFT;

/// Exclusive upper bound for "low" boot allocations.
pub const ARCH_LOW_ADDRESS_LIMIT: u64 = 0xffff_ffff;

/// Smallest per-CPU unit; also the largest single per-CPU allocation.
pub const PCPU_MIN_UNIT_SIZE: usize = 32 << 10;

/// Capacity of the area maps the first chunk starts out with.
pub const PERCPU_DYNAMIC_EARLY_SLOTS: usize = 128;

/// Dynamic area every first chunk must provide before late init.
pub const PERCPU_DYNAMIC_EARLY_SIZE: usize = 12 << 10;

/// Reserved area set aside for module static per-CPU data.
pub const PERCPU_MODULE_RESERVE: usize = 8 << 10;

/// Dynamic area requested by the generic setup path.
pub const PERCPU_DYNAMIC_RESERVE: usize = 20 << 10;

/// CPU distance at or below which two CPUs share a per-CPU group.
pub const LOCAL_DISTANCE: u32 = 10;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(SMP_CACHE_BYTES.is_power_of_two());
    assert!(MAX_NUMNODES > 0 && MAX_NUMNODES <= 256);
    assert!(NR_CPUS > 0 && NR_CPUS <= 4096);
    assert!(MAX_DMA_ADDRESS.is_multiple_of(PAGE_SIZE));
    assert!(PCPU_MIN_UNIT_SIZE.is_multiple_of(PAGE_BYTES));
    assert!(PERCPU_DYNAMIC_EARLY_SIZE <= PERCPU_DYNAMIC_RESERVE);
    assert!(PERCPU_DYNAMIC_EARLY_SLOTS >= 4);
};
