//! # Physical memory access for the boot allocator
//!
//! The boot allocator tracks *physical* frames but has to write into them:
//! its own bitmaps live in frames it was handed, and every allocation is
//! zero-filled before it is returned. [`PhysMapper`] abstracts how a
//! physical address becomes a pointer, so the same allocator runs on top of
//! the kernel's higher-half direct map and on top of a plain heap arena in
//! tests.
//!
//! ## HHDM
//! With a higher-half direct map, every physical address is visible at
//! `offset + pa`. [`HhdmPhysMapper`] implements exactly that; the kernel uses
//! [`HhdmPhysMapper::kernel`], tests pick an offset that lands inside their
//! arena.

use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Translation between physical addresses and usable pointers.
///
/// # Safety
/// Implementors guarantee, for as long as the mapper is borrowed by the boot
/// allocator, that every physical address inside a registered node maps to
/// valid, writable memory that nothing else accesses except through
/// allocations handed out by that allocator, and that
/// [`virt_to_phys`](Self::virt_to_phys) inverts
/// [`phys_to_virt`](Self::phys_to_virt).
pub unsafe trait PhysMapper {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u8>;

    fn virt_to_phys(&self, va: NonNull<u8>) -> PhysicalAddress;
}

/// [`PhysMapper`] for a linear map at a fixed offset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// Mapper for the kernel's direct map at [`HHDM_BASE`].
    ///
    /// # Safety
    /// The direct map must be installed and cover all registered nodes.
    #[must_use]
    pub const unsafe fn kernel() -> Self {
        Self { offset: HHDM_BASE }
    }

    /// Mapper for memory visible at `pa + offset` (wrapping).
    ///
    /// # Safety
    /// Every physical address later handed to the boot allocator must be
    /// backed by valid, exclusively owned memory at `pa + offset`.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

unsafe impl PhysMapper for HhdmPhysMapper {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let va = VirtualAddress::new(pa.as_u64().wrapping_add(self.offset));
        match NonNull::new(va.as_mut_ptr()) {
            Some(ptr) => ptr,
            None => panic!("bootmem: {pa:?} maps to a null pointer"),
        }
    }

    fn virt_to_phys(&self, va: NonNull<u8>) -> PhysicalAddress {
        let va = VirtualAddress::from_nonnull(va);
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}
