//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for raw addresses and page frame numbers used by
//! the early boot allocators.
//!
//! ## Overview
//!
//! The boot memory allocator thinks in *page frames*, the per-CPU allocator
//! thinks in *virtual addresses*, and both have to hand addresses to the
//! other side of a physical mapper. Mixing these up is the classic source of
//! off-by-a-mapping bugs, so every kind gets its own zero-cost type:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`VirtualAddress`] | A byte address in the current address space. |
//! | [`Pfn`] | A page frame number, i.e. `PhysicalAddress >> PAGE_SHIFT`. |
//!
//! Conversions between physical addresses and frames are explicit and come
//! in rounding-up and rounding-down flavors ([`Pfn::up`], [`Pfn::down`]),
//! matching how reservations (round outward) and frees (round inward) treat
//! partial pages.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_0042);
//! assert_eq!(Pfn::down(pa), Pfn::new(0x100));
//! assert_eq!(Pfn::up(pa), Pfn::new(0x101));
//! assert_eq!(Pfn::new(0x100).phys(), PhysicalAddress::new(0x0010_0000));
//!
//! assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
//! assert_eq!(page_align(1), PAGE_SIZE);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`.
//! - All conversions are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod pfn;
mod physical_address;
mod virtual_address;

pub use pfn::Pfn;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] for in-memory sizes and offsets.
pub const PAGE_BYTES: usize = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Round a byte count up to whole pages.
#[inline]
#[must_use]
pub const fn page_align(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE)
}

/// Number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// `usize` flavor of [`align_up`] for in-memory sizes and offsets.
#[inline]
#[must_use]
pub const fn align_up_usize(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up_usize(100, 16), 112);
        assert_eq!(page_align(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(5000), 2);
    }

    #[test]
    fn pfn_rounding() {
        let pa = PhysicalAddress::new(3 * PAGE_SIZE + 7);
        assert_eq!(Pfn::down(pa).as_u64(), 3);
        assert_eq!(Pfn::up(pa).as_u64(), 4);

        let aligned = PhysicalAddress::new(5 * PAGE_SIZE);
        assert_eq!(Pfn::down(aligned), Pfn::up(aligned));
        assert_eq!(Pfn::down(aligned).phys(), aligned);
    }

    #[test]
    fn pfn_arithmetic() {
        let a = Pfn::new(10);
        assert_eq!(a + 5, Pfn::new(15));
        assert_eq!(Pfn::new(15) - a, 5);
        assert!(Pfn::new(64).is_aligned(64));
        assert!(!Pfn::new(65).is_aligned(64));
        assert_eq!(Pfn::new(65).align_up(64), Pfn::new(128));
    }

    #[test]
    fn virtual_address_offsets() {
        let va = VirtualAddress::new(0xFFFF_8880_0000_1000);
        assert_eq!(va.byte_add(0x20).as_u64(), 0xFFFF_8880_0000_1020);
        assert_eq!(va.byte_add(0x20).offset_from(va), 0x20);
    }

    #[test]
    fn debug_formatting() {
        let pa = PhysicalAddress::new(0x1000);
        let va = VirtualAddress::new(0x2000);
        assert_eq!(format!("{pa:?}"), "PA(0x0000000000001000)");
        assert_eq!(format!("{va:?}"), "VA(0x0000000000002000)");
        assert_eq!(format!("{:?}", Pfn::new(0x42)), "PFN(0x42)");
    }

    #[test]
    fn pointer_round_trip() {
        let value = 7u32;
        let va = VirtualAddress::from_ptr(&raw const value);
        assert_eq!(va.as_ptr::<u32>(), &raw const value);
    }
}
