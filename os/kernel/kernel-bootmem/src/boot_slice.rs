//! Typed tables carved out of boot memory.

use crate::phys_mapper::PhysMapper;
use crate::{Bootmem, BootmemError, BootmemHooks};
use core::ops::{Deref, DerefMut};
use kernel_info::memory::{MAX_DMA_ADDRESS, SMP_CACHE_BYTES};
use kernel_memory_addresses::PhysicalAddress;

/// A slice living in boot memory.
///
/// Dropping it keeps the memory reserved; hand it back with
/// [`Bootmem::free_slice`] or keep it for good with [`BootSlice::leak`].
pub struct BootSlice<'m, T> {
    data: &'m mut [T],
    phys: PhysicalAddress,
    bytes: u64,
}

impl<'m, T> BootSlice<'m, T> {
    /// Physical address of the first element.
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    /// Give up the ability to free the slice.
    #[must_use]
    pub fn leak(self) -> &'m mut [T] {
        self.data
    }
}

impl<T> Deref for BootSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T> DerefMut for BootSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for BootSlice<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootSlice")
            .field("phys", &self.phys)
            .field("data", &self.data)
            .finish()
    }
}

impl<'m, M: PhysMapper, H: BootmemHooks> Bootmem<'m, M, H> {
    /// Allocate `len` elements, each initialized to `fill`, cache-line
    /// aligned and preferably above the ISA DMA zone.
    ///
    /// # Errors
    /// [`BootmemError::OutOfMemory`] when no node can hold the table.
    pub fn alloc_slice<T: Copy>(
        &mut self,
        len: usize,
        fill: T,
    ) -> Result<BootSlice<'m, T>, BootmemError> {
        const {
            assert!(align_of::<T>() as u64 <= SMP_CACHE_BYTES);
        }

        let bytes = (len * size_of::<T>()).max(1) as u64;
        let ptr = self.alloc(
            bytes,
            SMP_CACHE_BYTES,
            Some(PhysicalAddress::new(MAX_DMA_ADDRESS)),
        )?;
        let phys = self.mapper().virt_to_phys(ptr);

        let base = ptr.cast::<T>().as_ptr();
        // SAFETY: the region is reserved for us, large enough for `len`
        // elements and cache-line aligned, which covers `T`.
        let data = unsafe {
            for i in 0..len {
                base.add(i).write(fill);
            }
            core::slice::from_raw_parts_mut(base, len)
        };

        Ok(BootSlice { data, phys, bytes })
    }

    /// Return a slice's memory to the boot allocator.
    pub fn free_slice<T>(&mut self, slice: BootSlice<'m, T>) {
        self.free(slice.phys, slice.bytes);
    }
}
