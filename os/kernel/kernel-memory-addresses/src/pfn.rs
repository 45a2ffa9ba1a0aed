use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Page frame number: a physical address divided by [`PAGE_SIZE`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame containing `pa` (rounds down).
    #[inline]
    #[must_use]
    pub const fn down(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    /// First frame starting at or after `pa` (rounds up).
    #[inline]
    #[must_use]
    pub const fn up(pa: PhysicalAddress) -> Self {
        Self((pa.as_u64() + PAGE_SIZE - 1) >> PAGE_SHIFT)
    }

    /// Physical address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn phys(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    /// Whether the frame number is a multiple of `frames` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, frames: u64) -> bool {
        self.0 & (frames - 1) == 0
    }

    /// Round up to a multiple of `frames` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, frames: u64) -> Self {
        Self(crate::align_up(self.0, frames))
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Pfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Pfn {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}
