//! # Kernel synchronization primitives
//!
//! One generic [`Mutex`] parameterized over a raw lock strategy:
//!
//! * [`RawSpin`]: test-and-test-and-set spin lock. Short critical sections
//!   that must never block, e.g. allocator index structures touched from
//!   the free path.
//! * [`RawTicket`]: FIFO ticket lock. Longer, serialized sections where
//!   fairness between waiters matters, e.g. a whole allocation attempt.
//!
//! The aliases [`SpinLock`] and [`TicketMutex`] pick the strategy.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;

pub type SpinLock<T> = Mutex<T, RawSpin>;
pub type SpinLockGuard<'a, T> = MutexGuard<'a, T, RawSpin>;

pub type TicketMutex<T> = Mutex<T, RawTicket>;
pub type TicketMutexGuard<'a, T> = MutexGuard<'a, T, RawTicket>;

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Only the current holder may unlock.
    unsafe fn raw_unlock(&self);
}
