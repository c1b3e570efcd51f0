//! Lock primitives for the memory management crates.
//!
//! Every lock here can be taken in two ways: [`SpinMutex::lock`] spins until the
//! lock is free, and [`SpinMutex::try_lock`] gives up at once and returns `None`.
//! Paths that must never stall (page reclaim) use only the latter.

#![cfg_attr(not(test), no_std)]

mod mutex;

pub use mutex::{MutexSupport, Spin, SpinLock, SpinMutex, SpinNoIrq, SpinNoIrqLock};
