//! Types shared by the memory management crates: the errno-style error type and
//! the flags accepted by `mmap`-like interfaces.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod memory_flags;

pub use error::{SysError, SysResult};
