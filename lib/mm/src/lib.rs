//! Memory management with reverse mapping of physical pages.
//!
//! Address spaces map files and anonymous memory through VMAs and a page
//! table. Every mapped page can be traced back to the page table entries
//! mapping it through the [`rmap`] module, which page reclaim uses to age
//! pages and to unmap them from every address space.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address;
pub mod mapping;
pub mod page;
pub mod rmap;
pub mod vm;

pub use rmap::{
    SwapResult, page_add_anon_rmap, page_add_file_rmap, page_referenced, page_remove_rmap,
    try_to_unmap,
};
