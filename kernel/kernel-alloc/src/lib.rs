//! # Physical Page Allocator
//!
//! Tracks the owner and reference count of every physical page, and owns the
//! page arena itself. One [`PageInfo`] record exists per physical page; the
//! record table is the single source of truth for who may use a page.
//!
//! ## Ownership model
//!
//! - `refcount == 0` exactly when `owner == Free`.
//! - A page is *shared* (`refcount > 1`) only when several address spaces
//!   intentionally reference the same content (read-only pages after a
//!   fork, the console cells). Every other page has exactly one owner.
//! - [`PhysicalMemory::reserve`] is the sole admission point: it rejects
//!   misaligned, out-of-range, and already-owned pages without side effects.
//! - Refcount misuse (releasing a free page, retaining a free page) means
//!   the memory model is already corrupt; those paths panic rather than
//!   limp on.
//!
//! The arena is plain bytes. Page-table nodes, process memory, and console
//! cells all live inside it, so byte-level accessors
//! ([`read_u64`](PhysicalMemory::read_u64), [`copy_page`](PhysicalMemory::copy_page),
//! ...) double as this machine's memory bus.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod phys;

pub use phys::{PageInfo, PageOwner, PhysicalMemory, Pid, ReserveError};
