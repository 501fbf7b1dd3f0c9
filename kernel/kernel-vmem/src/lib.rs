//! # Virtual Address Space Management
//!
//! Builds and walks the four-level page-table trees that define every
//! address space on this machine.
//!
//! ## Virtual address walk
//!
//! Each virtual address divides into four 9-bit table indices plus a 12-bit
//! page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  lvl0 |  lvl1 |  lvl2 |  lvl3 | offset |
//! ```
//!
//! Every node occupies exactly one physical page and holds 512 entries of
//! eight bytes; nodes reference each other by *page number*, never by
//! pointer, and all node storage lives inside the
//! [`PhysicalMemory`](kernel_alloc::PhysicalMemory) arena.
//!
//! ## Permissions
//!
//! An entry carries three capability bits (present, writable,
//! user-accessible), modeled as the typed set [`PagePerms`]. A lookup
//! composes permissions by **set intersection** across all four levels: a
//! page is only as accessible as its least permissive ancestor.
//!
//! ## Ownership
//!
//! Interior nodes are allocated lazily during [`AddressSpace::map`] with the
//! owning space's page owner, so every node page's record satisfies the
//! system-wide rule: refcount 1, owner equal to the space's owner (the
//! kernel root follows the boot-sharing rule checked by the kernel's
//! invariant checker).

#![cfg_attr(not(test), no_std)]

mod entry;
mod space;
mod table;

pub use entry::{PageEntryBits, PagePerms};
pub use space::{ActivateError, AddressSpace, MapError, Mapping};
pub use table::PageTableNode;
