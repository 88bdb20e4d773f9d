// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Failure-atomic allocator for byte-addressable non-volatile memory.
//
// The store is a file-backed mapping carved into 2 MiB chunks. Small
// objects come from slab runs inside per-arena bins, mid-size objects
// from a page-granular block allocator, and anything larger takes whole
// chunks. Every allocation follows a two-phase reserve → activate
// protocol whose flush/fence ordering guarantees that after a crash each
// object is either fully allocated or not allocated, and that up to two
// pointer stores splice in (or out) atomically with the state change.

pub mod layout;

mod persist;
pub use persist::{persist_range, round_up, sfence};

mod error;
pub use error::Error;

mod sync;

mod chunk_map;

mod arena;

mod huge;

mod object_table;

mod heap;
pub use heap::{Heap, HeapOptions, Link};
