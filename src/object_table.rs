// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Persistent object-naming table. Storage is a distributed array: every
// chunk on the `next_ot_chunk` chain carries a strip of 63 inline slots,
// so total capacity is 63 × (chain length). When the append cursor hits
// the capacity, a fresh arena chunk is installed and linked onto the
// chain tail — its strip starts all-zero, so a torn link never exposes a
// live-looking slot.
//
// The volatile side is an id → entry map plus a bounded lock-free ring of
// freed slot indices; insertion drains the ring before advancing the
// append cursor.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::arena::Arena;
use crate::error::Error;
use crate::heap::Shared;
use crate::layout::{
    OtSlot, MAX_ID_LEN, OT_SLOTS_PER_CHUNK, SLOT_RING_CAPACITY, STATE_INITIALIZED,
};
use crate::persist;

/// Volatile binding of one named object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OtEntry {
    /// Index into the distributed slot array.
    pub(crate) slot: u64,
    /// Offset of the named object's payload.
    pub(crate) data: u64,
}

pub(crate) struct ObjectTable {
    map: DashMap<String, OtEntry>,
    ring: ArrayQueue<u64>,
    next_slot: AtomicU64,
    capacity: AtomicU64,
    /// Chunks on the OT chain, walk order. Grows, never shrinks.
    chunks: RwLock<Vec<u64>>,
}

impl ObjectTable {
    /// Walk the `next_ot_chunk` chain starting at chunk 0 and size the
    /// table accordingly.
    pub(crate) fn new(sh: &Shared) -> Self {
        let mut chunks = Vec::new();
        let mut off = 0u64;
        loop {
            chunks.push(off);
            let next = unsafe { (*sh.chunk_header(off)).next_ot_chunk };
            if next == 0 {
                break;
            }
            off = next;
        }
        let capacity = (chunks.len() * OT_SLOTS_PER_CHUNK) as u64;
        Self {
            map: DashMap::new(),
            ring: ArrayQueue::new(SLOT_RING_CAPACITY),
            next_slot: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity),
            chunks: RwLock::new(chunks),
        }
    }

    /// Pointer to the persistent slot record for `slot`.
    pub(crate) unsafe fn slot_ptr(&self, sh: &Shared, slot: u64) -> *mut OtSlot {
        let chunk = self.chunks.read()[(slot as usize) / OT_SLOTS_PER_CHUNK];
        let hdr = sh.chunk_header(chunk);
        ptr::addr_of_mut!((*hdr).object_table[(slot as usize) % OT_SLOTS_PER_CHUNK])
    }

    pub(crate) fn get(&self, id: &str) -> Option<OtEntry> {
        self.map.get(id).map(|e| *e)
    }

    /// Bind `id` to the entry produced by `make`, failing without side
    /// effects when the id is already taken.
    pub(crate) fn try_bind(
        &self,
        id: &str,
        make: impl FnOnce() -> Result<OtEntry, Error>,
    ) -> Result<OtEntry, Error> {
        match self.map.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateName(id.to_string())),
            Entry::Vacant(v) => {
                let entry = make()?;
                v.insert(entry);
                Ok(entry)
            }
        }
    }

    /// Claim a slot index: a recycled one when available, otherwise the
    /// append cursor, growing the chain when the cursor runs off the end.
    pub(crate) fn acquire_slot(&self, sh: &Shared, grow_arena: &Arena) -> Result<u64, Error> {
        loop {
            if let Some(slot) = self.ring.pop() {
                return Ok(slot);
            }
            let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
            if slot < self.capacity.load(Ordering::SeqCst) {
                return Ok(slot);
            }
            self.next_slot.fetch_sub(1, Ordering::SeqCst);
            self.grow(sh, grow_arena)?;
        }
    }

    /// Extend the chain by one chunk. The chunk joins `grow_arena`'s chain
    /// first (fully initialized), then the OT link is persisted.
    fn grow(&self, sh: &Shared, grow_arena: &Arena) -> Result<(), Error> {
        let mut chunks = self.chunks.write();
        if self.next_slot.load(Ordering::SeqCst) < self.capacity.load(Ordering::SeqCst) {
            return Ok(()); // another thread grew while we waited
        }
        let new_off = grow_arena.grow_for_table(sh)?;
        let last = *chunks.last().expect("chain holds at least chunk 0");
        unsafe {
            let prev = sh.chunk_header(last);
            (*prev).next_ot_chunk = new_off;
            persist::persist(ptr::addr_of!((*prev).next_ot_chunk));
        }
        chunks.push(new_off);
        self.capacity
            .fetch_add(OT_SLOTS_PER_CHUNK as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the volatile binding and recycle its slot.
    pub(crate) fn remove(&self, id: &str) -> Option<OtEntry> {
        let (_, entry) = self.map.remove(id)?;
        if self.ring.push(entry.slot).is_err() {
            warn!(
                slot = entry.slot,
                "freed-slot ring full; slot parked until restart"
            );
        }
        Some(entry)
    }

    /// Rebuild the volatile map from the persistent strips. Slots below
    /// the highest live index that are not INITIALIZED go back on the
    /// ring; the append cursor resumes just past the highest live slot.
    pub(crate) unsafe fn recover(&self, sh: &Shared) {
        let mut live_slots = HashSet::new();
        let mut highest: Option<u64> = None;

        let chunks = self.chunks.read().clone();
        let mut slot = 0u64;
        for &chunk in &chunks {
            let hdr = sh.chunk_header(chunk);
            for i in 0..OT_SLOTS_PER_CHUNK {
                let rec = ptr::addr_of!((*hdr).object_table[i]);
                if (*rec).state == STATE_INITIALIZED {
                    let id_bytes = &(*rec).id;
                    let len = id_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_ID_LEN);
                    let id = String::from_utf8_lossy(&id_bytes[..len]).into_owned();
                    self.map.insert(
                        id,
                        OtEntry {
                            slot,
                            data: (*rec).data,
                        },
                    );
                    live_slots.insert(slot);
                    highest = Some(slot);
                }
                slot += 1;
            }
        }

        let next = highest.map_or(0, |h| h + 1);
        self.next_slot.store(next, Ordering::SeqCst);

        for gap in 0..next {
            if !live_slots.contains(&gap) && self.ring.push(gap).is_err() {
                break;
            }
        }
    }
}
