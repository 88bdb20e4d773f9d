// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Huge allocator: requests above SCLASS_LARGE_MAX take whole chunks.
// A global size-keyed index of free regions serves best-fit reuse; larger
// regions are split from the high end so the remainder keeps its header.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::error::Error;
use crate::heap::{apply_link_stores, Shared};
use crate::layout::{
    tag, PtrPair, CHUNK_SIZE, HEADER_SIZE, STATE_FREEING, STATE_INITIALIZED, STATE_INITIALIZING,
    USAGE_FREE, USAGE_HUGE,
};
use crate::persist;
use crate::sync::tag_ref;

pub(crate) struct HugeIndex {
    /// Free regions keyed by (n_chunks, offset); range scan = best fit.
    free: Mutex<BTreeMap<(u64, u64), ()>>,
}

impl HugeIndex {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whole chunks needed for `n_bytes` of payload plus the huge header.
    pub(crate) fn chunks_for(n_bytes: u64) -> u64 {
        (n_bytes + HEADER_SIZE as u64 + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64
    }

    /// Reserve a huge region; returns the payload offset (header + 64).
    /// The region stays out of the INITIALIZED usage until activated.
    pub(crate) fn reserve(&self, sh: &Shared, n_bytes: u64) -> Result<u64, Error> {
        let n_chunks = Self::chunks_for(n_bytes);

        let found = {
            let mut free = self.free.lock();
            match free.range((n_chunks, 0)..).next() {
                Some((&(have, off), _)) => {
                    free.remove(&(have, off));
                    Some((have, off))
                }
                None => None,
            }
        };

        let off = match found {
            None => {
                // no fit: grow the backing store
                let addr = sh.map.activate_more(n_chunks)?;
                let off = sh.rel(addr);
                unsafe {
                    let hdr = sh.huge_header(off);
                    ptr::write_bytes(hdr as *mut u8, 0, HEADER_SIZE);
                    (*hdr).tag = tag(USAGE_HUGE, STATE_INITIALIZING);
                    (*hdr).n_chunks = n_chunks;
                    persist::persist(hdr);
                }
                off
            }
            Some((have, off)) if have > n_chunks => {
                // split the high end; the carved header must be durable
                // before the remainder shrinks so coverage never overlaps
                let new_off = off + (have - n_chunks) * CHUNK_SIZE as u64;
                unsafe {
                    let hdr = sh.huge_header(new_off);
                    ptr::write_bytes(hdr as *mut u8, 0, HEADER_SIZE);
                    (*hdr).tag = tag(USAGE_FREE, STATE_INITIALIZED);
                    (*hdr).n_chunks = n_chunks;
                    persist::persist(hdr);

                    let rem = sh.huge_header(off);
                    (*rem).n_chunks = have - n_chunks;
                    persist::persist(rem);
                }
                self.free.lock().insert((have - n_chunks, off), ());
                new_off
            }
            Some((_, off)) => off,
        };

        Ok(off + HEADER_SIZE as u64)
    }

    /// Free a huge region, optionally splicing up to two pointer stores
    /// atomically with the deallocation.
    ///
    /// # Safety
    /// `huge_off` must name the header chunk of a live huge region; link
    /// records must point into the mapped region.
    pub(crate) unsafe fn free(&self, sh: &Shared, huge_off: u64, on: [PtrPair; 2]) {
        let hdr = sh.huge_header(huge_off);
        let t = tag_ref(hdr as *mut u8);

        if !on[0].is_none() {
            (*hdr).on = on;
            persist::sfence();
            t.store(tag(USAGE_HUGE, STATE_FREEING), Ordering::Release);
            persist::persist(hdr);
            apply_link_stores(sh.base, &on);
            persist::sfence();
        }

        t.store(tag(USAGE_FREE, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);

        self.free.lock().insert(((*hdr).n_chunks, huge_off), ());
    }

    /// Re-index a region discovered by the recovery scan.
    pub(crate) fn index_free(&self, n_chunks: u64, off: u64) {
        self.free.lock().insert((n_chunks, off), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_rounding_accounts_for_the_header() {
        assert_eq!(HugeIndex::chunks_for(1), 1);
        assert_eq!(HugeIndex::chunks_for(CHUNK_SIZE as u64 - 64), 1);
        assert_eq!(HugeIndex::chunks_for(CHUNK_SIZE as u64), 2);
        assert_eq!(HugeIndex::chunks_for(5 * 1024 * 1024), 3);
    }
}
