// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Arena allocator: 31 segregated bins of slab runs for small objects,
// plus a page-granular block allocator fed from a size-sorted tree of
// free page-runs. One arena owns a singly-linked chain of chunks; the
// chain head sits in the global arena array, later chunks hang off the
// `next_arena_chunk` header field.
//
// Volatile bookkeeping (bins, shadow runs, the free tree) is rebuilt from
// the persistent headers on recovery; nothing volatile is load-bearing
// across a crash.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slab::Slab;

use crate::error::Error;
use crate::heap::{apply_link_stores, Shared};
use crate::layout::{
    run_capacity, state_of, tag, usage_of, PtrPair, BLOCK_SIZE, CHUNK_SIGNATURE, CHUNK_SIZE,
    HEADER_SIZE, NUM_BINS, PAGES_PER_CHUNK, RunHeader, SCLASS_LARGE_MAX, SCLASS_SMALL_MAX,
    STATE_ACTIVATING, STATE_FREEING, STATE_INITIALIZED, STATE_INITIALIZING, STATE_PREFREE,
    USAGE_ARENA, USAGE_BLOCK, USAGE_FREE, USAGE_RUN,
};
use crate::persist;
use crate::sync::{cas_tag_spin, tag_ref};

// ---------------------------------------------------------------------------
// Shadow runs — the volatile descriptors persistent `vdata` handles index
// ---------------------------------------------------------------------------

/// Volatile descriptor of one persistent run. The persistent header's
/// `vdata` field holds `slab_key + 1`; raw process pointers never reach
/// the persistent store.
pub(crate) struct RunShadow {
    /// Offset of the persistent run header.
    pub(crate) off: u64,
    pub(crate) elem_size: u32,
    pub(crate) n_max: u32,
    /// Bit i set ⇒ slot i handed out (includes reserved-but-unactivated).
    bitmap: AtomicU64,
    n_free: AtomicU32,
}

impl RunShadow {
    fn mask(n_max: u32) -> u64 {
        if n_max >= 64 {
            u64::MAX
        } else {
            (1u64 << n_max) - 1
        }
    }

    fn new_empty(off: u64, elem_size: u32) -> Self {
        let n_max = run_capacity(elem_size as u16);
        Self {
            off,
            elem_size,
            n_max,
            bitmap: AtomicU64::new(0),
            n_free: AtomicU32::new(n_max),
        }
    }

    /// Build a shadow from the persistent bitmap, the same way the
    /// recovery walk does.
    unsafe fn from_header(sh: &Shared, off: u64) -> Self {
        let hdr = sh.run_header(off);
        let elem_size = (*hdr).n_bytes as u32;
        let n_max = run_capacity((*hdr).n_bytes);
        let bits = u64::from_le_bytes((*hdr).bitmap) & Self::mask(n_max);
        Self {
            off,
            elem_size,
            n_max,
            bitmap: AtomicU64::new(bits),
            n_free: AtomicU32::new(n_max - bits.count_ones()),
        }
    }

    pub(crate) fn n_free(&self) -> u32 {
        self.n_free.load(Ordering::Relaxed)
    }

    /// Claim the first free slot. Caller holds the owning bin's mutex.
    fn claim_first_free(&self) -> Option<u32> {
        let bits = self.bitmap.load(Ordering::Relaxed);
        let avail = !bits & Self::mask(self.n_max);
        if avail == 0 {
            return None;
        }
        let i = avail.trailing_zeros();
        self.bitmap.store(bits | (1u64 << i), Ordering::Relaxed);
        self.n_free.fetch_sub(1, Ordering::Relaxed);
        Some(i)
    }

    fn release(&self, i: u32) {
        self.bitmap.fetch_and(!(1u64 << i), Ordering::Relaxed);
        self.n_free.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide table of shadow runs, keyed by the handle stored in
/// persistent `vdata` fields. Cleared and repopulated on recovery.
pub(crate) struct ShadowTable {
    runs: RwLock<Slab<Arc<RunShadow>>>,
}

impl ShadowTable {
    pub(crate) fn new() -> Self {
        Self {
            runs: RwLock::new(Slab::new()),
        }
    }

    pub(crate) fn insert(&self, shadow: Arc<RunShadow>) -> usize {
        self.runs.write().insert(shadow)
    }

    pub(crate) fn get(&self, key: usize) -> Option<Arc<RunShadow>> {
        self.runs.read().get(key).cloned()
    }

    pub(crate) fn remove(&self, key: usize) {
        let mut runs = self.runs.write();
        if runs.contains(key) {
            runs.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Bins
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BinInner {
    /// Run allocations are currently served from.
    current: Option<usize>,
    /// Non-full runs waiting to become current again (LIFO).
    nonfull: Vec<usize>,
    n_free: u64,
    n_runs: u64,
}

#[derive(Default)]
struct Bin {
    inner: Mutex<BinInner>,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct ArenaInner {
    /// Offsets of owned chunk headers, chain order.
    chunks: Vec<u64>,
    /// Free page-runs keyed by (n_pages, offset); the range scan gives the
    /// smallest fit.
    free_blocks: BTreeMap<(u32, u64), ()>,
}

pub(crate) struct Arena {
    pub(crate) id: u32,
    inner: Mutex<ArenaInner>,
    bins: [Bin; NUM_BINS],
}

impl Arena {
    fn new_empty(id: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(ArenaInner {
                chunks: Vec::new(),
                free_blocks: BTreeMap::new(),
            }),
            bins: std::array::from_fn(|_| Bin::default()),
        }
    }

    /// Set up a fresh arena over `first_chunk_off`. When
    /// `create_initial_block` is set, a spanning free block is installed
    /// behind the chunk header (boot path; the recovery path discovers
    /// blocks by walking instead).
    pub(crate) fn new(
        id: u32,
        first_chunk_off: u64,
        sh: &Shared,
        create_initial_block: bool,
    ) -> Self {
        let arena = Self::new_empty(id);
        {
            let mut a = arena.inner.lock();
            a.chunks.push(first_chunk_off);
            if create_initial_block {
                let blk_off = first_chunk_off + BLOCK_SIZE as u64;
                unsafe {
                    Self::write_free_block(sh, blk_off, PAGES_PER_CHUNK, id);
                }
                a.free_blocks.insert((PAGES_PER_CHUNK, blk_off), ());
            }
        }
        arena
    }

    unsafe fn write_free_block(sh: &Shared, blk_off: u64, n_pages: u32, arena_id: u32) {
        let blk = sh.block_header(blk_off);
        ptr::write_bytes(blk as *mut u8, 0, HEADER_SIZE);
        (*blk).tag = tag(USAGE_FREE, STATE_INITIALIZED);
        (*blk).n_pages = n_pages;
        (*blk).arena_id = arena_id;
        persist::persist(blk);
    }

    // -- allocation ---------------------------------------------------------

    /// Reserve `n_bytes` from this arena. Small requests go through a bin;
    /// anything up to `SCLASS_LARGE_MAX` through the page-block path.
    /// Returns the offset of the user data; the slot/block is not durable
    /// until activated.
    pub(crate) fn allocate(&self, sh: &Shared, n_bytes: u64) -> Result<u64, Error> {
        debug_assert!(n_bytes as usize <= SCLASS_LARGE_MAX);
        if n_bytes as usize <= SCLASS_SMALL_MAX {
            let elem = persist::round_up(n_bytes.max(1), 64) as u32;
            self.allocate_small(sh, elem)
        } else {
            let n_pages = persist::round_up(n_bytes, BLOCK_SIZE as u64) / BLOCK_SIZE as u64;
            let blk_off = self.create_block(sh, n_pages as u32)?;
            Ok(blk_off + HEADER_SIZE as u64)
        }
    }

    fn allocate_small(&self, sh: &Shared, elem: u32) -> Result<u64, Error> {
        let bin = &self.bins[(elem / 64 - 1) as usize];
        let mut b = bin.inner.lock();
        let shadow = self.usable_run(sh, &mut b, elem)?;
        let slot = shadow
            .claim_first_free()
            .expect("selected run has a free slot");
        b.n_free -= 1;
        Ok(shadow.off + HEADER_SIZE as u64 + (slot * shadow.elem_size) as u64)
    }

    /// Pick the run the next small allocation comes from: the current run
    /// if it still has room, else a promoted non-full run, else a freshly
    /// created one. Handles that no longer resolve (replaced under the
    /// version protocol) are dropped on the way.
    fn usable_run(
        &self,
        sh: &Shared,
        b: &mut BinInner,
        elem: u32,
    ) -> Result<Arc<RunShadow>, Error> {
        if let Some(key) = b.current {
            match sh.shadows.get(key) {
                Some(s) if s.n_free() > 0 => return Ok(s),
                Some(_) => {}
                None => b.current = None,
            }
        }
        while let Some(key) = b.nonfull.pop() {
            if let Some(s) = sh.shadows.get(key) {
                if s.n_free() > 0 {
                    b.current = Some(key);
                    return Ok(s);
                }
            }
        }
        let (key, shadow) = self.create_run(sh, elem)?;
        b.current = Some(key);
        b.n_runs += 1;
        b.n_free += shadow.n_max as u64;
        Ok(shadow)
    }

    /// Build a new run for element size `elem`, carving one page from the
    /// smallest free page-run (or a fresh chunk).
    fn create_run(&self, sh: &Shared, elem: u32) -> Result<(usize, Arc<RunShadow>), Error> {
        let mut a = self.inner.lock();
        let (pages, blk_off) = match Self::take_free_block(&mut a, 1) {
            Some(found) => found,
            None => self.add_chunk(sh, &mut a)?,
        };
        let version = sh.version.load(Ordering::Acquire);

        if pages > 1 {
            // carve the high end; the carve only becomes reachable once the
            // remainder's shrunk n_pages is durable
            let run_off = blk_off + (pages as u64 - 1) * BLOCK_SIZE as u64;
            let shadow = Arc::new(RunShadow::new_empty(run_off, elem));
            let key = sh.shadows.insert(shadow.clone());
            unsafe {
                self.write_fresh_run(sh, run_off, elem, version, key);
                let rem = sh.block_header(blk_off);
                (*rem).n_pages = pages - 1;
                persist::persist(rem);
            }
            a.free_blocks.insert((pages - 1, blk_off), ());
            Ok((key, shadow))
        } else {
            // exactly one page: repurpose the free block in place
            drop(a);
            let shadow = Arc::new(RunShadow::new_empty(blk_off, elem));
            let key = sh.shadows.insert(shadow.clone());
            unsafe {
                self.write_fresh_run(sh, blk_off, elem, version, key);
            }
            Ok((key, shadow))
        }
    }

    unsafe fn write_fresh_run(&self, sh: &Shared, off: u64, elem: u32, version: u64, key: usize) {
        let run = sh.run_header(off);
        ptr::write_bytes(run as *mut u8, 0, HEADER_SIZE);
        (*run).bit_idx = -1;
        (*run).n_bytes = elem as u16;
        (*run).arena_id = self.id as u16;
        (*run).version = version;
        (*run).vdata = (key + 1) as u64;
        persist::sfence();
        (*run).tag = tag(USAGE_RUN, STATE_INITIALIZED);
        persist::persist(run);
    }

    /// Reserve a page-granular block of `n_pages`. The header stays
    /// `(FREE, INITIALIZED)` until the caller activates it.
    fn create_block(&self, sh: &Shared, n_pages: u32) -> Result<u64, Error> {
        let mut a = self.inner.lock();
        let (pages, blk_off) = match Self::take_free_block(&mut a, n_pages) {
            Some(found) => found,
            None => self.add_chunk(sh, &mut a)?,
        };

        if pages > n_pages {
            let new_off = blk_off + (pages - n_pages) as u64 * BLOCK_SIZE as u64;
            unsafe {
                Self::write_free_block(sh, new_off, n_pages, self.id);
                let rem = sh.block_header(blk_off);
                (*rem).n_pages = pages - n_pages;
                persist::persist(rem);
            }
            a.free_blocks.insert((pages - n_pages, blk_off), ());
            Ok(new_off)
        } else {
            // exact fit: the header already reads (FREE, INITIALIZED)
            Ok(blk_off)
        }
    }

    fn take_free_block(a: &mut ArenaInner, min_pages: u32) -> Option<(u32, u64)> {
        let (&(pages, off), _) = a.free_blocks.range((min_pages, 0)..).next()?;
        a.free_blocks.remove(&(pages, off));
        Some((pages, off))
    }

    /// Install a fresh chunk into this arena: initialize its header, link
    /// it behind the chain tail, lay down the spanning free block, then
    /// flip the chunk to INITIALIZED.
    fn add_chunk(&self, sh: &Shared, a: &mut ArenaInner) -> Result<(u32, u64), Error> {
        let addr = sh.map.activate_more(1)?;
        let chunk_off = sh.rel(addr);
        let blk_off = chunk_off + BLOCK_SIZE as u64;
        unsafe {
            let ch = sh.chunk_header(chunk_off);
            ptr::write_bytes(ch as *mut u8, 0, BLOCK_SIZE);
            (*ch).tag = tag(USAGE_ARENA, STATE_INITIALIZING);
            (*ch).signature = CHUNK_SIGNATURE;
            persist::persist_range(ch as *const u8, BLOCK_SIZE);

            // linking first means a torn install is reachable and healable
            let last = *a.chunks.last().expect("arena owns at least one chunk");
            let prev = sh.chunk_header(last);
            (*prev).next_arena_chunk = chunk_off;
            persist::persist(ptr::addr_of!((*prev).next_arena_chunk));

            Self::write_free_block(sh, blk_off, PAGES_PER_CHUNK, self.id);

            tag_ref(ch as *mut u8).store(tag(USAGE_ARENA, STATE_INITIALIZED), Ordering::Release);
            persist::persist_range(ch as *const u8, HEADER_SIZE);
        }
        a.chunks.push(chunk_off);
        Ok((PAGES_PER_CHUNK, blk_off))
    }

    /// Install a fresh chunk for the object-table chain. The chunk joins
    /// this arena's chain (and free tree) like any other growth; the
    /// caller links its strip into the OT chain afterwards.
    pub(crate) fn grow_for_table(&self, sh: &Shared) -> Result<u64, Error> {
        let mut a = self.inner.lock();
        let (pages, blk_off) = self.add_chunk(sh, &mut a)?;
        a.free_blocks.insert((pages, blk_off), ());
        Ok(blk_off - BLOCK_SIZE as u64)
    }

    // -- free ---------------------------------------------------------------

    /// Free a page-granular block, optionally splicing up to two pointer
    /// stores atomically with the deallocation.
    ///
    /// # Safety
    /// `blk_off` must name a live `(BLOCK, INITIALIZED)` header of this
    /// arena; the link records must point into the mapped region.
    pub(crate) unsafe fn free_large(&self, sh: &Shared, blk_off: u64, on: [PtrPair; 2]) {
        let hdr = sh.block_header(blk_off);
        let t = tag_ref(hdr as *mut u8);

        if !on[0].is_none() {
            (*hdr).on = on;
            persist::sfence();
            t.store(tag(USAGE_BLOCK, STATE_FREEING), Ordering::Release);
            persist::persist(hdr);
            apply_link_stores(sh.base, &on);
            persist::sfence();
        }

        t.store(tag(USAGE_FREE, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);

        let n_pages = (*hdr).n_pages;
        let mut a = self.inner.lock();
        a.free_blocks.insert((n_pages, blk_off), ());
    }

    /// Free one slot of a run.
    ///
    /// # Safety
    /// `run_off` must name a `(RUN, *)` header of this arena and
    /// `data_off` a slot inside it; link records must point into the
    /// mapped region.
    pub(crate) unsafe fn free_small(
        &self,
        sh: &Shared,
        run_off: u64,
        data_off: u64,
        on: [PtrPair; 2],
    ) {
        let hdr = sh.run_header(run_off);
        let t = tag_ref(hdr as *mut u8);

        // excludes concurrent frees, activates and shadow swaps on this run
        cas_tag_spin(
            t,
            tag(USAGE_RUN, STATE_INITIALIZED),
            tag(USAGE_RUN, STATE_PREFREE),
        );

        let shadow = self.run_shadow(sh, run_off);
        let slot = ((data_off - (run_off + HEADER_SIZE as u64)) / shadow.elem_size as u64) as u32;

        // journal the slot being flipped before any durable mutation
        (*hdr).bit_idx = slot as i16;
        if !on[0].is_none() {
            (*hdr).on = on;
            persist::sfence();
            t.store(tag(USAGE_RUN, STATE_FREEING), Ordering::Release);
            persist::persist(hdr);
            apply_link_stores(sh.base, &on);
            persist::sfence();
        } else {
            persist::persist(hdr);
        }

        (*hdr).bitmap[(slot / 8) as usize] &= !(1u8 << (slot % 8));
        persist::sfence();
        t.store(tag(USAGE_RUN, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).bit_idx = -1;
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);

        let bin = &self.bins[(shadow.elem_size / 64 - 1) as usize];
        let mut b = bin.inner.lock();
        shadow.release(slot);
        b.n_free += 1;
        let vdata = &*(ptr::addr_of_mut!((*hdr).vdata) as *const AtomicU64);
        let key = (vdata.load(Ordering::Acquire) - 1) as usize;
        if b.current != Some(key) && shadow.n_free() == 1 {
            b.nonfull.push(key);
        }
    }

    /// Resolve the shadow for a run the caller holds in PREFREE. A run
    /// from an older generation gets a fresh shadow built from the
    /// persistent bitmap, installed into `vdata` before the version is
    /// raised so exactly one shadow is ever observed per run.
    unsafe fn run_shadow(&self, sh: &Shared, run_off: u64) -> Arc<RunShadow> {
        let hdr = sh.run_header(run_off);
        let vdata = &*(ptr::addr_of_mut!((*hdr).vdata) as *const AtomicU64);
        let current_version = sh.version.load(Ordering::Acquire);

        if (*hdr).version < current_version {
            let fresh = Arc::new(RunShadow::from_header(sh, run_off));
            let new_key = sh.shadows.insert(fresh.clone());
            let bin = &self.bins[(fresh.elem_size / 64 - 1) as usize];
            let _b = bin.inner.lock();
            let old = vdata.load(Ordering::Acquire);
            if vdata
                .compare_exchange(
                    old,
                    (new_key + 1) as u64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if old >= 1 {
                    sh.shadows.remove((old - 1) as usize);
                }
                persist::sfence();
                (*hdr).version = current_version;
                return fresh;
            }
            sh.shadows.remove(new_key);
        }

        let key = (vdata.load(Ordering::Acquire) - 1) as usize;
        sh.shadows.get(key).expect("live run has a shadow")
    }

    // -- recovery -----------------------------------------------------------

    /// Rebuild an arena from its persistent chunk chain, repairing torn
    /// operations on the way.
    pub(crate) fn recover(id: u32, first_chunk_off: u64, sh: &Shared) -> Result<Self, Error> {
        let arena = Self::new_empty(id);
        {
            let mut a = arena.inner.lock();
            let mut chunk_off = first_chunk_off;
            loop {
                let ch = unsafe { sh.chunk_header(chunk_off) };
                let sig = unsafe { (*ch).signature };
                if sig != CHUNK_SIGNATURE {
                    return Err(Error::Corrupt(format!(
                        "chunk {chunk_off:#x}: bad signature"
                    )));
                }
                let t = unsafe { (*ch).tag };
                match (usage_of(t), state_of(t)) {
                    (USAGE_ARENA, STATE_INITIALIZED) => unsafe {
                        arena.walk_chunk(sh, &mut a, chunk_off)?;
                    },
                    (USAGE_ARENA, STATE_INITIALIZING) => unsafe {
                        // torn add_chunk: the link made it durable, the
                        // spanning block and the tag flip may not have
                        let blk_off = chunk_off + BLOCK_SIZE as u64;
                        Self::write_free_block(sh, blk_off, PAGES_PER_CHUNK, id);
                        tag_ref(ch as *mut u8)
                            .store(tag(USAGE_ARENA, STATE_INITIALIZED), Ordering::Release);
                        persist::persist_range(ch as *const u8, HEADER_SIZE);
                        a.free_blocks.insert((PAGES_PER_CHUNK, blk_off), ());
                    },
                    _ => {
                        return Err(Error::Corrupt(format!(
                            "chunk {chunk_off:#x}: unexpected tag {t:#04x} in arena chain"
                        )))
                    }
                }
                a.chunks.push(chunk_off);
                let next = unsafe { (*ch).next_arena_chunk };
                if next == 0 {
                    break;
                }
                chunk_off = next;
            }
        }
        Ok(arena)
    }

    /// Walk the pages of one `(ARENA, INITIALIZED)` chunk and rebuild
    /// blocks, runs and free page-runs.
    unsafe fn walk_chunk(&self, sh: &Shared, a: &mut ArenaInner, chunk_off: u64) -> Result<(), Error> {
        let mut off = chunk_off + BLOCK_SIZE as u64;
        let end = chunk_off + CHUNK_SIZE as u64;
        while off < end {
            let hdr = sh.block_header(off);
            let t = (*hdr).tag;
            match usage_of(t) {
                USAGE_RUN => {
                    self.recover_run(sh, off)?;
                    off += BLOCK_SIZE as u64;
                }
                USAGE_BLOCK => match state_of(t) {
                    STATE_INITIALIZED => {
                        let n_pages = (*hdr).n_pages;
                        if n_pages == 0 {
                            return Err(Error::Corrupt(format!("block {off:#x}: n_pages=0")));
                        }
                        off += n_pages as u64 * BLOCK_SIZE as u64;
                    }
                    STATE_ACTIVATING => {
                        let n_pages = (*hdr).n_pages;
                        if n_pages == 0 {
                            return Err(Error::Corrupt(format!("block {off:#x}: n_pages=0")));
                        }
                        if !(*hdr).on[0].is_none() {
                            // the linkage made it durable: finish the splice
                            apply_link_stores(sh.base, &(*hdr).on);
                            persist::sfence();
                            tag_ref(hdr as *mut u8)
                                .store(tag(USAGE_BLOCK, STATE_INITIALIZED), Ordering::Release);
                            persist::sfence();
                            (*hdr).on = [PtrPair::NONE; 2];
                            persist::persist(hdr);
                            off += n_pages as u64 * BLOCK_SIZE as u64;
                        } else {
                            off = self.recover_free_block(sh, a, off, true)?;
                        }
                    }
                    STATE_FREEING => {
                        apply_link_stores(sh.base, &(*hdr).on);
                        persist::sfence();
                        off = self.recover_free_block(sh, a, off, true)?;
                    }
                    _ => {
                        return Err(Error::Corrupt(format!(
                            "block {off:#x}: impossible tag {t:#04x}"
                        )))
                    }
                },
                USAGE_FREE => {
                    off = self.recover_free_block(sh, a, off, false)?;
                }
                _ => {
                    // torn in-place conversion: the header was being
                    // rewritten when the crash hit; reclaim one page
                    let blk = sh.block_header(off);
                    ptr::write_bytes(blk as *mut u8, 0, HEADER_SIZE);
                    (*blk).tag = tag(USAGE_FREE, STATE_INITIALIZED);
                    (*blk).n_pages = 1;
                    (*blk).arena_id = self.id;
                    persist::persist(blk);
                    a.free_blocks.insert((1, off), ());
                    off += BLOCK_SIZE as u64;
                }
            }
        }
        Ok(())
    }

    /// Re-index a free page-run found during the walk, rewriting its tag
    /// when the pre-crash state was transient.
    unsafe fn recover_free_block(
        &self,
        sh: &Shared,
        a: &mut ArenaInner,
        off: u64,
        zero_on: bool,
    ) -> Result<u64, Error> {
        let hdr = sh.block_header(off);
        let n_pages = (*hdr).n_pages;
        if n_pages == 0 {
            return Err(Error::Corrupt(format!("free block {off:#x}: n_pages=0")));
        }
        if (*hdr).tag != tag(USAGE_FREE, STATE_INITIALIZED) || zero_on {
            tag_ref(hdr as *mut u8).store(tag(USAGE_FREE, STATE_INITIALIZED), Ordering::Release);
            persist::sfence();
            (*hdr).on = [PtrPair::NONE; 2];
            persist::persist(hdr);
        }
        a.free_blocks.insert((n_pages, off), ());
        Ok(off + n_pages as u64 * BLOCK_SIZE as u64)
    }

    /// Repair a run found during the walk and attach its shadow.
    unsafe fn recover_run(&self, sh: &Shared, off: u64) -> Result<(), Error> {
        let hdr = sh.run_header(off);
        let n_bytes = (*hdr).n_bytes;
        if n_bytes == 0 || n_bytes % 64 != 0 || n_bytes as usize > SCLASS_SMALL_MAX {
            return Err(Error::Corrupt(format!(
                "run {off:#x}: element size {n_bytes}"
            )));
        }

        let bit_idx = (*hdr).bit_idx;
        match state_of((*hdr).tag) {
            STATE_INITIALIZED => {}
            STATE_ACTIVATING => {
                if !(*hdr).on[0].is_none() {
                    // roll forward: finish the splice and the slot flip
                    apply_link_stores(sh.base, &(*hdr).on);
                    if bit_idx >= 0 {
                        (*hdr).bitmap[(bit_idx / 8) as usize] |= 1u8 << (bit_idx % 8);
                    }
                } else if bit_idx >= 0 {
                    // roll back: the reservation never became durable
                    (*hdr).bitmap[(bit_idx / 8) as usize] &= !(1u8 << (bit_idx % 8));
                }
                self.finish_run_repair(hdr);
            }
            STATE_FREEING => {
                apply_link_stores(sh.base, &(*hdr).on);
                if bit_idx >= 0 {
                    (*hdr).bitmap[(bit_idx / 8) as usize] &= !(1u8 << (bit_idx % 8));
                }
                self.finish_run_repair(hdr);
            }
            STATE_PREFREE => {
                // the free may or may not have cleared the bit; both sides
                // are consistent, only the tag needs to settle
                self.finish_run_repair(hdr);
            }
            _ => {
                return Err(Error::Corrupt(format!(
                    "run {off:#x}: impossible tag {:#04x}",
                    (*hdr).tag
                )))
            }
        }

        let shadow = Arc::new(RunShadow::from_header(sh, off));
        let n_free = shadow.n_free();
        let key = sh.shadows.insert(shadow);
        (*hdr).vdata = (key + 1) as u64;
        (*hdr).version = sh.version.load(Ordering::Acquire);

        if n_free > 0 {
            let bin = &self.bins[(n_bytes as usize / 64) - 1];
            let mut b = bin.inner.lock();
            b.n_runs += 1;
            b.n_free += n_free as u64;
            if b.current.is_none() {
                b.current = Some(key);
            } else {
                b.nonfull.push(key);
            }
        }
        Ok(())
    }

    unsafe fn finish_run_repair(&self, hdr: *mut RunHeader) {
        persist::sfence();
        tag_ref(hdr as *mut u8).store(tag(USAGE_RUN, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).bit_idx = -1;
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);
    }

    // -- introspection ------------------------------------------------------

    /// `(free slots, tracked runs)` of one bin; test and telemetry hook.
    pub(crate) fn bin_occupancy(&self, bin: usize) -> (u64, u64) {
        let b = self.bins[bin].inner.lock();
        (b.n_free, b.n_runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_claims_lowest_slot_first() {
        let s = RunShadow::new_empty(0, 96);
        assert_eq!(s.n_max, 42);
        assert_eq!(s.claim_first_free(), Some(0));
        assert_eq!(s.claim_first_free(), Some(1));
        s.release(0);
        assert_eq!(s.claim_first_free(), Some(0));
        assert_eq!(s.n_free(), s.n_max - 2);
    }

    #[test]
    fn shadow_exhausts_at_capacity() {
        let s = RunShadow::new_empty(0, 1984);
        assert_eq!(s.n_max, 2);
        assert!(s.claim_first_free().is_some());
        assert!(s.claim_first_free().is_some());
        assert_eq!(s.claim_first_free(), None);
    }
}
