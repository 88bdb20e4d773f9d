// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Top-level façade: one `Heap` value owns the chunk mapper, the arena
// array, the huge index and the object table, routes threads to arenas,
// dispatches operations by size class, and drives boot / recovery.
//
// The persistent lifecycle of every object is
//   absent → INITIALIZING (reserve) → ACTIVATING → INITIALIZED (activate)
//          → FREEING (free begins) → FREE (free completes)
// and each transition is flushed and fenced so a crash leaves the store
// classifiable as fully allocated or not allocated.

use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::ThreadId;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::arena::{Arena, ShadowTable};
use crate::chunk_map::ChunkMap;
use crate::error::Error;
use crate::huge::HugeIndex;
use crate::layout::{
    state_of, tag, usage_of, BlockHeader, ChunkHeader, HugeHeader, PtrPair, RunHeader,
    BLOCK_SIZE, CHUNK_SIGNATURE, CHUNK_SIZE, HEADER_SIZE, INITIAL_ARENAS, MAX_ID_LEN, NUM_BINS,
    SCLASS_LARGE_MAX, STATE_ACTIVATING, STATE_FREEING, STATE_INITIALIZED, STATE_INITIALIZING,
    USAGE_ARENA, USAGE_BLOCK, USAGE_FREE, USAGE_HUGE, USAGE_RUN,
};
use crate::object_table::{ObjectTable, OtEntry};
use crate::persist;
use crate::sync::tag_ref;

/// Chunks of address space reserved by default (16 GiB at 2 MiB chunks).
const DEFAULT_MAX_CHUNKS: u64 = 8192;

// ---------------------------------------------------------------------------
// Shared state threaded through the allocator modules
// ---------------------------------------------------------------------------

/// Process-wide allocator state shared by the arena, huge and object-table
/// modules: the mapped base, the chunk mapper, the shadow-run table and
/// the current generation.
pub(crate) struct Shared {
    pub(crate) base: *mut u8,
    pub(crate) map: ChunkMap,
    pub(crate) shadows: ShadowTable,
    pub(crate) version: AtomicU64,
}

// Safety: `base` points at a process-shared mapping; every structure
// reachable from `Shared` synchronizes internally.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    pub(crate) fn rel(&self, p: *const u8) -> u64 {
        p as u64 - self.base as u64
    }

    #[inline]
    pub(crate) unsafe fn abs(&self, off: u64) -> *mut u8 {
        self.base.add(off as usize)
    }

    #[inline]
    pub(crate) unsafe fn chunk_header(&self, off: u64) -> *mut ChunkHeader {
        self.abs(off) as *mut ChunkHeader
    }

    #[inline]
    pub(crate) unsafe fn block_header(&self, off: u64) -> *mut BlockHeader {
        self.abs(off) as *mut BlockHeader
    }

    #[inline]
    pub(crate) unsafe fn run_header(&self, off: u64) -> *mut RunHeader {
        self.abs(off) as *mut RunHeader
    }

    #[inline]
    pub(crate) unsafe fn huge_header(&self, off: u64) -> *mut HugeHeader {
        self.abs(off) as *mut HugeHeader
    }
}

/// Write the recorded link values to their destinations and flush each
/// line. Callers fence afterwards.
///
/// # Safety
/// Every non-empty record must name a mapped destination word.
pub(crate) unsafe fn apply_link_stores(base: *mut u8, on: &[PtrPair; 2]) {
    for rec in on {
        if rec.is_none() {
            continue;
        }
        let word = base.add(rec.at as usize) as *mut u64;
        ptr::write(word, rec.value);
        persist::flush_line(word as *const u8);
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// One pending pointer store attached to an activate/free: at completion,
/// the persistent word at `at` holds the relative address of `target` —
/// atomically with the allocation state, even across a crash.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub at: NonNull<u64>,
    pub target: NonNull<u8>,
}

/// Options for [`Heap::open_with`].
#[derive(Debug, Clone)]
pub struct HeapOptions {
    max_chunks: u64,
}

impl HeapOptions {
    pub fn new() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }

    /// Bound the reserved virtual region, in chunks.
    pub fn max_chunks(mut self, n: u64) -> Self {
        self.max_chunks = n;
        self
    }
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A failure-atomic persistent heap over one workspace.
pub struct Heap {
    shared: Shared,
    arenas: Vec<Arena>,
    huge: HugeIndex,
    ot: ObjectTable,
    tids: DashMap<ThreadId, u32>,
    next_arena: AtomicU32,
}

impl Heap {
    /// Create or recover the NVM-backed region under `workspace`.
    ///
    /// With `recover` unset any existing backing store is discarded; with
    /// it set, previously persisted chunks are remapped, torn operations
    /// are healed, and all volatile indices are rebuilt.
    pub fn open(workspace: impl AsRef<Path>, recover: bool) -> Result<Self, Error> {
        Self::open_with(workspace, recover, HeapOptions::default())
    }

    pub fn open_with(
        workspace: impl AsRef<Path>,
        recover: bool,
        opts: HeapOptions,
    ) -> Result<Self, Error> {
        let workspace = workspace.as_ref();
        std::fs::create_dir_all(workspace)?;

        let map = ChunkMap::init(workspace, opts.max_chunks, !recover)?;
        let n_chunks = if recover { map.recover()? } else { 0 };

        let shared = Shared {
            base: map.base(),
            map,
            shadows: ShadowTable::new(),
            version: AtomicU64::new(0),
        };
        let huge = HugeIndex::new();

        let arenas = if n_chunks == 0 {
            Self::initialize_empty(&shared)?
        } else {
            Self::initialize_recovered(&shared, &huge, n_chunks)?
        };

        let ot = ObjectTable::new(&shared);
        if n_chunks > 0 {
            unsafe { ot.recover(&shared) };
        }

        info!(
            workspace = %workspace.display(),
            recovered_chunks = n_chunks,
            "nvm heap ready"
        );
        Ok(Self {
            shared,
            arenas,
            huge,
            ot,
            tids: DashMap::new(),
            next_arena: AtomicU32::new(0),
        })
    }

    /// Base address of the mapped region.
    pub fn base(&self) -> NonNull<u8> {
        NonNull::new(self.shared.base).expect("mapped base is non-null")
    }

    /// Translate a relative offset into an in-process pointer.
    pub fn abs(&self, rel: u64) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.shared.abs(rel)) }
    }

    /// Translate an in-process pointer into its relative offset.
    pub fn rel(&self, abs: NonNull<u8>) -> u64 {
        self.shared.rel(abs.as_ptr())
    }

    /// Flush `[ptr, ptr + n_bytes)` to durable media and fence.
    ///
    /// # Safety
    /// The range must lie inside the mapped region.
    pub unsafe fn persist(&self, ptr: NonNull<u8>, n_bytes: u64) {
        persist::persist_range(ptr.as_ptr(), n_bytes as usize);
    }

    /// Begin a new generation; runs created before this call get a fresh
    /// volatile shadow on their next free.
    pub fn advance_version(&self) -> u64 {
        self.shared.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -- reserve ------------------------------------------------------------

    /// Hand out a persistent region of `n_bytes` in the INITIALIZING
    /// lifecycle stage. The caller populates it, then calls
    /// [`Heap::activate`] to make it durable.
    pub fn reserve(&self, n_bytes: u64) -> Result<NonNull<u8>, Error> {
        let off = self.reserve_off(n_bytes)?;
        Ok(self.abs(off))
    }

    /// [`Heap::reserve`] plus a registered name. Fails on a duplicate id
    /// with the allocator state unchanged.
    pub fn reserve_named(&self, id: &str, n_bytes: u64) -> Result<NonNull<u8>, Error> {
        if id.len() > MAX_ID_LEN {
            return Err(Error::NameTooLong(id.to_string()));
        }
        let entry = self.ot.try_bind(id, || {
            let data = self.reserve_off(n_bytes)?;
            let slot = self.ot.acquire_slot(&self.shared, &self.arenas[0])?;
            Ok(OtEntry { slot, data })
        })?;
        Ok(self.abs(entry.data))
    }

    fn reserve_off(&self, n_bytes: u64) -> Result<u64, Error> {
        if n_bytes as usize <= SCLASS_LARGE_MAX {
            let arena = self.arena_for_thread();
            self.arenas[arena as usize].allocate(&self.shared, n_bytes)
        } else {
            self.huge.reserve(&self.shared, n_bytes)
        }
    }

    /// A thread's first reservation pins it to an arena round-robin; the
    /// pin is advisory — frees find the owning arena through the header.
    fn arena_for_thread(&self) -> u32 {
        let tid = std::thread::current().id();
        if let Some(a) = self.tids.get(&tid) {
            return *a;
        }
        let a = self.next_arena.fetch_add(1, Ordering::Relaxed) % INITIAL_ARENAS as u32;
        *self.tids.entry(tid).or_insert(a)
    }

    // -- activate -----------------------------------------------------------

    /// Flip a reserved region to INITIALIZED, persisting up to two pointer
    /// stores atomically with the state change.
    ///
    /// # Safety
    /// `ptr` must come from [`Heap::reserve`]/[`Heap::reserve_named`] on
    /// this heap and be unactivated; link destinations must be mapped
    /// persistent words.
    pub unsafe fn activate(&self, ptr: NonNull<u8>, link1: Option<Link>, link2: Option<Link>) {
        let off = self.rel(ptr);
        let on = self.link_records(link1, link2);

        if off % CHUNK_SIZE as u64 == HEADER_SIZE as u64 {
            self.activate_huge(off - HEADER_SIZE as u64, on);
            return;
        }
        let blk_off = off & !(BLOCK_SIZE as u64 - 1);
        let t = tag_ref(self.shared.abs(blk_off)).load(Ordering::Acquire);
        match usage_of(t) {
            USAGE_FREE => self.activate_block(blk_off, on),
            USAGE_RUN => self.activate_slot(blk_off, off, on),
            _ => warn!(off, "activate on a pointer without a reserved header; ignoring"),
        }
    }

    /// Activate a named reservation: persist its table entry, activate the
    /// data, then flip the entry to INITIALIZED.
    pub fn activate_named(&self, id: &str) {
        let Some(entry) = self.ot.get(id) else {
            warn!(id, "activate_named on unknown id; ignoring");
            return;
        };
        unsafe {
            let slot = self.ot.slot_ptr(&self.shared, entry.slot);
            (*slot).state = STATE_INITIALIZING;
            (*slot).id = [0u8; 55];
            (&mut (*slot).id)[..id.len()].copy_from_slice(id.as_bytes());
            (*slot).data = entry.data;
            persist::persist(slot);

            self.activate(self.abs(entry.data), None, None);

            (*slot).state = STATE_INITIALIZED;
            persist::persist(slot);
        }
    }

    /// Look up a named object.
    pub fn get_named(&self, id: &str) -> Option<NonNull<u8>> {
        self.ot.get(id).map(|e| self.abs(e.data))
    }

    unsafe fn activate_huge(&self, huge_off: u64, on: [PtrPair; 2]) {
        let hdr = self.shared.huge_header(huge_off);
        let t = tag_ref(hdr as *mut u8);

        if !on[0].is_none() {
            (*hdr).on = on;
            persist::sfence();
            t.store(tag(USAGE_HUGE, STATE_ACTIVATING), Ordering::Release);
            persist::persist(hdr);
            apply_link_stores(self.shared.base, &on);
            persist::sfence();
        }

        t.store(tag(USAGE_HUGE, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);
    }

    unsafe fn activate_block(&self, blk_off: u64, on: [PtrPair; 2]) {
        let hdr = self.shared.block_header(blk_off);
        let t = tag_ref(hdr as *mut u8);

        if !on[0].is_none() {
            (*hdr).on = on;
            persist::sfence();
            t.store(tag(USAGE_BLOCK, STATE_ACTIVATING), Ordering::Release);
            persist::persist(hdr);
            apply_link_stores(self.shared.base, &on);
            persist::sfence();
        }

        t.store(tag(USAGE_BLOCK, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);
    }

    unsafe fn activate_slot(&self, run_off: u64, data_off: u64, on: [PtrPair; 2]) {
        let hdr = self.shared.run_header(run_off);
        let t = tag_ref(hdr as *mut u8);

        // order against concurrent frees/activates on the same run
        crate::sync::cas_tag_spin(
            t,
            tag(USAGE_RUN, STATE_INITIALIZED),
            tag(USAGE_RUN, STATE_ACTIVATING),
        );

        let slot = ((data_off - (run_off + HEADER_SIZE as u64)) / (*hdr).n_bytes as u64) as u32;
        (*hdr).bit_idx = slot as i16;

        if !on[0].is_none() {
            (*hdr).on = on;
            persist::persist(hdr);
            apply_link_stores(self.shared.base, &on);
            persist::sfence();
        }

        (*hdr).bitmap[(slot / 8) as usize] |= 1u8 << (slot % 8);
        persist::sfence();
        t.store(tag(USAGE_RUN, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).bit_idx = -1;
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);
    }

    // -- free ---------------------------------------------------------------

    /// Free an activated region, with the same optional two-store splice
    /// as [`Heap::activate`]. A pointer whose header is neither a block
    /// nor a run (double free, foreign pointer) is ignored with a warning.
    ///
    /// # Safety
    /// `ptr` must have come from this heap; link destinations must be
    /// mapped persistent words.
    pub unsafe fn free(&self, ptr: NonNull<u8>, link1: Option<Link>, link2: Option<Link>) {
        let off = self.rel(ptr);
        let on = self.link_records(link1, link2);

        if off % CHUNK_SIZE as u64 == HEADER_SIZE as u64 {
            self.huge.free(&self.shared, off - HEADER_SIZE as u64, on);
            return;
        }
        let blk_off = off & !(BLOCK_SIZE as u64 - 1);
        let hdr = self.shared.block_header(blk_off);
        let t = tag_ref(hdr as *mut u8).load(Ordering::Acquire);
        match usage_of(t) {
            USAGE_BLOCK => {
                let arena = (*hdr).arena_id as usize;
                self.arenas[arena].free_large(&self.shared, blk_off, on);
            }
            USAGE_RUN => {
                let run = self.shared.run_header(blk_off);
                let arena = (*run).arena_id as usize;
                self.arenas[arena].free_small(&self.shared, blk_off, off, on);
            }
            _ => warn!(off, "double free or foreign pointer; ignoring"),
        }
    }

    /// Free a named object: table entry to FREEING, then the data, then
    /// the volatile binding.
    pub fn free_named(&self, id: &str) {
        let Some(entry) = self.ot.get(id) else {
            warn!(id, "free_named on unknown id; ignoring");
            return;
        };
        unsafe {
            let slot = self.ot.slot_ptr(&self.shared, entry.slot);
            (*slot).state = STATE_FREEING;
            persist::persist(slot);

            self.free(self.abs(entry.data), None, None);
        }
        self.ot.remove(id);
    }

    fn link_records(&self, link1: Option<Link>, link2: Option<Link>) -> [PtrPair; 2] {
        let mk = |l: Link| PtrPair {
            at: self.shared.rel(l.at.as_ptr() as *const u8),
            value: self.shared.rel(l.target.as_ptr()),
        };
        let mut on = [
            link1.map(mk).unwrap_or(PtrPair::NONE),
            link2.map(mk).unwrap_or(PtrPair::NONE),
        ];
        if on[0].is_none() && !on[1].is_none() {
            on.swap(0, 1);
        }
        on
    }

    // -- introspection ------------------------------------------------------

    /// `(free slots, tracked runs)` for one bin of one arena.
    pub fn bin_occupancy(&self, arena: usize, bin: usize) -> (u64, u64) {
        assert!(arena < INITIAL_ARENAS && bin < NUM_BINS);
        self.arenas[arena].bin_occupancy(bin)
    }

    // -- boot / recovery ----------------------------------------------------

    /// Lay out a fresh store: INITIAL_ARENAS chunks, chained for the
    /// object table, each with a spanning free block, flipped INITIALIZED
    /// only once all of them are fully written.
    fn initialize_empty(sh: &Shared) -> Result<Vec<Arena>, Error> {
        sh.map.activate_more(INITIAL_ARENAS as u64)?;

        for i in 0..INITIAL_ARENAS {
            let off = (i * CHUNK_SIZE) as u64;
            unsafe {
                let ch = sh.chunk_header(off);
                ptr::write_bytes(ch as *mut u8, 0, BLOCK_SIZE);
                (*ch).tag = tag(USAGE_ARENA, STATE_INITIALIZING);
                (*ch).signature = CHUNK_SIGNATURE;
                (*ch).next_ot_chunk = if i + 1 < INITIAL_ARENAS {
                    ((i + 1) * CHUNK_SIZE) as u64
                } else {
                    0
                };
                persist::persist_range(ch as *const u8, BLOCK_SIZE);
            }
        }

        let arenas: Vec<Arena> = (0..INITIAL_ARENAS)
            .map(|i| Arena::new(i as u32, (i * CHUNK_SIZE) as u64, sh, true))
            .collect();

        for i in 0..INITIAL_ARENAS {
            let off = (i * CHUNK_SIZE) as u64;
            unsafe {
                let ch = sh.chunk_header(off);
                tag_ref(ch as *mut u8).store(tag(USAGE_ARENA, STATE_INITIALIZED), Ordering::Release);
                persist::persist_range(ch as *const u8, HEADER_SIZE);
            }
        }
        Ok(arenas)
    }

    /// Rebuild all volatile indices from `n_chunks` persisted chunks:
    /// walk each arena chain, then linearly classify the remaining chunks
    /// as live huge regions, free regions, or torn leftovers to reclaim.
    fn initialize_recovered(
        sh: &Shared,
        huge: &HugeIndex,
        n_chunks: u64,
    ) -> Result<Vec<Arena>, Error> {
        if n_chunks < INITIAL_ARENAS as u64 {
            return Err(Error::Corrupt(format!(
                "workspace holds {n_chunks} chunks, {INITIAL_ARENAS} arena chunks expected"
            )));
        }

        let mut arenas = Vec::with_capacity(INITIAL_ARENAS);
        for i in 0..INITIAL_ARENAS {
            arenas.push(Arena::recover(i as u32, (i * CHUNK_SIZE) as u64, sh)?);
        }

        let mut i = INITIAL_ARENAS as u64;
        while i < n_chunks {
            let off = i * CHUNK_SIZE as u64;
            let t = unsafe { (*sh.huge_header(off)).tag };
            match (usage_of(t), state_of(t)) {
                (USAGE_ARENA, STATE_INITIALIZED) => {
                    // owned by some arena chain, already rebuilt above
                    i += 1;
                }
                (USAGE_ARENA, STATE_INITIALIZING) => {
                    // the chunk was activated but its install never became
                    // reachable; reclaim it as a one-chunk free region
                    unsafe { Self::reclaim_chunk(sh, off) };
                    huge.index_free(1, off);
                    i += 1;
                }
                (USAGE_HUGE, state) => {
                    let hdr = unsafe { sh.huge_header(off) };
                    let n = unsafe { (*hdr).n_chunks }.max(1);
                    if i + n > n_chunks {
                        return Err(Error::Corrupt(format!(
                            "huge region {off:#x} spans past the end of the store"
                        )));
                    }
                    match state {
                        STATE_INITIALIZED => {}
                        STATE_ACTIVATING if unsafe { !(*hdr).on[0].is_none() } => unsafe {
                            apply_link_stores(sh.base, &(*hdr).on);
                            persist::sfence();
                            tag_ref(hdr as *mut u8)
                                .store(tag(USAGE_HUGE, STATE_INITIALIZED), Ordering::Release);
                            persist::sfence();
                            (*hdr).on = [PtrPair::NONE; 2];
                            persist::persist(hdr);
                        },
                        STATE_FREEING => unsafe {
                            apply_link_stores(sh.base, &(*hdr).on);
                            persist::sfence();
                            Self::settle_free_region(hdr, n);
                            huge.index_free(n, off);
                        },
                        _ => unsafe {
                            // INITIALIZING, link-less ACTIVATING, or torn:
                            // the allocation never completed
                            Self::settle_free_region(hdr, n);
                            huge.index_free(n, off);
                        },
                    }
                    i += n;
                }
                (USAGE_FREE, _) => {
                    let hdr = unsafe { sh.huge_header(off) };
                    let n = unsafe { (*hdr).n_chunks }.max(1);
                    if i + n > n_chunks {
                        return Err(Error::Corrupt(format!(
                            "free region {off:#x} spans past the end of the store"
                        )));
                    }
                    huge.index_free(n, off);
                    i += n;
                }
                _ => {
                    // backed but never tagged (crash right after growth)
                    unsafe { Self::reclaim_chunk(sh, off) };
                    huge.index_free(1, off);
                    i += 1;
                }
            }
        }
        Ok(arenas)
    }

    unsafe fn reclaim_chunk(sh: &Shared, off: u64) {
        let hdr = sh.huge_header(off);
        ptr::write_bytes(hdr as *mut u8, 0, HEADER_SIZE);
        (*hdr).tag = tag(USAGE_FREE, STATE_INITIALIZED);
        (*hdr).n_chunks = 1;
        persist::persist(hdr);
    }

    unsafe fn settle_free_region(hdr: *mut HugeHeader, n: u64) {
        tag_ref(hdr as *mut u8).store(tag(USAGE_FREE, STATE_INITIALIZED), Ordering::Release);
        persist::sfence();
        (*hdr).n_chunks = n;
        (*hdr).on = [PtrPair::NONE; 2];
        persist::persist(hdr);
    }
}
