// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Shared test helpers: a chunk walker over the persistent layout, used to
// check the coverage invariant (every byte tagged exactly once) and to
// collect per-run bitmap statistics.

#![allow(dead_code)]

use nvmalloc::layout::{
    state_of, usage_of, BlockHeader, ChunkHeader, RunHeader, BLOCK_SIZE, CHUNK_SIGNATURE,
    CHUNK_SIZE, HEADER_SIZE, INITIAL_ARENAS, STATE_INITIALIZED, USAGE_ARENA, USAGE_BLOCK,
    USAGE_FREE, USAGE_RUN,
};
use nvmalloc::Heap;

/// Snapshot of one persistent run taken by the walker.
pub struct RunInfo {
    pub off: u64,
    pub elem: u16,
    pub cap: u32,
    pub live: u32,
}

fn slot_mask(cap: u32) -> u64 {
    if cap >= 64 {
        u64::MAX
    } else {
        (1u64 << cap) - 1
    }
}

/// Walk every arena chunk chain, checking that the pages tile each chunk
/// exactly, and return all runs found.
pub fn walk_arenas(heap: &Heap) -> Vec<RunInfo> {
    let base = heap.base().as_ptr();
    let mut runs = Vec::new();

    for arena in 0..INITIAL_ARENAS {
        let mut chunk_off = (arena * CHUNK_SIZE) as u64;
        loop {
            let ch = unsafe { &*(base.add(chunk_off as usize) as *const ChunkHeader) };
            assert_eq!(ch.signature, CHUNK_SIGNATURE, "chunk {chunk_off:#x} signature");
            assert_eq!(usage_of(ch.tag), USAGE_ARENA);
            assert_eq!(state_of(ch.tag), STATE_INITIALIZED);

            let mut off = chunk_off + BLOCK_SIZE as u64;
            let end = chunk_off + CHUNK_SIZE as u64;
            while off < end {
                let hdr = unsafe { &*(base.add(off as usize) as *const BlockHeader) };
                match usage_of(hdr.tag) {
                    USAGE_RUN => {
                        let run = unsafe { &*(base.add(off as usize) as *const RunHeader) };
                        let cap = ((BLOCK_SIZE - HEADER_SIZE) / run.n_bytes as usize) as u32;
                        let bits = u64::from_le_bytes(run.bitmap) & slot_mask(cap);
                        runs.push(RunInfo {
                            off,
                            elem: run.n_bytes,
                            cap,
                            live: bits.count_ones(),
                        });
                        off += BLOCK_SIZE as u64;
                    }
                    USAGE_BLOCK | USAGE_FREE => {
                        assert!(hdr.n_pages > 0, "block {off:#x} has n_pages=0");
                        off += hdr.n_pages as u64 * BLOCK_SIZE as u64;
                    }
                    other => panic!("block {off:#x} has unknown usage {other:#04x}"),
                }
            }
            assert_eq!(off, end, "chunk {chunk_off:#x} pages do not tile the chunk");

            if ch.next_arena_chunk == 0 {
                break;
            }
            chunk_off = ch.next_arena_chunk;
        }
    }
    runs
}

/// Read the run header covering a small allocation.
pub fn run_of(heap: &Heap, data_off: u64) -> &RunHeader {
    let run_off = data_off & !(BLOCK_SIZE as u64 - 1);
    unsafe { &*(heap.base().as_ptr().add(run_off as usize) as *const RunHeader) }
}

/// Whether the persistent bitmap bit for a small allocation is set.
pub fn persistent_bit(heap: &Heap, data_off: u64) -> bool {
    let run_off = data_off & !(BLOCK_SIZE as u64 - 1);
    let run = run_of(heap, data_off);
    let slot = (data_off - (run_off + HEADER_SIZE as u64)) / run.n_bytes as u64;
    run.bitmap[(slot / 8) as usize] & (1u8 << (slot % 8)) != 0
}
