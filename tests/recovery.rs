// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Restart and crash-repair scenarios. "Crashes" are simulated by writing
// the transient tag + link-restoration records a real crash would leave
// behind, dropping the heap without further cleanup, and re-opening the
// workspace with recovery enabled.

mod common;

use std::path::PathBuf;

use nvmalloc::layout::{
    state_of, tag, usage_of, RunHeader, BLOCK_SIZE, CHUNK_SIZE, HEADER_SIZE, STATE_ACTIVATING,
    STATE_FREEING, STATE_INITIALIZED, USAGE_BLOCK, USAGE_FREE, USAGE_RUN,
};
use nvmalloc::Heap;

fn workspace(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("ws")
}

#[test]
fn named_object_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    {
        let heap = Heap::open(&ws, false).unwrap();
        let p = heap.reserve_named("root", 128).unwrap();
        unsafe {
            for i in 0..128 {
                p.as_ptr().add(i).write((i % 251) as u8);
            }
            heap.persist(p, 128);
        }
        heap.activate_named("root");
    }

    let heap = Heap::open(&ws, true).unwrap();
    let p = heap.get_named("root").expect("root survives the restart");
    unsafe {
        for i in 0..128 {
            assert_eq!(p.as_ptr().add(i).read(), (i % 251) as u8, "byte {i}");
        }
    }
}

#[test]
fn recovery_rebuilds_equivalent_indices() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let mut expected = Vec::new();
    {
        let heap = Heap::open(&ws, false).unwrap();
        for i in 0..50u64 {
            let id = format!("obj{i}");
            let p = heap.reserve_named(&id, 64 + i * 40).unwrap();
            unsafe { heap.activate(p, None, None) };
            heap.activate_named(&id);
            expected.push((id, heap.rel(p)));
        }
        for i in (0..50u64).step_by(3) {
            heap.free_named(&format!("obj{i}"));
        }
        expected.retain(|(id, _)| {
            let idx: u64 = id[3..].parse().unwrap();
            idx % 3 != 0
        });
    }

    let heap = Heap::open(&ws, true).unwrap();
    for (id, off) in &expected {
        let p = heap.get_named(id).unwrap_or_else(|| panic!("{id} lost"));
        assert_eq!(heap.rel(p), *off, "{id} moved");
    }
    for i in (0..50u64).step_by(3) {
        assert!(heap.get_named(&format!("obj{i}")).is_none());
    }

    // the rebuilt indices keep serving: freed ids rebind, new ids insert
    let p = heap.reserve_named("obj0", 64).unwrap();
    unsafe { heap.activate(p, None, None) };
    heap.activate_named("obj0");
    let q = heap.reserve_named("fresh", 512).unwrap();
    unsafe { heap.activate(q, None, None) };
    heap.activate_named("fresh");
    assert!(heap.get_named("fresh").is_some());
    common::walk_arenas(&heap);
}

#[test]
fn torn_activate_without_links_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let (obj_off, sentinel_off) = {
        let heap = Heap::open(&ws, false).unwrap();
        let root = heap.reserve_named("root", 64).unwrap();
        unsafe {
            (root.as_ptr() as *mut u64).write(0xdead_beef);
            heap.activate(root, None, None);
        }
        heap.activate_named("root");

        let obj = heap.reserve(128).unwrap();
        let off = heap.rel(obj);
        let run_off = off & !(BLOCK_SIZE as u64 - 1);
        let slot = (off - run_off - HEADER_SIZE as u64) / 128;
        unsafe {
            // crash injected after the flip to ACTIVATING but before the
            // on[] records became durable
            let run = heap.base().as_ptr().add(run_off as usize) as *mut RunHeader;
            (*run).bit_idx = slot as i16;
            std::ptr::write_volatile(
                run as *mut u8,
                tag(USAGE_RUN, STATE_ACTIVATING),
            );
        }
        (off, heap.rel(root))
    };

    let heap = Heap::open(&ws, true).unwrap();
    // rolled back: the slot is free again, the run settled
    assert!(!common::persistent_bit(&heap, obj_off));
    let run = common::run_of(&heap, obj_off);
    assert_eq!(usage_of(run.tag), USAGE_RUN);
    assert_eq!(state_of(run.tag), STATE_INITIALIZED);
    assert_eq!(run.bit_idx, -1);
    // the caller's linkage word was never touched
    unsafe {
        let word = heap.base().as_ptr().add(sentinel_off as usize) as *const u64;
        assert_eq!(word.read(), 0xdead_beef);
    }
    common::walk_arenas(&heap);
}

#[test]
fn torn_activate_with_links_rolls_forward() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let (obj_off, root_off) = {
        let heap = Heap::open(&ws, false).unwrap();
        let root = heap.reserve_named("root", 64).unwrap();
        unsafe {
            (root.as_ptr() as *mut u64).write(0);
            (root.as_ptr().add(8) as *mut u64).write(0);
            heap.activate(root, None, None);
        }
        heap.activate_named("root");
        let root_off = heap.rel(root);

        let obj = heap.reserve(128).unwrap();
        let off = heap.rel(obj);
        let run_off = off & !(BLOCK_SIZE as u64 - 1);
        let slot = (off - run_off - HEADER_SIZE as u64) / 128;
        unsafe {
            // crash injected after on[] + ACTIVATING became durable but
            // before the link stores happened
            let run = heap.base().as_ptr().add(run_off as usize) as *mut RunHeader;
            (*run).bit_idx = slot as i16;
            (*run).on[0].at = root_off;
            (*run).on[0].value = off;
            (*run).on[1].at = root_off + 8;
            (*run).on[1].value = off;
            std::ptr::write_volatile(run as *mut u8, tag(USAGE_RUN, STATE_ACTIVATING));
        }
        (off, root_off)
    };

    let heap = Heap::open(&ws, true).unwrap();
    // rolled forward: both destination words spliced, the slot is live
    unsafe {
        let base = heap.base().as_ptr();
        assert_eq!((base.add(root_off as usize) as *const u64).read(), obj_off);
        assert_eq!(
            (base.add(root_off as usize + 8) as *const u64).read(),
            obj_off
        );
    }
    assert!(common::persistent_bit(&heap, obj_off));
    let run = common::run_of(&heap, obj_off);
    assert_eq!(state_of(run.tag), STATE_INITIALIZED);
    assert!(run.on[0].is_none() && run.on[1].is_none());
}

#[test]
fn torn_block_free_completes_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let (blk_off, word_off, target_off) = {
        let heap = Heap::open(&ws, false).unwrap();
        let root = heap.reserve_named("root", 64).unwrap();
        unsafe {
            (root.as_ptr() as *mut u64).write(0x1111);
            heap.activate(root, None, None);
        }
        heap.activate_named("root");

        let big = heap.reserve(2 * BLOCK_SIZE as u64).unwrap();
        unsafe { heap.activate(big, None, None) };
        let blk_off = heap.rel(big) - HEADER_SIZE as u64;
        let word_off = heap.rel(root);

        unsafe {
            // crash injected mid-free, after FREEING + on[] became durable
            let base = heap.base().as_ptr();
            let hdr = base.add(blk_off as usize) as *mut nvmalloc::layout::BlockHeader;
            (*hdr).on[0].at = word_off;
            (*hdr).on[0].value = 0x2222;
            std::ptr::write_volatile(hdr as *mut u8, tag(USAGE_BLOCK, STATE_FREEING));
        }
        (blk_off, word_off, 0x2222u64)
    };

    let heap = Heap::open(&ws, true).unwrap();
    unsafe {
        let base = heap.base().as_ptr();
        let hdr = base.add(blk_off as usize) as *const nvmalloc::layout::BlockHeader;
        assert_eq!(usage_of((*hdr).tag), USAGE_FREE);
        assert_eq!(state_of((*hdr).tag), STATE_INITIALIZED);
        assert_eq!(
            (base.add(word_off as usize) as *const u64).read(),
            target_off
        );
    }
    common::walk_arenas(&heap);
}

#[test]
fn freed_huge_regions_are_reusable_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let region_off = {
        let heap = Heap::open(&ws, false).unwrap();
        let p = heap.reserve(5 * 1024 * 1024).unwrap();
        unsafe { heap.activate(p, None, None) };
        let off = heap.rel(p) - HEADER_SIZE as u64;
        unsafe { heap.free(p, None, None) };
        off
    };

    let heap = Heap::open(&ws, true).unwrap();
    let q = heap.reserve(3 * 1024 * 1024).unwrap();
    let q_off = heap.rel(q) - HEADER_SIZE as u64;
    assert!(
        q_off >= region_off && q_off < region_off + 3 * CHUNK_SIZE as u64,
        "recovered free-huge index did not serve the freed region"
    );
}

#[test]
fn live_huge_objects_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    {
        let heap = Heap::open(&ws, false).unwrap();
        let p = heap.reserve_named("blob", 4 * 1024 * 1024).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0x7c, 4 * 1024 * 1024);
            heap.persist(p, 4 * 1024 * 1024);
        }
        heap.activate_named("blob");
    }

    let heap = Heap::open(&ws, true).unwrap();
    let p = heap.get_named("blob").expect("blob survives");
    unsafe {
        assert_eq!(p.as_ptr().read(), 0x7c);
        assert_eq!(p.as_ptr().add(4 * 1024 * 1024 - 1).read(), 0x7c);
    }
}

#[test]
fn unactivated_reservations_vanish_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir);

    let obj_off = {
        let heap = Heap::open(&ws, false).unwrap();
        // reserved but never activated: after a crash this is "not allocated"
        let p = heap.reserve(96).unwrap();
        let _ = heap.reserve_named("ghost", 96).unwrap();
        heap.rel(p)
    };

    let heap = Heap::open(&ws, true).unwrap();
    assert!(!common::persistent_bit(&heap, obj_off));
    assert!(heap.get_named("ghost").is_none());
    common::walk_arenas(&heap);
}
