// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Adaptive spin backoff and atomic views of persistent state tags.
//
// The `(usage, state)` tag is the first byte of every persistent header.
// Concurrent operations on the same object are ordered by CAS on that
// byte; the loops here spin with adaptive backoff: busy → pause → yield
// → sleep.

use std::sync::atomic::{AtomicU8, Ordering};

/// Adaptive backoff between CAS retries.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Atomic view of the tag byte at the start of a persistent header.
///
/// # Safety
/// `hdr` must point at a mapped header whose first byte is the tag.
#[inline]
pub(crate) unsafe fn tag_ref<'a>(hdr: *mut u8) -> &'a AtomicU8 {
    &*(hdr as *const AtomicU8)
}

/// Spin until the tag transitions `from` → `to`.
///
/// Excludes every other in-flight operation on the object: whoever holds a
/// transient state wins, everyone else waits for `from` to reappear.
#[inline]
pub(crate) fn cas_tag_spin(tag: &AtomicU8, from: u8, to: u8) {
    let mut k = 0u32;
    while tag
        .compare_exchange_weak(from, to, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        adaptive_yield(&mut k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_tag_transitions() {
        let mut byte = 0x52u8;
        let tag = unsafe { tag_ref(&mut byte as *mut u8) };
        cas_tag_spin(tag, 0x52, 0x55);
        assert_eq!(tag.load(Ordering::Relaxed), 0x55);
    }
}
