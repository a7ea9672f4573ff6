//! `PageState`: the bit/counter machine on a descriptor, split from
//! [`crate::descriptor`] so the suspending `lock` operation (the only one
//! that needs a wait queue) lives beside its non-suspending siblings.

use crate::descriptor::{DescRef, PageBit};
use crate::wait::WaitEngine;

/// Atomic test-and-set of `PG_locked`. Never suspends.
pub fn trylock(d: DescRef) -> bool {
    d.try_lock_bit()
}

/// Loops `trylock` until it succeeds, parking on `wait_engine` between
/// attempts. May suspend; must not be called with interrupts disabled (in
/// this hosted port: must not be called while holding `lru_lock` or
/// `tree_lock`).
pub fn lock(d: DescRef, wait_engine: &WaitEngine) {
    if trylock(d) {
        return;
    }
    wait_engine.wait_until(d, PageBit::LOCKED, || trylock(d));
}

/// Clears `PG_locked` with a release barrier, then wakes all waiters.
/// Idempotent: unlocking an already-unlocked descriptor touches no state
/// beyond issuing a (harmless) wake.
pub fn unlock(d: DescRef, wait_engine: &WaitEngine) {
    d.unlock_bit();
    wait_engine.wake_all();
}

pub fn set_page_lru(d: DescRef) {
    d.set_bit(PageBit::LRU);
}
pub fn clear_page_lru(d: DescRef) {
    d.clear_bit(PageBit::LRU);
}
pub fn test_page_lru(d: DescRef) -> bool {
    d.test_bit(PageBit::LRU)
}

pub fn set_page_active(d: DescRef) {
    d.set_bit(PageBit::ACTIVE);
}
pub fn clear_page_active(d: DescRef) {
    d.clear_bit(PageBit::ACTIVE);
}
pub fn test_page_active(d: DescRef) -> bool {
    d.test_bit(PageBit::ACTIVE)
}

pub fn set_page_dirty(d: DescRef) {
    d.set_bit(PageBit::DIRTY);
}
pub fn clear_page_dirty(d: DescRef) {
    d.clear_bit(PageBit::DIRTY);
}
pub fn test_page_dirty(d: DescRef) -> bool {
    d.test_bit(PageBit::DIRTY)
}

pub fn set_page_private(d: DescRef) {
    d.set_bit(PageBit::PRIVATE);
}
pub fn clear_page_private(d: DescRef) {
    d.clear_bit(PageBit::PRIVATE);
}
pub fn test_page_private(d: DescRef) -> bool {
    d.test_bit(PageBit::PRIVATE)
}

pub fn get_refcount(d: DescRef) -> u32 {
    d.refcount()
}

pub fn inc_refcount(d: DescRef) {
    d.inc_refcount();
}

/// Atomic decrement; returns whether the new value is zero.
pub fn put_testzero(d: DescRef) -> bool {
    d.put_testzero()
}

pub fn set_refcounted(d: DescRef) {
    d.set_refcounted();
}

pub fn get_mapcount(d: DescRef) -> i32 {
    d.mapcount()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HugepageDescriptor;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_blocks_until_unlock() {
        let desc = Arc::new(HugepageDescriptor::new(0));
        let wait = Arc::new(WaitEngine::new());
        let d = DescRef::from_ref(&desc);
        lock(d, &wait);

        let wait2 = wait.clone();
        let desc2 = desc.clone();
        let unlocked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let unlocked2 = unlocked.clone();

        let handle = thread::spawn(move || {
            let d = DescRef::from_ref(&desc2);
            lock(d, &wait2);
            assert!(unlocked2.load(std::sync::atomic::Ordering::SeqCst));
            unlock(d, &wait2);
        });

        thread::sleep(Duration::from_millis(20));
        unlocked.store(true, std::sync::atomic::Ordering::SeqCst);
        unlock(d, &wait);
        handle.join().unwrap();
    }
}
