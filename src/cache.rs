//! `PageCache`: an associative `(mapping, offset) -> descriptor` store,
//! doubling as the `MappingHandle` a descriptor's `cache_slot` points back
//! into.
//!
//! Grounded on `hpa_wait.c`'s `hpa_add_page_cache_locked`/
//! `__hpa_to_page_cache`/`__hpa_delete_from_page_cache`/
//! `hpa_delete_from_page_cache`/`hpa_find_lock_page`/`hpa_clear_huge_page`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::descriptor::{DescRef, PageBit};
use crate::error::CacheError;
use crate::free_alloc;
use crate::node::Node;
use crate::rmap::AddressSpaceOps;
use crate::state;
use crate::wait::WaitEngine;

/// Host-provided access to a descriptor's backing bytes — the `kmap_atomic`
/// equivalent for a hosted port with no real kernel page tables to walk.
pub trait PageBackingStore: Send + Sync {
    /// A pointer to the start of `d`'s hugepage-sized backing storage,
    /// valid for the duration of the call.
    fn desc_address(&self, d: DescRef) -> *mut u8;
}

/// One mapping's page cache: a `(offset -> descriptor)` table plus the
/// count of resident descriptors, guarded together by `tree_lock`.
pub struct PageCache {
    pages: spin::Mutex<HashMap<u64, DescRef>>,
    nrpages: AtomicU64,
    vmas: Arc<dyn AddressSpaceOps>,
    freepage: Option<Box<dyn Fn(DescRef) + Send + Sync>>,
}

impl PageCache {
    pub fn new(vmas: Arc<dyn AddressSpaceOps>) -> Arc<Self> {
        Arc::new(Self {
            pages: spin::Mutex::new(HashMap::new()),
            nrpages: AtomicU64::new(0),
            vmas,
            freepage: None,
        })
    }

    pub fn with_freepage(
        vmas: Arc<dyn AddressSpaceOps>,
        freepage: Box<dyn Fn(DescRef) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages: spin::Mutex::new(HashMap::new()),
            nrpages: AtomicU64::new(0),
            vmas,
            freepage: Some(freepage),
        })
    }

    pub fn nrpages(&self) -> u64 {
        self.nrpages.load(Ordering::Relaxed)
    }

    pub(crate) fn vmas(&self) -> &Arc<dyn AddressSpaceOps> {
        &self.vmas
    }

    /// `hpa_add_to_page_cache` / `__hpa_to_page_cache` / `hpa_add_page_cache_locked`:
    /// reserves insert capacity, takes a reference, sets `PG_locked` (the
    /// descriptor must not already be in any cache or list), and publishes
    /// it at `offset`. On a colliding offset or a failed capacity
    /// reservation the reference and the lock bit are both rolled back.
    /// Leaves `d` locked on success, for the caller to populate and unlock.
    ///
    /// `d.cache_slot()` (the `mapping`/`index` back-reference) is stored
    /// *before* the descriptor is published into `pages`, matching
    /// `spec.md` §5's ordering guarantee: "a descriptor published via
    /// page-cache insert is visible to lookups only after all its field
    /// stores."
    pub fn insert(self: Arc<Self>, d: DescRef, offset: u64, node: &Node) -> Result<(), CacheError> {
        debug_assert!(!d.test_bit(PageBit::LOCKED), "descriptor already locked");
        d.set_bit(PageBit::LOCKED);
        d.inc_refcount();

        let mut pages = self.pages.lock();
        if pages.try_reserve(1).is_err() {
            drop(pages);
            d.unlock_bit();
            free_alloc::free_one(d, node);
            return Err(CacheError::OutOfMemory);
        }
        if pages.contains_key(&offset) {
            drop(pages);
            d.unlock_bit();
            free_alloc::free_one(d, node);
            return Err(CacheError::AlreadyPresent);
        }

        *d.cache_slot().lock().unwrap() = Some((self.clone(), offset));
        pages.insert(offset, d);
        drop(pages);
        self.nrpages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `hpa_find_lock_page`: looks up `offset`, takes a reference, then
    /// blocks until the descriptor is locked. Re-validates `d.mapping ==
    /// self && d.index == offset` once locked, since the descriptor may
    /// have been concurrently deleted (and possibly reused elsewhere)
    /// between the map lookup and the lock acquisition; on a mismatch the
    /// lock and reference are released and the lookup restarts from
    /// scratch. Returns `None` if nothing is cached at `offset`.
    pub fn lookup_and_lock(
        self: Arc<Self>,
        offset: u64,
        wait_engine: &WaitEngine,
        node: &Node,
    ) -> Option<DescRef> {
        loop {
            let d = {
                let pages = self.pages.lock();
                let d = *pages.get(&offset)?;
                d.inc_refcount();
                d
            };
            state::lock(d, wait_engine);

            let still_resident = {
                let slot = d.cache_slot().lock().unwrap();
                matches!(
                    slot.as_ref(),
                    Some((mapping, idx)) if Arc::ptr_eq(mapping, &self) && *idx == offset
                )
            };
            if still_resident {
                return Some(d);
            }

            state::unlock(d, wait_engine);
            free_alloc::free_one(d, node);
        }
    }

    /// `__hpa_delete_from_page_cache`: the raw tree-removal primitive.
    /// Requires `d` locked and resident in this cache; removes it from
    /// `pages` and clears its `cache_slot`, asserting it is fully unmapped
    /// (`BUG_ON(page_mapped(page))` in the original). Does not run the
    /// `freepage` callback or drop the cache's reference — callers that
    /// already hold those responsibilities (e.g. a batch teardown that
    /// will `free_list` afterwards) call this directly; [`Self::delete`]
    /// is the full `hpa_delete_from_page_cache` wrapper for everyone else.
    pub fn __delete_locked(&self, d: DescRef) {
        debug_assert!(d.test_bit(PageBit::LOCKED), "delete requires d locked");
        debug_assert!(d.mapcount() < 0, "cannot delete a still-mapped descriptor");

        let offset = {
            let mut slot = d.cache_slot().lock().unwrap();
            let (_, offset) = slot.take().expect("delete requires d cache-resident");
            offset
        };
        self.pages.lock().remove(&offset);
        self.nrpages.fetch_sub(1, Ordering::Relaxed);
    }

    /// `hpa_delete_from_page_cache`: [`Self::__delete_locked`] plus the
    /// optional `freepage` callback and the cache's own reference drop via
    /// [`free_alloc::free_one`].
    pub fn delete(self: Arc<Self>, d: DescRef, node: &Node) {
        self.__delete_locked(d);

        if let Some(freepage) = &self.freepage {
            freepage(d);
        }
        free_alloc::free_one(d, node);
    }
}

/// `hpa_clear_huge_page`: zero-fills `d`'s backing bytes.
pub fn clear_page_zero(d: DescRef, backing: &dyn PageBackingStore) {
    let ptr = backing.desc_address(d);
    unsafe {
        std::ptr::write_bytes(ptr, 0, crate::config::HUGEPAGE_SIZE as usize);
    }
}
