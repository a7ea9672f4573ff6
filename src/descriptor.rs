//! The per-hugepage descriptor: a packed atomic flags/routing word plus
//! refcount, mapcount, cache back-pointer and an intrusive list link.
//!
//! Shape is adapted from the teacher's `RawPage`/`PageFlags`/`RawPagePtr`
//! (`src/kernel/mem/page_alloc/raw_page.rs`): one atomic word carries both
//! the boolean page flags and (here) the immutable node/section routing
//! fields the original C struct packs into `page->flags`.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use intrusive_list::Link;

use crate::cache::PageCache;

const FLAG_BITS: u32 = 8;
const NODE_BITS: u32 = 8;
const SECTION_BITS: u32 = 16;
const NODE_SHIFT: u32 = FLAG_BITS;
const SECTION_SHIFT: u32 = FLAG_BITS + NODE_BITS;
const NODE_MASK: u32 = ((1u32 << NODE_BITS) - 1) << NODE_SHIFT;
const SECTION_MASK: u32 = ((1u32 << SECTION_BITS) - 1) << SECTION_SHIFT;

bitflags::bitflags! {
    /// The boolean bits of a descriptor's packed flags word. Bit positions
    /// are, as `spec.md` puts it, "opaque mask/shift pairs" — nothing outside
    /// this module should rely on the numeric values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageBit: u32 {
        const LOCKED  = 1 << 0;
        const LRU     = 1 << 1;
        const ACTIVE  = 1 << 2;
        const DIRTY   = 1 << 3;
        const PRIVATE = 1 << 4;
    }
}

/// Per-hugepage metadata entry. One lives in the flat descriptor array for
/// every managed hugepage; the array is allocated once at init and never
/// resized or freed.
pub struct HugepageDescriptor {
    /// Packed {flag bits, node id, section id} word.
    flags: AtomicU32,
    /// This descriptor's position in the flat array — immutable after init,
    /// and what `desc_to_pfn`/`pfn_to_desc` key off of.
    desc_index: usize,
    /// `refcount == 0` iff the descriptor is free (on a section free list).
    refcount: AtomicU32,
    /// `-1` iff not mapped in any VMA; `>= 0` iff `mapcount + 1` PTEs
    /// reference this descriptor.
    mapcount: AtomicI32,
    /// The owning mapping and the offset this descriptor is cached at, set
    /// together by `PageCache::insert` and cleared together by
    /// `PageCache::delete`.
    cache_slot: Mutex<Option<(Arc<PageCache>, u64)>>,
    /// Intrusive link: a descriptor is on exactly one of {section free
    /// list, node active-file list, node inactive-file list} or detached.
    pub(crate) link: Link,
    /// Opaque scratch fields the original leaves uninterpreted by the core.
    private: AtomicUsize,
    pfn_offset: AtomicU64,
}

impl HugepageDescriptor {
    pub(crate) fn new(desc_index: usize) -> Self {
        Self {
            flags: AtomicU32::new(0),
            desc_index,
            refcount: AtomicU32::new(0),
            mapcount: AtomicI32::new(-1),
            cache_slot: Mutex::new(None),
            link: Link::new(),
            private: AtomicUsize::new(0),
            pfn_offset: AtomicU64::new(0),
        }
    }

    pub const fn index(&self) -> usize {
        self.desc_index
    }

    /// Sets the node/section routing fields. Callable only during init,
    /// before the descriptor becomes reachable through any list — the
    /// read-modify-write below is not atomic with respect to concurrent
    /// flag-bit mutators, matching §4.1's documented constraint.
    pub(crate) fn set_routing(&self, node_id: u16, section_id: u16) {
        let bits = self.flags.load(Ordering::Relaxed) & !(NODE_MASK | SECTION_MASK);
        let packed = bits
            | ((node_id as u32) << NODE_SHIFT) & NODE_MASK
            | ((section_id as u32) << SECTION_SHIFT) & SECTION_MASK;
        self.flags.store(packed, Ordering::Relaxed);
    }

    pub fn node_id(&self) -> u16 {
        ((self.flags.load(Ordering::Relaxed) & NODE_MASK) >> NODE_SHIFT) as u16
    }

    pub fn section_id(&self) -> u16 {
        ((self.flags.load(Ordering::Relaxed) & SECTION_MASK) >> SECTION_SHIFT) as u16
    }

    pub(crate) fn private(&self) -> &AtomicUsize {
        &self.private
    }

    pub(crate) fn pfn_offset(&self) -> &AtomicU64 {
        &self.pfn_offset
    }

    pub(crate) fn cache_slot(&self) -> &Mutex<Option<(Arc<PageCache>, u64)>> {
        &self.cache_slot
    }

    // -- bit ops -----------------------------------------------------------

    pub fn test_bit(&self, bit: PageBit) -> bool {
        self.flags.load(Ordering::Acquire) & bit.bits() != 0
    }

    pub(crate) fn set_bit(&self, bit: PageBit) {
        self.flags.fetch_or(bit.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_bit(&self, bit: PageBit) {
        self.flags.fetch_and(!bit.bits(), Ordering::AcqRel);
    }

    /// Atomic test-and-set of `PageBit::LOCKED`. Returns `true` iff this
    /// call transitioned the bit from unset to set.
    pub(crate) fn try_lock_bit(&self) -> bool {
        self.flags.fetch_or(PageBit::LOCKED.bits(), Ordering::Acquire) & PageBit::LOCKED.bits()
            == 0
    }

    /// Clears `PageBit::LOCKED` with a release barrier. Idempotent: calling
    /// this on an already-unlocked descriptor is a no-op on state.
    pub(crate) fn unlock_bit(&self) {
        self.flags
            .fetch_and(!PageBit::LOCKED.bits(), Ordering::Release);
    }

    // -- refcount ------------------------------------------------------------

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn inc_refcount(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// `put_testzero`: atomic decrement, returns whether the new value is
    /// zero.
    pub(crate) fn put_testzero(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "refcount underflow on descriptor {}", self.desc_index);
        prev == 1
    }

    /// `set_refcounted`: sets refcount to 1, used when handing out a freshly
    /// allocated descriptor.
    pub(crate) fn set_refcounted(&self) {
        self.refcount.store(1, Ordering::Release);
    }

    // -- mapcount --------------------------------------------------------

    pub fn mapcount(&self) -> i32 {
        self.mapcount.load(Ordering::Acquire)
    }

    pub(crate) fn inc_mapcount(&self) {
        self.mapcount.fetch_add(1, Ordering::AcqRel);
    }

    /// `remove_rmap`: atomically adds -1 to mapcount; returns whether the
    /// result is negative (i.e. this was the mapped -> unmapped transition).
    pub(crate) fn add_negative_mapcount(&self, delta: i32) -> bool {
        let prev = self.mapcount.fetch_add(delta, Ordering::AcqRel);
        prev + delta < 0
    }

    pub(crate) fn reset_mapcount_unmapped(&self) {
        self.mapcount.store(-1, Ordering::Release);
    }
}

/// A `Copy`able handle to a descriptor, analogous to the teacher's
/// `RawPagePtr`. Dereferencing is always safe: descriptors live for the
/// program's whole life once the descriptor array is allocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescRef(NonNull<HugepageDescriptor>);

unsafe impl Send for DescRef {}
unsafe impl Sync for DescRef {}

impl DescRef {
    pub(crate) fn from_ref(desc: &HugepageDescriptor) -> Self {
        Self(NonNull::from(desc))
    }

    pub(crate) fn link_ptr(self) -> NonNull<Link> {
        unsafe { NonNull::new_unchecked(&raw mut (*self.0.as_ptr()).link) }
    }

    /// Recovers the owning descriptor from a pointer to its embedded
    /// `Link`, mirroring the teacher's `container_of!`-based
    /// `BuddyRawPage::from_link`.
    pub(crate) unsafe fn from_link(link: NonNull<Link>) -> Self {
        unsafe { Self(intrusive_list::container_of!(link.as_ptr(), HugepageDescriptor, link)) }
    }
}

impl std::ops::Deref for DescRef {
    type Target = HugepageDescriptor;

    fn deref(&self) -> &Self::Target {
        unsafe { self.0.as_ref() }
    }
}

impl std::fmt::Debug for DescRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DescRef(index={}, node={}, section={}, refcount={}, mapcount={})",
            self.index(),
            self.node_id(),
            self.section_id(),
            self.refcount(),
            self.mapcount()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_fields_pack_independently_of_flag_bits() {
        let desc = HugepageDescriptor::new(7);
        desc.set_routing(3, 1000);
        desc.set_bit(PageBit::LRU);
        desc.set_bit(PageBit::DIRTY);
        assert_eq!(desc.node_id(), 3);
        assert_eq!(desc.section_id(), 1000);
        assert!(desc.test_bit(PageBit::LRU));
        assert!(desc.test_bit(PageBit::DIRTY));
        assert!(!desc.test_bit(PageBit::LOCKED));
    }

    #[test]
    fn trylock_is_exclusive() {
        let desc = HugepageDescriptor::new(0);
        assert!(desc.try_lock_bit());
        assert!(!desc.try_lock_bit());
        desc.unlock_bit();
        assert!(desc.try_lock_bit());
    }

    #[test]
    fn refcount_put_testzero() {
        let desc = HugepageDescriptor::new(0);
        desc.set_refcounted();
        assert_eq!(desc.refcount(), 1);
        assert!(desc.put_testzero());
    }
}
