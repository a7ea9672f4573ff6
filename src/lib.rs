//! A NUMA-aware hugepage allocator: a flat array of per-hugepage
//! descriptors, carved into per-node sections with round-robin free lists,
//! a per-node active/inactive-file LRU, an associative page cache and a
//! reverse-map walker.
//!
//! The crate is built around one [`Allocator`], constructed once and driven
//! through a three-call init handshake ([`Allocator::range_set`],
//! [`Allocator::node_start_end_init`], [`Allocator::init`]) mirroring the
//! boot-time sequence of the system this is modeled on: first the total
//! managed physical range is declared, then each NUMA node's slice of it,
//! then the descriptor array and per-node structures are actually built and
//! every hugepage handed to its section's free list.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod free_alloc;
pub mod lru;
pub mod node;
pub mod range;
pub mod rmap;
pub mod section;
pub mod state;
pub mod wait;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use descriptor::{DescRef, HugepageDescriptor};
use node::{Node, VmStatItem};
use range::{HugepageRange, Pfn};

#[derive(Clone, Copy)]
struct PendingNodeBounds {
    start_pfn: Pfn,
    end_pfn: Pfn,
}

#[derive(Default)]
struct InitState {
    range: Option<HugepageRange>,
    node_bounds: BTreeMap<u16, PendingNodeBounds>,
}

/// Bundles every piece of global allocator state: the managed range, the
/// flat descriptor array, the per-node tables and the `hpnode_mask`/
/// `total_page` counters.
///
/// `free_page` (`spec.md` §3/§8: "`Σ nodes vm_stat[NR_FREE_PAGES] ==
/// free_page` at all quiescent points") is deliberately *not* tracked as
/// its own counter here — it is [`Self::free_pages`], a live sum over every
/// node's `NR_FREE_PAGES`. Anything that moves a descriptor on or off a
/// free list (`Allocator::alloc`/`free`/`free_list`, but also
/// `PageCache::delete` and `rmap::try_to_unmap_one`, which call
/// `free_alloc::free_one` directly against a `Node` without going through
/// `Allocator` at all) updates that node's own counter as a side effect of
/// the list move; deriving the global count from those same counters
/// instead of double-booking a second one means there is no second count
/// to drift out of sync with the first.
///
/// Cheap to construct (`Allocator::new`); unusable for allocation until the
/// init handshake completes.
pub struct Allocator {
    init: Mutex<InitState>,
    range: OnceLock<HugepageRange>,
    descriptors: OnceLock<Vec<HugepageDescriptor>>,
    nodes: OnceLock<BTreeMap<u16, Node>>,
    hpnode_mask: AtomicU64,
    total_page: AtomicU64,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    pub fn new() -> Self {
        Self {
            init: Mutex::new(InitState::default()),
            range: OnceLock::new(),
            descriptors: OnceLock::new(),
            nodes: OnceLock::new(),
            hpnode_mask: AtomicU64::new(0),
            total_page: AtomicU64::new(0),
        }
    }

    /// `hpa_start_nr_set`: declares the total physical range this allocator
    /// will manage, in bytes. Must be called exactly once, before any
    /// [`Self::node_start_end_init`] call.
    pub fn range_set(&self, start_addr: u64, mem_size: u64) {
        let range = HugepageRange::new(start_addr, mem_size);
        let mut init = self.init.lock().unwrap();
        assert!(init.range.is_none(), "range_set called twice");
        self.total_page.fetch_add(range.nr_pages(), Ordering::Relaxed);
        init.range = Some(range);
    }

    /// `hpa_node_start_end_init`: declares NUMA node `nid`'s byte range,
    /// clamped against the range already passed to [`Self::range_set`]. A
    /// node whose clamped span is empty is left out of `hpnode_mask`
    /// entirely — it never gets a [`Node`] at [`Self::init`] time.
    pub fn node_start_end_init(&self, nid: u16, start: u64, end: u64) {
        let mut init = self.init.lock().unwrap();
        let range = init
            .range
            .expect("range_set must be called before node_start_end_init");

        let addr1 = start / 4096;
        let addr2 = end / 4096;
        let node_start = range.start_pfn().max(addr1);
        let node_end = range.end_pfn().min(addr2);

        if node_start < node_end {
            init.node_bounds.insert(
                nid,
                PendingNodeBounds {
                    start_pfn: node_start,
                    end_pfn: node_end,
                },
            );
            self.hpnode_mask.fetch_or(1u64 << nid, Ordering::Relaxed);
        }
    }

    /// `hpa_init`: allocates the descriptor array, builds one [`Node`] per
    /// bit set in `hpnode_mask`, assigns every descriptor's routing fields
    /// (`hpa_memmap_init`), and finally hands every descriptor to its
    /// section's free list with `refcount` momentarily bounced through 1
    /// (`hpa_free_all_boot_hugepages`).
    ///
    /// Only descriptors inside some node's clamped span are freed this way;
    /// the original's boot-free loop instead walks the *entire* global pfn
    /// range regardless of node coverage, which corrupts routing on any pfn
    /// a node never claimed. Looping per-node span instead is the one
    /// deliberate behavioral deviation in this port (see `DESIGN.md`).
    pub fn init(&self) {
        let mut init = self.init.lock().unwrap();
        let range = init
            .range
            .expect("range_set must be called before init");
        let node_bounds = std::mem::take(&mut init.node_bounds);
        drop(init);

        let descriptors: Vec<HugepageDescriptor> = (0..range.nr_pages() as usize)
            .map(HugepageDescriptor::new)
            .collect();

        let mut nodes = BTreeMap::new();
        for (&nid, bounds) in &node_bounds {
            let spanned_hugepages = (bounds.end_pfn - bounds.start_pfn) / config::HUGEPAGE_PAGES;
            let node = Node::new(nid, bounds.start_pfn, spanned_hugepages);

            let mut pfn = bounds.start_pfn;
            for sid in 0..node.node_max_sections() {
                let section_hugepages = if sid + 1 == node.node_max_sections() {
                    (bounds.end_pfn - pfn) / config::HUGEPAGE_PAGES
                } else {
                    config::SECTION_SIZE as u64
                };
                for _ in 0..section_hugepages {
                    let index = range.pfn_to_index(pfn);
                    descriptors[index].set_routing(nid, sid as u16);
                    node.inc_present_pages();
                    pfn += config::HUGEPAGE_PAGES;
                }
            }

            nodes.insert(nid, node);
        }

        for (&nid, bounds) in &node_bounds {
            let node = &nodes[&nid];
            let mut pfn = bounds.start_pfn;
            while pfn < bounds.end_pfn {
                let index = range.pfn_to_index(pfn);
                let d = DescRef::from_ref(&descriptors[index]);
                state::set_refcounted(d);
                free_alloc::free_one(d, node);
                pfn += config::HUGEPAGE_PAGES;
            }
        }

        self.range.set(range).ok().expect("init called twice");
        self.descriptors
            .set(descriptors)
            .ok()
            .expect("init called twice");
        self.nodes.set(nodes).ok().expect("init called twice");

        log::info!(
            "hpa: initialized {} hugepages across {} node(s)",
            self.total_page.load(Ordering::Relaxed),
            self.nodes.get().unwrap().len()
        );
    }

    fn range(&self) -> &HugepageRange {
        self.range.get().expect("Allocator::init not called")
    }

    fn nodes(&self) -> &BTreeMap<u16, Node> {
        self.nodes.get().expect("Allocator::init not called")
    }

    /// The [`Node`] a descriptor belongs to. Panics if `d` does not belong
    /// to this allocator's descriptor array (it always does, in practice,
    /// since [`DescRef`]s only ever come from [`Self::alloc`]/lookup paths).
    pub fn node_of(&self, d: DescRef) -> &Node {
        self.nodes()
            .get(&d.node_id())
            .expect("descriptor routed to a node that was never initialized")
    }

    pub fn node(&self, nid: u16) -> Option<&Node> {
        self.nodes().get(&nid)
    }

    pub fn total_pages(&self) -> u64 {
        self.total_page.load(Ordering::Relaxed)
    }

    /// Live sum of every node's `NR_FREE_PAGES`, not an independently
    /// tracked counter — see the field doc comment on [`Allocator`] for why.
    pub fn free_pages(&self) -> u64 {
        self.nodes()
            .values()
            .map(|node| node.vm_stat(VmStatItem::FreePages))
            .sum()
    }

    pub fn is_managed_pfn(&self, p: Pfn) -> bool {
        self.range().is_managed_pfn(p)
    }

    pub fn is_managed_desc(&self, d: DescRef) -> bool {
        self.range().is_managed_index(d.index())
    }

    pub fn desc_to_nid(&self, d: DescRef) -> u16 {
        d.node_id()
    }

    pub fn desc_to_section(&self, d: DescRef) -> u16 {
        d.section_id()
    }

    pub fn desc_to_pfn(&self, d: DescRef) -> Pfn {
        self.range().index_to_pfn(d.index())
    }

    /// `hpa_alloc_page_node`: allocate from a specific node only.
    pub fn alloc_on_node(&self, nid: u16) -> Option<DescRef> {
        let node = self.node(nid)?;
        free_alloc::alloc_on_node(node)
    }

    /// `hpa_alloc_page`: tries every node present in `hpnode_mask`, in
    /// ascending node-id order, same as the original's `for_each_node_mask`
    /// walk.
    pub fn alloc(&self) -> Option<DescRef> {
        let mask = self.hpnode_mask.load(Ordering::Relaxed);
        let candidates: Vec<&Node> = self
            .nodes()
            .values()
            .filter(|node| mask & (1u64 << node.node_id()) != 0)
            .collect();
        free_alloc::alloc_any(candidates.into_iter())
    }

    /// `hpa_free_page`/`hpa_put_page`: decrements refcount, returning the
    /// descriptor to its section's free list once it reaches zero.
    pub fn free(&self, d: DescRef) {
        let node = self.node_of(d);
        free_alloc::free_one(d, node);
    }

    /// `hpa_free_page_list`: bulk free of descriptors the caller has
    /// already reduced to refcount zero — see [`free_alloc::free_list`]'s
    /// no-decrement contract.
    pub fn free_list(&self, batch: impl IntoIterator<Item = DescRef>) {
        let batch: Vec<(DescRef, &Node)> = batch.into_iter().map(|d| (d, self.node_of(d))).collect();
        free_alloc::free_list(batch);
    }

    pub fn trylock(&self, d: DescRef) -> bool {
        state::trylock(d)
    }

    pub fn lock(&self, d: DescRef) {
        state::lock(d, &self.node_of(d).wait_engine);
    }

    pub fn unlock(&self, d: DescRef) {
        state::unlock(d, &self.node_of(d).wait_engine);
    }
}
