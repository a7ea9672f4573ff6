//! `FreeAllocator`: round-robin-per-node, round-robin-across-nodes
//! allocation over section free lists.

use crate::descriptor::{DescRef, PageBit};
use crate::lru;
use crate::node::{LruList, Node, VmStatItem};
use crate::state;

/// `alloc_on_node(nid)`: scans up to `node_max_sections` sections starting
/// at the node's round-robin cursor. The first non-empty section yields its
/// head descriptor, which is handed out with `refcount = 1`, placed on the
/// inactive-file LRU list, and accounted for in the node's counters.
/// Returns `None` if every section is empty — a normal, non-error result.
pub fn alloc_on_node(node: &Node) -> Option<DescRef> {
    let max = node.node_max_sections();
    for _ in 0..max {
        let sid = node.next_section_cursor();
        let mut section = node.section(sid as u16).lock();
        let Some(d) = section.pop_front() else {
            continue;
        };
        drop(section);

        state::set_refcounted(d);
        lru::add_to_lru(node, d, LruList::InactiveFile);

        log::trace!(
            "alloc_on_node: node={} section={} index={}",
            node.node_id(),
            sid,
            d.index()
        );
        return Some(d);
    }
    log::debug!("alloc_on_node: node {} exhausted", node.node_id());
    None
}

/// `alloc_any()`: tries nodes in id-ascending order (the caller iterates
/// `hpnode_mask`-present nodes; see [`crate::Allocator::alloc`]) and returns
/// the first successful [`alloc_on_node`].
pub fn alloc_any<'a>(nodes: impl Iterator<Item = &'a Node>) -> Option<DescRef> {
    for node in nodes {
        if let Some(d) = alloc_on_node(node) {
            return Some(d);
        }
    }
    None
}

/// `free_one(d)`: decrements refcount; only when it reaches zero does the
/// descriptor actually return to its section's free list. Returns whether
/// this call performed that transition.
pub fn free_one(d: DescRef, node: &Node) -> bool {
    if !state::put_testzero(d) {
        return false;
    }
    free_path(d, node);
    true
}

/// `free_list(batch)`: bulk free path for descriptors whose refcount is
/// already (by caller contract) zero — no decrement is performed here,
/// matching the original's documented "refcount is 1, no decrement"
/// contract (Open Question 3, `SPEC_FULL.md` §C.3): violating the
/// precondition corrupts the free list, it is not guarded against.
pub fn free_list<'a>(batch: impl IntoIterator<Item = (DescRef, &'a Node)>) {
    for (d, node) in batch {
        free_path(d, node);
    }
}

/// Shared tail of `free_one`/`free_list`: if the descriptor is on an LRU
/// list, detach it and adjust the matching counter downward; otherwise it
/// was a bare-allocated (never cached, never LRU-tracked) descriptor.
/// Either way it ends on its section's free list with `NR_FREE_PAGES`
/// incremented.
fn free_path(d: DescRef, node: &Node) {
    if state::test_page_lru(d) {
        let which = if d.test_bit(PageBit::ACTIVE) {
            LruList::ActiveFile
        } else {
            LruList::InactiveFile
        };
        lru::del_from_lru(node, d, which);
        state::clear_page_lru(d);
        d.clear_bit(PageBit::ACTIVE);
    }

    {
        let mut section = node.section(d.section_id()).lock();
        section.push_front(d);
    }
    node.adjust_stat(VmStatItem::FreePages, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECTION_SIZE;
    use crate::descriptor::HugepageDescriptor;

    fn seeded_node(node_id: u16, nr_pages: usize) -> (Node, Vec<HugepageDescriptor>) {
        let node = Node::new(node_id, 0, nr_pages as u64);
        let descs: Vec<HugepageDescriptor> = (0..nr_pages).map(HugepageDescriptor::new).collect();
        for (i, d) in descs.iter().enumerate() {
            let sid = (i / SECTION_SIZE) as u16;
            d.set_routing(node_id, sid);
            let dref = DescRef::from_ref(d);
            node.section(sid).lock().push_front(dref);
            node.adjust_stat(VmStatItem::FreePages, 1);
        }
        (node, descs)
    }

    #[test]
    fn alloc_then_free_round_trip() {
        let (node, _descs) = seeded_node(0, 8);
        assert_eq!(node.vm_stat(VmStatItem::FreePages), 8);

        let d = alloc_on_node(&node).expect("must allocate");
        assert_eq!(state::get_refcount(d), 1);
        assert!(state::test_page_lru(d));
        assert_eq!(node.vm_stat(VmStatItem::FreePages), 7);
        assert_eq!(node.vm_stat(VmStatItem::InactiveFile), 1);

        free_one(d, &node);
        assert_eq!(node.vm_stat(VmStatItem::FreePages), 8);
        assert_eq!(node.vm_stat(VmStatItem::InactiveFile), 0);
        assert!(!state::test_page_lru(d));
    }

    #[test]
    fn exhaustion_returns_none() {
        let (node, _descs) = seeded_node(0, 1);
        assert!(alloc_on_node(&node).is_some());
        assert!(alloc_on_node(&node).is_none());
    }

    #[test]
    fn round_robin_spreads_across_sections() {
        let (node, _descs) = seeded_node(0, 2 * SECTION_SIZE);
        let mut seen_sections = std::collections::HashSet::new();
        for _ in 0..2 * SECTION_SIZE {
            let d = alloc_on_node(&node).expect("must allocate");
            seen_sections.insert(d.section_id());
        }
        assert_eq!(seen_sections.len(), 2);
    }
}
