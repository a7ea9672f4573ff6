//! `LRUEngine`: per-node active/inactive-file lists with per-node counters.
//!
//! Grounded on `hpa_wait.c`'s `add_hpage_to_lruvec` (insertion side) and
//! `hpa.c`'s `__hpa_free_page` (removal side).

use crate::descriptor::{DescRef, PageBit};
use crate::node::{LruList, Node, VmStatItem};
use crate::state;

/// `add_to_lru(d, which)`: precondition `PG_LRU == 0`. Sets `PG_LRU` (and
/// `PG_active` iff `which == ActiveFile`), inserts at the list head,
/// decrements `NR_FREE_PAGES` and increments the matching `NR_LRU_BASE +
/// which` counter. All under the node's `lru_lock`.
pub fn add_to_lru(node: &Node, d: DescRef, which: LruList) {
    debug_assert!(!state::test_page_lru(d), "descriptor already on an LRU list");

    {
        let mut lruvec = node.lruvec_lock();
        lruvec.insert_front(which, d);
    }
    state::set_page_lru(d);
    if matches!(which, LruList::ActiveFile) {
        d.set_bit(PageBit::ACTIVE);
    }

    node.adjust_stat(VmStatItem::FreePages, -1);
    let item = match which {
        LruList::ActiveFile => VmStatItem::ActiveFile,
        LruList::InactiveFile => VmStatItem::InactiveFile,
    };
    node.adjust_stat(item, 1);
}

/// `del_from_lru(d, which)`: unlinks from the list and decrements the
/// matching counter. The caller is responsible for clearing `PG_LRU` (and
/// `PG_active`) when appropriate, matching the original's split
/// responsibility between list removal and bit clearing.
pub fn del_from_lru(node: &Node, d: DescRef, which: LruList) {
    {
        let mut lruvec = node.lruvec_lock();
        lruvec.remove(which, d);
    }
    let item = match which {
        LruList::ActiveFile => VmStatItem::ActiveFile,
        LruList::InactiveFile => VmStatItem::InactiveFile,
    };
    node.adjust_stat(item, -1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HugepageDescriptor;

    #[test]
    fn add_then_del_restores_counters() {
        let node = Node::new(0, 0, crate::config::SECTION_SIZE as u64);
        let desc = HugepageDescriptor::new(0);
        let d = DescRef::from_ref(&desc);

        add_to_lru(&node, d, LruList::InactiveFile);
        assert!(state::test_page_lru(d));
        assert_eq!(node.vm_stat(VmStatItem::InactiveFile), 1);

        del_from_lru(&node, d, LruList::InactiveFile);
        state::clear_page_lru(d);
        assert!(!state::test_page_lru(d));
        assert_eq!(node.vm_stat(VmStatItem::InactiveFile), 0);
    }
}
