//! `ReverseMap`: given a cached, mapped descriptor, walk every VMA that
//! maps it and perform unmap-one / referenced-one.
//!
//! The foreign data structures this needs (`mm`, `vma`, PTEs) are specified
//! as the trait surface below — exactly the hooks named in `spec.md` §9's
//! "Reverse-map walking foreign data structures" pattern translation:
//! `interval_query`, `pte_for_address`, `pte_present`, `pte_to_pfn`,
//! `pte_clear_flush`, `flush_cache_page`, `mmu_notifier_invalidate_page`,
//! `page_test_and_clear_young`. No other hook is added.

use std::sync::Arc;

use crate::config::HUGEPAGE_PAGES;
use crate::descriptor::DescRef;
use crate::error::UnmapResult;
use crate::free_alloc;
use crate::node::Node;
use crate::range::Pfn;
use crate::state;
use crate::wait::WaitEngine;

bitflags::bitflags! {
    /// Mirrors the subset of `vm_area_struct::vm_flags` this core reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const LOCKED    = 1 << 0;
        const SEQ_READ  = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Mirrors `enum ttu_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TtuFlags: u32 {
        const IGNORE_MLOCK  = 1 << 0;
        const MUNLOCK       = 1 << 1;
        const IGNORE_ACCESS = 1 << 2;
    }
}

/// A virtual-memory region mapping some range of a mapping's pgoff space.
pub trait Vma: Send + Sync {
    fn vm_start(&self) -> u64;
    fn vm_pgoff(&self) -> u64;
    fn vm_flags(&self) -> VmFlags;
    fn mm(&self) -> Arc<dyn MmOps>;
}

/// The address space (`mm_struct`) owning a VMA's page tables.
pub trait MmOps: Send + Sync {
    /// Looks up and locks the PTE backing `address`, under
    /// `vma.vm_mm.page_table_lock`. Returns `None` if no PTE is mapped
    /// there at all (pgd/pud/pmd not present) — the caller still must
    /// check `pte_present`/`pte_to_pfn` on what comes back.
    fn pte_for_address(&self, address: u64) -> Option<Box<dyn PteHandle + '_>>;
    fn mmu_notifier_invalidate_page(&self, address: u64);
    fn update_hiwater_rss(&self);
}

/// A locked handle to one PTE slot.
pub trait PteHandle {
    fn pte_present(&self) -> bool;
    fn pte_to_pfn(&self) -> Pfn;
    /// `ptep_clear_flush_young_notify`: clears the accessed bit, returns
    /// whether it was set beforehand.
    fn clear_flush_young(&mut self) -> bool;
    /// `ptep_clear_flush` + `pte_dirty`: atomically reads and clears the
    /// PTE, returning whether the cleared value was dirty.
    fn clear_flush(&mut self) -> bool;
    fn flush_cache_page(&self);
}

/// The mapping's VMA interval index (`mapping.i_mmap`).
pub trait AddressSpaceOps: Send + Sync {
    /// Every VMA whose pgoff interval contains `pgoff`.
    fn interval_query(&self, pgoff: u64) -> Vec<Arc<dyn Vma>>;
}

/// Host-provided hooks with no natural home on `Vma`/`MmOps`.
pub trait PhysOps: Send + Sync {
    fn page_test_and_clear_young(&self, pfn: Pfn) -> bool;
}

/// `hpa_vma_address`: `vma.vm_start + ((pgoff * 512 - vma.vm_pgoff) * 4096)`.
pub fn vma_address(vma: &dyn Vma, pgoff: u64) -> u64 {
    let address = vma.vm_start() + ((pgoff * HUGEPAGE_PAGES - vma.vm_pgoff()) * 4096);
    debug_assert!(address >= vma.vm_start(), "vma_address underflowed vm_start");
    address
}

/// `remove_rmap(d)`: atomically adds -1 to mapcount. Returns whether this
/// was the mapped -> unmapped transition (result went negative); a true
/// global file-mapped-statistic decrement on that transition is explicitly
/// out of scope here (`spec.md` §4.6).
pub fn remove_rmap(d: DescRef) -> bool {
    d.add_negative_mapcount(-1)
}

/// `try_to_unmap_one`: tears down a single PTE mapping `d` in `vma` at
/// `address`. Never touches state beyond the accessed-bit clear attempt
/// when it returns `Fail`.
pub fn try_to_unmap_one(
    d: DescRef,
    pfn: Pfn,
    node: &Node,
    vma: &dyn Vma,
    address: u64,
    flags: TtuFlags,
) -> UnmapResult {
    if flags.contains(TtuFlags::MUNLOCK) && !vma.vm_flags().contains(VmFlags::LOCKED) {
        return UnmapResult::Again;
    }

    let mm = vma.mm();
    let Some(mut pte) = mm.pte_for_address(address) else {
        return UnmapResult::Again;
    };

    if !pte.pte_present() || pte.pte_to_pfn() != pfn {
        return UnmapResult::Again;
    }

    #[cfg(feature = "vm-locked")]
    if !flags.contains(TtuFlags::IGNORE_MLOCK) && vma.vm_flags().contains(VmFlags::LOCKED) {
        return UnmapResult::Mlock;
    }

    if !flags.contains(TtuFlags::IGNORE_ACCESS) && pte.clear_flush_young() {
        return UnmapResult::Fail;
    }

    pte.flush_cache_page();
    let was_dirty = pte.clear_flush();
    if was_dirty {
        state::set_page_dirty(d);
    }
    mm.update_hiwater_rss();
    remove_rmap(d);
    free_alloc::free_one(d, node);
    mm.mmu_notifier_invalidate_page(address);

    UnmapResult::Again
}

/// `try_to_unmap(d, flags)`: requires `d` locked and cache-resident.
/// Iterates the mapping's interval index; stops when any iteration returns
/// not-`Again` or `mapcount` reaches -1. Final result is `Success` exactly
/// when `mapcount == -1` and no `Mlock` was seen.
pub fn try_to_unmap(d: DescRef, pfn: Pfn, node: &Node, flags: TtuFlags) -> UnmapResult {
    let slot = d.cache_slot().lock().unwrap();
    let Some((mapping, offset)) = slot.as_ref().cloned() else {
        return UnmapResult::Again;
    };
    drop(slot);

    let mut ret = UnmapResult::Again;
    for vma in mapping.vmas().interval_query(offset) {
        let address = vma_address(vma.as_ref(), offset);
        ret = try_to_unmap_one(d, pfn, node, vma.as_ref(), address, flags);
        if ret != UnmapResult::Again || d.mapcount() < 0 {
            break;
        }
    }

    if ret != UnmapResult::Mlock && d.mapcount() < 0 {
        UnmapResult::Success
    } else {
        ret
    }
}

/// `page_referenced_one`: returns 1 iff the PTE's accessed bit was set
/// (and cleared), unless the VMA is `VM_SequentialReadHint`, in which case
/// the bit is cleared without counting. Decrements `*mapcount`; if the VMA
/// is `VM_LOCKED`, forces `*mapcount = 0` (breaking the caller's loop) and
/// ORs `VM_LOCKED` into `*vm_flags`.
pub fn page_referenced_one(
    d: DescRef,
    pfn: Pfn,
    vma: &dyn Vma,
    address: u64,
    mapcount: &mut i32,
    vm_flags: &mut VmFlags,
) -> i32 {
    let mm = vma.mm();
    let Some(mut pte) = mm.pte_for_address(address) else {
        return 0;
    };
    if !pte.pte_present() || pte.pte_to_pfn() != pfn {
        return 0;
    }

    if vma.vm_flags().contains(VmFlags::LOCKED) {
        *mapcount = 0;
        *vm_flags |= VmFlags::LOCKED;
        return 0;
    }

    let mut referenced = 0;
    if pte.clear_flush_young() && !vma.vm_flags().contains(VmFlags::SEQ_READ) {
        referenced += 1;
    }

    *mapcount -= 1;
    if referenced != 0 {
        *vm_flags |= vma.vm_flags();
    }
    referenced
}

/// `page_referenced`: requires `d` mapped (`mapcount >= 0`) and cached.
/// Acquires `d` locked if not already held by the caller; if it cannot be
/// trylocked, returns 1 without scanning. Sums `page_referenced_one` over
/// the interval index, plus 1 if the physical-access-bit test reports the
/// page was recently touched.
pub fn page_referenced(
    d: DescRef,
    pfn: Pfn,
    is_locked: bool,
    vm_flags: &mut VmFlags,
    wait_engine: &WaitEngine,
    phys: &dyn PhysOps,
) -> i32 {
    *vm_flags = VmFlags::empty();

    if d.mapcount() < 0 {
        return 0;
    }
    let slot = d.cache_slot().lock().unwrap();
    let Some((mapping, offset)) = slot.as_ref().cloned() else {
        return 0;
    };
    drop(slot);

    let we_locked = if !is_locked {
        if !state::trylock(d) {
            return 1;
        }
        true
    } else {
        false
    };

    let mut referenced = 0;
    let mut mapcount = d.mapcount();
    for vma in mapping.vmas().interval_query(offset) {
        let address = vma_address(vma.as_ref(), offset);
        referenced += page_referenced_one(d, pfn, vma.as_ref(), address, &mut mapcount, vm_flags);
        if mapcount == 0 {
            break;
        }
    }

    if we_locked {
        state::unlock(d, wait_engine);
    }

    if phys.page_test_and_clear_young(pfn) {
        referenced += 1;
    }

    referenced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HugepageDescriptor;
    use std::sync::Mutex;

    struct FakePte {
        present: bool,
        pfn: Pfn,
        young: bool,
        dirty: bool,
    }

    impl PteHandle for FakePte {
        fn pte_present(&self) -> bool {
            self.present
        }
        fn pte_to_pfn(&self) -> Pfn {
            self.pfn
        }
        fn clear_flush_young(&mut self) -> bool {
            std::mem::take(&mut self.young)
        }
        fn clear_flush(&mut self) -> bool {
            self.present = false;
            std::mem::take(&mut self.dirty)
        }
        fn flush_cache_page(&self) {}
    }

    struct FakeMm {
        pte: Mutex<Option<FakePte>>,
        invalidated: Mutex<Vec<u64>>,
    }

    impl MmOps for FakeMm {
        fn pte_for_address(&self, _address: u64) -> Option<Box<dyn PteHandle + '_>> {
            self.pte.lock().unwrap().take().map(|p| Box::new(p) as Box<dyn PteHandle>)
        }
        fn mmu_notifier_invalidate_page(&self, address: u64) {
            self.invalidated.lock().unwrap().push(address);
        }
        fn update_hiwater_rss(&self) {}
    }

    struct FakeVma {
        start: u64,
        pgoff: u64,
        flags: VmFlags,
        mm: Arc<FakeMm>,
    }

    impl Vma for FakeVma {
        fn vm_start(&self) -> u64 {
            self.start
        }
        fn vm_pgoff(&self) -> u64 {
            self.pgoff
        }
        fn vm_flags(&self) -> VmFlags {
            self.flags
        }
        fn mm(&self) -> Arc<dyn MmOps> {
            self.mm.clone()
        }
    }

    #[test]
    fn unmap_one_clears_mapping_and_refs() {
        let desc = HugepageDescriptor::new(0);
        desc.set_routing(0, 0);
        desc.inc_mapcount();
        desc.inc_mapcount();
        desc.set_refcounted();
        let d = DescRef::from_ref(&desc);
        let node = Node::new(0, 0, crate::config::SECTION_SIZE as u64);

        let mm = Arc::new(FakeMm {
            pte: Mutex::new(Some(FakePte {
                present: true,
                pfn: 4096,
                young: false,
                dirty: true,
            })),
            invalidated: Mutex::new(Vec::new()),
        });
        let vma = FakeVma {
            start: 0x1000,
            pgoff: 0,
            flags: VmFlags::empty(),
            mm,
        };

        let ret = try_to_unmap_one(d, 4096, &node, &vma, 0x1000, TtuFlags::empty());
        assert_eq!(ret, UnmapResult::Again);
        assert_eq!(d.mapcount(), 0);
        assert!(state::test_page_dirty(d));
    }

    #[test]
    fn referenced_one_short_circuits_on_vm_locked() {
        let desc = HugepageDescriptor::new(0);
        desc.inc_mapcount();
        let d = DescRef::from_ref(&desc);

        let mm = Arc::new(FakeMm {
            pte: Mutex::new(None),
            invalidated: Mutex::new(Vec::new()),
        });
        let vma = FakeVma {
            start: 0,
            pgoff: 0,
            flags: VmFlags::LOCKED,
            mm,
        };

        let mut mapcount = 5;
        let mut vm_flags = VmFlags::empty();
        let r = page_referenced_one(d, 0, &vma, 0, &mut mapcount, &mut vm_flags);
        assert_eq!(r, 0);
        assert_eq!(mapcount, 0);
        assert!(vm_flags.contains(VmFlags::LOCKED));
    }

    struct FakeAddressSpace {
        vmas: Vec<Arc<FakeVma>>,
    }

    impl AddressSpaceOps for FakeAddressSpace {
        fn interval_query(&self, _pgoff: u64) -> Vec<Arc<dyn Vma>> {
            self.vmas.iter().map(|v| v.clone() as Arc<dyn Vma>).collect()
        }
    }

    struct FakePhys {
        young: bool,
    }

    impl PhysOps for FakePhys {
        fn page_test_and_clear_young(&self, _pfn: Pfn) -> bool {
            self.young
        }
    }

    fn mapped_present_vma(pfn: Pfn, flags: VmFlags) -> Arc<FakeVma> {
        Arc::new(FakeVma {
            start: 0x1000,
            pgoff: 0,
            flags,
            mm: Arc::new(FakeMm {
                pte: Mutex::new(Some(FakePte {
                    present: true,
                    pfn,
                    young: false,
                    dirty: false,
                })),
                invalidated: Mutex::new(Vec::new()),
            }),
        })
    }

    /// spec.md §8 scenario 5: two synthetic VMAs both mapping `d` at the
    /// same pfn; `try_to_unmap` must clear both PTEs, drive `mapcount` to
    /// -1, drop two references, and report `Success`.
    #[test]
    fn try_to_unmap_clears_every_vma_and_reports_success() {
        let desc = HugepageDescriptor::new(0);
        desc.set_routing(0, 0);
        desc.inc_mapcount();
        desc.inc_mapcount();
        desc.set_refcounted();
        desc.inc_refcount();
        desc.inc_refcount();
        let d = DescRef::from_ref(&desc);
        assert_eq!(d.refcount(), 3);

        let node = Node::new(0, 0, crate::config::SECTION_SIZE as u64);

        let vmas = vec![
            mapped_present_vma(4096, VmFlags::empty()),
            mapped_present_vma(4096, VmFlags::empty()),
        ];
        let cache = crate::cache::PageCache::new(Arc::new(FakeAddressSpace { vmas }));
        *d.cache_slot().lock().unwrap() = Some((cache, 0));

        let ret = try_to_unmap(d, 4096, &node, TtuFlags::empty());
        assert_eq!(ret, UnmapResult::Success);
        assert_eq!(d.mapcount(), -1);
        assert_eq!(d.refcount(), 1);
    }

    /// spec.md §8 scenario 6: a `VM_LOCKED` VMA short-circuits
    /// `page_referenced` before any later VMA in the interval is scanned.
    #[test]
    fn page_referenced_short_circuits_on_vm_locked_and_stops_scanning() {
        let desc = HugepageDescriptor::new(0);
        desc.inc_mapcount();
        desc.inc_mapcount();
        let d = DescRef::from_ref(&desc);

        let locked_vma = mapped_present_vma(0, VmFlags::LOCKED);
        let later_vma = mapped_present_vma(0, VmFlags::empty());
        let later_mm = later_vma.mm.clone();

        let cache = crate::cache::PageCache::new(Arc::new(FakeAddressSpace {
            vmas: vec![locked_vma, later_vma],
        }));
        *d.cache_slot().lock().unwrap() = Some((cache, 0));

        let node = Node::new(0, 0, crate::config::SECTION_SIZE as u64);
        let mut vm_flags = VmFlags::empty();
        let phys = FakePhys { young: false };
        let referenced = page_referenced(d, 0, true, &mut vm_flags, &node.wait_engine, &phys);

        assert_eq!(referenced, 0);
        assert!(vm_flags.contains(VmFlags::LOCKED));
        // The locked VMA forces mapcount to 0 and breaks the loop before
        // the second VMA's PTE is ever looked up.
        assert!(later_mm.pte.lock().unwrap().is_some());
    }
}
