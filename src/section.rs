//! A section: a fixed-size bucket of up to [`crate::config::SECTION_SIZE`]
//! hugepages owning one intrusive free list.

use intrusive_list::List;

use crate::descriptor::DescRef;

/// `struct hpa_section { struct list_head free_list; }`. A descriptor is
/// assigned to exactly one section at init and never migrates.
pub struct Section {
    free_list: List,
    section_id: u16,
}

impl Section {
    pub(crate) fn new(section_id: u16) -> Self {
        Self {
            free_list: List::new(),
            section_id,
        }
    }

    pub const fn section_id(&self) -> u16 {
        self.section_id
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.free_list.count()
    }

    /// Inserts `d` at the head of the free list. Caller must have already
    /// zeroed `refcount` and cleared `PG_LRU` — this never touches either.
    pub(crate) fn push_front(&mut self, d: DescRef) {
        self.free_list.insert(unsafe { d.link_ptr().as_mut() });
    }

    /// Detaches and returns the head of the free list, if any.
    pub(crate) fn pop_front(&mut self) -> Option<DescRef> {
        self.free_list
            .pop()
            .map(|link| unsafe { DescRef::from_link(link.into()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HugepageDescriptor;

    #[test]
    fn push_pop_is_lifo() {
        let descs: Vec<HugepageDescriptor> = (0..4).map(HugepageDescriptor::new).collect();
        let mut section = Section::new(0);
        for d in &descs {
            section.push_front(DescRef::from_ref(d));
        }
        assert_eq!(section.len(), 4);
        let popped = section.pop_front().unwrap();
        assert_eq!(popped.index(), 3);
        assert_eq!(section.len(), 3);
    }
}
