//! Crate-wide constants describing hugepage and section geometry.
//!
//! These mirror the `#define`s in the original C headers rather than being
//! tunable at runtime: a hugepage is always 512 base pages, and a section
//! always spans up to 2048 hugepages.

/// log2 of the number of base (4 KiB) pages backing one hugepage.
pub const HUGEPAGE_SHIFT: u32 = 9;

/// Number of base pages per hugepage (2 MiB / 4 KiB).
pub const HUGEPAGE_PAGES: u64 = 1 << HUGEPAGE_SHIFT;

/// Size in bytes of one hugepage.
pub const HUGEPAGE_SIZE: u64 = HUGEPAGE_PAGES * 4096;

/// log2 of the number of hugepages per section.
pub const SECTION_SHIFT: u32 = 11;

/// Maximum number of hugepages owned by one section.
pub const SECTION_SIZE: usize = 1 << SECTION_SHIFT;

/// Initial value of a node's reclaim watermark.
pub const DEFAULT_WATERMARK: u64 = 500;

/// Maximum number of NUMA nodes the node mask can address.
pub const MAX_NUMNODES: usize = 64;
