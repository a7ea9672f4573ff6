//! Error and result taxonomy.
//!
//! Allocation failure is a normal result (`Option::None`), never an error —
//! see `free_alloc::FreeAllocator`. The two places this crate needs a real
//! error type are page-cache insertion (which can race another insert) and
//! reverse-map unmapping (whose outcomes form a small, meaningful sum type
//! rather than a pass/fail boolean).

use core::fmt;

/// Failure modes for [`crate::cache::PageCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// An entry already occupies `(mapping, offset)`.
    AlreadyPresent,
    /// The associative container could not reserve capacity for the insert.
    OutOfMemory,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::AlreadyPresent => write!(f, "an entry already exists at this offset"),
            CacheError::OutOfMemory => write!(f, "cache could not reserve insert capacity"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Outcome of a reverse-map unmap attempt, matching the original's
/// `SWAP_SUCCESS` / `SWAP_AGAIN` / `SWAP_FAIL` / `SWAP_MLOCK` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapResult {
    /// The page is now fully unmapped (`mapcount == -1`).
    Success,
    /// This VMA was handled; keep iterating the interval index.
    Again,
    /// Clearing the accessed bit failed; abort the current pass.
    Fail,
    /// The VMA is `VM_LOCKED`; the page must stay resident.
    ///
    /// Only ever produced when the `vm-locked` feature is enabled; present
    /// unconditionally so callers can match on it without a `cfg` of their
    /// own.
    Mlock,
}
