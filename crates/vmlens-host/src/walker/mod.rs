//! Guest page-table walking — translate virtual to guest-physical
//! addresses by reading the guest's own page tables.
//!
//! One capability trait, two implementations selected at construction
//! time: [`Arm64Walker`] and [`X86_64Walker`].  Walkers read descriptors
//! through [`MemoryBackend`](crate::backend::MemoryBackend) only and keep
//! no state between calls; caching belongs to
//! [`AddressTranslationCache`](crate::translate::AddressTranslationCache),
//! layered above.
//!
//! A walk that hits a descriptor with its valid/present bit clear — or a
//! table that falls outside the mapped region — returns `None`
//! ("unmapped").  Unmapped is expected and frequent, not an error.

mod arm64;
mod x86_64;

pub use arm64::Arm64Walker;
pub use x86_64::X86_64Walker;

/// Page size assumed throughout (4 KiB granule).
pub const PAGE_SIZE: u64 = 4096;

/// A successful VA→PA translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMapping {
    /// Guest-physical address corresponding to the queried VA.
    pub pa: u64,
    /// Size of the mapping the VA fell inside (4 KiB, 2 MiB, or 1 GiB).
    pub page_size: u64,
    /// Writable per the final descriptor.  Advisory only — the walker
    /// never enforces permissions.
    pub writable: bool,
    /// Accessible from user mode (EL0 / CPL3).
    pub user: bool,
    /// Execution disabled (XN / NX).
    pub no_execute: bool,
}

/// Capability interface for architecture-specific page-table walks.
pub trait PageTableWalker {
    /// Translate one virtual address given the page-table root
    /// (TTBR / CR3 value).  Returns `None` when any level of the walk is
    /// invalid or unreadable.
    fn translate(&self, root: u64, va: u64) -> Option<PhysMapping>;

    /// Translate `pages` consecutive pages starting at `va`.
    ///
    /// Each page is translated independently: one unmapped page yields
    /// `None` in its slot and never aborts the batch.
    fn translate_range(&self, root: u64, va: u64, pages: usize) -> Vec<Option<PhysMapping>> {
        (0..pages)
            .map(|i| self.translate(root, va + i as u64 * PAGE_SIZE))
            .collect()
    }
}
