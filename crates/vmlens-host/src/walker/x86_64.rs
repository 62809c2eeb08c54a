//! x86-64 page-table walker — 4-level (or 5-level with LA57) walk.
//!
//! Entry format:
//!
//! - bit 0 — present
//! - bit 1 — read/write
//! - bit 2 — user/supervisor
//! - bit 7 — page size (1 GiB at the PDPT level, 2 MiB at the PD level)
//! - bits 51:12 — physical address
//! - bit 63 — execute disable
//!
//! Effective writable/user permissions are the AND of every level's
//! bits and NX is the OR, mirroring hardware; the walker reports them
//! but never enforces them.

use std::sync::Arc;

use crate::backend::MemoryBackend;

use super::{PageTableWalker, PhysMapping};

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_PAGE_SIZE: u64 = 1 << 7;
const ENTRY_NX: u64 = 1 << 63;

/// Physical-address field, bits 51:12.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const TABLE_INDEX_MASK: u64 = 0x1FF;

/// x86-64 page-table walker over a [`MemoryBackend`].
pub struct X86_64Walker {
    backend: Arc<MemoryBackend>,
    /// Level shifts, top first: `[48,] 39, 30, 21, 12`.
    shifts: &'static [u32],
}

impl X86_64Walker {
    /// Conventional 4-level walker (48-bit VA).
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            shifts: &[39, 30, 21, 12],
        }
    }

    /// 5-level walker for guests running with LA57 enabled (57-bit VA).
    pub fn with_la57(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            shifts: &[48, 39, 30, 21, 12],
        }
    }

    fn entry(&self, table: u64, index: u64) -> Option<u64> {
        self.backend.read_u64(table + index * 8).ok()
    }
}

impl PageTableWalker for X86_64Walker {
    fn translate(&self, root: u64, va: u64) -> Option<PhysMapping> {
        // CR3 carries PCID / flag bits outside the table address.
        let mut table = root & ADDR_MASK;

        let mut writable = true;
        let mut user = true;
        let mut no_execute = false;

        for (level, &shift) in self.shifts.iter().enumerate() {
            let index = (va >> shift) & TABLE_INDEX_MASK;
            let entry = self.entry(table, index)?;

            if entry & ENTRY_PRESENT == 0 {
                return None;
            }
            writable &= entry & ENTRY_WRITE != 0;
            user &= entry & ENTRY_USER != 0;
            no_execute |= entry & ENTRY_NX != 0;

            let last = level == self.shifts.len() - 1;
            if last {
                return Some(PhysMapping {
                    pa: (entry & ADDR_MASK) | (va & 0xFFF),
                    page_size: 4096,
                    writable,
                    user,
                    no_execute,
                });
            }

            if entry & ENTRY_PAGE_SIZE != 0 {
                // Huge pages exist at the 1 GiB and 2 MiB levels only;
                // PS set higher up is a reserved encoding.
                if shift != 30 && shift != 21 {
                    return None;
                }
                let page_size = 1u64 << shift;
                return Some(PhysMapping {
                    pa: (entry & ADDR_MASK & !(page_size - 1)) | (va & (page_size - 1)),
                    page_size,
                    writable,
                    user,
                    no_execute,
                });
            }

            table = entry & ADDR_MASK;
        }

        unreachable!("walk terminates at the last level");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PML4: u64 = 0x9000;
    const PDPT: u64 = 0xA000;
    const PD: u64 = 0xB000;
    const PT: u64 = 0xC000;
    const PML5: u64 = 0x8000;

    const PRESENT_WRITABLE: u64 = ENTRY_PRESENT | ENTRY_WRITE;

    fn write_entry(backend: &mut MemoryBackend, table: u64, index: u64, entry: u64) {
        backend.write(table + index * 8, &entry.to_le_bytes()).unwrap();
    }

    fn walker_with(setup: impl FnOnce(&mut MemoryBackend)) -> X86_64Walker {
        let mut backend = MemoryBackend::anonymous(2 * 1024 * 1024).unwrap();
        setup(&mut backend);
        X86_64Walker::new(Arc::new(backend))
    }

    /// The boot-time identity map every Linux VMM writes:
    /// PML4[0] → PDPT, PDPT[0] → PD, PD[i] = (i << 21) | 0x83.
    fn identity_map_1gib(b: &mut MemoryBackend) {
        write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE);
        write_entry(b, PDPT, 0, PD | PRESENT_WRITABLE);
        for i in 0..512u64 {
            write_entry(b, PD, i, (i << 21) | PRESENT_WRITABLE | ENTRY_PAGE_SIZE);
        }
    }

    #[test]
    fn identity_map_translates_identically() {
        let walker = walker_with(identity_map_1gib);
        for va in [0u64, 0x7000, 0x0020_0123, 0x3FFF_FFFF] {
            let m = walker.translate(PML4, va).unwrap();
            assert_eq!(m.pa, va);
            assert_eq!(m.page_size, 2 * 1024 * 1024);
            assert!(m.writable);
        }
    }

    #[test]
    fn four_level_walk_to_4k_page() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE | ENTRY_USER);
            write_entry(b, PDPT, 0, PD | PRESENT_WRITABLE | ENTRY_USER);
            write_entry(b, PD, 0, PT | PRESENT_WRITABLE | ENTRY_USER);
            write_entry(b, PT, 5, 0x0012_3000 | PRESENT_WRITABLE | ENTRY_USER);
        });

        let m = walker.translate(PML4, 0x5ABC).unwrap();
        assert_eq!(m.pa, 0x0012_3ABC);
        assert_eq!(m.page_size, 4096);
        assert!(m.user);
    }

    #[test]
    fn non_present_entry_is_unmapped() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE);
            // PDPT[0] left zero — not present.
        });
        assert_eq!(walker.translate(PML4, 0x1000), None);
    }

    #[test]
    fn one_gib_page_at_pdpt_level() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE);
            write_entry(b, PDPT, 1, PRESENT_WRITABLE | ENTRY_PAGE_SIZE); // base 0
        });

        let va = (1u64 << 30) | 0x12_3456;
        let m = walker.translate(PML4, va).unwrap();
        assert_eq!(m.page_size, 1 << 30);
        assert_eq!(m.pa, 0x12_3456);
    }

    #[test]
    fn ps_bit_at_pml4_level_is_reserved() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PRESENT_WRITABLE | ENTRY_PAGE_SIZE);
        });
        assert_eq!(walker.translate(PML4, 0), None);
    }

    #[test]
    fn permissions_are_anded_along_the_walk() {
        // PT entry is writable+user but the PD entry is supervisor
        // read-only, so the effective mapping is neither.
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE | ENTRY_USER);
            write_entry(b, PDPT, 0, PD | PRESENT_WRITABLE | ENTRY_USER);
            write_entry(b, PD, 0, PT | ENTRY_PRESENT);
            write_entry(b, PT, 0, 0x1000 | PRESENT_WRITABLE | ENTRY_USER);
        });

        let m = walker.translate(PML4, 0).unwrap();
        assert!(!m.writable);
        assert!(!m.user);
    }

    #[test]
    fn nx_bit_is_ored_along_the_walk() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE | ENTRY_NX);
            write_entry(b, PDPT, 0, PD | PRESENT_WRITABLE);
            write_entry(b, PD, 0, PT | PRESENT_WRITABLE);
            write_entry(b, PT, 0, 0x1000 | PRESENT_WRITABLE);
        });
        assert!(walker.translate(PML4, 0).unwrap().no_execute);
    }

    #[test]
    fn cr3_flag_bits_are_stripped(){
        let walker = walker_with(identity_map_1gib);
        // PCID in CR3 bits 11:0 must not perturb the walk.
        assert_eq!(walker.translate(PML4 | 0x018, 0x1234).unwrap().pa, 0x1234);
    }

    #[test]
    fn five_level_walk_with_la57() {
        let mut backend = MemoryBackend::anonymous(2 * 1024 * 1024).unwrap();
        write_entry(&mut backend, PML5, 1, PML4 | PRESENT_WRITABLE);
        write_entry(&mut backend, PML4, 0, PDPT | PRESENT_WRITABLE);
        write_entry(&mut backend, PDPT, 0, PD | PRESENT_WRITABLE);
        write_entry(&mut backend, PD, 0, PT | PRESENT_WRITABLE);
        write_entry(&mut backend, PT, 0, 0x4_2000 | PRESENT_WRITABLE);
        let walker = X86_64Walker::with_la57(Arc::new(backend));

        let va = 1u64 << 48;
        assert_eq!(walker.translate(PML5, va).unwrap().pa, 0x4_2000);

        // The same root walked 4-level treats PML5 as a PML4 and finds
        // nothing present at index 0.
        let walker4 = X86_64Walker::new(Arc::clone(&walker.backend));
        assert_eq!(walker4.translate(PML5, 0), None);
    }

    #[test]
    fn translate_range_half_mapped() {
        let walker = walker_with(|b| {
            write_entry(b, PML4, 0, PDPT | PRESENT_WRITABLE);
            write_entry(b, PDPT, 0, PD | PRESENT_WRITABLE);
            write_entry(b, PD, 0, PT | PRESENT_WRITABLE);
            for i in 0..4u64 {
                write_entry(b, PT, i, (0x10_0000 + i * 0x1000) | PRESENT_WRITABLE);
            }
            // PT[4..8] left not-present.
        });

        let results = walker.translate_range(PML4, 0, 8);
        assert_eq!(results.len(), 8, "one unmapped page must not truncate the batch");
        for (i, slot) in results.iter().enumerate() {
            if i < 4 {
                assert_eq!(slot.unwrap().pa, 0x10_0000 + i as u64 * 0x1000);
            } else {
                assert_eq!(*slot, None);
            }
        }
    }
}
