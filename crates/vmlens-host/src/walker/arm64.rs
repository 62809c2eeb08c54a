//! ARM64 (AArch64) page-table walker — 4-level walk, 4 KiB granule,
//! 48-bit VA.
//!
//! Descriptor format (VMSAv8-64, stage 1):
//!
//! - bit 0 — valid
//! - bit 1 — table (at L0–L2) / page (at L3)
//! - bit 6 — AP[1]: accessible from EL0
//! - bit 7 — AP[2]: read-only
//! - bits 47:12 — output address
//! - bit 53 / 54 — PXN / UXN
//!
//! A descriptor at L1 or L2 with the table bit clear is a block mapping
//! (1 GiB at L1, 2 MiB at L2) and terminates the walk early.

use std::sync::Arc;

use crate::backend::MemoryBackend;

use super::{PageTableWalker, PhysMapping};

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1;
const DESC_AP_EL0: u64 = 1 << 6;
const DESC_AP_RO: u64 = 1 << 7;
const DESC_PXN: u64 = 1 << 53;
const DESC_UXN: u64 = 1 << 54;

/// Output-address field, bits 47:12.
const OA_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const TABLE_INDEX_MASK: u64 = 0x1FF;

/// Level shifts for a 4 KiB granule: L0, L1, L2, L3.
const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

/// ARM64 page-table walker over a [`MemoryBackend`].
pub struct Arm64Walker {
    backend: Arc<MemoryBackend>,
}

impl Arm64Walker {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    fn descriptor(&self, table: u64, index: u64) -> Option<u64> {
        // A table outside the mapped region means the walk left guest
        // RAM; treat it as unmapped.
        self.backend.read_u64(table + index * 8).ok()
    }

    fn flags(descriptor: u64) -> (bool, bool, bool) {
        let writable = descriptor & DESC_AP_RO == 0;
        let user = descriptor & DESC_AP_EL0 != 0;
        let no_execute = descriptor & (DESC_UXN | DESC_PXN) != 0;
        (writable, user, no_execute)
    }
}

impl PageTableWalker for Arm64Walker {
    fn translate(&self, root: u64, va: u64) -> Option<PhysMapping> {
        // TTBR carries ASID/CnP bits outside the table address.
        let mut table = root & OA_MASK;

        for (level, &shift) in LEVEL_SHIFTS.iter().enumerate() {
            let index = (va >> shift) & TABLE_INDEX_MASK;
            let desc = self.descriptor(table, index)?;

            if desc & DESC_VALID == 0 {
                return None;
            }

            if desc & DESC_TABLE == 0 {
                // Block descriptor: legal at L1 (1 GiB) and L2 (2 MiB);
                // reserved at L0, and at L3 bits[1:0]=0b01 is reserved.
                if shift != 30 && shift != 21 {
                    return None;
                }
                let block_size = 1u64 << shift;
                let (writable, user, no_execute) = Self::flags(desc);
                return Some(PhysMapping {
                    pa: (desc & OA_MASK & !(block_size - 1)) | (va & (block_size - 1)),
                    page_size: block_size,
                    writable,
                    user,
                    no_execute,
                });
            }

            if level == LEVEL_SHIFTS.len() - 1 {
                // L3 page descriptor (bits[1:0] = 0b11).
                let (writable, user, no_execute) = Self::flags(desc);
                return Some(PhysMapping {
                    pa: (desc & OA_MASK) | (va & 0xFFF),
                    page_size: 4096,
                    writable,
                    user,
                    no_execute,
                });
            }

            table = desc & OA_MASK;
        }

        unreachable!("walk terminates at L3");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L0: u64 = 0x1000;
    const L1: u64 = 0x2000;
    const L2: u64 = 0x3000;
    const L3: u64 = 0x4000;

    fn write_desc(backend: &mut MemoryBackend, table: u64, index: u64, desc: u64) {
        backend.write(table + index * 8, &desc.to_le_bytes()).unwrap();
    }

    fn walker_with(setup: impl FnOnce(&mut MemoryBackend)) -> Arm64Walker {
        let mut backend = MemoryBackend::anonymous(2 * 1024 * 1024).unwrap();
        setup(&mut backend);
        Arm64Walker::new(Arc::new(backend))
    }

    fn va(i0: u64, i1: u64, i2: u64, i3: u64, off: u64) -> u64 {
        (i0 << 39) | (i1 << 30) | (i2 << 21) | (i3 << 12) | off
    }

    #[test]
    fn four_level_walk_to_4k_page() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 1, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 2, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 3, L3 | DESC_VALID | DESC_TABLE);
            write_desc(b, L3, 4, 0x0008_9000 | DESC_VALID | DESC_TABLE | DESC_AP_EL0);
        });

        let m = walker.translate(L0, va(1, 2, 3, 4, 0x123)).unwrap();
        assert_eq!(m.pa, 0x0008_9123);
        assert_eq!(m.page_size, 4096);
        assert!(m.writable);
        assert!(m.user);
        assert!(!m.no_execute);
    }

    #[test]
    fn two_mib_block_resolves_whole_block() {
        // L0 → L1 → 2 MiB block at L2, block base 0x0010_0000.
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 5, 0x0010_0000 | DESC_VALID);
        });

        let block_va = va(0, 0, 5, 0, 0);
        // Every address within the block maps to block_base + low bits.
        for probe in [0u64, 0x1000, 0x7_3456, 0x1F_FFFF] {
            let m = walker.translate(L0, block_va + probe).unwrap();
            assert_eq!(m.pa, 0x0010_0000 + probe);
            assert_eq!(m.page_size, 2 * 1024 * 1024);
        }
    }

    #[test]
    fn clear_valid_bit_is_unmapped() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            // Valid bit clear — everything else looks like a block.
            write_desc(b, L2, 5, 0x0010_0000);
        });

        assert_eq!(walker.translate(L0, va(0, 0, 5, 0, 0)), None);
    }

    #[test]
    fn one_gib_block_at_l1() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 1, DESC_VALID); // block base 0
        });

        let m = walker.translate(L0, va(0, 1, 7, 9, 0x42)).unwrap();
        assert_eq!(m.page_size, 1 << 30);
        assert_eq!(m.pa, (7 << 21) | (9 << 12) | 0x42);
    }

    #[test]
    fn block_at_l0_is_reserved() {
        let walker = walker_with(|b| {
            // Valid but not a table at L0 — reserved encoding.
            write_desc(b, L0, 0, DESC_VALID);
        });
        assert_eq!(walker.translate(L0, va(0, 0, 0, 0, 0)), None);
    }

    #[test]
    fn l3_without_page_bit_is_reserved() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 0, L3 | DESC_VALID | DESC_TABLE);
            write_desc(b, L3, 0, 0x5000 | DESC_VALID); // bits[1:0]=0b01
        });
        assert_eq!(walker.translate(L0, 0), None);
    }

    #[test]
    fn table_outside_region_is_unmapped() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, 0x4000_0000_0000 | DESC_VALID | DESC_TABLE);
        });
        assert_eq!(walker.translate(L0, 0), None);
    }

    #[test]
    fn read_only_uxn_flags_decoded() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 0, L3 | DESC_VALID | DESC_TABLE);
            write_desc(
                b,
                L3,
                0,
                0x6000 | DESC_VALID | DESC_TABLE | DESC_AP_RO | DESC_UXN,
            );
        });

        let m = walker.translate(L0, 0).unwrap();
        assert!(!m.writable);
        assert!(!m.user);
        assert!(m.no_execute);
    }

    #[test]
    fn translate_range_mixed_mapped_unmapped() {
        // Map L3 indices 0 and 1; leave 2 and 3 invalid.
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 0, L3 | DESC_VALID | DESC_TABLE);
            write_desc(b, L3, 0, 0x10_0000 | DESC_VALID | DESC_TABLE);
            write_desc(b, L3, 1, 0x10_1000 | DESC_VALID | DESC_TABLE);
        });

        let results = walker.translate_range(L0, 0, 4);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].unwrap().pa, 0x10_0000);
        assert_eq!(results[1].unwrap().pa, 0x10_1000);
        assert_eq!(results[2], None);
        assert_eq!(results[3], None);
    }

    #[test]
    fn ttbr_asid_bits_are_stripped() {
        let walker = walker_with(|b| {
            write_desc(b, L0, 0, L1 | DESC_VALID | DESC_TABLE);
            write_desc(b, L1, 0, L2 | DESC_VALID | DESC_TABLE);
            write_desc(b, L2, 0, L3 | DESC_VALID | DESC_TABLE);
            write_desc(b, L3, 0, 0x7000 | DESC_VALID | DESC_TABLE);
        });

        // ASID 0x2A in TTBR bits 63:48 plus the CnP bit must not
        // perturb the walk.
        let ttbr = (0x2Au64 << 48) | L0 | 1;
        assert_eq!(walker.translate(ttbr, 0).unwrap().pa, 0x7000);
    }
}
