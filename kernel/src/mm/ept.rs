//! Extended (Nested) Page Tables
//!
//! The guest regime shares the tree shape and the PTP lifecycle with
//! the normal regime but encodes leaves differently: separate
//! read/write/execute bits, a memory-type field instead of the PWT/PCD
//! pair, and no user/supervisor distinction. Guest frames never join
//! the reverse map, and nothing here talks to the shootdown
//! coordinator: invalidation of guest translations belongs to the
//! guest-execution collaborator.
//!
//! A pmap switches into this regime via `pmap_convert`; from then on
//! `pmap_enter`/`pmap_remove` delegate here.

use core::sync::atomic::Ordering;

use crate::mm::page::{page_pool, phys_to_page, pmap_table, VmPage};
use crate::mm::pmap::{Pmap, PmapError, PmapInner};
use crate::mm::pte::{pl_pi, ptp_va2o, VmProt, PAGE_SIZE, PG_FRAME, PTP_LEVELS};

/// Guest-physical page is readable
pub const EPT_R: u64 = 1 << 0;
/// Guest-physical page is writable
pub const EPT_W: u64 = 1 << 1;
/// Guest-physical page is executable
pub const EPT_X: u64 = 1 << 2;
/// Memory type: write-back (bits 5:3 = 6)
pub const EPT_WB: u64 = 6 << 3;

/// Highest guest-physical address the regime supports
pub const EPT_GPA_MAX: u64 = 32 << 30;

/// EPT leaf bits for a protection combination. Higher tree levels get
/// full permissions; only the leaf narrows them.
fn ept_protection_bits(prot: VmProt) -> u64 {
    let mut bits = 0;
    if prot.contains(VmProt::READ) {
        bits |= EPT_R;
    }
    if prot.contains(VmProt::WRITE) {
        bits |= EPT_W;
    }
    if prot.contains(VmProt::EXEC) {
        bits |= EPT_X;
    }
    bits
}

/// Enter a guest-physical to host-physical translation.
pub(crate) fn pmap_enter_ept(
    pmap: &Pmap,
    gpa: u64,
    hpa: u64,
    prot: VmProt,
) -> Result<(), PmapError> {
    if gpa > EPT_GPA_MAX {
        return Err(PmapError::NoMemory);
    }

    let mut inner = pmap.inner.lock();

    // descend, allocating missing intermediate pages top-down
    let mut tbl_pa = pmap.pdirpa();
    let mut cur_pg: Option<&'static VmPage> = None;

    for level in (2..=PTP_LEVELS).rev() {
        let slot = &pmap_table(tbl_pa)[pl_pi(gpa, level)];
        let npa = slot.load(Ordering::Relaxed) & PG_FRAME;

        let child = if npa == 0 {
            let ptp = match page_pool().alloc(true) {
                Some(ptp) => ptp,
                None => return Err(PmapError::NoMemory),
            };

            // new page: we are about to set its first entry
            ptp.set_wire(1);
            inner.obj[level - 2].insert(ptp_va2o(gpa, level - 1), ptp);

            // higher levels get full perms; specific permissions are
            // entered at the lowest level
            slot.store(ptp.pa() | EPT_R | EPT_W | EPT_X, Ordering::SeqCst);

            if let Some(parent) = cur_pg {
                parent.wire_inc();
            }
            ptp
        } else {
            phys_to_page(npa).expect("pmap_enter_ept: ptp page vanished?")
        };

        tbl_pa = child.pa();
        cur_pg = Some(child);
    }

    let leaf_ptp = cur_pg.unwrap();
    let slot = &pmap_table(tbl_pa)[pl_pi(gpa, 1)];

    let npte = (hpa & PG_FRAME) | EPT_WB | ept_protection_bits(prot);

    if slot.load(Ordering::Relaxed) == 0 {
        leaf_ptp.wire_inc();
        inner.stats.resident_count += 1;
    }
    // replacing a live guest translation: flushing it is the
    // guest-execution collaborator's job

    slot.store(npte, Ordering::SeqCst);

    Ok(())
}

/// Remove the guest translations for `[sgpa, egpa)`.
pub(crate) fn pmap_remove_ept(pmap: &Pmap, sgpa: u64, egpa: u64) {
    let mut inner = pmap.inner.lock();
    let mut gpa = sgpa;
    while gpa < egpa {
        pmap_do_remove_ept(pmap, &mut inner, gpa);
        gpa += PAGE_SIZE as u64;
    }
}

/// Remove one guest translation, releasing intermediate pages that
/// become empty on the way back up.
fn pmap_do_remove_ept(pmap: &Pmap, inner: &mut PmapInner, gpa: u64) {
    let pd4_pa = pmap.pdirpa();

    let l4slot = &pmap_table(pd4_pa)[pl_pi(gpa, 4)];
    let npa3 = l4slot.load(Ordering::Relaxed) & PG_FRAME;
    if npa3 == 0 {
        return;
    }
    let pg3 = phys_to_page(npa3).expect("pmap_do_remove_ept: untracked level-3 page");

    let l3slot = &pmap_table(npa3)[pl_pi(gpa, 3)];
    let npa2 = l3slot.load(Ordering::Relaxed) & PG_FRAME;
    if npa2 == 0 {
        return;
    }
    let pg2 = phys_to_page(npa2).expect("pmap_do_remove_ept: untracked level-2 page");

    let l2slot = &pmap_table(npa2)[pl_pi(gpa, 2)];
    let npa1 = l2slot.load(Ordering::Relaxed) & PG_FRAME;
    if npa1 == 0 {
        return;
    }
    let pg1 = phys_to_page(npa1).expect("pmap_do_remove_ept: untracked level-1 page");

    let l1slot = &pmap_table(npa1)[pl_pi(gpa, 1)];
    if l1slot.load(Ordering::Relaxed) == 0 {
        return;
    }

    l1slot.store(0, Ordering::SeqCst);
    inner.stats.resident_count -= 1;

    if pg1.wire_dec() > 1 {
        return;
    }

    pg1.set_wire(0);
    l2slot.store(0, Ordering::SeqCst);
    inner.obj[0].remove(&ptp_va2o(gpa, 1));
    page_pool().free(pg1);

    if pg2.wire_dec() > 1 {
        return;
    }

    pg2.set_wire(0);
    l3slot.store(0, Ordering::SeqCst);
    inner.obj[1].remove(&ptp_va2o(gpa, 2));
    page_pool().free(pg2);

    if pg3.wire_dec() > 1 {
        return;
    }

    pg3.set_wire(0);
    l4slot.store(0, Ordering::SeqCst);
    inner.obj[2].remove(&ptp_va2o(gpa, 3));
    page_pool().free(pg3);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmap::{
        pmap_convert, pmap_create, pmap_destroy, pmap_enter, pmap_remove, Pmap, PmapError,
        PmapType,
    };
    use crate::mm::page::PagePool;
    use crate::mm::test_support::{self, Event};
    use core::sync::atomic::Ordering;

    fn ept_pmap() -> &'static Pmap {
        let p = pmap_create();
        pmap_convert(p, PmapType::Ept);
        p
    }

    /// Raw leaf entry for a guest-physical address, or 0 anywhere the
    /// chain is missing.
    fn ept_leaf(p: &Pmap, gpa: u64) -> u64 {
        let mut pa = p.pdirpa();
        for lvl in (2..=PTP_LEVELS).rev() {
            pa = pmap_table(pa)[pl_pi(gpa, lvl)].load(Ordering::Relaxed) & PG_FRAME;
            if pa == 0 {
                return 0;
            }
        }
        pmap_table(pa)[pl_pi(gpa, 1)].load(Ordering::Relaxed)
    }

    const RW: VmProt = VmProt::READ.union(VmProt::WRITE);

    #[test]
    fn test_ept_map_and_unmap() {
        let _g = test_support::setup();
        let p = ept_pmap();
        let pg = test_support::pool().alloc(false).unwrap();

        pmap_enter(p, 0x123_4000, pg.pa(), RW, crate::mm::EnterFlags::empty()).unwrap();

        let leaf = ept_leaf(p, 0x123_4000);
        assert_eq!(leaf & PG_FRAME, pg.pa());
        assert_ne!(leaf & EPT_R, 0);
        assert_ne!(leaf & EPT_W, 0);
        assert_eq!(leaf & EPT_X, 0);
        assert_eq!(leaf & (7 << 3), EPT_WB);
        assert_eq!(p.resident_count(), 1);

        // a neighbor shares the leaf table
        let pg2 = test_support::pool().alloc(false).unwrap();
        pmap_enter(p, 0x123_5000, pg2.pa(), RW, crate::mm::EnterFlags::empty()).unwrap();
        assert_eq!(p.resident_count(), 2);

        pmap_remove(p, 0x123_4000, 0x123_5000);
        assert_eq!(ept_leaf(p, 0x123_4000), 0);
        assert_ne!(ept_leaf(p, 0x123_5000), 0);
        assert_eq!(p.resident_count(), 1);

        test_support::clear_events();
        pmap_remove(p, 0x123_5000, 0x123_6000);
        assert_eq!(p.resident_count(), 0);

        // the whole intermediate chain was released
        let frees = test_support::events()
            .iter()
            .filter(|e| matches!(e, Event::FrameFree { .. }))
            .count();
        assert_eq!(frees, 3);
        assert_eq!(
            pmap_table(p.pdirpa())[pl_pi(0x123_4000, 4)].load(Ordering::Relaxed),
            0
        );

        pmap_destroy(p);
        test_support::pool().free(pg);
        test_support::pool().free(pg2);
    }

    #[test]
    fn test_ept_gpa_limit() {
        let _g = test_support::setup();
        let p = ept_pmap();

        assert_eq!(
            pmap_enter(
                p,
                EPT_GPA_MAX + PAGE_SIZE as u64,
                0x40_0000,
                RW,
                crate::mm::EnterFlags::empty()
            ),
            Err(PmapError::NoMemory)
        );

        pmap_destroy(p);
    }

    #[test]
    fn test_ept_leaf_permissions() {
        let _g = test_support::setup();
        let p = ept_pmap();

        pmap_enter(p, 0x1000, 0x40_0000, VmProt::READ, crate::mm::EnterFlags::empty()).unwrap();
        let leaf = ept_leaf(p, 0x1000);
        assert_eq!(leaf & (EPT_R | EPT_W | EPT_X), EPT_R);

        // replacing a live translation narrows the leaf without
        // touching the counters
        pmap_enter(
            p,
            0x1000,
            0x40_0000,
            VmProt::READ | VmProt::EXEC,
            crate::mm::EnterFlags::empty(),
        )
        .unwrap();
        let leaf = ept_leaf(p, 0x1000);
        assert_eq!(leaf & (EPT_R | EPT_W | EPT_X), EPT_R | EPT_X);
        assert_eq!(p.resident_count(), 1);

        pmap_remove(p, 0x1000, 0x2000);
        pmap_destroy(p);
    }

    #[test]
    fn test_ept_never_shoots() {
        let _g = test_support::setup();
        let p = ept_pmap();

        test_support::clear_events();
        pmap_enter(p, 0x1000, 0x40_0000, RW, crate::mm::EnterFlags::empty()).unwrap();
        pmap_remove(p, 0x1000, 0x2000);

        // guest invalidation belongs to the guest-execution layer
        assert!(!test_support::events()
            .iter()
            .any(|e| matches!(e, Event::Invlpg { .. } | Event::Ipi { .. } | Event::Flush { .. })));

        pmap_destroy(p);
    }
}
