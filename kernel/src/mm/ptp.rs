//! Page-Table-Page (PTP) Manager
//!
//! Intermediate tree pages are owned by their pmap and tracked two
//! ways: downward through the parent entry's physical address, and
//! upward through a per-level index in the pmap keyed by the derived
//! PTP offset (a lookup table rather than a back pointer, which keeps
//! the structure acyclic). A per-level hint short-circuits the common
//! repeated lookup.
//!
//! `wire_count` on a PTP is 1 for existence plus one per live child
//! entry; a PTP whose count falls back to 1 is unreferenced and must be
//! reclaimed. Reclaimed PTPs are not handed back to the frame pool
//! immediately: they go onto a deferred list the caller drains after
//! TLB shootdown has completed, because a peer CPU may still
//! table-walk through the frame until then.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::mm::page::{page_pool, pmap_table, VmPage};
use crate::mm::pmap::{pmap_is_curpmap, pmap_pte_slot, Pmap, PmapInner};
use crate::mm::pte::{
    pl_pi, pmap_valid_entry, ptp_va2o, NBPD, PG_FRAME, PG_RW, PG_US, PG_V, PTP_LEVELS,
    VM_MAXUSER_ADDRESS,
};
use crate::mm::tlb::pmap_tlb_shootpage;

/// PTPs whose frames must not be recycled until shootdown completes
pub(crate) type PgToFree = Vec<&'static VmPage>;

/// Look up the PTP covering `va` at `level`, trying the hint first.
/// `pa` is the physical address the caller saw in the parent entry, or
/// `u64::MAX` if unknown.
pub(crate) fn pmap_find_ptp(
    inner: &mut PmapInner,
    va: u64,
    pa: u64,
    level: usize,
) -> Option<&'static VmPage> {
    let lidx = level - 1;

    if pa != u64::MAX {
        if let Some(hint) = inner.ptphint[lidx] {
            if hint.pa() == pa {
                return Some(hint);
            }
        }
    }

    inner.obj[lidx].get(&ptp_va2o(va, level)).copied()
}

/// Detach a dead PTP from its pmap and queue it for deferred freeing.
pub(crate) fn pmap_freepage(
    inner: &mut PmapInner,
    ptp: &'static VmPage,
    va: u64,
    level: usize,
    pagelist: &mut PgToFree,
) {
    let lidx = level - 1;

    if inner.obj[lidx].remove(&ptp_va2o(va, level)).is_none() {
        panic!(
            "pmap_freepage: PTP {:#x} not in level {} index",
            ptp.pa(),
            level
        );
    }
    if let Some(hint) = inner.ptphint[lidx] {
        if core::ptr::eq(hint, ptp) {
            inner.ptphint[lidx] = None;
        }
    }
    ptp.set_wire(0);
    pagelist.push(ptp);
}

/// Release the PTP holding the leaf for `va`, then walk upward clearing
/// and releasing parents that become empty. Each cleared entry gets a
/// shootdown for the base of the range it covered, since the hardware
/// may have cached the non-leaf translation.
pub(crate) fn pmap_free_ptp(
    pmap: &Pmap,
    inner: &mut PmapInner,
    ptp: &'static VmPage,
    va: u64,
    pagelist: &mut PgToFree,
) {
    let mut level = 1;
    let mut ptp = ptp;

    loop {
        pmap_freepage(inner, ptp, va, level, pagelist);

        // clear the parent entry
        let slot = pmap_pte_slot(pmap.pdirpa(), va, level + 1);
        slot.swap(0, Ordering::SeqCst);

        // zap the mirrored top-level entry in the U-K tree
        if level == PTP_LEVELS - 1 && inner.pdir_intel_pa != 0 {
            let index = pl_pi(va, level + 1);
            pmap_table(inner.pdir_intel_pa)[index].swap(0, Ordering::SeqCst);
            log::trace!(
                "pmap_free_ptp: cleared U-K top-level entry {} (va range {:#x})",
                index,
                va & !(NBPD[level + 1] - 1)
            );
        }

        let invaladdr = va & !(NBPD[level + 1] - 1);
        pmap_tlb_shootpage(pmap, invaladdr, pmap_is_curpmap(pmap));

        if level < PTP_LEVELS - 1 {
            ptp = pmap_find_ptp(inner, va, u64::MAX, level + 1)
                .expect("pmap_free_ptp: parent PTP missing from index");
            if ptp.wire_dec() > 1 {
                break;
            }
        }

        level += 1;
        if level >= PTP_LEVELS {
            break;
        }
    }
}

/// Ensure a PTP exists at every non-leaf level covering `va`,
/// allocating missing ones top-down. Returns the leaf-level PTP, or
/// None if a frame allocation failed; partial allocations stay
/// installed and will be torn down by `pmap_free_ptp` when the region
/// is unmapped.
///
/// Never called for the kernel pmap: kernel PTPs are pre-allocated by
/// `pmap_growkernel` and never freed.
pub(crate) fn pmap_get_ptp(
    pmap: &Pmap,
    inner: &mut PmapInner,
    va: u64,
) -> Option<&'static VmPage> {
    let mut ptp: Option<&'static VmPage> = None;
    let mut ppa: u64 = u64::MAX;
    let mut tbl_pa = pmap.pdirpa();

    for i in (2..=PTP_LEVELS).rev() {
        // values from the previous round
        let pptp = ptp;

        let index = pl_pi(va, i);
        let slot = &pmap_table(tbl_pa)[index];
        let pde = slot.load(Ordering::Relaxed);

        if pmap_valid_entry(pde) {
            ppa = pde & PG_FRAME;
            ptp = None;
            tbl_pa = ppa;
            continue;
        }

        let pg = page_pool().alloc(true)?;
        pg.set_wire(1);
        inner.ptphint[i - 2] = Some(pg);
        inner.obj[i - 2].insert(ptp_va2o(va, i - 1), pg);

        let pa = pg.pa();
        slot.store(pa | PG_US | PG_RW | PG_V, Ordering::SeqCst);

        // A new top-level entry for a usermode region is copied to the
        // U-K tree so both roots resolve the same user half.
        if inner.pdir_intel_pa != 0 && i == PTP_LEVELS && va < VM_MAXUSER_ADDRESS {
            pmap_table(inner.pdir_intel_pa)[index].store(pa | PG_US | PG_RW | PG_V, Ordering::SeqCst);
            log::trace!(
                "pmap_get_ptp: mirrored usermode top-level entry {} to U-K tree",
                index
            );
        }

        // if we're not in the top level, the parent gained a child
        if i < PTP_LEVELS {
            let parent = match pptp {
                Some(p) => p,
                None => pmap_find_ptp(inner, va, ppa, i)
                    .expect("pmap_get_ptp: pde page disappeared"),
            };
            parent.wire_inc();
        }

        ptp = Some(pg);
        ppa = pa;
        tbl_pa = pa;
    }

    // ptp is Some if we just allocated the leaf PTP; otherwise look up
    // the existing one.
    let leaf = match ptp {
        Some(p) => p,
        None => pmap_find_ptp(inner, va, ppa, 1).expect("pmap_get_ptp: unmanaged user PTP"),
    };
    inner.ptphint[0] = Some(leaf);
    Some(leaf)
}
