//! Reverse-Map (pv) Store
//!
//! For every managed physical frame we keep a singly-linked chain of
//! pv entries, one per {address space, virtual address} alias of the
//! frame. The chain head lives in the frame header and is guarded by
//! the per-frame mutex, the innermost lock in the system. Chains are
//! unordered and hold no duplicates.
//!
//! Entries come from a dedicated pool with a free list. The pool's
//! allocation limit is the knob `pmap_enter` callers feel when they ask
//! for CANFAIL semantics.

use alloc::boxed::Box;
use core::ptr;

use crate::ke::SpinLock;
use crate::mm::page::VmPage;
use crate::mm::pmap::Pmap;

/// One {address space, virtual address} alias of a physical frame
pub struct PvEntry {
    /// Address space holding the mapping
    pub(crate) pv_pmap: *const Pmap,
    /// Virtual address of the mapping
    pub(crate) pv_va: u64,
    /// PTP that holds the leaf PTE; None for kernel mappings
    pub(crate) pv_ptp: Option<&'static VmPage>,
    /// Next alias on the chain (or next node on a free list)
    pub(crate) pv_next: *mut PvEntry,
}

impl PvEntry {
    const fn empty() -> Self {
        Self {
            pv_pmap: ptr::null(),
            pv_va: 0,
            pv_ptp: None,
            pv_next: ptr::null_mut(),
        }
    }
}

/// Chain head stored in the frame header
pub(crate) struct PvHead(pub(crate) *mut PvEntry);

unsafe impl Send for PvHead {}

impl PvHead {
    pub(crate) const fn empty() -> Self {
        Self(ptr::null_mut())
    }
}

// ============================================================================
// pv pool
// ============================================================================

struct PvPool {
    free: *mut PvEntry,
    /// Total nodes handed to the backing allocator
    created: usize,
    /// Cap on `created`; exhaustion surfaces as a failed allocation
    limit: usize,
}

unsafe impl Send for PvPool {}

static PMAP_PV_POOL: SpinLock<PvPool> = SpinLock::new(PvPool {
    free: ptr::null_mut(),
    created: 0,
    limit: usize::MAX,
});

/// Cap the number of pv entries the pool will ever back (the pool's
/// high-water mark). Exhaustion is what CANFAIL callers of
/// `pmap_enter` see as ENOMEM.
pub fn pv_pool_set_limit(limit: usize) {
    PMAP_PV_POOL.lock().limit = limit;
}

/// Allocate a pv entry, preferring the free list. Returns None when the
/// pool is exhausted; the caller decides whether that is ENOMEM or a
/// panic.
pub(crate) fn pmap_alloc_pv() -> Option<&'static mut PvEntry> {
    let mut pool = PMAP_PV_POOL.lock();
    if !pool.free.is_null() {
        let pve = pool.free;
        unsafe {
            pool.free = (*pve).pv_next;
            (*pve).pv_next = ptr::null_mut();
            return Some(&mut *pve);
        }
    }
    if pool.created >= pool.limit {
        return None;
    }
    pool.created += 1;
    drop(pool);

    Some(Box::leak(Box::new(PvEntry::empty())))
}

/// Return a pv entry to the free list
pub(crate) fn pmap_free_pv(pve: *mut PvEntry) {
    let mut pool = PMAP_PV_POOL.lock();
    unsafe {
        (*pve).pv_pmap = ptr::null();
        (*pve).pv_ptp = None;
        (*pve).pv_next = pool.free;
    }
    pool.free = pve;
}

// ============================================================================
// chain manipulation
// ============================================================================

/// Enter a mapping onto a frame's pv chain.
///
/// The caller has already adjusted the PTP's wire count and provides a
/// preallocated pv entry.
pub(crate) fn pmap_enter_pv(
    pg: &VmPage,
    pve: &'static mut PvEntry,
    pmap: *const Pmap,
    va: u64,
    ptp: Option<&'static VmPage>,
) {
    pve.pv_pmap = pmap;
    pve.pv_va = va;
    pve.pv_ptp = ptp;
    let mut head = pg.pv_list.lock();
    pve.pv_next = head.0;
    head.0 = pve;
}

/// Remove a mapping from a frame's pv chain, returning the detached
/// entry so the caller can recycle it. None if no entry matches.
pub(crate) fn pmap_remove_pv(pg: &VmPage, pmap: *const Pmap, va: u64) -> Option<*mut PvEntry> {
    let mut head = pg.pv_list.lock();
    let mut prevptr: *mut *mut PvEntry = &mut head.0;
    unsafe {
        while !(*prevptr).is_null() {
            let pve = *prevptr;
            if (*pve).pv_pmap == pmap && (*pve).pv_va == va {
                *prevptr = (*pve).pv_next; // remove it!
                (*pve).pv_next = ptr::null_mut();
                return Some(pve);
            }
            prevptr = &mut (*pve).pv_next;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_len(pg: &VmPage) -> usize {
        let head = pg.pv_list.lock();
        let mut n = 0;
        let mut p = head.0;
        while !p.is_null() {
            n += 1;
            p = unsafe { (*p).pv_next };
        }
        n
    }

    #[test]
    fn test_pv_attach_detach() {
        let _g = crate::mm::test_support::setup();
        let pg = VmPage::new(0x5000);
        let pm1 = 0x100 as *const Pmap;
        let pm2 = 0x200 as *const Pmap;

        let a = pmap_alloc_pv().unwrap();
        let b = pmap_alloc_pv().unwrap();
        pmap_enter_pv(&pg, a, pm1, 0x1000, None);
        pmap_enter_pv(&pg, b, pm2, 0x2000, None);
        assert_eq!(chain_len(&pg), 2);

        // No match on the wrong (space, va) pair
        assert!(pmap_remove_pv(&pg, pm1, 0x2000).is_none());
        assert_eq!(chain_len(&pg), 2);

        let pve = pmap_remove_pv(&pg, pm1, 0x1000).unwrap();
        assert_eq!(unsafe { (*pve).pv_va }, 0x1000);
        assert_eq!(chain_len(&pg), 1);
        pmap_free_pv(pve);

        let pve = pmap_remove_pv(&pg, pm2, 0x2000).unwrap();
        pmap_free_pv(pve);
        assert_eq!(chain_len(&pg), 0);
    }

    #[test]
    fn test_pv_pool_reuse() {
        let _g = crate::mm::test_support::setup();
        let pg = VmPage::new(0x6000);
        let pm = 0x300 as *const Pmap;

        let a = pmap_alloc_pv().unwrap();
        pmap_enter_pv(&pg, a, pm, 0x4000, None);
        let pve = pmap_remove_pv(&pg, pm, 0x4000).unwrap();
        pmap_free_pv(pve);

        // The freed node comes back off the free list
        let b = pmap_alloc_pv().unwrap();
        assert_eq!(b as *mut PvEntry, pve);
        pmap_free_pv(b);
    }
}
