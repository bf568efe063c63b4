//! Physical Page Headers and the Frame-Pool Boundary
//!
//! The frame allocator lives outside this layer; it registers a
//! [`PagePool`] at bootstrap and hands out 4KB frames identified by
//! their physical address. Every frame it knows about carries a
//! [`VmPage`] header, and a frame is *managed* (eligible for reverse
//! mapping) exactly when `phys_to_page` finds a header for it.
//!
//! Page-table memory is only ever touched through the physical
//! direct-map window configured at bootstrap.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Once;

use crate::ke::SpinLock;
use crate::mm::pte::{pmap_pte2flags, PAGE_SIZE, PG_A, PG_M};
use crate::mm::pv::PvHead;

/// Header describing one physical frame.
///
/// The pool owns the storage; the pmap layer uses the header for PTP
/// wire counting and for the per-frame reverse-map chain.
pub struct VmPage {
    /// Physical address of the frame (page aligned, never changes)
    pa: u64,
    /// Software attribute flags (PG_PMAP_REF / PG_PMAP_MOD / PG_PMAP_WC)
    pub pg_flags: AtomicU32,
    /// 1 for existence plus one per live child entry when used as a PTP
    pub wire_count: AtomicU32,
    /// Head of the pv chain, guarded by the per-frame mutex
    pub(crate) pv_list: SpinLock<PvHead>,
}

impl VmPage {
    /// Create a header for the frame at `pa`. Pool implementations call
    /// this once per frame they manage.
    pub const fn new(pa: u64) -> Self {
        Self {
            pa,
            pg_flags: AtomicU32::new(0),
            wire_count: AtomicU32::new(0),
            pv_list: SpinLock::new(PvHead::empty()),
        }
    }

    #[inline]
    pub fn pa(&self) -> u64 {
        self.pa
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.pg_flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_flags(&self, bits: u32) {
        self.pg_flags.fetch_or(bits, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_flags(&self, bits: u32) {
        self.pg_flags.fetch_and(!bits, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn wire(&self) -> u32 {
        self.wire_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_wire(&self, n: u32) {
        self.wire_count.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn wire_inc(&self) {
        self.wire_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn wire_dec(&self) -> u32 {
        self.wire_count.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

/// Fold the accessed/dirty bits of a dying or changing PTE into the
/// frame header. Called on every leaf mutation that observes a valid
/// old entry.
#[inline]
pub fn pmap_sync_flags_pte(pg: &VmPage, pte: u64) {
    if pte & (PG_A | PG_M) != 0 {
        pg.set_flags(pmap_pte2flags(pte));
    }
}

// ============================================================================
// Frame-pool boundary
// ============================================================================

/// The physical frame allocator, as seen from the pmap layer.
///
/// `alloc` returns a zeroed frame or None on exhaustion; it may sleep
/// unless `nowait` is set, so callers must not hold any pmap or frame
/// mutex across it unless they pass `nowait`.
pub trait PagePool: Sync {
    fn alloc(&self, nowait: bool) -> Option<&'static VmPage>;
    fn free(&self, pg: &'static VmPage);
    /// Header lookup; Some iff the frame is managed
    fn phys_to_page(&self, pa: u64) -> Option<&'static VmPage>;
}

static PAGE_POOL: Once<&'static dyn PagePool> = Once::new();

/// Register the frame pool. Called once from `pmap_bootstrap`.
pub fn set_page_pool(pool: &'static dyn PagePool) {
    PAGE_POOL.call_once(|| pool);
}

#[inline]
pub(crate) fn page_pool() -> &'static dyn PagePool {
    *PAGE_POOL.get().expect("mm: no page pool registered")
}

/// Header for a managed frame, None for device memory and other frames
/// the allocator has never heard of.
#[inline]
pub fn phys_to_page(pa: u64) -> Option<&'static VmPage> {
    PAGE_POOL.get().and_then(|p| p.phys_to_page(pa))
}

// ============================================================================
// Physical direct-map window
// ============================================================================

static DMAP_BASE: AtomicU64 = AtomicU64::new(0);
static DMAP_LEN: AtomicU64 = AtomicU64::new(0);

/// Configure the direct window. Called once from `pmap_bootstrap` with
/// the virtual base the boot code mapped physical memory at.
pub(crate) fn dmap_configure(base: u64, len: u64) {
    DMAP_BASE.store(base, Ordering::Relaxed);
    DMAP_LEN.store(len, Ordering::Relaxed);
}

/// (base, len) of the direct window
#[inline]
pub(crate) fn dmap_range() -> (u64, u64) {
    (
        DMAP_BASE.load(Ordering::Relaxed),
        DMAP_LEN.load(Ordering::Relaxed),
    )
}

/// Virtual alias of a physical address through the direct window
#[inline]
pub fn pmap_direct_map(pa: u64) -> *mut u8 {
    (DMAP_BASE.load(Ordering::Relaxed).wrapping_add(pa)) as *mut u8
}

/// View a page-table frame as its 512 entries. Leaf stores must be
/// atomic 64-bit operations, so the whole table is exposed atomically.
#[inline]
pub(crate) fn pmap_table(pa: u64) -> &'static [AtomicU64; 512] {
    unsafe { &*(pmap_direct_map(pa) as *const [AtomicU64; 512]) }
}

// ============================================================================
// Frame services for the upper layer
// ============================================================================

/// Zero a managed frame through the direct window
pub fn pmap_zero_page(pg: &VmPage) {
    unsafe {
        core::ptr::write_bytes(pmap_direct_map(pg.pa()), 0, PAGE_SIZE);
    }
}

/// Copy one managed frame onto another through the direct window
pub fn pmap_copy_page(srcpg: &VmPage, dstpg: &VmPage) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            pmap_direct_map(srcpg.pa()),
            pmap_direct_map(dstpg.pa()),
            PAGE_SIZE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pte::{PG_PMAP_MOD, PG_PMAP_REF};

    #[test]
    fn test_sync_flags() {
        let pg = VmPage::new(0x1000);
        pmap_sync_flags_pte(&pg, 0);
        assert_eq!(pg.flags(), 0);

        pmap_sync_flags_pte(&pg, PG_A);
        assert_eq!(pg.flags(), PG_PMAP_REF);

        pmap_sync_flags_pte(&pg, PG_M);
        assert_eq!(pg.flags(), PG_PMAP_REF | PG_PMAP_MOD);
    }

    #[test]
    fn test_zero_and_copy_page() {
        let _g = crate::mm::test_support::setup();
        let src = crate::mm::test_support::pool().alloc(false).unwrap();
        let dst = crate::mm::test_support::pool().alloc(false).unwrap();

        unsafe {
            core::ptr::write_bytes(pmap_direct_map(src.pa()), 0xa5, PAGE_SIZE);
        }
        pmap_copy_page(src, dst);
        let d = pmap_direct_map(dst.pa());
        assert_eq!(unsafe { *d }, 0xa5);
        assert_eq!(unsafe { *d.add(PAGE_SIZE - 1) }, 0xa5);

        pmap_zero_page(dst);
        assert_eq!(unsafe { *d }, 0);
        assert_eq!(unsafe { *d.add(PAGE_SIZE - 1) }, 0);

        crate::mm::test_support::pool().free(src);
        crate::mm::test_support::pool().free(dst);
    }

    #[test]
    fn test_wire_accounting() {
        let pg = VmPage::new(0x2000);
        pg.set_wire(1);
        pg.wire_inc();
        pg.wire_inc();
        assert_eq!(pg.wire(), 3);
        assert_eq!(pg.wire_dec(), 2);
        assert_eq!(pg.wire_dec(), 1);
    }
}
