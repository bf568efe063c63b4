//! Physical Map (pmap): address spaces and mapping operations
//!
//! A `Pmap` is the machine-dependent half of one address space: it owns
//! the physical address of the top-level page-table root, the per-level
//! page-table-page indices, the resident/wired counters, and the mask
//! of CPUs currently running with the root loaded. The upper VM layer
//! calls the operations here to install, change, and tear down
//! translations; everything else in `mm` exists to serve them.
//!
//! # Locking
//!
//! From innermost to outermost: the per-frame pv mutex, the per-pmap
//! mutex, the global pmap-list lock, and the shoot-state word. Code
//! holding an outer lock may take an inner one, never the reverse; the
//! one place that needs to go the wrong way (walking a frame's pv chain
//! into its pmaps) drops the frame lock, takes the pmap lock, and
//! re-validates the chain head.
//!
//! # Mutation protocol
//!
//! Leaf PTE writes are single atomic 64-bit stores. Every mutation that
//! observes a valid old entry syncs its accessed/dirty bits into the
//! frame header, issues the TLB shootdown while still holding the pmap
//! lock, and waits for acknowledgement after dropping it. Frames for
//! dead page-table pages are recycled only after the wait.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::hal::cpu;
use crate::ke::SpinLock;
use crate::mm::ept;
use crate::mm::page::{
    self, dmap_range, page_pool, phys_to_page, pmap_sync_flags_pte, pmap_table, PagePool, VmPage,
};
use crate::mm::ptp::{pmap_find_ptp, pmap_free_ptp, pmap_get_ptp, PgToFree};
use crate::mm::pte::*;
use crate::mm::pv::{
    pmap_alloc_pv, pmap_enter_pv, pmap_free_pv, pmap_remove_pv, PvEntry,
};
use crate::mm::tlb::{
    pmap_tlb_shootpage, pmap_tlb_shootrange, pmap_tlb_shoottlb, pmap_tlb_shootwait,
};

/// Errors visible to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    /// A pv entry or page-table page could not be allocated (only
    /// reported when the caller asked for CANFAIL semantics), or a
    /// guest-physical address exceeds the supported maximum.
    NoMemory,
}

bitflags! {
    /// Flags accepted by `pmap_enter` and `pmap_kenter_pa`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: u32 {
        /// Set the software wired bit; the mapping is non-evictable
        const WIRED = 1 << 0;
        /// Return NoMemory instead of panicking on allocation failure
        const CANFAIL = 1 << 1;
        /// Map uncached
        const NOCACHE = 1 << 2;
        /// Map write-combining (mutually exclusive with NOCACHE)
        const WRITE_COMBINE = 1 << 3;
    }
}

/// Which translation regime a pmap implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PmapType {
    /// Ordinary x86 page tables
    Normal = 1,
    /// Extended (nested) page tables for a guest
    Ept = 2,
}

/// Flags for the internal remove path
pub(crate) const PMAP_REMOVE_ALL: u32 = 0;
pub(crate) const PMAP_REMOVE_SKIPWIRED: u32 = 1;

// ============================================================================
// The pmap object
// ============================================================================

/// Per-pmap counters
pub struct PmapStats {
    /// Valid leaf PTEs in the tree
    pub resident_count: i64,
    /// Leaves carrying the software wired bit
    pub wired_count: i64,
}

/// State guarded by the per-pmap mutex
pub(crate) struct PmapInner {
    /// In-use PTPs per non-leaf level, keyed by derived PTP offset.
    /// Index 0 holds level-1 pages, index 2 level-3 pages.
    pub(crate) obj: [BTreeMap<u64, &'static VmPage>; 3],
    /// One cached PTP per level
    pub(crate) ptphint: [Option<&'static VmPage>; 3],
    /// Frame backing the top-level root
    pub(crate) root_pg: Option<&'static VmPage>,
    /// Frame backing the shadow (U-K) root, if any
    pub(crate) root_intel_pg: Option<&'static VmPage>,
    /// Physical address of the shadow root, 0 if absent
    pub(crate) pdir_intel_pa: u64,
    pub(crate) stats: PmapStats,
}

/// One address space's translations
pub struct Pmap {
    /// Reference count; the pmap dies when it reaches zero
    refs: AtomicU32,
    /// CPUs currently holding this root loaded
    pm_cpus: AtomicU64,
    /// Translation regime (see `PmapType`)
    pm_type: AtomicU32,
    /// Physical address of the top-level root
    pm_pdirpa: AtomicU64,
    /// Physical address of the shadow root; what the trap-return path
    /// loads before dropping to user mode on Meltdown-class CPUs
    pm_pdirpa_intel: AtomicU64,
    pub(crate) inner: SpinLock<PmapInner>,
}

impl Pmap {
    const fn new_static() -> Self {
        Self {
            refs: AtomicU32::new(0),
            pm_cpus: AtomicU64::new(0),
            pm_type: AtomicU32::new(PmapType::Normal as u32),
            pm_pdirpa: AtomicU64::new(0),
            pm_pdirpa_intel: AtomicU64::new(0),
            inner: SpinLock::new(PmapInner {
                obj: [BTreeMap::new(), BTreeMap::new(), BTreeMap::new()],
                ptphint: [None, None, None],
                root_pg: None,
                root_intel_pg: None,
                pdir_intel_pa: 0,
                stats: PmapStats {
                    resident_count: 0,
                    wired_count: 0,
                },
            }),
        }
    }

    /// Physical address of the top-level root
    #[inline]
    pub fn pdirpa(&self) -> u64 {
        self.pm_pdirpa.load(Ordering::Relaxed)
    }

    /// Physical address of the shadow (U-K) root, 0 if absent
    #[inline]
    pub fn pdirpa_intel(&self) -> u64 {
        self.pm_pdirpa_intel.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pm_type(&self) -> PmapType {
        if self.pm_type.load(Ordering::Relaxed) == PmapType::Ept as u32 {
            PmapType::Ept
        } else {
            PmapType::Normal
        }
    }

    /// CPUs currently holding this pmap loaded
    #[inline]
    pub fn cpus(&self) -> u64 {
        self.pm_cpus.load(Ordering::Relaxed)
    }

    pub fn resident_count(&self) -> i64 {
        self.inner.lock().stats.resident_count
    }

    pub fn wired_count(&self) -> i64 {
        self.inner.lock().stats.wired_count
    }
}

struct PmapRef(*const Pmap);
unsafe impl Send for PmapRef {}

/// The kernel's pmap (static, never freed, shared kernel half)
static KERNEL_PMAP_STORE: Pmap = Pmap::new_static();

/// Linked list of all non-kernel pmaps
static PMAPS: SpinLock<Vec<PmapRef>> = SpinLock::new(Vec::new());

/// Kernel-virtual growth bookkeeping (single writer)
struct KvaState {
    /// Kernel PTPs per level (index 3 = top-level entry count)
    nkptp: [usize; 4],
    maxkva: u64,
}

static PMAP_GROW: SpinLock<KvaState> = SpinLock::new(KvaState {
    nkptp: [0; 4],
    maxkva: VM_MIN_KERNEL_ADDRESS,
});

/// pv tracking enabled (set once early bringup is done)
static PMAP_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// This CPU needs the user/kernel split (shadow roots)
static CPU_MELTDOWN: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn pmap_kernel() -> &'static Pmap {
    &KERNEL_PMAP_STORE
}

#[inline]
pub fn cpu_meltdown() -> bool {
    CPU_MELTDOWN.load(Ordering::Relaxed)
}

#[inline]
fn pmap_initialized() -> bool {
    PMAP_INITIALIZED.load(Ordering::Relaxed)
}

/// Is this pmap the one currently loaded in the root register? The
/// kernel's is always loaded.
#[inline]
pub(crate) fn pmap_is_curpmap(pmap: &Pmap) -> bool {
    ptr::eq(pmap, pmap_kernel()) || pmap.pdirpa() == cpu::read_cr3()
}

/// Is this pmap loaded into the given processor's root register?
#[inline]
pub(crate) fn pmap_is_active(pmap: &Pmap, cpu_id: usize) -> bool {
    ptr::eq(pmap, pmap_kernel()) || pmap.pm_cpus.load(Ordering::Relaxed) & (1 << cpu_id) != 0
}

// ============================================================================
// Tree walking
// ============================================================================

/// Entry covering `va` at `level`, reached by descending through the
/// direct window. The path above `level` must be valid.
pub(crate) fn pmap_pte_slot(root_pa: u64, va: u64, level: usize) -> &'static AtomicU64 {
    let mut pa = root_pa;
    let mut lvl = PTP_LEVELS;
    while lvl > level {
        let pde = pmap_table(pa)[pl_pi(va, lvl)].load(Ordering::Relaxed);
        debug_assert!(
            pmap_valid_entry(pde),
            "pmap_pte_slot: invalid entry at level {} for va {:#x}",
            lvl,
            va
        );
        pa = pde & PG_FRAME;
        lvl -= 1;
    }
    &pmap_table(pa)[pl_pi(va, level)]
}

/// Walk the tree for `va`. Returns how deep the walk got and the entry
/// it stopped at: 0 with the leaf PTE slot on a complete walk, N > 0
/// with the entry one level above the tables it never reached, either
/// because the entry is invalid or because it is a large-page terminal.
/// Never allocates, never mutates.
pub fn pmap_find_pte_direct(pmap: &Pmap, va: u64) -> (usize, &'static AtomicU64) {
    let mut pa = pmap.pdirpa();
    let mut lev = PTP_LEVELS;
    loop {
        let slot = &pmap_table(pa)[pl_pi(va, lev)];
        let pde = slot.load(Ordering::Relaxed);

        // Large pages are different, break early if we run into one.
        if (pde & (PG_PS | PG_V)) != PG_V {
            return (lev - 1, slot);
        }
        if lev == 1 {
            return (0, slot);
        }
        pa = pde & PG_FRAME;
        lev -= 1;
    }
}

/// Are all non-leaf entries covering `va` valid? Returns the level-2
/// entry (the one naming the leaf PTP) if so.
fn pmap_pdes_valid(pmap: &Pmap, va: u64) -> Option<u64> {
    let mut pa = pmap.pdirpa();
    let mut pde = 0;
    for lev in (2..=PTP_LEVELS).rev() {
        pde = pmap_table(pa)[pl_pi(va, lev)].load(Ordering::Relaxed);
        if !pmap_valid_entry(pde) {
            return None;
        }
        pa = pde & PG_FRAME;
    }
    Some(pde)
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Everything the platform hands the pmap layer at bring-up
pub struct BootstrapArgs {
    /// The physical frame allocator
    pub pool: &'static dyn PagePool,
    /// The CPU plane
    pub cpu: &'static dyn cpu::CpuOps,
    /// Virtual base of the physical direct-map window
    pub dmap_base: u64,
    /// Length of the direct window in bytes
    pub dmap_len: u64,
    /// Prebuilt top-level entry for the direct-map slot, 0 if none
    pub dmap_slot_entry: u64,
    /// CPU leaks kernel data under speculation from user mode
    pub cpu_meltdown: bool,
    /// Global kernel pages are safe on this CPU
    pub pg_g_kern: bool,
    /// Processor supports the PAT (enables a real WC encoding)
    pub pat_support: bool,
}

/// Get the pmap layer in a state where it can manage mappings:
/// register the collaborators, pick the runtime encodings, and stand up
/// the kernel pmap's root.
pub fn pmap_bootstrap(args: BootstrapArgs) {
    cpu::set_cpu_ops(args.cpu);
    page::set_page_pool(args.pool);
    page::dmap_configure(args.dmap_base, args.dmap_len);

    if args.pat_support {
        set_pmap_pg_wc(PG_WC_PAT);
    }
    if args.pg_g_kern {
        set_pg_g_kern(PG_G);
    }
    CPU_MELTDOWN.store(args.cpu_meltdown, Ordering::Relaxed);

    let kpm = pmap_kernel();
    let root = page_pool()
        .alloc(false)
        .expect("pmap_bootstrap: no frame for kernel root");
    root.set_wire(1);
    if args.dmap_slot_entry != 0 {
        pmap_table(root.pa())[PDIR_SLOT_DIRECT].store(args.dmap_slot_entry, Ordering::SeqCst);
    }
    kpm.pm_pdirpa.store(root.pa(), Ordering::Relaxed);
    kpm.refs.store(1, Ordering::Relaxed);
    kpm.inner.lock().root_pg = Some(root);

    log::debug!(
        "pmap_bootstrap: kernel root at {:#x}, dmap {:#x}+{:#x}",
        root.pa(),
        args.dmap_base,
        args.dmap_len
    );
}

/// Finish bringing the pmap module up: from here on, frames the
/// allocator knows about get reverse-map tracking.
pub fn pmap_init() {
    PMAP_INITIALIZED.store(true, Ordering::Relaxed);
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Top-level root constructor: user half empty, kernel half copied by
/// value from the kernel pmap, direct-map slot shared.
fn pmap_pdp_ctor(pdir_pa: u64) {
    let kroot = pmap_table(pmap_kernel().pdirpa());
    let pdir = pmap_table(pdir_pa);

    for i in 0..PDIR_SLOT_KERN {
        pdir[i].store(0, Ordering::Relaxed);
    }

    let npde = PMAP_GROW.lock().nkptp[PTP_LEVELS - 1];
    for i in PDIR_SLOT_KERN..PDIR_SLOT_KERN + npde {
        pdir[i].store(kroot[i].load(Ordering::Relaxed), Ordering::Relaxed);
    }
    for i in PDIR_SLOT_KERN + npde..ENTRIES_PER_TABLE {
        pdir[i].store(0, Ordering::Relaxed);
    }

    pdir[PDIR_SLOT_DIRECT].store(kroot[PDIR_SLOT_DIRECT].load(Ordering::Relaxed), Ordering::Relaxed);
}

/// Shadow-root constructor: start from the kernel's U-K view
fn pmap_pdp_ctor_intel(pdir_pa: u64) {
    let kintel = pmap_kernel().pdirpa_intel();
    if kintel == 0 {
        return;
    }
    let src = pmap_table(kintel);
    let pdir = pmap_table(pdir_pa);
    for i in 0..ENTRIES_PER_TABLE {
        pdir[i].store(src[i].load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// Create a new (user) address space. Fatal on allocator exhaustion.
pub fn pmap_create() -> &'static Pmap {
    let pmap: &'static mut Pmap = Box::leak(Box::new(Pmap::new_static()));
    pmap.refs.store(1, Ordering::Relaxed);

    let root = page_pool().alloc(false).expect("pmap_create: out of memory");
    root.set_wire(1);
    pmap_pdp_ctor(root.pa());
    pmap.pm_pdirpa.store(root.pa(), Ordering::Relaxed);

    {
        let mut inner = pmap.inner.lock();
        inner.root_pg = Some(root);

        // Meltdown-class CPUs need a second root, lacking all kernel
        // mappings, for usermode execution.
        if cpu_meltdown() {
            let ri = page_pool()
                .alloc(false)
                .expect("pmap_create: out of memory for U-K root");
            ri.set_wire(1);
            pmap_pdp_ctor_intel(ri.pa());
            inner.root_intel_pg = Some(ri);
            inner.pdir_intel_pa = ri.pa();
            pmap.pm_pdirpa_intel.store(ri.pa(), Ordering::Relaxed);
        }
    }

    PMAPS.lock().push(PmapRef(pmap));
    pmap
}

/// Add a reference to the pmap
pub fn pmap_reference(pmap: &Pmap) {
    pmap.refs.fetch_add(1, Ordering::Relaxed);
}

/// Drop a reference; the last one tears the address space down and
/// returns every PTP and root frame to the allocator.
pub fn pmap_destroy(pmap: &Pmap) {
    if pmap.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    if pmap.pm_cpus.load(Ordering::Relaxed) != 0 {
        log::warn!(
            "pmap_destroy: pmap {:p} still active, cpus={:#x}",
            pmap,
            pmap.pm_cpus.load(Ordering::Relaxed)
        );
    }

    PMAPS.lock().retain(|r| !ptr::eq(r.0, pmap));

    {
        let mut inner = pmap.inner.lock();
        for lidx in 0..PTP_LEVELS - 1 {
            inner.ptphint[lidx] = None;
            while let Some((_, pg)) = inner.obj[lidx].pop_first() {
                pg.set_wire(0);
                page_pool().free(pg);
            }
        }
        if let Some(root) = inner.root_pg.take() {
            page_pool().free(root);
        }
        if let Some(root) = inner.root_intel_pg.take() {
            page_pool().free(root);
        }
        inner.pdir_intel_pa = 0;
    }

    unsafe {
        drop(Box::from_raw(pmap as *const Pmap as *mut Pmap));
    }
}

/// Load the pmap on `cpu_id`: note it in the residency mask and, if
/// that is the calling CPU, fill the root register.
pub fn pmap_activate(pmap: &Pmap, cpu_id: usize) {
    pmap.pm_cpus.fetch_or(1 << cpu_id, Ordering::Relaxed);
    if cpu_id == cpu::cpu_number() {
        cpu::load_cr3(pmap.pdirpa());
    }
}

/// Forget the residency bit; the register keeps its value until the
/// next activate overwrites it.
pub fn pmap_deactivate(pmap: &Pmap, cpu_id: usize) {
    pmap.pm_cpus.fetch_and(!(1 << cpu_id), Ordering::Relaxed);
}

/// Convert a pmap to a different translation regime. Existing leaf
/// contents of the root are destroyed.
pub fn pmap_convert(pmap: &Pmap, mode: PmapType) {
    pmap.pm_type.store(mode as u32, Ordering::Relaxed);

    if mode == PmapType::Ept {
        let mut inner = pmap.inner.lock();
        let pdir = pmap_table(pmap.pdirpa());
        for i in 0..ENTRIES_PER_TABLE {
            pdir[i].store(0, Ordering::Relaxed);
        }
        // the guest regime has no use for the U-K root
        if let Some(ri) = inner.root_intel_pg.take() {
            page_pool().free(ri);
        }
        inner.pdir_intel_pa = 0;
        pmap.pm_pdirpa_intel.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Physical address behind `va`, if any. Kernel addresses inside the
/// direct window are answered without a walk.
pub fn pmap_extract(pmap: &Pmap, va: u64) -> Option<u64> {
    if ptr::eq(pmap, pmap_kernel()) {
        let (base, len) = dmap_range();
        if len != 0 && va >= base && va < base + len {
            return Some(va - base);
        }
    }

    let (level, slot) = pmap_find_pte_direct(pmap, va);
    let pte = slot.load(Ordering::Relaxed);

    if level == 0 && pmap_valid_entry(pte) {
        return Some((pte & PG_FRAME) | (va & PAGE_MASK));
    }
    if level == 1 && (pte & (PG_PS | PG_V)) == (PG_PS | PG_V) {
        return Some((pte & PG_LGFRAME) | (va & (NBPD_L2 - 1)));
    }
    None
}

/// Flush the data cache for a virtual range
pub fn pmap_flush_cache(va: u64, len: u64) {
    let sz = cpu::clflush_size() as u64;
    if sz == 0 {
        cpu::wbinvd();
        return;
    }
    let mut i = va;
    while i < va + len {
        cpu::clflush(i);
        i += sz;
    }
}

// ============================================================================
// Kernel fast enter/remove (no reverse-map tracking)
// ============================================================================

/// Enter a kernel mapping without pv tracking. The kernel PTPs covering
/// `va` must already exist (`pmap_growkernel`).
pub fn pmap_kenter_pa(va: u64, pa: u64, prot: VmProt, flags: EnterFlags) {
    let kpm = pmap_kernel();
    let nocache = flags.contains(EnterFlags::NOCACHE);
    let wc = flags.contains(EnterFlags::WRITE_COMBINE);

    let pde = pmap_pdes_valid(kpm, va).expect("pmap_kenter_pa: missing kernel PTP");
    let slot = &pmap_table(pde & PG_FRAME)[pl_pi(va, 1)];

    let mut npte = (pa & PG_FRAME)
        | if prot.contains(VmProt::WRITE) { PG_RW } else { 0 }
        | if nocache { PG_N } else { 0 }
        | if wc { pmap_pg_wc() } else { 0 }
        | PG_V;

    // special 1:1 mappings in the first 2MB must not be global
    if va >= NBPD_L2 {
        npte |= pg_g_kern();
    }
    if !prot.contains(VmProt::EXEC) {
        npte |= PG_NX;
    }

    let opte = slot.swap(npte, Ordering::SeqCst);
    debug_assert!(opte & PG_PS == 0);

    if pmap_valid_entry(opte) {
        if nocache && (opte & PG_N) == 0 {
            cpu::wbinvd();
        }
        // This shouldn't happen
        pmap_tlb_shootpage(kpm, va, true);
        pmap_tlb_shootwait();
    }
}

/// Remove kernel mappings without pv tracking. `va` must be page
/// aligned and `len` a multiple of the page size; the caller disposes
/// of any managed frames in the range.
pub fn pmap_kremove(sva: u64, len: u64) {
    let kpm = pmap_kernel();
    let eva = sva + len;

    let mut va = sva;
    while va < eva {
        let pde = pmap_pdes_valid(kpm, va).expect("pmap_kremove: missing kernel PTP");
        let slot = &pmap_table(pde & PG_FRAME)[pl_pi(va, 1)];
        let opte = slot.swap(0, Ordering::SeqCst);
        debug_assert!(opte & PG_PS == 0);
        debug_assert!(opte & PG_PVLIST == 0);
        va += PAGE_SIZE as u64;
    }

    pmap_tlb_shootrange(kpm, sva, eva, true);
    pmap_tlb_shootwait();
}

// ============================================================================
// Removal
// ============================================================================

/// Remove a single leaf PTE. Returns true if a mapping was removed.
/// Detached pv entries are chained onto `free_pvs` for the caller to
/// recycle after shootdown.
fn pmap_remove_pte(
    pmap: &Pmap,
    inner: &mut PmapInner,
    ptp: Option<&'static VmPage>,
    slot: &AtomicU64,
    va: u64,
    flags: u32,
    free_pvs: &mut *mut PvEntry,
) -> bool {
    let opte = slot.load(Ordering::Relaxed);
    if !pmap_valid_entry(opte) {
        return false; // VA not mapped
    }
    if flags & PMAP_REMOVE_SKIPWIRED != 0 && opte & PG_W != 0 {
        return false;
    }

    // atomically save the old PTE and zap it
    let opte = slot.swap(0, Ordering::SeqCst);

    if opte & PG_W != 0 {
        inner.stats.wired_count -= 1;
    }
    inner.stats.resident_count -= 1;

    if let Some(ptp) = ptp {
        ptp.wire_dec(); // dropping a PTE
    }

    let pg = phys_to_page(opte & PG_FRAME);

    // if we are not on a pv list we are done
    if opte & PG_PVLIST == 0 {
        #[cfg(debug_assertions)]
        if pg.is_some() {
            panic!("pmap_remove_pte: managed page without PG_PVLIST for {va:#x}");
        }
        return true;
    }

    let pg = pg.unwrap_or_else(|| {
        panic!(
            "pmap_remove_pte: unmanaged page marked PG_PVLIST, va = {:#x}, pa = {:#x}",
            va,
            opte & PG_FRAME
        )
    });

    pmap_sync_flags_pte(pg, opte);
    if let Some(pve) = pmap_remove_pv(pg, pmap as *const _, va) {
        unsafe {
            (*pve).pv_next = *free_pvs;
        }
        *free_pvs = pve;
    }

    true
}

/// Remove the leaf PTEs in `[startva, endva)` from one PTP, halting
/// early once the PTP's wire count says no live leaves remain.
fn pmap_remove_ptes(
    pmap: &Pmap,
    inner: &mut PmapInner,
    ptp: Option<&'static VmPage>,
    ptppa: u64,
    startva: u64,
    endva: u64,
    flags: u32,
    free_pvs: &mut *mut PvEntry,
) {
    let tbl = pmap_table(ptppa);
    let mut va = startva;

    // the wire_count tracks the number of live PTEs in the PTP; once it
    // is back to 1 there is nothing left to look at
    while va < endva && ptp.map_or(true, |p| p.wire() > 1) {
        let slot = &tbl[pl_pi(va, 1)];
        pmap_remove_pte(pmap, inner, ptp, slot, va, flags, free_pvs);
        va += PAGE_SIZE as u64;
    }
}

/// Remove the translations for `[sva, eva)`
pub fn pmap_remove(pmap: &Pmap, sva: u64, eva: u64) {
    if pmap.pm_type() == PmapType::Ept {
        ept::pmap_remove_ept(pmap, sva, eva);
    } else {
        pmap_do_remove(pmap, sva, eva, PMAP_REMOVE_ALL);
    }
}

/// Mapping removal guts
pub(crate) fn pmap_do_remove(pmap: &Pmap, sva: u64, eva: u64, flags: u32) {
    let kernel = ptr::eq(pmap, pmap_kernel());
    let mut empty_ptps: PgToFree = Vec::new();
    let mut free_pvs: *mut PvEntry = ptr::null_mut();

    let mut inner = pmap.inner.lock();
    let shootself = pmap_is_curpmap(pmap);

    // removing one page? take the shortcut
    if sva + PAGE_SIZE as u64 == eva {
        if let Some(pde) = pmap_pdes_valid(pmap, sva) {
            let ptppa = pde & PG_FRAME;
            let ptp = if kernel {
                None // we never free kernel PTPs
            } else {
                Some(
                    pmap_find_ptp(&mut inner, sva, ptppa, 1)
                        .expect("pmap_do_remove: unmanaged PTP detected"),
                )
            };

            let slot = &pmap_table(ptppa)[pl_pi(sva, 1)];
            let result = pmap_remove_pte(pmap, &mut inner, ptp, slot, sva, flags, &mut free_pvs);

            // if the mapping went and the PTP is no longer used, free it
            if result {
                if let Some(p) = ptp {
                    if p.wire() <= 1 {
                        pmap_free_ptp(pmap, &mut inner, p, sva, &mut empty_ptps);
                    }
                }
            }
            pmap_tlb_shootpage(pmap, sva, shootself);
            drop(inner);
            pmap_tlb_shootwait();
        } else {
            drop(inner);
        }

        pmap_remove_cleanup(free_pvs, empty_ptps);
        return;
    }

    let shootall = eva - sva > 32 * PAGE_SIZE as u64 && !kernel;

    let mut va = sva;
    while va < eva {
        // determine the range of this 2MB block
        let blkendva = x86_round_pdr(va + 1).min(eva);

        // the reserved self-map slot is never traversed: descending
        // into it could free the root out from under us
        if pl4_i(va) == PDIR_SLOT_PTE {
            va = blkendva;
            continue;
        }

        if let Some(pde) = pmap_pdes_valid(pmap, va) {
            let ptppa = pde & PG_FRAME;
            let ptp = if kernel {
                None
            } else {
                Some(
                    pmap_find_ptp(&mut inner, va, ptppa, 1)
                        .expect("pmap_do_remove: unmanaged PTP detected"),
                )
            };

            pmap_remove_ptes(pmap, &mut inner, ptp, ptppa, va, blkendva, flags, &mut free_pvs);

            if let Some(p) = ptp {
                if p.wire() <= 1 {
                    pmap_free_ptp(pmap, &mut inner, p, va, &mut empty_ptps);
                }
            }
        }
        va = blkendva;
    }

    if shootall {
        pmap_tlb_shoottlb(pmap, shootself);
    } else {
        pmap_tlb_shootrange(pmap, sva, eva, shootself);
    }

    drop(inner);
    pmap_tlb_shootwait();

    pmap_remove_cleanup(free_pvs, empty_ptps);
}

/// Recycle pv entries and PTP frames once shootdown has completed
fn pmap_remove_cleanup(mut free_pvs: *mut PvEntry, empty_ptps: PgToFree) {
    while !free_pvs.is_null() {
        let next = unsafe { (*free_pvs).pv_next };
        pmap_free_pv(free_pvs);
        free_pvs = next;
    }
    for ptp in empty_ptps {
        page_pool().free(ptp);
    }
}

/// Remove every alias of a managed frame, from all address spaces.
///
/// The chain is walked with the drop-and-retry pattern: we may not take
/// a pmap mutex while holding the frame mutex, so the frame lock is
/// dropped, the pmap referenced and locked, and the chain head
/// re-validated before each removal.
pub fn pmap_page_remove(pg: &VmPage) {
    let mut empty_ptps: PgToFree = Vec::new();

    loop {
        let pm_ptr = {
            let head = pg.pv_list.lock();
            if head.0.is_null() {
                break;
            }
            unsafe { (*head.0).pv_pmap }
        };
        let pm: &Pmap = unsafe { &*pm_ptr };
        pmap_reference(pm);

        let mut inner = pm.inner.lock();
        let shootself = pmap_is_curpmap(pm);

        // We dropped the frame lock before grabbing the pmap lock, so
        // somebody else may have modified the chain. All we care about
        // is that the head still belongs to the pmap we just locked;
        // otherwise unlock and try again.
        let pve = {
            let mut head = pg.pv_list.lock();
            let pve = head.0;
            if pve.is_null() || unsafe { (*pve).pv_pmap } != pm_ptr {
                drop(head);
                drop(inner);
                pmap_destroy(pm);
                continue;
            }
            head.0 = unsafe { (*pve).pv_next };
            pve
        };

        let va = unsafe { (*pve).pv_va };
        let pv_ptp = unsafe { (*pve).pv_ptp };

        #[cfg(debug_assertions)]
        if let Some(ptp) = pv_ptp {
            if let Some(pde) = pmap_pdes_valid(pm, va) {
                assert_eq!(
                    pde & PG_FRAME,
                    ptp.pa(),
                    "pmap_page_remove: mapped managed page has invalid pv_ptp field"
                );
            }
        }

        // atomically save the old PTE and zap it
        let (level, slot) = pmap_find_pte_direct(pm, va);
        assert_eq!(level, 0, "pmap_page_remove: pv entry without leaf PTE");
        let opte = slot.swap(0, Ordering::SeqCst);

        if opte & PG_W != 0 {
            inner.stats.wired_count -= 1;
        }
        inner.stats.resident_count -= 1;

        pmap_tlb_shootpage(pm, va, shootself);
        pmap_sync_flags_pte(pg, opte);

        // update the PTP reference count; free on last reference
        if let Some(ptp) = pv_ptp {
            if ptp.wire_dec() <= 1 {
                pmap_free_ptp(pm, &mut inner, ptp, va, &mut empty_ptps);
            }
        }

        drop(inner);
        pmap_destroy(pm);
        pmap_free_pv(pve);
    }

    pmap_tlb_shootwait();

    for ptp in empty_ptps {
        page_pool().free(ptp);
    }
}

// ============================================================================
// Attribute tracking
// ============================================================================

/// Do any of the frame's aliases carry the given accessed/dirty bits?
/// Folds what it finds into the frame header.
pub fn pmap_test_attrs(pg: &VmPage, testbits: u64) -> bool {
    let testflags = pmap_pte2flags(testbits);

    if pg.flags() & testflags != 0 {
        return true;
    }

    let mut mybits = 0u64;
    {
        let head = pg.pv_list.lock();
        let mut p = head.0;
        while !p.is_null() && mybits == 0 {
            let (pm, va) = unsafe { ((*p).pv_pmap, (*p).pv_va) };
            let (_, slot) = pmap_find_pte_direct(unsafe { &*pm }, va);
            mybits |= slot.load(Ordering::Relaxed) & testbits;
            p = unsafe { (*p).pv_next };
        }
    }

    if mybits == 0 {
        return false;
    }
    pg.set_flags(pmap_pte2flags(mybits));
    true
}

/// Clear the given accessed/dirty bits from the frame header and every
/// aliasing leaf. Returns true if any bit was set anywhere.
pub fn pmap_clear_attrs(pg: &VmPage, clearbits: u64) -> bool {
    let clearflags = pmap_pte2flags(clearbits);

    let mut result = pg.flags() & clearflags != 0;
    if result {
        pg.clear_flags(clearflags);
    }

    {
        let head = pg.pv_list.lock();
        let mut p = head.0;
        while !p.is_null() {
            let (pm, va) = unsafe { ((*p).pv_pmap, (*p).pv_va) };
            let pm = unsafe { &*pm };
            let (_, slot) = pmap_find_pte_direct(pm, va);
            let opte = slot.load(Ordering::Relaxed);
            if opte & clearbits != 0 {
                result = true;
                slot.fetch_and(!(opte & clearbits), Ordering::SeqCst);
                pmap_tlb_shootpage(pm, va, pmap_is_curpmap(pm));
            }
            p = unsafe { (*p).pv_next };
        }
    }

    pmap_tlb_shootwait();
    result
}

// ============================================================================
// Protection
// ============================================================================

/// Demote `[sva, eva)`: clear the writable bit on every valid leaf and
/// withdraw execute per `prot`. Accessed/dirty state is untouched.
pub fn pmap_write_protect(pmap: &Pmap, sva: u64, eva: u64, prot: VmProt) {
    let kernel = ptr::eq(pmap, pmap_kernel());
    let inner = pmap.inner.lock();
    let shootself = pmap_is_curpmap(pmap);

    // should be ok, but just in case ...
    let sva = sva & PG_FRAME;
    let eva = eva & PG_FRAME;

    let nx = if prot.contains(VmProt::EXEC) { 0 } else { PG_NX };

    let shootall = eva - sva > 32 * PAGE_SIZE as u64 && !kernel;

    let mut va = sva;
    while va < eva {
        let blockend = ((va & L2_FRAME) + NBPD_L2).min(eva);

        // the reserved self-map slot is never traversed
        if pl4_i(va) == PDIR_SLOT_PTE {
            va = blockend;
            continue;
        }

        // empty block?
        if let Some(pde) = pmap_pdes_valid(pmap, va) {
            let tbl = pmap_table(pde & PG_FRAME);
            let mut v = va;
            while v < blockend {
                let slot = &tbl[pl_pi(v, 1)];
                if pmap_valid_entry(slot.load(Ordering::Relaxed)) {
                    slot.fetch_and(!PG_RW, Ordering::SeqCst);
                    if nx != 0 {
                        slot.fetch_or(nx, Ordering::SeqCst);
                    }
                }
                v += PAGE_SIZE as u64;
            }
        }
        va = blockend;
    }

    if shootall {
        pmap_tlb_shoottlb(pmap, shootself);
    } else {
        pmap_tlb_shootrange(pmap, sva, eva, shootself);
    }

    drop(inner);
    pmap_tlb_shootwait();
}

// ============================================================================
// Wiring
// ============================================================================

/// Clear the software wired bit on a leaf. The mapping must exist; the
/// hardware never observes the bit, so no shootdown is needed.
pub fn pmap_unwire(pmap: &Pmap, va: u64) {
    let (level, slot) = pmap_find_pte_direct(pmap, va);
    if level != 0 {
        panic!("pmap_unwire: invalid PDE for va {va:#x}");
    }

    let pte = slot.load(Ordering::Relaxed);
    if !pmap_valid_entry(pte) {
        panic!("pmap_unwire: invalid (unmapped) va {va:#x}");
    }

    if pte & PG_W != 0 {
        slot.fetch_and(!PG_W, Ordering::SeqCst);
        pmap.inner.lock().stats.wired_count -= 1;
    } else {
        log::debug!("pmap_unwire: wiring for pmap {pmap:p} va {va:#x} didn't change");
    }
}

/// Free resources held by a pmap when a process is swapped out.
///
/// Disabled. If re-enabled: remove the entire user range, skipping
/// wired mappings.
pub fn pmap_collect(_pmap: &Pmap) {
    // pmap_do_remove(pmap, 0, VM_MAXUSER_ADDRESS, PMAP_REMOVE_SKIPWIRED);
}

// ============================================================================
// Shadow-root (U-K) mappings
// ============================================================================

/// Install a kernel mapping into the shadow root only. These are the
/// few pages (trampolines, per-CPU entry areas) that must stay mapped
/// while running user code on a Meltdown-class CPU.
pub fn pmap_enter_special(va: u64, pa: u64, prot: VmProt) {
    let pmap = pmap_kernel();

    // if the CPU is secure there is nothing to shadow
    if !cpu_meltdown() {
        return;
    }

    if va < VM_MIN_KERNEL_ADDRESS {
        panic!("pmap_enter_special: invalid special mapping va {va:#x} requested");
    }

    let mut inner = pmap.inner.lock();

    if inner.pdir_intel_pa == 0 {
        let pg = page_pool()
            .alloc(false)
            .expect("pmap_enter_special: no frame for U-K root");
        pg.set_wire(1);
        inner.root_intel_pg = Some(pg);
        inner.pdir_intel_pa = pg.pa();
        pmap.pm_pdirpa_intel.store(pg.pa(), Ordering::Relaxed);
    }

    log::debug!("pmap_enter_special: va={va:#x} pa={pa:#x}");

    // descend the U-K tree, growing it as needed
    let mut tbl_pa = inner.pdir_intel_pa;
    for level in (2..=PTP_LEVELS).rev() {
        let slot = &pmap_table(tbl_pa)[pl_pi(va, level)];
        let npa = slot.load(Ordering::Relaxed) & PG_FRAME;
        if npa != 0 {
            tbl_pa = npa;
            continue;
        }

        let ptp = page_pool()
            .alloc(false)
            .expect("pmap_enter_special: no frame for U-K PTP");
        ptp.set_wire(1);
        slot.store(ptp.pa() | PG_US | PG_RW | PG_V, Ordering::SeqCst);
        log::trace!(
            "pmap_enter_special: new U-K level-{} page at {:#x}",
            level - 1,
            ptp.pa()
        );
        tbl_pa = ptp.pa();
    }

    let slot = &pmap_table(tbl_pa)[pl_pi(va, 1)];
    slot.store(
        (pa & PG_FRAME) | protection_code(prot) | PG_V | PG_W,
        Ordering::SeqCst,
    );

    // Look up the corresponding U+K entry. If we're installing the
    // same PA into the U-K map then set the global bit on both.
    let (level, kslot) = pmap_find_pte_direct(pmap, va);
    let kpte = kslot.load(Ordering::Relaxed);
    if level == 0 && pmap_valid_entry(kpte) {
        if (slot.load(Ordering::Relaxed) ^ kpte) & PG_FRAME == 0 {
            slot.fetch_or(PG_G, Ordering::SeqCst);
            kslot.fetch_or(PG_G, Ordering::SeqCst);
        } else {
            log::debug!("pmap_enter_special: special diffing mapping at {va:#x}");
        }
    } else {
        log::debug!("pmap_enter_special: no U+K mapping for special mapping?");
    }
}

// ============================================================================
// Enter
// ============================================================================

/// Enter a mapping. Must take effect immediately; no lazy evaluation.
pub fn pmap_enter(
    pmap: &Pmap,
    va: u64,
    pa: u64,
    prot: VmProt,
    flags: EnterFlags,
) -> Result<(), PmapError> {
    if pmap.pm_type() == PmapType::Ept {
        return ept::pmap_enter_ept(pmap, va, pa, prot);
    }

    let kernel = ptr::eq(pmap, pmap_kernel());
    let wired = flags.contains(EnterFlags::WIRED);
    let nocache = flags.contains(EnterFlags::NOCACHE);
    let mut wc = flags.contains(EnterFlags::WRITE_COMBINE);
    assert!(!(wc && nocache));
    let pa = pa & PG_FRAME;

    if pl4_i(va) == PDIR_SLOT_PTE {
        panic!("pmap_enter: trying to map over the reserved self-map slot");
    }

    // sanity check: kernel PTPs should already have been pre-allocated
    #[cfg(debug_assertions)]
    if va >= VM_MIN_KERNEL_ADDRESS {
        let e = pmap_table(pmap.pdirpa())[pl4_i(va)].load(Ordering::Relaxed);
        if !pmap_valid_entry(e) {
            panic!("pmap_enter: missing kernel PTP for va {va:#x}");
        }
    }

    let mut pve = match pmap_alloc_pv() {
        Some(pve) => Some(pve),
        None => {
            if flags.contains(EnterFlags::CANFAIL) {
                return Err(PmapError::NoMemory);
            }
            panic!("pmap_enter: no pv entries available");
        }
    };
    let mut opve: *mut PvEntry = ptr::null_mut();

    let mut inner = pmap.inner.lock();
    let shootself = pmap_is_curpmap(pmap);

    let ptp = if kernel {
        None
    } else {
        match pmap_get_ptp(pmap, &mut inner, va) {
            Some(ptp) => Some(ptp),
            None => {
                drop(inner);
                if let Some(pve) = pve {
                    pmap_free_pv(pve);
                }
                if flags.contains(EnterFlags::CANFAIL) {
                    return Err(PmapError::NoMemory);
                }
                panic!("pmap_enter: get ptp failed");
            }
        }
    };

    let slot = pmap_pte_slot(pmap.pdirpa(), va, 1);
    let opte = slot.load(Ordering::Relaxed); // old PTE

    // is there currently a valid mapping at our VA?
    let mut pg: Option<&'static VmPage> = None;
    let resdelta;
    let wireddelta;
    let ptpdelta;
    let mut same_pa = false;

    if pmap_valid_entry(opte) {
        // resident count will not change since we are replacing or
        // changing a valid mapping; wired count might
        resdelta = 0;
        wireddelta = if wired && opte & PG_W == 0 {
            1
        } else if !wired && opte & PG_W != 0 {
            -1
        } else {
            0
        };
        ptpdelta = 0;

        if opte & PG_FRAME == pa {
            // mapping the same frame: keep its pv status, sync R/M
            if opte & PG_PVLIST != 0 {
                let samepg = phys_to_page(pa).unwrap_or_else(|| {
                    panic!(
                        "pmap_enter: same pa PG_PVLIST mapping with unmanaged page pa = {pa:#x}"
                    )
                });
                pmap_sync_flags_pte(samepg, opte);
                pg = Some(samepg);
            } else {
                #[cfg(debug_assertions)]
                if phys_to_page(pa).is_some() {
                    panic!("pmap_enter: same pa, managed page, no PG_PVLIST pa: {pa:#x}");
                }
            }
            same_pa = true;
        } else {
            // changing frames: detach the old reverse mapping first
            if opte & PG_PVLIST != 0 {
                let opg = phys_to_page(opte & PG_FRAME).unwrap_or_else(|| {
                    panic!(
                        "pmap_enter: PG_PVLIST mapping with unmanaged page pa = {:#x}",
                        opte & PG_FRAME
                    )
                });
                pmap_sync_flags_pte(opg, opte);
                if let Some(p) = pmap_remove_pv(opg, pmap as *const _, va) {
                    opve = p;
                }
            }
        }
    } else {
        // opte not valid
        resdelta = 1;
        wireddelta = if wired { 1 } else { 0 };
        ptpdelta = if ptp.is_some() { 1 } else { 0 };
    }

    // if this entry is to be on a pv list, enter it now
    if !same_pa {
        if pmap_initialized() {
            pg = phys_to_page(pa);
        }
        if let Some(pg) = pg {
            pmap_enter_pv(pg, pve.take().unwrap(), pmap as *const _, va, ptp);
        }
    }

    // at this point pg is Some iff we want the PG_PVLIST bit set
    inner.stats.resident_count += resdelta;
    inner.stats.wired_count += wireddelta;
    if let Some(ptp) = ptp {
        if ptpdelta > 0 {
            ptp.wire_inc();
        }
    }

    let mut npte = pa | protection_code(prot) | PG_V;
    if let Some(pg) = pg {
        npte |= PG_PVLIST;
        // if the frame is write combined anywhere, every mapping is
        if pg.flags() & PG_PMAP_WC != 0 {
            assert!(!nocache);
            wc = true;
        }
    }
    if wc {
        npte |= pmap_pg_wc();
    }
    if wired {
        npte |= PG_W;
    }
    if nocache {
        npte |= PG_N;
    }
    if va < VM_MAXUSER_ADDRESS {
        npte |= PG_US;
    }
    if kernel {
        npte |= pg_g_kern();
    }

    slot.store(npte, Ordering::SeqCst); // zap!

    // if we changed anything other than modified/used bits, flush the TLB
    if pmap_valid_entry(opte) {
        if nocache && opte & PG_N == 0 {
            cpu::wbinvd();
        }
        pmap_tlb_shootpage(pmap, va, shootself);
    }

    drop(inner);
    pmap_tlb_shootwait();

    if let Some(pve) = pve {
        pmap_free_pv(pve);
    }
    if !opve.is_null() {
        pmap_free_pv(opve);
    }

    Ok(())
}

// ============================================================================
// Kernel-space grower
// ============================================================================

/// Allocate one kernel PTP at `level` covering `va` and thread it into
/// the kernel tree. Fatal on exhaustion; running out of frames while
/// growing kernel VA is unrecoverable.
fn pmap_get_physpage(inner: &mut PmapInner, va: u64, level: usize) {
    let kpm = pmap_kernel();
    let pg = page_pool()
        .alloc(false)
        .expect("pmap_get_physpage: out of memory");
    pg.set_wire(1);
    inner.obj[level - 1].insert(ptp_va2o(va, level), pg);

    let slot = pmap_pte_slot(kpm.pdirpa(), va, level + 1);
    slot.store(pg.pa() | PG_RW | PG_V | PG_NX, Ordering::SeqCst);
}

/// Grow the kernel's page tables to cover `maxkvaddr`. New top-level
/// slots are copied into every registered user pmap: user roots share
/// the kernel half by value, and this copy is how they pick up new
/// kernel PTEs. Returns the new maximum.
pub fn pmap_growkernel(maxkvaddr: u64) -> u64 {
    let kpm = pmap_kernel();
    let mut grow = PMAP_GROW.lock();

    if maxkvaddr <= grow.maxkva {
        return grow.maxkva;
    }

    let maxkvaddr = x86_round_pdr(maxkvaddr);
    let mut target = [0usize; 4];
    for lvl in 1..PTP_LEVELS {
        let nptp =
            (pl_i(maxkvaddr - 1, lvl + 1) - pl_i(VM_MIN_KERNEL_ADDRESS, lvl + 1) + 1) as usize;
        if nptp > NKPTPMAX[lvl] {
            panic!("pmap_growkernel: out of KVA space");
        }
        target[lvl] = nptp;
    }

    let s = cpu::splhigh(); // to be safe
    let old = grow.nkptp[PTP_LEVELS - 1];

    {
        let mut inner = kpm.inner.lock();
        for lvl in (1..PTP_LEVELS).rev() {
            for j in grow.nkptp[lvl]..target[lvl] {
                let va = VM_MIN_KERNEL_ADDRESS + j as u64 * NBPD[lvl + 1];
                pmap_get_physpage(&mut inner, va, lvl);
            }
            grow.nkptp[lvl] = grow.nkptp[lvl].max(target[lvl]);
        }
    }

    // if the number of top level entries changed, update all pmaps
    if grow.nkptp[PTP_LEVELS - 1] != old {
        let kroot = pmap_table(kpm.pdirpa());
        let pmaps = PMAPS.lock();
        for r in pmaps.iter() {
            let pm = unsafe { &*r.0 };
            let proot = pmap_table(pm.pdirpa());
            for i in PDIR_SLOT_KERN + old..PDIR_SLOT_KERN + grow.nkptp[PTP_LEVELS - 1] {
                proot[i].store(kroot[i].load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
        log::debug!(
            "pmap_growkernel: top-level entries {} -> {}",
            old,
            grow.nkptp[PTP_LEVELS - 1]
        );
    }

    grow.maxkva = maxkvaddr;
    cpu::splx(s);
    grow.maxkva
}
