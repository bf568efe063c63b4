//! Test support: an arena-backed frame pool and a mock CPU plane.
//!
//! Frames are 4KB-aligned host allocations, so a frame's "physical"
//! address doubles as its host address and the direct window runs at
//! offset zero with zero length (which also keeps the extract fast path
//! out of the way). The mock CPU plane models four CPUs; shootdown IPIs
//! are delivered inline by impersonating the target CPU and running the
//! receiver, which makes orderings (invalidate before frame free)
//! observable through the shared event log.
//!
//! Everything here is process-global, as the real collaborators would
//! be, so tests serialize on the guard returned by `setup`.

use std::alloc::{alloc_zeroed, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use crate::hal::cpu::{CpuOps, IpiRefused, TlbIpi};
use crate::mm::page::{pmap_direct_map, PagePool, VmPage};
use crate::mm::pmap::{
    pmap_bootstrap, pmap_create, pmap_destroy, pmap_growkernel, pmap_init, pmap_kernel,
    BootstrapArgs, Pmap,
};
use crate::mm::pte::{NBPD_L2, PAGE_SIZE, PDIR_SLOT_KERN, VM_MIN_KERNEL_ADDRESS};
use crate::mm::tlb;

pub(crate) const TEST_NCPUS: usize = 4;

// ============================================================================
// Event log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Invlpg { cpu: usize, va: u64 },
    Flush { cpu: usize },
    Wbinvd { cpu: usize },
    Ipi { cpu: usize, kind: TlbIpi },
    FrameFree { pa: u64 },
}

static EVENTS: Mutex<Vec<Event>> = Mutex::new(Vec::new());

fn push_event(ev: Event) {
    EVENTS.lock().unwrap_or_else(|e| e.into_inner()).push(ev);
}

pub(crate) fn clear_events() {
    EVENTS.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

pub(crate) fn events() -> Vec<Event> {
    EVENTS.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

// ============================================================================
// Arena frame pool
// ============================================================================

pub(crate) struct TestPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    pages: BTreeMap<u64, &'static VmPage>,
    free: Vec<&'static VmPage>,
}

/// Force the next allocations to fail (models frame exhaustion)
static ALLOC_FAIL: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_alloc_fail(fail: bool) {
    ALLOC_FAIL.store(fail, Ordering::Relaxed);
}

impl PagePool for TestPool {
    fn alloc(&self, _nowait: bool) -> Option<&'static VmPage> {
        if ALLOC_FAIL.load(Ordering::Relaxed) {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(pg) = inner.free.pop() {
            unsafe {
                core::ptr::write_bytes(pmap_direct_map(pg.pa()), 0, PAGE_SIZE);
            }
            pg.pg_flags.store(0, Ordering::Relaxed);
            pg.set_wire(0);
            return Some(pg);
        }

        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let pa = unsafe { alloc_zeroed(layout) } as u64;
        assert!(pa != 0, "test arena exhausted");
        let pg: &'static VmPage = Box::leak(Box::new(VmPage::new(pa)));
        inner.pages.insert(pa, pg);
        Some(pg)
    }

    fn free(&self, pg: &'static VmPage) {
        push_event(Event::FrameFree { pa: pg.pa() });
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pg.pg_flags.store(0, Ordering::Relaxed);
        pg.set_wire(0);
        inner.free.push(pg);
    }

    fn phys_to_page(&self, pa: u64) -> Option<&'static VmPage> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pages.get(&(pa & !(PAGE_SIZE as u64 - 1))).copied()
    }
}

pub(crate) fn pool() -> &'static TestPool {
    static POOL: OnceLock<TestPool> = OnceLock::new();
    POOL.get_or_init(|| TestPool {
        inner: Mutex::new(PoolInner {
            pages: BTreeMap::new(),
            free: Vec::new(),
        }),
    })
}

// ============================================================================
// Mock CPU plane
// ============================================================================

pub(crate) struct MockCpu {
    cur: AtomicUsize,
    cr3: [AtomicU64; TEST_NCPUS],
}

impl CpuOps for MockCpu {
    fn cpu_number(&self) -> usize {
        self.cur.load(Ordering::Relaxed)
    }

    fn ncpus(&self) -> usize {
        TEST_NCPUS
    }

    fn running_mask(&self) -> u64 {
        (1 << TEST_NCPUS) - 1
    }

    fn send_ipi(&self, cpu: usize, kind: TlbIpi) -> Result<(), IpiRefused> {
        push_event(Event::Ipi { cpu, kind });
        // Deliver inline: impersonate the target CPU and run the
        // receiver, like a zero-latency peer would.
        let prev = self.cur.swap(cpu, Ordering::Relaxed);
        match kind {
            TlbIpi::Page => tlb::pmap_tlb_shootpage_intr(),
            TlbIpi::Range => tlb::pmap_tlb_shootrange_intr(),
            TlbIpi::Full => tlb::pmap_tlb_shoottlb_intr(),
        }
        self.cur.store(prev, Ordering::Relaxed);
        Ok(())
    }

    fn invlpg(&self, va: u64) {
        push_event(Event::Invlpg {
            cpu: self.cpu_number(),
            va,
        });
    }

    fn tlbflush(&self) {
        push_event(Event::Flush {
            cpu: self.cpu_number(),
        });
    }

    fn wbinvd(&self) {
        push_event(Event::Wbinvd {
            cpu: self.cpu_number(),
        });
    }

    fn read_cr3(&self) -> u64 {
        self.cr3[self.cpu_number()].load(Ordering::Relaxed)
    }

    fn load_cr3(&self, pa: u64) {
        self.cr3[self.cpu_number()].store(pa, Ordering::Relaxed);
    }
}

pub(crate) fn mock_cpu() -> &'static MockCpu {
    static CPU: OnceLock<MockCpu> = OnceLock::new();
    CPU.get_or_init(|| MockCpu {
        cur: AtomicUsize::new(0),
        cr3: [
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
        ],
    })
}

// ============================================================================
// One-shot bring-up and serialization
// ============================================================================

static TEST_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

/// Serialize a test against the shared pmap globals and make sure the
/// layer is bootstrapped. The event log starts clean.
pub(crate) fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    INIT.call_once(|| {
        pmap_bootstrap(BootstrapArgs {
            pool: pool(),
            cpu: mock_cpu(),
            dmap_base: 0,
            dmap_len: 0,
            dmap_slot_entry: 0,
            cpu_meltdown: true,
            pg_g_kern: false,
            pat_support: true,
        });
        pmap_init();
    });

    set_alloc_fail(false);
    crate::mm::pv::pv_pool_set_limit(usize::MAX);
    clear_events();
    guard
}

// ============================================================================
// First-growth probe
// ============================================================================
//
// The first pmap_growkernel call is the only one that can add a new
// top-level entry within the test arena's means, so the observation of
// the slot-copy into live user pmaps is made exactly once and recorded
// for whichever test asserts it.

pub(crate) struct GrowProbe {
    /// Slot 256 of a user root before the first growth
    pub before: u64,
    /// Slot 256 of the kernel root after growth
    pub kernel_slot: u64,
    /// Slot 256 of the two live user roots after growth
    pub user_slots: (u64, u64),
}

static GROW_PROBE: Mutex<Option<GrowProbe>> = Mutex::new(None);
static FIRST_GROW: Once = Once::new();

fn root_slot(pm: &Pmap, slot: usize) -> u64 {
    crate::mm::page::pmap_table(pm.pdirpa())[slot].load(Ordering::Relaxed)
}

/// Make sure the kernel has page tables for its first few megabytes of
/// VA, recording the top-level copy into user pmaps on the way.
pub(crate) fn ensure_kernel_va() {
    FIRST_GROW.call_once(|| {
        let p1 = pmap_create();
        let p2 = pmap_create();
        let before = root_slot(p1, PDIR_SLOT_KERN);

        pmap_growkernel(VM_MIN_KERNEL_ADDRESS + 8 * NBPD_L2);

        let probe = GrowProbe {
            before,
            kernel_slot: root_slot(pmap_kernel(), PDIR_SLOT_KERN),
            user_slots: (
                root_slot(p1, PDIR_SLOT_KERN),
                root_slot(p2, PDIR_SLOT_KERN),
            ),
        };
        *GROW_PROBE.lock().unwrap_or_else(|e| e.into_inner()) = Some(probe);

        pmap_destroy(p1);
        pmap_destroy(p2);
    });
}

/// The recorded first-growth observation
pub(crate) fn grow_probe() -> GrowProbe {
    ensure_kernel_va();
    let g = GROW_PROBE.lock().unwrap_or_else(|e| e.into_inner());
    let p = g.as_ref().unwrap();
    GrowProbe {
        before: p.before,
        kernel_slot: p.kernel_slot,
        user_slots: p.user_slots,
    }
}
