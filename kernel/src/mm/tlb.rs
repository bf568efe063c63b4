//! TLB Shootdown Coordinator
//!
//! When one CPU changes a page-table entry, peer CPUs holding the pmap
//! in their root-pointer register may still have the old translation
//! cached. Shootdown forces them to drop it before the caller may
//! proceed.
//!
//! # Protocol
//!
//! We lock by installing the number of CPUs that will receive our
//! shootdown into a single global word with compare-and-swap. After
//! sending the IPIs we do not need to worry about lock ordering or
//! spinning with interrupts off, because the CPU that grabs the "lock"
//! is not the one that releases it: whichever CPU acknowledges last
//! brings the word back to zero, and nothing can block the IPI that
//! does so.
//!
//! The functions are organized so that we first count the CPUs that
//! need the IPI, then grab the counter, then publish the address(es),
//! then send the IPIs, and finally do our own invalidation last, so
//! it runs in parallel with the peers and the total wall time is about
//! one peer latency.
//!
//! IPI delivery failures can only happen while secondary CPUs have not
//! been started; at runtime a refused IPI would strand the counter, so
//! it is a fatal programming error.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::hal::cpu::{self, TlbIpi};
use crate::mm::pmap::{pmap_is_active, Pmap};
use crate::mm::pte::PAGE_SIZE;

/// Number of outstanding acknowledgements for the shootdown in flight.
/// Zero means the coordinator is free for the next initiator.
static TLB_SHOOT_WAIT: AtomicUsize = AtomicUsize::new(0);

/// Published address for single-page shootdowns, start for ranges
static TLB_SHOOT_ADDR1: AtomicU64 = AtomicU64::new(0);
/// Published end address for range shootdowns
static TLB_SHOOT_ADDR2: AtomicU64 = AtomicU64::new(0);

/// Statistics
static SHOOTDOWN_COUNT: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_PAGES: AtomicU64 = AtomicU64::new(0);

/// Spin bound for the debug build; a stuck IPI shows up as a panic
/// instead of a silent hang.
#[cfg(debug_assertions)]
const SPIN_OUT: u64 = 1 << 28;

/// CPUs other than the caller for which `pm` is active and running
fn pmap_tlb_targets(pm: &Pmap) -> (u64, usize) {
    let myself = cpu::cpu_number();
    let running = cpu::running_mask();
    let mut mask = 0u64;
    let mut wait = 0usize;

    for ci in 0..cpu::ncpus() {
        if ci == myself || running & (1 << ci) == 0 || !pmap_is_active(pm, ci) {
            continue;
        }
        mask |= 1 << ci;
        wait += 1;
    }
    (mask, wait)
}

/// Install `wait` into the shoot-state word, spinning out other
/// initiators first.
fn pmap_tlb_acquire(wait: usize) {
    while TLB_SHOOT_WAIT
        .compare_exchange(0, wait, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        #[cfg(debug_assertions)]
        let mut nticks: u64 = SPIN_OUT;
        while TLB_SHOOT_WAIT.load(Ordering::Relaxed) != 0 {
            core::hint::spin_loop();
            #[cfg(debug_assertions)]
            {
                nticks -= 1;
                if nticks == 0 {
                    panic!("pmap_tlb_acquire: spun out");
                }
            }
        }
    }
}

fn pmap_tlb_deliver(mask: u64, kind: TlbIpi) {
    for ci in 0..cpu::ncpus() {
        if mask & (1 << ci) == 0 {
            continue;
        }
        if cpu::send_ipi(ci, kind).is_err() {
            panic!("pmap_tlb_deliver: ipi failed");
        }
        cpu::count_ipi();
    }
}

/// Invalidate one page of `pm` everywhere it is active
pub fn pmap_tlb_shootpage(pm: &Pmap, va: u64, shootself: bool) {
    let (mask, wait) = pmap_tlb_targets(pm);

    if wait > 0 {
        let s = cpu::splvm();
        pmap_tlb_acquire(wait);
        TLB_SHOOT_ADDR1.store(va, Ordering::SeqCst);
        pmap_tlb_deliver(mask, TlbIpi::Page);
        cpu::splx(s);
    }

    if shootself {
        cpu::invlpg(va);
    }

    SHOOTDOWN_COUNT.fetch_add(1, Ordering::Relaxed);
    SHOOTDOWN_PAGES.fetch_add(1, Ordering::Relaxed);
}

/// Invalidate `[sva, eva)` of `pm` everywhere it is active
pub fn pmap_tlb_shootrange(pm: &Pmap, sva: u64, eva: u64, shootself: bool) {
    let (mask, wait) = pmap_tlb_targets(pm);

    if wait > 0 {
        let s = cpu::splvm();
        pmap_tlb_acquire(wait);
        TLB_SHOOT_ADDR1.store(sva, Ordering::SeqCst);
        TLB_SHOOT_ADDR2.store(eva, Ordering::SeqCst);
        pmap_tlb_deliver(mask, TlbIpi::Range);
        cpu::splx(s);
    }

    if shootself {
        let mut va = sva;
        while va < eva {
            cpu::invlpg(va);
            va += PAGE_SIZE as u64;
        }
    }

    SHOOTDOWN_COUNT.fetch_add(1, Ordering::Relaxed);
    SHOOTDOWN_PAGES.fetch_add((eva.saturating_sub(sva)) / PAGE_SIZE as u64, Ordering::Relaxed);
}

/// Flush the whole TLB everywhere `pm` is active
pub fn pmap_tlb_shoottlb(pm: &Pmap, shootself: bool) {
    let (mask, wait) = pmap_tlb_targets(pm);

    if wait > 0 {
        let s = cpu::splvm();
        pmap_tlb_acquire(wait);
        pmap_tlb_deliver(mask, TlbIpi::Full);
        cpu::splx(s);
    }

    if shootself {
        cpu::tlbflush();
    }

    SHOOTDOWN_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Wait for every receiver of the shootdown in flight to acknowledge.
///
/// After this returns, no CPU in the system holds a translation
/// produced before the PTE write that preceded the shootdown; only now
/// may deferred-freed PTPs be recycled.
pub fn pmap_tlb_shootwait() {
    #[cfg(debug_assertions)]
    let mut nticks: u64 = SPIN_OUT;
    while TLB_SHOOT_WAIT.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
        #[cfg(debug_assertions)]
        {
            nticks -= 1;
            if nticks == 0 {
                panic!("pmap_tlb_shootwait: spun out");
            }
        }
    }
}

// ============================================================================
// IPI receivers
// ============================================================================
//
// Wired to the INVLPG/INVLRANGE/INVLTLB vectors by the interrupt setup
// code. Each reads the published address(es), does the local
// invalidation, and acknowledges by decrementing the shoot-state word.

/// Single-page shootdown receiver
pub fn pmap_tlb_shootpage_intr() {
    let va = TLB_SHOOT_ADDR1.load(Ordering::SeqCst);
    cpu::invlpg(va);
    TLB_SHOOT_WAIT.fetch_sub(1, Ordering::Release);
}

/// Range shootdown receiver
pub fn pmap_tlb_shootrange_intr() {
    let sva = TLB_SHOOT_ADDR1.load(Ordering::SeqCst);
    let eva = TLB_SHOOT_ADDR2.load(Ordering::SeqCst);
    let mut va = sva;
    while va < eva {
        cpu::invlpg(va);
        va += PAGE_SIZE as u64;
    }
    TLB_SHOOT_WAIT.fetch_sub(1, Ordering::Release);
}

/// Full-flush shootdown receiver
pub fn pmap_tlb_shoottlb_intr() {
    cpu::tlbflush();
    TLB_SHOOT_WAIT.fetch_sub(1, Ordering::Release);
}

/// (shootdowns issued, pages shot) since boot
pub fn pmap_tlb_stats() -> (u64, u64) {
    (
        SHOOTDOWN_COUNT.load(Ordering::Relaxed),
        SHOOTDOWN_PAGES.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmap::{pmap_create, pmap_destroy, pmap_kernel};
    use crate::mm::test_support::{self, Event};

    #[test]
    fn test_kernel_shootpage_reaches_all_cpus() {
        let _g = test_support::setup();

        pmap_tlb_shootpage(pmap_kernel(), 0xdead_0000, true);
        pmap_tlb_shootwait();

        let evs = test_support::events();
        for cpu in 1..test_support::TEST_NCPUS {
            assert!(
                evs.iter()
                    .any(|e| matches!(e, Event::Ipi { cpu: c, kind: TlbIpi::Page } if *c == cpu)),
                "cpu {cpu} missed the IPI"
            );
        }
        // every CPU, the initiator included, dropped the translation
        let invals = evs
            .iter()
            .filter(|e| matches!(e, Event::Invlpg { va: 0xdead_0000, .. }))
            .count();
        assert_eq!(invals, test_support::TEST_NCPUS);
    }

    #[test]
    fn test_inactive_pmap_shoots_nobody() {
        let _g = test_support::setup();
        let p = pmap_create();

        pmap_tlb_shootpage(p, 0x1000, false);
        pmap_tlb_shootwait();
        assert!(test_support::events().is_empty());

        // the caller's own invalidation is the only work
        pmap_tlb_shootpage(p, 0x1000, true);
        let evs = test_support::events();
        assert_eq!(evs.len(), 1);
        assert!(matches!(evs[0], Event::Invlpg { cpu: 0, va: 0x1000 }));

        pmap_destroy(p);
    }

    #[test]
    fn test_shootrange_invalidates_each_page() {
        let _g = test_support::setup();

        let sva = 0xbeef_0000;
        let eva = sva + 3 * PAGE_SIZE as u64;
        pmap_tlb_shootrange(pmap_kernel(), sva, eva, true);
        pmap_tlb_shootwait();

        let invals = test_support::events()
            .iter()
            .filter(|e| matches!(e, Event::Invlpg { .. }))
            .count();
        assert_eq!(invals, 3 * test_support::TEST_NCPUS);
    }

    #[test]
    fn test_full_flush_and_stats() {
        let _g = test_support::setup();
        let (count_before, _) = pmap_tlb_stats();

        pmap_tlb_shoottlb(pmap_kernel(), true);
        pmap_tlb_shootwait();

        let flushes = test_support::events()
            .iter()
            .filter(|e| matches!(e, Event::Flush { .. }))
            .count();
        assert_eq!(flushes, test_support::TEST_NCPUS);

        let (count_after, _) = pmap_tlb_stats();
        assert!(count_after > count_before);
    }
}
