//! CPU Plane for the Memory Manager
//!
//! The pmap layer never touches hardware directly; it calls the free
//! functions in this module, which forward to the [`CpuOps`]
//! implementation registered at bootstrap. Before registration (very
//! early boot, or pure unit tests) the defaults describe a single
//! uniprocessor with nothing to invalidate, which is exactly the state
//! the machine is in at that point.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Once;

// ============================================================================
// Shootdown IPI vectors
// ============================================================================

/// IPI vector for single-page TLB invalidation
pub const IPI_VECTOR_INVLPG: u8 = 0xEC;
/// IPI vector for range TLB invalidation
pub const IPI_VECTOR_INVLRANGE: u8 = 0xED;
/// IPI vector for full TLB flush
pub const IPI_VECTOR_INVLTLB: u8 = 0xEE;

/// The three kinds of TLB shootdown IPI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbIpi {
    /// Invalidate a single page (published address)
    Page,
    /// Invalidate a range of pages (published start/end)
    Range,
    /// Flush the entire TLB
    Full,
}

impl TlbIpi {
    /// The interrupt vector this kind is delivered on
    pub fn vector(self) -> u8 {
        match self {
            TlbIpi::Page => IPI_VECTOR_INVLPG,
            TlbIpi::Range => IPI_VECTOR_INVLRANGE,
            TlbIpi::Full => IPI_VECTOR_INVLTLB,
        }
    }
}

/// IPI delivery was refused by the interrupt controller.
///
/// Tolerable only while secondary CPUs have not been started; at runtime
/// the shootdown coordinator treats it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiRefused;

// ============================================================================
// CpuOps - the installable CPU plane
// ============================================================================

/// Operations the memory manager needs from the CPU/platform layer.
///
/// Registered once via [`set_cpu_ops`]; the bare-metal implementation
/// lives behind `target_arch = "x86_64"`, the test implementation in the
/// mm test support module.
pub trait CpuOps: Sync {
    /// Index of the calling CPU
    fn cpu_number(&self) -> usize;

    /// Number of CPUs the platform knows about
    fn ncpus(&self) -> usize {
        1
    }

    /// Bitmask of CPUs that have completed startup and take interrupts
    fn running_mask(&self) -> u64 {
        1
    }

    /// Deliver a shootdown IPI to `cpu`
    fn send_ipi(&self, cpu: usize, kind: TlbIpi) -> Result<(), IpiRefused>;

    /// Invalidate the local TLB entry (and paging-structure caches) for `va`
    fn invlpg(&self, va: u64);

    /// Flush the entire local TLB
    fn tlbflush(&self);

    /// Write back and invalidate the data caches
    fn wbinvd(&self) {}

    /// Cache-line flush granularity in bytes; 0 if clflush is unavailable
    fn clflush_size(&self) -> usize {
        0
    }

    /// Flush the cache line containing `va`
    fn clflush(&self, _va: u64) {}

    /// Physical address currently loaded in the root-pointer register
    fn read_cr3(&self) -> u64;

    /// Load `pa` into the root-pointer register
    fn load_cr3(&self, pa: u64);

    /// Disable interrupts, returning whether they were enabled
    fn intr_save(&self) -> bool {
        false
    }

    /// Restore the interrupt state returned by `intr_save`
    fn intr_restore(&self, _enabled: bool) {}

    /// Raise to the VM interrupt level, returning a restore token
    fn splvm(&self) -> usize {
        0
    }

    /// Raise to the highest interrupt level, returning a restore token
    fn splhigh(&self) -> usize {
        0
    }

    /// Restore an interrupt level token
    fn splx(&self, _s: usize) {}
}

static CPU_OPS: Once<&'static dyn CpuOps> = Once::new();

/// Register the CPU plane. Called once from `pmap_bootstrap`.
pub fn set_cpu_ops(ops: &'static dyn CpuOps) {
    CPU_OPS.call_once(|| ops);
}

#[inline]
fn ops() -> Option<&'static dyn CpuOps> {
    CPU_OPS.get().copied()
}

// ============================================================================
// Free-function forwarders used by the rest of the kernel
// ============================================================================

#[inline]
pub fn cpu_number() -> usize {
    ops().map_or(0, |c| c.cpu_number())
}

#[inline]
pub fn ncpus() -> usize {
    ops().map_or(1, |c| c.ncpus())
}

#[inline]
pub fn running_mask() -> u64 {
    ops().map_or(1, |c| c.running_mask())
}

#[inline]
pub fn send_ipi(cpu: usize, kind: TlbIpi) -> Result<(), IpiRefused> {
    ops().map_or(Err(IpiRefused), |c| c.send_ipi(cpu, kind))
}

#[inline]
pub fn invlpg(va: u64) {
    if let Some(c) = ops() {
        c.invlpg(va);
    }
}

#[inline]
pub fn tlbflush() {
    if let Some(c) = ops() {
        c.tlbflush();
    }
}

#[inline]
pub fn wbinvd() {
    if let Some(c) = ops() {
        c.wbinvd();
    }
}

#[inline]
pub fn clflush_size() -> usize {
    ops().map_or(0, |c| c.clflush_size())
}

#[inline]
pub fn clflush(va: u64) {
    if let Some(c) = ops() {
        c.clflush(va);
    }
}

#[inline]
pub fn read_cr3() -> u64 {
    ops().map_or(0, |c| c.read_cr3())
}

#[inline]
pub fn load_cr3(pa: u64) {
    if let Some(c) = ops() {
        c.load_cr3(pa);
    }
}

#[inline]
pub fn intr_save() -> bool {
    ops().is_some_and(|c| c.intr_save())
}

#[inline]
pub fn intr_restore(enabled: bool) {
    if let Some(c) = ops() {
        c.intr_restore(enabled);
    }
}

#[inline]
pub fn splvm() -> usize {
    ops().map_or(0, |c| c.splvm())
}

#[inline]
pub fn splhigh() -> usize {
    ops().map_or(0, |c| c.splhigh())
}

#[inline]
pub fn splx(s: usize) {
    if let Some(c) = ops() {
        c.splx(s);
    }
}

// ============================================================================
// Boot CPU - the pre-SMP bare-metal implementation
// ============================================================================

/// CPU plane for the boot processor, before secondary CPUs start.
///
/// IPI delivery is refused (the LAPICs are not programmed yet), which is
/// harmless: with a single running CPU the shootdown coordinator never
/// computes a non-empty target set.
#[cfg(target_arch = "x86_64")]
pub struct BootCpu;

#[cfg(target_arch = "x86_64")]
impl CpuOps for BootCpu {
    fn cpu_number(&self) -> usize {
        0
    }

    fn send_ipi(&self, _cpu: usize, _kind: TlbIpi) -> Result<(), IpiRefused> {
        Err(IpiRefused)
    }

    fn invlpg(&self, va: u64) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(va));
    }

    fn tlbflush(&self) {
        x86_64::instructions::tlb::flush_all();
    }

    fn wbinvd(&self) {
        unsafe {
            core::arch::asm!("wbinvd", options(nostack, preserves_flags));
        }
    }

    fn clflush_size(&self) -> usize {
        64
    }

    fn clflush(&self, va: u64) {
        unsafe {
            core::arch::asm!("clflush [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    fn read_cr3(&self) -> u64 {
        use x86_64::registers::control::Cr3;
        Cr3::read().0.start_address().as_u64()
    }

    fn load_cr3(&self, pa: u64) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(pa)),
                Cr3Flags::empty(),
            );
        }
    }

    fn intr_save(&self) -> bool {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        enabled
    }

    fn intr_restore(&self, enabled: bool) {
        if enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// Shootdown IPIs sent since boot
pub static IPI_SENT: AtomicU64 = AtomicU64::new(0);

/// Record one IPI send (called by the shootdown coordinator).
#[inline]
pub(crate) fn count_ipi() {
    IPI_SENT.fetch_add(1, Ordering::Relaxed);
}
