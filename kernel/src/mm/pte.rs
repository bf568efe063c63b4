//! Page Table Entry (PTE) encoding
//!
//! x86_64 uses 4-level paging:
//! - Level 4 (PML4) - 512 entries, each covers 512GB
//! - Level 3 (PDPT) - 512 entries, each covers 1GB
//! - Level 2 (PD)   - 512 entries, each covers 2MB
//! - Level 1 (PT)   - 512 entries, each covers 4KB
//!
//! # Virtual Address Layout (48-bit)
//! ```text
//! 63-48: Sign extension (all 0s or 1s)
//! 47-39: Level 4 index (9 bits)
//! 38-30: Level 3 index (9 bits)
//! 29-21: Level 2 index (9 bits)
//! 20-12: Level 1 index (9 bits)
//! 11-0:  Page offset (12 bits)
//! ```
//!
//! # Page Table Entry Format
//! ```text
//! Bit 0:     Valid (present)
//! Bit 1:     Read/Write
//! Bit 2:     User/Supervisor
//! Bit 3:     Write-Through (PWT)
//! Bit 4:     Cache Disable (PCD)
//! Bit 5:     Accessed
//! Bit 6:     Dirty
//! Bit 7:     Page Size on non-leaf levels, PAT on 4K leaves
//! Bit 8:     Global
//! Bits 9-11: Available to software
//! Bits 12-51: Physical frame address
//! Bit 63:    No Execute
//! ```
//!
//! This module is the entry encoder: it owns the bit constants, the
//! protection-code table, the cache-mode encodings, and the per-level
//! index arithmetic. It is pure; nothing here touches memory.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

/// A page-table entry at any level, in hardware format
pub type PtEntry = u64;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;

/// Number of entries per page table (all levels)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of page-table levels
pub const PTP_LEVELS: usize = 4;

// ============================================================================
// PTE bits
// ============================================================================

/// Entry is valid (present)
pub const PG_V: u64 = 1 << 0;
/// Entry is writable
pub const PG_RW: u64 = 1 << 1;
/// Entry is accessible from user mode
pub const PG_US: u64 = 1 << 2;
/// Write-through caching
pub const PG_NC_PWT: u64 = 1 << 3;
/// Cache disable
pub const PG_NC_PCD: u64 = 1 << 4;
/// Entry has been used for a translation
pub const PG_A: u64 = 1 << 5;
/// Page has been written to
pub const PG_M: u64 = 1 << 6;
/// Large page (2MB/1GB); only meaningful on non-leaf levels
pub const PG_PS: u64 = 1 << 7;
/// PAT bit on 4K leaf entries (same position as PG_PS)
pub const PG_PAT4K: u64 = 1 << 7;
/// Global (survives ordinary CR3 reloads)
pub const PG_G: u64 = 1 << 8;

// Software-defined bits (ignored by the MMU)
/// Mapping is wired (non-evictable); software only
pub const PG_W: u64 = 1 << 9;
/// Mapping is on the frame's reverse-map chain; software only
pub const PG_PVLIST: u64 = 1 << 10;

/// No execute
pub const PG_NX: u64 = 1 << 63;

/// Uncached (UC)
pub const PG_N: u64 = PG_NC_PWT | PG_NC_PCD;
/// Uncached-minus (UC-); MTRRs may still override to WC
pub const PG_UCMINUS: u64 = PG_NC_PCD;
/// Write combining through the PAT (PAT entry 5, programmed at boot)
pub const PG_WC_PAT: u64 = PG_PAT4K | PG_NC_PWT;

/// Mask for the physical frame address (bits 12-51)
pub const PG_FRAME: u64 = 0x000F_FFFF_FFFF_F000;
/// Mask for the physical frame of a 2MB large page
pub const PG_LGFRAME: u64 = 0x000F_FFFF_FFE0_0000;

// ============================================================================
// Per-level geometry
// ============================================================================

pub const L1_SHIFT: usize = 12;
pub const L2_SHIFT: usize = 21;
pub const L3_SHIFT: usize = 30;
pub const L4_SHIFT: usize = 39;

/// Bytes mapped by one entry at each level, indexed by level (1-based)
pub const NBPD: [u64; 5] = [0, 1 << L1_SHIFT, 1 << L2_SHIFT, 1 << L3_SHIFT, 1 << L4_SHIFT];

pub const NBPD_L1: u64 = NBPD[1];
pub const NBPD_L2: u64 = NBPD[2];
pub const NBPD_L3: u64 = NBPD[3];
pub const NBPD_L4: u64 = NBPD[4];

/// 2MB-block alignment mask
pub const L2_FRAME: u64 = !(NBPD_L2 - 1);

const PL_SHIFT: [usize; 5] = [0, L1_SHIFT, L2_SHIFT, L3_SHIFT, L4_SHIFT];

/// Low 48 bits of a canonical address (sign extension stripped)
const VA_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Linear index of `va` at `level`: the index its entry would have if
/// every table of that level were laid out as one array. Unique per
/// covered region, which is what makes it usable as a PTP-index key.
#[inline]
pub fn pl_i(va: u64, level: usize) -> u64 {
    (va & VA_MASK) >> PL_SHIFT[level]
}

/// Index of `va` into one 512-entry table at `level` (1 = leaf, 4 = top)
#[inline]
pub fn pl_pi(va: u64, level: usize) -> usize {
    ((va >> PL_SHIFT[level]) & 0x1FF) as usize
}

/// Top-level table index (the linear and per-table forms coincide)
#[inline]
pub fn pl4_i(va: u64) -> usize {
    pl_pi(va, 4)
}

/// Round `va` up to the next 2MB block boundary
#[inline]
pub fn x86_round_pdr(va: u64) -> u64 {
    (va + NBPD_L2 - 1) & L2_FRAME
}

/// Derived PTP offset: the key under which the page-table page covering
/// `va` at `level` is stored in its pmap's per-level index.
#[inline]
pub fn ptp_va2o(va: u64, level: usize) -> u64 {
    pl_i(va, level + 1)
}

// ============================================================================
// Address space layout
// ============================================================================

/// First address of the shared kernel half
pub const VM_MIN_KERNEL_ADDRESS: u64 = 0xFFFF_8000_0000_0000;
/// End of the growable kernel region (start of the direct-map slot)
pub const VM_MAX_KERNEL_ADDRESS: u64 = VM_MIN_KERNEL_ADDRESS + 4 * NBPD_L4;
/// End of the user half; the top-level slot above it is reserved
pub const VM_MAXUSER_ADDRESS: u64 = (PDIR_SLOT_PTE as u64) << L4_SHIFT;

/// First kernel top-level slot
pub const PDIR_SLOT_KERN: usize = 256;
/// Reserved top-level slot where a recursive self-map would live.
/// Never traversed by range operations, never mapped over.
pub const PDIR_SLOT_PTE: usize = 255;
/// Top-level slot of the physical direct-map window
pub const PDIR_SLOT_DIRECT: usize = 260;

/// Upper bound on kernel page-table pages per level (level 1..=3). The
/// growable region spans the four top-level slots below the direct map.
pub const NKPTPMAX: [usize; 4] = [0, 4 * 512 * 512, 4 * 512, 4];

/// Check if an address is canonical (valid 48-bit address)
#[inline]
pub fn is_canonical(va: u64) -> bool {
    let top_bits = va >> 47;
    top_bits == 0 || top_bits == 0x1FFFF
}

#[inline]
pub fn is_kernel_address(va: u64) -> bool {
    va >= VM_MIN_KERNEL_ADDRESS
}

#[inline]
pub fn is_user_address(va: u64) -> bool {
    va < VM_MAXUSER_ADDRESS
}

/// A valid entry has the valid bit; everything-zero is the invalid entry
#[inline]
pub fn pmap_valid_entry(pte: PtEntry) -> bool {
    (pte & PG_V) != 0
}

// ============================================================================
// Protection codes
// ============================================================================

bitflags! {
    /// Architecture-independent protection, as handed down by the upper
    /// VM layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

/// Maps each of the 8 protection combinations to PTE bits. Write implies
/// the writable bit; absence of execute adds no-execute. Read access is
/// implied by validity on this architecture.
const PROTECTION_CODES: [u64; 8] = [
    PG_NX,         // ---
    PG_NX,         // r--
    PG_RW | PG_NX, // -w-
    PG_RW | PG_NX, // rw-
    0,             // --x
    0,             // r-x
    PG_RW,         // -wx
    PG_RW,         // rwx
];

/// PTE bits for a protection combination
#[inline]
pub fn protection_code(prot: VmProt) -> u64 {
    PROTECTION_CODES[prot.bits() as usize]
}

// ============================================================================
// Runtime-selected encodings
// ============================================================================

/// PTE bits for write combining. If the processor supports the PAT we
/// use a real WC encoding; else we fall back to UC- so the MTRRs can
/// still override the cacheability.
static PMAP_PG_WC: AtomicU64 = AtomicU64::new(PG_UCMINUS);

/// PG_G for kernel mappings, or 0 on processors where global kernel
/// pages are unsafe (Meltdown).
static PG_G_KERN: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn pmap_pg_wc() -> u64 {
    PMAP_PG_WC.load(Ordering::Relaxed)
}

#[inline]
pub fn pg_g_kern() -> u64 {
    PG_G_KERN.load(Ordering::Relaxed)
}

pub(crate) fn set_pmap_pg_wc(bits: u64) {
    PMAP_PG_WC.store(bits, Ordering::Relaxed);
}

pub(crate) fn set_pg_g_kern(bits: u64) {
    PG_G_KERN.store(bits, Ordering::Relaxed);
}

// ============================================================================
// Attribute extraction
// ============================================================================

/// Frame-header flag: some mapping has referenced the frame
pub const PG_PMAP_REF: u32 = 1 << 0;
/// Frame-header flag: some mapping has modified the frame
pub const PG_PMAP_MOD: u32 = 1 << 1;
/// Frame-header flag: frame is mapped write-combining everywhere
pub const PG_PMAP_WC: u32 = 1 << 2;

/// Fold the hardware accessed/dirty bits of a PTE into the
/// software-visible frame-header flags.
#[inline]
pub fn pmap_pte2flags(pte: u64) -> u32 {
    (if pte & PG_A != 0 { PG_PMAP_REF } else { 0 })
        | (if pte & PG_M != 0 { PG_PMAP_MOD } else { 0 })
}
