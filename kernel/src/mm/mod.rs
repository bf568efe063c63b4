//! Memory Manager (mm): the physical map layer
//!
//! The pmap owns the hardware page tables and the reverse maps:
//!
//! - **pte**: entry encoding, protection codes, address arithmetic
//! - **page**: physical frame headers and the frame-pool boundary
//! - **pv**: per-frame reverse-map chains
//! - **ptp**: page-table-page allocation, wiring, deferred reclamation
//! - **pmap**: address-space objects and the mapping operations
//! - **tlb**: cross-CPU translation-cache shootdown
//! - **ept**: the extended (nested) regime for guest execution
//!
//! # Address Space Layout (x86_64)
//!
//! - User space:   0x0000_0000_0000_0000 - 0x0000_7F7F_FFFF_FFFF
//! - Reserved slot: the top-level entry above the user half
//! - Kernel space: 0xFFFF_8000_0000_0000 upward; the direct-map window
//!   sits in its own top-level slot above the growable region

pub mod ept;
pub mod page;
pub mod pmap;
pub mod pte;
pub mod ptp;
pub mod pv;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export PTE types
pub use pte::{
    is_canonical, is_kernel_address, is_user_address, pmap_pte2flags, protection_code, PtEntry,
    VmProt, ENTRIES_PER_TABLE, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PG_A, PG_FRAME, PG_G, PG_M,
    PG_N, PG_NX, PG_PMAP_MOD, PG_PMAP_REF, PG_PMAP_WC, PG_PS, PG_PVLIST, PG_RW, PG_US, PG_V,
    PG_W, PTP_LEVELS, VM_MAXUSER_ADDRESS, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS,
};

// Re-export frame types
pub use page::{
    phys_to_page, pmap_copy_page, pmap_direct_map, pmap_sync_flags_pte, pmap_zero_page,
    set_page_pool, PagePool, VmPage,
};

// Re-export reverse-map types
pub use pv::{pv_pool_set_limit, PvEntry};

// Re-export pmap types and operations
pub use pmap::{
    cpu_meltdown, pmap_activate, pmap_bootstrap, pmap_clear_attrs, pmap_collect, pmap_convert,
    pmap_create, pmap_deactivate, pmap_destroy, pmap_enter, pmap_enter_special, pmap_extract,
    pmap_find_pte_direct, pmap_flush_cache, pmap_growkernel, pmap_init, pmap_kenter_pa,
    pmap_kernel, pmap_kremove, pmap_page_remove, pmap_reference, pmap_remove, pmap_test_attrs,
    pmap_unwire, pmap_write_protect, BootstrapArgs, EnterFlags, Pmap, PmapError, PmapType,
};

// Re-export TLB shootdown operations
pub use tlb::{
    pmap_tlb_shootpage, pmap_tlb_shootpage_intr, pmap_tlb_shootrange, pmap_tlb_shootrange_intr,
    pmap_tlb_shoottlb, pmap_tlb_shoottlb_intr, pmap_tlb_shootwait, pmap_tlb_stats,
};

// Re-export EPT constants
pub use ept::{EPT_GPA_MAX, EPT_R, EPT_W, EPT_WB, EPT_X};
