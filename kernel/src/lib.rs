//! Ferrite OS Kernel: machine-dependent virtual memory (pmap) layer
//!
//! A Rust kernel targeting x86_64. This crate is the lower half of the
//! two-layer VM system: the physical map. The upper layer reasons about
//! ranges of virtual addresses bound to objects; this layer owns the
//! hardware page tables and the reverse maps that answer "which virtual
//! addresses alias this physical page?".
//!
//! # Subsystems
//!
//! - **mm** - Memory Manager: pmap objects, page-table pages, reverse
//!   map, mapping operations, TLB shootdown, extended (nested) tables
//! - **ke** - Kernel Executive: synchronization primitives
//! - **hal** - Hardware Abstraction Layer: CPU identity, IPIs, TLB and
//!   cache instructions, CR3
//!
//! # Collaborators
//!
//! Physical frame allocation, kernel-virtual-range allocation, the fault
//! handler, and process lifecycle live outside this crate. The frame
//! allocator registers a [`mm::page::PagePool`] and the platform code a
//! [`hal::cpu::CpuOps`] at `pmap_bootstrap` time; everything here is
//! driven through those two boundaries, which is also what makes the
//! layer testable off target.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
// Kernel-specific lint configurations:
// - missing_safety_doc: In a kernel, virtually everything is unsafe by nature
// - declare_interior_mutable_const: Common pattern for static initialization in no_std
// - too_many_arguments: Some kernel APIs require many parameters
// - result_unit_err: Some kernel APIs don't need error details
// - new_without_default: Kernel structs often have specific initialization requirements
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_unit_err)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_if)]

extern crate alloc;

pub mod hal;
pub mod ke;
pub mod mm;
