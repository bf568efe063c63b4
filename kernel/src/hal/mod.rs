//! Hardware Abstraction Layer (hal)
//!
//! The HAL gives the memory manager a narrow view of the machine:
//!
//! - **CPU identity**: who am I, how many CPUs are running
//! - **TLB instructions**: invlpg, full flush
//! - **IPIs**: shootdown vectors to peer CPUs
//! - **Control registers**: CR3 read/load
//! - **Cache**: wbinvd / clflush
//!
//! Everything is reached through an installable [`cpu::CpuOps`], so the
//! pmap layer runs unmodified under the host test harness with a mock
//! CPU plane, and on bare metal with the real one.

pub mod cpu;

pub use cpu::{CpuOps, IpiRefused, TlbIpi};
