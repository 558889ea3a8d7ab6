//! rvk kernel memory subsystem
//!
//! Demand-paged virtual memory for RV64 with Sv39 page tables: per-process
//! address spaces, a free-list frame allocator, a clock-driven page
//! replacement engine, and a swap area on a pluggable block device.
//!
//! The rest of the kernel (bootstrap, scheduler, trap vectors, the real disk
//! driver) lives outside this crate. Boot wiring:
//!
//! 1. `mm::init(base, size)` over the physical region handed over by the
//!    bootstrap code.
//! 2. `mm::swap::register_device(..)` once the swap device is probed.
//! 3. Trap glue routes user load/store page faults to
//!    `mm::fault::handle_page_fault` and kills the process on `Err`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod frame_alloc;
pub mod mm;
pub mod printk;
pub mod riscv;

pub use error::KernelError;
