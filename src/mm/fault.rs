//! Page fault service
//!
//! The trap layer lands here for user load and store page faults. A fault on
//! a swap-encoded PTE is serviced by reading the slot back into a fresh
//! frame; any other fault is an error and the caller kills the process.

use crate::error::KernelError;
use crate::frame_alloc::alloc_frame;
use crate::mm::lru;
use crate::mm::page_table::{PTE_LOCK, Sv39PageTable};
use crate::mm::pte::PageTableEntry;
use crate::mm::swap;
use crate::riscv::{MAXVA, page_round_down, sfence_vma};

/// Resolve a user page fault at `va`.
///
/// Ok means the faulting access can be retried. Err means the fault was not
/// swap-backed (or memory is exhausted) and the process should be killed.
pub fn handle_page_fault(pt: &Sv39PageTable, va: u64) -> Result<(), KernelError> {
    if va >= MAXVA {
        return Err(KernelError::BadAddress);
    }
    let pte = pt.walk(va, false).ok_or(KernelError::BadAddress)?;
    let entry = unsafe { *pte };
    if !entry.is_swapped() {
        return Err(KernelError::BadAddress);
    }

    swap_in_page(pt, page_round_down(va), pte)?;
    Ok(())
}

/// Bring the swapped-out page behind `pte` back into memory.
///
/// Allocates a frame (which may evict a different page), reads and releases
/// the slot, rewrites the PTE resident with its old permissions, and puts
/// the frame on the eviction list. Returns the new frame's physical address.
///
/// The swapped page itself is off the eviction list, so the allocation here
/// cannot evict it; the PTE snapshot stays valid across the call.
pub(crate) fn swap_in_page(
    pt: &Sv39PageTable,
    va: u64,
    pte: *mut PageTableEntry,
) -> Result<u64, KernelError> {
    let entry = unsafe { *pte };
    let slot = entry.swap_slot();

    let mem = alloc_frame().ok_or(KernelError::OutOfMemory)?;
    swap::swap_read_page(slot, mem);
    swap::free_slot(slot);
    swap::note_swap_in();

    {
        let _guard = PTE_LOCK.lock();
        unsafe {
            *pte = PageTableEntry::new_leaf(mem, entry.perm_flags());
        }
        sfence_vma();
    }

    lru::lru_add(mem, pt.root_phys(), va);
    Ok(mem)
}
