//! User address-space operations
//!
//! Lifecycle of a process image on top of the walker: creation, growth and
//! shrinkage with rollback, fork duplication, teardown, and the
//! kernel-to-user copy primitives that syscall and exec paths use.
//!
//! User pointers are never dereferenced. Every access goes page by page
//! through `translate`, which also services swapped-out pages on the spot,
//! so callers see swap-backed memory as ordinary memory.

use alloc::string::String;
use alloc::vec::Vec;

use core::ptr;

use crate::error::KernelError;
use crate::frame_alloc::{alloc_frame, free_frame};
use crate::mm::fault;
use crate::mm::lru;
use crate::mm::page::FRAME_TABLE;
use crate::mm::page_table::{PTE_LOCK, Sv39PageTable};
use crate::mm::pte::{PageTableEntry, PteFlags};
use crate::mm::swap;
use crate::riscv::{MAXVA, PAGE_SIZE, page_round_down, page_round_up, phys_to_virt, sfence_vma};

/// Record kernel-mediated access in the PTE, standing in for the hardware
/// A/D update on implementations that trap instead.
#[inline]
fn touch(pte: *mut PageTableEntry, write: bool) {
    let entry = unsafe { *pte };
    let mut bits = PteFlags::A;
    if write {
        bits |= PteFlags::D;
    }
    unsafe {
        *pte = entry.set(bits);
    }
}

impl Sv39PageTable {
    /// Create an empty user address space.
    ///
    /// Returns None when no frame is available for the root table.
    pub fn new_user() -> Option<Sv39PageTable> {
        let root = alloc_frame()?;
        unsafe {
            ptr::write_bytes(phys_to_virt(root), 0, PAGE_SIZE as usize);
        }
        FRAME_TABLE.mark_page_table(root);
        Some(Sv39PageTable::from_root(root))
    }

    /// Install the first process's code at virtual address 0.
    ///
    /// `src` must be smaller than a page. Only used at boot, so allocation
    /// failure here is a kernel bug.
    pub fn load_init(&self, src: &[u8]) {
        if src.len() >= PAGE_SIZE as usize {
            panic!("load_init: more than a page");
        }
        let mem = alloc_frame().expect("load_init: out of memory");
        unsafe {
            ptr::write_bytes(phys_to_virt(mem), 0, PAGE_SIZE as usize);
        }
        self.map_pages(
            0,
            PAGE_SIZE,
            mem,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
        )
        .expect("load_init: map failed");
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), phys_to_virt(mem), src.len());
        }
    }

    /// Grow the process image from `oldsz` to `newsz` bytes.
    ///
    /// New pages are zeroed and mapped R|W|U plus `xperm`. Returns the new
    /// size, or 0 after rolling back every page this call added.
    pub fn grow(&self, oldsz: u64, newsz: u64, xperm: PteFlags) -> u64 {
        if newsz < oldsz {
            return oldsz;
        }

        let mut a = page_round_up(oldsz);
        while a < newsz {
            let Some(mem) = alloc_frame() else {
                self.shrink(a, oldsz);
                return 0;
            };
            unsafe {
                ptr::write_bytes(phys_to_virt(mem), 0, PAGE_SIZE as usize);
            }
            let perm = PteFlags::R | PteFlags::W | PteFlags::U | xperm;
            if self.map_pages(a, PAGE_SIZE, mem, perm).is_err() {
                free_frame(mem);
                self.shrink(a, oldsz);
                return 0;
            }
            a += PAGE_SIZE;
        }
        newsz
    }

    /// Shrink the process image from `oldsz` to `newsz` bytes.
    ///
    /// Frees the frames of resident pages and the slots of swapped pages
    /// above the new size. Returns the new size; growing is a no-op.
    pub fn shrink(&self, oldsz: u64, newsz: u64) -> u64 {
        if newsz >= oldsz {
            return oldsz;
        }
        if page_round_up(newsz) < page_round_up(oldsz) {
            let npages = (page_round_up(oldsz) - page_round_up(newsz)) / PAGE_SIZE;
            self.unmap_pages(page_round_up(newsz), npages, true);
        }
        newsz
    }

    /// Free a `sz`-byte process image and every page-table page behind it
    pub fn destroy(&self, sz: u64) {
        if sz > 0 {
            self.unmap_pages(0, page_round_up(sz) / PAGE_SIZE, true);
        }
        self.free_table();
    }

    /// Duplicate the first `sz` bytes of this address space into `child`.
    ///
    /// Every page is deep-copied. A swapped-out parent page is read from its
    /// slot into a fresh frame that is mapped resident in the child; the
    /// parent's PTE and slot are left untouched. On failure the child's
    /// partial image is unmapped and freed.
    pub fn fork_into(&self, child: &Sv39PageTable, sz: u64) -> Result<(), KernelError> {
        let mut va = 0;
        while va < sz {
            let Some(mem) = alloc_frame() else {
                return fork_rollback(child, va);
            };
            // The allocation above may have evicted parent pages, so the
            // parent PTE is only inspected afterwards.
            let Some(pte) = self.walk(va, false) else {
                panic!("fork_into: pte should exist at {va:#x}");
            };
            let entry = unsafe { *pte };

            if entry.is_swapped() {
                swap::swap_read_page(entry.swap_slot(), mem);
                if child.map_pages(va, PAGE_SIZE, mem, entry.perm_flags()).is_err() {
                    free_frame(mem);
                    return fork_rollback(child, va);
                }
            } else if entry.is_leaf() {
                unsafe {
                    ptr::copy_nonoverlapping(
                        phys_to_virt(entry.addr()) as *const u8,
                        phys_to_virt(mem),
                        PAGE_SIZE as usize,
                    );
                }
                let perm = entry.flags().difference(PteFlags::V);
                if child.map_pages(va, PAGE_SIZE, mem, perm).is_err() {
                    free_frame(mem);
                    return fork_rollback(child, va);
                }
            } else {
                panic!("fork_into: page not present at {va:#x}");
            }

            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Clear the User bit on the leaf mapping `va`.
    ///
    /// Used by exec for the stack guard page. The mapping must exist. The
    /// frame leaves the eviction list: pages the user cannot reach are not
    /// eviction candidates.
    pub fn revoke_user_access(&self, va: u64) {
        let Some(pte) = self.walk(va, false) else {
            panic!("revoke_user_access: no mapping at {va:#x}");
        };
        let entry = unsafe { *pte };
        {
            let _guard = PTE_LOCK.lock();
            unsafe {
                *pte = entry.cleared(PteFlags::U);
            }
            sfence_vma();
        }
        if entry.is_leaf() {
            lru::lru_remove(entry.addr());
        }
    }

    /// Physical address of the user page containing `va`.
    ///
    /// A swapped-out page is brought back in on the spot: a frame is
    /// allocated (possibly evicting another page), the slot is read and
    /// released, the PTE is rewritten resident, and the frame rejoins the
    /// eviction list. Returns None for absent, invalid, or kernel-only
    /// mappings. Panics when `va` is outside the user address range.
    pub fn translate(&self, va: u64) -> Option<u64> {
        let pte = self.walk(va, false)?;
        let entry = unsafe { *pte };

        if entry.is_swapped() {
            if !entry.flags().contains(PteFlags::U) {
                return None;
            }
            return fault::swap_in_page(self, page_round_down(va), pte).ok();
        }
        if !entry.is_valid() || !entry.flags().contains(PteFlags::U) {
            return None;
        }
        Some(entry.addr())
    }

    /// Copy `src` into this address space at `dstva`.
    ///
    /// The destination pages must be user-writable; swapped pages fault in
    /// transparently.
    pub fn copy_out(&self, dstva: u64, src: &[u8]) -> Result<(), KernelError> {
        let mut off = 0;
        let mut dst = dstva;
        while off < src.len() {
            let va0 = page_round_down(dst);
            if va0 >= MAXVA {
                return Err(KernelError::BadAddress);
            }
            let pa0 = self.translate(va0).ok_or(KernelError::BadAddress)?;
            let pte = self.walk(va0, false).ok_or(KernelError::BadAddress)?;
            if !unsafe { *pte }.flags().contains(PteFlags::W) {
                return Err(KernelError::BadAddress);
            }
            touch(pte, true);

            let n = ((PAGE_SIZE - (dst - va0)) as usize).min(src.len() - off);
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(off),
                    phys_to_virt(pa0 + (dst - va0)),
                    n,
                );
            }
            off += n;
            dst = va0 + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes from this address space at `srcva` into `dst`
    pub fn copy_in(&self, dst: &mut [u8], srcva: u64) -> Result<(), KernelError> {
        let mut off = 0;
        let mut src = srcva;
        while off < dst.len() {
            let va0 = page_round_down(src);
            let pa0 = self.translate(va0).ok_or(KernelError::BadAddress)?;
            if let Some(pte) = self.walk(va0, false) {
                touch(pte, false);
            }

            let n = ((PAGE_SIZE - (src - va0)) as usize).min(dst.len() - off);
            unsafe {
                ptr::copy_nonoverlapping(
                    phys_to_virt(pa0 + (src - va0)) as *const u8,
                    dst.as_mut_ptr().add(off),
                    n,
                );
            }
            off += n;
            src = va0 + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from this address space at `srcva`.
    ///
    /// Reads at most `max` bytes. Fails with `NameTooLong` when no NUL
    /// appears within the allowance.
    pub fn copy_in_str(&self, srcva: u64, max: usize) -> Result<String, KernelError> {
        let mut out: Vec<u8> = Vec::new();
        let mut src = srcva;
        let mut remaining = max;
        while remaining > 0 {
            let va0 = page_round_down(src);
            let pa0 = self.translate(va0).ok_or(KernelError::BadAddress)?;
            if let Some(pte) = self.walk(va0, false) {
                touch(pte, false);
            }

            let n = ((PAGE_SIZE - (src - va0)) as usize).min(remaining);
            let chunk = unsafe {
                core::slice::from_raw_parts(phys_to_virt(pa0 + (src - va0)) as *const u8, n)
            };
            for &b in chunk {
                if b == 0 {
                    return String::from_utf8(out).map_err(|_| KernelError::InvalidArgument);
                }
                out.push(b);
            }
            remaining -= n;
            src = va0 + PAGE_SIZE;
        }
        Err(KernelError::NameTooLong)
    }
}

fn fork_rollback(child: &Sv39PageTable, done: u64) -> Result<(), KernelError> {
    if done > 0 {
        child.unmap_pages(0, done / PAGE_SIZE, true);
    }
    Err(KernelError::OutOfMemory)
}
