//! Sv39 page table walker and mapping primitives
//!
//! Three-level tables, 512 entries each. The walker descends from the root,
//! creating intermediate tables on demand; mapping installs leaf PTEs one
//! page at a time and registers user pages with the eviction list.
//!
//! Leaf PTE stores go through the PTE lock and are followed by a local TLB
//! flush. The walker itself takes no subsystem lock: its intermediate
//! allocations may recurse into the evictor, which acquires the metadata,
//! LRU, and PTE locks.

use core::ptr;

use spin::Mutex;

use crate::error::KernelError;
use crate::frame_alloc::{alloc_frame, free_frame};
use crate::mm::lru;
use crate::mm::page::FRAME_TABLE;
use crate::mm::pte::{ENTRIES_PER_TABLE, PageTableEntry, PteFlags, RawPageTable};
use crate::mm::swap;
use crate::riscv::{MAXVA, PAGE_SIZE, phys_to_virt, px, sfence_vma};

/// Serializes hardware-visible PTE mutations
pub(crate) static PTE_LOCK: Mutex<()> = Mutex::new(());

/// Pointer to entry `idx` of the table page at `table_phys`
#[inline]
unsafe fn entry_ptr(table_phys: u64, idx: usize) -> *mut PageTableEntry {
    let table = phys_to_virt(table_phys) as *mut RawPageTable;
    let entries = unsafe { &raw mut (*table).entries };
    unsafe { (entries as *mut PageTableEntry).add(idx) }
}

/// An Sv39 page table, identified by the physical address of its root page
pub struct Sv39PageTable {
    root_phys: u64,
}

impl Sv39PageTable {
    /// Wrap an existing root table frame
    #[inline]
    pub fn from_root(root_phys: u64) -> Self {
        Self { root_phys }
    }

    /// Physical address of the root table, the value loaded into satp
    #[inline]
    pub fn root_phys(&self) -> u64 {
        self.root_phys
    }

    /// Find the leaf-level PTE for `va`, descending levels 2 and 1.
    ///
    /// With `alloc_intermediate`, missing intermediate tables are allocated
    /// (possibly evicting user pages), zeroed, and flagged as page-table
    /// frames. Returns None only when an intermediate is missing and cannot
    /// be created. Panics on an out-of-range address.
    pub(crate) fn walk(&self, va: u64, alloc_intermediate: bool) -> Option<*mut PageTableEntry> {
        if va >= MAXVA {
            panic!("walk: va out of range {va:#x}");
        }

        let mut table_phys = self.root_phys;
        for level in [2, 1] {
            let pte = unsafe { entry_ptr(table_phys, px(level, va)) };
            let entry = unsafe { *pte };
            if entry.is_valid() {
                table_phys = entry.addr();
            } else {
                if !alloc_intermediate {
                    return None;
                }
                let frame = alloc_frame()?;
                unsafe {
                    ptr::write_bytes(phys_to_virt(frame), 0, PAGE_SIZE as usize);
                }
                FRAME_TABLE.mark_page_table(frame);
                unsafe {
                    *pte = PageTableEntry::new_intermediate(frame);
                }
                table_phys = frame;
            }
        }
        Some(unsafe { entry_ptr(table_phys, px(0, va)) })
    }

    /// Copy of the PTE for `va`, if one exists and is not empty
    pub fn leaf(&self, va: u64) -> Option<PageTableEntry> {
        let pte = self.walk(va, false)?;
        let entry = unsafe { *pte };
        if entry.is_empty() { None } else { Some(entry) }
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` with permissions `perm`.
    ///
    /// `va` and `size` must be page-aligned, `size` nonzero; mapping over an
    /// existing entry is a kernel bug and panics. User pages below MAXVA
    /// join the eviction list as they are installed.
    ///
    /// Fails only when an intermediate table cannot be allocated; PTEs
    /// already installed by the failing call remain for the caller to unmap.
    pub fn map_pages(
        &self,
        va: u64,
        size: u64,
        pa: u64,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        if va % PAGE_SIZE != 0 {
            panic!("map_pages: va not aligned");
        }
        if size % PAGE_SIZE != 0 {
            panic!("map_pages: size not aligned");
        }
        if size == 0 {
            panic!("map_pages: zero size");
        }

        let mut a = va;
        let mut pa = pa;
        let last = va + size - PAGE_SIZE;
        loop {
            let pte = self.walk(a, true).ok_or(KernelError::OutOfMemory)?;
            if unsafe { *pte }.is_valid() {
                panic!("map_pages: remap at {a:#x}");
            }

            {
                let _guard = PTE_LOCK.lock();
                unsafe {
                    *pte = PageTableEntry::new_leaf(pa, perm);
                }
                sfence_vma();
            }

            if perm.contains(PteFlags::U) && a < MAXVA {
                lru::lru_add(pa, self.root_phys, a);
            }

            if a == last {
                break;
            }
            a += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        Ok(())
    }

    /// Remove `npages` mappings starting at page-aligned `va`.
    ///
    /// Every entry must be a resident leaf or a swapped-out leaf. With
    /// `free_frames`, resident frames go back to the allocator (leaving the
    /// eviction list first) and swapped entries release their slot.
    pub fn unmap_pages(&self, va: u64, npages: u64, free_frames: bool) {
        if va % PAGE_SIZE != 0 {
            panic!("unmap_pages: not aligned");
        }

        for i in 0..npages {
            let a = va + i * PAGE_SIZE;
            let Some(pte) = self.walk(a, false) else {
                panic!("unmap_pages: walk failed at {a:#x}");
            };
            let entry = unsafe { *pte };

            if entry.is_valid() {
                if !entry.is_leaf() {
                    panic!("unmap_pages: not a leaf at {a:#x}");
                }
                if free_frames {
                    let pa = entry.addr();
                    lru::lru_remove(pa);
                    free_frame(pa);
                }
            } else if entry.is_swapped() {
                if free_frames {
                    swap::free_slot(entry.swap_slot());
                }
            } else {
                panic!("unmap_pages: not mapped at {a:#x}");
            }

            let _guard = PTE_LOCK.lock();
            unsafe {
                *pte = PageTableEntry::empty();
            }
            sfence_vma();
        }
    }

    /// Free every page-table page reachable from the root.
    ///
    /// All leaf mappings must have been unmapped first; finding one is a
    /// kernel bug and panics.
    pub fn free_table(&self) {
        free_walk(self.root_phys);
    }
}

fn free_walk(table_phys: u64) {
    for i in 0..ENTRIES_PER_TABLE {
        let pte = unsafe { entry_ptr(table_phys, i) };
        let entry = unsafe { *pte };
        if entry.is_intermediate() {
            free_walk(entry.addr());
            unsafe {
                *pte = PageTableEntry::empty();
            }
        } else if entry.is_valid() {
            panic!("free_table: leaf still mapped");
        }
    }
    FRAME_TABLE.clear(table_phys);
    free_frame(table_phys);
}
