//! Physical frame allocator
//!
//! Free-list allocator for 4 KiB frames: the list threads through the free
//! frames themselves, so the allocator needs no storage beyond the list head.
//! Frames are filled with sentinel bytes on both alloc and free to catch
//! dangling references.
//!
//! When the list is empty, allocation drops the list lock, asks the evictor
//! to push one user page out to swap, and retries. The lock must be released
//! first: eviction ends by freeing the victim's frame back here.

use core::ptr;

use spin::Mutex;

use crate::mm::reclaim;
use crate::printkln;
use crate::riscv::{PAGE_SIZE, phys_to_virt};

/// Byte written over a frame when it is freed
const FREED_SENTINEL: u8 = 0x01;

/// Byte written over a frame when it is handed out
const ALLOC_SENTINEL: u8 = 0x05;

struct FreeListInner {
    /// Physical address of the first free frame, 0 when empty
    head: u64,
    /// First managed physical address
    base: u64,
    /// One past the last managed physical address
    top: u64,
    /// Number of frames on the list
    free: usize,
}

/// Global frame allocator
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

pub struct FrameAllocator {
    inner: Mutex<FreeListInner>,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(FreeListInner {
                head: 0,
                base: 0,
                top: 0,
                free: 0,
            }),
        }
    }

    /// Hand the region `[base, base + size)` to the allocator.
    ///
    /// Called once at boot, after the frame table covers the region. `base`
    /// must be page-aligned.
    pub fn init(&self, base: u64, size: u64) {
        assert!(base % PAGE_SIZE == 0, "frame_alloc: base not aligned");
        {
            let mut inner = self.inner.lock();
            inner.base = base;
            inner.top = base + size / PAGE_SIZE * PAGE_SIZE;
            inner.head = 0;
            inner.free = 0;
        }
        let top = base + size / PAGE_SIZE * PAGE_SIZE;
        let mut pa = base;
        while pa < top {
            self.free(pa);
            pa += PAGE_SIZE;
        }
    }

    /// Allocate one frame, evicting user pages to swap as needed.
    ///
    /// Returns None only when the list is empty and eviction fails too.
    /// The frame comes back filled with the alloc sentinel, not zeroed.
    pub fn alloc(&self) -> Option<u64> {
        loop {
            let popped = {
                let mut inner = self.inner.lock();
                let pa = inner.head;
                if pa != 0 {
                    inner.head = unsafe { (phys_to_virt(pa) as *const u64).read() };
                    inner.free -= 1;
                }
                pa
            };
            if popped != 0 {
                unsafe {
                    ptr::write_bytes(phys_to_virt(popped), ALLOC_SENTINEL, PAGE_SIZE as usize);
                }
                return Some(popped);
            }

            // List empty. Eviction is invoked with the list lock released;
            // it frees the victim's frame back onto this list.
            if !reclaim::evict_page() {
                printkln!("frame_alloc: out of memory and nothing to evict");
                return None;
            }
        }
    }

    /// Return a frame to the free list.
    ///
    /// The frame must be page-aligned and inside the managed region; anything
    /// else is a caller bug.
    pub fn free(&self, pa: u64) {
        let (base, top) = {
            let inner = self.inner.lock();
            (inner.base, inner.top)
        };
        if pa % PAGE_SIZE != 0 || pa < base || pa >= top {
            panic!("frame_alloc: free of bad frame {pa:#x}");
        }

        unsafe {
            ptr::write_bytes(phys_to_virt(pa), FREED_SENTINEL, PAGE_SIZE as usize);
        }

        let mut inner = self.inner.lock();
        unsafe {
            (phys_to_virt(pa) as *mut u64).write(inner.head);
        }
        inner.head = pa;
        inner.free += 1;
    }

    /// Number of frames currently on the free list
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free
    }
}

/// Allocate one frame from the global allocator
#[inline]
pub fn alloc_frame() -> Option<u64> {
    FRAME_ALLOCATOR.alloc()
}

/// Free one frame to the global allocator
#[inline]
pub fn free_frame(pa: u64) {
    FRAME_ALLOCATOR.free(pa)
}

// ============================================================================
// Tests
// ============================================================================
