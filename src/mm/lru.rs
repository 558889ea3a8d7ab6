//! Eviction list - circular LRU over frame descriptors
//!
//! User leaf pages eligible for eviction are linked on one circular doubly
//! linked list. The head is the least recently installed (or clock-reset)
//! page; the head's `prev` is the most recent tail. Links are prev/next frame
//! indices in flat arrays, so a frame found through a PTE reaches its list
//! node in O(1) with no separate allocation.
//!
//! Lock order: the frame metadata lock is taken before the LRU lock,
//! released in reverse. Callers that already hold both (the clock scan)
//! use the `_locked` variants.
//!
//! The public entry points tolerate bad arguments by doing nothing. The
//! eviction path clears metadata while unlinked frames are still being
//! passed around, so a strict precondition here would turn benign races
//! into panics.

use alloc::vec::Vec;

use spin::Mutex;
use spin::mutex::MutexGuard;

use crate::mm::page::{FRAME_TABLE, FrameTableInner, NO_FRAME};
use crate::riscv::MAXVA;

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

pub(crate) struct LruInner {
    links: Vec<Link>,
    /// Oldest entry, or NO_FRAME when the list is empty
    head: u32,
    /// Number of linked entries
    count: usize,
    /// Clock hand cursor, or NO_FRAME before the first scan
    hand: u32,
}

impl LruInner {
    pub(crate) const fn new() -> Self {
        Self {
            links: Vec::new(),
            head: NO_FRAME,
            count: 0,
            hand: NO_FRAME,
        }
    }

    pub(crate) fn init(&mut self, num_frames: usize) {
        self.links = alloc::vec![
            Link {
                prev: NO_FRAME,
                next: NO_FRAME
            };
            num_frames
        ];
        self.head = NO_FRAME;
        self.count = 0;
        self.hand = NO_FRAME;
    }

    #[inline]
    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn hand(&self) -> u32 {
        self.hand
    }

    #[inline]
    pub(crate) fn set_hand(&mut self, idx: u32) {
        self.hand = idx;
    }

    #[inline]
    pub(crate) fn next_of(&self, idx: u32) -> u32 {
        self.links[idx as usize].next
    }

    /// Most recent entry (the head's prev), or NO_FRAME when empty
    #[inline]
    pub(crate) fn tail(&self) -> u32 {
        if self.head == NO_FRAME {
            NO_FRAME
        } else {
            self.links[self.head as usize].prev
        }
    }

    /// Splice `idx` in as the new tail of the circular list
    fn link_tail(&mut self, idx: u32) {
        if self.head == NO_FRAME {
            self.head = idx;
            self.links[idx as usize] = Link { prev: idx, next: idx };
        } else {
            let head = self.head;
            let tail = self.links[head as usize].prev;
            self.links[idx as usize] = Link { prev: tail, next: head };
            self.links[tail as usize].next = idx;
            self.links[head as usize].prev = idx;
        }
    }

    /// Unsplice `idx`, fixing head and the clock hand.
    ///
    /// The hand must never be left pointing at an unlinked entry.
    fn unlink(&mut self, idx: u32) {
        let Link { prev, next } = self.links[idx as usize];
        if next == idx {
            // sole element
            self.head = NO_FRAME;
            if self.hand == idx {
                self.hand = NO_FRAME;
            }
        } else {
            self.links[prev as usize].next = next;
            self.links[next as usize].prev = prev;
            if self.head == idx {
                self.head = next;
            }
            if self.hand == idx {
                self.hand = next;
            }
        }
        self.links[idx as usize] = Link {
            prev: NO_FRAME,
            next: NO_FRAME,
        };
    }
}

/// Global eviction list
pub static LRU: LruList = LruList::new();

pub struct LruList {
    inner: Mutex<LruInner>,
}

impl LruList {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner::new()),
        }
    }

    /// Size the link arrays for the managed region. Called once at boot.
    pub fn init(&self, num_frames: usize) {
        self.inner.lock().init(num_frames);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LruInner> {
        self.inner.lock()
    }

    /// Number of entries currently linked
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// List operations
// ============================================================================

/// Move the frame at `phys` to the tail as a user leaf of `root_phys` at
/// `vaddr`, linking it first if it was not on the list.
///
/// No-op if the frame is unmanaged, the address is out of user range, or the
/// frame holds a page-table page.
pub fn lru_add(phys: u64, root_phys: u64, vaddr: u64) {
    let mut ft = FRAME_TABLE.lock();
    let mut lru = LRU.lock();
    add_locked(&mut ft, &mut lru, phys, root_phys, vaddr);
}

/// Unlink the frame at `phys` if it is on the list
pub fn lru_remove(phys: u64) {
    let mut ft = FRAME_TABLE.lock();
    let mut lru = LRU.lock();
    remove_locked(&mut ft, &mut lru, phys);
}

pub(crate) fn add_locked(
    ft: &mut FrameTableInner,
    lru: &mut LruInner,
    phys: u64,
    root_phys: u64,
    vaddr: u64,
) {
    if vaddr >= MAXVA {
        return;
    }
    let Some(idx) = ft.index_of(phys) else {
        return;
    };
    let Some(meta) = ft.entry_mut(idx) else {
        return;
    };
    if meta.is_page_table {
        return;
    }

    meta.root_phys = root_phys;
    meta.vaddr = vaddr;

    let was_linked = meta.in_lru;
    meta.in_lru = true;

    if was_linked {
        lru.unlink(idx);
    }
    lru.link_tail(idx);
    if !was_linked {
        lru.count += 1;
    }
}

pub(crate) fn remove_locked(ft: &mut FrameTableInner, lru: &mut LruInner, phys: u64) {
    let Some(idx) = ft.index_of(phys) else {
        return;
    };
    let Some(meta) = ft.entry_mut(idx) else {
        return;
    };
    if !meta.in_lru {
        return;
    }

    meta.in_lru = false;
    meta.vaddr = 0;
    lru.unlink(idx);
    lru.count -= 1;
}

/// Walk the list both ways and compare against the population count.
///
/// Returns true when the forward walk, the backward walk, and the number of
/// metadata entries flagged `in_lru` all agree with the recorded count.
pub fn check_consistency() -> bool {
    let ft = FRAME_TABLE.lock();
    let lru = LRU.lock();

    let flagged = (0..ft.num_frames() as u32)
        .filter(|&i| ft.entry(i).is_some_and(|m| m.in_lru))
        .count();
    if flagged != lru.count {
        return false;
    }

    if lru.head == NO_FRAME {
        return lru.count == 0;
    }

    let cap = lru.count + 1;
    let mut forward = 0;
    let mut cur = lru.head;
    loop {
        forward += 1;
        if forward > cap {
            return false;
        }
        cur = lru.links[cur as usize].next;
        if cur == lru.head {
            break;
        }
    }

    let mut backward = 0;
    let mut cur = lru.head;
    loop {
        backward += 1;
        if backward > cap {
            return false;
        }
        cur = lru.links[cur as usize].prev;
        if cur == lru.head {
            break;
        }
    }

    forward == lru.count && backward == lru.count
}

// ============================================================================
// Tests
// ============================================================================
