//! Per-frame metadata
//!
//! Each physical frame managed by the frame allocator has a FrameMeta entry
//! recording what the frame currently is:
//! - a page-table page (`is_page_table`)
//! - a user leaf page on the eviction list (`in_lru`, plus the owning page
//!   table root and the user virtual address it is mapped at)
//! - neither (free, or kernel use outside the paging subsystem)
//!
//! The backlink from frame to mapping lets the evictor rewrite the one leaf
//! PTE that maps a victim without any reverse-map structure.
//!
//! The table is the metadata lock in the subsystem lock order; the LRU link
//! arrays live behind their own lock in `lru`.

use alloc::vec::Vec;

use spin::Mutex;
use spin::mutex::MutexGuard;

use crate::riscv::PAGE_SIZE;

/// Sentinel frame index ("no frame")
pub const NO_FRAME: u32 = u32::MAX;

/// Metadata for one physical frame
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMeta {
    /// Frame holds a page-table page
    pub is_page_table: bool,
    /// Frame is linked on the eviction list
    pub in_lru: bool,
    /// Root of the address space mapping this frame (valid iff `in_lru`)
    pub root_phys: u64,
    /// User virtual address the frame is mapped at (valid iff `in_lru`)
    pub vaddr: u64,
}

pub(crate) struct FrameTableInner {
    /// First managed physical address
    base: u64,
    /// One entry per managed frame
    meta: Vec<FrameMeta>,
}

impl FrameTableInner {
    pub(crate) const fn new() -> Self {
        Self {
            base: 0,
            meta: Vec::new(),
        }
    }

    pub(crate) fn init(&mut self, base: u64, num_frames: usize) {
        self.base = base;
        self.meta = alloc::vec![FrameMeta::default(); num_frames];
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub(crate) fn num_frames(&self) -> usize {
        self.meta.len()
    }

    /// Frame index of a physical address, or None if unmanaged
    pub(crate) fn index_of(&self, phys: u64) -> Option<u32> {
        if phys < self.base {
            return None;
        }
        let idx = ((phys - self.base) / PAGE_SIZE) as usize;
        if idx < self.meta.len() { Some(idx as u32) } else { None }
    }

    /// Physical address of a frame index
    #[inline]
    pub(crate) fn phys_of(&self, idx: u32) -> u64 {
        self.base + idx as u64 * PAGE_SIZE
    }

    #[inline]
    pub(crate) fn entry(&self, idx: u32) -> Option<&FrameMeta> {
        self.meta.get(idx as usize)
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, idx: u32) -> Option<&mut FrameMeta> {
        self.meta.get_mut(idx as usize)
    }
}

/// Global frame descriptor table
pub static FRAME_TABLE: FrameTable = FrameTable::new();

/// Wrapper holding the frame metadata behind the metadata lock
pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(FrameTableInner::new()),
        }
    }

    /// Size the table for the managed region. Called once at boot.
    pub fn init(&self, base: u64, num_frames: usize) {
        self.inner.lock().init(base, num_frames);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FrameTableInner> {
        self.inner.lock()
    }

    /// Copy of the metadata for the frame at `phys`, if managed
    pub fn meta_of(&self, phys: u64) -> Option<FrameMeta> {
        let inner = self.inner.lock();
        let idx = inner.index_of(phys)?;
        inner.entry(idx).copied()
    }

    /// Mark a frame as holding a page-table page
    pub(crate) fn mark_page_table(&self, phys: u64) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.index_of(phys)
            && let Some(meta) = inner.entry_mut(idx)
        {
            meta.is_page_table = true;
            meta.vaddr = 0;
        }
    }

    /// Reset a frame's metadata to the default state
    pub(crate) fn clear(&self, phys: u64) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.index_of(phys)
            && let Some(meta) = inner.entry_mut(idx)
        {
            *meta = FrameMeta::default();
        }
    }

    /// No frame is simultaneously a page-table page and an eviction candidate
    pub fn no_role_conflicts(&self) -> bool {
        let inner = self.inner.lock();
        inner.meta.iter().all(|m| !(m.is_page_table && m.in_lru))
    }

    /// Number of entries with `in_lru` set
    pub fn lru_flagged(&self) -> usize {
        let inner = self.inner.lock();
        inner.meta.iter().filter(|m| m.in_lru).count()
    }

    /// Copy of every entry with its frame address, for diagnostics
    pub fn snapshot(&self) -> Vec<(u64, FrameMeta)> {
        let inner = self.inner.lock();
        inner
            .meta
            .iter()
            .enumerate()
            .map(|(i, m)| (inner.phys_of(i as u32), *m))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
