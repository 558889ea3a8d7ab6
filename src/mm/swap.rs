//! Swap area - slot management and page I/O
//!
//! One swap area on one device: a dense array of page-sized slots, tracked
//! by a fixed bitmap. Slot `i` lives at byte offset `i * 4096` from the
//! area's base on the device; there is no on-disk header and slots never
//! survive a reboot.
//!
//! The device behind the area is pluggable. The disk driver registers its
//! implementation at boot; `MemSwapDevice` backs the area with RAM for
//! bring-up and for the test suite. Slot I/O is synchronous and may sleep
//! the caller; it either completes or panics the kernel. No other lock in
//! the subsystem is held across a slot transfer.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::printkln;
use crate::riscv::{PAGE_SIZE, phys_to_virt};

/// Size of the swap area in bytes
pub const SWAP_MAX: u64 = 16 * 1024 * 1024;

/// Number of page slots in the swap area
pub const MAX_SWAP_SLOTS: usize = (SWAP_MAX / PAGE_SIZE) as usize;

const BITMAP_WORDS: usize = MAX_SWAP_SLOTS / 64;

// ============================================================================
// Device interface
// ============================================================================

/// One-page transfers between a physical frame and a swap slot
///
/// Implemented by the disk driver over its block queue. Both calls are
/// synchronous; a transfer that cannot complete is a kernel panic, never an
/// error return.
pub trait SwapDevice: Send + Sync {
    /// Read slot `slot` into the frame at `frame_phys`
    fn read_slot(&self, slot: u32, frame_phys: u64);

    /// Write the frame at `frame_phys` to slot `slot`
    fn write_slot(&self, slot: u32, frame_phys: u64);
}

static SWAP_DEVICE: RwLock<Option<Arc<dyn SwapDevice>>> = RwLock::new(None);

/// Install the swap device. Called once at boot after the driver probes.
pub fn register_device(dev: Arc<dyn SwapDevice>) {
    *SWAP_DEVICE.write() = Some(dev);
}

/// Whether a swap device has been registered
pub fn device_registered() -> bool {
    SWAP_DEVICE.read().is_some()
}

fn device() -> Arc<dyn SwapDevice> {
    SWAP_DEVICE
        .read()
        .clone()
        .expect("swap: no device registered")
}

/// Read one page from `slot` into the frame at `frame_phys`
pub fn swap_read_page(slot: u32, frame_phys: u64) {
    device().read_slot(slot, frame_phys);
}

/// Write one page from the frame at `frame_phys` to `slot`
pub fn swap_write_page(slot: u32, frame_phys: u64) {
    device().write_slot(slot, frame_phys);
}

// ============================================================================
// Slot allocation
// ============================================================================

/// Bitmap over the swap slots (bit set = slot allocated)
struct SlotBitmap {
    words: [u64; BITMAP_WORDS],
    used: usize,
}

static SLOTS: Mutex<SlotBitmap> = Mutex::new(SlotBitmap {
    words: [0; BITMAP_WORDS],
    used: 0,
});

/// Allocate the lowest free slot.
///
/// Returns None when the area is full; the caller decides whether that
/// fails an eviction or kills a process.
pub fn alloc_slot() -> Option<u32> {
    let mut slots = SLOTS.lock();
    for word_idx in 0..BITMAP_WORDS {
        let word = slots.words[word_idx];
        if word != !0u64 {
            let bit = word.trailing_ones() as usize;
            slots.words[word_idx] |= 1 << bit;
            slots.used += 1;
            return Some((word_idx * 64 + bit) as u32);
        }
    }
    None
}

/// Release a slot.
///
/// Freeing a slot that is out of range or not allocated is a caller bug.
pub fn free_slot(slot: u32) {
    if slot as usize >= MAX_SWAP_SLOTS {
        panic!("swap: free of bad slot {slot}");
    }
    let mut slots = SLOTS.lock();
    let word = slot as usize / 64;
    let bit = slot % 64;
    if slots.words[word] & (1 << bit) == 0 {
        panic!("swap: slot {slot} already free");
    }
    slots.words[word] &= !(1 << bit);
    slots.used -= 1;
}

/// Number of free slots remaining
pub fn free_slots() -> usize {
    MAX_SWAP_SLOTS - SLOTS.lock().used
}

// ============================================================================
// Statistics
// ============================================================================

/// Swap traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Pages written out by the evictor
    pub swap_outs: u64,
    /// Pages faulted or copied back in
    pub swap_ins: u64,
}

static STATS: Mutex<SwapStats> = Mutex::new(SwapStats {
    swap_outs: 0,
    swap_ins: 0,
});

pub(crate) fn note_swap_out() {
    STATS.lock().swap_outs += 1;
}

pub(crate) fn note_swap_in() {
    STATS.lock().swap_ins += 1;
}

/// Snapshot of the traffic counters
pub fn swap_stats() -> SwapStats {
    *STATS.lock()
}

/// Log the traffic counters to the kernel log
pub fn log_swap_stats() {
    let stats = swap_stats();
    printkln!(
        "swap: {} pages out, {} pages in, {} slots free",
        stats.swap_outs,
        stats.swap_ins,
        free_slots()
    );
}

// ============================================================================
// RAM-backed device
// ============================================================================

/// Swap device backed by heap pages
///
/// Slot storage is allocated on first write, so an idle area costs one
/// pointer per slot. Reading a slot that was never written is a bug in the
/// caller's slot accounting.
pub struct MemSwapDevice {
    slots: Mutex<Vec<Option<Box<[u8; PAGE_SIZE as usize]>>>>,
}

impl MemSwapDevice {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_SWAP_SLOTS, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }
}

impl Default for MemSwapDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapDevice for MemSwapDevice {
    fn read_slot(&self, slot: u32, frame_phys: u64) {
        let slots = self.slots.lock();
        let page = slots[slot as usize]
            .as_ref()
            .expect("swap: read of unwritten slot");
        unsafe {
            core::ptr::copy_nonoverlapping(
                page.as_ptr(),
                phys_to_virt(frame_phys),
                PAGE_SIZE as usize,
            );
        }
    }

    fn write_slot(&self, slot: u32, frame_phys: u64) {
        let mut slots = self.slots.lock();
        let page = slots[slot as usize].get_or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(frame_phys) as *const u8,
                page.as_mut_ptr(),
                PAGE_SIZE as usize,
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
