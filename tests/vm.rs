//! End-to-end scenarios for the virtual memory subsystem
//!
//! A leaked page-aligned heap arena stands in for physical RAM (the direct
//! map is the identity) and a RAM-backed device stands in for the swap disk.
//! The arena is deliberately small so sustained workloads run under memory
//! pressure and the eviction machinery carries real traffic.
//!
//! The subsystem is a process-wide singleton, so every test serializes on
//! one lock. Tests that assert exact frame or slot accounting keep their
//! working set below the free-frame count so no eviction runs concurrently
//! with the bookkeeping.

use std::alloc::{Layout, alloc};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use rvk::KernelError;
use rvk::frame_alloc::{self, FRAME_ALLOCATOR};
use rvk::mm::swap::{self, MemSwapDevice};
use rvk::mm::{PteFlags, Sv39PageTable, fault, lru, page};
use rvk::printk;
use rvk::riscv::{MAXVA, PAGE_SIZE};

const ARENA_FRAMES: usize = 64;
const PG: u64 = PAGE_SIZE;

static VM_LOCK: Mutex<()> = Mutex::new(());
static VM_INIT: Once = Once::new();

/// Serialize on the subsystem and bring it up on first use
fn setup() -> MutexGuard<'static, ()> {
    // a panicking test (the should_panic ones) poisons the lock; the
    // subsystem itself is left in a usable state
    let guard = VM_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    VM_INIT.call_once(|| {
        let bytes = ARENA_FRAMES * PG as usize;
        let layout = Layout::from_size_align(bytes, PG as usize).unwrap();
        let base = unsafe { alloc(layout) } as u64;
        assert!(base != 0, "arena allocation failed");

        rvk::mm::init(base, bytes as u64);
        swap::register_device(Arc::new(MemSwapDevice::new()));
    });

    guard
}

/// Create an address space of `pages` zeroed user pages
fn user_space(pages: u64) -> Sv39PageTable {
    let pt = Sv39PageTable::new_user().expect("no frame for root table");
    let sz = pt.grow(0, pages * PG, PteFlags::empty());
    assert_eq!(sz, pages * PG, "grow failed");
    pt
}

fn read_byte(pt: &Sv39PageTable, va: u64) -> u8 {
    let mut b = [0u8; 1];
    pt.copy_in(&mut b, va).expect("copy_in failed");
    b[0]
}

fn assert_subsystem_consistent() {
    assert!(lru::check_consistency(), "LRU list inconsistent");
    assert!(
        page::FRAME_TABLE.no_role_conflicts(),
        "frame is both page table and LRU member"
    );
    assert_eq!(page::FRAME_TABLE.lru_flagged(), lru::LRU.len());

    // every listed frame is mapped by exactly the leaf its metadata claims
    for (phys, meta) in page::FRAME_TABLE.snapshot() {
        if !meta.in_lru {
            continue;
        }
        let entry = Sv39PageTable::from_root(meta.root_phys)
            .leaf(meta.vaddr)
            .expect("LRU frame without a PTE");
        assert!(entry.is_leaf(), "LRU frame not resident at {:#x}", meta.vaddr);
        assert!(entry.flags().contains(PteFlags::U | PteFlags::V));
        assert_eq!(entry.addr(), phys, "PTE does not map the listed frame");
    }
}

// ============================================================================
// Sustained swap workloads
// ============================================================================

#[test]
fn test_swap_loop_data_survives_eviction() {
    let _vm = setup();
    const NPAGES: u64 = 128;

    let before = swap::swap_stats();
    let pt = user_space(NPAGES);

    // tag byte 0 of every page with its index
    for i in 0..NPAGES {
        pt.copy_out(i * PG, &[i as u8]).unwrap();
    }

    // strided reads keep rotating the working set through swap
    let mut b = [0u8; 1];
    for _pass in 0..10 {
        for i in 0..NPAGES {
            for off in (0..PG).step_by(1024) {
                pt.copy_in(&mut b, i * PG + off).unwrap();
            }
        }
    }

    for i in 0..NPAGES {
        assert_eq!(read_byte(&pt, i * PG), i as u8, "page {i} corrupted");
    }

    let after = swap::swap_stats();
    assert!(after.swap_outs > before.swap_outs, "no page was evicted");
    assert!(after.swap_ins > before.swap_ins, "no page was faulted back");

    swap::log_swap_stats();
    let mut buf = vec![0u8; 8192];
    let n = printk::log_snapshot(&mut buf);
    let log = String::from_utf8_lossy(&buf[..n]);
    assert!(log.contains("pages out"), "stats line missing from log");

    assert_subsystem_consistent();
    pt.destroy(NPAGES * PG);
    assert_subsystem_consistent();
}

#[test]
fn test_swap_stress_dense_pattern() {
    let _vm = setup();
    const NPAGES: u64 = 256;

    let pt = user_space(NPAGES);

    for i in 0..NPAGES {
        for off in (0..PG).step_by(1024) {
            pt.copy_out(i * PG + off, &[i as u8]).unwrap();
        }
    }

    // verify, then verify again after the first pass re-shuffled residency
    for _round in 0..2 {
        for i in 0..NPAGES {
            for off in (0..PG).step_by(1024) {
                assert_eq!(read_byte(&pt, i * PG + off), i as u8);
            }
        }
    }

    pt.destroy(NPAGES * PG);
    assert_subsystem_consistent();
}

#[test]
fn test_eviction_preserves_page_bytes() {
    let _vm = setup();
    const NPAGES: u64 = 100;

    let pt = user_space(NPAGES);

    let pattern: Vec<u8> = (0..PG).map(|i| (i * 7 % 251) as u8).collect();
    pt.copy_out(0, &pattern).unwrap();

    // touch everything else until page 0 loses the clock race
    let mut evicted = false;
    'outer: for _ in 0..200 {
        for i in 1..NPAGES {
            pt.copy_out(i * PG, &[i as u8]).unwrap();
        }
        if pt.leaf(0).unwrap().is_swapped() {
            evicted = true;
            break 'outer;
        }
    }
    assert!(evicted, "page 0 was never evicted under pressure");

    let mut back = vec![0u8; PG as usize];
    pt.copy_in(&mut back, 0).unwrap();
    assert_eq!(back, pattern);
    assert!(pt.leaf(0).unwrap().is_leaf(), "page 0 should be resident again");

    pt.destroy(NPAGES * PG);
}

// ============================================================================
// Fork
// ============================================================================

#[test]
fn test_fork_deep_copies_and_isolates() {
    let _vm = setup();
    const NPAGES: u64 = 1024;

    let parent = user_space(NPAGES);
    for i in 0..NPAGES {
        parent.copy_out(i * PG, &[i as u8]).unwrap();
    }

    // by now most of the parent is swapped out; the copy must span both
    // resident and swapped pages
    let swapped_before_fork = (0..NPAGES)
        .filter(|&i| parent.leaf(i * PG).unwrap().is_swapped())
        .count();
    assert!(swapped_before_fork > 0, "workload never reached swap");

    let child = Sv39PageTable::new_user().unwrap();
    parent.fork_into(&child, NPAGES * PG).unwrap();

    // child sees the parent's values, then scribbles over its own copy
    for i in 0..NPAGES {
        assert_eq!(read_byte(&child, i * PG), i as u8, "child copy wrong at {i}");
        child
            .copy_out(i * PG, &[(i as u8).wrapping_add(100)])
            .unwrap();
    }
    child.destroy(NPAGES * PG);

    // parent still sees its original bytes
    for i in 0..NPAGES {
        assert_eq!(read_byte(&parent, i * PG), i as u8, "parent corrupted at {i}");
    }

    parent.destroy(NPAGES * PG);
    assert_subsystem_consistent();
}

#[test]
fn test_fork_leaves_parent_slot_allocated() {
    let _vm = setup();
    const NPAGES: u64 = 100;

    let parent = user_space(NPAGES);
    for i in 0..NPAGES {
        parent.copy_out(i * PG, &[i as u8]).unwrap();
    }

    let swapped_va = (0..NPAGES)
        .map(|i| i * PG)
        .find(|&va| parent.leaf(va).unwrap().is_swapped())
        .expect("no swapped parent page");
    let slot = parent.leaf(swapped_va).unwrap().swap_slot();

    let child = Sv39PageTable::new_user().unwrap();
    parent.fork_into(&child, NPAGES * PG).unwrap();

    // the parent entry still references the same slot
    let entry = parent.leaf(swapped_va).unwrap();
    assert!(entry.is_swapped(), "fork must not fault the parent page in");
    assert_eq!(entry.swap_slot(), slot);

    // and the child sees the right data without touching that slot
    assert_eq!(read_byte(&child, swapped_va), (swapped_va / PG) as u8);
    assert!(parent.leaf(swapped_va).unwrap().is_swapped());

    child.destroy(NPAGES * PG);
    parent.destroy(NPAGES * PG);
}

// ============================================================================
// Fault-driven swap-in
// ============================================================================

#[test]
fn test_copy_in_faults_swapped_page_back() {
    let _vm = setup();
    const NPAGES: u64 = 100;

    let pt = user_space(NPAGES);
    for i in 0..NPAGES {
        pt.copy_out(i * PG, &[0x40 + (i % 32) as u8]).unwrap();
    }

    let va = (0..NPAGES)
        .map(|i| i * PG)
        .find(|&va| pt.leaf(va).unwrap().is_swapped())
        .expect("no page reached swap");

    let ins_before = swap::swap_stats().swap_ins;
    let expected = 0x40 + ((va / PG) % 32) as u8;
    assert_eq!(read_byte(&pt, va), expected);

    // the page is resident again and back on the eviction list
    assert!(swap::swap_stats().swap_ins > ins_before);
    let entry = pt.leaf(va).unwrap();
    assert!(entry.is_leaf());
    let meta = page::FRAME_TABLE.meta_of(entry.addr()).unwrap();
    assert!(meta.in_lru);
    assert_eq!(meta.vaddr, va);
    assert_eq!(meta.root_phys, pt.root_phys());

    pt.destroy(NPAGES * PG);
}

#[test]
fn test_fault_handler_services_swapped_pte() {
    let _vm = setup();
    const NPAGES: u64 = 80;

    let pt = user_space(NPAGES);
    for i in 0..NPAGES {
        pt.copy_out(i * PG, &[i as u8]).unwrap();
    }

    let va = (0..NPAGES)
        .map(|i| i * PG)
        .find(|&va| pt.leaf(va).unwrap().is_swapped())
        .expect("no page reached swap");

    fault::handle_page_fault(&pt, va + 123).expect("swap fault should resolve");
    assert!(pt.leaf(va).unwrap().is_leaf());
    assert_eq!(read_byte(&pt, va), (va / PG) as u8);

    pt.destroy(NPAGES * PG);
}

#[test]
fn test_fault_on_unmapped_address_is_fatal() {
    let _vm = setup();

    let pt = Sv39PageTable::new_user().unwrap();
    assert_eq!(
        fault::handle_page_fault(&pt, 0x5000),
        Err(KernelError::BadAddress)
    );
    assert_eq!(
        fault::handle_page_fault(&pt, MAXVA + 1),
        Err(KernelError::BadAddress)
    );
    pt.free_table();
}

// ============================================================================
// Guard pages
// ============================================================================

#[test]
fn test_guard_page_fault_is_fatal() {
    let _vm = setup();

    let pt = user_space(2);
    pt.revoke_user_access(PG);

    // still resident, but invisible to the user and off the eviction list
    let entry = pt.leaf(PG).unwrap();
    assert!(entry.is_leaf());
    assert!(!entry.flags().contains(PteFlags::U));
    assert!(!page::FRAME_TABLE.meta_of(entry.addr()).unwrap().in_lru);

    assert!(pt.translate(PG).is_none());
    let mut b = [0u8; 1];
    assert_eq!(pt.copy_in(&mut b, PG), Err(KernelError::BadAddress));

    // a resident non-swap fault must kill, not loop
    assert_eq!(
        fault::handle_page_fault(&pt, PG),
        Err(KernelError::BadAddress)
    );

    // the neighboring page is untouched
    assert!(pt.translate(0).is_some());

    pt.destroy(2 * PG);
}

// ============================================================================
// Size accounting and rollback
// ============================================================================

#[test]
fn test_grow_shrink_destroy_frees_everything() {
    let _vm = setup();

    let free_before = FRAME_ALLOCATOR.free_frames();
    let slots_before = swap::free_slots();
    // stay well under the free-frame count so nothing is evicted while the
    // accounting runs
    assert!(free_before > 16, "arena unexpectedly tight");

    let pt = Sv39PageTable::new_user().unwrap();
    assert_eq!(pt.grow(0, 10 * PG, PteFlags::empty()), 10 * PG);
    assert!(pt.translate(9 * PG).is_some());

    // shrinking back makes the pages unreachable
    assert_eq!(pt.shrink(10 * PG, 0), 0);
    assert!(pt.translate(0).is_none());
    assert!(pt.translate(9 * PG).is_none());

    pt.destroy(0);
    assert_eq!(FRAME_ALLOCATOR.free_frames(), free_before);
    assert_eq!(swap::free_slots(), slots_before);
}

#[test]
fn test_shrink_releases_swap_slots() {
    let _vm = setup();
    const NPAGES: u64 = 100;

    let slots_before = swap::free_slots();

    let pt = user_space(NPAGES);
    for i in 0..NPAGES {
        pt.copy_out(i * PG, &[1]).unwrap();
    }
    assert!(
        (0..NPAGES).any(|i| pt.leaf(i * PG).unwrap().is_swapped()),
        "no page reached swap"
    );
    assert!(swap::free_slots() < slots_before);

    pt.destroy(NPAGES * PG);
    assert_eq!(swap::free_slots(), slots_before);
}

#[test]
fn test_grow_is_noop_when_shrinking() {
    let _vm = setup();

    let pt = user_space(4);
    assert_eq!(pt.grow(4 * PG, 2 * PG, PteFlags::empty()), 4 * PG);
    assert!(pt.translate(3 * PG).is_some());
    pt.destroy(4 * PG);
}

// ============================================================================
// Copy primitives
// ============================================================================

#[test]
fn test_copy_out_rejects_readonly_and_kernel_only() {
    let _vm = setup();

    let pt = Sv39PageTable::new_user().unwrap();
    let mem = frame_alloc::alloc_frame().unwrap();
    pt.map_pages(0, PG, mem, PteFlags::R | PteFlags::U).unwrap();

    assert_eq!(pt.copy_out(0, &[1]), Err(KernelError::BadAddress));
    assert_eq!(pt.copy_out(MAXVA, &[1]), Err(KernelError::BadAddress));

    pt.unmap_pages(0, 1, true);
    pt.free_table();
}

#[test]
fn test_copy_across_page_boundary() {
    let _vm = setup();

    let pt = user_space(2);
    let data: Vec<u8> = (0..64).map(|i| i as u8 ^ 0x5a).collect();
    pt.copy_out(PG - 32, &data).unwrap();

    let mut back = [0u8; 64];
    pt.copy_in(&mut back, PG - 32).unwrap();
    assert_eq!(&back[..], &data[..]);

    pt.destroy(2 * PG);
}

#[test]
fn test_copy_in_str_semantics() {
    let _vm = setup();

    let pt = user_space(2);

    pt.copy_out(16, b"initproc\0").unwrap();
    assert_eq!(pt.copy_in_str(16, 32).unwrap(), "initproc");

    // terminator on the far side of a page boundary
    pt.copy_out(PG - 3, b"abcdef\0").unwrap();
    assert_eq!(pt.copy_in_str(PG - 3, 16).unwrap(), "abcdef");

    // no NUL within the allowance
    pt.copy_out(64, b"AAAAAAAA").unwrap();
    assert_eq!(pt.copy_in_str(64, 8), Err(KernelError::NameTooLong));

    pt.destroy(2 * PG);
}

#[test]
fn test_load_init_installs_first_page() {
    let _vm = setup();

    let pt = Sv39PageTable::new_user().unwrap();
    let image = [0x13u8, 0x05, 0x60, 0x02, 0x73, 0x00, 0x00, 0x00];
    pt.load_init(&image);

    assert!(pt.translate(0).is_some());
    let mut back = [0u8; 8];
    pt.copy_in(&mut back, 0).unwrap();
    assert_eq!(back, image);

    pt.destroy(PG);
}

// ============================================================================
// Logging
// ============================================================================

struct CaptureConsole(Mutex<String>);

impl printk::Console for CaptureConsole {
    fn write(&self, s: &str) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_str(s);
    }
}

static CAPTURE: CaptureConsole = CaptureConsole(Mutex::new(String::new()));

#[test]
fn test_console_registration_flushes_backlog() {
    let _vm = setup();

    // boot messages were buffered before any console existed
    printk::register_console(&CAPTURE);
    let captured = CAPTURE.0.lock().unwrap_or_else(|e| e.into_inner());
    assert!(
        captured.contains("mm: managing"),
        "boot backlog was not flushed to the console"
    );
}

// ============================================================================
// Boundaries and precondition panics
// ============================================================================

#[test]
fn test_map_at_top_of_user_range() {
    let _vm = setup();

    let pt = Sv39PageTable::new_user().unwrap();
    let mem = frame_alloc::alloc_frame().unwrap();
    let va = MAXVA - PG;
    pt.map_pages(va, PG, mem, PteFlags::R | PteFlags::W | PteFlags::U)
        .unwrap();

    // the last user byte resolves
    assert!(pt.translate(MAXVA - 1).is_some());

    pt.unmap_pages(va, 1, true);
    pt.free_table();
}

#[test]
#[should_panic(expected = "out of range")]
fn test_translate_at_maxva_panics() {
    let _vm = setup();
    let pt = Sv39PageTable::new_user().unwrap();
    let _ = pt.translate(MAXVA);
}

#[test]
#[should_panic(expected = "remap")]
fn test_remap_panics() {
    let _vm = setup();
    let pt = Sv39PageTable::new_user().unwrap();
    // kernel-only mapping so the leaked page stays off the eviction list
    let m1 = frame_alloc::alloc_frame().unwrap();
    let m2 = frame_alloc::alloc_frame().unwrap();
    pt.map_pages(0x1000, PG, m1, PteFlags::R | PteFlags::W).unwrap();
    let _ = pt.map_pages(0x1000, PG, m2, PteFlags::R | PteFlags::W);
}

#[test]
#[should_panic(expected = "not aligned")]
fn test_map_unaligned_va_panics() {
    let _vm = setup();
    let pt = Sv39PageTable::new_user().unwrap();
    let _ = pt.map_pages(0x1001, PG, 0, PteFlags::R);
}

#[test]
#[should_panic(expected = "not mapped")]
fn test_unmap_missing_page_panics() {
    let _vm = setup();
    let pt = Sv39PageTable::new_user().unwrap();
    // kernel-only mapping so the leaked page stays off the eviction list;
    // it shares the leaf table with the hole being unmapped
    let mem = frame_alloc::alloc_frame().unwrap();
    pt.map_pages(0, PG, mem, PteFlags::R | PteFlags::W).unwrap();
    pt.unmap_pages(8 * PG, 1, false);
}
