//! Page replacement - clock scan and eviction
//!
//! When physical memory runs out, one resident user page is pushed to swap.
//! Victim choice is a clock sweep over the eviction list: pages with the
//! Access bit set get a second chance (bit cleared, page rotated to the
//! tail), cold pages are taken. A full lap without a cold page falls back to
//! whatever the hand rests on, so the scan always makes progress.
//!
//! The scan holds the metadata and LRU locks throughout and therefore calls
//! only the non-locking list internals. Eviction itself allocates nothing
//! beyond one swap slot; the allocator can safely call it on exhaustion.

use crate::frame_alloc::free_frame;
use crate::mm::lru::{self, LRU};
use crate::mm::page::{FRAME_TABLE, NO_FRAME};
use crate::mm::page_table::{PTE_LOCK, Sv39PageTable};
use crate::mm::pte::{PageTableEntry, PteFlags};
use crate::mm::swap;
use crate::printkln;
use crate::riscv::{KERNBASE, MAXVA, sfence_vma};

/// A page chosen for eviction: where its leaf PTE lives
struct Victim {
    root_phys: u64,
    vaddr: u64,
}

/// Run the clock over the eviction list and pick a victim.
///
/// Returns None only when the list is empty. The hand is persistent across
/// calls and is never left on an unlinked entry.
fn select_victim() -> Option<Victim> {
    let mut ft = FRAME_TABLE.lock();
    let mut list = LRU.lock();

    if list.count() == 0 {
        return None;
    }
    if list.hand() == NO_FRAME {
        let head = list.head();
        list.set_hand(head);
    }

    let start = list.hand();
    let max_steps = 2 * list.count() + 1;
    let mut steps = 0;

    loop {
        let cur = list.hand();
        let meta = *ft.entry(cur)?;

        let pte = Sv39PageTable::from_root(meta.root_phys).walk(meta.vaddr, false);
        let entry = pte.map(|p| unsafe { *p });
        let resident_user =
            entry.is_some_and(|e| e.is_leaf() && e.flags().contains(PteFlags::U));

        if !resident_user || meta.vaddr >= KERNBASE {
            // unreachable PTE or pinned region: skip
            let next = list.next_of(cur);
            list.set_hand(next);
        } else if entry.is_some_and(|e| e.flags().contains(PteFlags::A)) {
            // second chance: clear the Access bit, rotate to the tail
            let p = pte.unwrap();
            unsafe {
                *p = (*p).cleared(PteFlags::A);
            }
            let next = list.next_of(cur);
            if cur != list.tail() {
                let phys = ft.phys_of(cur);
                lru::remove_locked(&mut ft, &mut list, phys);
                lru::add_locked(&mut ft, &mut list, phys, meta.root_phys, meta.vaddr);
            }
            list.set_hand(next);
        } else {
            // cold resident user page: take it
            let next = list.next_of(cur);
            list.set_hand(next);
            return Some(Victim {
                root_phys: meta.root_phys,
                vaddr: meta.vaddr,
            });
        }

        steps += 1;
        if list.hand() == start || steps >= max_steps {
            // full lap, everything warm or skippable: take the hand position
            let cur = list.hand();
            let meta = *ft.entry(cur)?;
            let next = list.next_of(cur);
            list.set_hand(next);
            return Some(Victim {
                root_phys: meta.root_phys,
                vaddr: meta.vaddr,
            });
        }
    }
}

/// Evict one user page to swap and free its frame.
///
/// Returns false when there is nothing to evict, the victim's PTE turned out
/// unusable, or no swap slot is left. The slot is written before the PTE is
/// rewritten, so a fault racing this path sees either the resident mapping
/// or a fully populated slot.
pub fn evict_page() -> bool {
    if !swap::device_registered() {
        return false;
    }

    let Some(victim) = select_victim() else {
        return false;
    };
    if victim.vaddr >= MAXVA {
        panic!("evict_page: bad victim vaddr {:#x}", victim.vaddr);
    }

    let pt = Sv39PageTable::from_root(victim.root_phys);
    let Some(pte) = pt.walk(victim.vaddr, false) else {
        return false;
    };
    let entry = unsafe { *pte };
    if !entry.is_leaf() {
        return false;
    }
    let pa = entry.addr();

    let Some(slot) = swap::alloc_slot() else {
        printkln!("evict_page: swap area full");
        return false;
    };

    swap::swap_write_page(slot, pa);
    swap::note_swap_out();

    lru::lru_remove(pa);

    {
        let _guard = PTE_LOCK.lock();
        unsafe {
            *pte = PageTableEntry::new_swapped(slot, entry.perm_flags());
        }
        sfence_vma();
    }

    free_frame(pa);
    FRAME_TABLE.clear(pa);

    true
}
