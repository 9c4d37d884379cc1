// Sv39 page tables: three levels of 512 entries, 4096-byte pages.
//
// walk/mappages/walkaddr are the mapping primitives; kvminit builds the
// kernel address space; the copy*_user routines are the only way user
// virtual memory is ever touched from the kernel.

use crate::kalloc::{alloc_page, free_page};
use crate::memlayout::{CLINT, UART0};
use crate::riscv::{sfence_vma, w_satp, PageTable, Pte, PteFlags, MAXVA, PGSIZE};
use crate::string::{memmove, memset};
use crate::{MAKE_SATP, PGROUNDDOWN, PX};

/// Why a mapping request failed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MapError {
    /// a leaf was already valid somewhere in the requested range.
    Remap,
    /// an interior page-table page could not be allocated.
    NoMem,
}

struct PagetableStats {
    total_pt_pages: u64,
    total_mappings: u64,
    kernel_pt_pages: u64,
}

static mut PT_STATS: PagetableStats = PagetableStats {
    total_pt_pages: 0,
    total_mappings: 0,
    kernel_pt_pages: 0,
};

/// the kernel's page table.
pub static mut KERNEL_PAGETABLE: *mut PageTable = core::ptr::null_mut();

pub fn vm_stats() -> (u64, u64, u64) {
    unsafe {
        (
            PT_STATS.total_pt_pages,
            PT_STATS.total_mappings,
            PT_STATS.kernel_pt_pages,
        )
    }
}

pub(crate) fn vm_stats_reset() {
    unsafe {
        PT_STATS.total_pt_pages = 0;
        PT_STATS.total_mappings = 0;
        PT_STATS.kernel_pt_pages = 0;
    }
}

/// Allocate an empty root page-table page.
/// Returns null if out of memory.
pub fn create_pagetable() -> *mut PageTable {
    let pg = alloc_page();
    if pg.is_null() {
        return core::ptr::null_mut();
    }
    memset(pg, 0, PGSIZE);
    unsafe {
        PT_STATS.total_pt_pages += 1;
    }
    pg as *mut PageTable
}

/// Return the address of the level-0 PTE in pagetable
/// that corresponds to virtual address va. If alloc is true,
/// create any required interior page-table pages.
///
/// A leaf PTE is reached by descending levels 2 and 1; a cleared
/// interior entry either stops the walk (alloc false) or is filled
/// with a fresh zeroed table page carrying the Valid bit alone.
pub fn walk(pagetable: *mut PageTable, va: usize, alloc: bool) -> *mut Pte {
    if va >= MAXVA {
        return core::ptr::null_mut();
    }

    let mut pagetable = pagetable;
    unsafe {
        for level in [2usize, 1] {
            let pte = &mut (*pagetable).0[PX!(level, va)];
            if pte.is_valid() {
                pagetable = pte.pa() as *mut PageTable;
            } else {
                if !alloc {
                    return core::ptr::null_mut();
                }
                let pg = alloc_page();
                if pg.is_null() {
                    return core::ptr::null_mut();
                }
                memset(pg, 0, PGSIZE);
                PT_STATS.total_pt_pages += 1;
                *pte = Pte::new(pg as usize, PteFlags::V);
                pagetable = pg as *mut PageTable;
            }
        }
        &mut (*pagetable).0[PX!(0, va)] as *mut Pte
    }
}

/// Look up a leaf PTE without allocating interior pages.
pub fn walk_lookup(pagetable: *mut PageTable, va: usize) -> *mut Pte {
    walk(pagetable, va, false)
}

/// Create PTEs for virtual addresses starting at va that refer to
/// physical addresses starting at pa. va and size might not
/// be page-aligned; every leaf in the range must be absent.
pub fn mappages(
    pagetable: *mut PageTable,
    va: usize,
    size: usize,
    pa: usize,
    perm: PteFlags,
) -> Result<(), MapError> {
    if size == 0 {
        panic!("mappages: size");
    }

    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);
    let mut pa = pa;

    loop {
        let pte = walk(pagetable, a, true);
        if pte.is_null() {
            return Err(MapError::NoMem);
        }
        unsafe {
            if (*pte).is_valid() {
                return Err(MapError::Remap);
            }
            *pte = Pte::new(pa, perm | PteFlags::V);
            PT_STATS.total_mappings += 1;
        }

        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }

    Ok(())
}

/// Map a single page.
pub fn map_page(
    pagetable: *mut PageTable,
    va: usize,
    pa: usize,
    perm: PteFlags,
) -> Result<(), MapError> {
    mappages(pagetable, va, PGSIZE, pa, perm)
}

/// Clear the leaf PTE for va. The leaf's physical page is not freed;
/// that is the caller's job.
pub fn unmap_page(pagetable: *mut PageTable, va: usize) {
    let pte = walk_lookup(pagetable, va);
    if pte.is_null() {
        return;
    }
    unsafe {
        if (*pte).is_valid() {
            *pte = Pte::INVALID;
            PT_STATS.total_mappings = PT_STATS.total_mappings.saturating_sub(1);
        }
    }
}

/// Translate a virtual address; returns the physical address including
/// the page offset, or 0 if va is not mapped.
pub fn walkaddr(pagetable: *mut PageTable, va: usize) -> usize {
    if va >= MAXVA {
        return 0;
    }

    let pte = walk_lookup(pagetable, va);
    if pte.is_null() {
        return 0;
    }
    unsafe {
        if !(*pte).is_valid() {
            return 0;
        }
        (*pte).pa() | (va & (PGSIZE - 1))
    }
}

/// Install the source range's mappings into dst with write permission
/// removed, sharing the physical pages. The store-fault half that would
/// complete copy-on-write does not exist, so this must not be used where
/// the source stays writable; fork takes private copies instead (see
/// copy_user_memory).
pub fn copy_pagetable_mapping(
    old: *mut PageTable,
    new: *mut PageTable,
    va: usize,
    size: usize,
) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }

    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);

    loop {
        let pte = walk_lookup(old, a);
        if !pte.is_null() && unsafe { (*pte).is_valid() } {
            let pa = unsafe { (*pte).pa() };
            let perm = unsafe { (*pte).flags() } & !PteFlags::W;
            map_page(new, a, pa, perm)?;
        }

        if a == last {
            break;
        }
        a += PGSIZE;
    }

    Ok(())
}

/// Give new a private copy of old's user memory in [0, sz): fresh
/// physical pages with identical contents and permissions. On failure
/// every page already copied is unmapped and freed.
pub fn copy_user_memory(
    old: *mut PageTable,
    new: *mut PageTable,
    sz: usize,
) -> Result<(), MapError> {
    let mut va = 0;
    while va < sz {
        let pte = walk_lookup(old, va);
        if pte.is_null() || !unsafe { (*pte).is_valid() } {
            panic!("copy_user_memory: page not present");
        }
        let pa = unsafe { (*pte).pa() };
        let flags = unsafe { (*pte).flags() };

        let mem = alloc_page();
        if mem.is_null() {
            undo_user_copy(new, va);
            return Err(MapError::NoMem);
        }
        memmove(mem, pa as *const u8, PGSIZE);

        if map_page(new, va, mem as usize, flags).is_err() {
            free_page(mem);
            undo_user_copy(new, va);
            return Err(MapError::NoMem);
        }

        va += PGSIZE;
    }
    Ok(())
}

// release the pages copy_user_memory installed before it failed.
fn undo_user_copy(new: *mut PageTable, upto: usize) {
    let mut va = 0;
    while va < upto {
        let pte = walk_lookup(new, va);
        if !pte.is_null() && unsafe { (*pte).is_valid() } {
            let pa = unsafe { (*pte).pa() };
            unsafe { *pte = Pte::INVALID };
            free_page(pa as *mut u8);
        }
        va += PGSIZE;
    }
}

// Recursively free interior page-table pages. Leaf mappings must already
// have been removed (their physical pages belong to the owner).
fn free_pagetable_recursive(pagetable: *mut PageTable, level: usize) {
    unsafe {
        for i in 0..(*pagetable).0.len() {
            let pte = (*pagetable).0[i];
            if pte.is_valid() {
                if pte.is_leaf() {
                    panic!("destroy_pagetable: leaf");
                }
                if level > 0 {
                    free_pagetable_recursive(pte.pa() as *mut PageTable, level - 1);
                }
            }
        }
    }
    free_page(pagetable as *mut u8);
    unsafe {
        PT_STATS.total_pt_pages = PT_STATS.total_pt_pages.saturating_sub(1);
    }
}

/// Free an address space's table pages. Every leaf must have been
/// unmapped (and its page freed) by the owner beforehand.
pub fn destroy_pagetable(pagetable: *mut PageTable) {
    if pagetable.is_null() {
        return;
    }
    free_pagetable_recursive(pagetable, 2);
}

/// Build the kernel address space: the kernel image and the RAM it
/// manages, plus the UART and CLINT device windows.
pub fn kvminit() {
    let kpgtbl = create_pagetable();
    if kpgtbl.is_null() {
        panic!("kvminit: create_pagetable failed");
    }
    unsafe {
        KERNEL_PAGETABLE = kpgtbl;
        PT_STATS.kernel_pt_pages = 1;
    }

    // uart registers
    kvmmap(kpgtbl, UART0, UART0, PGSIZE, PteFlags::R | PteFlags::W);

    // CLINT, which holds mtime/mtimecmp
    kvmmap(kpgtbl, CLINT, CLINT, 0x10000, PteFlags::R | PteFlags::W);

    #[cfg(target_os = "none")]
    {
        extern "C" {
            static etext: u8; // kernel.ld sets this to end of kernel code.
        }
        use crate::memlayout::{KERNBASE, PHYSTOP};
        let etext_addr = unsafe { core::ptr::addr_of!(etext) as usize };

        // kernel text, executable and read-only.
        kvmmap(
            kpgtbl,
            KERNBASE,
            KERNBASE,
            etext_addr - KERNBASE,
            PteFlags::R | PteFlags::X,
        );
        // kernel data and the physical RAM we manage.
        kvmmap(
            kpgtbl,
            etext_addr,
            etext_addr,
            PHYSTOP - etext_addr,
            PteFlags::R | PteFlags::W,
        );
    }
    #[cfg(not(target_os = "none"))]
    {
        // hosted: the managed RAM window appears at KERNBASE.
        use crate::memlayout::KERNBASE;
        kvmmap(
            kpgtbl,
            KERNBASE,
            crate::sim::ram_base(),
            crate::sim::ram_size(),
            PteFlags::R | PteFlags::W,
        );
    }

    log::info!("kvm: kernel page table built");
}

// add a mapping to the kernel page table.
// only used when booting; does not flush the TLB.
fn kvmmap(kpgtbl: *mut PageTable, va: usize, pa: usize, sz: usize, perm: PteFlags) {
    if mappages(kpgtbl, va, sz, pa, perm).is_err() {
        panic!("kvmmap");
    }
}

/// Switch the hart to the kernel page table and flush stale translations.
pub fn kvminithart() {
    unsafe {
        w_satp(MAKE_SATP!(KERNEL_PAGETABLE as usize));
    }
    sfence_vma();
}

//
// user-memory access. Every transfer between a user address space and
// the kernel goes through these, one page-sized chunk at a time, with a
// fresh translation per page.
//

/// Copy len bytes from src to user address dstva in pagetable.
/// Return 0 on success, -1 on a missing mapping.
pub fn copyout_user(pagetable: *mut PageTable, dstva: usize, src: *const u8, len: usize) -> i32 {
    let mut dstva = dstva;
    let mut src = src;
    let mut len = len;

    while len > 0 {
        let va0 = PGROUNDDOWN!(dstva);
        if va0 >= MAXVA {
            return -1;
        }
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return -1;
        }
        let mut n = PGSIZE - (dstva - va0);
        if n > len {
            n = len;
        }
        memmove((pa0 + (dstva - va0)) as *mut u8, src, n);

        len -= n;
        src = unsafe { src.add(n) };
        dstva = va0 + PGSIZE;
    }
    0
}

/// Copy len bytes from user address srcva in pagetable to dst.
/// Return 0 on success, -1 on a missing mapping.
pub fn copyin_user(pagetable: *mut PageTable, dst: *mut u8, srcva: usize, len: usize) -> i32 {
    let mut srcva = srcva;
    let mut dst = dst;
    let mut len = len;

    while len > 0 {
        let va0 = PGROUNDDOWN!(srcva);
        if va0 >= MAXVA {
            return -1;
        }
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return -1;
        }
        let mut n = PGSIZE - (srcva - va0);
        if n > len {
            n = len;
        }
        memmove(dst, (pa0 + (srcva - va0)) as *const u8, n);

        len -= n;
        dst = unsafe { dst.add(n) };
        srcva = va0 + PGSIZE;
    }
    0
}

/// Copy a NUL-terminated string from user address srcva into buf.
/// Returns the string length (not counting the NUL), or -1 if the
/// buffer filled up or a mapping was missing.
pub fn copyinstr_user(pagetable: *mut PageTable, buf: &mut [u8], srcva: usize) -> i32 {
    let max = buf.len();
    let mut srcva = srcva;
    let mut i = 0;

    while i < max {
        let va0 = PGROUNDDOWN!(srcva);
        if va0 >= MAXVA {
            return -1;
        }
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return -1;
        }

        let mut off = srcva - va0;
        while off < PGSIZE && i < max {
            let c = unsafe { *((pa0 + off) as *const u8) };
            buf[i] = c;
            if c == 0 {
                return i as i32;
            }
            i += 1;
            off += 1;
        }
        srcva = va0 + PGSIZE;
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::{alloc_page, free_pages};
    use crate::ktest;

    #[test]
    fn map_and_translate() {
        ktest::run(|| {
            let pt = create_pagetable();
            assert!(!pt.is_null());

            let va = 0x100_0000;
            let pa = alloc_page() as usize;
            assert!(map_page(pt, va, pa, PteFlags::R | PteFlags::W).is_ok());

            assert_eq!(walkaddr(pt, va), pa);
            assert_eq!(walkaddr(pt, va + 0x20), pa + 0x20);

            let pte = walk_lookup(pt, va);
            assert!(!pte.is_null());
            let flags = unsafe { (*pte).flags() };
            assert!(flags.contains(PteFlags::V | PteFlags::R | PteFlags::W));
            assert!(!flags.contains(PteFlags::X));

            unmap_page(pt, va);
            free_page(pa as *mut u8);
            destroy_pagetable(pt);
        });
    }

    #[test]
    fn remap_is_rejected() {
        ktest::run(|| {
            let pt = create_pagetable();
            let pa = alloc_page() as usize;
            assert!(map_page(pt, 0x1000, pa, PteFlags::R).is_ok());
            assert_eq!(map_page(pt, 0x1000, pa, PteFlags::R), Err(MapError::Remap));
            unmap_page(pt, 0x1000);
            free_page(pa as *mut u8);
            destroy_pagetable(pt);
        });
    }

    #[test]
    fn high_addresses_are_rejected() {
        ktest::run(|| {
            let pt = create_pagetable();
            assert!(walk(pt, MAXVA, true).is_null());
            assert_eq!(walkaddr(pt, MAXVA + PGSIZE), 0);
            destroy_pagetable(pt);
        });
    }

    #[test]
    fn unmap_leaves_page_to_caller() {
        ktest::run(|| {
            let pt = create_pagetable();
            let pa = alloc_page() as usize;
            map_page(pt, 0x4000, pa, PteFlags::R | PteFlags::W).unwrap();
            unmap_page(pt, 0x4000);
            assert_eq!(walkaddr(pt, 0x4000), 0);
            // the physical page is still ours to free.
            free_page(pa as *mut u8);
            destroy_pagetable(pt);
        });
    }

    #[test]
    fn destroy_returns_interior_pages() {
        ktest::run(|| {
            let before = free_pages();
            let pt = create_pagetable();
            let pa1 = alloc_page() as usize;
            let pa2 = alloc_page() as usize;
            // two VAs with distinct level-2 indices, so the root fans out
            // into two separate interior chains.
            let va1 = 0x100_0000; // PX(2) = 0
            let va2 = 0x2_0000_0000; // PX(2) = 8
            map_page(pt, va1, pa1, PteFlags::R).unwrap();
            map_page(pt, va2, pa2, PteFlags::R).unwrap();
            // root + two level-1 + two level-0 tables + two leaf pages.
            assert_eq!(free_pages(), before - 7);

            unmap_page(pt, va1);
            unmap_page(pt, va2);
            free_page(pa1 as *mut u8);
            free_page(pa2 as *mut u8);
            destroy_pagetable(pt);
            assert_eq!(free_pages(), before);
        });
    }

    #[test]
    fn shared_mapping_drops_write_bit() {
        ktest::run(|| {
            let src = create_pagetable();
            let dst = create_pagetable();
            let pa = alloc_page() as usize;
            map_page(src, 0, pa, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

            copy_pagetable_mapping(src, dst, 0, PGSIZE).unwrap();

            let pte = walk_lookup(dst, 0);
            let flags = unsafe { (*pte).flags() };
            assert!(flags.contains(PteFlags::R | PteFlags::U));
            assert!(!flags.contains(PteFlags::W));
            assert_eq!(walkaddr(dst, 0), pa);

            unmap_page(src, 0);
            unmap_page(dst, 0);
            free_page(pa as *mut u8);
            destroy_pagetable(src);
            destroy_pagetable(dst);
        });
    }

    #[test]
    fn deep_copy_is_private() {
        ktest::run(|| {
            let src = create_pagetable();
            let dst = create_pagetable();
            let pa = alloc_page();
            unsafe { *pa = 0x5a };
            map_page(src, 0, pa as usize, PteFlags::R | PteFlags::W).unwrap();

            copy_user_memory(src, dst, PGSIZE).unwrap();

            let copy = walkaddr(dst, 0);
            assert_ne!(copy, pa as usize);
            unsafe {
                assert_eq!(*(copy as *const u8), 0x5a);
                *pa = 0x11;
                assert_eq!(*(copy as *const u8), 0x5a);
            }

            unmap_page(src, 0);
            free_page(pa);
            unmap_page(dst, 0);
            free_page(copy as *mut u8);
            destroy_pagetable(src);
            destroy_pagetable(dst);
        });
    }

    #[test]
    fn user_copies_roundtrip() {
        ktest::run(|| {
            let pt = create_pagetable();
            let pa = alloc_page();
            let va = 0x40_0000;
            map_page(pt, va, pa as usize, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

            let msg = b"user copy roundtrip\0";
            assert_eq!(copyout_user(pt, va + 100, msg.as_ptr(), msg.len()), 0);

            let mut back = [0u8; 32];
            assert_eq!(copyin_user(pt, back.as_mut_ptr(), va + 100, msg.len()), 0);
            assert_eq!(&back[..msg.len()], msg);

            let mut s = [0u8; 32];
            let n = copyinstr_user(pt, &mut s, va + 100);
            assert_eq!(n as usize, msg.len() - 1);

            // an unmapped address fails cleanly.
            assert_eq!(copyout_user(pt, va + 16 * PGSIZE, msg.as_ptr(), 4), -1);

            unmap_page(pt, va);
            free_page(pa);
            destroy_pagetable(pt);
        });
    }
}
