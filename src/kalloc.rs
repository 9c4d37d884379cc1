// Physical memory allocator, for user pages, kernel stacks, page-table
// pages. Allocates whole 4096-byte pages from the RAM between the end of
// the kernel image and PHYSTOP, threaded into a free list through the
// first word of each free page.

use crate::param::MAXCONTIG;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

#[cfg(target_os = "none")]
extern "C" {
    // first address after kernel.
    // defined by kernel.ld.
    static end: u8;
}

// the managed physical range [first page, one past last].
fn pmem_bounds() -> (usize, usize) {
    #[cfg(target_os = "none")]
    unsafe {
        (
            core::ptr::addr_of!(end) as usize,
            crate::memlayout::PHYSTOP,
        )
    }
    #[cfg(not(target_os = "none"))]
    {
        (crate::sim::ram_base(), crate::sim::ram_top())
    }
}

struct Run {
    next: *mut Run,
}

pub struct KMem {
    lock: Spinlock,
    freelist: *mut Run,
    total_pages: u64,
    allocated_pages: u64,
    free_pages: u64,
}

static mut KMEM: KMem = KMem {
    lock: Spinlock::init_lock("kmem"),
    freelist: core::ptr::null_mut(),
    total_pages: 0,
    allocated_pages: 0,
    free_pages: 0,
};

/// Put every page between the end of the kernel image and PHYSTOP on the
/// free list.
pub fn pmem_init() {
    unsafe {
        KMEM.freelist = core::ptr::null_mut();
        KMEM.total_pages = 0;
        KMEM.allocated_pages = 0;
        KMEM.free_pages = 0;
    }

    let (lo, hi) = pmem_bounds();
    let mut p = PGROUNDUP!(lo);
    while p + PGSIZE <= hi {
        free_page(p as *mut u8);
        p += PGSIZE;
    }

    unsafe {
        KMEM.total_pages = KMEM.free_pages;
        KMEM.allocated_pages = 0;
        log::info!("pmem: {} pages available", KMEM.total_pages);
    }
}

/// Allocate one 4096-byte page of physical memory.
/// Returns a pointer that the kernel can use,
/// or null if the memory cannot be allocated.
pub fn alloc_page() -> *mut u8 {
    let r;
    unsafe {
        KMEM.lock.acquire();
        r = KMEM.freelist;
        if !r.is_null() {
            KMEM.freelist = (*r).next;
            KMEM.allocated_pages += 1;
            KMEM.free_pages -= 1;
        }
        KMEM.lock.release();
    }

    if !r.is_null() {
        memset(r as *mut u8, 0xAA, PGSIZE); // fill with junk
    }
    r as *mut u8
}

/// Free the page of physical memory pointed at by pa,
/// which normally should have been returned by a
/// call to alloc_page(). (The exception is when
/// initializing the allocator; see pmem_init above.)
pub fn free_page(pa: *mut u8) {
    if pa.is_null() {
        panic!("free_page: null pointer");
    }
    if pa as usize % PGSIZE != 0 {
        panic!("free_page: not page aligned");
    }
    let (lo, hi) = pmem_bounds();
    if (pa as usize) < lo || pa as usize >= hi {
        panic!("free_page: out of range");
    }

    // wipe the page so stale data cannot leak to the next owner.
    memset(pa, 0, PGSIZE);

    let r = pa as *mut Run;
    unsafe {
        KMEM.lock.acquire();
        (*r).next = KMEM.freelist;
        KMEM.freelist = r;
        KMEM.allocated_pages = KMEM.allocated_pages.saturating_sub(1);
        KMEM.free_pages += 1;
        KMEM.lock.release();
    }
}

/// Best-effort allocation of n physically contiguous pages; the free list
/// has no address order, so grab n pages and keep them only if they form
/// a run. Returns the lowest page of the run, or null after a bounded
/// number of attempts.
pub fn alloc_pages(n: usize) -> *mut u8 {
    if n == 0 || n > MAXCONTIG {
        return core::ptr::null_mut();
    }
    if n == 1 {
        return alloc_page();
    }

    let mut pages = [0usize; MAXCONTIG];
    for _attempt in 0..10 {
        let mut got = 0;
        while got < n {
            let p = alloc_page();
            if p.is_null() {
                break;
            }
            pages[got] = p as usize;
            got += 1;
        }
        if got < n {
            for &p in &pages[..got] {
                free_page(p as *mut u8);
            }
            return core::ptr::null_mut();
        }

        // insertion sort; n is tiny.
        for i in 1..n {
            let mut j = i;
            while j > 0 && pages[j - 1] > pages[j] {
                pages.swap(j - 1, j);
                j -= 1;
            }
        }

        let contiguous = (1..n).all(|i| pages[i] == pages[i - 1] + PGSIZE);
        if contiguous {
            return pages[0] as *mut u8;
        }
        for &p in &pages[..n] {
            free_page(p as *mut u8);
        }
    }

    core::ptr::null_mut()
}

/// The managed physical range, for callers that must decide whether an
/// address is kernel RAM.
pub fn pmem_range() -> (usize, usize) {
    pmem_bounds()
}

pub fn total_pages() -> u64 {
    unsafe { KMEM.total_pages }
}

pub fn allocated_pages() -> u64 {
    unsafe { KMEM.allocated_pages }
}

pub fn free_pages() -> u64 {
    unsafe { KMEM.free_pages }
}
