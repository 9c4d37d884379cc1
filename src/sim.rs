// The simulated machine for hosted builds.
//
// Stands in for the qemu-virt board: a page-aligned RAM window managed by
// the allocator, the CSR register file, the CLINT (mtime/mtimecmp), and a
// UART whose output is captured in a ring (and optionally forwarded to a
// host sink). The kernel proper never knows which backend it is on; it
// goes through riscv.rs and uart.rs for everything here.
//
// mtime advances a little on every read, so code that polls the clock
// (the scheduler idle loop, timer tests) observes forward progress.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::riscv::{
    MIE_MTIE, MSTATUS_MIE, SIE_SSIE, SIP_SSIP, SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP, PGSIZE,
};
use crate::CLINT_MTIMECMP;
use crate::memlayout::CLINT_MTIME;

// ---------------------------------------------------------------- RAM

const SIM_RAM_PAGES: usize = 2048; // 8 MiB of managed "physical" memory

#[repr(C, align(4096))]
struct Ram([u8; SIM_RAM_PAGES * PGSIZE]);

static mut RAM: Ram = Ram([0; SIM_RAM_PAGES * PGSIZE]);

/// Base host address of the simulated physical memory window.
pub fn ram_base() -> usize {
    unsafe { RAM.0.as_ptr() as usize }
}

pub fn ram_size() -> usize {
    SIM_RAM_PAGES * PGSIZE
}

pub fn ram_top() -> usize {
    ram_base() + ram_size()
}

// ---------------------------------------------------------------- CSRs

#[derive(Copy, Clone)]
pub enum Csr {
    Mstatus,
    Mepc,
    Sstatus,
    Sip,
    Sie,
    Mie,
    Sepc,
    Medeleg,
    Mideleg,
    Stvec,
    Mtvec,
    Satp,
    Mscratch,
    Scause,
    Stval,
}

const NCSR: usize = 15;

static CSRS: [AtomicU64; NCSR] = [const { AtomicU64::new(0) }; NCSR];

pub fn csr_read(c: Csr) -> u64 {
    CSRS[c as usize].load(Ordering::Relaxed)
}

pub fn csr_write(c: Csr, x: u64) {
    CSRS[c as usize].store(x, Ordering::Relaxed)
}

// ---------------------------------------------------------------- CLINT

const MTIME_TICK: u64 = 500; // cycles added per mtime read

static MTIME: AtomicU64 = AtomicU64::new(0);
static MTIMECMP: AtomicU64 = AtomicU64::new(u64::MAX);

pub fn mtime_read() -> u64 {
    MTIME.fetch_add(MTIME_TICK, Ordering::Relaxed) + MTIME_TICK
}

/// A load from the machine's physical bus (CLINT window only).
pub fn mmio_read64(addr: usize) -> u64 {
    if addr == CLINT_MTIMECMP!(0) {
        MTIMECMP.load(Ordering::Relaxed)
    } else if addr == CLINT_MTIME {
        mtime_read()
    } else {
        panic!("sim: mmio read {:#x}", addr);
    }
}

pub fn mmio_write64(addr: usize, val: u64) {
    if addr == CLINT_MTIMECMP!(0) {
        MTIMECMP.store(val, Ordering::Relaxed);
    } else {
        panic!("sim: mmio write {:#x}", addr);
    }
}

/// The machine side of the timer: what the M-mode trampoline does when the
/// comparator fires. Advances the comparator by the interval stored in the
/// scratch area and forwards the interrupt to supervisor software, then
/// enters the installed supervisor vector if S-mode interrupts are open.
///
/// Called from the scheduler idle path and from tests, i.e. at points
/// where real hardware could take the interrupt.
pub fn clint_pump() {
    let now = mtime_read();

    // the comparator fired: reload it through the address recorded in
    // the scratch area and post a supervisor soft interrupt (timervec).
    if now >= MTIMECMP.load(Ordering::Relaxed)
        && csr_read(Csr::Mie) & MIE_MTIE != 0
        && csr_read(Csr::Mstatus) & MSTATUS_MIE != 0
    {
        let scratch = csr_read(Csr::Mscratch) as usize;
        if scratch != 0 {
            unsafe {
                let interval = *((scratch + 24) as *const u64);
                let cmp_addr = *((scratch + 32) as *const u64) as usize;
                mmio_write64(cmp_addr, now + interval);
            }
        }
        csr_write(Csr::Sip, csr_read(Csr::Sip) | SIP_SSIP);
    }

    // deliver any pending soft interrupt through stvec. Trap entry
    // clears SIE (stashing it in SPIE); the vector's sret restores it,
    // which here is the store after the call.
    let sstatus = csr_read(Csr::Sstatus);
    if csr_read(Csr::Sip) & SIP_SSIP != 0
        && sstatus & SSTATUS_SIE != 0
        && csr_read(Csr::Sie) & SIE_SSIE != 0
    {
        csr_write(Csr::Scause, (1 << 63) | 1);
        csr_write(Csr::Sstatus, (sstatus & !SSTATUS_SIE) | SSTATUS_SPIE | SSTATUS_SPP);
        let stvec = csr_read(Csr::Stvec) as usize;
        if stvec != 0 {
            let vector: extern "C" fn() = unsafe { core::mem::transmute(stvec) };
            vector();
        }
        csr_write(Csr::Sstatus, sstatus);
    }
}

// ---------------------------------------------------------------- UART

const UART_OUT: usize = 64 * 1024;
const UART_IN: usize = 256;

static mut OUT_BUF: [u8; UART_OUT] = [0; UART_OUT];
static mut OUT_R: usize = 0;
static mut OUT_W: usize = 0;

static mut IN_BUF: [u8; UART_IN] = [0; UART_IN];
static mut IN_R: usize = 0;
static mut IN_W: usize = 0;

// Optional host sink: the demo binary points this at stdout.
static SINK: AtomicUsize = AtomicUsize::new(0);

pub fn set_console_sink(f: fn(u8)) {
    SINK.store(f as usize, Ordering::Relaxed);
}

pub fn uart_write_byte(b: u8) {
    unsafe {
        OUT_BUF[OUT_W % UART_OUT] = b;
        OUT_W += 1;
        if OUT_W - OUT_R > UART_OUT {
            OUT_R = OUT_W - UART_OUT; // overwrite oldest
        }
    }
    let sink = SINK.load(Ordering::Relaxed);
    if sink != 0 {
        let f: fn(u8) = unsafe { core::mem::transmute(sink) };
        f(b);
    }
}

/// Pull captured output, oldest first. Returns bytes copied.
pub fn uart_drain(dst: &mut [u8]) -> usize {
    let mut n = 0;
    unsafe {
        while OUT_R < OUT_W && n < dst.len() {
            dst[n] = OUT_BUF[OUT_R % UART_OUT];
            OUT_R += 1;
            n += 1;
        }
    }
    n
}

/// Queue bytes as if typed on the serial line.
pub fn uart_push_input(bytes: &[u8]) {
    unsafe {
        for &b in bytes {
            if IN_W - IN_R < UART_IN {
                IN_BUF[IN_W % UART_IN] = b;
                IN_W += 1;
            }
        }
    }
}

pub fn uart_read_byte() -> i32 {
    unsafe {
        if IN_R == IN_W {
            -1
        } else {
            let b = IN_BUF[IN_R % UART_IN];
            IN_R += 1;
            b as i32
        }
    }
}

// ---------------------------------------------------------------- reset

/// Power-cycle the machine: registers cleared, clock rewound, UART rings
/// emptied. RAM contents survive (the allocator re-wipes pages as it
/// rebuilds its free list), which is what lets crash-recovery tests
/// "reboot" with the disk intact.
pub fn machine_reset() {
    for c in &CSRS {
        c.store(0, Ordering::Relaxed);
    }
    MTIME.store(0, Ordering::Relaxed);
    MTIMECMP.store(u64::MAX, Ordering::Relaxed);
    unsafe {
        OUT_R = 0;
        OUT_W = 0;
        IN_R = 0;
        IN_W = 0;
    }
}
