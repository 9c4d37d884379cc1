// RISC-V privileged-architecture access.
//
// On target_os = "none" every accessor is the real csrr/csrw instruction.
// On a hosted build the CSRs are cells owned by sim.rs, so the rest of the
// kernel reads and writes "hardware" state the same way on both backends.

use bitflags::bitflags;

// Machine Status Register, mstatus
pub const MSTATUS_MPP_MASK: u64 = 3 << 11; // previous mode.
pub const MSTATUS_MPP_M: u64 = 3 << 11;
pub const MSTATUS_MPP_S: u64 = 1 << 11;
pub const MSTATUS_MIE: u64 = 1 << 3; // machine-mode interrupt enable.

// Supervisor Status Register, sstatus
pub const SSTATUS_SPP: u64 = 1 << 8; // Previous mode, 1=Supervisor, 0=User
pub const SSTATUS_SPIE: u64 = 1 << 5; // Supervisor Previous Interrupt Enable
pub const SSTATUS_SIE: u64 = 1 << 1; // Supervisor Interrupt Enable

// Supervisor Interrupt Enable / Pending bits
pub const SIE_SEIE: u64 = 1 << 9; // external
pub const SIE_STIE: u64 = 1 << 5; // timer
pub const SIE_SSIE: u64 = 1 << 1; // software
pub const SIP_SSIP: u64 = 1 << 1; // software pending

// Machine-mode Interrupt Enable
pub const MIE_MEIE: u64 = 1 << 11; // external
pub const MIE_MTIE: u64 = 1 << 7; // timer
pub const MIE_MSIE: u64 = 1 << 3; // software

#[cfg(target_os = "none")]
mod csr {
    use core::arch::asm;

    macro_rules! csr_read {
        ( $name:ident, $csr:literal, $t:ty ) => {
            pub fn $name() -> $t {
                let x: $t;
                unsafe { asm!(concat!("csrr {}, ", $csr), out(reg) x) }
                x
            }
        };
    }
    macro_rules! csr_write {
        ( $name:ident, $csr:literal, $t:ty ) => {
            pub fn $name(x: $t) {
                unsafe { asm!(concat!("csrw ", $csr, ", {}"), in(reg) x) }
            }
        };
    }

    csr_read!(r_mstatus, "mstatus", u64);
    csr_write!(w_mstatus, "mstatus", u64);
    csr_write!(w_mepc, "mepc", usize);
    csr_read!(r_sstatus, "sstatus", u64);
    csr_write!(w_sstatus, "sstatus", u64);
    csr_read!(r_sip, "sip", u64);
    csr_write!(w_sip, "sip", u64);
    csr_read!(r_sie, "sie", u64);
    csr_write!(w_sie, "sie", u64);
    csr_read!(r_mie, "mie", u64);
    csr_write!(w_mie, "mie", u64);
    csr_read!(r_sepc, "sepc", usize);
    csr_write!(w_sepc, "sepc", usize);
    csr_write!(w_medeleg, "medeleg", u64);
    csr_write!(w_mideleg, "mideleg", u64);
    csr_read!(r_stvec, "stvec", usize);
    csr_write!(w_stvec, "stvec", usize);
    csr_write!(w_mtvec, "mtvec", usize);
    csr_read!(r_satp, "satp", usize);
    csr_write!(w_satp, "satp", usize);
    csr_write!(w_mscratch, "mscratch", usize);
    csr_read!(r_scause, "scause", u64);
    csr_read!(r_stval, "stval", u64);
    csr_read!(r_time, "time", u64);

    // flush the TLB.
    pub fn sfence_vma() {
        unsafe { asm!("sfence.vma zero, zero") }
    }

    // a memory-mapped machine register (UART, CLINT).
    pub unsafe fn mmio_read64(addr: usize) -> u64 {
        (addr as *const u64).read_volatile()
    }
    pub unsafe fn mmio_write64(addr: usize, val: u64) {
        (addr as *mut u64).write_volatile(val)
    }
}

#[cfg(not(target_os = "none"))]
mod csr {
    // Hosted backend: the simulated machine owns the register file.
    use crate::sim;

    pub fn r_mstatus() -> u64 {
        sim::csr_read(sim::Csr::Mstatus)
    }
    pub fn w_mstatus(x: u64) {
        sim::csr_write(sim::Csr::Mstatus, x)
    }
    pub fn w_mepc(x: usize) {
        sim::csr_write(sim::Csr::Mepc, x as u64)
    }
    pub fn r_sstatus() -> u64 {
        sim::csr_read(sim::Csr::Sstatus)
    }
    pub fn w_sstatus(x: u64) {
        sim::csr_write(sim::Csr::Sstatus, x)
    }
    pub fn r_sip() -> u64 {
        sim::csr_read(sim::Csr::Sip)
    }
    pub fn w_sip(x: u64) {
        sim::csr_write(sim::Csr::Sip, x)
    }
    pub fn r_sie() -> u64 {
        sim::csr_read(sim::Csr::Sie)
    }
    pub fn w_sie(x: u64) {
        sim::csr_write(sim::Csr::Sie, x)
    }
    pub fn r_mie() -> u64 {
        sim::csr_read(sim::Csr::Mie)
    }
    pub fn w_mie(x: u64) {
        sim::csr_write(sim::Csr::Mie, x)
    }
    pub fn r_sepc() -> usize {
        sim::csr_read(sim::Csr::Sepc) as usize
    }
    pub fn w_sepc(x: usize) {
        sim::csr_write(sim::Csr::Sepc, x as u64)
    }
    pub fn w_medeleg(x: u64) {
        sim::csr_write(sim::Csr::Medeleg, x)
    }
    pub fn w_mideleg(x: u64) {
        sim::csr_write(sim::Csr::Mideleg, x)
    }
    pub fn r_stvec() -> usize {
        sim::csr_read(sim::Csr::Stvec) as usize
    }
    pub fn w_stvec(x: usize) {
        sim::csr_write(sim::Csr::Stvec, x as u64)
    }
    pub fn w_mtvec(x: usize) {
        sim::csr_write(sim::Csr::Mtvec, x as u64)
    }
    pub fn r_satp() -> usize {
        sim::csr_read(sim::Csr::Satp) as usize
    }
    pub fn w_satp(x: usize) {
        sim::csr_write(sim::Csr::Satp, x as u64)
    }
    pub fn w_mscratch(x: usize) {
        sim::csr_write(sim::Csr::Mscratch, x as u64)
    }
    pub fn r_scause() -> u64 {
        sim::csr_read(sim::Csr::Scause)
    }
    pub fn r_stval() -> u64 {
        sim::csr_read(sim::Csr::Stval)
    }
    pub fn r_time() -> u64 {
        sim::mtime_read()
    }

    pub fn sfence_vma() {}

    pub unsafe fn mmio_read64(addr: usize) -> u64 {
        sim::mmio_read64(addr)
    }
    pub unsafe fn mmio_write64(addr: usize, val: u64) {
        sim::mmio_write64(addr, val)
    }
}

pub use csr::*;

// enable device interrupts
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

// disable device interrupts
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

// are device interrupts enabled?
pub fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

// use riscv's sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

#[macro_export]
macro_rules! MAKE_SATP {
    ( $x:expr ) => {
        $crate::riscv::SATP_SV39 | (($x) >> 12)
    };
}

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

#[macro_export]
macro_rules! PGROUNDUP {
    ( $sz:expr ) => {
        (($sz) as usize + $crate::riscv::PGSIZE - 1) & !($crate::riscv::PGSIZE - 1)
    };
}
#[macro_export]
macro_rules! PGROUNDDOWN {
    ( $a:expr ) => {
        ($a) as usize & !($crate::riscv::PGSIZE - 1)
    };
}

bitflags! {
    /// Permission/flag bits in the low ten bits of a PTE.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: usize {
        const V = 1 << 0; // valid
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4; // user can access
    }
}

pub const PTE_FLAG_MASK: usize = 0x3FF;

/// Sv39 page-table entry: physical page number in bits 10..54, flags below.
/// Leaf when any of R/W/X is set, interior otherwise.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct Pte(pub usize);

impl Pte {
    pub const INVALID: Pte = Pte(0);

    // combine a physical address and flags into an entry.
    pub fn new(pa: usize, flags: PteFlags) -> Self {
        Pte(((pa >> 12) << 10) | flags.bits())
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    pub fn pa(&self) -> usize {
        (self.0 >> 10) << 12
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }
}

pub const NPTE: usize = PGSIZE / 8; // 512 entries per table page

/// One page worth of PTEs; a page table is three levels of these.
#[repr(C, align(4096))]
pub struct PageTable(pub [Pte; NPTE]);

// extract the three 9-bit page table indices from a virtual address.
pub const PXMASK: usize = 0x1FF; // 9 bits

#[macro_export]
macro_rules! PXSHIFT {
    ( $level:expr ) => {
        $crate::riscv::PGSHIFT + 9 * ($level)
    };
}
#[macro_export]
macro_rules! PX {
    ( $level:expr, $va:expr ) => {
        (($va) >> $crate::PXSHIFT!($level)) & $crate::riscv::PXMASK
    };
}

// one beyond the highest possible virtual address.
// MAXVA is actually one bit less than the max allowed by
// Sv39, to avoid having to sign-extend virtual addresses
// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
