// Trap setup and dispatch, and the CLINT timer.
//
// Machine mode owns the timer: timervec (by contract an assembly
// trampoline, modeled by the simulator on hosted builds) reloads the
// comparator from the scratch area and forwards the event to supervisor
// software. Supervisor mode sees everything else through kernelvec ->
// kerneltrap: the tick handler, syscalls, and faults.

use crate::proc::{myproc, sleep, wakeup, yield_proc, Procstate};
use crate::riscv::{
    mmio_write64, r_mie, r_mstatus, r_scause, r_sepc, r_sie, r_sip, r_sstatus, r_time, w_medeleg,
    w_mideleg, w_mie, w_mscratch, w_mstatus, w_mtvec, w_sepc, w_sie, w_sip, w_stvec, MIE_MTIE,
    MSTATUS_MIE, SIE_SEIE, SIE_SSIE, SIE_STIE, SIP_SSIP, SSTATUS_SPP,
};
use crate::spinlock::Spinlock;
use crate::syscall::syscall;
use crate::CLINT_MTIMECMP;
use crate::printf;

// scause exception codes (RISC-V privileged spec).
const CAUSE_ILLEGAL_INSTRUCTION: u64 = 0x2;
const CAUSE_BREAKPOINT: u64 = 0x3;
const CAUSE_USER_ECALL: u64 = 0x8;
const CAUSE_SUPERVISOR_ECALL: u64 = 0x9;
const CAUSE_INSTRUCTION_PAGE_FAULT: u64 = 0xC;
const CAUSE_LOAD_PAGE_FAULT: u64 = 0xD;
const CAUSE_STORE_PAGE_FAULT: u64 = 0xF;

// scause interrupt codes.
const IRQ_S_SOFT: u64 = 1;
const IRQ_S_TIMER: u64 = 5;
const IRQ_S_EXT: u64 = 9;

const INTERRUPT: u64 = 1 << 63;

const TIMER_INTERVAL: u64 = 10_000;

pub static mut TICKS: u64 = 0;
static mut TICKS_LOCK: Spinlock = Spinlock::init_lock("time");

// Machine-mode scratch area, laid out as the timer trampoline expects:
// three save slots, then the interval, then the comparator's address.
#[repr(C)]
struct TimerScratch {
    saved: [u64; 3],
    interval: u64,
    mtimecmp: u64,
}

static mut TIMER_SCRATCH: TimerScratch = TimerScratch {
    saved: [0; 3],
    interval: 0,
    mtimecmp: 0,
};

// supervisor trap vector: an assembly trampoline on the board (saves all
// registers, calls kerneltrap, restores, sret), a plain call when the
// machine is simulated.
#[cfg(target_os = "none")]
fn kernelvec_addr() -> usize {
    extern "C" {
        static kernelvec: u8;
    }
    unsafe { core::ptr::addr_of!(kernelvec) as usize }
}

#[cfg(not(target_os = "none"))]
pub extern "C" fn kernelvec() {
    kerneltrap();
}

#[cfg(not(target_os = "none"))]
fn kernelvec_addr() -> usize {
    kernelvec as usize
}

#[cfg(target_os = "none")]
fn timervec_addr() -> usize {
    extern "C" {
        static timervec: u8;
    }
    unsafe { core::ptr::addr_of!(timervec) as usize }
}

#[cfg(not(target_os = "none"))]
fn timervec_addr() -> usize {
    crate::sim::clint_pump as usize
}

/// Arrange for timer interrupts and take the first deadline.
fn timer_init() {
    w_mtvec(timervec_addr());

    unsafe {
        TIMER_SCRATCH.saved = [0; 3];
        TIMER_SCRATCH.interval = TIMER_INTERVAL;
        TIMER_SCRATCH.mtimecmp = CLINT_MTIMECMP!(0) as u64;
        w_mscratch(core::ptr::addr_of!(TIMER_SCRATCH) as usize);
    }

    w_mie(r_mie() | MIE_MTIE);
    w_mstatus(r_mstatus() | MSTATUS_MIE);

    timer_set_next();
}

/// Program the comparator one interval into the future.
pub fn timer_set_next() {
    unsafe {
        let next = r_time() + TIMER_SCRATCH.interval;
        mmio_write64(TIMER_SCRATCH.mtimecmp as usize, next);
    }
}

/// Install the trap vectors, delegate the user-visible traps to
/// supervisor mode, and start the timer.
pub fn trap_init() {
    unsafe {
        TICKS = 0;
    }

    w_stvec(kernelvec_addr());

    // interrupts and exceptions a user program can cause are handled
    // in supervisor mode.
    w_mideleg((1 << IRQ_S_TIMER) | (1 << IRQ_S_EXT) | (1 << IRQ_S_SOFT));
    w_medeleg(
        (1 << CAUSE_USER_ECALL)
            | (1 << CAUSE_BREAKPOINT)
            | (1 << CAUSE_ILLEGAL_INSTRUCTION)
            | (1 << CAUSE_INSTRUCTION_PAGE_FAULT)
            | (1 << CAUSE_LOAD_PAGE_FAULT)
            | (1 << CAUSE_STORE_PAGE_FAULT),
    );

    timer_init();

    w_sie(r_sie() | SIE_STIE | SIE_SSIE | SIE_SEIE);

    log::info!("trap: vectors installed, timer running");
}

pub fn ticks() -> u64 {
    unsafe {
        TICKS_LOCK.acquire();
        let t = TICKS;
        TICKS_LOCK.release();
        t
    }
}

fn timer_interrupt_handler() {
    // the trampoline forwarded the tick as a soft interrupt; retire it.
    w_sip(r_sip() & !SIP_SSIP);

    unsafe {
        TICKS_LOCK.acquire();
        TICKS += 1;
        wakeup(core::ptr::addr_of!(TICKS) as usize);
        TICKS_LOCK.release();
    }

    timer_set_next();
}

/// Block the calling process for n timer ticks. Returns -1 if the
/// process was killed while it slept.
pub fn sleep_ticks(n: u64) -> i32 {
    unsafe {
        TICKS_LOCK.acquire();
        let t0 = TICKS;
        while TICKS - t0 < n {
            if crate::proc::is_killed() {
                TICKS_LOCK.release();
                return -1;
            }
            sleep(core::ptr::addr_of!(TICKS) as usize, &mut TICKS_LOCK);
        }
        TICKS_LOCK.release();
    }
    0
}

/// Classify and handle a supervisor-mode trap.
pub fn kerneltrap() {
    let scause = r_scause();

    if scause & INTERRUPT != 0 {
        let irq = scause & 0xff;
        if irq == IRQ_S_TIMER || irq == IRQ_S_SOFT {
            timer_interrupt_handler();

            // a running process gives the CPU back after each tick.
            if let Some(p) = myproc() {
                let preempt = {
                    p.lock.acquire();
                    let r = p.state == Procstate::Running;
                    p.lock.release();
                    r
                };
                if preempt {
                    yield_proc();
                }
            }
        }
        // other device interrupts have no sources on this machine.
        return;
    }

    match scause {
        CAUSE_USER_ECALL | CAUSE_SUPERVISOR_ECALL => {
            // advance past the ecall instruction, then dispatch.
            w_sepc(r_sepc() + 4);
            syscall();
        }
        CAUSE_ILLEGAL_INSTRUCTION
        | CAUSE_INSTRUCTION_PAGE_FAULT
        | CAUSE_LOAD_PAGE_FAULT
        | CAUSE_STORE_PAGE_FAULT => {
            let from_user = r_sstatus() & SSTATUS_SPP == 0;
            match myproc() {
                Some(p) if from_user => {
                    log::warn!("trap: fault {:#x}, killing pid {}", scause, p.pid);
                    p.lock.acquire();
                    p.killed = true;
                    p.lock.release();
                }
                _ => {
                    printf!("scause {:#x} sepc={:#x}\n", scause, r_sepc());
                    panic!("kerneltrap");
                }
            }
        }
        _ => {
            printf!("unexpected trap: scause {:#x} sepc={:#x}\n", scause, r_sepc());
            panic!("kerneltrap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktest;
    use crate::riscv::{intr_off, intr_on, r_mie, r_sie, r_sip};
    use crate::sim;

    #[test]
    fn timer_ticks_advance() {
        ktest::run(|| {
            assert_eq!(ticks(), 0);
            intr_on();
            let mut polls = 0;
            while ticks() < 3 {
                sim::clint_pump();
                polls += 1;
                assert!(polls < 10_000, "timer never fired");
            }
            intr_off();
            assert!(ticks() >= 3);
        });
    }

    #[test]
    fn tick_needs_interrupts_enabled() {
        ktest::run(|| {
            intr_off();
            for _ in 0..200 {
                sim::clint_pump();
            }
            // pending, but never delivered with SIE clear.
            assert_eq!(ticks(), 0);
            assert!(r_sip() & SIP_SSIP != 0);

            // opening interrupts lets the pending tick through.
            intr_on();
            let mut polls = 0;
            while ticks() == 0 {
                sim::clint_pump();
                polls += 1;
                assert!(polls < 10_000);
            }
            intr_off();
        });
    }

    #[test]
    fn delegation_and_vectors_installed() {
        ktest::run(|| {
            // trap_init ran in boot; the supervisor vector must be ours.
            assert_eq!(crate::riscv::r_stvec(), kernelvec_addr());
            assert!(r_sie() & (SIE_STIE | SIE_SSIE | SIE_SEIE) != 0);
            assert!(r_mie() & MIE_MTIE != 0);
            assert_eq!(
                sim::csr_read(sim::Csr::Mideleg),
                (1 << IRQ_S_TIMER) | (1 << IRQ_S_EXT) | (1 << IRQ_S_SOFT)
            );
        });
    }

    #[test]
    #[should_panic(expected = "kerneltrap")]
    fn kernel_fault_is_fatal() {
        ktest::run(|| {
            // a store page fault with SPP set (trap arrived from S-mode).
            sim::csr_write(sim::Csr::Sstatus, SSTATUS_SPP);
            sim::csr_write(sim::Csr::Scause, CAUSE_STORE_PAGE_FAULT);
            kerneltrap();
        });
    }
}
