// Mutual exclusion spin locks.
//
// Because a lock may be taken inside an interrupt handler, interrupts stay
// off for as long as any lock is held; push_off/pop_off keep a per-hart
// nesting count so handlers can acquire locks of their own.

use core::ptr;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use crate::proc::{mycpu, Cpu};
use crate::riscv::{intr_get, intr_off, intr_on};

pub struct Spinlock {
    locked: AtomicU64, // Is the lock held?

    // For debugging:
    name: &'static str,  // Name of lock.
    cpu: *mut Cpu, // The cpu holding the lock.
}

impl Spinlock {
    pub const fn init_lock(name: &'static str) -> Self {
        Spinlock {
            locked: AtomicU64::new(0),
            name,
            cpu: ptr::null_mut(),
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn acquire(&mut self) {
        push_off(); // disable interrupts to avoid deadlock.

        if self.holding() {
            panic!("acquire {}", self.name);
        }

        // An acquire-ordered swap, the amoswap.w.aq of the RISC-V port.
        while self.locked.swap(1, Ordering::Acquire) != 0 {}

        // Tell the compiler and the processor to not move loads or stores
        // past this point, to ensure that the critical section's memory
        // references happen strictly after the lock is acquired.
        fence(Ordering::SeqCst);

        // Record info about lock acquisition for holding() and debugging.
        self.cpu = mycpu();
    }

    /// Release the lock.
    pub fn release(&mut self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }

        self.cpu = ptr::null_mut();

        // All the stores in the critical section must be visible before
        // the lock is released.
        fence(Ordering::SeqCst);

        // Release-ordered store, the amoswap.w of the RISC-V port.
        self.locked.store(0, Ordering::Release);

        pop_off();
    }

    /// Check whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        push_off();
        let r = self.locked.load(Ordering::Relaxed) == 1 && self.cpu == mycpu() as *mut Cpu;
        pop_off();
        r
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();

    intr_off();
    let cpu = mycpu();
    if cpu.noff == 0 {
        cpu.intena = old;
    }
    cpu.noff += 1;
}

pub fn pop_off() {
    let cpu = mycpu();
    if intr_get() {
        panic!("pop_off - interruptible");
    }
    if cpu.noff < 1 {
        panic!("pop_off");
    }
    cpu.noff -= 1;
    if cpu.noff == 0 && cpu.intena {
        intr_on();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktest;

    #[test]
    fn acquire_release_track_holder() {
        ktest::run(|| {
            static mut LK: Spinlock = Spinlock::init_lock("t");
            unsafe {
                assert!(!LK.holding());
                LK.acquire();
                assert!(LK.holding());
                LK.release();
                assert!(!LK.holding());
                // the holder fields agree across a release/acquire pair.
                LK.acquire();
                assert!(LK.holding());
                LK.release();
            }
        });
    }

    #[test]
    fn push_off_nests_and_restores() {
        ktest::run(|| {
            intr_on();
            assert!(intr_get());
            push_off();
            assert!(!intr_get());
            push_off();
            assert!(!intr_get());
            pop_off();
            assert!(!intr_get());
            pop_off();
            assert!(intr_get());
            intr_off();
        });
    }

    #[test]
    fn interrupts_stay_off_while_held() {
        ktest::run(|| {
            static mut LK: Spinlock = Spinlock::init_lock("t");
            intr_on();
            unsafe {
                LK.acquire();
                assert!(!intr_get());
                LK.release();
            }
            assert!(intr_get());
            intr_off();
        });
    }
}
