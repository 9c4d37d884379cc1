// Syscall argument fetch and dispatch.
//
// Arguments arrive in a0..a5 of the saved trap frame, the number in a7,
// and the result goes back in a0; negative means failure. User pointers
// are only ever dereferenced through the process page table (with the
// kernel-range fallback for kernel threads).

use crate::printf;
use crate::proc::myproc;
use crate::syscall::sysfile::sys_write;
use crate::syscall::sysproc::{sys_exit, sys_fork, sys_getpid, sys_klog, sys_wait};
use crate::syscall::{SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KLOG, SYS_WAIT, SYS_WRITE};
use crate::vm::copyinstr_user;

fn argraw(n: usize) -> u64 {
    let p = myproc().expect("argraw");
    let tf = unsafe { &*p.trapframe };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the nth 32-bit system call argument.
pub fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// Fetch the nth argument as a user virtual address.
pub fn argaddr(n: usize) -> usize {
    argraw(n) as usize
}

/// Fetch the nth argument as a NUL-terminated string copied into buf.
/// Returns the string length, or -1 on a bad address or overflow.
pub fn argstr(n: usize, buf: &mut [u8]) -> i32 {
    let addr = argaddr(n);
    let p = myproc().expect("argstr");
    copyinstr_user(p.pagetable, buf, addr)
}

// the handler table, indexed by syscall number.
const SYSCALLS: [Option<fn() -> u64>; 7] = {
    let mut arr: [Option<fn() -> u64>; 7] = [None; 7];
    arr[SYS_WRITE] = Some(sys_write);
    arr[SYS_GETPID] = Some(sys_getpid);
    arr[SYS_EXIT] = Some(sys_exit);
    arr[SYS_FORK] = Some(sys_fork);
    arr[SYS_WAIT] = Some(sys_wait);
    arr[SYS_KLOG] = Some(sys_klog);
    arr
};

/// Dispatch the system call recorded in the current trap frame.
pub fn syscall() {
    let p = match myproc() {
        Some(p) => p,
        None => {
            printf!("syscall: no current process\n");
            return;
        }
    };

    let num = unsafe { (*p.trapframe).a7 } as usize;

    if num > 0 && num < SYSCALLS.len() {
        if let Some(f) = SYSCALLS[num] {
            let r = f();
            unsafe { (*p.trapframe).a0 = r };
            return;
        }
    }

    let len = p.name.iter().position(|&b| b == 0).unwrap_or(p.name.len());
    printf!(
        "{} {}: unknown sys call {}\n",
        p.pid,
        core::str::from_utf8(&p.name[..len]).unwrap_or("?"),
        num
    );
    unsafe { (*p.trapframe).a0 = u64::MAX };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktest;
    use crate::proc::{create_process, myproc, scheduler, Trapframe};
    use crate::sim;
    use crate::syscall::{SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KLOG, SYS_WAIT, SYS_WRITE};
    use crate::trap::kerneltrap;
    use std::sync::atomic::{AtomicI64, Ordering};

    // enter the kernel the way a user ecall would: cause registered,
    // arguments already in the trap frame.
    fn ecall() {
        sim::csr_write(sim::Csr::Scause, 8); // environment call from U-mode
        kerneltrap();
    }

    fn tf() -> *mut Trapframe {
        myproc().expect("tf").trapframe
    }

    static R0: AtomicI64 = AtomicI64::new(-99);
    static R1: AtomicI64 = AtomicI64::new(-99);
    static R2: AtomicI64 = AtomicI64::new(-99);

    extern "C" fn t_getpid(_arg: u64) {
        let mypid = myproc().unwrap().pid as i64;
        unsafe {
            (*tf()).a7 = SYS_GETPID as u64;
            ecall();
            R0.store((*tf()).a0 as i64, Ordering::SeqCst);
        }
        R1.store(mypid, Ordering::SeqCst);
    }

    #[test]
    fn getpid_returns_own_pid() {
        ktest::run(|| {
            R0.store(-99, Ordering::SeqCst);
            R1.store(-99, Ordering::SeqCst);
            assert!(create_process(t_getpid, 0) > 0);
            scheduler();
            assert!(R0.load(Ordering::SeqCst) > 0);
            assert_eq!(R0.load(Ordering::SeqCst), R1.load(Ordering::SeqCst));
        });
    }

    extern "C" fn t_writer(_arg: u64) {
        let msg = *b"syscall says hi";
        unsafe {
            let t = tf();
            (*t).a7 = SYS_WRITE as u64;
            (*t).a0 = 1;
            (*t).a1 = msg.as_ptr() as u64;
            (*t).a2 = msg.len() as u64;
            ecall();
            R0.store((*t).a0 as i64, Ordering::SeqCst);

            // a descriptor that is neither stdout nor stderr fails.
            (*t).a7 = SYS_WRITE as u64;
            (*t).a0 = 3;
            (*t).a1 = msg.as_ptr() as u64;
            (*t).a2 = msg.len() as u64;
            ecall();
            R1.store((*t).a0 as i64, Ordering::SeqCst);

            // unknown numbers report failure too.
            (*t).a7 = 99;
            ecall();
            R2.store((*t).a0 as i64, Ordering::SeqCst);
        }
    }

    #[test]
    fn write_goes_to_the_console() {
        ktest::run(|| {
            R0.store(-99, Ordering::SeqCst);
            R1.store(-99, Ordering::SeqCst);
            R2.store(-99, Ordering::SeqCst);
            create_process(t_writer, 0);
            scheduler();

            assert_eq!(R0.load(Ordering::SeqCst), 15);
            assert_eq!(R1.load(Ordering::SeqCst), -1);
            assert_eq!(R2.load(Ordering::SeqCst), -1);

            let mut out = [0u8; 4096];
            let n = sim::uart_drain(&mut out);
            let hay = &out[..n];
            let needle = b"syscall says hi";
            let found = hay
                .windows(needle.len())
                .any(|w| w == needle);
            assert!(found, "console output missing the written bytes");
        });
    }

    extern "C" fn t_sc_forker(arg: u64) {
        if arg == 0 {
            // child: exit(33) through the syscall interface.
            unsafe {
                let t = tf();
                (*t).a7 = SYS_EXIT as u64;
                (*t).a0 = 33;
                ecall();
            }
            unreachable!("exit returned");
        }
        unsafe {
            let t = tf();
            (*t).a7 = SYS_FORK as u64;
            ecall();
            let child = (*t).a0 as i64;
            R0.store(child, Ordering::SeqCst);

            let mut st: i32 = 0;
            (*t).a7 = SYS_WAIT as u64;
            (*t).a0 = &mut st as *mut i32 as u64;
            ecall();
            R1.store((*t).a0 as i64, Ordering::SeqCst);
            R2.store(st as i64, Ordering::SeqCst);
        }
    }

    #[test]
    fn fork_wait_exit_via_syscalls() {
        ktest::run(|| {
            R0.store(-99, Ordering::SeqCst);
            R1.store(-99, Ordering::SeqCst);
            R2.store(-99, Ordering::SeqCst);
            create_process(t_sc_forker, 1);
            scheduler();

            let child = R0.load(Ordering::SeqCst);
            assert!(child > 0);
            assert_eq!(R1.load(Ordering::SeqCst), child);
            assert_eq!(R2.load(Ordering::SeqCst), 33);
        });
    }

    extern "C" fn t_klogger(_arg: u64) {
        log::info!("klog marker xyzzy");
        let mut buf = [0u8; 512];
        unsafe {
            let t = tf();
            (*t).a7 = SYS_KLOG as u64;
            (*t).a0 = buf.as_mut_ptr() as u64;
            (*t).a1 = buf.len() as u64;
            ecall();
            R0.store((*t).a0 as i64, Ordering::SeqCst);
        }
        let needle = b"xyzzy";
        let found = buf.windows(needle.len()).any(|w| w == needle);
        R1.store(found as i64, Ordering::SeqCst);
    }

    #[test]
    fn klog_drains_into_caller_buffer() {
        ktest::run(|| {
            R0.store(-99, Ordering::SeqCst);
            R1.store(-99, Ordering::SeqCst);
            create_process(t_klogger, 0);
            scheduler();
            assert!(R0.load(Ordering::SeqCst) > 0);
            assert_eq!(R1.load(Ordering::SeqCst), 1);
        });
    }
}
