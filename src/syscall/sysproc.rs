// Process-facing system calls.

use crate::klog::klog_read;
use crate::proc::{either_copyout, exit, fork, myproc, wait};
use crate::syscall::syscall::{argaddr, argint};

pub fn sys_getpid() -> u64 {
    myproc().expect("sys_getpid").pid as u64
}

pub fn sys_exit() -> u64 {
    let status = argint(0);
    exit(status);
}

pub fn sys_fork() -> u64 {
    fork() as i64 as u64
}

pub fn sys_wait() -> u64 {
    let addr = argaddr(0);
    wait(addr) as i64 as u64
}

/// Drain buffered kernel log text into the caller's buffer; returns the
/// number of bytes delivered.
pub fn sys_klog() -> u64 {
    let addr = argaddr(0);
    let n = argint(1);
    if n < 0 || addr == 0 {
        return u64::MAX;
    }

    let p = myproc().expect("sys_klog");
    let mut remaining = n as usize;
    let mut dst = addr;
    let mut total = 0u64;
    let mut chunk = [0u8; 128];

    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let got = klog_read(&mut chunk[..want]);
        if got == 0 {
            break;
        }
        if either_copyout(p, dst, chunk.as_ptr(), got) < 0 {
            return u64::MAX;
        }
        dst += got;
        remaining -= got;
        total += got as u64;
    }

    total
}
