// File-descriptor system calls. Only the console descriptors exist at
// this level; files proper are a kernel-internal service (see file.rs).

use crate::console::consputc;
use crate::proc::{either_copyin, myproc};
use crate::syscall::syscall::{argaddr, argint};

/// write(fd, buf, n): fd 1 and 2 go to the console, anything else fails.
pub fn sys_write() -> u64 {
    let fd = argint(0);
    let addr = argaddr(1);
    let n = argint(2);

    if fd != 1 && fd != 2 {
        return u64::MAX;
    }
    if n < 0 {
        return u64::MAX;
    }

    let p = myproc().expect("sys_write");
    let mut remaining = n as usize;
    let mut src = addr;
    let mut total = 0u64;
    let mut buf = [0u8; 512];

    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        if either_copyin(p, buf.as_mut_ptr(), src, chunk) < 0 {
            return u64::MAX;
        }
        for &b in &buf[..chunk] {
            consputc(b);
        }
        remaining -= chunk;
        src += chunk;
        total += chunk as u64;
    }

    total
}
