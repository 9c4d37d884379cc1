// Open-file objects: a fixed table of descriptors, each a (readable,
// writable, offset) view onto an inode.

use core::ptr;

use crate::fs::{ilock, iput, iunlock, readi, writei, Inode};
use crate::log::{begin_op, end_op};
use crate::param::NFILE;
use crate::spinlock::Spinlock;

pub struct File {
    pub refcnt: i32,
    pub readable: bool,
    pub writable: bool,
    pub off: u32,
    pub ip: *mut Inode,
}

impl File {
    const fn new() -> Self {
        File {
            refcnt: 0,
            readable: false,
            writable: false,
            off: 0,
            ip: ptr::null_mut(),
        }
    }
}

static mut FTABLE: [File; NFILE] = [const { File::new() }; NFILE];
static mut FTABLE_LOCK: Spinlock = Spinlock::init_lock("ftable");

pub fn fileinit() {
    unsafe {
        for f in FTABLE.iter_mut() {
            f.refcnt = 0;
            f.readable = false;
            f.writable = false;
            f.off = 0;
            f.ip = ptr::null_mut();
        }
    }
}

/// Allocate a file structure.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE_LOCK.acquire();
        for f in FTABLE.iter_mut() {
            if f.refcnt == 0 {
                f.refcnt = 1;
                f.readable = false;
                f.writable = false;
                f.off = 0;
                f.ip = ptr::null_mut();
                FTABLE_LOCK.release();
                return Some(f);
            }
        }
        FTABLE_LOCK.release();
    }
    None
}

/// Increment ref count for file f.
pub fn filedup(f: &mut File) {
    unsafe { FTABLE_LOCK.acquire() };
    if f.refcnt < 1 {
        panic!("filedup");
    }
    f.refcnt += 1;
    unsafe { FTABLE_LOCK.release() };
}

/// Close file f: decrement ref count, release the inode when the last
/// reference goes away.
pub fn fileclose(f: &mut File) {
    unsafe { FTABLE_LOCK.acquire() };
    if f.refcnt < 1 {
        panic!("fileclose: ref<=0");
    }
    f.refcnt -= 1;
    if f.refcnt > 0 {
        unsafe { FTABLE_LOCK.release() };
        return;
    }

    let ip = f.ip;
    f.ip = ptr::null_mut();
    f.off = 0;
    unsafe { FTABLE_LOCK.release() };

    if !ip.is_null() {
        iput(unsafe { &mut *ip });
    }
}

/// Read from the file at its current offset; advances the offset by the
/// number of bytes read.
pub fn fileread(f: &mut File, dst: &mut [u8]) -> i32 {
    if !f.readable || f.ip.is_null() {
        return -1;
    }
    let ip = unsafe { &mut *f.ip };
    ilock(ip);
    let r = readi(ip, dst, f.off, dst.len() as u32);
    iunlock(ip);
    if r > 0 {
        f.off += r as u32;
    }
    r
}

/// Write at the current offset, inside a log transaction; advances the
/// offset on success.
pub fn filewrite(f: &mut File, src: &[u8]) -> i32 {
    if !f.writable || f.ip.is_null() {
        return -1;
    }

    begin_op();
    let ip = unsafe { &mut *f.ip };
    ilock(ip);
    let w = writei(ip, src, f.off, src.len() as u32);
    iunlock(ip);
    end_op();

    if w > 0 {
        f.off += w as u32;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{create, namei, T_FILE};
    use crate::ktest;

    #[test]
    fn file_offsets_advance() {
        ktest::run_fs(|| {
            let ip = create("/log.txt", T_FILE).unwrap();

            let f = filealloc().unwrap();
            f.readable = true;
            f.writable = true;
            f.ip = ip as *mut _;

            assert_eq!(filewrite(f, b"one "), 4);
            assert_eq!(filewrite(f, b"two"), 3);
            assert_eq!(f.off, 7);

            // reads go through a second descriptor with its own offset.
            let ip2 = namei("/log.txt").unwrap();
            let g = filealloc().unwrap();
            g.readable = true;
            g.ip = ip2 as *mut _;

            let mut buf = [0u8; 16];
            assert_eq!(fileread(g, &mut buf), 7);
            assert_eq!(&buf[..7], b"one two");
            assert_eq!(fileread(g, &mut buf), 0); // at EOF

            fileclose(f);
            fileclose(g);
        });
    }

    #[test]
    fn permissions_are_enforced() {
        ktest::run_fs(|| {
            let ip = create("/ro", T_FILE).unwrap();
            let f = filealloc().unwrap();
            f.readable = true;
            f.ip = ip as *mut _;
            assert_eq!(filewrite(f, b"x"), -1);
            let mut buf = [0u8; 4];
            assert_eq!(fileread(f, &mut buf), 0);
            fileclose(f);
        });
    }

    #[test]
    fn close_releases_the_inode() {
        ktest::run_fs(|| {
            let ip = create("/tmp", T_FILE).unwrap();
            let refs_before = ip.refcnt;
            let f = filealloc().unwrap();
            f.writable = true;
            f.ip = ip as *mut _;
            fileclose(f);
            let again = namei("/tmp").unwrap();
            assert_eq!(again.refcnt, refs_before);
            iput(again);
        });
    }

    #[test]
    fn table_exhaustion_returns_none() {
        ktest::run_fs(|| {
            let mut held: [*mut File; crate::param::NFILE] =
                [core::ptr::null_mut(); crate::param::NFILE];
            for h in held.iter_mut() {
                *h = filealloc().unwrap() as *mut File;
            }
            assert!(filealloc().is_none());
            for &h in &held {
                fileclose(unsafe { &mut *h });
            }
        });
    }
}
