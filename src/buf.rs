use crate::fs::BSIZE;
use crate::spinlock::Spinlock;

pub struct Buf {
    pub valid: bool, // has data been read from disk?
    pub disk: bool,  // contents newer than the disk copy?
    pub dev: u32,
    pub blockno: u32,
    pub refcnt: u32,
    pub lock: Spinlock,
    pub data: [u8; BSIZE],
}

impl Buf {
    pub const fn new() -> Self {
        Buf {
            valid: false,
            disk: false,
            dev: 0,
            blockno: 0,
            refcnt: 0,
            lock: Spinlock::init_lock("buffer"),
            data: [0; BSIZE],
        }
    }
}
