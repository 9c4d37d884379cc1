// Buffer cache over the simulated disk.
//
// The disk is a RAM array of NBLOCKS blocks; the cache is a fixed set of
// buffers found by linear scan. At most one live buffer (refcnt > 0)
// exists per (dev, blockno); a buffer whose refcount has dropped to zero
// keeps its contents and can be either hit again or rebound to another
// block.
//
// Interface:
// * To get a buffer for a particular disk block, call bread.
// * After changing buffer data, call bwrite to write it to disk.
// * When done with the buffer, call brelse.
// * Do not use the buffer after calling brelse.

use crate::buf::Buf;
use crate::fs::{BSIZE, NBLOCKS};
use crate::param::NBUF;
use crate::spinlock::Spinlock;
use crate::string::{memmove, memset};

static mut DISK: [u8; NBLOCKS * BSIZE] = [0; NBLOCKS * BSIZE];

static mut BUFS: [Buf; NBUF] = [const { Buf::new() }; NBUF];
static mut BCACHE_LOCK: Spinlock = Spinlock::init_lock("bcache");

static mut CACHE_HITS: u32 = 0;
static mut CACHE_MISSES: u32 = 0;
static mut DISK_READS: u32 = 0;
static mut DISK_WRITES: u32 = 0;

/// Reset the cache: every slot free, counters at zero. The disk array is
/// left alone so a "reboot" sees the old contents.
pub fn binit() {
    unsafe {
        for b in BUFS.iter_mut() {
            b.valid = false;
            b.disk = false;
            b.dev = 0;
            b.blockno = 0;
            b.refcnt = 0;
        }
        CACHE_HITS = 0;
        CACHE_MISSES = 0;
        DISK_READS = 0;
        DISK_WRITES = 0;
    }
    log::info!("bio: {} buffers over {} blocks", NBUF, NBLOCKS);
}

/// Zero the disk array: a fresh, empty disk.
pub fn disk_clear() {
    unsafe {
        memset(DISK.as_mut_ptr(), 0, NBLOCKS * BSIZE);
    }
}

fn findbuf(dev: u32, blockno: u32) -> Option<&'static mut Buf> {
    unsafe {
        for b in BUFS.iter_mut() {
            if b.refcnt > 0 && b.dev == dev && b.blockno == blockno {
                return Some(b);
            }
        }
    }
    None
}

/// Return a referenced buffer holding the contents of the given block.
pub fn bread(dev: u32, blockno: u32) -> &'static mut Buf {
    if blockno as usize >= NBLOCKS {
        panic!("bread: blockno out of range");
    }

    unsafe { BCACHE_LOCK.acquire() };

    if let Some(b) = findbuf(dev, blockno) {
        unsafe {
            CACHE_HITS += 1;
        }
        b.refcnt += 1;
        unsafe { BCACHE_LOCK.release() };
        return b;
    }

    // not cached; claim any free buffer.
    unsafe {
        for b in BUFS.iter_mut() {
            if b.refcnt == 0 {
                b.dev = dev;
                b.blockno = blockno;
                b.refcnt = 1;
                b.valid = true;
                b.disk = false;
                memmove(
                    b.data.as_mut_ptr(),
                    DISK.as_ptr().add(blockno as usize * BSIZE),
                    BSIZE,
                );
                CACHE_MISSES += 1;
                DISK_READS += 1;
                BCACHE_LOCK.release();
                return b;
            }
        }
    }

    panic!("bread: no free buffers");
}

/// Write the buffer's contents through to the disk array.
pub fn bwrite(b: &mut Buf) {
    if !b.valid {
        return;
    }
    if b.blockno as usize >= NBLOCKS {
        panic!("bwrite: out of range");
    }
    unsafe {
        memmove(
            DISK.as_mut_ptr().add(b.blockno as usize * BSIZE),
            b.data.as_ptr(),
            BSIZE,
        );
        DISK_WRITES += 1;
    }
    b.disk = false;
}

/// Drop one reference. The buffer stays valid in the cache so later
/// breads of the same block can hit.
pub fn brelse(b: &mut Buf) {
    if b.refcnt == 0 {
        panic!("brelse: refcnt");
    }
    unsafe { BCACHE_LOCK.acquire() };
    b.refcnt -= 1;
    unsafe { BCACHE_LOCK.release() };
}

/// Take an extra reference so the buffer cannot be recycled; the log
/// holds registered buffers this way until commit.
pub fn bpin(b: &mut Buf) {
    unsafe { BCACHE_LOCK.acquire() };
    b.refcnt += 1;
    unsafe { BCACHE_LOCK.release() };
}

pub fn bunpin(b: &mut Buf) {
    unsafe { BCACHE_LOCK.acquire() };
    if b.refcnt == 0 {
        panic!("bunpin");
    }
    b.refcnt -= 1;
    unsafe { BCACHE_LOCK.release() };
}

pub fn buffer_cache_hits() -> u32 {
    unsafe { CACHE_HITS }
}

pub fn buffer_cache_misses() -> u32 {
    unsafe { CACHE_MISSES }
}

pub fn disk_read_count() -> u32 {
    unsafe { DISK_READS }
}

pub fn disk_write_count() -> u32 {
    unsafe { DISK_WRITES }
}
