// The inode layer: superblock, inode table, block mapping, directories,
// and path resolution.
//
// Block allocation is deliberately simple: a data block is free exactly
// when its on-disk bytes are all zero, so allocating means scanning from
// bmapstart+1 for a zero block and freeing means zeroing. The one wrinkle
// is that an inode's own indirect-table block must never be handed out as
// a data block for that inode, or file data would overwrite the table.

use core::mem;

use crate::bio::{binit, bread, brelse, bwrite};
use crate::buf::Buf;
use crate::fs::{
    DInode, Dirent, Inode, SuperBlock, BSIZE, DIRSIZ, FSMAGIC, IPB, NBLOCKS, NDIRECT, NINDIRECT,
    ROOTINO, T_DIR,
};
use crate::log::{in_transaction, log_init, log_write};
use crate::param::{LOGSIZE, NINODES};
use crate::spinlock::Spinlock;
use crate::string::memmove;
use crate::IBLOCK;

static mut SB: SuperBlock = SuperBlock {
    magic: 0,
    size: 0,
    nblocks: 0,
    ninodes: 0,
    nlog: 0,
    logstart: 0,
    inodestart: 0,
    bmapstart: 0,
};

static mut INODES: [Inode; NINODES] = [const { Inode::new() }; NINODES];
static mut ITABLE_LOCK: Spinlock = Spinlock::init_lock("itable");

/// Lay out the superblock for the simulated disk and reset the in-memory
/// inode table.
pub fn iinit() {
    unsafe {
        SB.magic = FSMAGIC;
        SB.size = NBLOCKS as u32;
        SB.ninodes = NINODES as u32;
        SB.nlog = LOGSIZE as u32;
        SB.logstart = 2;
        SB.inodestart = SB.logstart + SB.nlog;
        SB.bmapstart = SB.inodestart + SB.ninodes / IPB as u32 + 1;
        SB.nblocks = SB.size - (SB.bmapstart + 1);

        for (i, ip) in INODES.iter_mut().enumerate() {
            ip.dev = 0;
            ip.inum = i as u32;
            ip.refcnt = 0;
            ip.valid = false;
            ip.file_type = 0;
            ip.major = 0;
            ip.minor = 0;
            ip.nlink = 0;
            ip.size = 0;
            ip.addrs = [0; NDIRECT + 1];
        }
    }
    log::info!("fs: superblock laid out, {} inodes", NINODES);
}

/// Bring up the whole file system: buffer cache, inode table, log
/// recovery, and the root directory.
pub fn fs_init(dev: u32) {
    binit();
    iinit();
    log_init(dev);

    unsafe {
        let root = &mut INODES[ROOTINO as usize];
        if !root.valid {
            root.valid = true;
            root.file_type = T_DIR;
            root.nlink = 1;
            root.size = 0;
            root.refcnt = 1;
        }
    }
}

pub fn read_superblock(out: &mut SuperBlock) {
    unsafe {
        *out = SB;
    }
}

/// Find the in-memory inode with the given number and take a reference.
pub fn iget(dev: u32, inum: u32) -> Option<&'static mut Inode> {
    unsafe {
        if inum >= SB.ninodes {
            return None;
        }
        ITABLE_LOCK.acquire();
        let ip = &mut INODES[inum as usize];
        ip.dev = dev;
        ip.refcnt += 1;
        ITABLE_LOCK.release();
        Some(ip)
    }
}

/// Drop a reference to an in-memory inode.
pub fn iput(ip: &mut Inode) {
    unsafe { ITABLE_LOCK.acquire() };
    if ip.refcnt <= 0 {
        panic!("iput: ref<=0");
    }
    ip.refcnt -= 1;
    unsafe { ITABLE_LOCK.release() };
}

/// Allocate a fresh inode: the first invalid entry with inum >= 1.
pub fn ialloc(dev: u32, file_type: i16) -> Option<&'static mut Inode> {
    unsafe {
        ITABLE_LOCK.acquire();
        for inum in 1..SB.ninodes {
            let ip = &mut INODES[inum as usize];
            if !ip.valid {
                ip.dev = dev;
                ip.valid = true;
                ip.file_type = file_type;
                ip.nlink = 1;
                ip.size = 0;
                ip.addrs = [0; NDIRECT + 1];
                ip.refcnt = 1;
                ITABLE_LOCK.release();
                iupdate(ip);
                return Some(ip);
            }
        }
        ITABLE_LOCK.release();
    }
    log::warn!("ialloc: no free inodes");
    None
}

pub fn ilock(ip: &mut Inode) {
    ip.lock.acquire();
}

pub fn iunlock(ip: &mut Inode) {
    ip.lock.release();
}

/// Copy the inode's metadata into its slot in the inode blocks.
pub fn iupdate(ip: &mut Inode) {
    let dip = DInode {
        file_type: ip.file_type,
        major: ip.major,
        minor: ip.minor,
        nlink: ip.nlink,
        size: ip.size,
        addrs: ip.addrs,
    };

    let bp = bread(ip.dev, unsafe { IBLOCK!(ip.inum, SB) });
    let off = (ip.inum as usize % IPB) * mem::size_of::<DInode>();
    memmove(
        bp.data[off..].as_mut_ptr(),
        &dip as *const DInode as *const u8,
        mem::size_of::<DInode>(),
    );
    fs_bwrite(bp);
    brelse(bp);
}

// inside a transaction writes are registered with the log; outside they
// hit the disk directly.
fn fs_bwrite(b: &mut Buf) {
    if in_transaction() {
        log_write(b);
    } else {
        bwrite(b);
    }
}

// is the on-disk block entirely zero?
fn block_is_free(b: u32) -> bool {
    let bp = bread(0, b);
    let free = bp.data.iter().all(|&x| x == 0);
    brelse(bp);
    free
}

// Scan the data region for a free (all-zero) block, skipping `skip`
// (the caller's indirect-table block, or 0 for none).
fn alloc_block_scan(skip: u32) -> u32 {
    unsafe {
        for b in SB.bmapstart + 1..SB.size {
            if b == skip {
                continue;
            }
            if block_is_free(b) {
                if b as usize >= NBLOCKS {
                    panic!("bmap: assigned block out of range");
                }
                return b;
            }
        }
    }
    panic!("bmap: out of blocks");
}

/// Map a logical block of the file onto a disk block, allocating on
/// demand. Index 0..NDIRECT-1 is direct; beyond that goes through the
/// single indirect block.
fn bmap(ip: &mut Inode, bn: u32) -> u32 {
    if (bn as usize) < NDIRECT {
        if ip.addrs[bn as usize] == 0 {
            ip.addrs[bn as usize] = alloc_block_scan(0);
        }
        return ip.addrs[bn as usize];
    }

    let bn = bn - NDIRECT as u32;
    if bn as usize >= NINDIRECT {
        panic!("bmap: out of range");
    }

    if ip.addrs[NDIRECT] == 0 {
        // the table block itself; it stays zero on disk until the first
        // entry is recorded, which is why data allocation skips it.
        ip.addrs[NDIRECT] = alloc_block_scan(0);
    }
    let indirect = ip.addrs[NDIRECT];

    let ib = bread(ip.dev, indirect);
    let entry_off = bn as usize * mem::size_of::<u32>();
    let mut entry = u32::from_le_bytes([
        ib.data[entry_off],
        ib.data[entry_off + 1],
        ib.data[entry_off + 2],
        ib.data[entry_off + 3],
    ]);

    if entry == 0 {
        entry = alloc_block_scan(indirect);
        ib.data[entry_off..entry_off + 4].copy_from_slice(&entry.to_le_bytes());
        bwrite(ib);
    }

    brelse(ib);
    entry
}

// the disk block backing logical block bn, or 0 for a hole. Never
// allocates.
fn block_lookup(ip: &Inode, bn: u32) -> u32 {
    if (bn as usize) < NDIRECT {
        return ip.addrs[bn as usize];
    }
    let bn = bn - NDIRECT as u32;
    if bn as usize >= NINDIRECT || ip.addrs[NDIRECT] == 0 {
        return 0;
    }
    let ib = bread(ip.dev, ip.addrs[NDIRECT]);
    let off = bn as usize * mem::size_of::<u32>();
    let entry = u32::from_le_bytes([
        ib.data[off],
        ib.data[off + 1],
        ib.data[off + 2],
        ib.data[off + 3],
    ]);
    brelse(ib);
    entry
}

/// Read up to n bytes from the inode starting at off. A zero block slot
/// inside the file reads as zeros (a hole). Returns the byte count.
pub fn readi(ip: &mut Inode, dst: &mut [u8], off: u32, n: u32) -> i32 {
    if off > ip.size {
        return 0;
    }
    let mut n = n.min(dst.len() as u32);
    if off + n > ip.size {
        n = ip.size - off;
    }

    let mut tot: u32 = 0;
    let mut off = off;
    while tot < n {
        let bn = off / BSIZE as u32;
        let boff = off as usize % BSIZE;
        let mut chunk = BSIZE - boff;
        if chunk > (n - tot) as usize {
            chunk = (n - tot) as usize;
        }

        let bnum = block_lookup(ip, bn);
        if bnum == 0 {
            for b in &mut dst[tot as usize..tot as usize + chunk] {
                *b = 0;
            }
        } else {
            let bp = bread(ip.dev, bnum);
            dst[tot as usize..tot as usize + chunk]
                .copy_from_slice(&bp.data[boff..boff + chunk]);
            brelse(bp);
        }

        tot += chunk as u32;
        off += chunk as u32;
    }

    tot as i32
}

/// Write n bytes at off, which must not be past the current size (no
/// gaps). Grows the size to the final offset. Returns the byte count,
/// or -1 for an append past the end.
pub fn writei(ip: &mut Inode, src: &[u8], off: u32, n: u32) -> i32 {
    if off > ip.size {
        return -1;
    }
    let n = n.min(src.len() as u32);

    let mut tot: u32 = 0;
    let mut off = off;
    while tot < n {
        let bn = off / BSIZE as u32;
        let boff = off as usize % BSIZE;
        let mut chunk = BSIZE - boff;
        if chunk > (n - tot) as usize {
            chunk = (n - tot) as usize;
        }

        let bnum = bmap(ip, bn);
        let bp = bread(ip.dev, bnum);
        bp.data[boff..boff + chunk]
            .copy_from_slice(&src[tot as usize..tot as usize + chunk]);
        fs_bwrite(bp);
        brelse(bp);

        tot += chunk as u32;
        off += chunk as u32;
    }

    if off > ip.size {
        ip.size = off;
        iupdate(ip);
    }

    tot as i32
}

// does this directory entry carry the given name?
fn name_eq(de: &Dirent, name: &[u8]) -> bool {
    if name.len() > DIRSIZ {
        return false;
    }
    for i in 0..DIRSIZ {
        let want = if i < name.len() { name[i] } else { 0 };
        if de.name[i] != want {
            return false;
        }
        if want == 0 {
            break;
        }
    }
    true
}

/// Look for a name in a directory; returns the entry's inode with its
/// reference count bumped.
pub fn dirlookup(dp: &mut Inode, name: &[u8]) -> Option<&'static mut Inode> {
    if dp.file_type != T_DIR {
        return None;
    }

    let esize = mem::size_of::<Dirent>() as u32;
    let mut off = 0;
    while off + esize <= dp.size {
        let mut de = Dirent {
            inum: 0,
            name: [0; DIRSIZ],
        };
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(&mut de as *mut Dirent as *mut u8, esize as usize)
        };
        if readi(dp, bytes, off, esize) != esize as i32 {
            break;
        }
        if de.inum != 0 && name_eq(&de, name) {
            return iget(dp.dev, de.inum as u32);
        }
        off += esize;
    }
    None
}

/// Append a (name, inum) entry to the directory. Fails on duplicates.
pub fn dirlink(dp: &mut Inode, name: &[u8], inum: u32) -> i32 {
    if name.is_empty() || name.len() > DIRSIZ {
        return -1;
    }
    if let Some(existing) = dirlookup(dp, name) {
        iput(existing);
        return -1;
    }

    let mut de = Dirent {
        inum: inum as u16,
        name: [0; DIRSIZ],
    };
    de.name[..name.len()].copy_from_slice(name);

    let esize = mem::size_of::<Dirent>();
    let bytes =
        unsafe { core::slice::from_raw_parts(&de as *const Dirent as *const u8, esize) };
    let off = dp.size;
    if writei(dp, bytes, off, esize as u32) != esize as i32 {
        return -1;
    }
    0
}

/// Resolve an absolute path to an inode (reference held). Components are
/// truncated to DIRSIZ bytes, matching what dirlink can store.
pub fn namei(path: &str) -> Option<&'static mut Inode> {
    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes[0] != b'/' {
        return None;
    }

    let mut cur = iget(0, ROOTINO)?;

    for comp in path[1..].split('/') {
        if comp.is_empty() {
            continue;
        }
        let comp = &comp.as_bytes()[..comp.len().min(DIRSIZ)];
        let next = dirlookup(cur, comp);
        iput(cur);
        cur = next?;
    }

    Some(cur)
}

/// Create a file or directory at an absolute path whose parent already
/// exists. Returns the new inode (reference held), or None if the path
/// is malformed, the parent is missing, or the name is taken.
pub fn create(path: &str, file_type: i16) -> Option<&'static mut Inode> {
    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes[0] != b'/' {
        return None;
    }

    let split = path.rfind('/').unwrap();
    let (dir, name) = (&path[..split], &path[split + 1..]);
    if name.is_empty() || name.len() > DIRSIZ {
        return None;
    }

    let parent = if dir.is_empty() { namei("/") } else { namei(dir) }?;
    if parent.file_type != T_DIR {
        iput(parent);
        return None;
    }

    if let Some(existing) = dirlookup(parent, name.as_bytes()) {
        iput(existing);
        iput(parent);
        return None;
    }

    let ip = match ialloc(0, file_type) {
        Some(ip) => ip,
        None => {
            iput(parent);
            return None;
        }
    };

    if dirlink(parent, name.as_bytes(), ip.inum) < 0 {
        iput(ip);
        iput(parent);
        return None;
    }

    iput(parent);
    Some(ip)
}

//
// observables.
//

/// Free data blocks, by the same all-zero rule the allocator uses.
pub fn count_free_blocks() -> u32 {
    let mut free = 0;
    unsafe {
        for b in SB.bmapstart + 1..SB.size {
            if block_is_free(b) {
                free += 1;
            }
        }
    }
    free
}

pub fn count_free_inodes() -> u32 {
    let mut free = 0;
    unsafe {
        ITABLE_LOCK.acquire();
        for ip in INODES.iter() {
            if !ip.valid {
                free += 1;
            }
        }
        ITABLE_LOCK.release();
    }
    free
}
