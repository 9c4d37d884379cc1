// Kernel-wide tunables.

pub const NPROC: usize = 16; // maximum number of processes
pub const NBUF: usize = 16; // size of disk block cache
pub const NINODES: usize = 200; // maximum number of inodes
pub const NFILE: usize = 50; // open files per system
pub const ROOTDEV: u32 = 0; // device number of the one disk

pub const MAXLOG: usize = 30; // max data blocks in one on-disk transaction
pub const LOGSIZE: usize = MAXLOG + 1; // log blocks on disk (header + data)

// Each process gets a small contiguous kernel stack with the trap frame
// at its top. One page proved too tight for core::fmt frames, hence two.
pub const KSTACKPAGES: usize = 2;

pub const MAXCONTIG: usize = 8; // upper bound for alloc_pages(n)

pub const KLOGBUF: usize = 4096; // kernel log ring capacity, bytes
pub const PNAMELEN: usize = 16; // process name length, incl. NUL
