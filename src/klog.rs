// Kernel log ring.
//
// Records from the `log` facade are rendered into a fixed byte ring with a
// level prefix. The ring overwrites its oldest bytes when full; readers
// (the klog syscall, the console dump) drain from the read position. The
// console printf path stays separate so a wedged logger can never take
// down the boot banner or a panic message.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};

use crate::console::consputc;
use crate::param::KLOGBUF;
use crate::spinlock::Spinlock;

struct KlogBuffer {
    lock: Spinlock,
    buf: [u8; KLOGBUF],
    read_pos: usize,
    write_pos: usize,
}

static mut LOG_BUF: KlogBuffer = KlogBuffer {
    lock: Spinlock::init_lock("klog"),
    buf: [0; KLOGBUF],
    read_pos: 0,
    write_pos: 0,
};

impl KlogBuffer {
    fn readable_bytes(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            KLOGBUF - self.read_pos + self.write_pos
        }
    }

    // lock must be held.
    fn push_bytes(&mut self, s: &[u8]) {
        for &b in s {
            self.buf[self.write_pos] = b;
            self.write_pos = (self.write_pos + 1) % KLOGBUF;
            // caught up with the reader: drop the oldest byte.
            if self.write_pos == self.read_pos {
                self.read_pos = (self.read_pos + 1) % KLOGBUF;
            }
        }
    }

    // lock must be held.
    fn pop_byte(&mut self) -> Option<u8> {
        if self.read_pos == self.write_pos {
            return None;
        }
        let b = self.buf[self.read_pos];
        self.read_pos = (self.read_pos + 1) % KLOGBUF;
        Some(b)
    }
}

// fmt sink that appends to LOG_BUF; only used with the lock held.
struct RingWriter;

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        unsafe { LOG_BUF.push_bytes(s.as_bytes()) }
        Ok(())
    }
}

struct KernelLog;

static KERNEL_LOG: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            Level::Error => "[ERR] ",
            Level::Warn => "[WRN] ",
            Level::Info => "[INF] ",
            Level::Debug => "[DBG] ",
            Level::Trace => "[TRC] ",
        };
        unsafe {
            LOG_BUF.lock.acquire();
            LOG_BUF.push_bytes(prefix.as_bytes());
            let _ = write!(RingWriter, "{}", record.args());
            LOG_BUF.push_bytes(b"\n");
            LOG_BUF.lock.release();
        }
    }

    fn flush(&self) {}
}

pub fn klog_init() {
    unsafe {
        LOG_BUF.read_pos = 0;
        LOG_BUF.write_pos = 0;
    }
    // set_logger fails harmlessly after the first boot of this image.
    let _ = log::set_logger(&KERNEL_LOG);
    log::set_max_level(LevelFilter::Info);
}

pub fn klog_set_level(level: LevelFilter) {
    log::set_max_level(level);
}

pub fn klog_readable_bytes() -> usize {
    unsafe {
        LOG_BUF.lock.acquire();
        let n = LOG_BUF.readable_bytes();
        LOG_BUF.lock.release();
        n
    }
}

/// Drain up to dst.len() bytes of buffered log text.
pub fn klog_read(dst: &mut [u8]) -> usize {
    unsafe {
        LOG_BUF.lock.acquire();
        let mut copied = 0;
        while copied < dst.len() {
            match LOG_BUF.pop_byte() {
                Some(b) => {
                    dst[copied] = b;
                    copied += 1;
                }
                None => break,
            }
        }
        LOG_BUF.lock.release();
        copied
    }
}

/// Empty the ring onto the console. Returns the number of bytes printed.
pub fn klog_dump_to_console() -> usize {
    let mut printed = 0;
    loop {
        let b = unsafe {
            LOG_BUF.lock.acquire();
            let b = LOG_BUF.pop_byte();
            LOG_BUF.lock.release();
            b
        };
        match b {
            // print outside the klog lock; consputc spins on the UART.
            Some(b) => {
                consputc(b);
                printed += 1;
            }
            None => break,
        }
    }
    printed
}
