// Formatted console output.

use core::fmt::{Arguments, Write};

use crate::console::{Color, reset_color, set_color, CONSOLE_INSTANCE};
use crate::spinlock::Spinlock;

pub static mut PRINTER: Printer = Printer {
    lock: Spinlock::init_lock("pr"),
    locking: true,
};

/// lock to avoid interleaving concurrent printf's.
pub struct Printer {
    lock: Spinlock,
    pub locking: bool,
}

impl Printer {
    pub fn printf(&mut self, args: Arguments<'_>) {
        let locking = self.locking;
        if locking {
            self.lock.acquire();
        }

        unsafe {
            let _ = CONSOLE_INSTANCE.write_fmt(args);
        }

        if locking {
            self.lock.release();
        }
    }

    pub fn printf_color(&mut self, fg: Color, bg: Option<Color>, args: Arguments<'_>) {
        let locking = self.locking;
        if locking {
            self.lock.acquire();
        }

        set_color(fg, bg);
        unsafe {
            let _ = CONSOLE_INSTANCE.write_fmt(args);
        }
        reset_color();

        if locking {
            self.lock.release();
        }
    }
}

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        unsafe {
            $crate::printf::PRINTER.printf(core::format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! printf_color {
    ($fg:expr, $bg:expr, $($arg:tt)*) => {
        unsafe {
            $crate::printf::PRINTER.printf_color($fg, $bg, core::format_args!($($arg)*))
        }
    };
}
