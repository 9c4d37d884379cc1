#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// Kernel image shell. On the board, the boot assembly (entry stack setup,
// machine-mode configuration) jumps to kmain; everything else, including
// the test suite, drives the kernel library against the simulated
// machine.

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        rvos::start::kmain();
        loop {}
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        rvos::riscv::intr_off();
        unsafe {
            rvos::printf::PRINTER.locking = false;
        }
        rvos::printf!("panic: {}\n", info);
        loop {}
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    use std::io::Write;

    fn sink(b: u8) {
        let _ = std::io::stdout().write_all(&[b]);
    }

    rvos::sim::set_console_sink(sink);
    rvos::start::kmain();
    let _ = std::io::stdout().flush();
}
