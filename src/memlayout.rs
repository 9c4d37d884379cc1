// Physical memory layout.

// qemu -machine virt is set up like this,
// based on qemu's hw/riscv/virt.c:
//
// 00001000 -- boot ROM, provided by qemu
// 02000000 -- CLINT
// 10000000 -- uart0
// 80000000 -- boot ROM jumps here in machine mode
//             -kernel loads the kernel here
// unused RAM after 80000000.

// the kernel uses physical memory thus:
// 80000000 -- kernel text and data
// end -- start of kernel page allocation area
// PHYSTOP -- end of RAM used by the kernel
//
// On a hosted build there is no board; sim.rs stands in for the RAM
// window and the two MMIO devices, and kalloc/vm take their physical
// bounds from it instead of the linker symbols.

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;

// core local interruptor (CLINT), which contains the timer.
pub const CLINT: usize = 0x200_0000;
pub const CLINT_MTIME: usize = CLINT + 0xBFF8; // cycles since boot

#[macro_export]
macro_rules! CLINT_MTIMECMP {
    ( $hartid:expr ) => {
        $crate::memlayout::CLINT + 0x4000 + 8 * ($hartid)
    };
}

// the kernel expects there to be RAM
// for use by the kernel and user pages
// from physical address 0x80000000 to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;
