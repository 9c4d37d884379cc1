// Context switches.
//
// swtch saves the callee-saved register set and stack pointer into the old
// context, then loads the new context and jumps to its saved return
// address. It is the only way kernel stacks change hands: the scheduler
// switches into a process here and the process switches back in sched().
//
// The saved set is whatever the architecture's calling convention makes
// callee-saved; the rest of the kernel touches only ra and sp (to aim a
// fresh process at forkret on its own stack). The riscv64 flavor is the
// real kernel's; x86_64 and aarch64 exist so the hosted build
// context-switches for real too.

use core::arch::global_asm;

#[cfg(target_arch = "riscv64")]
pub const NSAVED: usize = 12; // s0-s11
#[cfg(target_arch = "x86_64")]
pub const NSAVED: usize = 6; // rbx, rbp, r12-r15
#[cfg(target_arch = "aarch64")]
pub const NSAVED: usize = 11; // x19-x28, x29

#[cfg(not(any(
    target_arch = "riscv64",
    target_arch = "x86_64",
    target_arch = "aarch64"
)))]
compile_error!("no swtch implementation for this architecture");

/// Saved registers for kernel context switches.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    saved: [u64; NSAVED], // callee-saved registers, in the asm's order
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            saved: [0; NSAVED],
        }
    }
}

extern "C" {
    /// Save the current register context in old, load the one in new.
    pub fn swtch(old: *mut Context, new: *const Context);
}

/// Initial stack pointer for a context that has never run: the ABI's
/// expected alignment at function entry, just below the stack top.
pub fn initial_sp(stack_top: usize) -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        // entered by jmp, so rsp must look as if a call just pushed a
        // return address: 8 below a 16-byte boundary.
        (stack_top & !0xF) - 8
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        stack_top & !0xF
    }
}

#[cfg(target_arch = "riscv64")]
global_asm!(
    r#"
.globl swtch
swtch:
        sd ra, 0(a0)
        sd sp, 8(a0)
        sd s0, 16(a0)
        sd s1, 24(a0)
        sd s2, 32(a0)
        sd s3, 40(a0)
        sd s4, 48(a0)
        sd s5, 56(a0)
        sd s6, 64(a0)
        sd s7, 72(a0)
        sd s8, 80(a0)
        sd s9, 88(a0)
        sd s10, 96(a0)
        sd s11, 104(a0)

        ld ra, 0(a1)
        ld sp, 8(a1)
        ld s0, 16(a1)
        ld s1, 24(a1)
        ld s2, 32(a1)
        ld s3, 40(a1)
        ld s4, 48(a1)
        ld s5, 56(a1)
        ld s6, 64(a1)
        ld s7, 72(a1)
        ld s8, 80(a1)
        ld s9, 88(a1)
        ld s10, 96(a1)
        ld s11, 104(a1)

        ret
"#
);

#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
.globl swtch
swtch:
        mov rax, [rsp]
        mov [rdi + 0x00], rax       # ra = return address
        lea rax, [rsp + 8]
        mov [rdi + 0x08], rax       # sp = stack after return
        mov [rdi + 0x10], rbx
        mov [rdi + 0x18], rbp
        mov [rdi + 0x20], r12
        mov [rdi + 0x28], r13
        mov [rdi + 0x30], r14
        mov [rdi + 0x38], r15

        mov r11, [rsi + 0x00]
        mov rsp, [rsi + 0x08]
        mov rbx, [rsi + 0x10]
        mov rbp, [rsi + 0x18]
        mov r12, [rsi + 0x20]
        mov r13, [rsi + 0x28]
        mov r14, [rsi + 0x30]
        mov r15, [rsi + 0x38]
        jmp r11
"#
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
.globl swtch
swtch:
        mov x9, sp
        str x30, [x0, 0]
        str x9,  [x0, 8]
        stp x19, x20, [x0, 16]
        stp x21, x22, [x0, 32]
        stp x23, x24, [x0, 48]
        stp x25, x26, [x0, 64]
        stp x27, x28, [x0, 80]
        str x29, [x0, 96]

        ldr x30, [x1, 0]
        ldr x9,  [x1, 8]
        mov sp, x9
        ldp x19, x20, [x1, 16]
        ldp x21, x22, [x1, 32]
        ldp x23, x24, [x1, 48]
        ldp x25, x26, [x1, 64]
        ldp x27, x28, [x1, 80]
        ldr x29, [x1, 96]
        ret
"#
);
