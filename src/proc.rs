// Processes: the table, the scheduler, and the fork/exit/wait lifecycle.
//
// Lock order matters here. PROC_LOCK guards table scans, each proc's own
// lock guards its state and context, and WAIT_LOCK serializes the
// parent/child rendezvous. A context switch happens only with the
// switching process's lock held and interrupts off.

use core::mem;
use core::ptr;

use static_assertions::const_assert;

use crate::kalloc::{alloc_pages, free_page, pmem_range};
use crate::param::{KSTACKPAGES, NPROC, PNAMELEN};
use crate::printf;
use crate::riscv::{intr_get, intr_on, PageTable, Pte, PGSIZE};
use crate::spinlock::Spinlock;
use crate::string::memmove;
use crate::swtch::{initial_sp, swtch, Context};
use crate::vm::{
    copy_user_memory, copyout_user, create_pagetable, destroy_pagetable, walk_lookup, walkaddr,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl Procstate {
    pub fn name(self) -> &'static str {
        match self {
            Procstate::Unused => "UNUSED",
            Procstate::Used => "USED",
            Procstate::Sleeping => "SLEEPING",
            Procstate::Runnable => "RUNNABLE",
            Procstate::Running => "RUNNING",
            Procstate::Zombie => "ZOMBIE",
        }
    }
}

// The saved user register image, written on each trap into the kernel.
// It lives at the top of the process's kernel stack and is never freed
// on its own. For a kernel thread, epc carries the entry function and
// a0 its argument; forkret reads both on first dispatch.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub kernel_hartid: u64, // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

const_assert!(mem::size_of::<Trapframe>() == 288);
// the trap frame and a usable stack share the kernel stack pages.
const_assert!(mem::size_of::<Trapframe>() + 1024 < KSTACKPAGES * PGSIZE);

// Per-CPU state.
pub struct Cpu {
    pub proc: *mut Proc, // The process running on this cpu, or null.
    pub context: Context, // swtch() here to enter scheduler().
    pub noff: i32, // Depth of push_off() nesting.
    pub intena: bool, // Were interrupts enabled before push_off()?
}

// one hart.
static mut CPU0: Cpu = Cpu {
    proc: ptr::null_mut(),
    context: Context::zeroed(),
    noff: 0,
    intena: false,
};

pub fn cpuid() -> usize {
    0
}

// Return this CPU's cpu struct.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPU0 }
}

// Per-process state.
pub struct Proc {
    pub lock: Spinlock,

    // p->lock must be held when using these:
    pub state: Procstate,
    pub chan: usize, // If non-zero, sleeping on chan
    pub killed: bool,
    pub xstate: i32, // Exit status to be returned to parent's wait
    pub pid: i32,

    // wait_lock must be held when using this:
    pub parent: *mut Proc,

    // these are private to the process, so p->lock need not be held.
    pub kstack: usize, // Bottom of the kernel stack pages
    pub sz: usize, // Size of user memory (bytes)
    pub pagetable: *mut PageTable,
    pub trapframe: *mut Trapframe,
    pub context: Context, // swtch() here to run process
    pub name: [u8; PNAMELEN], // Process name (debugging)
}

impl Proc {
    const fn new() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: Procstate::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: ptr::null_mut(),
            kstack: 0,
            sz: 0,
            pagetable: ptr::null_mut(),
            trapframe: ptr::null_mut(),
            context: Context::zeroed(),
            name: [0; PNAMELEN],
        }
    }
}

static mut PROCS: [Proc; NPROC] = [const { Proc::new() }; NPROC];

static mut PROC_LOCK: Spinlock = Spinlock::init_lock("proc_lock");
// helps ensure that wakeups of wait()ing
// parents are not lost; must be acquired
// before any p->lock.
static mut WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

// next pid, under PROC_LOCK.
static mut NEXT_PID: i32 = 1;

// the process that must never exit, once the bring-up names it.
static mut INIT_PROC: *mut Proc = ptr::null_mut();

/// Reset the process subsystem: table empty, this hart idle.
pub fn procinit() {
    unsafe {
        CPU0.proc = ptr::null_mut();
        CPU0.context = Context::zeroed();
        CPU0.noff = 0;
        CPU0.intena = false;
        NEXT_PID = 1;
        INIT_PROC = ptr::null_mut();

        for p in PROCS.iter_mut() {
            p.state = Procstate::Unused;
            p.chan = 0;
            p.killed = false;
            p.xstate = 0;
            p.pid = 0;
            p.parent = ptr::null_mut();
            p.kstack = 0;
            p.sz = 0;
            p.pagetable = ptr::null_mut();
            p.trapframe = ptr::null_mut();
            p.context = Context::zeroed();
            p.name = [0; PNAMELEN];
        }
    }
    log::info!("proc: table of {} slots ready", NPROC);
}

/// The current process, if this hart is running one.
pub fn myproc() -> Option<&'static mut Proc> {
    crate::spinlock::push_off();
    let p = mycpu().proc;
    crate::spinlock::pop_off();
    if p.is_null() {
        None
    } else {
        Some(unsafe { &mut *p })
    }
}

/// Record the process that must never exit (the board's init).
pub fn mark_init_process(pid: i32) {
    unsafe { PROC_LOCK.acquire() };
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state != Procstate::Unused && p.pid == pid {
            unsafe { INIT_PROC = &mut *p };
        }
        p.lock.release();
    }
    unsafe { PROC_LOCK.release() };
}

fn allocpid() -> i32 {
    unsafe {
        let pid = NEXT_PID;
        NEXT_PID += 1;
        pid
    }
}

// Look in the process table for an UNUSED proc.
// If found, initialize state required to run in the kernel,
// and return with p->lock held.
// If there are no free procs, or a memory allocation fails, return None.
fn allocproc() -> Option<&'static mut Proc> {
    unsafe { PROC_LOCK.acquire() };

    let mut found: Option<&'static mut Proc> = None;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state == Procstate::Unused {
            found = Some(p);
            break;
        }
        p.lock.release();
    }

    let p = match found {
        Some(p) => p,
        None => {
            unsafe { PROC_LOCK.release() };
            return None;
        }
    };

    p.pid = allocpid();
    p.state = Procstate::Used;

    // The kernel stack is allocated once per slot and reused; the trap
    // frame sits at its top, the stack grows below it.
    if p.kstack == 0 {
        let kstack = alloc_pages(KSTACKPAGES);
        if kstack.is_null() {
            freeproc(p);
            p.lock.release();
            unsafe { PROC_LOCK.release() };
            return None;
        }
        p.kstack = kstack as usize;
    }
    let stack_top = p.kstack + KSTACKPAGES * PGSIZE;
    let tf = (stack_top - mem::size_of::<Trapframe>()) & !0xF;
    p.trapframe = tf as *mut Trapframe;
    unsafe { *p.trapframe = mem::zeroed() };

    // An empty user page table.
    p.pagetable = create_pagetable();
    if p.pagetable.is_null() {
        freeproc(p);
        p.lock.release();
        unsafe { PROC_LOCK.release() };
        return None;
    }

    // Set up new context to start executing at forkret.
    p.context = Context::zeroed();
    p.context.ra = forkret as usize as u64;
    p.context.sp = initial_sp(tf) as u64;

    unsafe { PROC_LOCK.release() };
    Some(p)
}

// free a proc structure and the data hanging from it.
// The trap frame lives inside the kernel stack pages and is not freed
// separately; the stack itself stays with the slot for reuse.
// p->lock must be held.
fn freeproc(p: &mut Proc) {
    p.trapframe = ptr::null_mut();
    if !p.pagetable.is_null() {
        proc_freepagetable(p.pagetable, p.sz);
    }
    p.pagetable = ptr::null_mut();
    p.sz = 0;
    p.pid = 0;
    p.parent = ptr::null_mut();
    p.name = [0; PNAMELEN];
    p.chan = 0;
    p.killed = false;
    p.xstate = 0;
    p.state = Procstate::Unused;
}

/// Free a process's page table along with the user pages it maps.
pub fn proc_freepagetable(pagetable: *mut PageTable, sz: usize) {
    let mut va = 0;
    while va < sz {
        let pte = walk_lookup(pagetable, va);
        if !pte.is_null() && unsafe { (*pte).is_valid() } {
            let pa = unsafe { (*pte).pa() };
            unsafe { *pte = Pte::INVALID };
            free_page(pa as *mut u8);
        }
        va += PGSIZE;
    }
    destroy_pagetable(pagetable);
}

/// A process's very first scheduling by scheduler() switches here.
pub extern "C" fn forkret() {
    // Still holding p->lock from scheduler.
    let p = myproc().expect("forkret");
    p.lock.release();

    // Enter the process body recorded in the trap frame: the entry
    // function in epc, its argument in a0 (0 for a forked child).
    let tf = unsafe { &*p.trapframe };
    if tf.epc == 0 {
        panic!("forkret: no entry");
    }
    let entry: extern "C" fn(u64) = unsafe { mem::transmute(tf.epc as usize) };
    let arg = tf.a0;
    entry(arg);

    // the body returned instead of exiting; clean exit on its behalf.
    exit(0);
}

/// Spawn a kernel thread running entry(arg). Returns its pid, or -1.
pub fn create_process(entry: extern "C" fn(u64), arg: u64) -> i32 {
    let parent = mycpu().proc;

    let p = match allocproc() {
        Some(p) => p,
        None => return -1,
    };

    unsafe {
        (*p.trapframe).epc = entry as usize as u64;
        (*p.trapframe).a0 = arg;
    }

    unsafe {
        WAIT_LOCK.acquire();
        p.parent = parent;
        WAIT_LOCK.release();
    }

    // name it proc<pid>.
    let mut name = [0u8; PNAMELEN];
    let mut i = 0;
    for b in b"proc" {
        name[i] = *b;
        i += 1;
    }
    let mut pid = p.pid;
    let mut digits = [0u8; 10];
    let mut d = 0;
    loop {
        digits[d] = b'0' + (pid % 10) as u8;
        pid /= 10;
        d += 1;
        if pid == 0 {
            break;
        }
    }
    while d > 0 && i < PNAMELEN - 1 {
        d -= 1;
        name[i] = digits[d];
        i += 1;
    }
    p.name = name;

    let pid = p.pid;
    unsafe { PROC_LOCK.acquire() };
    p.state = Procstate::Runnable;
    p.lock.release();
    unsafe { PROC_LOCK.release() };

    pid
}

/// Create a child that is a copy of the calling process: same user
/// memory (private copies of the pages), same trap frame except that the
/// child's a0 is 0. The parent gets the child's pid; the child's first
/// dispatch re-enters the recorded entry with argument 0.
pub fn fork() -> i32 {
    let p = match myproc() {
        Some(p) => p,
        None => return -1,
    };

    let np = match allocproc() {
        Some(np) => np,
        None => return -1,
    };

    // give the child private copies of the parent's user pages.
    if p.sz > 0 && copy_user_memory(p.pagetable, np.pagetable, p.sz).is_err() {
        freeproc(np);
        np.lock.release();
        return -1;
    }
    np.sz = p.sz;

    unsafe {
        *np.trapframe = *p.trapframe;
        (*np.trapframe).a0 = 0; // fork returns 0 in the child
    }

    np.name = p.name;

    let pid = np.pid;

    unsafe {
        WAIT_LOCK.acquire();
        np.parent = &mut *p;
        WAIT_LOCK.release();
    }

    unsafe { PROC_LOCK.acquire() };
    np.state = Procstate::Runnable;
    np.lock.release();
    unsafe { PROC_LOCK.release() };

    pid
}

/// Exit the current process with the given status; does not return.
/// Resources are not released here: the parent's wait() reaps them.
pub fn exit(status: i32) -> ! {
    let p = myproc().expect("exit");
    let pself: *mut Proc = &mut *p;

    if pself == unsafe { INIT_PROC } {
        panic!("init exiting");
    }

    p.lock.acquire();
    p.xstate = status;
    p.state = Procstate::Zombie;

    // wake the parent sleeping in wait(); the channel is the parent.
    unsafe {
        WAIT_LOCK.acquire();
        if !p.parent.is_null() {
            wakeup(p.parent as usize);
        }
        WAIT_LOCK.release();
    }

    sched();
    panic!("zombie exit");
}

/// Wait for a child to exit; returns its pid and stores the exit status
/// through addr (if non-zero), or returns -1 if there is nothing to wait
/// for or the caller has been killed.
pub fn wait(addr: usize) -> i32 {
    let p = myproc().expect("wait");
    let pself: *mut Proc = &mut *p;

    unsafe { WAIT_LOCK.acquire() };

    loop {
        let mut havekids = false;
        for i in 0..NPROC {
            let pp = unsafe { &mut PROCS[i] };
            if pp.parent != pself {
                continue;
            }
            pp.lock.acquire();
            havekids = true;
            if pp.state == Procstate::Zombie {
                let pid = pp.pid;
                let xstate = pp.xstate;
                if addr != 0
                    && either_copyout(
                        p,
                        addr,
                        &xstate as *const i32 as *const u8,
                        mem::size_of::<i32>(),
                    ) < 0
                {
                    pp.lock.release();
                    unsafe { WAIT_LOCK.release() };
                    return -1;
                }
                freeproc(pp);
                pp.lock.release();
                unsafe { WAIT_LOCK.release() };
                return pid;
            }
            pp.lock.release();
        }

        if !havekids || p.killed {
            unsafe { WAIT_LOCK.release() };
            return -1;
        }

        // sleep on ourselves; exit() uses the parent as the channel.
        sleep(pself as usize, unsafe { &mut WAIT_LOCK });
    }
}

/// Mark the process with the given pid as killed; a sleeping victim is
/// made runnable so it can notice.
pub fn kill(pid: i32) -> i32 {
    unsafe { PROC_LOCK.acquire() };
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state != Procstate::Unused && p.pid == pid {
            p.killed = true;
            if p.state == Procstate::Sleeping {
                p.state = Procstate::Runnable;
            }
            p.lock.release();
            unsafe { PROC_LOCK.release() };
            return 0;
        }
        p.lock.release();
    }
    unsafe { PROC_LOCK.release() };
    -1
}

/// Has the current process been killed?
pub fn is_killed() -> bool {
    match myproc() {
        Some(p) => {
            p.lock.acquire();
            let k = p.killed;
            p.lock.release();
            k
        }
        None => false,
    }
}

/// Atomically release lk and sleep on chan; reacquires lk when awakened.
/// Taking our own lock before dropping lk is what closes the window a
/// wakeup could otherwise fall into.
pub fn sleep(chan: usize, lk: &mut Spinlock) {
    let p = myproc().expect("sleep");

    p.lock.acquire();
    lk.release();

    p.chan = chan;
    p.state = Procstate::Sleeping;

    sched();

    p.chan = 0;
    p.lock.release();
    lk.acquire();
}

/// Make every process sleeping on chan runnable.
/// The caller must not hold any process lock.
pub fn wakeup(chan: usize) {
    let me = mycpu().proc;
    unsafe { PROC_LOCK.acquire() };
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        let pptr: *mut Proc = &mut *p;
        if pptr == me {
            continue;
        }
        p.lock.acquire();
        if p.state == Procstate::Sleeping && p.chan == chan {
            p.state = Procstate::Runnable;
        }
        p.lock.release();
    }
    unsafe { PROC_LOCK.release() };
}

/// Give up the CPU for one scheduling round.
pub fn yield_proc() {
    let p = myproc().expect("yield");
    p.lock.acquire();
    p.state = Procstate::Runnable;
    sched();
    p.lock.release();
}

/// Switch to the scheduler. The caller must hold exactly its own process
/// lock, have interrupts off, and have already changed its state.
pub fn sched() {
    let p = myproc().expect("sched");

    if !p.lock.holding() {
        panic!("sched p->lock");
    }
    if mycpu().noff != 1 {
        panic!("sched locks");
    }
    if p.state == Procstate::Running {
        panic!("sched running");
    }
    if intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    unsafe { swtch(&mut p.context, &mycpu().context) };
    mycpu().intena = intena;
}

/// Per-hart scheduler loop: pick a runnable process, switch to it, take
/// the CPU back when it calls sched(), repeat. Returns once the table
/// holds no process that could ever run again (the bring-up restarts it
/// if that is not terminal for the machine).
pub fn scheduler() {
    let c = mycpu();
    c.proc = ptr::null_mut();

    loop {
        // give pending device interrupts a chance between scans.
        intr_on();
        #[cfg(not(target_os = "none"))]
        crate::sim::clint_pump();

        let mut live = false;

        unsafe { PROC_LOCK.acquire() };
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            match p.state {
                Procstate::Runnable => {
                    // Switch to the chosen process. It is its job to
                    // release its lock and reacquire it before jumping
                    // back to us.
                    p.state = Procstate::Running;
                    c.proc = &mut *p;
                    unsafe { PROC_LOCK.release() };

                    unsafe { swtch(&mut c.context, &p.context) };

                    // Process is done running for now.
                    unsafe { PROC_LOCK.acquire() };
                    c.proc = ptr::null_mut();
                    live = true;
                }
                Procstate::Sleeping | Procstate::Used | Procstate::Running => {
                    live = true;
                }
                _ => {}
            }
            p.lock.release();
        }
        unsafe { PROC_LOCK.release() };

        if !live {
            break;
        }
    }
}

//
// user/kernel data transfer for callers that may be kernel threads.
//

/// Copy len bytes to dst in the process's address space, or directly into
/// kernel memory when dst is not a mapped user address (kernel threads
/// pass kernel pointers; the managed-RAM bounds check keeps this honest).
pub fn either_copyout(p: &mut Proc, dst: usize, src: *const u8, len: usize) -> i32 {
    if !p.pagetable.is_null() && walkaddr(p.pagetable, dst) != 0 {
        return copyout_user(p.pagetable, dst, src, len);
    }
    let (lo, hi) = pmem_range();
    if dst >= lo && dst + len <= hi {
        memmove(dst as *mut u8, src, len);
        return 0;
    }
    -1
}

/// The mirror of either_copyout for reads.
pub fn either_copyin(p: &mut Proc, dst: *mut u8, src: usize, len: usize) -> i32 {
    if !p.pagetable.is_null() && walkaddr(p.pagetable, src) != 0 {
        return crate::vm::copyin_user(p.pagetable, dst, src, len);
    }
    let (lo, hi) = pmem_range();
    if src >= lo && src + len <= hi {
        memmove(dst, src as *const u8, len);
        return 0;
    }
    -1
}

//
// observability.
//

#[derive(Copy, Clone)]
pub struct ProcInfo {
    pub pid: i32,
    pub state: &'static str,
    pub name: [u8; PNAMELEN],
}

/// Snapshot the non-empty process-table entries.
pub fn proc_snapshot(out: &mut [ProcInfo]) -> usize {
    let mut n = 0;
    unsafe { PROC_LOCK.acquire() };
    for i in 0..NPROC {
        if n >= out.len() {
            break;
        }
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state != Procstate::Unused {
            out[n] = ProcInfo {
                pid: p.pid,
                state: p.state.name(),
                name: p.name,
            };
            n += 1;
        }
        p.lock.release();
    }
    unsafe { PROC_LOCK.release() };
    n
}

/// Print every live process-table entry.
pub fn debug_proc() {
    printf!("=== Process Table ===\n");
    let mut snap = [ProcInfo {
        pid: 0,
        state: "",
        name: [0; PNAMELEN],
    }; NPROC];
    let n = proc_snapshot(&mut snap);
    for info in &snap[..n] {
        let len = info.name.iter().position(|&b| b == 0).unwrap_or(PNAMELEN);
        let name = core::str::from_utf8(&info.name[..len]).unwrap_or("?");
        printf!("PID:{} State:{} Name:{}\n", info.pid, info.state, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktest;
    use crate::trap::{sleep_ticks, ticks};
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

    // Process bodies run on their own kernel stacks, so test results are
    // reported through statics and asserted after scheduler() drains the
    // table. A failed assert inside a body would try to unwind across a
    // context switch, which helps nobody.

    static VAL: AtomicU32 = AtomicU32::new(0);

    extern "C" fn t_add(arg: u64) {
        VAL.fetch_add(arg as u32, Ordering::SeqCst);
    }

    #[test]
    fn kernel_threads_run_to_completion() {
        ktest::run(|| {
            VAL.store(0, Ordering::SeqCst);
            let pid1 = create_process(t_add, 5);
            let pid2 = create_process(t_add, 7);
            assert!(pid1 > 0);
            assert!(pid2 > pid1);

            scheduler();

            assert_eq!(VAL.load(Ordering::SeqCst), 12);
            // both ran to exit; with no parent to reap them they stay zombies.
            let mut snap = [ProcInfo {
                pid: 0,
                state: "",
                name: [0; PNAMELEN],
            }; NPROC];
            let n = proc_snapshot(&mut snap);
            assert_eq!(n, 2);
            assert!(snap[..n].iter().all(|i| i.state == "ZOMBIE"));
        });
    }

    static ORDER: [AtomicU32; 8] = [const { AtomicU32::new(0) }; 8];
    static ORDER_IDX: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn t_yielder(arg: u64) {
        for _ in 0..3 {
            let i = ORDER_IDX.fetch_add(1, Ordering::SeqCst);
            if i < ORDER.len() {
                ORDER[i].store(arg as u32, Ordering::SeqCst);
            }
            yield_proc();
        }
    }

    #[test]
    fn yield_round_robins() {
        ktest::run(|| {
            ORDER_IDX.store(0, Ordering::SeqCst);
            for s in &ORDER {
                s.store(0, Ordering::SeqCst);
            }
            create_process(t_yielder, 1);
            create_process(t_yielder, 2);
            scheduler();

            assert_eq!(ORDER_IDX.load(Ordering::SeqCst), 6);
            // strict alternation: the scheduler scans in slot order.
            for i in 0..6 {
                let want = 1 + (i % 2) as u32;
                assert_eq!(ORDER[i].load(Ordering::SeqCst), want);
            }
        });
    }

    static R_FORK: AtomicI32 = AtomicI32::new(-2);
    static R_WAITPID: AtomicI32 = AtomicI32::new(-2);
    static R_STATUS: AtomicI32 = AtomicI32::new(-2);
    static R_SECOND: AtomicI32 = AtomicI32::new(-2);

    extern "C" fn t_forker(arg: u64) {
        if arg == 0 {
            // the child comes back through the entry with a0 == 0.
            exit(42);
        }
        let pid = fork();
        R_FORK.store(pid, Ordering::SeqCst);
        if pid > 0 {
            let mut st: i32 = -1;
            let got = wait(&mut st as *mut i32 as usize);
            R_WAITPID.store(got, Ordering::SeqCst);
            R_STATUS.store(st, Ordering::SeqCst);
            // the zombie was reaped; a second wait finds nothing.
            R_SECOND.store(wait(0), Ordering::SeqCst);
        }
    }

    #[test]
    fn fork_exit_wait_roundtrip() {
        ktest::run(|| {
            R_FORK.store(-2, Ordering::SeqCst);
            R_WAITPID.store(-2, Ordering::SeqCst);
            R_STATUS.store(-2, Ordering::SeqCst);
            R_SECOND.store(-2, Ordering::SeqCst);

            assert!(create_process(t_forker, 1) > 0);
            scheduler();

            let child = R_FORK.load(Ordering::SeqCst);
            assert!(child > 0, "fork failed");
            assert_eq!(R_WAITPID.load(Ordering::SeqCst), child);
            assert_eq!(R_STATUS.load(Ordering::SeqCst), 42);
            assert_eq!(R_SECOND.load(Ordering::SeqCst), -1);
        });
    }

    // single-slot rendezvous buffer for the producer/consumer pair.
    struct Slot {
        lock: Spinlock,
        full: bool,
        value: u32,
    }

    static mut SLOT: Slot = Slot {
        lock: Spinlock::init_lock("slot"),
        full: false,
        value: 0,
    };

    fn slot_chan() -> usize {
        unsafe { core::ptr::addr_of!(SLOT) as usize }
    }

    static CONSUMED: AtomicU32 = AtomicU32::new(0);
    static IN_ORDER: AtomicBool = AtomicBool::new(true);

    extern "C" fn t_producer(_arg: u64) {
        for i in 1..=10u32 {
            unsafe {
                SLOT.lock.acquire();
                while SLOT.full {
                    sleep(slot_chan(), &mut SLOT.lock);
                }
                SLOT.value = i;
                SLOT.full = true;
                wakeup(slot_chan());
                SLOT.lock.release();
            }
        }
    }

    extern "C" fn t_consumer(_arg: u64) {
        for i in 1..=10u32 {
            unsafe {
                SLOT.lock.acquire();
                while !SLOT.full {
                    sleep(slot_chan(), &mut SLOT.lock);
                }
                if SLOT.value != i {
                    IN_ORDER.store(false, Ordering::SeqCst);
                }
                SLOT.full = false;
                wakeup(slot_chan());
                SLOT.lock.release();
            }
            CONSUMED.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn producer_consumer_in_order() {
        ktest::run(|| {
            unsafe {
                SLOT.full = false;
                SLOT.value = 0;
            }
            CONSUMED.store(0, Ordering::SeqCst);
            IN_ORDER.store(true, Ordering::SeqCst);

            create_process(t_producer, 0);
            create_process(t_consumer, 0);
            scheduler();

            assert_eq!(CONSUMED.load(Ordering::SeqCst), 10);
            assert!(IN_ORDER.load(Ordering::SeqCst));
        });
    }

    static WOKE: AtomicBool = AtomicBool::new(false);

    extern "C" fn t_napper(_arg: u64) {
        let t0 = ticks();
        sleep_ticks(2);
        WOKE.store(ticks() >= t0 + 2, Ordering::SeqCst);
    }

    #[test]
    fn timer_wakes_tick_sleepers() {
        ktest::run(|| {
            WOKE.store(false, Ordering::SeqCst);
            create_process(t_napper, 0);
            scheduler();
            assert!(WOKE.load(Ordering::SeqCst), "sleeper never woke");
        });
    }

    static VICTIM: AtomicI32 = AtomicI32::new(0);
    static KILLED_SEEN: AtomicBool = AtomicBool::new(false);
    static KILL_SLEEP_RET: AtomicI32 = AtomicI32::new(0);

    extern "C" fn t_victim(_arg: u64) {
        loop {
            if is_killed() {
                KILLED_SEEN.store(true, Ordering::SeqCst);
                exit(7);
            }
            yield_proc();
        }
    }

    extern "C" fn t_killer(_arg: u64) {
        kill(VICTIM.load(Ordering::SeqCst));
    }

    #[test]
    fn killed_process_observes_the_flag() {
        ktest::run(|| {
            KILLED_SEEN.store(false, Ordering::SeqCst);
            let v = create_process(t_victim, 0);
            VICTIM.store(v, Ordering::SeqCst);
            create_process(t_killer, 0);
            scheduler();
            assert!(KILLED_SEEN.load(Ordering::SeqCst));
        });
    }

    extern "C" fn t_sleeping_victim(_arg: u64) {
        // would sleep essentially forever; kill() must wake it.
        KILL_SLEEP_RET.store(sleep_ticks(1_000_000), Ordering::SeqCst);
    }

    #[test]
    fn kill_wakes_a_sleeping_process() {
        ktest::run(|| {
            KILL_SLEEP_RET.store(0, Ordering::SeqCst);
            let v = create_process(t_sleeping_victim, 0);
            VICTIM.store(v, Ordering::SeqCst);
            create_process(t_killer, 0);
            scheduler();
            assert_eq!(KILL_SLEEP_RET.load(Ordering::SeqCst), -1);
        });
    }

    extern "C" fn t_noop(_arg: u64) {}

    #[test]
    fn table_fills_up_at_nproc() {
        ktest::run(|| {
            let mut created = 0;
            for _ in 0..NPROC + 3 {
                if create_process(t_noop, 0) > 0 {
                    created += 1;
                } else {
                    break;
                }
            }
            assert_eq!(created, NPROC);
            scheduler();
        });
    }

    #[test]
    fn pids_increase_monotonically() {
        ktest::run(|| {
            let a = create_process(t_noop, 0);
            let b = create_process(t_noop, 0);
            let c = create_process(t_noop, 0);
            assert!(a < b && b < c);
            scheduler();
        });
    }
}
