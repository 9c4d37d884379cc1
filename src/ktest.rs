// Host test harness. The kernel is one big singleton, so every test
// serializes on a process-wide mutex and power-cycles the simulated
// machine before it runs.

use std::sync::Mutex;

static KERNEL: Mutex<()> = Mutex::new(());

fn boot() {
    crate::sim::machine_reset();
    crate::proc::procinit(); // also clears the hart state
    crate::klog::klog_init();
    crate::vm::vm_stats_reset();
    crate::kalloc::pmem_init();
    crate::vm::kvminit();
    crate::vm::kvminithart();
    crate::trap::trap_init();
    crate::bio::binit();
    crate::bio::disk_clear();
}

/// Boot the core (allocator, VM, traps, buffer cache) and run the test.
pub fn run(f: impl FnOnce()) {
    let _g = KERNEL.lock().unwrap_or_else(|e| e.into_inner());
    boot();
    f();
}

/// Boot the core plus a fresh file system.
pub fn run_fs(f: impl FnOnce()) {
    let _g = KERNEL.lock().unwrap_or_else(|e| e.into_inner());
    boot();
    crate::fs::fs_init(crate::param::ROOTDEV);
    crate::file::fileinit();
    f();
}
