// Kernel bring-up, and the demonstration workload the hosted binary runs.
//
// On the board this is what the boot assembly jumps into once it has set
// up machine mode; hosted, main() calls it directly and the scheduler
// returns when the demo processes have drained from the table.

use crate::console::{consoleinit, Color};
use crate::bio::{buffer_cache_hits, buffer_cache_misses, disk_read_count, disk_write_count};
use crate::file::{filealloc, fileclose, fileinit, fileread, filewrite};
use crate::fs::{count_free_blocks, count_free_inodes, create, fs_init, T_FILE};
use crate::kalloc::{free_pages, pmem_init, total_pages};
use crate::klog::{klog_dump_to_console, klog_init};
use crate::param::ROOTDEV;
use crate::proc::{
    create_process, debug_proc, exit, fork, myproc, procinit, scheduler, wait,
};
use crate::trap::{sleep_ticks, ticks, trap_init};
use crate::vm::{kvminit, kvminithart};
use crate::{printf, printf_color};

/// Boot the kernel and run the demo workload.
pub fn kmain() {
    consoleinit();
    klog_init();

    printf!("\nrvos kernel is booting...\n\n");

    pmem_init(); // physical page allocator
    kvminit(); // kernel page table
    kvminithart(); // turn on paging
    procinit(); // process table
    trap_init(); // trap vectors and timer
    fs_init(ROOTDEV); // buffer cache, inodes, log recovery, root dir
    fileinit(); // file table

    printf!("boot: {} pages free of {}\n", free_pages(), total_pages());
    printf_color!(Color::Green, None, "\nSystem boot successful\n\n");

    let first = create_process(demo_main, 1);

    #[cfg(target_os = "none")]
    {
        // on the board the first process stands in for init and may not
        // exit; hosted, the demo draining out is how the run ends.
        crate::proc::mark_init_process(first);
        loop {
            scheduler();
        }
    }

    #[cfg(not(target_os = "none"))]
    let _ = first;

    #[cfg(not(target_os = "none"))]
    {
        scheduler();
        printf!("\nscheduler idle; machine summary:\n");
        printf!(
            "  cache hits {} misses {}, disk reads {} writes {}\n",
            buffer_cache_hits(),
            buffer_cache_misses(),
            disk_read_count(),
            disk_write_count()
        );
        printf!(
            "  free blocks {}, free inodes {}, ticks {}\n",
            count_free_blocks(),
            count_free_inodes(),
            ticks()
        );
    }
}

// The demonstration process: exercises the file system, fork/wait, the
// timer, and the kernel log. A forked child re-enters here with arg 0.
extern "C" fn demo_main(arg: u64) {
    if arg == 0 {
        exit(33);
    }

    let pid = myproc().map(|p| p.pid).unwrap_or(-1);
    printf!("demo: running as pid {}\n", pid);
    log::info!("demo workload starting");

    // a file written through the log, read back through a descriptor.
    if let Some(ip) = create("/readme", T_FILE) {
        if let Some(f) = filealloc() {
            f.readable = true;
            f.writable = true;
            f.ip = ip as *mut _;
            let text = b"hello from the inode layer\n";
            let w = filewrite(f, text);
            f.off = 0;
            let mut back = [0u8; 64];
            let r = fileread(f, &mut back);
            printf!("demo: wrote {} bytes, read {} back: ", w, r);
            for &b in &back[..r.max(0) as usize] {
                crate::console::consputc(b);
            }
            fileclose(f);
        }
    }

    // one child, reaped with its status.
    let child = fork();
    if child > 0 {
        let mut st: i32 = 0;
        let got = wait(&mut st as *mut i32 as usize);
        printf!("demo: child {} exited with status {}\n", got, st);
    }

    let before = ticks();
    sleep_ticks(3);
    printf!("demo: slept from tick {} to tick {}\n", before, ticks());

    debug_proc();

    printf!("demo: kernel log follows\n");
    klog_dump_to_console();

    // the board's init never exits; it keeps pulsing with the timer.
    #[cfg(target_os = "none")]
    loop {
        sleep_ticks(100);
    }
}
