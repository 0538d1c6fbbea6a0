//! Syscall dispatch integration tests against the fully initialized core
//! (global singletons, mock HAL backend, router bindings).
//!
//! Globals initialize once per process, so the whole flow runs inside a
//! single test function.

use nimbus_kernel::{
    bootstrap,
    hal::{mock::TestArena, Hal},
    irq,
    mm::{PageFlags, VirtualAddress, PAGE_SIZE},
    syscall::{self, nr, SyscallFrame, SENTINEL, SYS_MAX},
};

fn call(number: u16, args: [u64; 6]) -> isize {
    let mut frame = SyscallFrame::new(number, args);
    let hal = bootstrap::hal().expect("HAL initialized");
    irq::deliver_syscall(hal, &mut frame);
    frame.ret as isize
}

#[test]
fn syscall_surface() {
    // The arena backs the global frame allocator for the process lifetime.
    let arena = Box::leak(Box::new(TestArena::new(256 * PAGE_SIZE)));
    bootstrap::init_with(arena.boot(), arena.mapper()).expect("bootstrap");

    // --- unknown numbers return the -1 sentinel --------------------------
    assert_eq!(call(SYS_MAX, [0; 6]), SENTINEL);
    assert_eq!(call(nr::MPROTECT, [0; 6]), SENTINEL); // reserved, unimplemented
    assert_eq!(call(nr::OPEN, [0; 6]), SENTINEL); // file ops live elsewhere
    assert_eq!(call(nr::SOCKET, [0; 6]), SENTINEL); // sockets live elsewhere

    // --- process identity ------------------------------------------------
    // The boot flow is the idle task, pid 1, with no parent.
    assert_eq!(call(nr::GETPID, [0; 6]), 1);
    assert_eq!(call(nr::GETPPID, [0; 6]), 0);
    assert_eq!(call(nr::YIELD, [0; 6]), 0);

    // --- user-memory plumbing -------------------------------------------
    // Hand the current (kernel template) space a user page so the
    // pointer-taking syscalls have somewhere to write.
    let user_buf = VirtualAddress::new(0x0001_0000);
    let frame = bootstrap::with_kernel(|hal, frames, _vmm, _sched| {
        let frame = frames.alloc_zeroed_frame().expect("frame");
        assert!(hal.map(
            frames,
            hal.current_space(),
            user_buf,
            frame,
            PageFlags::user_data()
        ));
        frame
    })
    .expect("kernel initialized");

    // uname fills five 65-byte fields.
    assert_eq!(call(nr::UNAME, [user_buf.as_u64(), 0, 0, 0, 0, 0]), 0);
    let read_back = bootstrap::with_kernel(|_hal, frames, _vmm, _sched| {
        let ptr = frames.mapper().translate(frame);
        let mut buf = [0u8; 6];
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), 6) };
        buf
    })
    .expect("kernel initialized");
    assert_eq!(&read_back, b"Nimbus");

    // getrandom fills the requested length and returns it.
    assert_eq!(call(nr::GETRANDOM, [user_buf.as_u64(), 32, 0, 0, 0, 0]), 32);

    // debug_print consumes a user string.
    let msg = b"hello from user";
    bootstrap::with_kernel(|hal, frames, vmm, _sched| {
        vmm.copy_to_user(hal, frames, user_buf, msg).expect("copy_to_user")
    })
    .expect("kernel initialized");
    assert_eq!(
        call(nr::DEBUG_PRINT, [user_buf.as_u64(), msg.len() as u64, 0, 0, 0, 0]),
        msg.len() as isize
    );

    // Null user pointers are EFAULT, not a crash.
    assert_eq!(call(nr::UNAME, [0; 6]), -14);

    // --- time ------------------------------------------------------------
    // Drive the timer binding through the router, as the tick IRQ would.
    irq::set_tick_period_ms(10);
    let before = irq::uptime_ms();
    let hal = bootstrap::hal().expect("HAL initialized");
    let timer = hal.caps().timer_vector;
    irq::deliver_irq(hal, timer);
    irq::deliver_irq(hal, timer);
    assert_eq!(irq::uptime_ms(), before + 20);

    assert_eq!(
        call(nr::GETTIMEOFDAY, [user_buf.as_u64(), 0, 0, 0, 0, 0]),
        0
    );
    assert_eq!(
        call(nr::CLOCK_GETTIME, [0, user_buf.as_u64(), 0, 0, 0, 0]),
        0
    );
    let time_ret = call(nr::TIME, [0; 6]);
    assert!(time_ret >= 0);

    // --- error discipline ------------------------------------------------
    // brk from a task with no user extents (the idle task).
    assert_eq!(call(nr::BRK, [0x5000_0000, 0, 0, 0, 0, 0]), -95); // EOPNOTSUPP
    // waitpid with no children.
    assert_eq!(call(nr::WAITPID, [0, 0, 1, 0, 0, 0]), -10); // ECHILD
    // kill on a pid nobody owns.
    assert_eq!(call(nr::KILL, [200, 9, 0, 0, 0, 0]), -3); // ESRCH
    // kill sig 0 probes existence.
    assert_eq!(call(nr::KILL, [1, 0, 0, 0, 0, 0]), 0);
    // nanosleep rejects a malformed timespec pointer.
    assert_eq!(call(nr::NANOSLEEP, [0, 0, 0, 0, 0, 0]), -14); // EFAULT

    // --- external registration -------------------------------------------
    fn fake_open(_frame: &mut SyscallFrame) -> syscall::SyscallResult {
        Ok(3)
    }
    syscall::SYSCALL_TABLE
        .lock()
        .register(nr::OPEN, fake_open)
        .expect("register");
    assert_eq!(call(nr::OPEN, [0; 6]), 3);
    syscall::SYSCALL_TABLE
        .lock()
        .unregister(nr::OPEN)
        .expect("unregister");
    assert_eq!(call(nr::OPEN, [0; 6]), SENTINEL);
}
