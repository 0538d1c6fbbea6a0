//! Process lifecycle glue
//!
//! fork, exec, exit, and waitpid, plus the bootstrap trampolines tasks
//! start in and the hooks external subsystems (fd table, ELF loader)
//! register with the core. Everything here operates on explicit scheduler
//! and VMM references; the global wrappers in `bootstrap` are only wiring.

extern crate alloc;

use alloc::string::String;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{
    child_wait_channel,
    scheduler::{self, Scheduler, USER_HEAP_MAX, USER_MMAP_BASE},
    task::{ExternRef, Pid, Task, TaskState, DEFAULT_TIME_SLICE},
};
use crate::{
    error::{KernelError, KernelResult},
    hal::Hal,
    mm::{vmm::UserExtents, FrameAllocator, PageFlags, VirtualAddress, Vmm},
};

/// Entry signature for kernel threads.
pub type KthreadEntry = extern "C" fn(usize);

/// What an external image loader reports back to exec.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: VirtualAddress,
    /// End of the loaded segments; the brk heap starts above it.
    pub program_end: VirtualAddress,
}

/// External image loader contract. The loader asks the core for writable
/// page backing at chosen user addresses via the callback and fills in the
/// content; the core owns all address-space bookkeeping around it.
pub type ExecLoader = fn(
    path: &str,
    map_page: &mut dyn FnMut(VirtualAddress, PageFlags) -> Option<*mut u8>,
) -> KernelResult<LoadedImage>;

/// Hook duplicating an external fd-table reference across fork.
pub type FdCloneHook = fn(ExternRef) -> ExternRef;

/// Hook releasing an external reference at exit.
pub type FdDropHook = fn(ExternRef);

static EXEC_LOADER: AtomicUsize = AtomicUsize::new(0);
static FD_CLONE_HOOK: AtomicUsize = AtomicUsize::new(0);
static FD_DROP_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Register the image loader exec delegates to.
pub fn set_exec_loader(loader: ExecLoader) {
    EXEC_LOADER.store(loader as usize, Ordering::Release);
}

/// Register the fd-table duplication hook used by fork.
pub fn set_fd_clone_hook(hook: FdCloneHook) {
    FD_CLONE_HOOK.store(hook as usize, Ordering::Release);
}

/// Register the release hook used at exit.
pub fn set_fd_drop_hook(hook: FdDropHook) {
    FD_DROP_HOOK.store(hook as usize, Ordering::Release);
}

fn exec_loader() -> Option<ExecLoader> {
    let raw = EXEC_LOADER.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // SAFETY: only set_exec_loader stores here, from a real fn pointer.
        Some(unsafe { core::mem::transmute::<usize, ExecLoader>(raw) })
    }
}

fn clone_extern_ref(r: ExternRef) -> ExternRef {
    let raw = FD_CLONE_HOOK.load(Ordering::Acquire);
    if raw == 0 {
        return r;
    }
    // SAFETY: only set_fd_clone_hook stores here, from a real fn pointer.
    let hook: FdCloneHook = unsafe { core::mem::transmute(raw) };
    hook(r)
}

fn drop_extern_ref(r: ExternRef) {
    let raw = FD_DROP_HOOK.load(Ordering::Acquire);
    if raw == 0 {
        return;
    }
    // SAFETY: only set_fd_drop_hook stores here, from a real fn pointer.
    let hook: FdDropHook = unsafe { core::mem::transmute(raw) };
    hook(r)
}

// ---------------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------------

/// Duplicate the current user task. The child shares every user page
/// copy-on-write, gets a duplicated kernel stack, and will observe return
/// value 0 from the syscall that forked it; the parent receives the child
/// pid.
pub fn fork<H: Hal>(
    sched: &mut Scheduler,
    hal: &H,
    frames: &FrameAllocator,
    vmm: &Vmm,
) -> KernelResult<Pid> {
    let (parent_pid, parent_space) = {
        let cur = sched.current_task().ok_or(KernelError::NotFound {
            what: "current task",
        })?;
        if !cur.is_user() {
            return Err(KernelError::NotSupported {
                operation: "fork from a kernel thread",
            });
        }
        (cur.pid, cur.addr_space)
    };

    let child_pid = sched.task_alloc().ok_or(KernelError::NoMemory {
        what: "task pool exhausted",
    })?;

    let child_space = vmm.clone_space_cow(hal, frames, parent_space)?;

    let child = {
        let Some(parent) = sched.task(parent_pid) else {
            let _ = vmm.destroy_space(hal, frames, child_space);
            return Err(KernelError::NotFound {
                what: "forking task",
            });
        };

        // Duplicate the kernel stack and re-point the saved stack registers
        // at the copy, so the child resumes the same syscall frame.
        let child_stack = parent.kernel_stack.clone();
        let mut context = parent.context.clone();
        context.rebase_stack(
            Task::stack_top(&parent.kernel_stack).as_u64(),
            Task::stack_top(&child_stack).as_u64(),
        );
        context.set_space(child_space);
        context.set_return_value(0);

        alloc::boxed::Box::new(Task {
            pid: child_pid,
            name: parent.name.clone(),
            state: TaskState::Ready,
            priority: parent.priority,
            time_slice: DEFAULT_TIME_SLICE,
            runtime_ticks: 0,
            context,
            kernel_stack: child_stack,
            addr_space: child_space,
            extents: parent.extents,
            user_entry: parent.user_entry,
            wait_channel: None,
            sleep_until_ms: None,
            parent: Some(parent_pid),
            exit_code: 0,
            fd_table: parent.fd_table.map(clone_extern_ref),
            cwd: parent.cwd.map(clone_extern_ref),
        })
    };

    sched.install(child);
    log::debug!("fork: pid {} -> child {}", parent_pid, child_pid);
    Ok(child_pid)
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// Replace the current task's image. Builds a fresh address space, lets the
/// registered loader populate it, resets the stack and heap extents, swaps
/// the spaces, and destroys the old one. When the loader fails, the task
/// keeps running its prior image unchanged.
pub fn exec<H: Hal>(
    sched: &mut Scheduler,
    hal: &H,
    frames: &FrameAllocator,
    vmm: &Vmm,
    path: &str,
) -> KernelResult<()> {
    let loader = exec_loader().ok_or(KernelError::NotSupported {
        operation: "exec without a registered loader",
    })?;

    let cur_pid = sched.current_pid().ok_or(KernelError::NotFound {
        what: "current task",
    })?;

    let new_space = hal.create_space(frames).ok_or(KernelError::NoMemory {
        what: "address space for exec",
    })?;

    let mapper = frames.mapper();
    let mut map_page = |va: VirtualAddress, flags: PageFlags| -> Option<*mut u8> {
        let frame = frames.alloc_zeroed_frame()?;
        let flags = flags | PageFlags::PRESENT | PageFlags::USER;
        if !hal.map(frames, new_space, va.align_down(), frame, flags) {
            frames.free_frame(frame);
            return None;
        }
        Some(mapper.translate(frame))
    };

    let image = match loader(path, &mut map_page) {
        Ok(image) => image,
        Err(e) => {
            // The task survives with its prior space untouched.
            let _ = vmm.destroy_space(hal, frames, new_space);
            return Err(e);
        }
    };

    let (stack_top, stack_limit) = match scheduler::map_initial_user_stack(hal, frames, new_space)
    {
        Ok(pair) => pair,
        Err(e) => {
            let _ = vmm.destroy_space(hal, frames, new_space);
            return Err(e);
        }
    };

    let heap_start = image.program_end.align_up();
    let old_space = {
        let Some(task) = sched.task_mut(cur_pid) else {
            let _ = vmm.destroy_space(hal, frames, new_space);
            return Err(KernelError::NotFound {
                what: "exec'ing task",
            });
        };
        let old_space = task.addr_space;
        let mut context = hal.new_context(
            VirtualAddress::new(user_bootstrap as usize as u64),
            Task::stack_top(&task.kernel_stack),
            new_space,
        );
        context.set_user_entry(image.entry, stack_top);

        task.addr_space = new_space;
        task.user_entry = Some(image.entry);
        task.context = context;
        task.extents = Some(UserExtents {
            heap_start,
            heap_end: heap_start,
            heap_max: VirtualAddress::new(heap_start.as_u64() + USER_HEAP_MAX),
            stack_top,
            stack_limit,
            mmap_base: VirtualAddress::new(USER_MMAP_BASE),
            mmap_cursor: VirtualAddress::new(USER_MMAP_BASE),
        });
        task.name = String::from(path.rsplit('/').next().unwrap_or(path));
        old_space
    };

    // The old space can only be destroyed once it is no longer active.
    hal.switch_space(new_space);
    if old_space.is_valid() && old_space != hal.kernel_space() {
        vmm.destroy_space(hal, frames, old_space)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// exit / waitpid
// ---------------------------------------------------------------------------

/// Terminate the current task normally with `code`. External references are
/// released, the parent's wait channel is signalled, and the CPU moves on.
pub fn exit<H: Hal>(sched: &mut Scheduler, hal: &H, code: i32) {
    let Some(pid) = sched.current_pid() else {
        return;
    };
    release_extern_refs(sched, pid);
    sched.mark_dead(pid, TaskState::Zombie, code);
    sched.schedule(hal);
}

/// Terminate the current task abnormally (unrecoverable fault, kill). Same
/// teardown as exit, but the state records the abnormal end.
pub fn terminate_current<H: Hal>(sched: &mut Scheduler, hal: &H, code: i32) {
    let Some(pid) = sched.current_pid() else {
        return;
    };
    release_extern_refs(sched, pid);
    sched.mark_dead(pid, TaskState::Terminated, code);
    sched.schedule(hal);
}

/// Terminate an arbitrary task (the kill syscall). Self-kill defers to
/// [`terminate_current`].
pub fn terminate<H: Hal>(sched: &mut Scheduler, hal: &H, pid: Pid, code: i32) -> KernelResult<()> {
    if sched.current_pid() == Some(pid) {
        terminate_current(sched, hal, code);
        return Ok(());
    }
    if sched.task(pid).is_none() {
        return Err(KernelError::NotFound { what: "task" });
    }
    release_extern_refs(sched, pid);
    sched.mark_dead(pid, TaskState::Terminated, code);
    Ok(())
}

fn release_extern_refs(sched: &mut Scheduler, pid: Pid) {
    if let Some(task) = sched.task_mut(pid) {
        if let Some(fd) = task.fd_table.take() {
            drop_extern_ref(fd);
        }
        if let Some(cwd) = task.cwd.take() {
            drop_extern_ref(cwd);
        }
    }
}

/// Single non-blocking scan for a dead child. `filter` narrows to one pid.
/// Reaping destroys the child's address space and vacates its slot.
pub fn waitpid_poll<H: Hal>(
    sched: &mut Scheduler,
    hal: &H,
    frames: &FrameAllocator,
    vmm: &Vmm,
    filter: Option<Pid>,
) -> KernelResult<Option<(Pid, i32)>> {
    let me = sched.current_pid().ok_or(KernelError::NotFound {
        what: "current task",
    })?;

    let mut have_child = false;
    let mut dead: Option<Pid> = None;
    for pid in 1..=super::task::MAX_TASKS as Pid {
        let Some(task) = sched.task(pid) else {
            continue;
        };
        if task.parent != Some(me) {
            continue;
        }
        if let Some(want) = filter {
            if want != pid {
                continue;
            }
        }
        have_child = true;
        if task.state.is_dead() {
            dead = Some(pid);
            break;
        }
    }

    if !have_child {
        return Err(KernelError::NotFound {
            what: "matching children",
        });
    }
    let Some(pid) = dead else {
        return Ok(None);
    };

    let Some(task) = sched.vacate(pid) else {
        return Ok(None);
    };
    let code = task.exit_code;
    if task.is_user() && task.addr_space.is_valid() && task.addr_space != hal.kernel_space() {
        vmm.destroy_space(hal, frames, task.addr_space)?;
    }
    log::debug!("reaped pid {} (exit code {})", pid, code);
    Ok(Some((pid, code)))
}

/// Wait for a child to die, blocking on this task's wait channel between
/// scans. With `nohang`, a single scan.
pub fn waitpid<H: Hal>(
    sched: &mut Scheduler,
    hal: &H,
    frames: &FrameAllocator,
    vmm: &Vmm,
    filter: Option<Pid>,
    nohang: bool,
) -> KernelResult<Option<(Pid, i32)>> {
    let me = sched.current_pid().ok_or(KernelError::NotFound {
        what: "current task",
    })?;
    loop {
        if let Some(found) = waitpid_poll(sched, hal, frames, vmm, filter)? {
            return Ok(Some(found));
        }
        if nohang {
            return Ok(None);
        }
        sched.block(hal, child_wait_channel(me));
    }
}

// ---------------------------------------------------------------------------
// Trampolines
// ---------------------------------------------------------------------------

/// First code a kernel thread runs: pick the entry and argument out of the
/// primed context, run the thread body, then exit the task.
pub extern "C" fn kthread_bootstrap() -> ! {
    let (entry_raw, arg) = crate::bootstrap::with_scheduler(|s| {
        s.current_task()
            .map(|t| t.context.entry_args())
            .unwrap_or((0, 0))
    })
    .unwrap_or((0, 0));

    if entry_raw != 0 {
        // SAFETY: spawn_kernel_thread stored a real KthreadEntry pointer.
        let entry: KthreadEntry = unsafe { core::mem::transmute(entry_raw as usize) };
        entry(arg as usize);
    }
    crate::bootstrap::exit_current(0);
    loop {
        core::hint::spin_loop();
    }
}

/// First code a user task runs in kernel mode: drop to user privilege at
/// the entry recorded in the context.
pub extern "C" fn user_bootstrap() -> ! {
    #[cfg(target_os = "none")]
    crate::bootstrap::enter_user_mode();

    // Unreachable on hardware; keeps the hosted signature honest.
    loop {
        core::hint::spin_loop();
    }
}
