//! Task and scheduler core
//!
//! Fixed-pool task control blocks, a priority ready queue with round-robin
//! within a level, preemption on timer tick, sleep/wakeup on opaque
//! channels, and the fork/exec/exit/wait glue. One CPU; the design keeps
//! the single scheduler lock discipline that a second CPU would extend,
//! not replace.

pub mod lifecycle;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use lifecycle::{set_exec_loader, set_fd_clone_hook, set_fd_drop_hook, ExecLoader, LoadedImage};
pub use queue::ReadyQueue;
pub use scheduler::Scheduler;
pub use task::{
    ExternRef, Pid, Task, TaskState, WaitChannel, DEFAULT_TIME_SLICE, KERNEL_STACK_SIZE,
    MAX_TASKS, PRIORITY_DEFAULT, PRIORITY_IDLE, PRIORITY_KERNEL, PRIORITY_LEVELS,
};

/// Channel a parent sleeps on in `waitpid`; children signal it on exit.
pub fn child_wait_channel(parent: Pid) -> WaitChannel {
    WaitChannel(0x8000_0000 + parent as usize)
}

/// Exit code reported for tasks killed by an unrecoverable fault
/// (128 + SIGSEGV by the usual convention).
pub const FAULT_EXIT_CODE: i32 = 139;
