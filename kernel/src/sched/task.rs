//! Task control blocks

extern crate alloc;

use alloc::{boxed::Box, string::String, vec};

use crate::{
    hal::{AddrSpace, TaskContext},
    mm::{vmm::UserExtents, VirtualAddress},
};

/// Process identifier: pool slot index plus one, stable for the task's
/// lifetime.
pub type Pid = u32;

/// Fixed capacity of the task pool.
pub const MAX_TASKS: usize = 256;

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Time slice granted on dispatch, in timer ticks.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Number of priority levels; lower value means higher priority.
pub const PRIORITY_LEVELS: usize = 32;

/// Priority for core kernel threads.
pub const PRIORITY_KERNEL: u8 = 4;

/// Default priority for user processes.
pub const PRIORITY_DEFAULT: u8 = 16;

/// The idle task; runs only when nothing else can.
pub const PRIORITY_IDLE: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Task lifecycle states. An unused pool slot is simply empty; a slot is
/// populated at creation and vacated when the parent reaps the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, waiting in the ready queue.
    Ready,
    /// Executing on the CPU.
    Running,
    /// Sleeping on a deadline or blocked on a wait channel.
    Blocked,
    /// Exited normally; holds its exit code until reaped.
    Zombie,
    /// Killed by an unrecoverable fault or a signal; reaped like a zombie.
    Terminated,
}

impl TaskState {
    /// Whether the task has finished and awaits reaping.
    pub fn is_dead(&self) -> bool {
        matches!(self, TaskState::Zombie | TaskState::Terminated)
    }
}

/// Opaque wait-channel key. Only compared for equality; the pointee (if it
/// ever was a pointer) is never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitChannel(pub usize);

/// Opaque handle to an object owned by an external subsystem (fd table,
/// cwd). The core only stores and hands these back through hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternRef(pub usize);

/// Task control block.
pub struct Task {
    pub pid: Pid,
    pub name: String,
    pub state: TaskState,
    pub priority: u8,
    /// Ticks left before preemption.
    pub time_slice: u32,
    /// Accumulated ticks on the CPU.
    pub runtime_ticks: u64,
    /// Saved registers sufficient to resume.
    pub context: TaskContext,
    /// Kernel stack backing storage.
    pub kernel_stack: Box<[u8]>,
    pub addr_space: AddrSpace,
    /// User heap/stack layout; `None` for kernel threads.
    pub extents: Option<UserExtents>,
    /// Entry point in user space; `None` for kernel threads.
    pub user_entry: Option<VirtualAddress>,
    pub wait_channel: Option<WaitChannel>,
    /// Absolute wake deadline in milliseconds since boot.
    pub sleep_until_ms: Option<u64>,
    pub parent: Option<Pid>,
    pub exit_code: i32,
    /// External fd-table handle, duplicated across fork through a hook.
    pub fd_table: Option<ExternRef>,
    /// External working-directory handle.
    pub cwd: Option<ExternRef>,
}

impl Task {
    /// Allocate the kernel stack for a new task.
    pub fn alloc_kernel_stack() -> Box<[u8]> {
        vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice()
    }

    /// Top of a kernel stack buffer (stacks grow down).
    pub fn stack_top(stack: &[u8]) -> VirtualAddress {
        VirtualAddress::new(stack.as_ptr() as u64 + stack.len() as u64)
    }

    /// Whether this task runs user code.
    pub fn is_user(&self) -> bool {
        self.user_entry.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_end_of_buffer() {
        let stack = Task::alloc_kernel_stack();
        let top = Task::stack_top(&stack);
        assert_eq!(
            top.as_u64(),
            stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
        );
    }

    #[test]
    fn dead_states() {
        assert!(TaskState::Zombie.is_dead());
        assert!(TaskState::Terminated.is_dead());
        assert!(!TaskState::Blocked.is_dead());
        assert!(!TaskState::Running.is_dead());
    }
}
