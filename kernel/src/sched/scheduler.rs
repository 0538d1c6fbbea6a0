//! Core scheduler
//!
//! Priority scheduling with round-robin inside a level. The Running task is
//! never queued; on every scheduling point the highest-priority Ready task
//! wins, ties go to the longest waiter, and a preempted task is requeued
//! with a fresh slice. All state lives in one structure guarded by the
//! single scheduler lock (the global wrapper disables interrupts around
//! entry points).

extern crate alloc;

use alloc::{borrow::ToOwned, boxed::Box, string::String};

use super::{
    queue::ReadyQueue,
    task::{
        Pid, Task, TaskState, WaitChannel, DEFAULT_TIME_SLICE, MAX_TASKS, PRIORITY_DEFAULT,
        PRIORITY_IDLE, PRIORITY_KERNEL, PRIORITY_LEVELS,
    },
};
use crate::{
    error::{KernelError, KernelResult},
    hal::{AddrSpace, Hal, TaskContext},
    mm::{vmm::UserExtents, FrameAllocator, PageFlags, VirtualAddress, PAGE_SIZE},
    sched::lifecycle,
};

/// The idle task's pid (pool slot 0); it exists from boot and never dies.
pub const IDLE_PID: Pid = 1;

/// Pages of user stack mapped eagerly at process creation; the rest of the
/// declared extent is demand-mapped by the fault path.
pub const USER_STACK_INITIAL_PAGES: usize = 4;

/// Maximum user stack span.
pub const USER_STACK_MAX: usize = 1024 * 1024;

/// Bottom of the user brk heap.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;

/// Maximum user brk heap span.
pub const USER_HEAP_MAX: u64 = 0x1000_0000;

/// Anonymous-mapping window handed out by `mmap`.
pub const USER_MMAP_BASE: u64 = 0x8000_0000;
pub const USER_MMAP_SIZE: u64 = 0x2000_0000;

/// Scheduler state: the task pool, the ready queue, and the clock.
pub struct Scheduler {
    tasks: [Option<Box<Task>>; MAX_TASKS],
    ready: ReadyQueue,
    current: Option<Pid>,
    need_resched: bool,
    /// Milliseconds since boot, advanced by the timer tick.
    now_ms: u64,
}

impl Scheduler {
    /// Build the scheduler with the idle task occupying slot 0. The idle
    /// task represents the boot flow itself; its context is filled in by
    /// the first switch away from it.
    pub fn new<H: Hal>(hal: &H) -> Self {
        let mut scheduler = Self {
            tasks: [const { None }; MAX_TASKS],
            ready: ReadyQueue::new(),
            current: None,
            need_resched: false,
            now_ms: 0,
        };

        let stack = Task::alloc_kernel_stack();
        let context = hal.new_context(
            VirtualAddress::new(0),
            Task::stack_top(&stack),
            hal.kernel_space(),
        );
        scheduler.tasks[0] = Some(Box::new(Task {
            pid: IDLE_PID,
            name: "idle".to_owned(),
            state: TaskState::Running,
            priority: PRIORITY_IDLE,
            time_slice: DEFAULT_TIME_SLICE,
            runtime_ticks: 0,
            context,
            kernel_stack: stack,
            addr_space: hal.kernel_space(),
            extents: None,
            user_entry: None,
            wait_channel: None,
            sleep_until_ms: None,
            parent: None,
            exit_code: 0,
            fd_table: None,
            cwd: None,
        }));
        scheduler.current = Some(IDLE_PID);
        scheduler
    }

    // -- pool ---------------------------------------------------------------

    fn slot(pid: Pid) -> Option<usize> {
        if pid == 0 || pid as usize > MAX_TASKS {
            None
        } else {
            Some(pid as usize - 1)
        }
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(Self::slot(pid)?)?.as_deref()
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(Self::slot(pid)?)?.as_deref_mut()
    }

    /// Find an unused slot; pids are slot index + 1.
    pub fn task_alloc(&mut self) -> Option<Pid> {
        self.tasks
            .iter()
            .position(|slot| slot.is_none())
            .map(|idx| idx as Pid + 1)
    }

    /// Install a populated TCB into its slot and queue it if Ready.
    pub(super) fn install(&mut self, task: Box<Task>) {
        let pid = task.pid;
        let priority = task.priority;
        let ready = task.state == TaskState::Ready;
        if let Some(slot) = Self::slot(pid) {
            self.tasks[slot] = Some(task);
            if ready {
                self.ready.enqueue(pid, priority);
            }
        }
    }

    /// Vacate a slot after reaping. The task must be dead and not current.
    pub(super) fn vacate(&mut self, pid: Pid) -> Option<Box<Task>> {
        if self.current == Some(pid) {
            return None;
        }
        let slot = Self::slot(pid)?;
        self.ready.remove(pid);
        self.tasks[slot].take()
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.task(self.current?)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.task_mut(self.current?)
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Number of live tasks (any state).
    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_some()).count()
    }

    pub fn resched_pending(&self) -> bool {
        self.need_resched
    }

    pub fn request_resched(&mut self) {
        self.need_resched = true;
    }

    // -- creation -----------------------------------------------------------

    /// Create a kernel thread. The context is primed so the first dispatch
    /// lands in the bootstrap trampoline, which calls `entry(arg)` and then
    /// exits the task.
    pub fn spawn_kernel_thread<H: Hal>(
        &mut self,
        hal: &H,
        name: &str,
        entry: lifecycle::KthreadEntry,
        arg: usize,
    ) -> KernelResult<Pid> {
        let pid = self.task_alloc().ok_or(KernelError::NoMemory {
            what: "task pool exhausted",
        })?;

        let stack = Task::alloc_kernel_stack();
        let mut context = hal.new_context(
            VirtualAddress::new(lifecycle::kthread_bootstrap as usize as u64),
            Task::stack_top(&stack),
            hal.kernel_space(),
        );
        context.set_entry_args(entry as usize as u64, arg as u64);

        self.install(Box::new(Task {
            pid,
            name: String::from(name),
            state: TaskState::Ready,
            priority: PRIORITY_KERNEL,
            time_slice: DEFAULT_TIME_SLICE,
            runtime_ticks: 0,
            context,
            kernel_stack: stack,
            addr_space: hal.kernel_space(),
            extents: None,
            user_entry: None,
            wait_channel: None,
            sleep_until_ms: None,
            parent: self.current,
            exit_code: 0,
            fd_table: None,
            cwd: None,
        }));

        log::debug!("kernel thread '{}' created as pid {}", name, pid);
        Ok(pid)
    }

    /// Create a user process over an already-populated address space.
    /// Maps the initial user stack pages into `space`, records the
    /// heap/stack extents, and primes the context to enter user mode at
    /// `entry` on first dispatch.
    pub fn create_user_process<H: Hal>(
        &mut self,
        hal: &H,
        frames: &FrameAllocator,
        name: &str,
        entry: VirtualAddress,
        space: AddrSpace,
    ) -> KernelResult<Pid> {
        if !space.is_valid() {
            return Err(KernelError::InvalidParam {
                what: "invalid address space for user process",
            });
        }
        let pid = self.task_alloc().ok_or(KernelError::NoMemory {
            what: "task pool exhausted",
        })?;

        let (stack_top, stack_limit) = map_initial_user_stack(hal, frames, space)?;

        let extents = UserExtents {
            heap_start: VirtualAddress::new(USER_HEAP_BASE),
            heap_end: VirtualAddress::new(USER_HEAP_BASE),
            heap_max: VirtualAddress::new(USER_HEAP_BASE + USER_HEAP_MAX),
            stack_top,
            stack_limit,
            mmap_base: VirtualAddress::new(USER_MMAP_BASE),
            mmap_cursor: VirtualAddress::new(USER_MMAP_BASE),
        };

        let stack = Task::alloc_kernel_stack();
        let mut context = hal.new_context(
            VirtualAddress::new(lifecycle::user_bootstrap as usize as u64),
            Task::stack_top(&stack),
            space,
        );
        context.set_user_entry(entry, stack_top);

        self.install(Box::new(Task {
            pid,
            name: String::from(name),
            state: TaskState::Ready,
            priority: PRIORITY_DEFAULT,
            time_slice: DEFAULT_TIME_SLICE,
            runtime_ticks: 0,
            context,
            kernel_stack: stack,
            addr_space: space,
            extents: Some(extents),
            user_entry: Some(entry),
            wait_channel: None,
            sleep_until_ms: None,
            parent: self.current,
            exit_code: 0,
            fd_table: None,
            cwd: None,
        }));

        log::info!("user process '{}' created as pid {}", name, pid);
        Ok(pid)
    }

    // -- time ---------------------------------------------------------------

    /// Timer tick: account runtime, burn the current slice, wake expired
    /// sleepers, and decide whether a reschedule is due.
    pub fn on_tick(&mut self, now_ms: u64) {
        self.now_ms = now_ms;

        let current = self.current;
        let mut current_priority = PRIORITY_LEVELS as u8;
        if let Some(task) = current.and_then(|p| self.task_mut(p)) {
            task.runtime_ticks += 1;
            task.time_slice = task.time_slice.saturating_sub(1);
            current_priority = task.priority;
            if task.time_slice == 0 {
                self.need_resched = true;
            }
        }

        // Sleep-list walk: deadline reached means Ready again.
        for slot in self.tasks.iter_mut() {
            let Some(task) = slot.as_deref_mut() else {
                continue;
            };
            if task.state != TaskState::Blocked {
                continue;
            }
            let Some(deadline) = task.sleep_until_ms else {
                continue;
            };
            if deadline <= now_ms {
                task.sleep_until_ms = None;
                task.wait_channel = None;
                task.state = TaskState::Ready;
                let (pid, priority) = (task.pid, task.priority);
                self.ready.enqueue(pid, priority);
                if priority < current_priority {
                    self.need_resched = true;
                }
            }
        }
    }

    // -- scheduling ---------------------------------------------------------

    /// Pop queue entries until one still names a Ready task; entries can go
    /// stale when a queued task is killed.
    fn pick_next(&mut self) -> Option<Pid> {
        while let Some(pid) = self.ready.pop_highest() {
            if self
                .task(pid)
                .map(|t| t.state == TaskState::Ready)
                .unwrap_or(false)
            {
                return Some(pid);
            }
        }
        None
    }

    /// The scheduling point. Picks the highest-priority Ready task and
    /// context-switches to it; the preempted task, if still runnable, is
    /// requeued with a fresh slice.
    pub fn schedule<H: Hal>(&mut self, hal: &H) {
        self.need_resched = false;

        let Some(cur_pid) = self.current else {
            return;
        };
        let (cur_running, cur_priority, cur_slice) = match self.task(cur_pid) {
            Some(t) => (t.state == TaskState::Running, t.priority, t.time_slice),
            None => (false, PRIORITY_LEVELS as u8, 0),
        };

        if cur_running {
            match self.ready.highest_priority() {
                // Nothing else to run: stay put, topping the slice up so a
                // voluntary yield with an empty queue does not spin on
                // zero.
                None => {
                    if cur_slice == 0 {
                        if let Some(t) = self.task_mut(cur_pid) {
                            t.time_slice = DEFAULT_TIME_SLICE;
                        }
                    }
                    return;
                }
                // Strictly higher-priority work always preempts; equals
                // only rotate in when the slice is spent.
                Some(best) => {
                    if cur_priority < best || (cur_priority == best && cur_slice > 0) {
                        return;
                    }
                }
            }
        }

        let next_pid = match self.pick_next() {
            Some(pid) => pid,
            None => {
                // The queue held only stale entries: a still-running
                // current keeps the CPU; otherwise fall back to idle.
                if cur_running {
                    if let Some(t) = self.task_mut(cur_pid) {
                        if t.time_slice == 0 {
                            t.time_slice = DEFAULT_TIME_SLICE;
                        }
                    }
                    return;
                }
                IDLE_PID
            }
        };
        if next_pid == cur_pid {
            if let Some(t) = self.task_mut(cur_pid) {
                t.state = TaskState::Running;
            }
            return;
        }

        if cur_running && cur_pid != IDLE_PID {
            if let Some(t) = self.task_mut(cur_pid) {
                t.state = TaskState::Ready;
                t.time_slice = DEFAULT_TIME_SLICE;
            }
            self.ready.enqueue(cur_pid, cur_priority);
        } else if cur_running {
            if let Some(t) = self.task_mut(cur_pid) {
                t.state = TaskState::Ready;
            }
        }

        let next_space = {
            let Some(next) = self.task_mut(next_pid) else {
                return;
            };
            next.state = TaskState::Running;
            if next.time_slice == 0 {
                next.time_slice = DEFAULT_TIME_SLICE;
            }
            next.addr_space
        };
        self.current = Some(next_pid);

        // Box contents are stable, so raw context pointers stay valid
        // across the pool borrows above.
        let from = match self.task_mut(cur_pid) {
            Some(t) => &mut t.context as *mut TaskContext,
            None => return,
        };
        let to = match self.task(next_pid) {
            Some(t) => &t.context as *const TaskContext,
            None => return,
        };

        if next_space != hal.current_space() {
            hal.switch_space(next_space);
        }
        // SAFETY: both pointers reference live TCB contexts; the global
        // wrapper holds the scheduler lock with interrupts disabled.
        unsafe { hal.context_switch(from, to) };
    }

    /// Voluntary yield: surrender the rest of the slice and reschedule.
    pub fn yield_now<H: Hal>(&mut self, hal: &H) {
        if let Some(t) = self.current_task_mut() {
            t.time_slice = 0;
        }
        self.schedule(hal);
    }

    /// Sleep for at least `ms` milliseconds.
    pub fn sleep<H: Hal>(&mut self, hal: &H, ms: u64) {
        let deadline = self.now_ms + ms;
        if let Some(t) = self.current_task_mut() {
            if t.pid == IDLE_PID {
                return;
            }
            t.sleep_until_ms = Some(deadline);
            t.state = TaskState::Blocked;
        }
        self.schedule(hal);
    }

    /// Block the current task on an opaque channel until `wakeup`.
    pub fn block<H: Hal>(&mut self, hal: &H, channel: WaitChannel) {
        if let Some(t) = self.current_task_mut() {
            if t.pid == IDLE_PID {
                return;
            }
            t.wait_channel = Some(channel);
            t.state = TaskState::Blocked;
        }
        self.schedule(hal);
    }

    /// Broadcast wakeup: every task blocked on `channel` becomes Ready.
    /// Returns the number of tasks woken.
    pub fn wakeup(&mut self, channel: WaitChannel) -> usize {
        let current_priority = self
            .current_task()
            .map(|t| t.priority)
            .unwrap_or(PRIORITY_LEVELS as u8);

        let mut woken = 0;
        for slot in self.tasks.iter_mut() {
            let Some(task) = slot.as_deref_mut() else {
                continue;
            };
            if task.state != TaskState::Blocked || task.wait_channel != Some(channel) {
                continue;
            }
            task.wait_channel = None;
            task.sleep_until_ms = None;
            task.state = TaskState::Ready;
            let (pid, priority) = (task.pid, task.priority);
            self.ready.enqueue(pid, priority);
            if priority < current_priority {
                self.need_resched = true;
            }
            woken += 1;
        }
        woken
    }

    /// Mark a task dead with `code` and signal its parent's wait channel.
    /// The caller reschedules if the victim was current.
    pub fn mark_dead(&mut self, pid: Pid, state: TaskState, code: i32) {
        debug_assert!(state.is_dead());
        let parent = match self.task_mut(pid) {
            Some(task) => {
                task.state = state;
                task.exit_code = code;
                task.wait_channel = None;
                task.sleep_until_ms = None;
                task.parent
            }
            None => return,
        };
        self.ready.remove(pid);
        if let Some(parent) = parent {
            self.wakeup(super::child_wait_channel(parent));
        }
        if self.current == Some(pid) {
            self.need_resched = true;
        }
    }
}

/// Map the eager portion of a fresh user stack into `space`, returning
/// `(stack_top, stack_limit)`. Shared by process creation and exec.
pub(crate) fn map_initial_user_stack<H: Hal>(
    hal: &H,
    frames: &FrameAllocator,
    space: AddrSpace,
) -> KernelResult<(VirtualAddress, VirtualAddress)> {
    let stack_top = VirtualAddress::new(hal.caps().user_top.as_u64() - PAGE_SIZE as u64);
    let stack_limit = VirtualAddress::new(stack_top.as_u64() - USER_STACK_MAX as u64);

    // Eagerly back the first stack pages; deeper growth is resolved by
    // demand mapping within the declared extent.
    for i in 1..=USER_STACK_INITIAL_PAGES {
        let va = VirtualAddress::new(stack_top.as_u64() - (i * PAGE_SIZE) as u64);
        let frame = frames.alloc_zeroed_frame().ok_or(KernelError::NoMemory {
            what: "user stack frame",
        })?;
        if !hal.map(frames, space, va, frame, PageFlags::user_data()) {
            frames.free_frame(frame);
            for j in 1..i {
                let va = VirtualAddress::new(stack_top.as_u64() - (j * PAGE_SIZE) as u64);
                if let Some(f) = hal.unmap(space, va) {
                    frames.ref_dec(f);
                }
            }
            return Err(KernelError::NoMemory {
                what: "user stack page tables",
            });
        }
    }
    Ok((stack_top, stack_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockHal, TestArena};

    extern "C" fn noop_thread(_arg: usize) {}

    fn fixture() -> (TestArena, MockHal, Scheduler) {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();
        let hal = MockHal::new(arena.mapper(), &frames).unwrap();
        let sched = Scheduler::new(&hal);
        (arena, hal, sched)
    }

    #[test]
    fn idle_task_occupies_slot_zero() {
        let (_arena, _hal, sched) = fixture();
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        assert_eq!(sched.task(IDLE_PID).unwrap().priority, PRIORITY_IDLE);
        assert_eq!(sched.task_count(), 1);
    }

    #[test]
    fn spawn_assigns_sequential_pids() {
        let (_arena, hal, mut sched) = fixture();
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        let b = sched.spawn_kernel_thread(&hal, "b", noop_thread, 0).unwrap();
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        assert_eq!(sched.task(a).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn schedule_prefers_higher_priority() {
        let (_arena, hal, mut sched) = fixture();
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        sched.task_mut(a).unwrap().priority = 8;
        // Requeue at the adjusted priority.
        sched.ready.remove(a);
        sched.ready.enqueue(a, 8);

        let b = sched.spawn_kernel_thread(&hal, "b", noop_thread, 0).unwrap();
        sched.task_mut(b).unwrap().priority = 2;
        sched.ready.remove(b);
        sched.ready.enqueue(b, 2);

        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(b));
        assert_eq!(sched.task(b).unwrap().state, TaskState::Running);
        // Idle was preempted back to Ready.
        assert_eq!(sched.task(IDLE_PID).unwrap().state, TaskState::Ready);
        assert_eq!(hal.context_switches(), 1);
    }

    #[test]
    fn equal_priority_round_robin_on_slice_expiry() {
        let (_arena, hal, mut sched) = fixture();
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        let b = sched.spawn_kernel_thread(&hal, "b", noop_thread, 0).unwrap();

        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(a));

        // Slice not yet spent: a keeps the CPU against an equal peer.
        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(a));

        // Burn the slice through ticks; b takes over, a requeues.
        for ms in 1..=DEFAULT_TIME_SLICE as u64 {
            sched.on_tick(ms);
        }
        assert!(sched.resched_pending());
        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(b));
        assert_eq!(sched.task(a).unwrap().state, TaskState::Ready);
        assert_eq!(sched.task(a).unwrap().time_slice, DEFAULT_TIME_SLICE);
    }

    #[test]
    fn yield_rotates_equals_immediately() {
        let (_arena, hal, mut sched) = fixture();
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        let b = sched.spawn_kernel_thread(&hal, "b", noop_thread, 0).unwrap();

        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(a));
        sched.yield_now(&hal);
        assert_eq!(sched.current_pid(), Some(b));
        sched.yield_now(&hal);
        assert_eq!(sched.current_pid(), Some(a));
    }

    #[test]
    fn sleep_until_deadline_then_wake() {
        let (_arena, hal, mut sched) = fixture();
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(a));

        sched.sleep(&hal, 50);
        assert_eq!(sched.task(a).unwrap().state, TaskState::Blocked);
        assert_eq!(sched.current_pid(), Some(IDLE_PID));

        sched.on_tick(10);
        assert_eq!(sched.task(a).unwrap().state, TaskState::Blocked);

        sched.on_tick(50);
        assert_eq!(sched.task(a).unwrap().state, TaskState::Ready);
        assert!(sched.resched_pending());
        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(a));
    }

    #[test]
    fn wakeup_is_broadcast() {
        let (_arena, hal, mut sched) = fixture();
        let chan = WaitChannel(0xFEED);
        let a = sched.spawn_kernel_thread(&hal, "a", noop_thread, 0).unwrap();
        let b = sched.spawn_kernel_thread(&hal, "b", noop_thread, 0).unwrap();
        let c = sched.spawn_kernel_thread(&hal, "c", noop_thread, 0).unwrap();

        // Run a, block it; run b, block it. c stays ready on another chan.
        sched.schedule(&hal);
        sched.block(&hal, chan);
        sched.schedule(&hal);
        assert_eq!(sched.current_pid(), Some(b));
        sched.block(&hal, chan);
        assert_eq!(sched.current_pid(), Some(c));

        assert_eq!(sched.wakeup(chan), 2);
        assert_eq!(sched.task(a).unwrap().state, TaskState::Ready);
        assert_eq!(sched.task(b).unwrap().state, TaskState::Ready);
        assert_eq!(sched.wakeup(chan), 0);
    }

    #[test]
    fn pool_exhaustion_reports_no_memory() {
        let (_arena, hal, mut sched) = fixture();
        let mut spawned = 0;
        loop {
            match sched.spawn_kernel_thread(&hal, "filler", noop_thread, 0) {
                Ok(_) => spawned += 1,
                Err(KernelError::NoMemory { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        // Slot 0 is the idle task.
        assert_eq!(spawned, MAX_TASKS - 1);
    }

    #[test]
    fn mark_dead_wakes_parent_channel() {
        let (_arena, hal, mut sched) = fixture();
        let child = sched.spawn_kernel_thread(&hal, "c", noop_thread, 0).unwrap();
        // Parent is idle (pid 1); park it on its wait channel by proxy:
        // block a helper task on the idle task's child channel.
        let waiter = sched.spawn_kernel_thread(&hal, "w", noop_thread, 0).unwrap();
        sched.schedule(&hal);
        // current is child or waiter depending on order; force waiter.
        if sched.current_pid() != Some(waiter) {
            sched.yield_now(&hal);
        }
        assert_eq!(sched.current_pid(), Some(waiter));
        sched.block(&hal, super::super::child_wait_channel(IDLE_PID));

        sched.mark_dead(child, TaskState::Zombie, 0);
        assert_eq!(sched.task(child).unwrap().state, TaskState::Zombie);
        assert_eq!(sched.task(waiter).unwrap().state, TaskState::Ready);
    }
}
