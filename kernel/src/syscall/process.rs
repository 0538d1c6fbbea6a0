//! Process-control syscalls (0x00xx) and kill (0x04xx)

use super::{nr, Errno, SyscallFrame, SyscallResult, SyscallTable};
use crate::{
    bootstrap,
    error::KernelError,
    mm::VirtualAddress,
    sched::{lifecycle, Pid},
};

pub(super) fn install(table: &mut SyscallTable) {
    let entries: [(u16, super::SyscallHandler); 8] = [
        (nr::EXIT, sys_exit),
        (nr::FORK, sys_fork),
        (nr::EXEC, sys_exec),
        (nr::WAITPID, sys_waitpid),
        (nr::GETPID, sys_getpid),
        (nr::GETPPID, sys_getppid),
        (nr::YIELD, sys_yield),
        (nr::KILL, sys_kill),
    ];
    for (number, handler) in entries {
        // Slots are empty at construction; a collision is a wiring bug.
        if table.register(number, handler).is_err() {
            log::error!("duplicate core syscall registration for {:#06x}", number);
        }
    }
}

fn sys_exit(frame: &mut SyscallFrame) -> SyscallResult {
    let code = frame.args[0] as i32;
    bootstrap::with_kernel(|hal, _frames, _vmm, sched| {
        lifecycle::exit(sched, hal, code);
    })
    .ok_or(Errno::EAGAIN)?;
    Ok(0)
}

fn sys_fork(_frame: &mut SyscallFrame) -> SyscallResult {
    let child = bootstrap::with_kernel(|hal, frames, vmm, sched| {
        lifecycle::fork(sched, hal, frames, vmm)
    })
    .ok_or(Errno::EAGAIN)??;
    Ok(child as usize)
}

fn sys_exec(frame: &mut SyscallFrame) -> SyscallResult {
    let path_ptr = VirtualAddress::new(frame.args[0]);
    bootstrap::with_kernel(|hal, frames, vmm, sched| {
        let path = vmm
            .read_user_cstr(hal, path_ptr, 256)
            .map_err(|_| Errno::EFAULT)?;
        lifecycle::exec(sched, hal, frames, vmm, &path).map_err(Errno::from)
    })
    .ok_or(Errno::EAGAIN)??;
    Ok(0)
}

/// Option bit for a non-blocking wait.
const WNOHANG: u64 = 1;

fn sys_waitpid(frame: &mut SyscallFrame) -> SyscallResult {
    let filter = if (frame.args[0] as i64) <= 0 {
        None
    } else {
        Some(frame.args[0] as Pid)
    };
    let status_ptr = VirtualAddress::new(frame.args[1]);
    let nohang = frame.args[2] & WNOHANG != 0;

    bootstrap::with_kernel(|hal, frames, vmm, sched| {
        let reaped = lifecycle::waitpid(sched, hal, frames, vmm, filter, nohang).map_err(
            |e| match e {
                KernelError::NotFound { .. } => Errno::ECHILD,
                other => Errno::from(other),
            },
        )?;
        match reaped {
            Some((pid, code)) => {
                if status_ptr.as_u64() != 0 {
                    // Exit status in the conventional wait-status layout.
                    let status = (code as u32 & 0xFF) << 8;
                    vmm.copy_to_user(hal, frames, status_ptr, &status.to_ne_bytes())
                        .map_err(|_| Errno::EFAULT)?;
                }
                Ok(pid as usize)
            }
            None => Ok(0),
        }
    })
    .ok_or(Errno::EAGAIN)?
}

fn sys_getpid(_frame: &mut SyscallFrame) -> SyscallResult {
    bootstrap::with_scheduler(|sched| sched.current_pid().map(|p| p as usize))
        .flatten()
        .ok_or(Errno::ESRCH)
}

fn sys_getppid(_frame: &mut SyscallFrame) -> SyscallResult {
    bootstrap::with_scheduler(|sched| {
        sched
            .current_task()
            .and_then(|t| t.parent)
            .map(|p| p as usize)
    })
    .flatten()
    .map_or(Ok(0), Ok)
}

fn sys_yield(_frame: &mut SyscallFrame) -> SyscallResult {
    bootstrap::with_kernel(|hal, _frames, _vmm, sched| sched.yield_now(hal))
        .ok_or(Errno::EAGAIN)?;
    Ok(0)
}

fn sys_kill(frame: &mut SyscallFrame) -> SyscallResult {
    let pid = frame.args[0] as Pid;
    let sig = frame.args[1] as u32;
    if sig > 64 {
        return Err(Errno::EINVAL);
    }

    bootstrap::with_kernel(|hal, _frames, _vmm, sched| {
        if sig == 0 {
            // Existence probe only.
            return if sched.task(pid).is_some() {
                Ok(0)
            } else {
                Err(Errno::ESRCH)
            };
        }
        lifecycle::terminate(sched, hal, pid, 128 + sig as i32).map_err(|e| match e {
            KernelError::NotFound { .. } => Errno::ESRCH,
            other => Errno::from(other),
        })?;
        Ok(0)
    })
    .ok_or(Errno::EAGAIN)?
}
