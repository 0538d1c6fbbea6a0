//! Time syscalls (0x03xx)
//!
//! All clocks derive from the tick counter; wall-clock time is uptime
//! until an RTC driver (external) feeds a base offset.

use super::{nr, Errno, SyscallFrame, SyscallResult, SyscallTable};
use crate::{bootstrap, irq, mm::VirtualAddress};

pub(super) fn install(table: &mut SyscallTable) {
    let entries: [(u16, super::SyscallHandler); 4] = [
        (nr::TIME, sys_time),
        (nr::GETTIMEOFDAY, sys_gettimeofday),
        (nr::NANOSLEEP, sys_nanosleep),
        (nr::CLOCK_GETTIME, sys_clock_gettime),
    ];
    for (number, handler) in entries {
        if table.register(number, handler).is_err() {
            log::error!("duplicate core syscall registration for {:#06x}", number);
        }
    }
}

fn write_u64_pair(ptr: VirtualAddress, first: u64, second: u64) -> Result<(), Errno> {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&first.to_ne_bytes());
    buf[8..].copy_from_slice(&second.to_ne_bytes());
    bootstrap::with_kernel(|hal, frames, vmm, _sched| {
        vmm.copy_to_user(hal, frames, ptr, &buf)
            .map_err(|_| Errno::EFAULT)
    })
    .ok_or(Errno::EAGAIN)?
}

fn sys_time(frame: &mut SyscallFrame) -> SyscallResult {
    let secs = irq::uptime_ms() / 1000;
    let out = VirtualAddress::new(frame.args[0]);
    if out.as_u64() != 0 {
        bootstrap::with_kernel(|hal, frames, vmm, _sched| {
            vmm.copy_to_user(hal, frames, out, &secs.to_ne_bytes())
                .map_err(|_| Errno::EFAULT)
        })
        .ok_or(Errno::EAGAIN)??;
    }
    Ok(secs as usize)
}

fn sys_gettimeofday(frame: &mut SyscallFrame) -> SyscallResult {
    let out = VirtualAddress::new(frame.args[0]);
    if out.as_u64() == 0 {
        return Err(Errno::EFAULT);
    }
    let ms = irq::uptime_ms();
    write_u64_pair(out, ms / 1000, (ms % 1000) * 1000)?;
    Ok(0)
}

fn sys_nanosleep(frame: &mut SyscallFrame) -> SyscallResult {
    let req = VirtualAddress::new(frame.args[0]);
    if req.as_u64() == 0 {
        return Err(Errno::EFAULT);
    }

    let mut buf = [0u8; 16];
    bootstrap::with_kernel(|hal, _frames, vmm, _sched| {
        vmm.copy_from_user(hal, req, &mut buf).map_err(|_| Errno::EFAULT)
    })
    .ok_or(Errno::EAGAIN)??;

    let secs = u64::from_ne_bytes(buf[..8].try_into().map_err(|_| Errno::EINVAL)?);
    let nanos = u64::from_ne_bytes(buf[8..].try_into().map_err(|_| Errno::EINVAL)?);
    if nanos >= 1_000_000_000 {
        return Err(Errno::EINVAL);
    }
    let ms = secs * 1000 + nanos / 1_000_000;

    bootstrap::with_kernel(|hal, _frames, _vmm, sched| sched.sleep(hal, ms))
        .ok_or(Errno::EAGAIN)?;

    // Sleep is not interruptible in this core, so the remainder is zero.
    let rem = VirtualAddress::new(frame.args[1]);
    if rem.as_u64() != 0 {
        write_u64_pair(rem, 0, 0)?;
    }
    Ok(0)
}

fn sys_clock_gettime(frame: &mut SyscallFrame) -> SyscallResult {
    let out = VirtualAddress::new(frame.args[1]);
    if out.as_u64() == 0 {
        return Err(Errno::EFAULT);
    }
    let ms = irq::uptime_ms();
    write_u64_pair(out, ms / 1000, (ms % 1000) * 1_000_000)?;
    Ok(0)
}
