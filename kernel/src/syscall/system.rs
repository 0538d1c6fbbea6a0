//! System syscalls (0x05xx): uname, getrandom, debug_print, reboot,
//! poweroff

use core::sync::atomic::{AtomicU64, Ordering};

use super::{nr, Errno, SyscallFrame, SyscallResult, SyscallTable};
use crate::hal::Hal;
use crate::{bootstrap, irq, mm::VirtualAddress};

pub(super) fn install(table: &mut SyscallTable) {
    let entries: [(u16, super::SyscallHandler); 5] = [
        (nr::UNAME, sys_uname),
        (nr::GETRANDOM, sys_getrandom),
        (nr::DEBUG_PRINT, sys_debug_print),
        (nr::REBOOT, sys_reboot),
        (nr::POWEROFF, sys_poweroff),
    ];
    for (number, handler) in entries {
        if table.register(number, handler).is_err() {
            log::error!("duplicate core syscall registration for {:#06x}", number);
        }
    }
}

/// Field width of each utsname member.
const UTS_LEN: usize = 65;

fn sys_uname(frame: &mut SyscallFrame) -> SyscallResult {
    let out = VirtualAddress::new(frame.args[0]);
    if out.as_u64() == 0 {
        return Err(Errno::EFAULT);
    }

    bootstrap::with_kernel(|hal, frames, vmm, _sched| {
        let mut buf = [0u8; UTS_LEN * 5];
        let fields: [&str; 5] = [
            "Nimbus",
            "nimbus",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH"),
            hal.caps().arch_name,
        ];
        for (i, field) in fields.iter().enumerate() {
            let bytes = field.as_bytes();
            let n = bytes.len().min(UTS_LEN - 1);
            buf[i * UTS_LEN..i * UTS_LEN + n].copy_from_slice(&bytes[..n]);
        }
        vmm.copy_to_user(hal, frames, out, &buf)
            .map_err(|_| Errno::EFAULT)
    })
    .ok_or(Errno::EAGAIN)??;
    Ok(0)
}

/// xorshift64* state; seeded from the tick counter on first use. Not
/// cryptographic, and says so in the ABI documentation.
static RNG_STATE: AtomicU64 = AtomicU64::new(0);

fn next_random() -> u64 {
    let mut state = RNG_STATE.load(Ordering::Relaxed);
    if state == 0 {
        state = irq::uptime_ms().wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    }
    state ^= state >> 12;
    state ^= state << 25;
    state ^= state >> 27;
    RNG_STATE.store(state, Ordering::Relaxed);
    state.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

fn sys_getrandom(frame: &mut SyscallFrame) -> SyscallResult {
    let out = VirtualAddress::new(frame.args[0]);
    let len = (frame.args[1] as usize).min(1024);
    if out.as_u64() == 0 {
        return Err(Errno::EFAULT);
    }

    bootstrap::with_kernel(|hal, frames, vmm, _sched| {
        let mut remaining = len;
        let mut cursor = out;
        while remaining > 0 {
            let word = next_random().to_ne_bytes();
            let n = remaining.min(8);
            vmm.copy_to_user(hal, frames, cursor, &word[..n])
                .map_err(|_| Errno::EFAULT)?;
            cursor = cursor.offset(n as u64);
            remaining -= n;
        }
        Ok(len)
    })
    .ok_or(Errno::EAGAIN)?
}

fn sys_debug_print(frame: &mut SyscallFrame) -> SyscallResult {
    let ptr = VirtualAddress::new(frame.args[0]);
    let len = (frame.args[1] as usize).min(512);
    if ptr.as_u64() == 0 || len == 0 {
        return Err(Errno::EINVAL);
    }

    let mut buf = [0u8; 512];
    bootstrap::with_kernel(|hal, _frames, vmm, _sched| {
        vmm.copy_from_user(hal, ptr, &mut buf[..len])
            .map_err(|_| Errno::EFAULT)
    })
    .ok_or(Errno::EAGAIN)??;

    match core::str::from_utf8(&buf[..len]) {
        Ok(s) => log::info!("user: {}", s.trim_end_matches('\n')),
        Err(_) => log::info!("user: <{} non-utf8 bytes>", len),
    }
    Ok(len)
}

fn sys_reboot(_frame: &mut SyscallFrame) -> SyscallResult {
    bootstrap::with_kernel(|hal, _frames, _vmm, _sched| {
        hal.platform_reset().map_err(Errno::from)
    })
    .ok_or(Errno::EAGAIN)??;
    Ok(0)
}

fn sys_poweroff(_frame: &mut SyscallFrame) -> SyscallResult {
    bootstrap::with_kernel(|hal, _frames, _vmm, _sched| {
        hal.platform_poweroff().map_err(Errno::from)
    })
    .ok_or(Errno::EAGAIN)??;
    Ok(0)
}
