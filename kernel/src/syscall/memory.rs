//! Memory syscalls (0x02xx): brk, mmap, munmap

use bitflags::bitflags;

use super::{nr, Errno, SyscallFrame, SyscallResult, SyscallTable};
use crate::{
    bootstrap,
    hal::AddrSpace,
    mm::{PageFlags, VirtualAddress, PAGE_SIZE},
    sched::scheduler::{USER_MMAP_BASE, USER_MMAP_SIZE},
};

bitflags! {
    /// mmap protection bits, translated into HAL page flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapProt: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl MapProt {
    fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if self.contains(MapProt::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.contains(MapProt::EXEC) {
            flags |= PageFlags::EXEC;
        }
        flags
    }
}

pub(super) fn install(table: &mut SyscallTable) {
    let entries: [(u16, super::SyscallHandler); 3] = [
        (nr::BRK, sys_brk),
        (nr::MMAP, sys_mmap),
        (nr::MUNMAP, sys_munmap),
    ];
    for (number, handler) in entries {
        if table.register(number, handler).is_err() {
            log::error!("duplicate core syscall registration for {:#06x}", number);
        }
    }
}

/// Move the program break. `0` queries; out-of-range requests leave the
/// break unchanged and report the current value, per the usual contract.
fn sys_brk(frame: &mut SyscallFrame) -> SyscallResult {
    let requested = frame.args[0];

    bootstrap::with_kernel(|hal, frames, vmm, sched| {
        let Some(task) = sched.current_task_mut() else {
            return Err(Errno::ESRCH);
        };
        let Some(ref mut extents) = task.extents else {
            return Err(Errno::EOPNOTSUPP);
        };

        let old_end = extents.heap_end;
        if requested == 0
            || requested < extents.heap_start.as_u64()
            || requested > extents.heap_max.as_u64()
        {
            return Ok(old_end.as_u64() as usize);
        }

        let new_end = VirtualAddress::new(requested);
        extents.heap_end = new_end;

        // Shrinking releases whatever pages were demand-mapped above the
        // new break. Growth costs nothing now; first touch faults a frame
        // in.
        if new_end < old_end {
            let mut page = new_end.align_up();
            while page < old_end.align_up() {
                let _ = vmm.release_page(hal, frames, AddrSpace::CURRENT, page);
                page = page.offset(PAGE_SIZE as u64);
            }
        }
        Ok(new_end.as_u64() as usize)
    })
    .ok_or(Errno::EAGAIN)?
}

/// Anonymous mappings carved from the task's mmap window, eagerly backed
/// with zeroed frames. File-backed mappings belong to the external VFS.
fn sys_mmap(frame: &mut SyscallFrame) -> SyscallResult {
    let length = frame.args[1] as usize;
    let prot = MapProt::from_bits_truncate(frame.args[2] as u32);
    if length == 0 {
        return Err(Errno::EINVAL);
    }
    let pages = length.div_ceil(PAGE_SIZE);

    bootstrap::with_kernel(|hal, frames, vmm, sched| {
        let Some(task) = sched.current_task_mut() else {
            return Err(Errno::ESRCH);
        };
        let Some(ref mut extents) = task.extents else {
            return Err(Errno::EOPNOTSUPP);
        };

        let base = extents.mmap_cursor.align_up();
        let end = base.as_u64() + (pages * PAGE_SIZE) as u64;
        if end > USER_MMAP_BASE + USER_MMAP_SIZE {
            return Err(Errno::ENOMEM);
        }
        extents.mmap_cursor = VirtualAddress::new(end);

        let flags = prot.page_flags();
        for i in 0..pages {
            let va = base.offset((i * PAGE_SIZE) as u64);
            let ok = frames
                .alloc_zeroed_frame()
                .map(|frame| {
                    if vmm
                        .map_page(hal, frames, AddrSpace::CURRENT, va, frame, flags)
                        .is_err()
                    {
                        frames.free_frame(frame);
                        false
                    } else {
                        true
                    }
                })
                .unwrap_or(false);
            if !ok {
                for j in 0..i {
                    let va = base.offset((j * PAGE_SIZE) as u64);
                    let _ = vmm.release_page(hal, frames, AddrSpace::CURRENT, va);
                }
                return Err(Errno::ENOMEM);
            }
        }
        Ok(base.as_u64() as usize)
    })
    .ok_or(Errno::EAGAIN)?
}

fn sys_munmap(frame: &mut SyscallFrame) -> SyscallResult {
    let addr = VirtualAddress::new(frame.args[0]);
    let length = frame.args[1] as usize;
    if !addr.is_page_aligned() || length == 0 {
        return Err(Errno::EINVAL);
    }

    bootstrap::with_kernel(|hal, frames, vmm, _sched| {
        for i in 0..length.div_ceil(PAGE_SIZE) {
            let va = addr.offset((i * PAGE_SIZE) as u64);
            // Holes are fine; munmap over a partially mapped range
            // releases what exists.
            let _ = vmm.release_page(hal, frames, AddrSpace::CURRENT, va);
        }
        Ok(0)
    })
    .ok_or(Errno::EAGAIN)?
}
