//! System-call dispatch
//!
//! A numbered trap plus up to six register-borne arguments becomes a
//! handler call through a fixed sparse table. Call numbers are 16-bit,
//! grouped by high byte into categories; empty slots and numbers at or
//! beyond [`SYS_MAX`] return the `-1` sentinel. Every other failure is a
//! negated errno, and no errno maps to 1, so `-1` uniquely means "no such
//! call" on every architecture.

mod memory;
mod process;
mod system;
mod time;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// One past the highest valid syscall number.
pub const SYS_MAX: u16 = 0x0700;

/// Syscall numbers, grouped by category ranges.
pub mod nr {
    // 0x00xx: process control.
    pub const EXIT: u16 = 0x0000;
    pub const FORK: u16 = 0x0001;
    pub const EXEC: u16 = 0x0002;
    pub const WAITPID: u16 = 0x0003;
    pub const GETPID: u16 = 0x0004;
    pub const GETPPID: u16 = 0x0005;
    pub const YIELD: u16 = 0x0006;

    // 0x01xx: file operations; handlers are registered by the VFS layer.
    pub const OPEN: u16 = 0x0100;
    pub const CLOSE: u16 = 0x0101;
    pub const READ: u16 = 0x0102;
    pub const WRITE: u16 = 0x0103;
    pub const LSEEK: u16 = 0x0104;
    pub const STAT: u16 = 0x0105;
    pub const MKDIR: u16 = 0x0106;
    pub const UNLINK: u16 = 0x0107;
    pub const RENAME: u16 = 0x0108;
    pub const CHDIR: u16 = 0x0109;
    pub const GETCWD: u16 = 0x010A;
    pub const GETDENTS: u16 = 0x010B;
    pub const FTRUNCATE: u16 = 0x010C;
    pub const PIPE: u16 = 0x010D;
    pub const DUP: u16 = 0x010E;
    pub const DUP2: u16 = 0x010F;
    pub const IOCTL: u16 = 0x0110;

    // 0x02xx: memory.
    pub const BRK: u16 = 0x0200;
    pub const MMAP: u16 = 0x0201;
    pub const MUNMAP: u16 = 0x0202;
    /// Reserved; unimplemented in this core.
    pub const MPROTECT: u16 = 0x0203;

    // 0x03xx: time.
    pub const TIME: u16 = 0x0300;
    pub const GETTIMEOFDAY: u16 = 0x0301;
    pub const NANOSLEEP: u16 = 0x0302;
    pub const CLOCK_GETTIME: u16 = 0x0303;

    // 0x04xx: signals.
    pub const KILL: u16 = 0x0400;

    // 0x05xx: system.
    pub const UNAME: u16 = 0x0500;
    pub const GETRANDOM: u16 = 0x0501;
    pub const DEBUG_PRINT: u16 = 0x0502;
    pub const REBOOT: u16 = 0x0503;
    pub const POWEROFF: u16 = 0x0504;

    // 0x06xx: sockets; handlers are registered by the network stack.
    pub const SOCKET: u16 = 0x0600;
    pub const BIND: u16 = 0x0601;
    pub const LISTEN: u16 = 0x0602;
    pub const ACCEPT: u16 = 0x0603;
    pub const CONNECT: u16 = 0x0604;
    pub const SEND: u16 = 0x0605;
    pub const RECV: u16 = 0x0606;
    pub const SENDTO: u16 = 0x0607;
    pub const RECVFROM: u16 = 0x0608;
    pub const SHUTDOWN: u16 = 0x0609;
    pub const GETSOCKOPT: u16 = 0x060A;
    pub const SETSOCKOPT: u16 = 0x060B;
}

/// Errno values used at the syscall boundary. `EPERM` (1) is deliberately
/// absent: permission failures map to `EACCES` so that `-1` stays reserved
/// for the unknown-call sentinel.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    ENOENT = 2,
    ESRCH = 3,
    EIO = 5,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENOSYS = 38,
    EOPNOTSUPP = 95,
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::InvalidParam { .. } => Errno::EINVAL,
            KernelError::NoMemory { .. } => Errno::ENOMEM,
            KernelError::NotFound { .. } => Errno::ENOENT,
            KernelError::AlreadyExists { .. } => Errno::EEXIST,
            KernelError::Permission { .. } => Errno::EACCES,
            KernelError::NotSupported { .. } => Errno::EOPNOTSUPP,
            KernelError::Busy { .. } => Errno::EBUSY,
        }
    }
}

/// Result type syscall handlers return; `Err` becomes a negated errno.
pub type SyscallResult = Result<usize, Errno>;

/// Normalized register frame a trap hands to the dispatcher. Handlers that
/// need to modify user context (sigreturn-style) write through it; the
/// dispatcher stores the return value into `ret`.
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    pub number: u64,
    pub args: [u64; 6],
    pub ret: u64,
    pub user_pc: u64,
    pub user_sp: u64,
}

impl SyscallFrame {
    pub fn new(number: u16, args: [u64; 6]) -> Self {
        Self {
            number: number as u64,
            args,
            ret: 0,
            user_pc: 0,
            user_sp: 0,
        }
    }
}

/// Handler signature: the full frame in, result out.
pub type SyscallHandler = fn(&mut SyscallFrame) -> SyscallResult;

/// The unknown/unimplemented-call sentinel.
pub const SENTINEL: isize = -1;

/// Fixed sparse dispatch table.
pub struct SyscallTable {
    entries: [Option<SyscallHandler>; SYS_MAX as usize],
}

impl SyscallTable {
    /// An empty table; every call returns the sentinel.
    pub fn empty() -> Self {
        Self {
            entries: [None; SYS_MAX as usize],
        }
    }

    /// The table with every core handler installed. File and network
    /// slots stay empty for their external subsystems to claim.
    pub fn with_core_handlers() -> Self {
        let mut table = Self::empty();
        process::install(&mut table);
        memory::install(&mut table);
        time::install(&mut table);
        system::install(&mut table);
        table
    }

    /// Claim a slot. External subsystems (VFS, network) use this for their
    /// category ranges.
    pub fn register(&mut self, number: u16, handler: SyscallHandler) -> KernelResult<()> {
        if number >= SYS_MAX {
            return Err(KernelError::InvalidParam {
                what: "syscall number out of range",
            });
        }
        if self.entries[number as usize].is_some() {
            return Err(KernelError::AlreadyExists {
                what: "syscall handler",
            });
        }
        self.entries[number as usize] = Some(handler);
        Ok(())
    }

    pub fn unregister(&mut self, number: u16) -> KernelResult<()> {
        if number >= SYS_MAX {
            return Err(KernelError::InvalidParam {
                what: "syscall number out of range",
            });
        }
        if self.entries[number as usize].take().is_none() {
            return Err(KernelError::NotFound {
                what: "syscall handler",
            });
        }
        Ok(())
    }

    /// Dispatch one call: resolve the handler, run it, normalize the
    /// result into the frame's return register.
    pub fn dispatch(&self, frame: &mut SyscallFrame) -> isize {
        // Range-check on the full trap register before any narrowing.
        if frame.number >= SYS_MAX as u64 {
            frame.ret = SENTINEL as u64;
            return SENTINEL;
        }
        let result = match self.entries[frame.number as usize] {
            Some(handler) => match handler(frame) {
                Ok(value) => {
                    let v = value as isize;
                    debug_assert!(v >= 0, "successful syscall produced a negative value");
                    v
                }
                Err(errno) => -(errno as i32) as isize,
            },
            None => SENTINEL,
        };
        frame.ret = result as u64;
        result
    }
}

lazy_static! {
    /// The live table; populated with the core handlers on first touch,
    /// extended at runtime by external subsystems.
    pub static ref SYSCALL_TABLE: Mutex<SyscallTable> =
        Mutex::new(SyscallTable::with_core_handlers());
}

/// Dispatch against the global table.
pub fn dispatch(frame: &mut SyscallFrame) -> isize {
    SYSCALL_TABLE.lock().dispatch(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: u16) -> SyscallFrame {
        SyscallFrame::new(number, [0; 6])
    }

    #[test]
    fn unknown_numbers_return_sentinel() {
        let table = SyscallTable::with_core_handlers();

        let mut f = frame(SYS_MAX);
        assert_eq!(table.dispatch(&mut f), SENTINEL);
        assert_eq!(f.ret as i64, -1);

        // Reserved mprotect slot inside the memory category.
        let mut f = frame(nr::MPROTECT);
        assert_eq!(table.dispatch(&mut f), SENTINEL);

        // Unpopulated file-category slot.
        let mut f = frame(nr::OPEN);
        assert_eq!(table.dispatch(&mut f), SENTINEL);
    }

    #[test]
    fn register_rejects_duplicates_and_out_of_range() {
        fn probe(_f: &mut SyscallFrame) -> SyscallResult {
            Ok(7)
        }

        let mut table = SyscallTable::empty();
        table.register(nr::OPEN, probe).unwrap();
        assert!(table.register(nr::OPEN, probe).is_err());
        assert!(table.register(SYS_MAX, probe).is_err());

        let mut f = frame(nr::OPEN);
        assert_eq!(table.dispatch(&mut f), 7);
        assert_eq!(f.ret, 7);

        table.unregister(nr::OPEN).unwrap();
        assert_eq!(table.dispatch(&mut frame(nr::OPEN)), SENTINEL);
    }

    #[test]
    fn errno_values_never_collide_with_sentinel() {
        let all = [
            Errno::ENOENT,
            Errno::ESRCH,
            Errno::EIO,
            Errno::EBADF,
            Errno::ECHILD,
            Errno::EAGAIN,
            Errno::ENOMEM,
            Errno::EACCES,
            Errno::EFAULT,
            Errno::EBUSY,
            Errno::EEXIST,
            Errno::EINVAL,
            Errno::ENOSYS,
            Errno::EOPNOTSUPP,
        ];
        for errno in all {
            assert_ne!(-(errno as i32) as isize, SENTINEL);
        }
    }

    #[test]
    fn kernel_errors_map_to_stable_errnos() {
        assert_eq!(
            Errno::from(KernelError::Permission { operation: "x" }),
            Errno::EACCES
        );
        assert_eq!(
            Errno::from(KernelError::NoMemory { what: "x" }),
            Errno::ENOMEM
        );
        assert_eq!(Errno::from(KernelError::Busy { what: "x" }), Errno::EBUSY);
    }
}
