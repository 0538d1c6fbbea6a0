//! Saved CPU contexts
//!
//! Each backend defines the register snapshot its context switch saves and
//! restores; the scheduler stores them behind this arch-neutral enum and
//! manipulates them only through the accessors below (return value for the
//! fork child, first-entry user transition, address-space root).

use crate::{
    hal::AddrSpace,
    mm::VirtualAddress,
};

pub use super::{arm64::Arm64Context, x86::X86Context};

/// Architecture-specific saved context, owned by a TCB.
#[derive(Debug, Clone)]
pub enum TaskContext {
    X86(X86Context),
    Arm64(Arm64Context),
}

impl TaskContext {
    /// The register the syscall return value lands in.
    pub fn set_return_value(&mut self, value: u64) {
        match self {
            TaskContext::X86(ctx) => ctx.eax = value as u32,
            TaskContext::Arm64(ctx) => ctx.x0 = value,
        }
    }

    pub fn return_value(&self) -> u64 {
        match self {
            TaskContext::X86(ctx) => ctx.eax as u64,
            TaskContext::Arm64(ctx) => ctx.x0,
        }
    }

    /// Configure the first transition to user privilege: entry point and
    /// user stack pointer, consumed by the arch's user-mode return path.
    pub fn set_user_entry(&mut self, entry: VirtualAddress, user_sp: VirtualAddress) {
        match self {
            TaskContext::X86(ctx) => {
                ctx.user_eip = entry.as_u64() as u32;
                ctx.user_esp = user_sp.as_u64() as u32;
            }
            TaskContext::Arm64(ctx) => {
                ctx.user_pc = entry.as_u64();
                ctx.user_sp = user_sp.as_u64();
            }
        }
    }

    /// Arguments handed to the kernel-thread trampoline through
    /// callee-saved registers.
    pub fn set_entry_args(&mut self, arg0: u64, arg1: u64) {
        match self {
            TaskContext::X86(ctx) => {
                ctx.ebx = arg0 as u32;
                ctx.esi = arg1 as u32;
            }
            TaskContext::Arm64(ctx) => {
                ctx.x19_x28[0] = arg0;
                ctx.x19_x28[1] = arg1;
            }
        }
    }

    pub fn entry_args(&self) -> (u64, u64) {
        match self {
            TaskContext::X86(ctx) => (ctx.ebx as u64, ctx.esi as u64),
            TaskContext::Arm64(ctx) => (ctx.x19_x28[0], ctx.x19_x28[1]),
        }
    }

    /// Root of the address space the context resumes under.
    pub fn space(&self) -> AddrSpace {
        match self {
            TaskContext::X86(ctx) => AddrSpace::from_root(crate::mm::PhysicalAddress::new(
                ctx.cr3 as u64,
            )),
            TaskContext::Arm64(ctx) => {
                AddrSpace::from_root(crate::mm::PhysicalAddress::new(ctx.ttbr0))
            }
        }
    }

    pub fn set_space(&mut self, space: AddrSpace) {
        match self {
            TaskContext::X86(ctx) => ctx.cr3 = space.root().as_u64() as u32,
            TaskContext::Arm64(ctx) => ctx.ttbr0 = space.root().as_u64(),
        }
    }

    /// Re-point the saved stack registers from one kernel stack to a copy
    /// of it at a different address, preserving the depth. Used by fork
    /// when the child gets its duplicated kernel stack.
    pub fn rebase_stack(&mut self, old_top: u64, new_top: u64) {
        match self {
            TaskContext::X86(ctx) => {
                let depth = old_top as u32 - ctx.esp;
                ctx.esp = new_top as u32 - depth;
                if ctx.ebp != 0 && (ctx.ebp as u64) <= old_top {
                    let frame_depth = old_top as u32 - ctx.ebp;
                    ctx.ebp = new_top as u32 - frame_depth;
                }
            }
            TaskContext::Arm64(ctx) => {
                let depth = old_top - ctx.sp;
                ctx.sp = new_top - depth;
                if ctx.fp != 0 && ctx.fp <= old_top {
                    let frame_depth = old_top - ctx.fp;
                    ctx.fp = new_top - frame_depth;
                }
            }
        }
    }

    /// Saved program counter (diagnostics and tests).
    pub fn pc(&self) -> u64 {
        match self {
            TaskContext::X86(ctx) => ctx.eip as u64,
            TaskContext::Arm64(ctx) => ctx.pc,
        }
    }

    /// Saved stack pointer (diagnostics and tests).
    pub fn sp(&self) -> u64 {
        match self {
            TaskContext::X86(ctx) => ctx.esp as u64,
            TaskContext::Arm64(ctx) => ctx.sp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysicalAddress;

    #[test]
    fn retval_and_args_round_trip() {
        let mut ctx = TaskContext::Arm64(Arm64Context::new(
            VirtualAddress::new(0x1000),
            VirtualAddress::new(0x8000),
            AddrSpace::from_root(PhysicalAddress::new(0x4000)),
        ));
        ctx.set_return_value(0);
        assert_eq!(ctx.return_value(), 0);
        ctx.set_entry_args(7, 9);
        assert_eq!(ctx.entry_args(), (7, 9));
        assert_eq!(ctx.space().root().as_u64(), 0x4000);

        let mut ctx = TaskContext::X86(X86Context::new(
            VirtualAddress::new(0x1000),
            VirtualAddress::new(0x8000),
            AddrSpace::from_root(PhysicalAddress::new(0x4000)),
        ));
        ctx.set_return_value(42);
        assert_eq!(ctx.return_value(), 42);
        assert_eq!(ctx.pc(), 0x1000);
        assert_eq!(ctx.sp(), 0x8000);
    }
}
