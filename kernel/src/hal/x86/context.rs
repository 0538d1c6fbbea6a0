//! x86 saved context

use crate::{hal::AddrSpace, mm::VirtualAddress};

/// Register snapshot the x86 context switch saves and restores.
///
/// Only callee-saved registers, the stack, the flags, and the paging root
/// are kept; caller-saved state lives on the kernel stack across a switch.
/// The `user_*` pair parameterizes the first drop to user privilege.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct X86Context {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cr3: u32,
    /// Syscall/fork return register.
    pub eax: u32,
    pub user_eip: u32,
    pub user_esp: u32,
}

/// EFLAGS with the interrupt-enable bit set.
const EFLAGS_IF: u32 = 0x202;

impl X86Context {
    /// Fresh kernel-mode context starting at `entry` on `stack_top`.
    pub fn new(entry: VirtualAddress, stack_top: VirtualAddress, space: AddrSpace) -> Self {
        Self {
            ebx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: stack_top.as_u64() as u32,
            eip: entry.as_u64() as u32,
            eflags: EFLAGS_IF,
            cr3: space.root().as_u64() as u32,
            eax: 0,
            user_eip: 0,
            user_esp: 0,
        }
    }
}
