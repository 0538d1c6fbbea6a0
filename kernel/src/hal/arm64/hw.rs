//! ARM64 hardware glue
//!
//! Bare-metal-only register access: translation root installs, TLB and
//! cache maintenance, DAIF masking, the early UART sink, and the context
//! switch. Barriers and the idle instruction come from `cortex-a`; system
//! registers without a crate wrapper use inline asm, matching how the rest
//! of the ecosystem handles them.

#![cfg(all(target_arch = "aarch64", target_os = "none"))]

use core::arch::{asm, global_asm};

use cortex_a::asm::{self, barrier};

use super::context::Arm64Context;

pub fn write_ttbr0(root: u64) {
    // SAFETY: the caller installs a valid root table; barriers order the
    // write against subsequent translation.
    unsafe {
        barrier::dsb(barrier::ISHST);
        asm!("msr ttbr0_el1, {0}", in(reg) root, options(nostack, preserves_flags));
        barrier::isb(barrier::SY);
    }
}

pub fn tlbi_vaddr(vaddr: u64) {
    // SAFETY: TLB invalidation by VA is always permitted at EL1.
    unsafe {
        barrier::dsb(barrier::ISHST);
        asm!("tlbi vaae1is, {0}", in(reg) vaddr >> 12, options(nostack, preserves_flags));
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

pub fn tlbi_all() {
    // SAFETY: full EL1 TLB invalidation is always permitted.
    unsafe {
        barrier::dsb(barrier::ISHST);
        asm!("tlbi vmalle1is", options(nostack, preserves_flags));
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

pub fn irq_enable() {
    // SAFETY: clearing the I mask in kernel context.
    unsafe { asm!("msr daifclr, #2", options(nostack, preserves_flags)) };
}

pub fn irq_disable() {
    // SAFETY: setting the I mask in kernel context.
    unsafe { asm!("msr daifset, #2", options(nostack, preserves_flags)) };
}

pub fn wait_for_interrupt() {
    asm::wfi();
}

/// Cache line size used by the maintenance loops.
const CACHE_LINE: u64 = 64;

pub fn dcache_clean(addr: u64, size: usize) {
    let mut line = addr & !(CACHE_LINE - 1);
    while line < addr + size as u64 {
        // SAFETY: clean by VA on mapped addresses.
        unsafe { asm!("dc cvac, {0}", in(reg) line, options(nostack, preserves_flags)) };
        line += CACHE_LINE;
    }
    // SAFETY: barrier completes the maintenance.
    unsafe { barrier::dsb(barrier::SY) };
}

pub fn dcache_invalidate(addr: u64, size: usize) {
    let mut line = addr & !(CACHE_LINE - 1);
    while line < addr + size as u64 {
        // SAFETY: invalidate by VA on mapped addresses.
        unsafe { asm!("dc ivac, {0}", in(reg) line, options(nostack, preserves_flags)) };
        line += CACHE_LINE;
    }
    // SAFETY: barrier completes the maintenance.
    unsafe { barrier::dsb(barrier::SY) };
}

pub fn dcache_clean_invalidate(addr: u64, size: usize) {
    let mut line = addr & !(CACHE_LINE - 1);
    while line < addr + size as u64 {
        // SAFETY: clean+invalidate by VA on mapped addresses.
        unsafe { asm!("dc civac, {0}", in(reg) line, options(nostack, preserves_flags)) };
        line += CACHE_LINE;
    }
    // SAFETY: barrier completes the maintenance.
    unsafe { barrier::dsb(barrier::SY) };
}

/// PSCI SYSTEM_RESET via SMC.
pub fn platform_reset() {
    // SAFETY: PSCI call with the standard function id; does not return on
    // conforming firmware.
    unsafe {
        asm!("mov w0, {0:w}", "smc #0", in(reg) 0x8400_0009u32, options(nostack));
    }
}

/// PSCI SYSTEM_OFF via SMC.
pub fn platform_poweroff() {
    // SAFETY: PSCI call with the standard function id.
    unsafe {
        asm!("mov w0, {0:w}", "smc #0", in(reg) 0x8400_0008u32, options(nostack));
    }
}

/// Drop to EL0 at `entry` on `user_sp` via eret.
pub fn enter_user(entry: u64, user_sp: u64) -> ! {
    // SAFETY: the caller primed a valid user mapping for entry and stack;
    // SPSR 0 selects EL0t with interrupts unmasked.
    unsafe {
        asm!(
            "msr sp_el0, {sp}",
            "msr elr_el1, {pc}",
            "msr spsr_el1, xzr",
            "eret",
            sp = in(reg) user_sp,
            pc = in(reg) entry,
            options(noreturn),
        );
    }
}

/// Early console: PL011 data register on the QEMU virt machine, used only
/// until a real serial driver registers.
const EARLY_UART_DR: *mut u32 = 0x0900_0000 as *mut u32;

pub fn uart_putstr(s: &str) {
    for byte in s.bytes() {
        // SAFETY: the boot mapping covers the UART MMIO page.
        unsafe { EARLY_UART_DR.write_volatile(byte as u32) };
    }
}

// Context switch: save callee-saved registers, sp and the resume address
// into the outgoing Arm64Context, then load the incoming one. Offsets
// mirror the #[repr(C)] layout (x19..x28 at 0-72, fp 80, lr 88, sp 96,
// pc 104, spsr 112, ttbr0 120).
global_asm!(
    r#"
.global arm64_context_switch
arm64_context_switch:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mov x9, sp
    str x9,  [x0, #96]
    str x30, [x0, #104]        // resume pc = return address

    ldr x9, [x1, #120]         // incoming ttbr0
    mrs x10, ttbr0_el1
    cmp x9, x10
    b.eq 1f
    dsb ishst
    msr ttbr0_el1, x9
    tlbi vmalle1is
    dsb ish
    isb
1:
    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x30, [x1, #80]
    ldr x9,  [x1, #96]
    mov sp, x9
    ldr x9,  [x1, #104]
    br x9
"#
);

extern "C" {
    pub fn arm64_context_switch(from: *mut Arm64Context, to: *const Arm64Context);
}
