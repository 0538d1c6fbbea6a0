//! Interrupt and exception router
//!
//! Owns the three architecture-independent bindings: the timer vector
//! feeds the tick counter and the scheduler, the page-fault vector goes
//! through fault normalization into the VMM, and the syscall vector lands
//! in the dispatcher. Device drivers register their own vectors straight
//! through the HAL.
//!
//! Interrupts EOI after their handler returns and may then reschedule;
//! faults and syscalls are exceptions and never EOI.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    error::KernelResult,
    hal::{Hal, RawFault},
    mm::vmm::FaultResolution,
    sched::{lifecycle, FAULT_EXIT_CODE},
    syscall::SyscallFrame,
};

/// Milliseconds since boot, advanced by the timer binding.
static TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Milliseconds added per timer interrupt; set by the tick source.
static TICK_PERIOD_MS: AtomicU64 = AtomicU64::new(10);

/// Payload hand-off slots between the trap glue and the registered vector
/// stubs (the vector-table signature carries no payload).
static PENDING_FAULT: Mutex<Option<RawFault>> = Mutex::new(None);
static PENDING_SYSCALL: Mutex<Option<SyscallFrame>> = Mutex::new(None);

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    TICKS_MS.load(Ordering::Acquire)
}

/// Tick-source registration hook: a timer driver declares the period its
/// interrupt fires at.
pub fn set_tick_period_ms(period: u64) {
    TICK_PERIOD_MS.store(period.max(1), Ordering::Release);
}

/// Install the three core bindings on the HAL's vector table.
pub fn install<H: Hal>(hal: &H) -> KernelResult<()> {
    let caps = hal.caps();
    hal.register_handler(caps.timer_vector, timer_vector_stub, 0)?;
    hal.register_handler(caps.fault_vector, fault_vector_stub, 0)?;
    hal.register_handler(caps.syscall_vector, syscall_vector_stub, 0)?;
    log::info!(
        "router bound: timer={} fault={} syscall={}",
        caps.timer_vector,
        caps.fault_vector,
        caps.syscall_vector
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Delivery entry points (called by the arch trap glue, and by tests)
// ---------------------------------------------------------------------------

/// Deliver an external interrupt: run its handler, send EOI, then take any
/// pending reschedule. Handlers themselves never suspend.
pub fn deliver_irq<H: Hal>(hal: &H, vector: u32) {
    hal.dispatch(vector);
    hal.eoi(vector);
    let _ = crate::bootstrap::with_kernel(|hal, _frames, _vmm, sched| {
        if sched.resched_pending() {
            sched.schedule(hal);
        }
    });
}

/// Deliver a page fault: stash the syndrome and route through the vector
/// table. Exceptions do not EOI.
pub fn deliver_fault<H: Hal>(hal: &H, raw: RawFault) {
    *PENDING_FAULT.lock() = Some(raw);
    hal.dispatch(hal.caps().fault_vector);
}

/// Deliver a syscall trap; the normalized return value lands back in
/// `frame.ret`.
pub fn deliver_syscall<H: Hal>(hal: &H, frame: &mut SyscallFrame) {
    *PENDING_SYSCALL.lock() = Some(*frame);
    hal.dispatch(hal.caps().syscall_vector);
    if let Some(processed) = PENDING_SYSCALL.lock().take() {
        *frame = processed;
    }
}

// ---------------------------------------------------------------------------
// Vector stubs
// ---------------------------------------------------------------------------

/// Timer tick: advance the clock and let the scheduler account the slice.
/// The reschedule itself is deferred to after EOI (see [`deliver_irq`]).
fn timer_vector_stub(_vector: u32, _context: usize) {
    let period = TICK_PERIOD_MS.load(Ordering::Acquire);
    let now = TICKS_MS.fetch_add(period, Ordering::AcqRel) + period;
    let _ = crate::bootstrap::with_scheduler(|sched| sched.on_tick(now));
}

/// Page fault: normalize, resolve, and either resume, kill the current
/// task, or give up on the machine.
fn fault_vector_stub(_vector: u32, _context: usize) {
    let Some(raw) = PENDING_FAULT.lock().take() else {
        log::warn!("fault vector fired without a pending syndrome");
        return;
    };

    let outcome = crate::bootstrap::with_kernel(|hal, frames, vmm, sched| {
        let info = hal.parse_fault(raw);
        let extents = sched.current_task().and_then(|t| t.extents);
        let outcome = vmm.handle_fault(hal, frames, extents.as_ref(), &info);
        if outcome == FaultResolution::KillTask {
            lifecycle::terminate_current(sched, hal, FAULT_EXIT_CODE);
        }
        (outcome, info)
    });

    if let Some((FaultResolution::Panic, info)) = outcome {
        panic!(
            "unresolvable kernel page fault at {:#x} (syndrome {:#x})",
            info.vaddr.as_u64(),
            info.raw
        );
    }
}

/// Syscall trap: dispatch against the global table.
fn syscall_vector_stub(_vector: u32, _context: usize) {
    let frame = PENDING_SYSCALL.lock().take();
    let Some(mut frame) = frame else {
        log::warn!("syscall vector fired without a pending frame");
        return;
    };
    crate::syscall::dispatch(&mut frame);
    *PENDING_SYSCALL.lock() = Some(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_advances_by_tick_period() {
        set_tick_period_ms(10);
        let before = uptime_ms();
        timer_vector_stub(0, 0);
        timer_vector_stub(0, 0);
        assert_eq!(uptime_ms(), before + 20);
    }
}
