//! Bootstrap wiring
//!
//! The singletons live here, created by [`init_with`] in the fixed order
//! the subsystems depend on each other: frames, HAL, VMM, kernel heap,
//! scheduler, router. The read-mostly ones (HAL, frame allocator, VMM) sit
//! in lock-free [`OnceCell`]s so trap handlers can reach them at any
//! nesting depth; only the scheduler, which needs `&mut`, sits behind the
//! [`GlobalState`] mutex cell. Subsystems themselves never touch these
//! cells; they take explicit references, which is what keeps them testable
//! without a machine.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    boot::BootInfo,
    error::{KernelError, KernelResult},
    hal::{ActiveHal, Hal, IrqState},
    irq,
    mm::{heap, FrameAllocator, PhysMapper, Vmm},
    sched::Scheduler,
    sync::{GlobalState, OnceCell},
};

static HAL: OnceCell<ActiveHal> = OnceCell::new();
static FRAMES: OnceCell<FrameAllocator> = OnceCell::new();
static VMM: OnceCell<Vmm> = OnceCell::new();
pub static SCHEDULER: GlobalState<Scheduler> = GlobalState::new();

/// Virtual base the boot framebuffer was remapped to, zero when absent.
static FRAMEBUFFER_BASE: AtomicU64 = AtomicU64::new(0);

/// The active HAL backend, once bootstrap has run.
pub fn hal() -> Option<&'static ActiveHal> {
    HAL.get()
}

/// The frame allocator, once bootstrap has run.
pub fn frames() -> Option<&'static FrameAllocator> {
    FRAMES.get()
}

/// The VMM, once bootstrap has run.
pub fn vmm() -> Option<&'static Vmm> {
    VMM.get()
}

/// Initialize the kernel core from the normalized boot record.
pub fn init_with(boot: &BootInfo, mapper: PhysMapper) -> KernelResult<()> {
    crate::logger::init(log::LevelFilter::Info);
    log::info!(
        "nimbus core starting: {} MiB usable RAM, {} memory regions",
        boot.total_memory / (1024 * 1024),
        boot.regions().count()
    );

    let frame_alloc = FrameAllocator::new(boot, mapper)?;
    let hal_backend = ActiveHal::new(mapper, &frame_alloc)?;
    let vmm_inst = Vmm::new(&hal_backend, mapper);

    FRAMES.set(frame_alloc)?;
    HAL.set(hal_backend)?;
    VMM.set(vmm_inst)?;

    heap::set_irq_hooks(heap_irq_save, heap_irq_restore);
    #[cfg(target_os = "none")]
    init_kernel_heap()?;

    let hal_ref = HAL.get().ok_or(KernelError::NotFound { what: "HAL cell" })?;
    SCHEDULER.init(Scheduler::new(hal_ref))?;
    irq::install(hal_ref)?;

    if let Some(fb) = boot.framebuffer {
        let frames_ref = FRAMES.get().ok_or(KernelError::NotFound {
            what: "frame allocator cell",
        })?;
        let vmm_ref = VMM.get().ok_or(KernelError::NotFound { what: "VMM cell" })?;
        let mapped = vmm_ref.map_framebuffer(hal_ref, frames_ref, fb.paddr, fb.size)?;
        FRAMEBUFFER_BASE.store(mapped.as_u64(), Ordering::Release);
        log::info!(
            "framebuffer {}x{} remapped to {:#x}",
            fb.width,
            fb.height,
            mapped.as_u64()
        );
    }

    log::info!("nimbus core initialized");
    Ok(())
}

/// Map the first stretch of the kernel heap window and hand it to the
/// global allocator; further growth goes through the VMM callback.
#[cfg(target_os = "none")]
fn init_kernel_heap() -> KernelResult<()> {
    use crate::mm::PAGE_SIZE;

    const INITIAL_HEAP_PAGES: usize = 64;

    let hal_ref = HAL.get().ok_or(KernelError::NotFound { what: "HAL cell" })?;
    let frames_ref = FRAMES.get().ok_or(KernelError::NotFound {
        what: "frame allocator cell",
    })?;
    let vmm_ref = VMM.get().ok_or(KernelError::NotFound { what: "VMM cell" })?;

    let base = hal_ref.caps().heap_base;
    if !vmm_ref.grow_kernel_heap(hal_ref, frames_ref, base, INITIAL_HEAP_PAGES) {
        return Err(KernelError::NoMemory {
            what: "initial kernel heap",
        });
    }

    // SAFETY: the pages were just mapped writable in the kernel half and
    // nothing else uses the heap window.
    unsafe {
        crate::kernel_heap().init(
            base.as_u64() as *mut u8,
            INITIAL_HEAP_PAGES * PAGE_SIZE,
            hal_ref.caps().heap_max_size,
            Some(heap_grow),
        );
    }
    Ok(())
}

#[cfg(target_os = "none")]
fn heap_grow(base: crate::mm::VirtualAddress, pages: usize) -> bool {
    match (HAL.get(), FRAMES.get(), VMM.get()) {
        (Some(hal), Some(frames), Some(vmm)) => vmm.grow_kernel_heap(hal, frames, base, pages),
        _ => false,
    }
}

fn heap_irq_save() -> usize {
    HAL.get().map(|hal| hal.irq_save().into_raw()).unwrap_or(0)
}

fn heap_irq_restore(state: usize) {
    if let Some(hal) = HAL.get() {
        hal.irq_restore(IrqState::from_raw(state));
    }
}

// ---------------------------------------------------------------------------
// Ambient accessors
// ---------------------------------------------------------------------------

/// Borrow the scheduler cell, with interrupts disabled for the duration:
/// the ready queue and task pool are also touched from the tick handler.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    match HAL.get() {
        Some(hal) => {
            crate::hal::without_interrupts(hal, || SCHEDULER.with_mut(f))
        }
        None => SCHEDULER.with_mut(f),
    }
}

/// Borrow every core singleton at once; the trap stubs and syscall
/// handlers run through here. Holds only the scheduler lock (the other
/// cells are lock-free), so it must not be nested inside itself.
pub fn with_kernel<R>(
    f: impl FnOnce(&ActiveHal, &FrameAllocator, &Vmm, &mut Scheduler) -> R,
) -> Option<R> {
    let hal = HAL.get()?;
    let frames = FRAMES.get()?;
    let vmm = VMM.get()?;
    crate::hal::without_interrupts(hal, || {
        SCHEDULER.with_mut(|sched| f(hal, frames, vmm, sched))
    })
}

/// Terminate the current task; used by the kernel-thread trampoline when
/// the thread body returns.
pub fn exit_current(code: i32) {
    let _ = with_kernel(|hal, _frames, _vmm, sched| {
        crate::sched::lifecycle::exit(sched, hal, code);
    });
}

/// Where the boot framebuffer ended up in kernel space, if one exists.
pub fn framebuffer_base() -> Option<u64> {
    match FRAMEBUFFER_BASE.load(Ordering::Acquire) {
        0 => None,
        base => Some(base),
    }
}

/// Drop the current task to user privilege at the entry its context
/// records. Hardware only; reached from the user-task trampoline.
#[cfg(target_os = "none")]
pub fn enter_user_mode() -> ! {
    let target = with_scheduler(|sched| {
        sched.current_task().map(|t| match &t.context {
            crate::hal::TaskContext::X86(ctx) => (ctx.user_eip as u64, ctx.user_esp as u64),
            crate::hal::TaskContext::Arm64(ctx) => (ctx.user_pc, ctx.user_sp),
        })
    })
    .flatten();

    match target {
        Some((_entry, _sp)) => {
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            crate::hal::x86::enter_user(_entry as u32, _sp as u32);
            #[cfg(all(target_arch = "aarch64", target_os = "none"))]
            crate::hal::arm64::enter_user(_entry, _sp);
            #[allow(unreachable_code)]
            loop {
                core::hint::spin_loop();
            }
        }
        None => panic!("enter_user_mode without a user context"),
    }
}

/// The idle loop the boot flow parks in once initialization completes.
pub fn idle_loop() -> ! {
    loop {
        if let Some(hal) = HAL.get() {
            hal.irq_enable();
            hal.wait_for_interrupt();
        }
        let _ = with_kernel(|hal, _frames, _vmm, sched| {
            if sched.resched_pending() {
                sched.schedule(hal);
            }
        });
    }
}
