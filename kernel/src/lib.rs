//! Nimbus kernel core
//!
//! The memory and execution substrate of a small multi-architecture
//! teaching kernel: physical frames with copy-on-write refcounts, a HAL
//! over an x86-like 32-bit and an ARM-like 64-bit backend, the virtual
//! memory manager, a boundary-tag kernel heap, the task/scheduler core,
//! syscall dispatch, and the interrupt/exception router.
//!
//! Everything except the thin `hw` glue modules is ordinary Rust compiled
//! on every target; hosted builds swap in the mock HAL backend, which is
//! how the whole core runs under `cargo test` without a machine.

#![no_std]

extern crate alloc;

// Host builds (unit and integration tests) link std for the test harness
// and its allocator; the kernel itself never touches it.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod print;

pub mod boot;
pub mod bootstrap;
pub mod error;
pub mod hal;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;

pub use boot::{BootInfo, FramebufferInfo, MemoryRegion, MemoryRegionKind};
pub use error::{KernelError, KernelResult};
pub use hal::{ActiveHal, AddrSpace, Hal, HalCapabilities, RawFault};
pub use mm::{
    FrameAllocator, PageFaultInfo, PageFlags, PhysMapper, PhysicalAddress, VirtualAddress, Vmm,
    PAGE_SIZE,
};
pub use sched::Scheduler;

/// The global allocator on bare metal: the boundary-tag heap, grown on
/// demand through the VMM. Hosted builds use std's allocator instead.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::heap::LockedKernelHeap = mm::heap::LockedKernelHeap::empty();

/// Access the bare-metal heap for statistics and bootstrap wiring.
#[cfg(target_os = "none")]
pub fn kernel_heap() -> &'static mm::heap::LockedKernelHeap {
    &KERNEL_HEAP
}
