//! Kernel binary entry
//!
//! The arch boot path decodes whatever protocol delivered the machine
//! description, fills the normalized [`BootInfo`], sets up the linear
//! physical window, and calls [`kernel_main`]. Protocol decoding itself
//! (multiboot tags, DTB walking) lives outside the core.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use nimbus_kernel::{boot::BootInfo, bootstrap, kprintln, mm::PhysMapper};

/// Architecture-independent entry, called by the arch boot stub once the
/// boot record and the physical window are ready.
#[cfg(target_os = "none")]
pub fn kernel_main(boot: &'static BootInfo, mapper: PhysMapper) -> ! {
    kprintln!("nimbus-kernel v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = bootstrap::init_with(boot, mapper) {
        kprintln!("boot failed: {}", e);
        loop {
            core::hint::spin_loop();
        }
    }

    // The boot flow becomes the idle task.
    bootstrap::idle_loop()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kprintln!("[KERNEL PANIC] {}", info);
    loop {
        core::hint::spin_loop();
    }
}

/// Hosted stub: the kernel is exercised through its test suite on hosts.
#[cfg(not(target_os = "none"))]
fn main() {
    println!(
        "nimbus-kernel v{}: hosted build; run `cargo test` to exercise the core",
        env!("CARGO_PKG_VERSION")
    );
}
