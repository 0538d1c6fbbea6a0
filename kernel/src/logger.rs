//! Kernel logger
//!
//! Bridges the `log` facade onto the kernel console. Every subsystem logs
//! through `log::{trace, debug, info, warn, error}`; this module owns the
//! single [`log::Log`] implementation and the boot-time level filter.

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Module path trimmed to the last component ("nimbus_kernel::mm::vmm"
        // -> "vmm") to keep serial lines short.
        let target = record
            .module_path()
            .map(|p| p.rsplit("::").next().unwrap_or(p))
            .unwrap_or("?");
        crate::kprintln!("[{:>5}] {}: {}", record.level(), target, record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger with the given maximum level.
///
/// Safe to call more than once; later calls only adjust the level filter.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    } else {
        // Already installed (tests re-enter init); just retune the filter.
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_reentrant() {
        init(LevelFilter::Info);
        init(LevelFilter::Debug);
        assert_eq!(log::max_level(), LevelFilter::Debug);
    }
}
