//! Kernel-wide error types
//!
//! One error enum covers every fallible core operation. HAL primitives
//! report failure through `bool`/`Option` sentinels; the VMM, scheduler,
//! and syscall layers translate those into `KernelError` at their own
//! boundaries. Corruption-class conditions never surface as values; they
//! panic at the detection site.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Misaligned address, null user pointer, out-of-range identifier.
    InvalidParam {
        what: &'static str,
    },
    /// Frame exhaustion, TCB exhaustion, heap growth failure.
    NoMemory {
        what: &'static str,
    },
    /// Querying an unmapped page, unregistering a missing handler.
    NotFound {
        what: &'static str,
    },
    /// Mapping a page that is already present, double registration.
    AlreadyExists {
        what: &'static str,
    },
    /// User call touching kernel memory, write to a read-only page.
    Permission {
        operation: &'static str,
    },
    /// Requesting a capability the architecture does not have.
    NotSupported {
        operation: &'static str,
    },
    /// Destroying the active address space, releasing a held resource.
    Busy {
        what: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParam { what } => write!(f, "invalid parameter: {}", what),
            Self::NoMemory { what } => write!(f, "out of memory: {}", what),
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::AlreadyExists { what } => write!(f, "already exists: {}", what),
            Self::Permission { operation } => write!(f, "permission denied: {}", operation),
            Self::NotSupported { operation } => write!(f, "not supported: {}", operation),
            Self::Busy { what } => write!(f, "busy: {}", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        extern crate alloc;
        use alloc::format;

        let e = KernelError::NoMemory { what: "frame pool" };
        assert_eq!(format!("{}", e), "out of memory: frame pool");

        let e = KernelError::Busy {
            what: "active address space",
        };
        assert!(format!("{}", e).starts_with("busy"));
    }
}
