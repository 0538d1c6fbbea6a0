//! Synchronization primitives shared across subsystems

pub mod once_cell;

pub use once_cell::{GlobalState, OnceCell};
