// Console output macros. On bare metal these write through whatever sink the
// architecture glue registered at boot; on hosted builds they go to stdout so
// test output is visible.

use core::fmt;
#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicUsize, Ordering};

/// Console sink installed by the architecture's early-console setup.
#[cfg(target_os = "none")]
static CONSOLE_SINK: AtomicUsize = AtomicUsize::new(0);

/// Install the console sink. Called once by the arch glue before any output.
#[cfg(target_os = "none")]
pub fn set_console(sink: fn(&str)) {
    CONSOLE_SINK.store(sink as usize, Ordering::Release);
}

#[cfg(target_os = "none")]
struct ConsoleWriter;

#[cfg(target_os = "none")]
impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let raw = CONSOLE_SINK.load(Ordering::Acquire);
        if raw != 0 {
            // SAFETY: the only writer of CONSOLE_SINK is set_console, which
            // stores a valid `fn(&str)`; a fn pointer round-trips through
            // usize unchanged.
            let sink: fn(&str) = unsafe { core::mem::transmute(raw) };
            sink(s);
        }
        Ok(())
    }
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}
