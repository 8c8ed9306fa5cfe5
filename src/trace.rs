//! Optional trace output for the allocator, disabled unless the
//! `MEMORY_DEBUG` environment variable holds the literal value `yes`.
//!
//! Tracing from inside an allocator is a minefield: the formatted output
//! machinery of the host program may itself allocate, and if this crate is
//! installed as the global allocator that allocation comes right back here.
//! The sink therefore follows two rules. First, it never runs while the
//! heap lock is held, callers trace before or after the locked section.
//! Second, it refuses to run recursively: the trace mutex is taken with a
//! non blocking `try_lock` and a thread local "currently tracing" flag is
//! checked behind it, so a trace that somehow triggers another trace
//! returns silently instead of looping. Formatting happens in a fixed stack
//! buffer flushed with a single `write` syscall, which keeps the sink
//! itself allocation free.

use std::{cell::Cell, fmt, sync::Mutex};

/// Whether tracing is enabled. `None` until the environment has been
/// consulted, which happens once, lazily, under the trace mutex.
static ENABLED: Mutex<Option<bool>> = Mutex::new(None);

thread_local! {
    /// Set while this thread is inside [`print`].
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

/// Emits one trace line. Safe to call from anywhere except while holding
/// the heap lock; silent when tracing is disabled, contended or reentered.
pub(crate) fn print(args: fmt::Arguments<'_>) {
    let Ok(mut enabled) = ENABLED.try_lock() else {
        return;
    };

    if RUNNING.with(|running| running.replace(true)) {
        return;
    }

    if *enabled.get_or_insert_with(sys::consult_environment) {
        sys::emit(args);
    }

    RUNNING.with(|running| running.set(false));
}

macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::trace::print(format_args!($($arg)*))
    };
}

pub(crate) use trace;

#[cfg(unix)]
#[cfg(not(miri))]
mod sys {
    use std::{ffi::CStr, fmt};

    /// Trace lines longer than this are truncated. Plenty for the pointer
    /// and size values we print.
    const LINE_CAPACITY: usize = 256;

    /// `core::fmt` adapter over a fixed stack buffer. Overflowing writes
    /// are truncated instead of failing, a cut off trace line is still more
    /// useful than no line.
    struct LineBuffer {
        bytes: [u8; LINE_CAPACITY],
        len: usize,
    }

    impl LineBuffer {
        fn new() -> Self {
            Self {
                bytes: [0; LINE_CAPACITY],
                len: 0,
            }
        }
    }

    impl fmt::Write for LineBuffer {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let available = LINE_CAPACITY - self.len;
            let count = s.len().min(available);
            self.bytes[self.len..self.len + count].copy_from_slice(&s.as_bytes()[..count]);
            self.len += count;

            Ok(())
        }
    }

    /// Reads `MEMORY_DEBUG` through `getenv`, which unlike the std
    /// environment accessors doesn't allocate.
    pub(super) fn consult_environment() -> bool {
        let value = unsafe { libc::getenv(b"MEMORY_DEBUG\0".as_ptr().cast()) };

        if value.is_null() {
            return false;
        }

        unsafe { CStr::from_ptr(value) }.to_bytes() == b"yes"
    }

    /// Formats the line into a stack buffer and writes it to standard
    /// error in one syscall.
    pub(super) fn emit(args: fmt::Arguments<'_>) {
        use fmt::Write;

        let mut line = LineBuffer::new();
        let _ = line.write_fmt(args);
        let _ = line.write_str("\n");

        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                line.bytes.as_ptr().cast(),
                line.len,
            );
        }
    }

    #[cfg(test)]
    mod tests {
        use std::fmt::Write;

        use super::*;

        #[test]
        fn buffer_truncates_instead_of_failing() {
            let mut line = LineBuffer::new();

            for _ in 0..LINE_CAPACITY {
                line.write_str("abc").unwrap();
            }

            assert_eq!(line.len, LINE_CAPACITY);
            assert_eq!(&line.bytes[..3], b"abc");
        }

        #[test]
        fn formatting_fills_the_buffer() {
            let mut line = LineBuffer::new();
            let address = 0x7f00_1000 as *const u8;

            write!(line, "allocate({}) -> {:p}", 128usize, address).unwrap();

            assert!(line.len > 0);
            assert!(line.bytes[..line.len].starts_with(b"allocate(128) -> 0x"));
        }
    }
}

#[cfg(not(all(unix, not(miri))))]
mod sys {
    use std::fmt;

    pub(super) fn consult_environment() -> bool {
        false
    }

    pub(super) fn emit(_: fmt::Arguments<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_is_reentrancy_safe() {
        // Disabled in the test environment, this just exercises the guard
        // paths: flag set, flag cleared, second call after the first.
        print(format_args!("first"));
        print(format_args!("second"));

        assert!(!RUNNING.with(|running| running.get()));
    }
}
