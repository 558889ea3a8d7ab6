//! Buffered kernel logging
//!
//! Messages land in a ring buffer first, so logging works from the earliest
//! point of boot. Registering a console flushes the backlog to it and routes
//! new messages to both. The buffer doubles as the dmesg-style record for
//! diagnostics.
//!
//! Trap glue is outside this crate, so printk is never entered from IRQ
//! context and a single buffer lock suffices.

use core::fmt::{self, Write};

use spin::{Mutex, RwLock};

/// Ring buffer size (must be a power of 2)
const PRINTK_BUFFER_SIZE: usize = 8192;

/// Longest single message; anything longer is truncated
const PRINTK_MSG_MAX: usize = 256;

/// Console sink for log output
///
/// The UART (or test harness) behind this trait lives outside the crate.
pub trait Console: Sync {
    fn write(&self, s: &str);
}

/// Ring buffer for printk messages
struct RingBuffer {
    data: [u8; PRINTK_BUFFER_SIZE],
    /// Next byte to write
    head: usize,
    /// Has the buffer wrapped (overwritten old data)?
    wrapped: bool,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            data: [0; PRINTK_BUFFER_SIZE],
            head: 0,
            wrapped: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.data[self.head] = b;
            self.head = (self.head + 1) & (PRINTK_BUFFER_SIZE - 1);
            if self.head == 0 {
                self.wrapped = true;
            }
        }
    }

    /// Copy the buffered bytes, oldest first, into `out`.
    ///
    /// Returns the number of bytes written.
    fn snapshot(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        if self.wrapped {
            for &b in &self.data[self.head..] {
                if n == out.len() {
                    return n;
                }
                out[n] = b;
                n += 1;
            }
        }
        for &b in &self.data[..self.head] {
            if n == out.len() {
                return n;
            }
            out[n] = b;
            n += 1;
        }
        n
    }
}

static PRINTK: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

static CONSOLE: RwLock<Option<&'static dyn Console>> = RwLock::new(None);

/// Fixed-size formatting target; output beyond the buffer is dropped
struct FixedWriter {
    buf: [u8; PRINTK_MSG_MAX],
    len: usize,
}

impl Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = PRINTK_MSG_MAX - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Format and log one message
///
/// Prefer the `printkln!` macro.
pub fn printk(args: fmt::Arguments) {
    let mut w = FixedWriter {
        buf: [0; PRINTK_MSG_MAX],
        len: 0,
    };
    let _ = w.write_fmt(args);

    PRINTK.lock().push(&w.buf[..w.len]);

    if let Some(console) = *CONSOLE.read()
        && let Ok(s) = core::str::from_utf8(&w.buf[..w.len])
    {
        console.write(s);
    }
}

/// Attach a console and flush the buffered backlog to it
pub fn register_console(console: &'static dyn Console) {
    *CONSOLE.write() = Some(console);

    let mut backlog = [0u8; PRINTK_BUFFER_SIZE];
    let n = PRINTK.lock().snapshot(&mut backlog);
    if let Ok(s) = core::str::from_utf8(&backlog[..n]) {
        console.write(s);
    }
}

/// Copy the current log contents, oldest first, into `out`
///
/// Returns the number of bytes written. Used by diagnostics and tests.
pub fn log_snapshot(out: &mut [u8]) -> usize {
    PRINTK.lock().snapshot(out)
}

/// Log a line to the kernel ring buffer (and console, if attached)
#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk::printk(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::printk::printk(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Tests
// ============================================================================
