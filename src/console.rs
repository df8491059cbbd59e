//! Console output for the VM subsystem
//!
//! Provides leveled text output for kernel debugging and status messages.
//! Output is handed to a sink registered at boot (UART, framebuffer, or a
//! test capture). Before [`set_sink`] is called nothing is emitted, but the
//! most recent lines are always kept in a small ring so a crash dump or a
//! test can inspect them.
//!
//! The console lock is the innermost lock in the kernel: it may be taken
//! while any VM table lock is held, and a sink must never log.

use core::fmt::{self, Write};
use heapless::{Deque, String};
use spin::Mutex;

/// Maximum length of one console line (longer messages are truncated)
pub const LINE_CAPACITY: usize = 160;

/// Number of recent lines retained in the ring
pub const RECENT_LINES: usize = 32;

// ============================================================================
// Log Levels
// ============================================================================

/// Kernel log severity level (lower = more severe)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable error, the kernel is about to halt
    Fatal = 0,
    /// Something failed but the kernel continues
    Error = 1,
    /// Unexpected condition
    Warn = 2,
    /// High-level progress messages
    Info = 3,
    /// Detailed diagnostics
    Debug = 4,
    /// Very verbose tracing
    Trace = 5,
}

impl LogLevel {
    /// Fixed-width name for aligned output
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// Output sink: receives every line that passes the level filter
pub type Sink = fn(LogLevel, &str);

/// One console line
pub type Line = String<LINE_CAPACITY>;

// ============================================================================
// Console
// ============================================================================

/// Writer that silently drops what does not fit in the line
struct Truncating<'a>(&'a mut Line);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Console state
pub struct Console {
    sink: Option<Sink>,
    max_level: LogLevel,
    recent: Deque<(LogLevel, Line), RECENT_LINES>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            sink: None,
            max_level: LogLevel::Info,
            recent: Deque::new(),
        }
    }

    /// Register the output sink
    pub fn set_sink(&mut self, sink: Sink) {
        self.sink = Some(sink);
    }

    /// Set the most verbose level that is still emitted
    pub fn set_max_level(&mut self, level: LogLevel) {
        self.max_level = level;
    }

    /// Current level filter
    pub fn max_level(&self) -> LogLevel {
        self.max_level
    }

    /// Format and emit one line
    pub fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        if level <= self.max_level {
            self.emit(level, args);
        }
    }

    /// Emit one line regardless of the level filter (table dumps)
    pub fn log_unfiltered(&mut self, args: fmt::Arguments<'_>) {
        self.emit(LogLevel::Info, args);
    }

    fn emit(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        let mut line = Line::new();
        let _ = Truncating(&mut line).write_fmt(args);
        // Drop a trailing newline so the ring stores bare lines
        if line.ends_with('\n') {
            line.pop();
        }

        if let Some(sink) = self.sink {
            sink(level, &line);
        }

        if self.recent.is_full() {
            self.recent.pop_front();
        }
        let _ = self.recent.push_back((level, line));
    }

    /// Iterate over the retained lines, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &(LogLevel, Line)> {
        self.recent.iter()
    }

    /// Check whether any retained line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.recent.iter().any(|(_, line)| line.contains(needle))
    }

    /// Clear the ring of recent lines
    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Register the global output sink
pub fn set_sink(sink: Sink) {
    CONSOLE.lock().set_sink(sink);
}

/// Set the global level filter
pub fn set_max_level(level: LogLevel) {
    CONSOLE.lock().set_max_level(level);
}

/// Current global level filter
pub fn max_level() -> LogLevel {
    CONSOLE.lock().max_level()
}

/// Check whether the global ring holds a line containing `needle`
pub fn recent_contains(needle: &str) -> bool {
    CONSOLE.lock().contains(needle)
}

/// Implementation detail of the logging macros
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    CONSOLE.lock().log(level, args);
}

/// Implementation detail of [`kdump!`]
#[doc(hidden)]
pub fn _dump(args: fmt::Arguments<'_>) {
    CONSOLE.lock().log_unfiltered(args);
}

// ============================================================================
// Macros
// ============================================================================

/// Log a message at the given level
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::console::_log($level, format_args!($($arg)*))
    };
}

/// Print a line at info level
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::klog!($crate::console::LogLevel::Info, "")
    };
    ($($arg:tt)*) => {
        $crate::klog!($crate::console::LogLevel::Info, $($arg)*)
    };
}

/// Print a line of a table dump, bypassing the level filter
#[macro_export]
macro_rules! kdump {
    ($($arg:tt)*) => {
        $crate::console::_dump(format_args!($($arg)*))
    };
}

/// Log a fatal message
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Fatal, $($arg)*) };
}

/// Log an error message
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Error, $($arg)*) };
}

/// Log a warning
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Warn, $($arg)*) };
}

/// Log an informational message
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Info, $($arg)*) };
}

/// Log a debug message
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Debug, $($arg)*) };
}

/// Log a trace message
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::console::LogLevel::Trace, $($arg)*) };
}
