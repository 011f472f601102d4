//! Kernel logging front end.
//!
//! The memory core runs long before any driver exists, so the log macros
//! write through function slots that start out as no-ops. The platform
//! registers real sinks with [`set_print_fn`] and [`set_log_fn`] once a
//! console is up; everything logged before that is dropped.
//!
//! [`kprint!`] and [`kprintln!`] emit raw text. [`klog!`] and the per-level
//! shorthands ([`kinfo!`], [`kwarn!`], ...) attach a [`LogLevel`] and leave
//! formatting (timestamps, colors) to the registered sink.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Severity of a log record. Lower discriminant means more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// The kernel cannot continue.
    Fatal = 0,
    /// An operation failed; the kernel continues.
    Error = 1,
    /// Unexpected but tolerable condition.
    Warn = 2,
    /// Normal progress reporting.
    Info = 3,
    /// Diagnostic detail.
    Debug = 4,
    /// Very verbose tracing.
    Trace = 5,
}

impl LogLevel {
    /// Fixed-width name for aligned sink output.
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

/// Signature of the raw print sink.
pub type PrintFn = fn(fmt::Arguments<'_>);

/// Signature of the leveled log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn discard_print(_args: fmt::Arguments<'_>) {}

fn discard_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static PRINT_SLOT: AtomicPtr<()> = AtomicPtr::new(discard_print as *mut ());
static LOG_SLOT: AtomicPtr<()> = AtomicPtr::new(discard_log as *mut ());

/// Installs the raw print sink. May be called again to swap sinks, for
/// example when moving from early serial to a buffered console.
///
/// # Safety
///
/// `f` must be callable from any context the kernel logs in, including
/// with arbitrary locks held by other cores.
pub unsafe fn set_print_fn(f: PrintFn) {
    PRINT_SLOT.store(f as *mut (), Ordering::Release);
}

/// Installs the leveled log sink.
///
/// # Safety
///
/// Same contract as [`set_print_fn`].
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_SLOT.store(f as *mut (), Ordering::Release);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    let ptr = PRINT_SLOT.load(Ordering::Acquire);
    // SAFETY: PRINT_SLOT only ever holds a valid PrintFn.
    let f: PrintFn = unsafe { core::mem::transmute(ptr) };
    f(args);
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    let ptr = LOG_SLOT.load(Ordering::Acquire);
    // SAFETY: LOG_SLOT only ever holds a valid LogFn.
    let f: LogFn = unsafe { core::mem::transmute(ptr) };
    f(level, args);
}

/// Prints raw text to the registered print sink.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => { $crate::log::_print(format_args!($($arg)*)) };
}

/// Prints raw text followed by a newline.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => { $crate::kprint!("{}\n", format_args!($($arg)*)) };
}

/// Logs a record at an explicit [`LogLevel`].
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Fatal`].
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs at [`LogLevel::Error`].
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs at [`LogLevel::Warn`].
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs at [`LogLevel::Info`].
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs at [`LogLevel::Debug`].
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs at [`LogLevel::Trace`].
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
