//! Leveled logging for the interrupt subsystem.
//!
//! Lines are formatted lazily and handed to one registered console
//! **backend**. With no backend registered they are dropped: vectors and the
//! legacy PIC lines are set up before any console exists, and interrupt
//! context must never wait on one.
//!
//! # Levels
//!
//! The interrupt code logs at three levels:
//! - `Warn`: dropped work, such as throttled IRQs, stray vectors and failed teardown
//! - `Info`: refused requests, such as busy lines, PIRQ exhaustion and bind refusals
//! - `Debug`: vector moves, PIRQ mappings and IRQ create/destroy
//!
//! The default level is `Info`, so vector churn stays quiet unless asked for.
//!
//! # Backend contract
//!
//! The backend gets one line's arguments and must write them followed by a
//! newline without interleaving with other CPUs. It may be called with
//! descriptor and vector locks held, so it must not call back into the
//! interrupt subsystem.
//!
//! ```ignore
//! hvirq_lib::klog::klog_register_backend(console_write_line);
//! ```

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl KlogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => KlogLevel::Error,
            1 => KlogLevel::Warn,
            2 => KlogLevel::Info,
            3 => KlogLevel::Debug,
            _ => KlogLevel::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: KlogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Backend dispatch
// ---------------------------------------------------------------------------

/// Console sink for one formatted line.
pub type KlogBackend = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "no console yet".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn dispatch(args: fmt::Arguments<'_>) {
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `klog_register_backend` only stores valid `KlogBackend` fn
    // pointers, which are the same size as `*mut ()` on all supported targets.
    let backend: KlogBackend = unsafe { core::mem::transmute::<*mut (), KlogBackend>(ptr) };
    backend(args);
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Route every later line to `backend`.
pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

/// Drop the registered backend; subsequent lines are discarded.
pub fn klog_unregister_backend() {
    BACKEND.store(core::ptr::null_mut(), Ordering::Release);
}

/// Reset the level to the boot default, `Info`.
pub fn klog_init() {
    CURRENT_LEVEL.store(KlogLevel::Info as u8, Ordering::Relaxed);
}

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn klog_get_level() -> KlogLevel {
    KlogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

pub fn is_enabled_level(level: KlogLevel) -> bool {
    is_enabled(level)
}

/// Emit a formatted log line at the given level.
///
/// The backend appends a trailing newline; callers should **not** include
/// one in their format string.
pub fn log_args(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    dispatch(args);
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::klog::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Trace, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::String;

    static CAPTURED: spin::Mutex<String> = spin::Mutex::new(String::new());

    fn capture_backend(args: fmt::Arguments<'_>) {
        use core::fmt::Write;
        let mut out = CAPTURED.lock();
        let _ = out.write_fmt(args);
        out.push('\n');
    }

    #[test]
    fn test_level_filter_and_backend() {
        klog_register_backend(capture_backend);
        klog_set_level(KlogLevel::Warn);
        crate::klog_warn!("vector {} stale", 0x31);
        crate::klog_debug!("suppressed {}", 1);
        assert_eq!(klog_get_level(), KlogLevel::Warn);
        assert!(!is_enabled_level(KlogLevel::Info));
        klog_init();
        klog_unregister_backend();

        let out = CAPTURED.lock();
        assert!(out.contains("vector 49 stale\n"));
        assert!(!out.contains("suppressed"));
    }
}
