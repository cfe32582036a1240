#![cfg_attr(not(test), no_std)]

pub mod alignment;
pub mod cpumask;
pub mod klog;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u32, align_up_u32};
pub use cpumask::{CpuMask, MAX_CPUS};
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
