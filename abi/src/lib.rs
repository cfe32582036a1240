//! Shared definitions for the hypervisor interrupt subsystem.
//!
//! This crate provides the canonical definitions used on both sides of the
//! interrupt control plane:
//! - Integer aliases for the ids the subsystem hands around
//! - The x86 interrupt vector layout
//! - The signed error-code taxonomy returned by every administrative request

#![no_std]
#![forbid(unsafe_code)]

pub mod errno;
pub mod vectors;

/// Physical interrupt line id, independent of any CPU.
pub type Irq = u32;

/// Hardware vector number as seen by a CPU's local APIC.
pub type Vector = u8;

/// Logical CPU index.
pub type CpuId = usize;

/// Domain-relative virtual interrupt handle.
pub type Pirq = u32;

/// Domain (virtual machine) id.
pub type DomainId = u16;

pub use errno::{Errno, IrqResult};
pub use vectors::*;
