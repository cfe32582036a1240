//! Physical interrupt vector manager and guest interrupt multiplexer.
//!
//! [`IrqManager`] owns every dynamic vector on every CPU, moves IRQs between
//! CPUs without losing deliveries, and shares physical lines among domains
//! through per-domain PIRQ tables ([`pirq::DomainIrqs`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod controller;
pub mod desc;
pub mod dispatch;
pub mod eoi;
pub mod guest;
pub mod manager;
pub mod migrate;
pub mod msi;
pub mod pirq;
pub mod platform;
pub mod ratelimit;
pub mod vector;

#[cfg(test)]
mod test_fixtures;

#[cfg(test)]
mod migrate_tests;

pub use config::{IrqConfig, VectorGrouping, VectorMapPolicy};
pub use controller::{AckType, Controller};
pub use desc::{IrqAction, IrqDesc, IrqHandler, IrqStatus, IrqUse, MoveState};
pub use dispatch::DirectHandler;
pub use eoi::PendingEoi;
pub use guest::{GuestAction, GuestBinding};
pub use manager::IrqManager;
pub use msi::{MsiCap, MsiDesc, MsiInfo, Sbdf};
pub use pirq::{Domain, DomainIrqs, DomainKind, EmuIrq, PirqInfo, PirqIrq, PirqKind};
pub use platform::Platform;
pub use vector::VectorSlot;
