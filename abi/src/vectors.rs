//! x86 interrupt vector layout.
//!
//! Vectors below 0x20 are CPU exceptions. Everything from
//! [`FIRST_DYNAMIC_VECTOR`] to [`LAST_DYNAMIC_VECTOR`] is handed out by the
//! vector allocator; the top of the space belongs to processor-initiated
//! interrupts and a small high-priority pool for direct handlers.

use crate::Vector;

pub const NR_VECTORS: usize = 256;

// =============================================================================
// Dynamically allocated range
// =============================================================================

pub const FIRST_DYNAMIC_VECTOR: Vector = 0x20;
pub const LAST_DYNAMIC_VECTOR: Vector = 0xee;
pub const NR_DYNAMIC_VECTORS: usize = (LAST_DYNAMIC_VECTOR - FIRST_DYNAMIC_VECTOR) as usize + 1;

/// Legacy 8259 lines land on 0x20..=0x2f. The range is a sub-range of the
/// dynamic one and is reused on CPUs that do not share vectors with CPU 0.
pub const FIRST_LEGACY_VECTOR: Vector = FIRST_DYNAMIC_VECTOR;
pub const LAST_LEGACY_VECTOR: Vector = FIRST_LEGACY_VECTOR + 0xf;
pub const NR_LEGACY_IRQS: u32 = 16;

/// The PIC cascade (IRQ2) never raises, so its vector carries move cleanup.
pub const IRQ_MOVE_CLEANUP_VECTOR: Vector = FIRST_LEGACY_VECTOR + 2;

pub const LEGACY_SYSCALL_VECTOR: Vector = 0x80;
pub const HYPERCALL_VECTOR: Vector = 0x82;

// =============================================================================
// High-priority range
// =============================================================================

/// IRQ0 (timer) is statically allocated but must outrank guest interrupts.
pub const IRQ0_VECTOR: Vector = 0xf0;
pub const FIRST_HIPRIORITY_VECTOR: Vector = 0xf1;
pub const LAST_HIPRIORITY_VECTOR: Vector = 0xf8;

pub const PMU_APIC_VECTOR: Vector = 0xf9;
pub const LOCAL_TIMER_VECTOR: Vector = 0xfa;
pub const CALL_FUNCTION_VECTOR: Vector = 0xfb;
pub const EVENT_CHECK_VECTOR: Vector = 0xfc;
pub const INVALIDATE_TLB_VECTOR: Vector = 0xfd;
pub const ERROR_APIC_VECTOR: Vector = 0xfe;
pub const SPURIOUS_APIC_VECTOR: Vector = 0xff;

pub const FIRST_IRQ_VECTOR: Vector = FIRST_DYNAMIC_VECTOR;
pub const LAST_IRQ_VECTOR: Vector = LAST_HIPRIORITY_VECTOR;

#[inline]
pub const fn is_dynamic_vector(vector: Vector) -> bool {
    vector >= FIRST_DYNAMIC_VECTOR && vector <= LAST_DYNAMIC_VECTOR
}

#[inline]
pub const fn is_legacy_vector(vector: Vector) -> bool {
    vector >= FIRST_LEGACY_VECTOR && vector <= LAST_LEGACY_VECTOR
}

/// Vector a legacy PIC line occupies on CPU 0.
#[inline]
pub const fn legacy_vector(irq: u32) -> Vector {
    FIRST_LEGACY_VECTOR + irq as Vector
}
