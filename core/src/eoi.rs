//! Per-CPU stack of deferred local-APIC EOIs.
//!
//! The local APIC only lets the highest in-service vector be EOI'd, so a
//! guest-owned interrupt whose acknowledgement is postponed keeps its slot
//! here until the guest finishes. Entries are kept in strictly increasing
//! vector order from bottom to top and drained from the top.

use alloc::vec::Vec;

use hvirq_abi::{Irq, NR_DYNAMIC_VECTORS, Vector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEoi {
    pub irq: Irq,
    pub vector: Vector,
    pub ready: bool,
}

pub struct EoiStack {
    entries: Vec<PendingEoi>,
}

impl EoiStack {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(NR_DYNAMIC_VECTORS),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top(&self) -> Option<&PendingEoi> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[PendingEoi] {
        &self.entries
    }

    /// Record a delivery whose EOI waits for the guest.
    ///
    /// Panics if `vector` does not exceed the current top: the CPU cannot
    /// take a lower-priority interrupt while a higher one is in service, so
    /// an out-of-order push means the stack is corrupt.
    pub fn push(&mut self, irq: Irq, vector: Vector) {
        assert!(
            self.entries.len() < NR_DYNAMIC_VECTORS,
            "EOI stack overflow (irq {})",
            irq
        );
        if let Some(top) = self.entries.last() {
            assert!(
                top.vector < vector,
                "EOI stack order violated: irq {} vector {:#x} over irq {} vector {:#x}",
                irq,
                vector,
                top.irq,
                top.vector
            );
        }
        self.entries.push(PendingEoi {
            irq,
            vector,
            ready: false,
        });
    }

    /// Slot an already-acknowledged EOI beneath the higher vectors still
    /// pending, so it is issued once they drain.
    pub fn insert_deferred(&mut self, irq: Irq, vector: Vector) {
        assert!(
            self.entries.len() < NR_DYNAMIC_VECTORS,
            "EOI stack overflow (irq {})",
            irq
        );
        let pos = self.entries.partition_point(|e| e.vector < vector);
        assert!(
            self.entries.get(pos).is_none_or(|e| e.vector != vector),
            "EOI stack already holds vector {:#x} (irq {})",
            vector,
            irq
        );
        self.entries.insert(
            pos,
            PendingEoi {
                irq,
                vector,
                ready: true,
            },
        );
    }

    /// Mark the topmost entry for `irq` ready. Returns whether one was found.
    pub fn mark_ready(&mut self, irq: Irq) -> bool {
        match self.entries.iter_mut().rev().find(|e| e.irq == irq) {
            Some(entry) => {
                entry.ready = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_ready(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.ready = true;
        }
    }

    /// Pop the top entry if it is ready.
    pub fn pop_ready(&mut self) -> Option<PendingEoi> {
        if self.entries.last().is_some_and(|e| e.ready) {
            self.entries.pop()
        } else {
            None
        }
    }
}

impl Default for EoiStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_increasing() {
        let mut stack = EoiStack::new();
        stack.push(40, 0x30);
        stack.push(41, 0x48);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top().map(|e| e.irq), Some(41));
    }

    #[test]
    #[should_panic(expected = "order violated")]
    fn test_push_tie_is_fatal() {
        let mut stack = EoiStack::new();
        stack.push(40, 0x30);
        stack.push(41, 0x30);
    }

    #[test]
    #[should_panic(expected = "order violated")]
    fn test_push_lower_is_fatal() {
        let mut stack = EoiStack::new();
        stack.push(40, 0x50);
        stack.push(41, 0x30);
    }

    #[test]
    fn test_drain_high_first_only_while_ready() {
        let mut stack = EoiStack::new();
        stack.push(1, 0x30);
        stack.push(2, 0x40);
        stack.push(3, 0x50);

        assert!(stack.mark_ready(1));
        assert_eq!(stack.pop_ready(), None);

        assert!(stack.mark_ready(3));
        assert_eq!(stack.pop_ready().map(|e| e.vector), Some(0x50));
        assert_eq!(stack.pop_ready(), None);

        assert!(stack.mark_ready(2));
        let drained: Vec<Vector> = core::iter::from_fn(|| stack.pop_ready())
            .map(|e| e.vector)
            .collect();
        assert_eq!(drained, [0x40, 0x30]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_insert_deferred_keeps_order() {
        let mut stack = EoiStack::new();
        stack.push(1, 0x30);
        stack.push(2, 0x60);
        stack.insert_deferred(9, 0x48);
        let vectors: Vec<Vector> = stack.entries().iter().map(|e| e.vector).collect();
        assert_eq!(vectors, [0x30, 0x48, 0x60]);
        assert!(stack.entries()[1].ready);

        stack.mark_ready(2);
        assert_eq!(stack.pop_ready().map(|e| e.irq), Some(2));
        assert_eq!(stack.pop_ready().map(|e| e.irq), Some(9));
        assert_eq!(stack.pop_ready(), None);
    }

    #[test]
    fn test_mark_ready_unknown_irq() {
        let mut stack = EoiStack::new();
        stack.push(1, 0x30);
        assert!(!stack.mark_ready(7));
    }
}
