//! Per-CPU vector tables and the vector allocator.
//!
//! All state here lives behind the manager's single vector lock. Callers hold
//! the descriptor lock of the IRQ being changed and take the vector lock
//! inside it, never the other way round.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use hvirq_abi::{
    CpuId, Errno, FIRST_DYNAMIC_VECTOR, Irq, IrqResult, LAST_DYNAMIC_VECTOR, NR_VECTORS, Vector,
    is_legacy_vector,
};
use hvirq_lib::{CpuMask, klog_debug};

use crate::config::VectorGrouping;
use crate::desc::{IrqDesc, UsedVectors};
use crate::msi::Sbdf;

/// One entry of a CPU's vector table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorSlot {
    Unmapped,
    /// Previously owned by this IRQ; retired by a migration or teardown.
    Stale(Irq),
    Owned(Irq),
}

impl VectorSlot {
    pub fn owner(&self) -> Option<Irq> {
        match *self {
            VectorSlot::Owned(irq) => Some(irq),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorBitmap {
    bits: [u64; NR_VECTORS / 64],
}

impl VectorBitmap {
    pub const fn new() -> Self {
        Self {
            bits: [0; NR_VECTORS / 64],
        }
    }

    #[inline]
    pub fn set(&mut self, vector: Vector) {
        self.bits[vector as usize / 64] |= 1 << (vector % 64);
    }

    #[inline]
    pub fn clear(&mut self, vector: Vector) {
        self.bits[vector as usize / 64] &= !(1 << (vector % 64));
    }

    #[inline]
    pub fn test(&self, vector: Vector) -> bool {
        self.bits[vector as usize / 64] & (1 << (vector % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

pub(crate) struct VectorState {
    tables: Vec<[VectorSlot; NR_VECTORS]>,
    current_vector: Vector,
    current_offset: u8,
    /// System vectors no IRQ may take.
    reserved: VectorBitmap,
    global_used: VectorBitmap,
    device_used: BTreeMap<Sbdf, VectorBitmap>,
    grouping: VectorGrouping,
}

impl VectorState {
    pub fn new(nr_cpus: usize, grouping: VectorGrouping) -> Self {
        Self {
            tables: vec![[VectorSlot::Unmapped; NR_VECTORS]; nr_cpus],
            current_vector: FIRST_DYNAMIC_VECTOR,
            current_offset: 0,
            reserved: VectorBitmap::new(),
            global_used: VectorBitmap::new(),
            device_used: BTreeMap::new(),
            grouping,
        }
    }

    #[inline]
    pub fn slot(&self, cpu: CpuId, vector: Vector) -> VectorSlot {
        self.tables
            .get(cpu)
            .map_or(VectorSlot::Unmapped, |t| t[vector as usize])
    }

    #[inline]
    pub fn set_slot(&mut self, cpu: CpuId, vector: Vector, slot: VectorSlot) {
        if let Some(table) = self.tables.get_mut(cpu) {
            table[vector as usize] = slot;
        }
    }

    pub fn reset_cpu(&mut self, cpu: CpuId) {
        if let Some(table) = self.tables.get_mut(cpu) {
            table.fill(VectorSlot::Unmapped);
        }
    }

    pub fn reserve(&mut self, vector: Vector) {
        self.reserved.set(vector);
    }

    pub fn is_reserved(&self, vector: Vector) -> bool {
        self.reserved.test(vector)
    }

    pub fn used_map(&self, scope: UsedVectors) -> Option<&VectorBitmap> {
        match scope {
            UsedVectors::Global => Some(&self.global_used),
            UsedVectors::Device(sbdf) => self.device_used.get(&sbdf),
        }
    }

    pub fn mark_used(&mut self, scope: UsedVectors, vector: Vector) {
        match scope {
            UsedVectors::Global => self.global_used.set(vector),
            UsedVectors::Device(sbdf) => self.device_used.entry(sbdf).or_default().set(vector),
        }
    }

    pub fn unmark_used(&mut self, scope: UsedVectors, vector: Vector) {
        match scope {
            UsedVectors::Global => self.global_used.clear(vector),
            UsedVectors::Device(sbdf) => {
                if let Some(map) = self.device_used.get_mut(&sbdf) {
                    map.clear(vector);
                    if map.is_empty() {
                        self.device_used.remove(&sbdf);
                    }
                }
            }
        }
    }

    /// CPUs that must take the same vector as `cpu`.
    pub fn allocation_group(&self, cpu: CpuId, online: &CpuMask) -> CpuMask {
        match self.grouping {
            VectorGrouping::PerCpu => CpuMask::of(cpu),
            VectorGrouping::Cluster(n) => {
                let base = cpu / n * n;
                (base..base + n).filter(|c| online.test(*c)).collect()
            }
        }
    }

    fn vector_free_for(&self, vector: Vector, group: &CpuMask, scope: Option<UsedVectors>) -> bool {
        if self.reserved.test(vector) {
            return false;
        }
        if let Some(scope) = scope
            && self.used_map(scope).is_some_and(|m| m.test(vector))
        {
            return false;
        }
        if group.test(0) && is_legacy_vector(vector) {
            return false;
        }
        group
            .iter()
            .all(|cpu| !matches!(self.slot(cpu, vector), VectorSlot::Owned(_)))
    }

    /// Find a vector for `desc` on some CPU group drawn from `mask`.
    ///
    /// Narrowing the affinity of an IRQ whose CPUs still intersect `mask` is a
    /// no-op. Moving away from a live vector starts a migration; the old
    /// vector stays owned on its CPUs until cleanup retires it.
    pub fn assign(
        &mut self,
        desc: &mut IrqDesc,
        mask: &CpuMask,
        online: &CpuMask,
    ) -> IrqResult<Vector> {
        let irq = desc.irq;
        if desc.arch.move_in_progress || desc.arch.move_cleanup_count > 0 {
            return Err(Errno::EAGAIN);
        }

        let wanted = mask.and(online);
        if let Some(vector) = desc.arch.vector
            && desc.arch.cpu_mask.intersects(&wanted)
        {
            return Ok(vector);
        }

        let scope = desc.arch.used_vectors;
        for cpu in wanted.iter() {
            let group = self.allocation_group(cpu, online);
            let mut vector = self.current_vector;
            let mut offset = self.current_offset;
            loop {
                let next = vector as u16 + 8;
                if next > LAST_DYNAMIC_VECTOR as u16 {
                    offset = (offset + 1) % 8;
                    vector = FIRST_DYNAMIC_VECTOR + offset;
                } else {
                    vector = next as Vector;
                }
                // Back at the cursor: nothing left for this group.
                if vector == self.current_vector {
                    break;
                }
                if !self.vector_free_for(vector, &group, scope) {
                    continue;
                }

                self.current_vector = vector;
                self.current_offset = offset;

                if let Some(old) = desc.arch.vector {
                    desc.arch.old_vector = Some(old);
                    desc.arch.old_cpu_mask = desc.arch.cpu_mask.and(online);
                    if desc.arch.old_cpu_mask.is_empty() {
                        for c in desc.arch.cpu_mask.iter() {
                            self.retire(c, old, irq);
                        }
                        desc.arch.vector = Some(vector);
                        self.release_old(desc);
                    } else {
                        desc.arch.move_in_progress = true;
                        klog_debug!(
                            "irq {}: moving vector {:#x} {} -> {:#x} {}",
                            irq,
                            old,
                            desc.arch.old_cpu_mask,
                            vector,
                            group
                        );
                    }
                }

                for c in group.iter() {
                    self.set_slot(c, vector, VectorSlot::Owned(irq));
                }
                desc.arch.vector = Some(vector);
                desc.arch.cpu_mask = group;
                if let Some(scope) = scope {
                    self.mark_used(scope, vector);
                }
                return Ok(vector);
            }
        }
        Err(Errno::ENOSPC)
    }

    /// Mark `vector` on `cpu` stale if `irq` still owns it.
    pub fn retire(&mut self, cpu: CpuId, vector: Vector, irq: Irq) {
        if self.slot(cpu, vector) == VectorSlot::Owned(irq) {
            self.set_slot(cpu, vector, VectorSlot::Stale(irq));
        }
    }

    /// Drop the migration history once no CPU can still deliver on it.
    pub fn release_old(&mut self, desc: &mut IrqDesc) {
        let arch = &mut desc.arch;
        let Some(old) = arch.old_vector.take() else {
            return;
        };
        arch.old_cpu_mask.clear_all();
        arch.move_in_progress = false;
        arch.move_cleanup_count = 0;
        if arch.vector != Some(old)
            && let Some(scope) = arch.used_vectors
        {
            self.unmark_used(scope, old);
        }
    }

    /// Tear down every vector `desc` holds, current and old.
    pub fn clear(&mut self, desc: &mut IrqDesc, online: &CpuMask) {
        let irq = desc.irq;
        let Some(vector) = desc.arch.vector.take() else {
            return;
        };
        for cpu in desc.arch.cpu_mask.and(online).iter() {
            self.retire(cpu, vector, irq);
        }
        desc.arch.cpu_mask.clear_all();
        if let Some(scope) = desc.arch.used_vectors {
            self.unmark_used(scope, vector);
        }

        if let Some(old) = desc.arch.old_vector {
            for cpu in desc.arch.old_cpu_mask.and(online).iter() {
                self.retire(cpu, old, irq);
            }
            self.release_old(desc);
        }
    }
}
