//! Vector migration, cleanup and CPU hotplug.
//!
//! Moving a live IRQ goes Stable -> MoveInProgress -> CleanupPending ->
//! Stable. The old vector stays owned on its CPUs until the first delivery
//! on the new vector proves the hardware has switched over; only then are the
//! old CPUs asked to retire their entries.

use hvirq_abi::{
    CpuId, Errno, FIRST_DYNAMIC_VECTOR, IRQ_MOVE_CLEANUP_VECTOR, Irq, IrqResult,
    LAST_DYNAMIC_VECTOR, Vector,
};
use hvirq_lib::{CpuMask, klog_debug, klog_warn};

use crate::controller::Controller;
use crate::desc::{IrqDesc, IrqStatus};
use crate::dispatch::CpuMessage;
use crate::manager::IrqManager;
use crate::vector::VectorSlot;

impl IrqManager {
    /// Assign a vector for `mask` and record the new affinity. Returns the
    /// CPUs now targeted.
    pub(crate) fn set_desc_affinity(
        &self,
        desc: &mut IrqDesc,
        mask: &CpuMask,
    ) -> IrqResult<CpuMask> {
        let online = self.online_mask();
        if !mask.intersects(&online) {
            return Err(Errno::EINVAL);
        }
        self.vectors.lock().assign(desc, mask, &online)?;
        desc.affinity = *mask;
        Ok(desc.arch.cpu_mask.and(&online))
    }

    /// Give `irq` a vector reachable from `mask` (all online CPUs if `None`)
    /// and reprogram its source. `EAGAIN` while a previous move is pending.
    pub fn assign_irq_vector(&self, irq: Irq, mask: Option<&CpuMask>) -> IrqResult<Vector> {
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();
        let mask = mask.copied().unwrap_or_else(|| self.online_mask());
        if desc.controller.has_set_affinity() {
            self.ctl_set_affinity(&mut desc, &mask)?;
        } else {
            self.set_desc_affinity(&mut desc, &mask)?;
        }
        desc.arch.vector.ok_or(Errno::EINVAL)
    }

    /// Release every vector of `irq`.
    pub fn clear_irq_vector(&self, irq: Irq) -> IrqResult<()> {
        let lock = self.desc_lock(irq)?;
        let online = self.online_mask();
        let mut desc = lock.lock();
        self.vectors.lock().clear(&mut desc, &online);
        Ok(())
    }

    /// Request an affinity change; it takes effect on the next
    /// acknowledgement, when the line is known to be quiescent.
    pub fn irq_set_affinity(&self, irq: Irq, mask: &CpuMask) -> IrqResult<()> {
        if mask.is_empty() {
            return Err(Errno::EINVAL);
        }
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();
        if !desc.controller.has_set_affinity() {
            return Err(Errno::EINVAL);
        }
        desc.status.insert(IrqStatus::MOVE_PENDING);
        desc.arch.pending_mask = *mask;
        Ok(())
    }

    /// Apply a pending affinity request. Called from `ack`.
    pub(crate) fn move_native_irq(&self, desc: &mut IrqDesc) {
        if !desc.status.contains(IrqStatus::MOVE_PENDING) {
            return;
        }
        desc.status.remove(IrqStatus::MOVE_PENDING);
        let pending = desc.arch.pending_mask;
        desc.arch.pending_mask.clear_all();
        if !pending.intersects(&self.online_mask()) {
            return;
        }

        self.ctl_disable(desc);
        if let Err(e) = self.ctl_set_affinity(desc, &pending) {
            klog_debug!("irq {}: deferred affinity {} failed: {}", desc.irq, pending, e);
        }
        if !desc.status.contains(IrqStatus::DISABLED) {
            self.ctl_enable(desc);
        }
    }

    /// Called from `ack`: the first delivery on the new vector on one of the
    /// new CPUs ends the move and starts cleanup of the old vector.
    pub(crate) fn irq_complete_move(&self, cpu: CpuId, desc: &mut IrqDesc, vector: Vector) {
        if !desc.arch.move_in_progress {
            return;
        }
        if desc.owns_vector_on(cpu, vector) {
            self.send_cleanup_vector(desc);
        }
    }

    fn send_cleanup_vector(&self, desc: &mut IrqDesc) {
        let targets = desc.arch.old_cpu_mask.and(&self.online_mask());
        desc.arch.move_in_progress = false;
        if targets.is_empty() {
            self.vectors.lock().release_old(desc);
            return;
        }
        desc.arch.move_cleanup_count = targets.weight();
        for cpu in targets.iter() {
            if self.post_message(cpu, CpuMessage::MoveCleanup) {
                self.platform.send_ipi(cpu, IRQ_MOVE_CLEANUP_VECTOR);
            }
        }
    }

    /// Retire this CPU's entries for IRQs that have moved away.
    ///
    /// A vector still latched in the IRR has a delivery in flight that must
    /// reach the old binding, so the entry is kept and cleanup retried on the
    /// next slice.
    pub(crate) fn irq_move_cleanup_interrupt(&self, cpu: CpuId) {
        for vector in FIRST_DYNAMIC_VECTOR..=LAST_DYNAMIC_VECTOR {
            let Some(irq) = self.vectors.lock().slot(cpu, vector).owner() else {
                continue;
            };
            let Ok(lock) = self.desc_lock(irq) else {
                continue;
            };
            let mut desc = lock.lock();

            if desc.controller == Controller::LegacyPic || desc.arch.move_cleanup_count == 0 {
                continue;
            }
            if desc.owns_vector_on(cpu, vector) {
                continue;
            }
            if desc.arch.old_vector != Some(vector) || !desc.arch.old_cpu_mask.test(cpu) {
                continue;
            }

            if self.platform.lapic_irr_pending(cpu, vector) {
                self.post_message(cpu, CpuMessage::MoveCleanup);
                continue;
            }

            let mut vs = self.vectors.lock();
            vs.set_slot(cpu, vector, VectorSlot::Stale(irq));
            // Only CPUs still owing cleanup stay in the old mask.
            desc.arch.old_cpu_mask.clear(cpu);
            desc.arch.move_cleanup_count -= 1;
            if desc.arch.move_cleanup_count == 0 {
                vs.release_old(&mut desc);
            }
        }
    }

    // -------------------------------------------------------------------------
    // CPU hotplug
    // -------------------------------------------------------------------------

    /// Take `cpu` offline: resolve migrations involving it, move IRQs that
    /// only targeted it, and drain its EOI stack.
    pub fn cpu_down(&self, cpu: CpuId) -> IrqResult<()> {
        {
            let mut online = self.online.write();
            if !online.test(cpu) {
                return Err(Errno::EINVAL);
            }
            if online.weight() == 1 {
                return Err(Errno::EBUSY);
            }
            online.clear(cpu);
        }
        self.fixup_irqs(cpu);
        self.fixup_eoi(cpu);

        self.vectors.lock().reset_cpu(cpu);
        self.percpu[cpu].lock().inbox.clear();
        Ok(())
    }

    /// Bring `cpu` online and rebuild its vector table from the descriptors.
    pub fn cpu_up(&self, cpu: CpuId) -> IrqResult<()> {
        if cpu >= self.config.nr_cpus {
            return Err(Errno::EINVAL);
        }
        self.vectors.lock().reset_cpu(cpu);
        for lock in self.descs.iter() {
            let desc = lock.lock();
            if let Some(vector) = desc.arch.vector
                && desc.arch.cpu_mask.test(cpu)
            {
                self.vectors
                    .lock()
                    .set_slot(cpu, vector, VectorSlot::Owned(desc.irq));
            }
        }
        self.online.write().set(cpu);
        Ok(())
    }

    fn fixup_irqs(&self, dying: CpuId) {
        let online = self.online_mask();
        for lock in self.descs.iter() {
            let mut desc = lock.lock();
            let irq = desc.irq;
            if desc.arch.vector.is_none() || desc.controller == Controller::LegacyPic {
                continue;
            }

            // The dying CPU will never run its cleanup.
            if desc.arch.move_cleanup_count > 0 && desc.arch.old_cpu_mask.test(dying) {
                desc.arch.old_cpu_mask.clear(dying);
                desc.arch.move_cleanup_count -= 1;
                if desc.arch.move_cleanup_count == 0 {
                    self.vectors.lock().release_old(&mut desc);
                }
            }
            if desc.arch.move_in_progress {
                desc.arch.old_cpu_mask = desc.arch.old_cpu_mask.and(&online);
                if desc.arch.old_cpu_mask.is_empty() {
                    self.vectors.lock().release_old(&mut desc);
                } else if !desc.arch.cpu_mask.intersects(&online) {
                    // The move target died before the switch-over: fall back.
                    self.abandon_move(&mut desc);
                    let old = desc.arch.cpu_mask;
                    if let Err(e) = self.ctl_set_affinity(&mut desc, &old) {
                        klog_warn!("irq {}: cannot restore {}: {}", irq, old, e);
                    }
                    continue;
                }
            }

            if !desc.arch.cpu_mask.test(dying) {
                continue;
            }
            let remaining = desc.arch.cpu_mask.and(&online);
            if !remaining.is_empty() {
                desc.arch.cpu_mask = remaining;
                continue;
            }

            let mut target = desc.affinity.and(&online);
            if target.is_empty() {
                target = online;
            }
            self.ctl_disable(&desc);
            match self.ctl_set_affinity(&mut desc, &target) {
                Ok(()) => klog_debug!("irq {}: moved off cpu {} to {}", irq, dying, target),
                Err(e) => klog_warn!("irq {}: cannot leave cpu {}: {}", irq, dying, e),
            }
            if !desc.status.contains(IrqStatus::DISABLED) {
                self.ctl_enable(&desc);
            }
        }
    }

    /// Drop the half-finished move target and reinstate the old binding.
    fn abandon_move(&self, desc: &mut IrqDesc) {
        let irq = desc.irq;
        let (Some(new), Some(old)) = (desc.arch.vector, desc.arch.old_vector) else {
            return;
        };
        let mut vs = self.vectors.lock();
        for cpu in desc.arch.cpu_mask.iter() {
            vs.retire(cpu, new, irq);
        }
        if new != old
            && let Some(scope) = desc.arch.used_vectors
        {
            vs.unmark_used(scope, new);
        }
        desc.arch.vector = Some(old);
        desc.arch.cpu_mask = desc.arch.old_cpu_mask;
        desc.arch.old_vector = None;
        desc.arch.old_cpu_mask.clear_all();
        desc.arch.move_in_progress = false;
    }

    /// Nothing more is owed on `cpu`: forget its EOI-map bits and issue every
    /// EOI it still holds.
    fn fixup_eoi(&self, cpu: CpuId) {
        for lock in self.descs.iter() {
            let mut desc = lock.lock();
            if let Some(action) = desc.guest_action_mut() {
                action.cpu_eoi_map.clear(cpu);
            }
        }
        self.percpu[cpu].lock().pending_eoi.mark_all_ready();
        self.flush_ready_eoi(cpu);
    }
}
