//! Interrupt-context entry point, per-core inboxes and timers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hvirq_abi::{
    CALL_FUNCTION_VECTOR, CpuId, Errno, FIRST_HIPRIORITY_VECTOR, FIRST_LEGACY_VECTOR, Irq,
    IrqResult, LAST_HIPRIORITY_VECTOR, Vector, is_legacy_vector,
};
use hvirq_lib::{CpuMask, klog_debug, klog_warn};

use crate::desc::{IrqDesc, IrqStatus};
use crate::manager::IrqManager;
use crate::vector::VectorSlot;

/// Handler for a vector that bypasses the descriptor machinery.
#[derive(Clone)]
pub enum DirectHandler {
    MoveCleanup,
    CallFunction,
    EventCheck,
    Custom(Arc<dyn Fn(CpuId) + Send + Sync>),
}

/// Work queued for a CPU by another CPU (or by itself, to retry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuMessage {
    MoveCleanup,
    SetEoiReady(Irq),
}

impl IrqManager {
    /// Handle `vector` arriving on `cpu`.
    pub fn do_irq(&self, cpu: CpuId, vector: Vector) {
        if cpu >= self.percpu.len() {
            klog_warn!("IRQ: vector {:#x} on unknown cpu {}", vector, cpu);
            return;
        }
        self.process_inbox(cpu);
        self.percpu[cpu].lock().irq_count += 1;

        let slot = self.vectors.lock().slot(cpu, vector);
        let irq = match slot {
            VectorSlot::Owned(irq) => irq,
            other => {
                self.do_unmapped_vector(cpu, vector, other);
                return;
            }
        };
        let Ok(lock) = self.desc_lock(irq) else {
            return;
        };
        let mut desc = lock.lock();
        desc.count += 1;
        self.ctl_ack(cpu, &mut desc, vector);

        if desc.is_guest() {
            if !self.irq_ratelimit(&mut desc) {
                self.do_irq_guest(cpu, &mut desc, vector);
                return;
            }
        } else {
            desc.status.insert(IrqStatus::PENDING);
            if !desc
                .status
                .intersects(IrqStatus::DISABLED | IrqStatus::INPROGRESS)
            {
                desc.status.insert(IrqStatus::INPROGRESS);
                while desc.status.contains(IrqStatus::PENDING) {
                    desc.status.remove(IrqStatus::PENDING);
                    let Some(handler) = desc.handler().map(|h| h.handler.clone()) else {
                        break;
                    };
                    drop(desc);
                    handler(irq);
                    desc = lock.lock();
                }
                desc.status.remove(IrqStatus::INPROGRESS);
            }
        }

        self.end_irq(cpu, &mut desc, vector);
        drop(desc);
        self.flush_ready_eoi(cpu);
    }

    /// `end` with EOI ordering: while this CPU owes EOIs for higher vectors,
    /// an EOI-type `end` is slotted into the stack instead of issued.
    pub(crate) fn end_irq(&self, cpu: CpuId, desc: &mut IrqDesc, vector: Vector) {
        let deferring = !self.percpu[cpu].lock().pending_eoi.is_empty();
        if !deferring {
            self.ctl_end(Some(cpu), desc, Some(vector));
            return;
        }
        self.percpu[cpu].lock().check_eoi_deferral = true;
        self.ctl_end(Some(cpu), desc, Some(vector));
        self.percpu[cpu].lock().check_eoi_deferral = false;
    }

    fn do_unmapped_vector(&self, cpu: CpuId, vector: Vector, slot: VectorSlot) {
        let direct = self.direct.read()[vector as usize].clone();
        if let Some(handler) = direct {
            match handler {
                // The inbox was drained on entry.
                DirectHandler::MoveCleanup | DirectHandler::CallFunction => {}
                DirectHandler::EventCheck => {}
                DirectHandler::Custom(f) => f(cpu),
            }
            self.platform.lapic_eoi(cpu);
            return;
        }

        if self.platform.lapic_isr_in_service(cpu, vector) {
            self.platform.lapic_eoi(cpu);
        }

        // IRQ7/IRQ15 spurious lines from the 8259 fire routinely.
        let bogus_legacy = is_legacy_vector(vector)
            && matches!(vector - FIRST_LEGACY_VECTOR, 7 | 15);
        if bogus_legacy {
            let mut reported = self.spurious_reported.lock();
            if reported.test(vector) {
                return;
            }
            reported.set(vector);
        }
        match slot {
            VectorSlot::Stale(irq) => klog_warn!(
                "IRQ: cpu {} vector {:#x} delivered after irq {} left it",
                cpu,
                vector,
                irq
            ),
            _ => klog_warn!("IRQ: cpu {} no irq for vector {:#x}", cpu, vector),
        }
    }

    /// Claim a vector from the high-priority pool for a direct handler.
    pub fn alloc_direct_apic_vector(
        &self,
        handler: Arc<dyn Fn(CpuId) + Send + Sync>,
    ) -> IrqResult<Vector> {
        let mut direct = self.direct.write();
        let mut vs = self.vectors.lock();
        for vector in FIRST_HIPRIORITY_VECTOR..=LAST_HIPRIORITY_VECTOR {
            if direct[vector as usize].is_none() && !vs.is_reserved(vector) {
                vs.reserve(vector);
                direct[vector as usize] = Some(DirectHandler::Custom(handler));
                return Ok(vector);
            }
        }
        Err(Errno::ENOSPC)
    }

    // -------------------------------------------------------------------------
    // Per-core inbox
    // -------------------------------------------------------------------------

    /// Queue `msg` for `cpu`. Returns `false` if an identical message was
    /// already waiting.
    pub(crate) fn post_message(&self, cpu: CpuId, msg: CpuMessage) -> bool {
        let Some(pcpu) = self.percpu.get(cpu) else {
            return false;
        };
        let mut pcpu = pcpu.lock();
        if pcpu.inbox.contains(&msg) {
            return false;
        }
        pcpu.inbox.push(msg);
        true
    }

    /// Run everything queued for `cpu` so far. Messages posted while this
    /// runs wait for the next slice.
    pub fn process_inbox(&self, cpu: CpuId) {
        let Some(pcpu) = self.percpu.get(cpu) else {
            return;
        };
        let msgs: Vec<CpuMessage> = core::mem::take(&mut pcpu.lock().inbox);
        for msg in msgs {
            self.handle_message(cpu, msg);
        }
    }

    fn handle_message(&self, cpu: CpuId, msg: CpuMessage) {
        match msg {
            CpuMessage::MoveCleanup => self.irq_move_cleanup_interrupt(cpu),
            CpuMessage::SetEoiReady(irq) => self.set_eoi_ready(cpu, irq),
        }
    }

    /// Run `msg` on every CPU in `mask`.
    ///
    /// The calling CPU runs it inline. With `wait` every target runs it
    /// before this returns; otherwise remote CPUs pick it up from their inbox
    /// after a call-function IPI.
    pub(crate) fn on_selected_cpus(
        &self,
        caller: Option<CpuId>,
        mask: &CpuMask,
        msg: CpuMessage,
        wait: bool,
    ) {
        for cpu in mask.iter() {
            if wait || caller == Some(cpu) {
                self.handle_message(cpu, msg);
            } else if self.post_message(cpu, msg) {
                self.platform.send_ipi(cpu, CALL_FUNCTION_VECTOR);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Fire expired timers owned by `cpu`: EOI-forcing timers armed there and
    /// the global ratelimit timer.
    pub fn run_timers(&self, cpu: CpuId) {
        let now = self.platform.now_ns();
        let armed: Vec<Irq> = self.eoi_timers.lock().iter().copied().collect();
        for irq in armed {
            let Ok(lock) = self.desc_lock(irq) else {
                continue;
            };
            let fire = {
                let mut desc = lock.lock();
                let timer = desc.guest_action().and_then(|a| a.eoi_timer);
                match timer {
                    Some(t) if t.cpu != cpu || t.deadline > now => false,
                    Some(_) => {
                        if let Some(action) = desc.guest_action_mut() {
                            action.eoi_timer = None;
                        }
                        self.eoi_timers.lock().remove(&irq);
                        true
                    }
                    None => {
                        self.eoi_timers.lock().remove(&irq);
                        false
                    }
                }
            };
            if fire {
                klog_debug!("irq {}: EOI timer fired on cpu {}", irq, cpu);
                self.irq_guest_eoi_timer_fn(cpu, irq);
            }
        }

        let ratelimit_due = self
            .ratelimit
            .lock()
            .deadline
            .is_some_and(|deadline| deadline <= now);
        if ratelimit_due {
            self.irq_ratelimit_timer_fn();
        }
    }
}
