//! Guest multiplexer: sharing one physical IRQ among several domains.
//!
//! A guest-owned descriptor carries a [`GuestAction`] listing the bound
//! domains in bind order. Deliveries mask each bound PIRQ and count it in
//! flight; the hardware acknowledgement owed by the line's [`AckType`] is
//! completed when the last guest EOIs, or when the EOI-forcing timer gives up
//! on a guest that never does.

use alloc::vec::Vec;

use hvirq_abi::{CpuId, DomainId, Errno, Irq, IrqResult, Pirq, Vector};
use hvirq_lib::{CpuMask, klog_debug, klog_info, klog_warn};

use crate::controller::AckType;
use crate::desc::{IrqAction, IrqDesc, IrqStatus};
use crate::dispatch::CpuMessage;
use crate::manager::IrqManager;
use crate::pirq::{DomainIrqs, PirqIrq};

/// How long a guest may sit on an acknowledgement.
pub const EOI_TIMEOUT_NS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestBinding {
    pub domain: DomainId,
    pub pirq: Pirq,
    /// Delivered and not yet EOI'd by the guest.
    pub masked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EoiTimer {
    pub deadline: u64,
    pub cpu: CpuId,
}

pub struct GuestAction {
    guests: Vec<GuestBinding>,
    pub ack_type: AckType,
    pub in_flight: u32,
    pub shareable: bool,
    /// CPUs holding an un-issued EOI for this IRQ on their stack.
    pub cpu_eoi_map: CpuMask,
    pub(crate) eoi_timer: Option<EoiTimer>,
}

impl GuestAction {
    /// Room for `max_guests` bindings is reserved up front so binding never
    /// allocates under the descriptor lock.
    pub(crate) fn try_new(max_guests: usize, ack_type: AckType, shareable: bool) -> IrqResult<Self> {
        let mut guests = Vec::new();
        guests
            .try_reserve_exact(max_guests)
            .map_err(|_| Errno::ENOMEM)?;
        Ok(Self {
            guests,
            ack_type,
            in_flight: 0,
            shareable,
            cpu_eoi_map: CpuMask::new(),
            eoi_timer: None,
        })
    }

    pub fn nr_guests(&self) -> usize {
        self.guests.len()
    }

    pub fn guests(&self) -> &[GuestBinding] {
        &self.guests
    }

    pub fn binding(&self, domain: DomainId) -> Option<&GuestBinding> {
        self.guests.iter().find(|g| g.domain == domain)
    }

    pub fn eoi_timer_armed(&self) -> bool {
        self.eoi_timer.is_some()
    }
}

impl IrqManager {
    // -------------------------------------------------------------------------
    // Bind / unbind
    // -------------------------------------------------------------------------

    /// Bind `pirq` of the write-locked domain table `d` to its physical IRQ.
    ///
    /// `processor` is the CPU of the VCPU the guest wants the interrupt on.
    pub fn pirq_guest_bind(
        &self,
        d: &mut DomainIrqs,
        pirq: Pirq,
        processor: CpuId,
        will_share: bool,
    ) -> IrqResult<()> {
        let irq = d.pirq_to_irq(pirq).ok_or(Errno::EINVAL)?;
        let domain = d.domain();
        let lock = self.desc_lock(irq)?;
        let max_guests = self.config.irq_max_guests;
        let mut spare: Option<GuestAction> = None;

        loop {
            let mut desc = lock.lock();
            match &desc.action {
                Some(IrqAction::Handler(h)) => {
                    klog_info!(
                        "IRQ: cannot bind irq {} to dom{}: in use by '{}'",
                        irq,
                        domain,
                        h.name
                    );
                    return Err(Errno::EBUSY);
                }
                Some(IrqAction::Guest(action)) => {
                    if !will_share || !action.shareable {
                        klog_info!(
                            "IRQ: cannot bind irq {} to dom{}: will not share with others",
                            irq,
                            domain
                        );
                        return Err(Errno::EBUSY);
                    }
                    if action.nr_guests() == 0 {
                        // Last guest is still being torn down.
                        return Err(Errno::EAGAIN);
                    }
                }
                None => {}
            }

            if desc.action.is_none() {
                let ack_type = desc.controller.ack_type();
                let Some(mut action) = spare.take() else {
                    drop(desc);
                    spare = Some(GuestAction::try_new(max_guests, ack_type, will_share)?);
                    continue;
                };
                action.ack_type = ack_type;
                action.shareable = will_share;
                desc.action = Some(IrqAction::Guest(action));
                desc.status.insert(IrqStatus::GUEST);
                desc.status
                    .remove(IrqStatus::DISABLED | IrqStatus::PENDING | IrqStatus::INPROGRESS);
                if !self.config.noirqbalance
                    && desc.controller.has_set_affinity()
                    && let Err(e) = self.ctl_set_affinity(&mut desc, &CpuMask::of(processor))
                {
                    klog_debug!("IRQ: irq {} stays off cpu {}: {}", irq, processor, e);
                }
                self.ctl_startup(&mut desc);
            }

            let Some(action) = desc.guest_action_mut() else {
                return Err(Errno::EINVAL);
            };
            if action.binding(domain).is_some() {
                klog_info!("IRQ: irq {} already bound to dom{}", irq, domain);
                return Err(Errno::EBUSY);
            }
            if action.nr_guests() >= max_guests {
                klog_info!(
                    "IRQ: cannot bind irq {} to dom{}: already at max share ({})",
                    irq,
                    domain,
                    max_guests
                );
                return Err(Errno::EBUSY);
            }
            action.guests.try_reserve(1).map_err(|_| Errno::ENOMEM)?;
            action.guests.push(GuestBinding {
                domain,
                pirq,
                masked: false,
            });
            return Ok(());
        }
    }

    /// Unbind `pirq` from its IRQ on the guest's request.
    pub fn pirq_guest_unbind(&self, d: &mut DomainIrqs, pirq: Pirq) -> IrqResult<()> {
        let state = d.pirq_info(pirq).ok_or(Errno::EINVAL)?.irq;
        match state {
            PirqIrq::Mapped(irq) => {
                drop(self.guest_unbind_irq(d.domain(), pirq, irq)?);
            }
            // Already force-unbound when the IRQ was unmapped underneath.
            PirqIrq::Unbound(irq) => d.clear_irq_pirq(irq, pirq),
            PirqIrq::Unassigned | PirqIrq::Allocated => return Err(Errno::EINVAL),
        }
        d.cleanup_pirq(pirq);
        Ok(())
    }

    /// Unbind regardless of what the guest is doing. Returns whether a
    /// binding existed.
    pub fn pirq_guest_force_unbind(&self, d: &DomainIrqs, pirq: Pirq) -> bool {
        let Some(irq) = d.pirq_to_irq(pirq) else {
            return false;
        };
        match self.guest_unbind_irq(d.domain(), pirq, irq) {
            Ok(_) => {
                klog_warn!("IRQ: forced unbind of pirq {} (irq {}) from dom{}", pirq, irq, d.domain());
                true
            }
            Err(_) => false,
        }
    }

    /// Remove `domain`'s binding. When the last guest leaves, the line is
    /// disabled, every outstanding EOI flushed, and the action returned.
    fn guest_unbind_irq(
        &self,
        domain: DomainId,
        pirq: Pirq,
        irq: Irq,
    ) -> IrqResult<Option<GuestAction>> {
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();

        let (ack_type, was_masked, in_flight, remaining, eoi_map) = {
            let Some(action) = desc.guest_action_mut() else {
                return Err(Errno::EINVAL);
            };
            let idx = action
                .guests
                .iter()
                .position(|g| g.domain == domain && g.pirq == pirq)
                .ok_or(Errno::EINVAL)?;
            let binding = action.guests.remove(idx);
            if binding.masked {
                action.in_flight -= 1;
            }
            (
                action.ack_type,
                binding.masked,
                action.in_flight,
                action.nr_guests(),
                action.cpu_eoi_map,
            )
        };

        if was_masked && in_flight == 0 && remaining != 0 {
            match ack_type {
                AckType::Unmask => self.ctl_end(None, &mut desc, None),
                AckType::Eoi => {
                    drop(desc);
                    self.on_selected_cpus(None, &eoi_map, CpuMessage::SetEoiReady(irq), false);
                    return Ok(None);
                }
                AckType::None => {}
            }
        }
        if remaining != 0 {
            return Ok(None);
        }

        assert_eq!(in_flight, 0, "irq {}: in flight with no guests", irq);
        self.ctl_disable(&desc);
        desc.status.insert(IrqStatus::DISABLED);

        let eoi_map = desc.guest_action().map(|a| a.cpu_eoi_map).unwrap_or_default();
        if !eoi_map.is_empty() {
            drop(desc);
            self.on_selected_cpus(None, &eoi_map, CpuMessage::SetEoiReady(irq), true);
            desc = lock.lock();
        }

        let action = match desc.action.take() {
            Some(IrqAction::Guest(action)) => action,
            other => {
                desc.action = other;
                return Err(Errno::EINVAL);
            }
        };
        assert!(
            action.cpu_eoi_map.is_empty(),
            "irq {}: EOIs still owed after flush",
            irq
        );
        desc.status.remove(IrqStatus::GUEST | IrqStatus::INPROGRESS);
        self.eoi_timers.lock().remove(&irq);
        self.ctl_shutdown(&mut desc);
        Ok(Some(action))
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// Fan a delivery out to the bound guests. Called with the descriptor
    /// lock held, after `ack`.
    pub(crate) fn do_irq_guest(&self, cpu: CpuId, desc: &mut IrqDesc, vector: Vector) {
        let irq = desc.irq;
        if desc.guest_action().is_none_or(|a| a.nr_guests() == 0) {
            // Slipped in while the last guest was leaving.
            self.end_irq(cpu, desc, vector);
            return;
        }
        let now = self.platform.now_ns();
        let Some(action) = desc.guest_action_mut() else {
            return;
        };

        let ack_type = action.ack_type;
        if ack_type != AckType::None {
            action.eoi_timer = None;
        }
        if ack_type == AckType::Eoi {
            self.percpu[cpu].lock().pending_eoi.push(irq, vector);
            action.cpu_eoi_map.set(cpu);
        }

        for guest in action.guests.iter_mut() {
            if ack_type != AckType::None {
                if guest.masked {
                    continue;
                }
                guest.masked = true;
                action.in_flight += 1;
            }
            self.platform.send_guest_pirq(guest.domain, guest.pirq);
        }

        if ack_type == AckType::None {
            // Nothing waits on the guests; `end` still respects EOI order.
            self.end_irq(cpu, desc, vector);
            return;
        }
        action.eoi_timer = Some(EoiTimer {
            deadline: now + EOI_TIMEOUT_NS,
            cpu,
        });
        self.eoi_timers.lock().insert(irq);
    }

    // -------------------------------------------------------------------------
    // Guest EOI
    // -------------------------------------------------------------------------

    /// The guest owning `d` finished with `pirq`.
    pub fn pirq_guest_eoi(&self, cpu: CpuId, d: &DomainIrqs, pirq: Pirq) -> IrqResult<()> {
        let irq = d.pirq_to_irq(pirq).ok_or(Errno::EINVAL)?;
        let domain = d.domain();
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();

        let (ack_type, eoi_map) = {
            let Some(action) = desc.guest_action_mut() else {
                return Ok(());
            };
            let Some(binding) = action
                .guests
                .iter_mut()
                .find(|g| g.domain == domain && g.pirq == pirq)
            else {
                return Ok(());
            };
            if !binding.masked {
                return Ok(());
            }
            binding.masked = false;
            action.in_flight -= 1;
            if action.in_flight != 0 {
                return Ok(());
            }
            action.eoi_timer = None;
            (action.ack_type, action.cpu_eoi_map)
        };

        match ack_type {
            AckType::Unmask => self.ctl_end(Some(cpu), &mut desc, None),
            AckType::Eoi => {
                let mut remote = eoi_map;
                let local = remote.test_and_clear(cpu);
                if local {
                    self.set_eoi_ready_locked(cpu, &mut desc);
                }
                drop(desc);
                if local {
                    self.flush_ready_eoi(cpu);
                }
                if !remote.is_empty() {
                    self.on_selected_cpus(Some(cpu), &remote, CpuMessage::SetEoiReady(irq), false);
                }
            }
            AckType::None => {}
        }
        Ok(())
    }

    fn set_eoi_ready_locked(&self, cpu: CpuId, desc: &mut IrqDesc) {
        let irq = desc.irq;
        let Some(action) = desc.guest_action_mut() else {
            return;
        };
        if action.in_flight != 0 || !action.cpu_eoi_map.test_and_clear(cpu) {
            return;
        }
        let found = self.percpu[cpu].lock().pending_eoi.mark_ready(irq);
        assert!(found, "irq {}: owed EOI missing from cpu {} stack", irq, cpu);
    }

    /// Inbox handler: this CPU may now issue its EOI for `irq`.
    pub(crate) fn set_eoi_ready(&self, cpu: CpuId, irq: Irq) {
        if let Ok(lock) = self.desc_lock(irq) {
            let mut desc = lock.lock();
            self.set_eoi_ready_locked(cpu, &mut desc);
        }
        self.flush_ready_eoi(cpu);
    }

    /// Issue EOIs from the top of `cpu`'s stack while they are ready.
    pub fn flush_ready_eoi(&self, cpu: CpuId) {
        let Some(pcpu) = self.percpu.get(cpu) else {
            return;
        };
        loop {
            let Some(entry) = pcpu.lock().pending_eoi.pop_ready() else {
                break;
            };
            if let Ok(lock) = self.desc_lock(entry.irq) {
                let mut desc = lock.lock();
                self.ctl_end(Some(cpu), &mut desc, Some(entry.vector));
            }
        }
    }

    /// EOI-forcing timer body: give up on guests that never acknowledged.
    pub(crate) fn irq_guest_eoi_timer_fn(&self, cpu: CpuId, irq: Irq) {
        let Ok(lock) = self.desc_lock(irq) else {
            return;
        };
        let mut desc = lock.lock();
        let (ack_type, eoi_map) = {
            let Some(action) = desc.guest_action_mut() else {
                return;
            };
            // Re-armed by a newer delivery, or nothing outstanding.
            if action.in_flight == 0 || action.eoi_timer.is_some() {
                return;
            }
            for guest in action.guests.iter_mut() {
                if guest.masked {
                    guest.masked = false;
                    action.in_flight -= 1;
                }
            }
            if action.in_flight != 0 {
                klog_warn!(
                    "IRQ: irq {}: {} EOI(s) unaccounted for, resetting",
                    irq,
                    action.in_flight
                );
                action.in_flight = 0;
            }
            (action.ack_type, action.cpu_eoi_map)
        };
        klog_warn!("IRQ: irq {}: forcing EOI for unresponsive guest(s)", irq);

        match ack_type {
            AckType::Unmask => self.ctl_end(Some(cpu), &mut desc, None),
            AckType::Eoi => {
                drop(desc);
                self.on_selected_cpus(Some(cpu), &eoi_map, CpuMessage::SetEoiReady(irq), false);
            }
            AckType::None => {}
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether `d`'s binding of `pirq` is awaiting a guest EOI.
    pub fn pirq_masked(&self, d: &DomainIrqs, pirq: Pirq) -> bool {
        let Some(irq) = d.pirq_to_irq(pirq) else {
            return false;
        };
        self.with_desc(irq, |desc| {
            desc.guest_action()
                .and_then(|a| {
                    a.guests()
                        .iter()
                        .find(|g| g.domain == d.domain() && g.pirq == pirq)
                })
                .is_some_and(|g| g.masked)
        })
        .unwrap_or(false)
    }
}
