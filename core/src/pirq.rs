//! Per-domain PIRQ tables and the map/unmap paths that tie a PIRQ to a
//! physical IRQ.
//!
//! Everything that mutates a [`DomainIrqs`] takes it by `&mut`, so holding the
//! domain's write lock is enforced by the borrow rather than re-acquired here.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use hvirq_abi::{DomainId, Errno, Irq, IrqResult, Pirq};
use hvirq_lib::{align_down_u32, align_up_u32, klog_debug, klog_info, klog_warn};
use spin::RwLock;

use crate::config::VectorMapPolicy;
use crate::controller::Controller;
use crate::desc::UsedVectors;
use crate::manager::IrqManager;
use crate::msi::{MAX_MSI_VECTORS, MsiCap, MsiDesc, MsiInfo};

/// First PIRQ handed out for GSI requests; below are the ISA lines.
const FIRST_GSI_PIRQ: Pirq = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainKind {
    Pv,
    Hvm,
}

/// Which pool a fresh PIRQ is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirqKind {
    Gsi,
    Msi,
}

/// What a PIRQ currently stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirqIrq {
    Unassigned,
    /// Handed out by a get-free-pirq request, nothing mapped yet.
    Allocated,
    Mapped(Irq),
    /// The IRQ was unmapped while a guest was still bound; the link survives
    /// until the guest unbinds.
    Unbound(Irq),
}

/// HVM emulated-IRQ side of a PIRQ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmuIrq {
    /// Passed through, no emulated line behind it.
    Passthrough,
    Irq(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PirqInfo {
    pub pirq: Pirq,
    pub irq: PirqIrq,
    pub emuirq: Option<EmuIrq>,
}

impl PirqInfo {
    const fn new(pirq: Pirq) -> Self {
        Self {
            pirq,
            irq: PirqIrq::Unassigned,
            emuirq: None,
        }
    }

    fn is_default(&self) -> bool {
        self.irq == PirqIrq::Unassigned && self.emuirq.is_none()
    }
}

/// A domain's interrupt table.
pub struct DomainIrqs {
    domain: DomainId,
    is_hvm: bool,
    nr_pirqs: u32,
    nr_irqs_gsi: u32,
    pirqs: BTreeMap<Pirq, PirqInfo>,
    irq_pirq: BTreeMap<Irq, Pirq>,
    emuirq_pirq: BTreeMap<u32, Pirq>,
    permitted: BTreeSet<Irq>,
}

impl DomainIrqs {
    pub fn new(domain: DomainId, kind: DomainKind, nr_pirqs: u32, nr_irqs_gsi: u32) -> Self {
        Self {
            domain,
            is_hvm: kind == DomainKind::Hvm,
            nr_pirqs,
            nr_irqs_gsi,
            pirqs: BTreeMap::new(),
            irq_pirq: BTreeMap::new(),
            emuirq_pirq: BTreeMap::new(),
            permitted: BTreeSet::new(),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn nr_pirqs(&self) -> u32 {
        self.nr_pirqs
    }

    pub fn pirq_info(&self, pirq: Pirq) -> Option<&PirqInfo> {
        self.pirqs.get(&pirq)
    }

    /// Live IRQ behind `pirq`; `None` unless mapped.
    pub fn pirq_to_irq(&self, pirq: Pirq) -> Option<Irq> {
        match self.pirqs.get(&pirq)?.irq {
            PirqIrq::Mapped(irq) => Some(irq),
            _ => None,
        }
    }

    /// PIRQ mapped to `irq`, ignoring force-unbound leftovers.
    pub fn irq_to_pirq(&self, irq: Irq) -> Option<Pirq> {
        let pirq = *self.irq_pirq.get(&irq)?;
        (self.pirq_to_irq(pirq) == Some(irq)).then_some(pirq)
    }

    /// PIRQ linked to `irq`, mapped or force-unbound.
    fn irq_link(&self, irq: Irq) -> Option<Pirq> {
        self.irq_pirq.get(&irq).copied()
    }

    pub fn nr_mapped(&self) -> usize {
        self.pirqs
            .values()
            .filter(|i| matches!(i.irq, PirqIrq::Mapped(_)))
            .count()
    }

    pub fn is_free_pirq(&self, pirq: Pirq) -> bool {
        match self.pirqs.get(&pirq) {
            None => true,
            Some(info) => {
                info.irq == PirqIrq::Unassigned && (!self.is_hvm || info.emuirq.is_none())
            }
        }
    }

    /// Lowest free PIRQ above the ISA range for GSIs, otherwise the highest
    /// free one at or above `nr_irqs_gsi`.
    pub fn get_free_pirq(&self, kind: PirqKind) -> IrqResult<Pirq> {
        if kind == PirqKind::Gsi {
            let end = self.nr_irqs_gsi.min(self.nr_pirqs);
            if let Some(pirq) = (FIRST_GSI_PIRQ..end).find(|p| self.is_free_pirq(*p)) {
                return Ok(pirq);
            }
        }
        (self.nr_irqs_gsi..self.nr_pirqs)
            .rev()
            .find(|p| self.is_free_pirq(*p))
            .ok_or(Errno::ENOSPC)
    }

    /// Highest free run of `nr` PIRQs aligned to `nr` (a power of two).
    pub fn get_free_pirqs(&self, nr: u32) -> IrqResult<Pirq> {
        if nr == 0 || !nr.is_power_of_two() {
            return Err(Errno::EINVAL);
        }
        let floor = align_up_u32(self.nr_irqs_gsi, nr);
        let Some(mut base) = align_down_u32(self.nr_pirqs, nr).checked_sub(nr) else {
            return Err(Errno::ENOSPC);
        };
        while base >= floor {
            if (base..base + nr).all(|p| self.is_free_pirq(p)) {
                return Ok(base);
            }
            let Some(next) = base.checked_sub(nr) else {
                break;
            };
            base = next;
        }
        Err(Errno::ENOSPC)
    }

    /// Largest power-of-two block below `nr` that is free, halving down to
    /// 2; 1 if not even a pair is available.
    pub fn largest_free_block(&self, nr: u32) -> u32 {
        let mut size = nr;
        while size > 2 {
            size >>= 1;
            if self.get_free_pirqs(size).is_ok() {
                return size;
            }
        }
        1
    }

    /// Claim a free PIRQ ahead of any mapping.
    pub fn reserve_pirq(&mut self, kind: PirqKind) -> IrqResult<Pirq> {
        let pirq = self.get_free_pirq(kind)?;
        self.pirqs
            .entry(pirq)
            .or_insert_with(|| PirqInfo::new(pirq))
            .irq = PirqIrq::Allocated;
        Ok(pirq)
    }

    /// Choose the PIRQ `irq` should map to: the caller's pick, the one it
    /// already has, or a fresh one.
    pub fn allocate_pirq(&self, irq: Irq, hint: Option<Pirq>, kind: PirqKind) -> IrqResult<Pirq> {
        let current = self.irq_link(irq);
        match (hint, current) {
            (Some(pirq), _) if pirq >= self.nr_pirqs => Err(Errno::EINVAL),
            (Some(pirq), Some(cur)) if pirq != cur => {
                klog_info!(
                    "dom{}: irq {} already mapped to pirq {}, not {}",
                    self.domain,
                    irq,
                    cur,
                    pirq
                );
                Err(Errno::EEXIST)
            }
            (Some(pirq), _) => Ok(pirq),
            (None, Some(cur)) => {
                if self.pirq_to_irq(cur) != Some(irq) {
                    // Force-unbound, waiting on the guest.
                    return Err(Errno::EBUSY);
                }
                Ok(cur)
            }
            (None, None) => self.get_free_pirq(kind),
        }
    }

    fn set_irq_pirq(&mut self, irq: Irq, pirq: Pirq) {
        self.pirqs
            .entry(pirq)
            .or_insert_with(|| PirqInfo::new(pirq))
            .irq = PirqIrq::Mapped(irq);
        self.irq_pirq.insert(irq, pirq);
    }

    pub(crate) fn clear_irq_pirq(&mut self, irq: Irq, pirq: Pirq) {
        if self.irq_pirq.get(&irq) == Some(&pirq) {
            self.irq_pirq.remove(&irq);
        }
        if let Some(info) = self.pirqs.get_mut(&pirq) {
            info.irq = PirqIrq::Unassigned;
        }
    }

    fn mark_unbound(&mut self, irq: Irq, pirq: Pirq) {
        if let Some(info) = self.pirqs.get_mut(&pirq) {
            info.irq = PirqIrq::Unbound(irq);
        }
    }

    /// Drop `pirq`'s record once nothing hangs off it.
    pub(crate) fn cleanup_pirq(&mut self, pirq: Pirq) {
        if self.pirqs.get(&pirq).is_some_and(PirqInfo::is_default) {
            self.pirqs.remove(&pirq);
        }
    }

    pub fn irq_access_permitted(&self, irq: Irq) -> bool {
        self.permitted.contains(&irq)
    }

    fn permit_irq(&mut self, irq: Irq) {
        self.permitted.insert(irq);
    }

    fn deny_irq(&mut self, irq: Irq) {
        self.permitted.remove(&irq);
    }

    // -------------------------------------------------------------------------
    // HVM emulated IRQs
    // -------------------------------------------------------------------------

    pub fn pirq_to_emuirq(&self, pirq: Pirq) -> Option<EmuIrq> {
        self.pirqs.get(&pirq)?.emuirq
    }

    pub fn emuirq_to_pirq(&self, emuirq: u32) -> Option<Pirq> {
        self.emuirq_pirq.get(&emuirq).copied()
    }

    /// Route emulated line `emuirq` of an HVM guest through `pirq`.
    pub fn map_domain_emuirq_pirq(&mut self, pirq: Pirq, emuirq: EmuIrq) -> IrqResult<()> {
        if !self.is_hvm || pirq >= self.nr_pirqs {
            return Err(Errno::EINVAL);
        }
        let old_emuirq = self.pirq_to_emuirq(pirq);
        let old_pirq = match emuirq {
            EmuIrq::Irq(line) => self.emuirq_to_pirq(line),
            EmuIrq::Passthrough => None,
        };
        if old_emuirq == Some(emuirq) && old_pirq.is_none_or(|p| p == pirq) {
            return Ok(());
        }
        if old_emuirq.is_some() || old_pirq.is_some() {
            klog_warn!(
                "dom{}: pirq {} or emuirq {:?} already emulated",
                self.domain,
                pirq,
                emuirq
            );
            return Err(Errno::EEXIST);
        }
        self.pirqs
            .entry(pirq)
            .or_insert_with(|| PirqInfo::new(pirq))
            .emuirq = Some(emuirq);
        if let EmuIrq::Irq(line) = emuirq {
            self.emuirq_pirq.insert(line, pirq);
        }
        Ok(())
    }

    pub fn unmap_domain_pirq_emuirq(&mut self, pirq: Pirq) -> IrqResult<()> {
        if !self.is_hvm || pirq >= self.nr_pirqs {
            return Err(Errno::EINVAL);
        }
        let Some(emuirq) = self.pirq_to_emuirq(pirq) else {
            klog_info!("dom{}: pirq {} not emulated", self.domain, pirq);
            return Err(Errno::EINVAL);
        };
        if let Some(info) = self.pirqs.get_mut(&pirq) {
            info.emuirq = None;
        }
        if let EmuIrq::Irq(line) = emuirq {
            self.emuirq_pirq.remove(&line);
        }
        self.cleanup_pirq(pirq);
        Ok(())
    }
}

/// A guest as far as interrupts are concerned.
pub struct Domain {
    id: DomainId,
    kind: DomainKind,
    irqs: RwLock<DomainIrqs>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    /// The interrupt table; PIRQ allocation and binding need it write-locked.
    pub fn irqs(&self) -> &RwLock<DomainIrqs> {
        &self.irqs
    }
}

impl IrqManager {
    pub fn new_domain(&self, id: DomainId, kind: DomainKind, nr_pirqs: u32) -> Domain {
        Domain {
            id,
            kind,
            irqs: RwLock::new(DomainIrqs::new(id, kind, nr_pirqs, self.config.nr_irqs_gsi)),
        }
    }

    /// Program `irq` as MSI entry `msi` and give it a vector.
    pub fn setup_msi_irq(&self, irq: Irq, msi: MsiDesc) -> IrqResult<()> {
        self.platform.msi_setup(&msi)?;
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();

        if self.config.vector_map == VectorMapPolicy::PerDevice && desc.arch.used_vectors.is_none()
        {
            let scope = UsedVectors::Device(msi.sbdf);
            desc.arch.used_vectors = Some(scope);
            if let Some(vector) = desc.arch.vector {
                self.vectors.lock().mark_used(scope, vector);
            }
        }

        desc.controller = Controller::Msi {
            maskable: msi.maskable,
        };
        desc.msi = Some(msi);
        let online = self.online_mask();
        let mask = if desc.affinity.intersects(&online) {
            desc.affinity
        } else {
            online
        };
        if let Err(e) = self.ctl_set_affinity(&mut desc, &mask) {
            desc.controller = Controller::None;
            desc.msi = None;
            return Err(e);
        }
        self.ctl_disable(&desc);
        Ok(())
    }

    /// Undo `setup_msi_irq` on an IRQ the caller keeps.
    fn teardown_msi_irq(&self, irq: Irq) {
        let Ok(lock) = self.desc_lock(irq) else {
            return;
        };
        let online = self.online_mask();
        let mut desc = lock.lock();
        if desc.msi.is_none() {
            return;
        }
        self.ctl_shutdown(&mut desc);
        desc.controller = Controller::None;
        desc.msi = None;
        self.vectors.lock().clear(&mut desc, &online);
        desc.arch.used_vectors = None;
    }

    /// Map `pirq` of `d` to `irq`. With `msi`, `irq` becomes the head of a
    /// block of `msi.nr_vectors()` IRQs on consecutive PIRQs.
    pub fn map_domain_pirq(
        &self,
        d: &mut DomainIrqs,
        pirq: Pirq,
        irq: Irq,
        msi: Option<&MsiInfo>,
    ) -> IrqResult<()> {
        if pirq >= d.nr_pirqs || irq >= self.config.nr_irqs {
            return Err(Errno::EINVAL);
        }
        let old_irq = d.pirq_info(pirq).map(|i| i.irq);
        let old_pirq = d.irq_link(irq);
        if old_irq == Some(PirqIrq::Mapped(irq)) && old_pirq == Some(pirq) {
            return Ok(());
        }
        let pirq_taken = matches!(old_irq, Some(PirqIrq::Mapped(_) | PirqIrq::Unbound(_)));
        if pirq_taken || old_pirq.is_some() {
            klog_warn!(
                "dom{}: pirq {} or irq {} already mapped",
                d.domain,
                pirq,
                irq
            );
            return Err(Errno::EEXIST);
        }

        self.platform.security_map_irq(d.domain, irq)?;

        if let Some(info) = msi {
            return self.map_msi_block(d, pirq, irq, info);
        }
        if self.with_desc(irq, |desc| desc.msi.is_some())? {
            return Err(Errno::EINVAL);
        }
        d.permit_irq(irq);
        d.set_irq_pirq(irq, pirq);
        klog_debug!("dom{}: pirq {} -> irq {}", d.domain, pirq, irq);
        Ok(())
    }

    fn map_msi_block(
        &self,
        d: &mut DomainIrqs,
        pirq: Pirq,
        irq: Irq,
        info: &MsiInfo,
    ) -> IrqResult<()> {
        let nr = info.nr_vectors();
        if nr == 0 || nr > MAX_MSI_VECTORS || !nr.is_power_of_two() {
            return Err(Errno::EDOM);
        }
        if pirq.checked_add(nr).is_none_or(|end| end > d.nr_pirqs) {
            return Err(Errno::EINVAL);
        }
        if (1..nr).any(|i| !d.is_free_pirq(pirq + i)) {
            return Err(Errno::EBUSY);
        }
        let busy = self.with_desc(irq, |desc| {
            desc.msi.is_some() || desc.controller != Controller::None
        })?;
        if busy {
            klog_info!("IRQ: irq {} already in use, cannot map MSI", irq);
            return Err(Errno::EBUSY);
        }

        self.platform.msi_enable(info)?;

        let mut irqs: Vec<Irq> = Vec::new();
        irqs.try_reserve_exact(nr as usize)
            .map_err(|_| Errno::ENOMEM)?;
        let mut mapped = 0;
        let mut failure = None;
        for index in 0..nr {
            let this_irq = if index == 0 {
                irq
            } else {
                match self.create_irq(false) {
                    Ok(n) => n,
                    Err(e) => {
                        failure = Some((index, e));
                        break;
                    }
                }
            };
            irqs.push(this_irq);
            if index != 0
                && let Err(e) = self.platform.security_map_irq(d.domain, this_irq)
            {
                failure = Some((index, e));
                break;
            }
            if let Err(e) = self.setup_msi_irq(this_irq, MsiDesc::from_info(info, index)) {
                failure = Some((index, e));
                break;
            }
            d.permit_irq(this_irq);
            d.set_irq_pirq(this_irq, pirq + index);
            mapped += 1;
        }

        let Some((failed_at, err)) = failure else {
            klog_debug!(
                "dom{}: {} MSI {} pirq {}..{} -> irq {}",
                d.domain,
                info.sbdf,
                nr,
                pirq,
                pirq + nr,
                irq
            );
            return Ok(());
        };

        klog_warn!(
            "dom{}: MSI {} failed at entry {}/{}: {}",
            d.domain,
            info.sbdf,
            failed_at,
            nr,
            err
        );
        for (index, this_irq) in irqs.iter().copied().enumerate().rev() {
            let this_pirq = pirq + index as u32;
            if index < mapped {
                d.deny_irq(this_irq);
                d.clear_irq_pirq(this_irq, this_pirq);
                d.cleanup_pirq(this_pirq);
            }
            self.teardown_msi_irq(this_irq);
            if index != 0
                && let Err(e) = self.destroy_irq(this_irq)
            {
                klog_warn!("IRQ: cannot destroy irq {}: {}", this_irq, e);
            }
        }
        self.platform.msi_disable(info.sbdf);
        Err(err)
    }

    /// Undo a mapping. A guest still bound is forced off; its PIRQ keeps an
    /// unbound link until the guest itself unbinds.
    pub fn unmap_domain_pirq(&self, d: &mut DomainIrqs, pirq: Pirq) -> IrqResult<()> {
        if pirq >= d.nr_pirqs {
            return Err(Errno::EINVAL);
        }
        let Some(irq) = d.pirq_to_irq(pirq) else {
            klog_info!("dom{}: pirq {} not mapped", d.domain, pirq);
            return Err(Errno::EINVAL);
        };
        self.platform.security_unmap_irq(d.domain, irq)?;

        let msi = self.with_desc(irq, |desc| desc.msi)?;
        let nr = match msi {
            Some(m) if !m.is_block_head() => return Err(Errno::EBUSY),
            Some(m) => m.nvec.max(1),
            None => 1,
        };

        for index in 0..nr {
            let this_pirq = pirq + index;
            let Some(this_irq) = d.pirq_to_irq(this_pirq) else {
                continue;
            };
            if self.pirq_guest_force_unbind(d, this_pirq) {
                d.mark_unbound(this_irq, this_pirq);
            } else {
                d.clear_irq_pirq(this_irq, this_pirq);
                d.cleanup_pirq(this_pirq);
            }
            d.deny_irq(this_irq);

            if msi.is_some() {
                self.teardown_msi_irq(this_irq);
                if this_irq >= self.config.nr_irqs_gsi
                    && let Err(e) = self.destroy_irq(this_irq)
                {
                    klog_warn!("IRQ: cannot destroy irq {}: {}", this_irq, e);
                }
            }
        }
        if let Some(m) = msi {
            self.platform.msi_disable(m.sbdf);
        }
        klog_debug!("dom{}: unmapped pirq {} (irq {})", d.domain, pirq, irq);
        Ok(())
    }

    /// Map GSI `gsi` into `d`, on `hint` if given.
    pub fn allocate_and_map_gsi_pirq(
        &self,
        d: &mut DomainIrqs,
        gsi: Irq,
        hint: Option<Pirq>,
    ) -> IrqResult<Pirq> {
        if gsi >= self.config.nr_irqs_gsi {
            return Err(Errno::EINVAL);
        }
        let pirq = d.allocate_pirq(gsi, hint, PirqKind::Gsi)?;
        self.map_domain_pirq(d, pirq, gsi, None)?;
        Ok(pirq)
    }

    /// Create IRQs for an MSI capability and map them into `d`.
    ///
    /// When no aligned PIRQ block of the requested size is free the call
    /// fails with `ENOSPC` and `info` is rewritten with the largest block
    /// that would fit, so the caller can retry with fewer vectors.
    pub fn allocate_and_map_msi_pirq(
        &self,
        d: &mut DomainIrqs,
        hint: Option<Pirq>,
        info: &mut MsiInfo,
    ) -> IrqResult<Pirq> {
        let nr = info.nr_vectors();
        if nr == 0 || nr > MAX_MSI_VECTORS || !nr.is_power_of_two() {
            return Err(Errno::EDOM);
        }

        let pirq = match (hint, nr) {
            (Some(pirq), _) if pirq >= d.nr_pirqs => return Err(Errno::EINVAL),
            (Some(pirq), _) => pirq,
            (None, 1) => d.get_free_pirq(PirqKind::Msi)?,
            (None, _) => match d.get_free_pirqs(nr) {
                Ok(pirq) => pirq,
                Err(e) => {
                    let avail = d.largest_free_block(nr);
                    klog_info!(
                        "dom{}: no {} aligned free pirqs for {}, {} available",
                        d.domain,
                        nr,
                        info.sbdf,
                        avail
                    );
                    if let MsiCap::Msi { nvec } = &mut info.cap {
                        *nvec = avail;
                    }
                    return Err(e);
                }
            },
        };

        let irq = self.create_irq(false)?;
        if let Err(e) = self.map_domain_pirq(d, pirq, irq, Some(info)) {
            if let Err(err) = self.destroy_irq(irq) {
                klog_warn!("IRQ: cannot destroy irq {}: {}", irq, err);
            }
            return Err(e);
        }
        Ok(pirq)
    }

    /// Domain teardown: force every guest off and unmap everything.
    pub fn release_domain_irqs(&self, d: &mut DomainIrqs) {
        let mapped: Vec<Pirq> = d
            .pirqs
            .values()
            .filter(|i| matches!(i.irq, PirqIrq::Mapped(_)))
            .map(|i| i.pirq)
            .collect();
        for pirq in mapped {
            // Block members go with their head.
            if d.pirq_to_irq(pirq).is_none() {
                continue;
            }
            if let Err(e) = self.unmap_domain_pirq(d, pirq) {
                klog_warn!("dom{}: unmap of pirq {} failed: {}", d.domain, pirq, e);
            }
        }
        d.pirqs.clear();
        d.irq_pirq.clear();
        d.emuirq_pirq.clear();
        d.permitted.clear();
        klog_debug!("dom{}: interrupt table released", d.domain);
    }
}
