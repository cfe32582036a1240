//! Interrupt controller backends.
//!
//! The set of controllers is closed: every IRQ is driven by one of the
//! [`Controller`] variants and the manager dispatches on the variant. The
//! guest acknowledgement discipline is a property of the variant rather than
//! something inferred from its display name.

use hvirq_abi::{CpuId, Errno, Irq, IrqResult, Vector};
use hvirq_lib::CpuMask;

use crate::desc::{IrqDesc, IrqStatus};
use crate::manager::IrqManager;

/// What a guest-owned delivery needs before the line can fire again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckType {
    /// Hardware already acknowledged in `ack`; nothing owed.
    None,
    /// Line was masked in `ack`; unmask once every guest has EOI'd.
    Unmask,
    /// Local-APIC EOI withheld until every guest has EOI'd.
    Eoi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Controller {
    /// Unconfigured line.
    None,
    LegacyPic,
    IoApicEdge,
    /// `move_aware`: the IO-APIC honours directed EOI, so the LAPIC EOI can be
    /// deferred without masking the pin.
    IoApicLevel { move_aware: bool },
    Msi { maskable: bool },
    LapicEdge,
}

impl Controller {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Controller::None => "none",
            Controller::LegacyPic => "XT-PIC",
            Controller::IoApicEdge => "IO-APIC-edge",
            Controller::IoApicLevel { .. } => "IO-APIC-level",
            Controller::Msi { maskable: true } => "PCI-MSI/-X",
            Controller::Msi { maskable: false } => "PCI-MSI",
            Controller::LapicEdge => "local-APIC-edge",
        }
    }

    pub const fn ack_type(&self) -> AckType {
        match self {
            Controller::None
            | Controller::IoApicEdge
            | Controller::LapicEdge
            | Controller::Msi { maskable: false } => AckType::None,
            Controller::Msi { maskable: true } => AckType::Eoi,
            Controller::IoApicLevel { move_aware: true } => AckType::Eoi,
            Controller::IoApicLevel { move_aware: false } => AckType::Unmask,
            Controller::LegacyPic => AckType::Unmask,
        }
    }

    pub const fn has_set_affinity(&self) -> bool {
        matches!(
            self,
            Controller::IoApicEdge | Controller::IoApicLevel { .. } | Controller::Msi { .. }
        )
    }

    const fn maskable(&self) -> bool {
        !matches!(self, Controller::None | Controller::LapicEdge)
    }
}

impl core::fmt::Display for Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.type_name())
    }
}

// =============================================================================
// Controller operations
// =============================================================================

impl IrqManager {
    pub(crate) fn ctl_startup(&self, desc: &mut IrqDesc) {
        self.ctl_enable(desc);
    }

    pub(crate) fn ctl_shutdown(&self, desc: &mut IrqDesc) {
        self.ctl_disable(desc);
    }

    pub(crate) fn ctl_enable(&self, desc: &IrqDesc) {
        if desc.controller.maskable() {
            self.platform.source_mask(desc.irq, desc.controller, false);
        }
    }

    pub(crate) fn ctl_disable(&self, desc: &IrqDesc) {
        if desc.controller.maskable() {
            self.platform.source_mask(desc.irq, desc.controller, true);
        }
    }

    /// First thing done with a delivery, under the descriptor lock.
    pub(crate) fn ctl_ack(&self, cpu: CpuId, desc: &mut IrqDesc, vector: Vector) {
        let irq = desc.irq;
        let ctl = desc.controller;
        match ctl {
            Controller::None => {}
            Controller::LegacyPic => {
                self.platform.source_mask(irq, ctl, true);
                self.platform.pic_eoi(irq);
            }
            Controller::LapicEdge => self.platform.lapic_eoi(cpu),
            Controller::IoApicEdge => {
                self.irq_complete_move(cpu, desc, vector);
                self.move_native_irq(desc);
                self.platform.lapic_eoi(cpu);
            }
            Controller::IoApicLevel { move_aware: false } => {
                self.platform.source_mask(irq, ctl, true);
                self.platform.lapic_eoi(cpu);
                self.irq_complete_move(cpu, desc, vector);
                self.move_native_irq(desc);
            }
            Controller::IoApicLevel { move_aware: true } | Controller::Msi { .. } => {
                // LAPIC EOI is issued from `end`, possibly deferred.
                self.irq_complete_move(cpu, desc, vector);
                self.move_native_irq(desc);
            }
        }
    }

    /// Completion hook. `vector` is the delivered vector when the caller has
    /// one; `cpu` is the CPU whose local APIC is owed the EOI.
    pub(crate) fn ctl_end(&self, cpu: Option<CpuId>, desc: &mut IrqDesc, vector: Option<Vector>) {
        let irq = desc.irq;
        let ctl = desc.controller;
        match ctl {
            Controller::LegacyPic | Controller::IoApicLevel { move_aware: false } => {
                if !desc.status.contains(IrqStatus::DISABLED) {
                    self.platform.source_mask(irq, ctl, false);
                }
            }
            Controller::IoApicLevel { move_aware: true } | Controller::Msi { .. } => {
                if let (Some(cpu), Some(vector)) = (cpu, vector) {
                    self.end_lapic_eoi(cpu, irq, vector);
                }
            }
            Controller::None | Controller::IoApicEdge | Controller::LapicEdge => {}
        }
    }

    /// Issue the LAPIC EOI for `vector`, unless higher vectors are still
    /// owed on this CPU: then slot it into the EOI stack beneath them.
    fn end_lapic_eoi(&self, cpu: CpuId, irq: Irq, vector: Vector) {
        let mut pcpu = self.percpu[cpu].lock();
        let defer = pcpu.check_eoi_deferral
            && pcpu
                .pending_eoi
                .top()
                .is_some_and(|top| top.vector > vector);
        if defer {
            pcpu.pending_eoi.insert_deferred(irq, vector);
        } else {
            drop(pcpu);
            self.platform.lapic_eoi(cpu);
        }
    }

    /// Retarget `desc` at `mask` now and reprogram the source.
    pub(crate) fn ctl_set_affinity(&self, desc: &mut IrqDesc, mask: &CpuMask) -> IrqResult<()> {
        if !desc.controller.has_set_affinity() {
            return Err(Errno::EINVAL);
        }
        let dest = self.set_desc_affinity(desc, mask)?;
        let vector = desc.arch.vector.ok_or(Errno::EINVAL)?;
        match desc.controller {
            Controller::Msi { .. } => {
                if let Some(msi) = &desc.msi {
                    self.platform.msi_write_msg(msi, vector, &dest);
                }
            }
            ctl => self.platform.source_route(desc.irq, ctl, vector, &dest),
        }
        Ok(())
    }
}
