//! Hardware and collaborator seam.
//!
//! The interrupt subsystem never touches an APIC register, PCI config space or
//! a domain structure directly. Everything below the control plane is reached
//! through the [`Platform`] trait object handed to [`crate::IrqManager::new`],
//! registered once at boot by whoever owns the drivers.

use hvirq_abi::{CpuId, DomainId, Irq, IrqResult, Pirq, Vector};
use hvirq_lib::CpuMask;

use crate::controller::Controller;
use crate::msi::{MsiDesc, MsiInfo, Sbdf};

pub trait Platform: Send + Sync {
    // -- Time -------------------------------------------------------------

    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;

    // -- Local APIC -------------------------------------------------------

    fn lapic_eoi(&self, cpu: CpuId);

    /// In-Request bit for `vector` on `cpu`.
    fn lapic_irr_pending(&self, cpu: CpuId, vector: Vector) -> bool;

    /// In-Service bit for `vector` on `cpu`.
    fn lapic_isr_in_service(&self, cpu: CpuId, vector: Vector) -> bool;

    fn send_ipi(&self, cpu: CpuId, vector: Vector);

    // -- Interrupt sources ------------------------------------------------

    /// Mask or unmask the line at its source (PIC, IO-APIC pin, MSI vector).
    fn source_mask(&self, irq: Irq, controller: Controller, masked: bool);

    /// Program an IO-APIC redirection entry or PIC routing.
    fn source_route(&self, irq: Irq, controller: Controller, vector: Vector, dest: &CpuMask);

    /// Non-specific EOI to the 8259 owning `irq`.
    fn pic_eoi(&self, irq: Irq);

    // -- PCI / MSI --------------------------------------------------------

    /// Enable the MSI/MSI-X capability for a device about to be mapped.
    fn msi_enable(&self, info: &MsiInfo) -> IrqResult<()>;

    /// Per-vector setup (interrupt remapping entry etc.).
    fn msi_setup(&self, _desc: &MsiDesc) -> IrqResult<()> {
        Ok(())
    }

    fn msi_write_msg(&self, desc: &MsiDesc, vector: Vector, dest: &CpuMask);

    fn msi_disable(&self, sbdf: Sbdf);

    // -- Domains ----------------------------------------------------------

    /// Inject `pirq` into `domain`.
    fn send_guest_pirq(&self, domain: DomainId, pirq: Pirq);

    // -- Security gate ----------------------------------------------------

    fn security_map_irq(&self, _domain: DomainId, _irq: Irq) -> IrqResult<()> {
        Ok(())
    }

    fn security_unmap_irq(&self, _domain: DomainId, _irq: Irq) -> IrqResult<()> {
        Ok(())
    }
}
