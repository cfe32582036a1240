//! Recording [`Platform`] and manager builders shared by the scenario suites.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hvirq_abi::{CpuId, DomainId, Errno, Irq, IrqResult, Pirq, Vector};
use hvirq_lib::CpuMask;
use spin::Mutex;

use crate::config::IrqConfig;
use crate::controller::Controller;
use crate::desc::IrqHandler;
use crate::manager::IrqManager;
use crate::msi::{MsiDesc, MsiInfo, Sbdf};
use crate::platform::Platform;

pub const BOOT_NS: u64 = 1_000_000_000;

#[derive(Default)]
pub struct MockLog {
    pub lapic_eois: Vec<CpuId>,
    pub ipis: Vec<(CpuId, Vector)>,
    pub masks: Vec<(Irq, bool)>,
    pub pic_eois: Vec<Irq>,
    pub routes: Vec<(Irq, Vector, CpuMask)>,
    pub msi_enabled: Vec<Sbdf>,
    pub msi_msgs: Vec<(MsiDesc, Vector, CpuMask)>,
    pub msi_disabled: Vec<Sbdf>,
    pub notified: Vec<(DomainId, Pirq)>,
}

#[derive(Default)]
struct MockHw {
    irr: BTreeSet<(CpuId, Vector)>,
    isr: BTreeSet<(CpuId, Vector)>,
    fail_msi_setup_at: Option<u32>,
    denied_irqs: BTreeSet<Irq>,
}

pub struct MockPlatform {
    now: AtomicU64,
    log: Mutex<MockLog>,
    hw: Mutex<MockHw>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(BOOT_NS),
            log: Mutex::new(MockLog::default()),
            hw: Mutex::new(MockHw::default()),
        }
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn log(&self) -> spin::MutexGuard<'_, MockLog> {
        self.log.lock()
    }

    pub fn clear_log(&self) {
        *self.log.lock() = MockLog::default();
    }

    pub fn eoi_count(&self, cpu: CpuId) -> usize {
        self.log.lock().lapic_eois.iter().filter(|c| **c == cpu).count()
    }

    /// `(irq, masked)` calls recorded for `irq`, in order.
    pub fn mask_calls(&self, irq: Irq) -> Vec<bool> {
        self.log
            .lock()
            .masks
            .iter()
            .filter(|(i, _)| *i == irq)
            .map(|(_, m)| *m)
            .collect()
    }

    pub fn is_masked(&self, irq: Irq) -> Option<bool> {
        self.mask_calls(irq).last().copied()
    }

    pub fn notifications(&self, domain: DomainId) -> usize {
        self.log
            .lock()
            .notified
            .iter()
            .filter(|(d, _)| *d == domain)
            .count()
    }

    pub fn set_irr(&self, cpu: CpuId, vector: Vector, pending: bool) {
        let mut hw = self.hw.lock();
        if pending {
            hw.irr.insert((cpu, vector));
        } else {
            hw.irr.remove(&(cpu, vector));
        }
    }

    pub fn set_isr(&self, cpu: CpuId, vector: Vector, in_service: bool) {
        let mut hw = self.hw.lock();
        if in_service {
            hw.isr.insert((cpu, vector));
        } else {
            hw.isr.remove(&(cpu, vector));
        }
    }

    /// Make `msi_setup` fail for the block entry with this index.
    pub fn fail_msi_setup_at(&self, entry: Option<u32>) {
        self.hw.lock().fail_msi_setup_at = entry;
    }

    pub fn deny_irq(&self, irq: Irq) {
        self.hw.lock().denied_irqs.insert(irq);
    }
}

impl Platform for MockPlatform {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn lapic_eoi(&self, cpu: CpuId) {
        self.log.lock().lapic_eois.push(cpu);
    }

    fn lapic_irr_pending(&self, cpu: CpuId, vector: Vector) -> bool {
        self.hw.lock().irr.contains(&(cpu, vector))
    }

    fn lapic_isr_in_service(&self, cpu: CpuId, vector: Vector) -> bool {
        self.hw.lock().isr.contains(&(cpu, vector))
    }

    fn send_ipi(&self, cpu: CpuId, vector: Vector) {
        self.log.lock().ipis.push((cpu, vector));
    }

    fn source_mask(&self, irq: Irq, _controller: Controller, masked: bool) {
        self.log.lock().masks.push((irq, masked));
    }

    fn source_route(&self, irq: Irq, _controller: Controller, vector: Vector, dest: &CpuMask) {
        self.log.lock().routes.push((irq, vector, *dest));
    }

    fn pic_eoi(&self, irq: Irq) {
        self.log.lock().pic_eois.push(irq);
    }

    fn msi_enable(&self, info: &MsiInfo) -> IrqResult<()> {
        self.log.lock().msi_enabled.push(info.sbdf);
        Ok(())
    }

    fn msi_setup(&self, desc: &MsiDesc) -> IrqResult<()> {
        if self.hw.lock().fail_msi_setup_at == Some(desc.entry) {
            return Err(Errno::ENODEV);
        }
        Ok(())
    }

    fn msi_write_msg(&self, desc: &MsiDesc, vector: Vector, dest: &CpuMask) {
        self.log.lock().msi_msgs.push((*desc, vector, *dest));
    }

    fn msi_disable(&self, sbdf: Sbdf) {
        self.log.lock().msi_disabled.push(sbdf);
    }

    fn send_guest_pirq(&self, domain: DomainId, pirq: Pirq) {
        self.log.lock().notified.push((domain, pirq));
    }

    fn security_map_irq(&self, _domain: DomainId, irq: Irq) -> IrqResult<()> {
        if self.hw.lock().denied_irqs.contains(&irq) {
            return Err(Errno::EPERM);
        }
        Ok(())
    }
}

pub fn manager_with(config: IrqConfig) -> (Arc<MockPlatform>, IrqManager) {
    let platform = Arc::new(MockPlatform::new());
    let mgr = IrqManager::new(config, platform.clone());
    (platform, mgr)
}

pub fn manager() -> (Arc<MockPlatform>, IrqManager) {
    manager_with(IrqConfig::default())
}

/// A handler that counts its invocations.
pub fn counting_handler() -> (Arc<AtomicUsize>, IrqHandler) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handler: IrqHandler = Arc::new(move |_irq: Irq| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    (hits, handler)
}

pub fn mask_of(cpus: &[CpuId]) -> CpuMask {
    CpuMask::from_cpus(cpus)
}

/// Live vector of `irq`, panicking if it has none.
pub fn vector_of(mgr: &IrqManager, irq: Irq) -> Vector {
    match mgr.irq_vector(irq) {
        Ok(Some((vector, _))) => vector,
        other => panic!("irq {} has no vector: {:?}", irq, other.map(|v| v.map(|x| x.0))),
    }
}

/// Every owned slot must point at the descriptor's current or old binding.
pub fn assert_vector_tables_consistent(mgr: &IrqManager) {
    for cpu in 0..mgr.config().nr_cpus {
        if !mgr.is_cpu_online(cpu) {
            continue;
        }
        for vector in 0..=u8::MAX {
            let Some(irq) = mgr.vector_slot(cpu, vector).owner() else {
                continue;
            };
            let ok = mgr
                .with_desc(irq, |d| {
                    d.owns_vector_on(cpu, vector)
                        || (d.arch.old_vector == Some(vector) && d.arch.old_cpu_mask.test(cpu))
                })
                .unwrap_or(false);
            assert!(ok, "cpu {} vector {:#x} owned by irq {} without binding", cpu, vector, irq);
        }
    }
}
