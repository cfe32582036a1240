//! The interrupt manager: descriptor store, per-CPU state and the IRQ
//! lifecycle entry points.
//!
//! Lock order, outermost first:
//!
//! 1. domain interrupt table (held by the caller of PIRQ operations)
//! 2. one descriptor lock
//! 3. the vector lock, per-CPU state, timer registries
//!
//! Nothing takes a descriptor lock while holding anything from level 3.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hvirq_abi::{
    CALL_FUNCTION_VECTOR, CpuId, EVENT_CHECK_VECTOR, Errno, HYPERCALL_VECTOR, IRQ_MOVE_CLEANUP_VECTOR,
    Irq, IrqResult, LEGACY_SYSCALL_VECTOR, NR_LEGACY_IRQS, NR_VECTORS, Vector, legacy_vector,
};
use hvirq_lib::{CpuMask, klog_debug, klog_info};
use spin::{Mutex, RwLock};

use crate::config::{IrqConfig, VectorMapPolicy};
use crate::controller::Controller;
use crate::desc::{HandlerAction, IrqAction, IrqDesc, IrqHandler, IrqStatus, IrqUse, UsedVectors};
use crate::dispatch::{CpuMessage, DirectHandler};
use crate::eoi::{EoiStack, PendingEoi};
use crate::platform::Platform;
use crate::ratelimit::RateLimitList;
use crate::vector::{VectorBitmap, VectorSlot, VectorState};

/// IRQ2 is the PIC cascade and never raises.
const PIC_CASCADE_IRQ: Irq = 2;

pub(crate) struct PerCpu {
    pub pending_eoi: EoiStack,
    /// Set while `end` runs from the dispatcher so a mid-stack EOI is deferred.
    pub check_eoi_deferral: bool,
    pub inbox: Vec<CpuMessage>,
    pub irq_count: u64,
}

impl PerCpu {
    fn new() -> Self {
        Self {
            pending_eoi: EoiStack::new(),
            check_eoi_deferral: false,
            inbox: Vec::new(),
            irq_count: 0,
        }
    }
}

pub struct IrqManager {
    pub(crate) config: IrqConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) descs: Vec<Mutex<IrqDesc>>,
    pub(crate) vectors: Mutex<VectorState>,
    pub(crate) percpu: Vec<Mutex<PerCpu>>,
    pub(crate) online: RwLock<CpuMask>,
    pub(crate) direct: RwLock<Vec<Option<DirectHandler>>>,
    pub(crate) ratelimit: Mutex<RateLimitList>,
    pub(crate) eoi_timers: Mutex<BTreeSet<Irq>>,
    pub(crate) spurious_reported: Mutex<VectorBitmap>,
}

impl IrqManager {
    /// Build the descriptor store and bring up the legacy PIC lines on CPU 0.
    ///
    /// Every CPU in `0..config.nr_cpus` starts online.
    pub fn new(mut config: IrqConfig, platform: Arc<dyn Platform>) -> Self {
        config.sanitize();
        let online = CpuMask::first_n(config.nr_cpus);

        let descs = (0..config.nr_irqs)
            .map(|irq| Mutex::new(IrqDesc::new(irq, online)))
            .collect();
        let percpu = (0..config.nr_cpus).map(|_| Mutex::new(PerCpu::new())).collect();

        let mut vectors = VectorState::new(config.nr_cpus, config.grouping);
        vectors.reserve(IRQ_MOVE_CLEANUP_VECTOR);
        vectors.reserve(LEGACY_SYSCALL_VECTOR);
        vectors.reserve(HYPERCALL_VECTOR);

        let mut direct = Vec::with_capacity(NR_VECTORS);
        direct.resize_with(NR_VECTORS, || None);
        direct[IRQ_MOVE_CLEANUP_VECTOR as usize] = Some(DirectHandler::MoveCleanup);
        direct[CALL_FUNCTION_VECTOR as usize] = Some(DirectHandler::CallFunction);
        direct[EVENT_CHECK_VECTOR as usize] = Some(DirectHandler::EventCheck);

        let mgr = Self {
            config,
            platform,
            descs,
            vectors: Mutex::new(vectors),
            percpu,
            online: RwLock::new(online),
            direct: RwLock::new(direct),
            ratelimit: Mutex::new(RateLimitList::new()),
            eoi_timers: Mutex::new(BTreeSet::new()),
            spurious_reported: Mutex::new(VectorBitmap::new()),
        };
        mgr.init_legacy_irqs();
        klog_info!(
            "IRQ: {} irqs ({} GSI), {} cpus, max {} guests/irq, vector map {}",
            mgr.config.nr_irqs,
            mgr.config.nr_irqs_gsi,
            mgr.config.nr_cpus,
            mgr.config.irq_max_guests,
            mgr.config.vector_map
        );
        mgr
    }

    fn init_legacy_irqs(&self) {
        for irq in 0..NR_LEGACY_IRQS {
            if irq == PIC_CASCADE_IRQ {
                continue;
            }
            let vector = legacy_vector(irq);
            let mut desc = self.descs[irq as usize].lock();
            desc.controller = Controller::LegacyPic;
            desc.arch.vector = Some(vector);
            desc.arch.cpu_mask = CpuMask::of(0);
            desc.arch.used = IrqUse::Used;
            desc.affinity = CpuMask::of(0);
            self.vectors.lock().set_slot(0, vector, VectorSlot::Owned(irq));
        }
    }

    pub fn config(&self) -> &IrqConfig {
        &self.config
    }

    pub fn nr_irqs(&self) -> u32 {
        self.config.nr_irqs
    }

    pub fn nr_irqs_gsi(&self) -> u32 {
        self.config.nr_irqs_gsi
    }

    pub(crate) fn desc_lock(&self, irq: Irq) -> IrqResult<&Mutex<IrqDesc>> {
        self.descs.get(irq as usize).ok_or(Errno::EINVAL)
    }

    pub fn online_mask(&self) -> CpuMask {
        *self.online.read()
    }

    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.online.read().test(cpu)
    }

    /// Scope new vectors of `irq` are drawn under, absent a per-device one.
    fn default_vector_scope(&self) -> Option<UsedVectors> {
        match self.config.vector_map {
            VectorMapPolicy::Global => Some(UsedVectors::Global),
            VectorMapPolicy::None | VectorMapPolicy::PerDevice => None,
        }
    }

    // -------------------------------------------------------------------------
    // Dynamic IRQs
    // -------------------------------------------------------------------------

    /// Claim an unused IRQ above the GSI range, optionally with a vector on
    /// any online CPU.
    pub fn create_irq(&self, alloc_vector: bool) -> IrqResult<Irq> {
        let mut claimed = None;
        for irq in self.config.nr_irqs_gsi..self.config.nr_irqs {
            let mut desc = self.descs[irq as usize].lock();
            if desc.arch.used == IrqUse::Unused {
                desc.arch.used = IrqUse::Reserved;
                claimed = Some(irq);
                break;
            }
        }
        let Some(irq) = claimed else {
            klog_info!("IRQ: no free dynamic irq");
            return Err(Errno::ENOSPC);
        };

        let online = self.online_mask();
        let mut desc = self.descs[irq as usize].lock();
        desc.status = IrqStatus::DISABLED;
        desc.controller = Controller::None;
        desc.action = None;
        desc.msi = None;
        desc.affinity = online;
        desc.arch.used_vectors = self.default_vector_scope();
        if alloc_vector
            && let Err(e) = self.vectors.lock().assign(&mut desc, &online, &online)
        {
            desc.arch.used_vectors = None;
            desc.arch.used = IrqUse::Unused;
            return Err(e);
        }
        desc.arch.used = IrqUse::Used;
        klog_debug!("IRQ: created irq {} vector {:?}", irq, desc.arch.vector);
        Ok(irq)
    }

    /// Return a dynamic IRQ to the pool. Its vectors are marked stale.
    pub fn destroy_irq(&self, irq: Irq) -> IrqResult<()> {
        if irq < self.config.nr_irqs_gsi {
            return Err(Errno::EINVAL);
        }
        let lock = self.desc_lock(irq)?;
        let online = self.online_mask();
        let mut desc = lock.lock();
        if desc.arch.used == IrqUse::Unused {
            return Err(Errno::EINVAL);
        }
        if desc.is_guest() {
            return Err(Errno::EBUSY);
        }
        self.ctl_shutdown(&mut desc);
        desc.controller = Controller::None;
        desc.action = None;
        desc.msi = None;
        desc.status = IrqStatus::DISABLED;
        {
            let mut vs = self.vectors.lock();
            vs.clear(&mut desc, &online);
        }
        desc.arch.used_vectors = None;
        desc.arch.pending_mask.clear_all();
        desc.arch.used = IrqUse::Unused;
        klog_debug!("IRQ: destroyed irq {}", irq);
        Ok(())
    }

    /// Put a GSI line under an IO-APIC controller, assign it a vector and
    /// program the pin.
    pub fn setup_gsi(&self, irq: Irq, controller: Controller) -> IrqResult<Vector> {
        if irq >= self.config.nr_irqs_gsi {
            return Err(Errno::EINVAL);
        }
        if !matches!(
            controller,
            Controller::IoApicEdge | Controller::IoApicLevel { .. }
        ) {
            return Err(Errno::EINVAL);
        }
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();
        if desc.action.is_some() {
            return Err(Errno::EBUSY);
        }
        desc.controller = controller;
        desc.arch.used = IrqUse::Used;
        if desc.arch.used_vectors.is_none() {
            desc.arch.used_vectors = self.default_vector_scope();
        }
        let mask = if desc.affinity.is_empty() {
            self.online_mask()
        } else {
            desc.affinity
        };
        self.ctl_set_affinity(&mut desc, &mask)?;
        self.ctl_disable(&desc);
        desc.arch.vector.ok_or(Errno::EINVAL)
    }

    // -------------------------------------------------------------------------
    // Native handlers
    // -------------------------------------------------------------------------

    pub fn request_irq(&self, irq: Irq, name: &'static str, handler: IrqHandler) -> IrqResult<()> {
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();
        if desc.action.is_some() {
            return Err(Errno::EBUSY);
        }
        if desc.controller == Controller::None || desc.arch.vector.is_none() {
            return Err(Errno::EINVAL);
        }
        desc.action = Some(IrqAction::Handler(HandlerAction { name, handler }));
        desc.status
            .remove(IrqStatus::DISABLED | IrqStatus::INPROGRESS | IrqStatus::PENDING);
        self.ctl_startup(&mut desc);
        Ok(())
    }

    pub fn release_irq(&self, irq: Irq) -> IrqResult<()> {
        let lock = self.desc_lock(irq)?;
        let mut desc = lock.lock();
        if desc.handler().is_none() {
            return Err(Errno::EINVAL);
        }
        desc.status.insert(IrqStatus::DISABLED);
        self.ctl_shutdown(&mut desc);
        desc.action = None;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Run `f` on a descriptor under its lock.
    pub fn with_desc<R>(&self, irq: Irq, f: impl FnOnce(&IrqDesc) -> R) -> IrqResult<R> {
        let lock = self.desc_lock(irq)?;
        let desc = lock.lock();
        Ok(f(&desc))
    }

    pub fn irq_affinity(&self, irq: Irq) -> IrqResult<CpuMask> {
        self.with_desc(irq, |d| d.affinity)
    }

    /// Live `(vector, cpus)` binding of an IRQ.
    pub fn irq_vector(&self, irq: Irq) -> IrqResult<Option<(Vector, CpuMask)>> {
        self.with_desc(irq, |d| d.arch.vector.map(|v| (v, d.arch.cpu_mask)))
    }

    pub fn vector_slot(&self, cpu: CpuId, vector: Vector) -> VectorSlot {
        self.vectors.lock().slot(cpu, vector)
    }

    /// Snapshot of a CPU's deferred-EOI stack, bottom first.
    pub fn pending_eoi(&self, cpu: CpuId) -> Vec<PendingEoi> {
        self.percpu
            .get(cpu)
            .map(|p| p.lock().pending_eoi.entries().to_vec())
            .unwrap_or_default()
    }

    pub fn irq_count(&self, cpu: CpuId) -> u64 {
        self.percpu.get(cpu).map_or(0, |p| p.lock().irq_count)
    }
}
