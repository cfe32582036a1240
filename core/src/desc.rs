//! IRQ descriptors.
//!
//! One [`IrqDesc`] per physical line, each behind its own spinlock in the
//! manager's descriptor store. Vector fields are only mutated with the global
//! vector lock held as well (always taken *inside* the descriptor lock).

use alloc::sync::Arc;

use bitflags::bitflags;
use hvirq_abi::{CpuId, Irq, Vector};
use hvirq_lib::CpuMask;

use crate::controller::Controller;
use crate::guest::GuestAction;
use crate::msi::{MsiDesc, Sbdf};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqStatus: u32 {
        const DISABLED = 1 << 0;
        /// Raised again while the handler was running.
        const PENDING = 1 << 1;
        const INPROGRESS = 1 << 2;
        /// Owned by the guest multiplexer.
        const GUEST = 1 << 3;
        /// Affinity change waiting for the next acknowledgement.
        const MOVE_PENDING = 1 << 4;
    }
}

/// Allocation state of the descriptor itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqUse {
    Unused,
    /// Claimed by `create_irq`, not yet live.
    Reserved,
    Used,
}

/// Bitmap scope an IRQ's vector must be unique within.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsedVectors {
    Global,
    Device(Sbdf),
}

/// Native handler callback. Runs with the descriptor lock dropped.
pub type IrqHandler = Arc<dyn Fn(Irq) + Send + Sync>;

#[derive(Clone)]
pub struct HandlerAction {
    pub name: &'static str,
    pub handler: IrqHandler,
}

pub enum IrqAction {
    Handler(HandlerAction),
    Guest(GuestAction),
}

/// Vector bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct ArchIrq {
    pub vector: Option<Vector>,
    pub cpu_mask: CpuMask,
    /// Valid only while `move_in_progress` or `move_cleanup_count > 0`.
    pub old_vector: Option<Vector>,
    pub old_cpu_mask: CpuMask,
    pub pending_mask: CpuMask,
    pub move_in_progress: bool,
    pub move_cleanup_count: u32,
    pub used: IrqUse,
    pub used_vectors: Option<UsedVectors>,
}

impl ArchIrq {
    pub const fn new() -> Self {
        Self {
            vector: None,
            cpu_mask: CpuMask::new(),
            old_vector: None,
            old_cpu_mask: CpuMask::new(),
            pending_mask: CpuMask::new(),
            move_in_progress: false,
            move_cleanup_count: 0,
            used: IrqUse::Unused,
            used_vectors: None,
        }
    }

    /// Migration state machine position.
    pub fn move_state(&self) -> MoveState {
        if self.move_in_progress {
            MoveState::MoveInProgress
        } else if self.move_cleanup_count > 0 {
            MoveState::CleanupPending
        } else {
            MoveState::Stable
        }
    }
}

impl Default for ArchIrq {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveState {
    Stable,
    MoveInProgress,
    CleanupPending,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RateLimit {
    pub quantum_start: u64,
    pub count: u32,
    pub queued: bool,
}

pub struct IrqDesc {
    pub irq: Irq,
    pub status: IrqStatus,
    pub controller: Controller,
    pub action: Option<IrqAction>,
    pub arch: ArchIrq,
    /// Requested affinity; the live vector's CPUs are `arch.cpu_mask`.
    pub affinity: CpuMask,
    pub msi: Option<MsiDesc>,
    pub(crate) ratelimit: RateLimit,
    /// Deliveries, for diagnostics.
    pub count: u64,
}

impl IrqDesc {
    pub(crate) fn new(irq: Irq, affinity: CpuMask) -> Self {
        Self {
            irq,
            status: IrqStatus::DISABLED,
            controller: Controller::None,
            action: None,
            arch: ArchIrq::new(),
            affinity,
            msi: None,
            ratelimit: RateLimit::default(),
            count: 0,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.status.contains(IrqStatus::GUEST)
    }

    pub fn guest_action(&self) -> Option<&GuestAction> {
        match &self.action {
            Some(IrqAction::Guest(action)) => Some(action),
            _ => None,
        }
    }

    pub fn guest_action_mut(&mut self) -> Option<&mut GuestAction> {
        match &mut self.action {
            Some(IrqAction::Guest(action)) => Some(action),
            _ => None,
        }
    }

    pub fn handler(&self) -> Option<&HandlerAction> {
        match &self.action {
            Some(IrqAction::Handler(h)) => Some(h),
            _ => None,
        }
    }

    /// Whether `vector` on `cpu` is the live binding of this descriptor.
    pub fn owns_vector_on(&self, cpu: CpuId, vector: Vector) -> bool {
        self.arch.vector == Some(vector) && self.arch.cpu_mask.test(cpu)
    }
}
