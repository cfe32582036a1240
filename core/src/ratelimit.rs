//! Storm throttling for guest-owned IRQs.
//!
//! Each descriptor counts deliveries per 10ms window. Past the configured
//! threshold the line is disabled and queued; a single global timer
//! re-enables everything queued one window later.

use alloc::vec::Vec;

use hvirq_abi::Irq;
use hvirq_lib::{klog_debug, klog_warn};

use crate::desc::{IrqDesc, IrqStatus};
use crate::manager::IrqManager;

pub const IRQ_RATELIMIT_WINDOW_NS: u64 = 10_000_000;

pub(crate) struct RateLimitList {
    pending: Vec<Irq>,
    /// When the re-enable timer fires; `None` while disarmed.
    pub deadline: Option<u64>,
}

impl RateLimitList {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            deadline: None,
        }
    }
}

impl IrqManager {
    /// Account one delivery. Returns `true` if the line was throttled and the
    /// delivery must not reach the guests.
    pub(crate) fn irq_ratelimit(&self, desc: &mut IrqDesc) -> bool {
        let threshold = self.config.ratelimit_threshold;
        if threshold == 0 {
            return false;
        }
        let now = self.platform.now_ns();
        let rl = &mut desc.ratelimit;
        if now >= rl.quantum_start + IRQ_RATELIMIT_WINDOW_NS {
            rl.quantum_start = now;
            rl.count = 0;
        }
        let count = rl.count;
        rl.count = rl.count.saturating_add(1);
        if count < threshold {
            return false;
        }

        self.ctl_disable(desc);
        desc.status.insert(IrqStatus::DISABLED);
        if !desc.ratelimit.queued {
            desc.ratelimit.queued = true;
            let mut list = self.ratelimit.lock();
            list.pending.push(desc.irq);
            if list.deadline.is_none() {
                list.deadline = Some(now + IRQ_RATELIMIT_WINDOW_NS);
            }
            klog_warn!(
                "IRQ: irq {} storming ({} in {}ms), throttled",
                desc.irq,
                threshold,
                IRQ_RATELIMIT_WINDOW_NS / 1_000_000
            );
        }
        true
    }

    /// Re-enable every throttled line that still has an owner.
    pub(crate) fn irq_ratelimit_timer_fn(&self) {
        let pending = {
            let mut list = self.ratelimit.lock();
            list.deadline = None;
            core::mem::take(&mut list.pending)
        };
        for irq in pending {
            let Ok(lock) = self.desc_lock(irq) else {
                continue;
            };
            let mut desc = lock.lock();
            desc.ratelimit.queued = false;
            desc.ratelimit.count = 0;
            if desc.action.is_none() {
                continue;
            }
            desc.status.remove(IrqStatus::DISABLED);
            self.ctl_enable(&desc);
            klog_debug!("IRQ: irq {} re-enabled after throttling", irq);
        }
    }

    /// IRQs currently held off by the ratelimiter.
    pub fn ratelimited_irqs(&self) -> Vec<Irq> {
        self.ratelimit.lock().pending.clone()
    }
}
