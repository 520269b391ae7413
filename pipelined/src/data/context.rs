use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-process controller state.  The epoch is fixed once at startup; a setup request
/// carrying any other epoch comes from a controller generation that has been superseded.
#[derive(Default)]
pub struct ControllerContext {
    epoch: OnceLock<u64>,
    policy_setup_done: AtomicBool,
    ue_mac_setup_done: AtomicBool,
    quota_setup_done: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupKind {
    Policy,
    UeMac,
    Quota,
}

impl ControllerContext {
    pub fn new(epoch: u64) -> Self {
        let context = ControllerContext::default();
        let _ = context.epoch.set(epoch);
        context
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.get().copied().unwrap_or_default()
    }

    pub fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch.get() == Some(&epoch)
    }

    fn flag(&self, kind: SetupKind) -> &AtomicBool {
        match kind {
            SetupKind::Policy => &self.policy_setup_done,
            SetupKind::UeMac => &self.ue_mac_setup_done,
            SetupKind::Quota => &self.quota_setup_done,
        }
    }

    pub fn mark_setup_done(&self, kind: SetupKind) {
        self.flag(kind).store(true, Ordering::SeqCst);
    }

    pub fn is_setup_done(&self, kind: SetupKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    /// A datapath reconnect requires the controllers to replay their state.
    pub fn reset_setup(&self) {
        for kind in [SetupKind::Policy, SetupKind::UeMac, SetupKind::Quota] {
            self.flag(kind).store(false, Ordering::SeqCst);
        }
    }
}
