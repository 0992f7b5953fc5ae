//! Managed container records

use crate::config::FreezeMethod;
use crate::runtime::Liveness;
use crate::timer::{IdleTimer, Phase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Resolved settings of one opted-in container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub backing_id: String,
    pub freeze_method: FreezeMethod,
    pub idle_timeout: Duration,
}

/// Sent by an idle timer when its countdown elapses
#[derive(Debug)]
pub struct Expired {
    pub container: Weak<ManagedContainer>,
    pub generation: u64,
}

pub type ExpirySender = mpsc::UnboundedSender<Expired>;

/// One opted-in container and its idle timer
pub struct ManagedContainer {
    spec: ContainerSpec,
    timer: IdleTimer,
    thawing: AtomicBool,
}

impl ManagedContainer {
    pub fn new(spec: ContainerSpec) -> Arc<Self> {
        let timer = IdleTimer::new(spec.idle_timeout);
        Arc::new(Self {
            spec,
            timer,
            thawing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn backing_id(&self) -> &str {
        &self.spec.backing_id
    }

    pub fn freeze_method(&self) -> FreezeMethod {
        self.spec.freeze_method
    }

    pub fn idle_timeout(&self) -> Duration {
        self.spec.idle_timeout
    }

    pub fn timer(&self) -> &IdleTimer {
        &self.timer
    }

    pub fn phase(&self) -> Phase {
        self.timer.phase()
    }

    /// Whether a client can use the container right now
    pub fn is_online(&self, liveness: Liveness) -> bool {
        self.spec.freeze_method.is_online(liveness)
    }

    /// Restart the idle countdown; the expiry is delivered on `expiry_tx`
    pub fn reset_timer(self: &Arc<Self>, expiry_tx: &ExpirySender) -> bool {
        let container = Arc::downgrade(self);
        let tx = expiry_tx.clone();
        self.timer.reset(move |generation| {
            let _ = tx.send(Expired {
                container,
                generation,
            });
        })
    }

    /// Mark a thaw as in flight. False if one already is.
    pub fn begin_thaw(&self) -> bool {
        self.thawing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_thaw(&self) {
        self.thawing.store(false, Ordering::Release);
    }

    pub fn is_thawing(&self) -> bool {
        self.thawing.load(Ordering::Acquire)
    }

    /// Drop out of service: no countdown now or later
    pub fn retire(&self) {
        self.timer.cancel();
    }
}

impl std::fmt::Debug for ManagedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedContainer")
            .field("spec", &self.spec)
            .field("phase", &self.phase())
            .finish()
    }
}

impl FreezeMethod {
    /// Stop: online iff running. Pause: online iff running and not paused.
    pub fn is_online(&self, liveness: Liveness) -> bool {
        match self {
            FreezeMethod::Stop => liveness.running,
            FreezeMethod::Pause => liveness.running && !liveness.paused,
        }
    }
}
