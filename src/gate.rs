//! Admission gate
//!
//! The [`Gate`] owns the registry and the lifecycle controller. Requests go
//! through [`Gate::evaluate`], which composes the live state of every requested
//! container into one [`Verdict`]. Idle timers report expiries over a channel
//! to a single consumer task that claims each one before freezing, so the
//! controller is never entered directly from a timer.

use crate::config::{Config, FreezeMethod, StartAction};
use crate::container::{Expired, ExpirySender, ManagedContainer};
use crate::error::{GateError, LifecycleError, RuntimeError};
use crate::lifecycle::Lifecycle;
use crate::registry::{DiscoveryDefaults, Inventory, RejectedContainer, Registry};
use crate::retry::RetryPolicy;
use crate::runtime::{Liveness, SharedRuntime};
use crate::timer::Phase;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Every requested container is online
    Admit,
    /// At least one container is being thawed; retry shortly
    Blocked,
    /// None of the requested names are managed
    NoSuchName,
    /// A requested container was rejected for unusable configuration
    InvalidConfig,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Admit => "admit",
            Verdict::Blocked => "blocked",
            Verdict::NoSuchName => "no-such-name",
            Verdict::InvalidConfig => "invalid-config",
        };
        f.write_str(s)
    }
}

/// Verdict plus the inspect failures met while reaching it
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub errors: Vec<LifecycleError>,
}

impl Decision {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            errors: Vec::new(),
        }
    }
}

/// Result of a successful reload
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Names now managed
    pub loaded: Vec<String>,
    /// Containers that opted in but could not be managed
    pub rejected: Vec<RejectedContainer>,
    /// Start-action failures; the containers stay managed
    pub errors: Vec<LifecycleError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub backing_id: String,
    pub freeze_method: FreezeMethod,
    pub idle_timeout_ms: u64,
    pub phase: Phase,
}

impl From<&ManagedContainer> for ContainerStatus {
    fn from(container: &ManagedContainer) -> Self {
        Self {
            name: container.name().to_string(),
            backing_id: container.backing_id().to_string(),
            freeze_method: container.freeze_method(),
            idle_timeout_ms: container.idle_timeout().as_millis() as u64,
            phase: container.phase(),
        }
    }
}

/// Snapshot of the registry for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub containers: Vec<ContainerStatus>,
    pub rejected: Vec<RejectedContainer>,
    pub count: usize,
}

pub struct Gate {
    registry: Registry,
    lifecycle: Lifecycle,
    discovery: DiscoveryDefaults,
    start_action: StartAction,
    expiry_tx: ExpirySender,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
    reload_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

impl Gate {
    /// Create a gate with an empty registry and start its expiry consumer.
    ///
    /// Must be called inside a tokio runtime. Call [`reload`](Self::reload)
    /// to populate the registry.
    pub fn new(runtime: SharedRuntime, config: &Config) -> Arc<Self> {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Self {
            registry: Registry::new(),
            lifecycle: Lifecycle::new(runtime, RetryPolicy::from(&config.runtime)),
            discovery: DiscoveryDefaults::new(&config.labels, &config.defaults),
            start_action: config.defaults.start_action,
            expiry_tx,
            expiry_task: Mutex::new(None),
            reload_lock: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
        });

        let task = tokio::spawn(expiry_loop(Arc::downgrade(&gate), expiry_rx));
        *gate.expiry_task.lock() = Some(task);
        gate
    }

    /// Rediscover containers and swap in the new registry.
    ///
    /// On a listing failure the current registry stays in place.
    pub async fn reload(&self) -> Result<LoadReport, GateError> {
        let _guard = self.reload_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GateError::Stopped);
        }

        let listing = self.lifecycle.list().await.map_err(|e| {
            error!(error = %e, "Container discovery failed, keeping current registry");
            GateError::Discovery(e)
        })?;

        let inventory = Inventory::discover(&listing, &self.discovery);
        let rejected = inventory.rejected();
        let previous = self.registry.replace(inventory);
        previous.retire_all();

        let current = self.registry.snapshot();
        let errors = self.apply_start_action(&current).await;

        info!(
            loaded = current.len(),
            rejected = rejected.len(),
            start_action = ?self.start_action,
            failed = errors.len(),
            "Registry reloaded"
        );

        Ok(LoadReport {
            loaded: current.names(),
            rejected,
            errors,
        })
    }

    async fn apply_start_action(&self, inventory: &Inventory) -> Vec<LifecycleError> {
        match self.start_action {
            StartAction::Run => {
                for container in inventory.containers() {
                    container.reset_timer(&self.expiry_tx);
                }
                Vec::new()
            }
            StartAction::Freeze => {
                let results = join_all(inventory.containers().map(|container| {
                    container.timer().disarm();
                    self.freeze_and_record(container)
                }))
                .await;
                results.into_iter().filter_map(Result::err).collect()
            }
        }
    }

    /// Freeze `container` and record the outcome on its timer.
    ///
    /// A transient failure re-arms the timer so the freeze is retried after
    /// another full window.
    async fn freeze_and_record(&self, container: &Arc<ManagedContainer>) -> Result<(), LifecycleError> {
        match self.lifecycle.freeze(container).await {
            Ok(()) => {
                container.timer().mark_frozen();
                Ok(())
            }
            Err(e) => {
                let transient = e.runtime_error().is_transient();
                error!(name = container.name(), error = %e, rearm = transient, "Freeze failed");
                if transient {
                    container.reset_timer(&self.expiry_tx);
                }
                Err(e)
            }
        }
    }

    /// Decide whether the named containers can take traffic.
    ///
    /// Offline containers are thawed in the background and the request is
    /// answered `Blocked` without waiting; the client polls for `Admit`.
    pub async fn evaluate<S: AsRef<str>>(self: &Arc<Self>, names: &[S]) -> Decision {
        let mut requested: Vec<&str> = Vec::new();
        for name in names.iter().map(|name| name.as_ref()) {
            if !name.is_empty() && !requested.contains(&name) {
                requested.push(name);
            }
        }
        if requested.is_empty() {
            return Decision::new(Verdict::NoSuchName);
        }

        let inventory = self.registry.snapshot();

        if let Some((name, reason)) = requested
            .iter()
            .find_map(|name| inventory.rejection(name).map(|reason| (*name, reason)))
        {
            warn!(name, reason, "Request names a container with invalid configuration");
            return Decision::new(Verdict::InvalidConfig);
        }

        let containers = inventory.find_by_names(&requested);
        if containers.is_empty() {
            warn!(names = ?requested, "No managed container matches the request");
            return Decision::new(Verdict::NoSuchName);
        }
        for name in requested.iter().filter(|name| inventory.get(name).is_none()) {
            warn!(name, "Ignoring unknown container name");
        }

        let observed = join_all(containers.iter().map(|c| self.lifecycle.liveness(c))).await;

        let mut errors = Vec::new();
        let mut offline: Vec<(&Arc<ManagedContainer>, Option<Liveness>)> = Vec::new();
        for (container, result) in containers.iter().zip(observed) {
            match result {
                Ok(liveness) if container.is_online(liveness) => {}
                Ok(liveness) => offline.push((container, Some(liveness))),
                Err(e) => {
                    warn!(name = container.name(), error = %e, "Inspect failed, treating container as offline");
                    errors.push(e);
                    offline.push((container, None));
                }
            }
        }

        // Every requested container gets a fresh window, online or not
        for container in &containers {
            container.reset_timer(&self.expiry_tx);
        }

        if offline.is_empty() {
            for container in &containers {
                container.timer().mark_thawed();
            }
            debug!(names = ?requested, "Admitted");
            return Decision {
                verdict: Verdict::Admit,
                errors,
            };
        }

        for &(container, observed) in &offline {
            if !container.begin_thaw() {
                debug!(name = container.name(), "Thaw already in flight");
                continue;
            }
            let gate = Arc::clone(self);
            let container = Arc::clone(container);
            tokio::spawn(async move {
                gate.thaw_and_record(&container, observed).await;
                container.end_thaw();
            });
        }

        debug!(names = ?requested, offline = offline.len(), "Blocked while thawing");
        Decision {
            verdict: Verdict::Blocked,
            errors,
        }
    }

    /// Thaw `container` and record the outcome on its timer.
    ///
    /// A timed-out call may still complete inside the runtime, so the
    /// countdown started by the request is kept; any other failure disarms it.
    async fn thaw_and_record(&self, container: &Arc<ManagedContainer>, observed: Option<Liveness>) {
        let result = match observed {
            Some(liveness) => self.lifecycle.resume(container, Some(liveness)).await,
            None => self.lifecycle.thaw(container).await,
        };

        match result {
            Ok(()) => container.timer().mark_thawed(),
            Err(e) if matches!(e.runtime_error(), RuntimeError::Timeout(_)) => {
                warn!(name = container.name(), error = %e, "Thaw timed out, keeping idle countdown");
            }
            Err(e) => {
                error!(name = container.name(), error = %e, "Thaw failed");
                container.timer().disarm();
            }
        }
    }

    pub fn find_by_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<ManagedContainer>> {
        self.registry.find_by_names(names)
    }

    pub fn status(&self) -> GateStatus {
        let inventory = self.registry.snapshot();
        let containers: Vec<ContainerStatus> = inventory
            .containers()
            .map(|c| ContainerStatus::from(c.as_ref()))
            .collect();
        GateStatus {
            count: containers.len(),
            containers,
            rejected: inventory.rejected(),
        }
    }

    /// Cancel every idle timer and stop consuming expiries.
    ///
    /// Containers are left in whatever state the runtime has them in.
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        self.stopped.store(true, Ordering::SeqCst);
        self.registry.snapshot().retire_all();
        if let Some(task) = self.expiry_task.lock().take() {
            task.abort();
        }
        info!("Idle timers cancelled");
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn expiry_loop(owner: Weak<Gate>, mut expiry_rx: mpsc::UnboundedReceiver<Expired>) {
    while let Some(event) = expiry_rx.recv().await {
        let Some(gate) = owner.upgrade() else {
            break;
        };
        let Some(container) = event.container.upgrade() else {
            continue;
        };
        if !container.timer().claim(event.generation) {
            debug!(name = container.name(), "Stale idle expiry ignored");
            continue;
        }

        info!(
            name = container.name(),
            idle_timeout_ms = container.idle_timeout().as_millis() as u64,
            "Container idle, freezing"
        );
        tokio::spawn(async move {
            let _ = gate.freeze_and_record(&container).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSummary, MemoryRuntime, RuntimeCall};
    use std::time::Duration;

    const RUNNING: Liveness = Liveness {
        running: true,
        paused: false,
    };
    const STOPPED: Liveness = Liveness {
        running: false,
        paused: false,
    };

    fn config(start_action: StartAction) -> Config {
        let mut config = Config::default();
        config.defaults.start_action = start_action;
        config.runtime.retry_base_delay = Duration::from_millis(1);
        config.runtime.retry_max_delay = Duration::from_millis(5);
        config.runtime.call_timeout = Duration::from_secs(1);
        config
    }

    fn opted_in(id: &str, name: &str) -> ContainerSummary {
        ContainerSummary::new(id, name).with_label("thawgate.enable", "true")
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_empty_or_blank_request_is_no_such_name() {
        let runtime = MemoryRuntime::new();
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();

        let none: [&str; 0] = [];
        assert_eq!(gate.evaluate(&none).await.verdict, Verdict::NoSuchName);
        assert_eq!(gate.evaluate(&[""]).await.verdict, Verdict::NoSuchName);
        assert_eq!(gate.evaluate(&["ghost"]).await.verdict, Verdict::NoSuchName);
    }

    #[tokio::test]
    async fn test_invalid_config_mutates_nothing() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), STOPPED);
        runtime.add(
            opted_in("b", "api").with_label("thawgate.idle-timeout", "forever"),
            STOPPED,
        );
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        let report = gate.reload().await.unwrap();
        assert_eq!(report.loaded, vec!["web".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        runtime.clear_calls();

        let decision = gate.evaluate(&["web", "api"]).await;
        assert_eq!(decision.verdict, Verdict::InvalidConfig);
        assert!(runtime.calls().is_empty());
        assert_eq!(runtime.liveness_of("a"), Some(STOPPED));
    }

    #[tokio::test]
    async fn test_repeated_names_are_handled_once() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), STOPPED);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();
        runtime.clear_calls();

        let decision = gate.evaluate(&["web", "web", "web"]).await;
        assert_eq!(decision.verdict, Verdict::Blocked);
        assert_eq!(runtime.count(&RuntimeCall::Inspect("a".into())), 1);
        assert!(eventually(|| runtime.count(&RuntimeCall::Start("a".into())) == 1).await);
    }

    #[tokio::test]
    async fn test_unknown_names_are_ignored_when_others_resolve() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();

        let decision = gate.evaluate(&["ghost", "web"]).await;
        assert_eq!(decision.verdict, Verdict::Admit);
        assert!(decision.errors.is_empty());
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_registry() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();

        for _ in 0..3 {
            runtime.fail_next(RuntimeCall::List, RuntimeError::Transport("socket closed".into()));
        }
        runtime.add(opted_in("b", "api"), RUNNING);

        let err = gate.reload().await.unwrap_err();
        assert!(matches!(err, GateError::Discovery(RuntimeError::Transport(_))));
        assert_eq!(gate.find_by_names(&["web"]).len(), 1);
        assert!(gate.find_by_names(&["api"]).is_empty());
        assert_eq!(gate.find_by_names(&["web"])[0].phase(), Phase::ActiveCounting);
    }

    #[tokio::test]
    async fn test_freeze_start_action_freezes_everything() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        runtime.add(
            opted_in("b", "api").with_label("thawgate.freeze-method", "pause"),
            RUNNING,
        );
        let gate = Gate::new(runtime.clone(), &config(StartAction::Freeze));

        let report = gate.reload().await.unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(runtime.liveness_of("a"), Some(STOPPED));
        assert!(runtime.liveness_of("b").unwrap().paused);

        let status = gate.status();
        assert_eq!(status.count, 2);
        assert!(status.containers.iter().all(|c| c.phase == Phase::Frozen));
    }

    #[tokio::test]
    async fn test_transient_freeze_failure_rearms_timer() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let mut config = config(StartAction::Freeze);
        config.runtime.retry_attempts = 1;
        let gate = Gate::new(runtime.clone(), &config);

        runtime.fail_next(
            RuntimeCall::Stop("a".into()),
            RuntimeError::Server {
                status: 503,
                message: "busy".into(),
            },
        );
        let report = gate.reload().await.unwrap();
        assert_eq!(report.errors.len(), 1);

        let web = gate.find_by_names(&["web"]).remove(0);
        assert_eq!(web.phase(), Phase::ActiveCounting);
        assert_eq!(runtime.liveness_of("a"), Some(RUNNING));
    }

    #[tokio::test]
    async fn test_missing_container_freeze_is_not_rearmed() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Freeze));

        runtime.fail_next(RuntimeCall::Stop("a".into()), RuntimeError::NotFound("a".into()));
        let report = gate.reload().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(gate.find_by_names(&["web"])[0].phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_failed_thaw_disarms_timer() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), STOPPED);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();

        runtime.fail_next(
            RuntimeCall::Start("a".into()),
            RuntimeError::Conflict {
                id: "a".into(),
                message: "removal in progress".into(),
            },
        );
        let decision = gate.evaluate(&["web"]).await;
        assert_eq!(decision.verdict, Verdict::Blocked);
        assert!(decision.errors.is_empty());

        let web = gate.find_by_names(&["web"]).remove(0);
        assert!(eventually(|| web.phase() == Phase::Idle && !web.is_thawing()).await);
        assert_eq!(runtime.liveness_of("a"), Some(STOPPED));
    }

    #[tokio::test]
    async fn test_blocked_reply_does_not_wait_for_thaw() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), STOPPED);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();
        runtime.delay(RuntimeCall::Start("a".into()), Duration::from_millis(300));

        let started = std::time::Instant::now();
        assert_eq!(gate.evaluate(&["web"]).await.verdict, Verdict::Blocked);
        assert!(started.elapsed() < Duration::from_millis(150));

        // A second request while the start is in flight doesn't issue another
        assert_eq!(gate.evaluate(&["web"]).await.verdict, Verdict::Blocked);
        assert!(started.elapsed() < Duration::from_millis(150));

        assert!(eventually(|| runtime.liveness_of("a") == Some(RUNNING)).await);
        assert_eq!(runtime.count(&RuntimeCall::Start("a".into())), 1);
        assert_eq!(gate.evaluate(&["web"]).await.verdict, Verdict::Admit);
    }

    #[tokio::test]
    async fn test_timed_out_thaw_keeps_countdown() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), STOPPED);
        let mut config = config(StartAction::Run);
        config.runtime.retry_attempts = 1;
        config.runtime.call_timeout = Duration::from_millis(50);
        let gate = Gate::new(runtime.clone(), &config);
        gate.reload().await.unwrap();
        runtime.delay(RuntimeCall::Start("a".into()), Duration::from_secs(5));

        let started = std::time::Instant::now();
        assert_eq!(gate.evaluate(&["web"]).await.verdict, Verdict::Blocked);
        assert!(started.elapsed() < Duration::from_millis(50));

        let web = gate.find_by_names(&["web"]).remove(0);
        assert!(web.is_thawing());
        assert!(eventually(|| !web.is_thawing()).await);
        assert_eq!(web.phase(), Phase::ActiveCounting);
    }

    #[tokio::test]
    async fn test_inspect_failure_counts_as_offline() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let mut config = config(StartAction::Run);
        config.runtime.retry_attempts = 1;
        let gate = Gate::new(runtime.clone(), &config);
        gate.reload().await.unwrap();

        runtime.fail_next(
            RuntimeCall::Inspect("a".into()),
            RuntimeError::Transport("reset by peer".into()),
        );
        let decision = gate.evaluate(&["web"]).await;
        assert_eq!(decision.verdict, Verdict::Blocked);
        assert!(matches!(decision.errors[0], LifecycleError::InspectFailed { .. }));

        // Next request sees it online
        assert_eq!(gate.evaluate(&["web"]).await.verdict, Verdict::Admit);
    }

    #[tokio::test]
    async fn test_reload_retires_dropped_containers() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();
        let old = gate.find_by_names(&["web"]).remove(0);
        assert!(old.timer().is_counting());

        runtime.remove("a");
        let report = gate.reload().await.unwrap();
        assert!(report.loaded.is_empty());
        assert!(old.timer().is_cancelled());
        assert!(!old.timer().is_counting());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_timers() {
        let runtime = MemoryRuntime::new();
        runtime.add(opted_in("a", "web"), RUNNING);
        let gate = Gate::new(runtime.clone(), &config(StartAction::Run));
        gate.reload().await.unwrap();

        gate.shutdown().await;
        let web = gate.find_by_names(&["web"]).remove(0);
        assert!(web.timer().is_cancelled());
        assert!(matches!(gate.reload().await, Err(GateError::Stopped)));
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Admit.to_string(), "admit");
        assert_eq!(Verdict::NoSuchName.to_string(), "no-such-name");
    }
}
