//! Container runtime adapter
//!
//! The gate only needs six verbs from the runtime: list, inspect, start, stop,
//! pause and unpause. [`DockerRuntime`](crate::docker::DockerRuntime) talks to a
//! Docker daemon; [`MemoryRuntime`] keeps everything in process and records each
//! call, which is what the tests drive.

use crate::error::RuntimeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One entry of the runtime's container inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Runtime-assigned names, Docker style (`/web-1`)
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            names: vec![format!("/{}", name.into())],
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// First runtime name without its leading slash
    pub fn primary_name(&self) -> Option<&str> {
        self.names
            .iter()
            .map(|n| n.trim_start_matches('/'))
            .find(|n| !n.is_empty())
    }
}

/// Live run state of a container, never cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Liveness {
    pub running: bool,
    pub paused: bool,
}

/// Verbs the gate needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; `include_stopped` also returns exited ones
    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<Liveness, RuntimeError>;

    /// Start a container; starting a running one succeeds
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container gracefully; stopping a stopped one succeeds
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pause(&self, id: &str) -> Result<(), RuntimeError>;

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Shared handle used across the gate
pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// A call received by [`MemoryRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List,
    Inspect(String),
    Start(String),
    Stop(String),
    Pause(String),
    Unpause(String),
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    summary: ContainerSummary,
    liveness: Liveness,
}

#[derive(Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    calls: Vec<RuntimeCall>,
    failures: Vec<(RuntimeCall, RuntimeError)>,
    delays: Vec<(RuntimeCall, Duration)>,
}

/// In-process runtime that follows Docker's state rules
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a container in the given state
    pub fn add(&self, summary: ContainerSummary, liveness: Liveness) {
        let mut state = self.state.lock();
        state
            .containers
            .insert(summary.id.clone(), MemoryContainer { summary, liveness });
    }

    pub fn remove(&self, id: &str) {
        self.state.lock().containers.remove(id);
    }

    /// Hold every matching call for `delay` before it takes effect.
    ///
    /// A call abandoned during the delay is neither logged nor applied.
    pub fn delay(&self, call: RuntimeCall, delay: Duration) {
        self.state.lock().delays.push((call, delay));
    }

    pub fn liveness_of(&self, id: &str) -> Option<Liveness> {
        self.state.lock().containers.get(id).map(|c| c.liveness)
    }

    /// Make the next matching call fail with `error`
    pub fn fail_next(&self, call: RuntimeCall, error: RuntimeError) {
        self.state.lock().failures.push((call, error));
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &RuntimeCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Log the call, then hand out an injected failure if one matches
    fn record(state: &mut MemoryState, call: RuntimeCall) -> Result<(), RuntimeError> {
        state.calls.push(call.clone());
        match state.failures.iter().position(|(c, _)| *c == call) {
            Some(index) => Err(state.failures.remove(index).1),
            None => Ok(()),
        }
    }

    async fn stall(&self, call: &RuntimeCall) {
        let delay = self
            .state
            .lock()
            .delays
            .iter()
            .find(|(c, _)| c == call)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn transition<F>(&self, call: RuntimeCall, id: &str, apply: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut Liveness) -> Result<(), String>,
    {
        self.stall(&call).await;
        let mut state = self.state.lock();
        Self::record(&mut state, call)?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        apply(&mut container.liveness).map_err(|message| RuntimeError::Conflict {
            id: id.to_string(),
            message,
        })
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state.lock();
        Self::record(&mut state, RuntimeCall::List)?;
        Ok(state
            .containers
            .values()
            .filter(|c| include_stopped || c.liveness.running)
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Liveness, RuntimeError> {
        let call = RuntimeCall::Inspect(id.to_string());
        self.stall(&call).await;
        let mut state = self.state.lock();
        Self::record(&mut state, call)?;
        state
            .containers
            .get(id)
            .map(|c| c.liveness)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(RuntimeCall::Start(id.to_string()), id, |live| {
            if live.paused {
                return Err("cannot start a paused container, try unpause instead".into());
            }
            live.running = true;
            Ok(())
        })
        .await
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(RuntimeCall::Stop(id.to_string()), id, |live| {
            live.running = false;
            live.paused = false;
            Ok(())
        })
        .await
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(RuntimeCall::Pause(id.to_string()), id, |live| {
            if !live.running {
                return Err("container is not running".into());
            }
            if live.paused {
                return Err("container is already paused".into());
            }
            live.paused = true;
            Ok(())
        })
        .await
    }

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(RuntimeCall::Unpause(id.to_string()), id, |live| {
            if !live.paused {
                return Err("container is not paused".into());
            }
            live.paused = false;
            Ok(())
        })
        .await
    }
}
