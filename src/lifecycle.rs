//! Freeze and thaw operations on top of the runtime adapter

use crate::config::FreezeMethod;
use crate::container::ManagedContainer;
use crate::error::{LifecycleError, RuntimeError};
use crate::retry::RetryPolicy;
use crate::runtime::{ContainerSummary, Liveness, SharedRuntime};
use tracing::{debug, info};

/// Drives containers between their frozen and online states
#[derive(Clone)]
pub struct Lifecycle {
    runtime: SharedRuntime,
    retry: RetryPolicy,
}

impl Lifecycle {
    pub fn new(runtime: SharedRuntime, retry: RetryPolicy) -> Self {
        Self { runtime, retry }
    }

    /// List every container the runtime knows about, stopped ones included
    pub async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.retry
            .run("list", "*", || self.runtime.list(true))
            .await
    }

    /// Current run state, straight from the runtime
    pub async fn liveness(&self, container: &ManagedContainer) -> Result<Liveness, LifecycleError> {
        let id = container.backing_id();
        self.retry
            .run("inspect", container.name(), || self.runtime.inspect(id))
            .await
            .map_err(|source| LifecycleError::InspectFailed {
                name: container.name().to_string(),
                source,
            })
    }

    /// Suspend the container with its freeze method.
    ///
    /// Freezing something already frozen succeeds.
    pub async fn freeze(&self, container: &ManagedContainer) -> Result<(), LifecycleError> {
        let id = container.backing_id();
        let name = container.name();

        let result = match container.freeze_method() {
            FreezeMethod::Stop => self.retry.run("stop", name, || self.runtime.stop(id)).await,
            FreezeMethod::Pause => {
                match self.retry.run("pause", name, || self.runtime.pause(id)).await {
                    Err(RuntimeError::Conflict { message, .. }) => {
                        debug!(name, message = %message, "Pause conflicted, treating as already frozen");
                        Ok(())
                    }
                    other => other,
                }
            }
        };

        result.map_err(|source| LifecycleError::FreezeFailed {
            name: name.to_string(),
            source,
        })?;
        info!(name, method = %container.freeze_method(), "Froze container");
        Ok(())
    }

    /// Bring the container back online, inspecting it first when the freeze
    /// method needs to know which way it was suspended
    pub async fn thaw(&self, container: &ManagedContainer) -> Result<(), LifecycleError> {
        let liveness = match container.freeze_method() {
            FreezeMethod::Stop => None,
            FreezeMethod::Pause => Some(self.liveness(container).await.map_err(|e| {
                LifecycleError::ThawFailed {
                    name: container.name().to_string(),
                    source: e.runtime_error().clone(),
                }
            })?),
        };
        self.resume(container, liveness).await
    }

    /// Thaw using a run state the caller already observed.
    ///
    /// A pause-method container that turns out to be stopped is started;
    /// a paused one is unpaused.
    pub async fn resume(
        &self,
        container: &ManagedContainer,
        observed: Option<Liveness>,
    ) -> Result<(), LifecycleError> {
        let id = container.backing_id();
        let name = container.name();

        let result = match (container.freeze_method(), observed) {
            (FreezeMethod::Pause, Some(live)) if live.running && !live.paused => Ok(()),
            (FreezeMethod::Pause, Some(live)) if live.paused => {
                match self.retry.run("unpause", name, || self.runtime.unpause(id)).await {
                    Err(RuntimeError::Conflict { message, .. }) => {
                        debug!(name, message = %message, "Unpause conflicted, treating as already running");
                        Ok(())
                    }
                    other => other,
                }
            }
            _ => self.retry.run("start", name, || self.runtime.start(id)).await,
        };

        result.map_err(|source| LifecycleError::ThawFailed {
            name: name.to_string(),
            source,
        })?;
        info!(name, method = %container.freeze_method(), "Thawed container");
        Ok(())
    }
}
