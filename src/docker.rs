//! Docker Engine implementation of the container runtime adapter

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSummary, Liveness};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use tracing::debug;

/// Seconds bollard waits on the socket before giving up on a request
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Talks to a Docker daemon through bollard
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and make sure it answers.
    ///
    /// An explicit `docker_host` wins; otherwise `DOCKER_HOST` or the local
    /// default socket is used.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to the local Docker daemon: {}", e))?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Set DOCKER_HOST or runtime.docker_host if it listens elsewhere.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

/// Map a bollard failure onto the adapter's error taxonomy
fn map_error(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict {
            id: id.to_string(),
            message,
        },
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Server {
            status: status_code,
            message,
        },
        other => RuntimeError::Transport(other.to_string()),
    }
}

/// Docker answers 304 when the container is already in the requested state
fn is_not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error("*", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Liveness, RuntimeError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(id, e))?;

        let state = info.state.unwrap_or_default();
        Ok(Liveness {
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
        })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(container_id = id, "Started Docker container");
                Ok(())
            }
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        // No explicit timeout: the daemon applies the container's own stop grace period
        match self
            .client
            .stop_container(id, None::<StopContainerOptions>)
            .await
        {
            Ok(_) => {
                debug!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .pause_container(id)
            .await
            .map_err(|e| map_error(id, e))?;
        debug!(container_id = id, "Paused Docker container");
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .unpause_container(id)
            .await
            .map_err(|e| map_error(id, e))?;
        debug!(container_id = id, "Unpaused Docker container");
        Ok(())
    }
}
