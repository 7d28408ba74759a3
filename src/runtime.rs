//! Container runtime control plane.
//!
//! The pool only needs three things from a runtime: start a named container
//! and report its private address, tear one down, and list containers by
//! name prefix. `DockerRuntime` implements them on top of the Docker Engine
//! API.

use crate::config::Mount;
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

/// Label attached to every session container.
pub const SESSION_LABEL: &str = "runner-pool.session";

/// CFS period paired with `ContainerSpec::cpu_quota`.
pub const CPU_PERIOD_US: i64 = 100_000;

/// Everything needed to start one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// Read-only bind mounts.
    pub mounts: Vec<Mount>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub network_mode: String,
    /// Port the sandbox service listens on inside the container.
    pub port: u16,
}

/// A started container and the address its sandbox service is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub address: SocketAddr,
}

/// A container as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning once it has an address.
    async fn start(&self, spec: &ContainerSpec) -> Result<RunningContainer, RuntimeError>;

    /// Stop (with a grace period) and force-remove a container.
    async fn stop_and_remove(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// List containers in any state whose name starts with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;
}

/// Docker Engine implementation of [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Connect {
            reason: e.to_string(),
        })?;
        Ok(Self { docker })
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| format!("{}:{}:ro", m.host.display(), m.container))
            .collect();

        HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some(spec.memory_bytes),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some(spec.cpu_quota),
            network_mode: Some(spec.network_mode.clone()),
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    async fn private_ip(&self, id: &str) -> Result<IpAddr, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error(id, e))?;

        let settings = inspect.network_settings.unwrap_or_default();
        let candidates = settings.ip_address.into_iter().chain(
            settings
                .networks
                .unwrap_or_default()
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address),
        );

        candidates
            .filter(|ip| !ip.is_empty())
            .find_map(|ip| ip.parse().ok())
            .ok_or_else(|| RuntimeError::NoAddress { id: id.to_string() })
    }
}

fn api_error(id: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound { id: id.to_string() },
        other => RuntimeError::Api {
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<RunningContainer, RuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| api_error(&spec.name, e))?;
        let id = created.id;
        debug!(container = %spec.name, id = %id, "Container created");

        let started = async {
            self.docker
                .start_container(&id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| api_error(&id, e))?;
            self.private_ip(&id).await
        }
        .await;

        match started {
            Ok(ip) => Ok(RunningContainer {
                id,
                name: spec.name.clone(),
                address: SocketAddr::new(ip, spec.port),
            }),
            Err(e) => {
                if let Err(cleanup) = self.stop_and_remove(&id, Duration::from_secs(1)).await {
                    warn!(
                        container = %spec.name,
                        error = %cleanup,
                        "Failed to remove half-started container"
                    );
                }
                Err(e)
            }
        }
    }

    async fn stop_and_remove(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let stop = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(stop)).await {
            Ok(()) => {}
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => {
                debug!(id = %id, error = %e, "Stop failed, forcing removal");
            }
        }

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| api_error(id, e))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Api {
                reason: e.to_string(),
            })?;

        // The engine's name filter matches substrings; keep true prefixes only.
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(ContainerInfo { id, name })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "cr-sess-abc".to_string(),
            image: "rpa4all/code-runner".to_string(),
            env: vec![("MAX_EXECUTION_TIME".to_string(), "30".to_string())],
            labels: HashMap::new(),
            mounts: vec![Mount {
                host: PathBuf::from("/srv/project"),
                container: "/project".to_string(),
            }],
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 50_000,
            network_mode: "bridge".to_string(),
            port: 5000,
        }
    }

    #[test]
    fn host_config_applies_limits_and_readonly_binds() {
        let host = DockerRuntime::host_config(&spec());
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_period, Some(CPU_PERIOD_US));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            host.binds,
            Some(vec!["/srv/project:/project:ro".to_string()])
        );
    }

    #[test]
    fn host_config_omits_empty_binds() {
        let mut spec = spec();
        spec.mounts.clear();
        assert!(DockerRuntime::host_config(&spec).binds.is_none());
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let err = api_error(
            "deadbeef",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }
}
