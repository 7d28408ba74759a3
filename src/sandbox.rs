//! Sandbox lifecycle: creation with health polling, teardown, stale purge,
//! and the HTTP client used to talk to a running sandbox.

use crate::config::{Mount, SandboxConfig};
use crate::error::{RuntimeError, SandboxError};
use crate::runtime::{ContainerRuntime, ContainerSpec, RunningContainer, SESSION_LABEL};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Grace period given to a sandbox before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
const PURGE_GRACE: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const SANDBOX_ENV: [(&str, &str); 3] = [
    ("MAX_MEMORY_MB", "256"),
    ("MAX_OUTPUT_SIZE", "65536"),
    ("MAX_EXECUTION_TIME", "30"),
];

/// A live sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub container_id: String,
    pub name: String,
    pub address: SocketAddr,
}

impl From<RunningContainer> for Sandbox {
    fn from(c: RunningContainer) -> Self {
        Self {
            container_id: c.id,
            name: c.name,
            address: c.address,
        }
    }
}

/// One source file of an execute payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    #[serde(default)]
    pub content: String,
}

/// Payload sent to the sandbox execute endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub language: String,
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub stdin: String,
}

/// Output of one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub code: i32,
    #[serde(default)]
    pub signal: Option<String>,
}

impl RunResult {
    /// A failed run carrying only an error message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            code: 1,
            signal: None,
        }
    }
}

/// Response from the sandbox execute endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub run: RunResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// HTTP client for sandbox liveness probes and proxied execution.
#[derive(Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    proxy_timeout: Duration,
}

impl SandboxClient {
    pub fn new(proxy_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            proxy_timeout,
        }
    }

    /// One liveness probe; any error counts as not ready.
    pub async fn is_healthy(&self, address: SocketAddr) -> bool {
        match self
            .http
            .get(format!("http://{}/health", address))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Forward an execute request and decode the sandbox's answer.
    pub async fn execute(
        &self,
        address: SocketAddr,
        request: &SandboxRequest,
    ) -> Result<SandboxResponse, SandboxError> {
        let resp = self
            .http
            .post(format!("http://{}/api/v2/execute", address))
            .timeout(self.proxy_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| SandboxError::Proxy {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SandboxError::Status {
                status: status.as_u16(),
            });
        }

        resp.json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Proxy {
                reason: format!("undecodable response: {}", e),
            })
    }
}

/// Deterministic container name for a session.
///
/// Keeps a readable slice of the id for operators and appends a hash so ids
/// sharing a prefix still map to distinct names.
pub fn container_name(prefix: &str, session_id: &str) -> String {
    let readable: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(12)
        .collect::<String>()
        .to_ascii_lowercase();
    let digest = hex::encode(Sha256::digest(session_id.as_bytes()));
    if readable.is_empty() {
        format!("{}{}", prefix, &digest[..8])
    } else {
        format!("{}{}-{}", prefix, readable, &digest[..8])
    }
}

/// Memory ceiling in bytes, saturating at the largest value the runtime accepts.
fn memory_bytes(limit_mb: u64) -> i64 {
    i64::try_from(limit_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

/// Creates, probes and destroys sandbox containers.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    client: SandboxClient,
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            client: SandboxClient::new(config.proxy_timeout),
            config,
        }
    }

    pub fn client(&self) -> &SandboxClient {
        &self.client
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn spec_for(&self, session_id: &str) -> ContainerSpec {
        let mut mounts = Vec::new();
        if let Some(ref project) = self.config.project_mount {
            mounts.push(Mount {
                host: project.clone(),
                container: "/project".to_string(),
            });
        }
        mounts.extend(self.config.extra_mounts.iter().cloned());

        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());

        ContainerSpec {
            name: container_name(&self.config.container_prefix, session_id),
            image: self.config.image.clone(),
            env: SANDBOX_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            labels,
            mounts,
            memory_bytes: memory_bytes(self.config.memory_limit_mb),
            cpu_quota: self.config.cpu_quota,
            network_mode: self.config.network_mode.clone(),
            port: self.config.sandbox_port,
        }
    }

    /// Start a sandbox for `session_id` and wait until it answers its
    /// liveness probe. An unhealthy container is removed before returning.
    pub async fn create(&self, session_id: &str) -> Result<Sandbox, SandboxError> {
        let spec = self.spec_for(session_id);
        info!(session_id = %session_id, container = %spec.name, "Creating sandbox");

        let sandbox = Sandbox::from(self.runtime.start(&spec).await?);

        if self.wait_healthy(sandbox.address).await {
            info!(container = %sandbox.name, address = %sandbox.address, "Sandbox ready");
            return Ok(sandbox);
        }

        error!(container = %sandbox.name, "Sandbox never became healthy, removing");
        if let Err(e) = self
            .runtime
            .stop_and_remove(&sandbox.container_id, PURGE_GRACE)
            .await
        {
            warn!(container = %sandbox.name, error = %e, "Failed to remove unhealthy sandbox");
        }
        Err(SandboxError::HealthCheckFailed { name: sandbox.name })
    }

    async fn wait_healthy(&self, address: SocketAddr) -> bool {
        for attempt in 1..=self.config.health_attempts {
            if self.client.is_healthy(address).await {
                return true;
            }
            if attempt < self.config.health_attempts {
                tokio::time::sleep(self.config.health_poll_interval).await;
            }
        }
        false
    }

    /// Stop and remove a sandbox. Failures are logged, never returned.
    pub async fn teardown(&self, sandbox: &Sandbox) {
        info!(container = %sandbox.name, "Destroying sandbox");
        match self
            .runtime
            .stop_and_remove(&sandbox.container_id, STOP_GRACE)
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound { .. }) => {
                info!(container = %sandbox.name, "Sandbox already gone");
            }
            Err(e) => {
                warn!(container = %sandbox.name, error = %e, "Error destroying sandbox");
            }
        }
    }

    /// Remove every container left behind by a previous run. Returns how
    /// many were removed.
    pub async fn purge_stale(&self) -> usize {
        let stale = match self
            .runtime
            .list_by_prefix(&self.config.container_prefix)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Error listing stale containers");
                return 0;
            }
        };

        let mut purged = 0;
        for container in stale {
            info!(container = %container.name, "Purging stale container");
            match self
                .runtime
                .stop_and_remove(&container.id, PURGE_GRACE)
                .await
            {
                Ok(()) | Err(RuntimeError::NotFound { .. }) => purged += 1,
                Err(e) => {
                    warn!(container = %container.name, error = %e, "Failed to purge container")
                }
            }
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_manager, FakeRuntime};

    #[test]
    fn container_names_are_deterministic_and_prefixed() {
        let a = container_name("cr-sess-", "3f2a9c0d1e4b77aa");
        assert_eq!(a, container_name("cr-sess-", "3f2a9c0d1e4b77aa"));
        assert!(a.starts_with("cr-sess-3f2a9c0d1e4b-"));
    }

    #[test]
    fn container_names_distinguish_shared_prefixes() {
        let a = container_name("cr-sess-", "user-session-0001");
        let b = container_name("cr-sess-", "user-session-0002");
        assert_ne!(a, b);
    }

    #[test]
    fn container_names_strip_unsafe_characters() {
        let name = container_name("cr-sess-", "../../Etc Passwd");
        assert!(name
            .trim_start_matches("cr-sess-")
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
        assert_eq!(container_name("p-", "///").len(), "p-".len() + 8);
    }

    #[test]
    fn memory_limit_saturates_instead_of_wrapping() {
        assert_eq!(memory_bytes(512), 512 * 1024 * 1024);
        assert_eq!(memory_bytes(u64::MAX), i64::MAX);
        assert_eq!(memory_bytes(1 << 44), i64::MAX);
    }

    #[tokio::test]
    async fn create_returns_healthy_sandbox() {
        let runtime = FakeRuntime::new();
        let manager = fake_manager(&runtime);

        let sandbox = manager.create("alpha").await.unwrap();
        assert!(sandbox.name.starts_with("cr-sess-alpha-"));
        assert!(manager.client().is_healthy(sandbox.address).await);
        assert_eq!(runtime.started(), 1);
        assert_eq!(runtime.live_names().await, vec![sandbox.name.clone()]);
    }

    #[tokio::test]
    async fn unhealthy_sandbox_is_removed() {
        let runtime = FakeRuntime::unhealthy();
        let manager = fake_manager(&runtime);

        let err = manager.create("beta").await.unwrap_err();
        assert!(matches!(err, SandboxError::HealthCheckFailed { .. }));
        assert!(runtime.live_names().await.is_empty());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let runtime = FakeRuntime::new();
        let manager = fake_manager(&runtime);

        let sandbox = manager.create("gamma").await.unwrap();
        manager.teardown(&sandbox).await;
        manager.teardown(&sandbox).await;
        assert!(runtime.live_names().await.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_prefixed_containers() {
        let runtime = FakeRuntime::new();
        runtime.seed("cr-sess-leftover1-0000aaaa").await;
        runtime.seed("cr-sess-leftover2-0000bbbb").await;
        runtime.seed("unrelated-db").await;
        let manager = fake_manager(&runtime);

        assert_eq!(manager.purge_stale().await, 2);
        assert_eq!(runtime.live_names().await, vec!["unrelated-db".to_string()]);
    }

    #[tokio::test]
    async fn execute_relays_sandbox_output() {
        let runtime = FakeRuntime::new();
        let manager = fake_manager(&runtime);
        let sandbox = manager.create("delta").await.unwrap();

        let resp = manager
            .client()
            .execute(
                sandbox.address,
                &SandboxRequest {
                    language: "python".to_string(),
                    files: vec![SourceFile {
                        content: "print(2+2)".to_string(),
                    }],
                    stdin: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.run.stdout, "4\n");
        assert_eq!(resp.run.code, 0);
    }

    #[tokio::test]
    async fn killed_sandbox_fails_execute() {
        let runtime = FakeRuntime::new();
        let manager = fake_manager(&runtime);
        let sandbox = manager.create("epsilon").await.unwrap();
        runtime.kill(&sandbox.name).await;

        let err = manager
            .client()
            .execute(
                sandbox.address,
                &SandboxRequest {
                    language: "python".to_string(),
                    files: vec![SourceFile {
                        content: "print(1)".to_string(),
                    }],
                    stdin: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_proxy_failure());
    }
}
