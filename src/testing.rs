//! In-process container runtime for tests.
//!
//! Each "container" is a tiny axum sandbox bound to a loopback port that
//! answers the liveness and execute endpoints, so the pool and the front
//! door are exercised over real HTTP.

use crate::config::{PoolConfig, SandboxConfig};
use crate::error::RuntimeError;
use crate::pool::Pool;
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, RunningContainer};
use crate::sandbox::{RunResult, SandboxManager, SandboxRequest, SandboxResponse};
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct FakeContainer {
    name: String,
    alive: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Healthy,
    Unhealthy,
    Hanging,
    Panicking,
}

struct FakeInner {
    containers: Mutex<HashMap<String, FakeContainer>>,
    started: AtomicUsize,
    next_id: AtomicUsize,
    behavior: Behavior,
}

#[derive(Clone)]
pub struct FakeRuntime {
    inner: Arc<FakeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Healthy)
    }

    /// Containers start but never pass their liveness probe.
    pub fn unhealthy() -> Self {
        Self::with_behavior(Behavior::Unhealthy)
    }

    /// Sandboxes pass their probe but never answer an execute request.
    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hanging)
    }

    /// Starting a container panics.
    pub fn panicking() -> Self {
        Self::with_behavior(Behavior::Panicking)
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                containers: Mutex::new(HashMap::new()),
                started: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                behavior,
            }),
        }
    }

    /// Number of containers ever started.
    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Names of containers that exist, sorted.
    pub async fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .containers
            .lock()
            .await
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Register a stopped container, as if left over from a crashed run.
    pub async fn seed(&self, name: &str) {
        let id = format!("seed-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.containers.lock().await.insert(
            id,
            FakeContainer {
                name: name.to_string(),
                alive: Arc::new(AtomicBool::new(false)),
                server: None,
            },
        );
    }

    /// Kill the sandbox process; the container record stays behind.
    pub async fn kill(&self, name: &str) {
        let mut containers = self.inner.containers.lock().await;
        if let Some(c) = containers.values_mut().find(|c| c.name == name) {
            c.alive.store(false, Ordering::SeqCst);
            if let Some(server) = c.server.take() {
                server.abort();
            }
        }
    }

    /// Remove a container behind the pool's back.
    pub async fn remove_out_of_band(&self, id: &str) {
        if let Some(c) = self.inner.containers.lock().await.remove(id) {
            c.alive.store(false, Ordering::SeqCst);
            if let Some(server) = c.server {
                server.abort();
            }
        }
    }
}

#[derive(Clone)]
struct FakeSandbox {
    alive: Arc<AtomicBool>,
    behavior: Behavior,
}

async fn fake_health(State(sandbox): State<FakeSandbox>) -> StatusCode {
    if sandbox.behavior != Behavior::Unhealthy && sandbox.alive.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn fake_execute(
    State(sandbox): State<FakeSandbox>,
    Json(req): Json<SandboxRequest>,
) -> Result<Json<SandboxResponse>, StatusCode> {
    if !sandbox.alive.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if sandbox.behavior == Behavior::Hanging {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    let code = req.files.first().map(|f| f.content.as_str()).unwrap_or("");
    Ok(Json(SandboxResponse {
        run: RunResult {
            stdout: interpret(code),
            stderr: String::new(),
            code: 0,
            signal: None,
        },
        language: Some("python".to_string()),
        version: Some("3.11".to_string()),
    }))
}

/// Understands `print(...)` of integer sums and string literals.
fn interpret(code: &str) -> String {
    let mut out = String::new();
    for line in code.lines() {
        let Some(arg) = line
            .trim()
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
        else {
            continue;
        };
        let arg = arg.trim();
        let sum: Option<i64> = arg
            .split('+')
            .map(|t| t.trim().parse::<i64>().ok())
            .sum();
        match sum {
            Some(n) => out.push_str(&n.to_string()),
            None => out.push_str(arg.trim_matches(|c| c == '"' || c == '\'')),
        }
        out.push('\n');
    }
    out
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<RunningContainer, RuntimeError> {
        if self.inner.behavior == Behavior::Panicking {
            panic!("container runtime crashed starting {}", spec.name);
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::Api {
                reason: e.to_string(),
            })?;
        let address = listener.local_addr().map_err(|e| RuntimeError::Api {
            reason: e.to_string(),
        })?;

        let alive = Arc::new(AtomicBool::new(true));
        let app = Router::new()
            .route("/health", get(fake_health))
            .route("/api/v2/execute", post(fake_execute))
            .with_state(FakeSandbox {
                alive: alive.clone(),
                behavior: self.inner.behavior,
            });
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let id = format!("fake-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        self.inner.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                alive,
                server: Some(server),
            },
        );

        Ok(RunningContainer {
            id,
            name: spec.name.clone(),
            address,
        })
    }

    async fn stop_and_remove(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let container = self
            .inner
            .containers
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        container.alive.store(false, Ordering::SeqCst);
        if let Some(server) = container.server {
            server.abort();
        }
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        Ok(self
            .inner
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.name.starts_with(prefix))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }
}

pub fn test_sandbox_config() -> SandboxConfig {
    SandboxConfig {
        health_poll_interval: Duration::from_millis(10),
        health_attempts: 3,
        proxy_timeout: Duration::from_secs(2),
        ..SandboxConfig::default()
    }
}

pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        max_sessions: 2,
        queue_wait_timeout: Duration::from_millis(200),
        sandbox: test_sandbox_config(),
        ..PoolConfig::default()
    }
}

pub fn fake_manager(runtime: &FakeRuntime) -> SandboxManager {
    SandboxManager::new(Arc::new(runtime.clone()), test_sandbox_config())
}

pub fn fake_pool(runtime: &FakeRuntime, config: PoolConfig) -> Pool {
    let sandboxes = SandboxManager::new(Arc::new(runtime.clone()), config.sandbox.clone());
    Pool::new(config, sandboxes)
}

#[cfg(test)]
mod tests {
    use super::interpret;

    #[test]
    fn interprets_prints() {
        assert_eq!(interpret("print(2+2)"), "4\n");
        assert_eq!(interpret("print('hi')\nprint(1)"), "hi\n1\n");
        assert_eq!(interpret("x = 1"), "");
    }
}
