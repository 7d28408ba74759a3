//! Command-line and environment configuration.

use crate::error::ConfigError;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONTAINER_PREFIX: &str = "cr-sess-";

/// Largest accepted per-sandbox memory ceiling (1 TiB).
pub const MAX_MEMORY_LIMIT_MB: u64 = 1 << 20;

/// A host path bind-mounted read-only into every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

impl Mount {
    /// Parse a `host:container` pair.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (host, container) = s.split_once(':').ok_or_else(|| ConfigError::Invalid {
            field: "extra_mount",
            reason: format!("expected host:container, got '{}'", s),
        })?;
        let host = host.trim();
        let container = container.trim();
        if host.is_empty() || !container.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "extra_mount",
                reason: format!("expected host:/absolute/container/path, got '{}'", s),
            });
        }
        Ok(Self {
            host: PathBuf::from(host),
            container: container.to_string(),
        })
    }
}

/// How each sandbox container is built and probed.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub container_prefix: String,
    /// Shared reference material, mounted read-only at `/project`.
    pub project_mount: Option<PathBuf>,
    pub extra_mounts: Vec<Mount>,
    pub sandbox_port: u16,
    pub network_mode: String,
    pub memory_limit_mb: u64,
    /// CPU quota in microseconds per 100ms period.
    pub cpu_quota: i64,
    pub health_poll_interval: Duration,
    pub health_attempts: u32,
    pub proxy_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "rpa4all/code-runner".to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            project_mount: None,
            extra_mounts: Vec::new(),
            sandbox_port: 5000,
            network_mode: "bridge".to_string(),
            memory_limit_mb: 512,
            cpu_quota: 50_000,
            health_poll_interval: Duration::from_millis(500),
            health_attempts: 15,
            proxy_timeout: Duration::from_secs(35),
        }
    }
}

/// Admission and reclamation limits for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub queue_wait_timeout: Duration,
    pub reap_interval: Duration,
    /// Delay suggested to callers that were left in the queue.
    pub retry_after: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            idle_timeout: Duration::from_secs(300),
            queue_wait_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(15),
            retry_after: Duration::from_secs(5),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Everything `serve` needs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub pool: PoolConfig,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "2000")]
    pub port: u16,

    /// Maximum number of concurrently live sandboxes
    #[arg(long, env = "MAX_SESSIONS", default_value = "5")]
    pub max_sessions: usize,

    /// Seconds without activity before a sandbox is reclaimed
    #[arg(long, env = "IDLE_TIMEOUT", default_value = "300")]
    pub idle_timeout: u64,

    /// Seconds a queued request waits for a free slot
    #[arg(long, env = "QUEUE_WAIT_TIMEOUT", default_value = "30")]
    pub queue_wait_timeout: u64,

    /// Seconds between idle reaper passes
    #[arg(long, env = "REAP_INTERVAL", default_value = "15")]
    pub reap_interval: u64,

    /// Retry delay in seconds suggested to queued callers
    #[arg(long, env = "RETRY_AFTER", default_value = "5")]
    pub retry_after: u64,

    /// Sandbox image
    #[arg(long, env = "CONTAINER_IMAGE", default_value = "rpa4all/code-runner")]
    pub image: String,

    /// Host path mounted read-only at /project in every sandbox
    #[arg(long, env = "PROJECT_MOUNT")]
    pub project_mount: Option<PathBuf>,

    /// Additional read-only mounts as host:container
    #[arg(long = "extra-mount", env = "EXTRA_MOUNTS", value_delimiter = ',')]
    pub extra_mounts: Vec<String>,

    /// Name prefix identifying session containers
    #[arg(long, env = "CONTAINER_PREFIX", default_value = DEFAULT_CONTAINER_PREFIX)]
    pub container_prefix: String,

    /// Port the sandbox HTTP service listens on inside the container
    #[arg(long, env = "SANDBOX_PORT", default_value = "5000")]
    pub sandbox_port: u16,

    /// Container network mode
    #[arg(long, env = "SANDBOX_NETWORK", default_value = "bridge")]
    pub network_mode: String,

    /// Memory ceiling per sandbox in MB
    #[arg(long, env = "SANDBOX_MEMORY_MB", default_value = "512")]
    pub memory_limit_mb: u64,

    /// CPU quota per 100000us period (50000 = half a core)
    #[arg(long, env = "SANDBOX_CPU_QUOTA", default_value = "50000")]
    pub cpu_quota: i64,

    /// Milliseconds between sandbox health probes
    #[arg(long, env = "HEALTH_POLL_MS", default_value = "500")]
    pub health_poll_ms: u64,

    /// Health probes before a sandbox is declared dead
    #[arg(long, env = "HEALTH_ATTEMPTS", default_value = "15")]
    pub health_attempts: u32,

    /// Seconds before a proxied execute call is abandoned
    #[arg(long, env = "PROXY_TIMEOUT", default_value = "35")]
    pub proxy_timeout: u64,

    /// Allowed CORS origins
    #[arg(
        long = "cors-origin",
        env = "CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:8080,http://localhost:8081"
    )]
    pub cors_origins: Vec<String>,
}

impl ServeArgs {
    /// Validate the raw arguments and build the server configuration.
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sessions",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.health_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "health_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.proxy_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "proxy_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.memory_limit_mb == 0 || self.memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(ConfigError::Invalid {
                field: "memory_limit_mb",
                reason: format!("must be between 1 and {}", MAX_MEMORY_LIMIT_MB),
            });
        }
        if self.cpu_quota <= 0 {
            return Err(ConfigError::Invalid {
                field: "cpu_quota",
                reason: "must be positive".to_string(),
            });
        }
        if self.container_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "container_prefix",
                reason: "must not be empty".to_string(),
            });
        }

        let extra_mounts = self
            .extra_mounts
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(|m| Mount::parse(m))
            .collect::<Result<Vec<_>, _>>()?;

        let sandbox = SandboxConfig {
            image: self.image,
            container_prefix: self.container_prefix,
            project_mount: self.project_mount,
            extra_mounts,
            sandbox_port: self.sandbox_port,
            network_mode: self.network_mode,
            memory_limit_mb: self.memory_limit_mb,
            cpu_quota: self.cpu_quota,
            health_poll_interval: Duration::from_millis(self.health_poll_ms),
            health_attempts: self.health_attempts,
            proxy_timeout: Duration::from_secs(self.proxy_timeout),
        };

        Ok(ServerConfig {
            port: self.port,
            cors_origins: self.cors_origins,
            pool: PoolConfig {
                max_sessions: self.max_sessions,
                idle_timeout: Duration::from_secs(self.idle_timeout),
                queue_wait_timeout: Duration::from_secs(self.queue_wait_timeout),
                reap_interval: Duration::from_secs(self.reap_interval.max(1)),
                retry_after: Duration::from_secs(self.retry_after),
                sandbox,
            },
        })
    }
}
