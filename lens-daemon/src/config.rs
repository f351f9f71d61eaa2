use crate::workspace::WorkspaceKind;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Read a `u64` override from the environment, ignoring unparsable values.
fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_u64(name).map(Duration::from_secs).unwrap_or(default)
}

/// Per-operation budgets and retry bounds for a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub initialize_timeout: Duration,
    pub open_timeout: Duration,
    pub definition_timeout: Duration,
    pub hover_timeout: Duration,
    pub workspace_symbol_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Empty workspace/symbol retries for package workspaces
    pub package_symbol_attempts: u32,
    pub package_symbol_delay: Duration,
    /// Empty workspace/symbol retries for xcodeproj/xcworkspace roots
    pub ide_symbol_attempts: u32,
    pub ide_symbol_delay: Duration,
    pub toolchain: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initialize_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(5),
            definition_timeout: Duration::from_secs(15),
            hover_timeout: Duration::from_secs(15),
            workspace_symbol_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            package_symbol_attempts: 8,
            package_symbol_delay: Duration::from_millis(1500),
            ide_symbol_attempts: 3,
            ide_symbol_delay: Duration::from_millis(500),
            toolchain: None,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initialize_timeout: env_secs("SOURCELENS_INIT_TIMEOUT_SECS", defaults.initialize_timeout),
            open_timeout: env_secs("SOURCELENS_OPEN_TIMEOUT_SECS", defaults.open_timeout),
            definition_timeout: env_secs(
                "SOURCELENS_DEFINITION_TIMEOUT_SECS",
                defaults.definition_timeout,
            ),
            hover_timeout: env_secs("SOURCELENS_HOVER_TIMEOUT_SECS", defaults.hover_timeout),
            workspace_symbol_timeout: env_secs(
                "SOURCELENS_SEARCH_TIMEOUT_SECS",
                defaults.workspace_symbol_timeout,
            ),
            shutdown_timeout: env_secs(
                "SOURCELENS_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            ),
            toolchain: std::env::var_os("SOURCELENS_TOOLCHAIN").map(PathBuf::from),
            ..defaults
        }
    }

    /// Attempt count and delay for the empty workspace/symbol retry loop.
    pub fn symbol_retry_policy(&self, kind: WorkspaceKind) -> (u32, Duration) {
        match kind {
            WorkspaceKind::Package => (self.package_symbol_attempts, self.package_symbol_delay),
            WorkspaceKind::IdeProject | WorkspaceKind::IdeWorkspace => {
                (self.ide_symbol_attempts, self.ide_symbol_delay)
            }
        }
    }
}

/// Idle eviction settings for the daemon session pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Bounded wait around a graceful session shutdown
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_timeout: env_secs("SOURCELENS_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            sweep_interval: env_secs("SOURCELENS_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            shutdown_timeout: env_secs(
                "SOURCELENS_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub max_connections: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound on a single request, covering every retry it performs
    pub request_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::socket_path::get_default_socket_path(),
            max_connections: 64,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(180),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socket_path: crate::socket_path::effective_socket_path(),
            max_connections: env_u64("SOURCELENS_MAX_CONNECTIONS")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Complete runtime configuration; defaults overridden by `SOURCELENS_*` variables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LensConfig {
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub daemon: DaemonConfig,
}

impl LensConfig {
    pub fn from_env() -> Self {
        Self {
            session: SessionConfig::from_env(),
            pool: PoolConfig::from_env(),
            daemon: DaemonConfig::from_env(),
        }
    }
}
