//! Configuration surface for the orchestration core.
//!
//! The core never loads this from the environment or a file: per the
//! system's scope, CLI parsing and env/file loaders live outside the core.
//! Callers build an [`OrchestratorConfig`] explicitly (or take the
//! `Default`) and pass it to the components they construct.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root for any workflow-definition lookups. Unused by the core itself;
    /// carried through for embedders that resolve templates from disk.
    pub base_path: String,

    /// When true, every side-effecting write (task assignment, external
    /// dispatch) is logged and skipped instead of performed.
    pub dry_run: bool,

    /// Sliding-window length for the rate limiter, per (operation, identity).
    pub rate_limit_window_secs: u64,

    /// Max requests admitted within `rate_limit_window_secs`.
    pub rate_limit_max_requests: u32,

    /// Upper bound on parallel in-flight workflows.
    pub max_concurrent_operations: usize,

    pub retry_attempts: u32,
    pub retry_delay: Duration,

    /// External-client pool capacity. Advisory; consumed by adapters that
    /// maintain their own connection pools.
    pub connection_pool_size: usize,

    /// Per-call deadline to external dependencies.
    pub request_timeout: Duration,

    pub logging: LoggingConfig,
    pub circuit_breaker: CircuitBreakerConfig,

    /// Hard deadline applied to every workflow unless overridden per-request.
    pub default_workflow_timeout: Duration,

    /// Cadence the task-execution monitor loop polls task status at.
    pub task_poll_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub rotation_size_mb: u64,
    pub backup_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            rotation_size_mb: 100,
            backup_count: 5,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_path: ".".to_string(),
            dry_run: false,
            rate_limit_window_secs: 60,
            rate_limit_max_requests: 100,
            max_concurrent_operations: 50,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            connection_pool_size: 10,
            request_timeout: Duration::from_secs(30),
            logging: LoggingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            default_workflow_timeout: Duration::from_secs(1800),
            task_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Installs a global `tracing` subscriber reading `RUST_LOG`, falling back to
/// `logging.level`. Intended for binaries embedding this crate; the library
/// itself never calls this on its own.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
