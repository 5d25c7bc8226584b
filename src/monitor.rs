//! Reliability Layer monitor loops.
//!
//! Four independent cooperative loops over the same shared state: health,
//! metrics, performance-threshold, and security. Each runs on its own
//! cadence and shares one cancellation signal so `Monitor::shutdown` stops
//! all four together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::metrics::PerformanceMetrics;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::reliability::{CircuitBreaker, RateLimiter};
use crate::workflow::WorkflowEngine;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);
const PERFORMANCE_INTERVAL: Duration = Duration::from_secs(60);
const SECURITY_INTERVAL: Duration = Duration::from_secs(60);

struct MonitorState {
    engine: WorkflowEngine,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    automation_breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<PerformanceMetrics>,
}

/// Owns the four background monitor loops. Construct once, call `spawn`,
/// call `shutdown` to stop all four and await their exit.
pub struct Monitor {
    state: Arc<MonitorState>,
    cancel: Arc<AtomicBool>,
    handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        engine: WorkflowEngine,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        automation_breaker: Arc<CircuitBreaker>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        Self {
            state: Arc::new(MonitorState {
                engine,
                registry,
                queue,
                automation_breaker,
                rate_limiter,
                metrics,
            }),
            cancel: Arc::new(AtomicBool::new(false)),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn spawn(&self) {
        let mut handles = self.handles.lock();
        handles.push(spawn_loop(self.state.clone(), self.cancel.clone(), HEALTH_INTERVAL, health_tick));
        handles.push(spawn_loop(self.state.clone(), self.cancel.clone(), METRICS_INTERVAL, metrics_tick));
        handles.push(spawn_loop(
            self.state.clone(),
            self.cancel.clone(),
            PERFORMANCE_INTERVAL,
            performance_tick,
        ));
        handles.push(spawn_loop(self.state.clone(), self.cancel.clone(), SECURITY_INTERVAL, security_tick));
    }

    pub async fn shutdown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn spawn_loop<F, Fut>(
    state: Arc<MonitorState>,
    cancel: Arc<AtomicBool>,
    interval: Duration,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Arc<MonitorState>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        while !cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            tick(state.clone()).await;
        }
    })
}

async fn health_tick(state: Arc<MonitorState>) {
    let agents = state.registry.list(None);
    let active = agents.iter().filter(|a| a.status == crate::registry::AgentStatus::Active).count();
    info!(
        total_agents = agents.len(),
        active_agents = active,
        breaker_state = ?state.automation_breaker.state(),
        "health check"
    );
}

async fn metrics_tick(state: Arc<MonitorState>) {
    let snapshot = state.metrics.snapshot();
    let engine_stats = state.engine.stats().await;
    info!(
        memory_mb = snapshot.memory_mb,
        cpu_percent = snapshot.cpu_percent,
        uptime_secs = snapshot.uptime.as_secs(),
        request_count = snapshot.request_count,
        error_count = snapshot.error_count,
        avg_response_time_ms = snapshot.avg_response_time_ms,
        running_workflows = engine_stats.running,
        completed_workflows = engine_stats.completed,
        failed_workflows = engine_stats.failed,
        "performance metrics"
    );
}

async fn performance_tick(state: Arc<MonitorState>) {
    let snapshot = state.metrics.snapshot();
    for warning in snapshot.breached_thresholds() {
        warn!(
            memory_mb = snapshot.memory_mb,
            cpu_percent = snapshot.cpu_percent,
            request_count = snapshot.request_count,
            error_count = snapshot.error_count,
            avg_response_time_ms = snapshot.avg_response_time_ms,
            "{}",
            warning
        );
    }
}

async fn security_tick(state: Arc<MonitorState>) {
    let saturated = state.rate_limiter.saturated_windows();
    if saturated > 0 {
        warn!(saturated_windows = saturated, "rate-limited callers at capacity");
    }
    let breaker_state = state.automation_breaker.state();
    if breaker_state != crate::reliability::CircuitState::Closed {
        warn!(breaker_state = ?breaker_state, "automation circuit breaker not closed");
    }
}
