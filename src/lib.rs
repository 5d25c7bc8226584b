//! Workflow orchestration core
//!
//! Provides the building blocks for routing and running multi-step
//! workflows across internal agents, an external automation platform, or
//! human escalation:
//! - Agent Registry: executor identity, capabilities, status, performance
//! - Task Queue: priority-ordered task lifecycle, owned independently of
//!   workflows
//! - Workflow Engine: a five-phase state machine per workflow
//! - Decision/Routing Layer: pluggable policy choosing agent, external
//!   flow, or human escalation
//! - Reliability Layer: circuit breaker, retry, rate limiting, and
//!   background monitor loops

pub mod adapters;
pub mod config;
pub mod decision;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod workflow;

pub use adapters::{
    AgentAdapter, AutomationClient, ExecutionResult, ExecutionStatus, HttpAutomationClient,
    MemoryRetrieval, MemoryStore, MockAgentAdapter, MockAutomationClient, NullMemoryStore,
};
pub use config::{init_tracing, CircuitBreakerConfig, LoggingConfig, OrchestratorConfig};
pub use decision::{
    DecisionPolicy, DecisionResult, DefaultDecisionPolicy, ExternalFlowRegistry, MemoryContext,
    RouteTarget,
};
pub use error::{OrchestrationError, Result};
pub use metrics::{MetricsSnapshot, PerformanceMetrics};
pub use monitor::Monitor;
pub use queue::{Priority, Task, TaskQueue, TaskStatus};
pub use registry::{AgentRecord, AgentRegistry, AgentStatus};
pub use reliability::{with_retry, CircuitBreaker, CircuitState, RateLimiter};
pub use workflow::{EngineStats, Phase, Workflow, WorkflowEngine, WorkflowMetadata, WorkflowStatus};

use std::sync::Arc;

/// Everything needed to run the orchestration core, wired together with
/// sane defaults. Embedders that need custom wiring (a real
/// `AutomationClient`, a memory store, registered external flows) should
/// construct the pieces directly instead of going through this facade.
pub struct Orchestrator {
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<TaskQueue>,
    pub engine: WorkflowEngine,
    pub monitor: Monitor,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
        let engine = WorkflowEngine::new(config, registry.clone(), queue.clone(), decision, None, None);
        let monitor = Monitor::new(
            engine.clone(),
            registry.clone(),
            queue.clone(),
            engine.automation_breaker(),
            engine.rate_limiter(),
            engine.metrics(),
        );
        Self { registry, queue, engine, monitor }
    }

    /// Starts the reliability monitor loops. Call once after construction.
    pub fn start_monitoring(&self) {
        self.monitor.spawn();
    }

    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
        self.engine.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn orchestrator_constructs_and_shuts_down_cleanly() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        orchestrator.start_monitoring();
        orchestrator.shutdown().await;
    }
}
