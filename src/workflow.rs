//! Workflow Engine
//!
//! Implements the five-phase state machine per workflow, template-driven
//! task decomposition, and result aggregation. The engine owns workflows
//! exclusively; the task queue owns tasks, referenced here only by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{AgentAdapter, AutomationClient, MemoryStore};
use crate::config::OrchestratorConfig;
use crate::decision::{DecisionPolicy, MemoryContext, RouteTarget};
use crate::error::{OrchestrationError, Result};
use crate::metrics::PerformanceMetrics;
use crate::queue::{Priority, Task, TaskQueue, TaskStatus};
use crate::registry::{AgentRegistry, AgentStatus};
use crate::reliability::{with_retry, CircuitBreaker, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initialization,
    AgentSelection,
    TaskExecution,
    ResultProcessing,
    Completion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub decision_reasoning: Option<String>,
    pub decision_confidence: Option<f64>,
    pub n8n_workflow_id: Option<String>,
    pub escalation_id: Option<String>,
    pub external_execution_id: Option<String>,
    pub complexity: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub workflow_type: String,
    pub payload: Value,
    pub priority: Priority,
    /// Per-workflow override of the engine's `default_workflow_timeout`.
    /// `None` means the request didn't specify one; §3's stated "default
    /// 1800" is the config default applied by the engine, not baked in here.
    pub timeout_seconds: Option<u64>,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub assigned_agents: Vec<String>,
    pub tasks: Vec<String>,
    pub results: HashMap<String, Value>,
    pub metadata: WorkflowMetadata,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        workflow_type: impl Into<String>,
        payload: Value,
        priority: Priority,
        timeout_seconds: Option<u64>,
    ) -> Self {
        Self {
            id: String::new(),
            workflow_type: workflow_type.into(),
            payload,
            priority,
            timeout_seconds,
            status: WorkflowStatus::Pending,
            current_phase: Phase::Initialization,
            assigned_agents: Vec::new(),
            tasks: Vec::new(),
            results: HashMap::new(),
            metadata: WorkflowMetadata::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One step of a task template. `source_field` pulls a field straight off
/// the workflow payload; `prev_field` pipes the previous step's result in
/// under that key. Neither set means "pass the whole workflow payload
/// through", used by the generic `execute_workflow` fallback template.
struct TemplateStep {
    task_type: &'static str,
    source_field: Option<&'static str>,
    prev_field: Option<&'static str>,
}

struct WorkflowTemplate {
    steps: Vec<TemplateStep>,
    /// Whether a FAILED task stops the chain and marks the workflow Failed
    /// once it reaches Completion, instead of the default of running every
    /// step regardless of individual failures.
    strict: bool,
    /// Whether all steps are enqueued up front (parallel, late-bound
    /// results) rather than awaited one at a time (sequential, piped
    /// results). Default templates are sequential.
    parallel: bool,
}

fn required_capabilities(workflow_type: &str) -> Vec<&'static str> {
    match workflow_type {
        "site_recreation" => vec![
            "Project management",
            "Interface design",
            "Code generation",
            "Quality assurance",
        ],
        "business_analysis" => vec!["Portfolio analysis", "Financial analysis", "Data analysis"],
        "content_creation" => vec!["Content strategy", "Copywriting", "SEO optimization"],
        "research_processing" => vec![
            "Research analysis",
            "Knowledge extraction",
            "Document processing",
        ],
        "automation" => vec![
            "Web scraping",
            "Browser automation",
            "Workflow automation",
        ],
        _ => vec!["General capabilities"],
    }
}

fn template_for(workflow_type: &str) -> WorkflowTemplate {
    let steps = match workflow_type {
        "site_recreation" => vec![
            TemplateStep { task_type: "analyze_site", source_field: Some("url"), prev_field: None },
            TemplateStep { task_type: "design_interface", source_field: Some("requirements"), prev_field: None },
            TemplateStep { task_type: "generate_code", source_field: None, prev_field: Some("design") },
            TemplateStep { task_type: "test_quality", source_field: None, prev_field: Some("code") },
        ],
        "business_analysis" => vec![
            TemplateStep { task_type: "analyze_portfolio", source_field: Some("businesses"), prev_field: None },
            TemplateStep { task_type: "financial_analysis", source_field: None, prev_field: Some("data") },
            TemplateStep { task_type: "generate_report", source_field: None, prev_field: Some("analysis") },
        ],
        "content_creation" => vec![
            TemplateStep { task_type: "strategize_content", source_field: Some("brief"), prev_field: None },
            TemplateStep { task_type: "write_copy", source_field: None, prev_field: Some("strategy") },
            TemplateStep { task_type: "optimize_seo", source_field: None, prev_field: Some("draft") },
        ],
        "research_processing" => vec![
            TemplateStep { task_type: "gather_research", source_field: Some("topic"), prev_field: None },
            TemplateStep { task_type: "extract_knowledge", source_field: None, prev_field: Some("research") },
            TemplateStep { task_type: "process_documents", source_field: None, prev_field: Some("knowledge") },
        ],
        "automation" => vec![
            TemplateStep { task_type: "scrape_web", source_field: Some("target"), prev_field: None },
            TemplateStep { task_type: "automate_browser", source_field: None, prev_field: Some("scraped") },
            TemplateStep { task_type: "run_workflow_automation", source_field: None, prev_field: Some("automated") },
        ],
        _ => vec![TemplateStep { task_type: "execute_workflow", source_field: None, prev_field: None }],
    };

    WorkflowTemplate {
        steps,
        strict: workflow_type == "site_recreation",
        parallel: false,
    }
}

fn build_payload(step: &TemplateStep, workflow_payload: &Value, prev_result: Option<&Value>) -> Value {
    if step.source_field.is_none() && step.prev_field.is_none() {
        return workflow_payload.clone();
    }
    let mut map = serde_json::Map::new();
    if let Some(field) = step.source_field {
        map.insert(
            field.to_string(),
            workflow_payload.get(field).cloned().unwrap_or(Value::Null),
        );
    }
    if let Some(field) = step.prev_field {
        map.insert(field.to_string(), prev_result.cloned().unwrap_or(Value::Null));
    }
    Value::Object(map)
}

fn base_complexity(workflow_type: &str) -> i32 {
    match workflow_type {
        "simple" => 2,
        "data_processing" => 4,
        "automation" => 5,
        "integration" => 6,
        "complex" => 8,
        "critical" => 10,
        _ => 3,
    }
}

/// §4.3 complexity heuristic: base by type, bumped by payload size and
/// priority, clamped to [1, 10].
pub fn compute_complexity(workflow: &Workflow) -> u8 {
    let mut score = base_complexity(&workflow.workflow_type);
    let size = serde_json::to_vec(&workflow.payload).map(|v| v.len()).unwrap_or(0);
    if size > 10_000 {
        score += 2;
    } else if size > 1_000 {
        score += 1;
    }
    match workflow.priority {
        Priority::High => score += 1,
        Priority::Critical => score += 2,
        _ => {}
    }
    score.clamp(1, 10) as u8
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Cooperative cancellation signal for one workflow's background task.
/// `flag` is the source of truth (checked at every suspension point between
/// phases); `notify` lets a waiter asleep mid-phase (e.g. polling a task for
/// completion) wake immediately instead of waiting out its poll interval.
#[derive(Clone)]
struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Sleeps for at most `duration`, returning early if cancellation fires
    /// while waiting.
    async fn sleep_or_cancelled(&self, duration: std::time::Duration) {
        if self.is_set() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

struct WorkflowControl {
    cancel: CancelSignal,
    handle: tokio::task::JoinHandle<()>,
}

struct EngineInner {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    decision: Arc<dyn DecisionPolicy>,
    automation_client: Option<Arc<dyn AutomationClient>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    agent_adapters: RwLock<HashMap<String, Arc<dyn AgentAdapter>>>,
    automation_breaker: Arc<CircuitBreaker>,
    memory_breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<PerformanceMetrics>,
    workflows: RwLock<HashMap<String, Arc<RwLock<Workflow>>>>,
    control: parking_lot::Mutex<HashMap<String, WorkflowControl>>,
    shutdown: AtomicBool,
}

/// Five-phase workflow orchestrator. Cheap to clone: internally an `Arc`
/// over shared state, matching the rest of the core's single-lock-per
/// component resource policy.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        decision: Arc<dyn DecisionPolicy>,
        automation_client: Option<Arc<dyn AutomationClient>>,
        memory_store: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        let breaker_config = config.circuit_breaker;
        let rate_limiter = Arc::new(RateLimiter::new(
            std::time::Duration::from_secs(config.rate_limit_window_secs),
            config.rate_limit_max_requests,
        ));
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                queue,
                decision,
                automation_client,
                memory_store,
                agent_adapters: RwLock::new(HashMap::new()),
                automation_breaker: Arc::new(CircuitBreaker::new("automation_client", breaker_config)),
                memory_breaker: Arc::new(CircuitBreaker::new("memory_store", breaker_config)),
                rate_limiter,
                metrics: Arc::new(PerformanceMetrics::new()),
                workflows: RwLock::new(HashMap::new()),
                control: parking_lot::Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Shared handle to the circuit breaker guarding the automation client,
    /// for the reliability monitor's security loop to observe.
    pub fn automation_breaker(&self) -> Arc<CircuitBreaker> {
        self.inner.automation_breaker.clone()
    }

    /// Shared handle to the rate limiter guarding `start_workflow`, for the
    /// reliability monitor's security loop to observe.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.inner.rate_limiter.clone()
    }

    /// Shared handle to the request/error/response-time counters fed by
    /// every retried external call, for the reliability monitor's metrics
    /// and performance-threshold loops to sample.
    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.inner.metrics.clone()
    }

    pub async fn register_adapter(&self, agent_id: impl Into<String>, adapter: Arc<dyn AgentAdapter>) {
        self.inner.agent_adapters.write().await.insert(agent_id.into(), adapter);
    }

    /// Attaches id if missing, records PENDING->RUNNING, launches background
    /// execution, and returns immediately with the workflow id.
    pub async fn start(&self, mut workflow: Workflow) -> Result<String> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(OrchestrationError::IllegalTransition(
                "engine is shutting down".to_string(),
            ));
        }
        self.inner
            .rate_limiter
            .check("start_workflow", &workflow.workflow_type)?;

        let in_flight = self.inner.control.lock().len();
        if in_flight >= self.inner.config.max_concurrent_operations {
            return Err(OrchestrationError::Validation(format!(
                "max_concurrent_operations ({}) reached",
                self.inner.config.max_concurrent_operations
            )));
        }

        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        let id = workflow.id.clone();
        let handle = Arc::new(RwLock::new(workflow));

        self.inner.workflows.write().await.insert(id.clone(), handle.clone());

        let cancel = CancelSignal::new();
        let engine = self.clone();
        let task_handle = handle.clone();
        let task_cancel = cancel.clone();
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            engine.run(task_id, task_handle, task_cancel).await;
        });

        self.inner.control.lock().insert(id.clone(), WorkflowControl { cancel, handle: join });
        info!(workflow_id = %id, "workflow started");
        Ok(id)
    }

    pub async fn status(&self, workflow_id: &str) -> Option<Workflow> {
        let workflows = self.inner.workflows.read().await;
        match workflows.get(workflow_id) {
            Some(handle) => Some(handle.read().await.clone()),
            None => None,
        }
    }

    pub async fn list(&self, status_filter: Option<WorkflowStatus>) -> Vec<Workflow> {
        let workflows = self.inner.workflows.read().await;
        let mut out = Vec::with_capacity(workflows.len());
        for handle in workflows.values() {
            let snapshot = handle.read().await.clone();
            if status_filter.map(|s| snapshot.status == s).unwrap_or(true) {
                out.push(snapshot);
            }
        }
        out
    }

    pub async fn stats(&self) -> EngineStats {
        let all = self.list(None).await;
        let mut stats = EngineStats { total: all.len(), ..Default::default() };
        for w in &all {
            match w.status {
                WorkflowStatus::Pending => stats.pending += 1,
                WorkflowStatus::Running => stats.running += 1,
                WorkflowStatus::Completed => stats.completed += 1,
                WorkflowStatus::Failed => stats.failed += 1,
                WorkflowStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Cancels the in-flight execution task and cascades to every task in
    /// `workflow.tasks`. No-op on an already-terminal workflow.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let already_terminal = {
            let workflows = self.inner.workflows.read().await;
            match workflows.get(workflow_id) {
                Some(handle) => handle.read().await.status.is_terminal(),
                None => return false,
            }
        };
        if already_terminal {
            return false;
        }
        let signal = self.inner.control.lock().get(workflow_id).map(|c| c.cancel.clone());
        match signal {
            Some(cancel) => {
                cancel.set();
                true
            }
            None => false,
        }
    }

    /// Sets the shutdown flag (rejecting new starts), cancels every running
    /// workflow, and awaits their completion.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.inner.control.lock().keys().cloned().collect();
        for id in &ids {
            self.cancel(id).await;
        }
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut control = self.inner.control.lock();
            ids.iter().filter_map(|id| control.remove(id)).map(|c| c.handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run(&self, workflow_id: String, wf: Arc<RwLock<Workflow>>, cancel: CancelSignal) {
        let timeout_secs = wf
            .read()
            .await
            .timeout_seconds
            .unwrap_or(self.inner.config.default_workflow_timeout.as_secs());
        let timeout = std::time::Duration::from_secs(timeout_secs);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                let mut w = wf.write().await;
                if !w.status.is_terminal() {
                    for task_id in w.tasks.clone() {
                        self.inner.queue.cancel(&task_id);
                    }
                    w.status = WorkflowStatus::Failed;
                    w.error = Some("timeout".to_string());
                    w.completed_at = Some(Utc::now());
                    warn!(workflow_id = %workflow_id, "workflow timed out");
                }
            }
            _ = self.execute_phases(&wf, &cancel) => {}
        }
        self.inner.control.lock().remove(&workflow_id);
    }

    /// Returns true if a cancellation was observed and finalized.
    async fn check_cancel(&self, wf: &Arc<RwLock<Workflow>>, cancel: &CancelSignal) -> bool {
        if !cancel.is_set() {
            return false;
        }
        let mut w = wf.write().await;
        if !w.status.is_terminal() {
            for task_id in w.tasks.clone() {
                self.inner.queue.cancel(&task_id);
            }
            w.status = WorkflowStatus::Cancelled;
            w.completed_at = Some(Utc::now());
            info!(workflow_id = %w.id, "workflow cancelled");
        }
        true
    }

    async fn execute_phases(&self, wf: &Arc<RwLock<Workflow>>, cancel: &CancelSignal) {
        self.phase_initialize(wf).await;
        if self.check_cancel(wf, cancel).await {
            return;
        }

        self.phase_select_agents(wf).await;
        if self.check_cancel(wf, cancel).await {
            return;
        }

        let failed = self.phase_execute_tasks(wf, cancel).await;
        if self.check_cancel(wf, cancel).await {
            return;
        }
        if failed {
            return;
        }

        self.phase_process_results(wf).await;
        if self.check_cancel(wf, cancel).await {
            return;
        }

        self.phase_complete(wf).await;
    }

    async fn phase_initialize(&self, wf: &Arc<RwLock<Workflow>>) {
        let mut w = wf.write().await;
        w.current_phase = Phase::Initialization;
        if w.started_at.is_none() {
            w.started_at = Some(Utc::now());
        }
        w.metadata.complexity = Some(compute_complexity(&w));
    }

    async fn phase_select_agents(&self, wf: &Arc<RwLock<Workflow>>) {
        let snapshot = {
            let mut w = wf.write().await;
            w.current_phase = Phase::AgentSelection;
            w.clone()
        };

        let candidates = self.inner.registry.list(Some(AgentStatus::Active));

        let memory_context = match &self.inner.memory_store {
            Some(store) => {
                let store = store.clone();
                let agent_id = snapshot.id.clone();
                let query = snapshot.workflow_type.clone();
                let request_start = std::time::Instant::now();
                let outcome = with_retry(
                    &self.inner.memory_breaker,
                    self.inner.config.retry_attempts,
                    self.inner.config.retry_delay,
                    || {
                        let store = store.clone();
                        let agent_id = agent_id.clone();
                        let query = query.clone();
                        async move { store.retrieve(&agent_id, &[], &query).await }
                    },
                )
                .await;
                self.inner
                    .metrics
                    .record_request(request_start.elapsed(), outcome.is_ok());
                outcome.ok().map(|r| MemoryContext { short_term: r.short_term, long_term: r.long_term })
            }
            None => None,
        };

        let decision = self
            .inner
            .decision
            .decide(&snapshot, &candidates, memory_context.as_ref());

        let mut w = wf.write().await;
        match decision {
            Ok(decision) => {
                match decision.target {
                    RouteTarget::Agent(agent_id) => w.assigned_agents = vec![agent_id],
                    RouteTarget::Workflow(flow_id) => {
                        w.metadata.n8n_workflow_id = Some(flow_id);
                        w.assigned_agents.clear();
                    }
                    RouteTarget::Human(escalation_id) => {
                        w.metadata.escalation_id = Some(escalation_id);
                        w.assigned_agents.clear();
                    }
                }
                w.metadata.decision_reasoning = Some(decision.reasoning);
                w.metadata.decision_confidence = Some(decision.confidence);
            }
            Err(err) => {
                warn!(workflow_id = %w.id, error = %err, "decision layer failed, falling back to simple selection");
                let mut seen = std::collections::HashSet::new();
                let mut ids = Vec::new();
                for capability in required_capabilities(&w.workflow_type) {
                    for agent in self.inner.registry.find_by_capability(capability) {
                        if seen.insert(agent.id.clone()) {
                            ids.push(agent.id);
                        }
                    }
                }
                w.assigned_agents = ids;
                w.metadata.decision_reasoning = Some("fallback capability-based selection".to_string());
            }
        }
    }

    /// Returns true if the workflow is already terminal (failed) after this
    /// phase and the remaining phases should be skipped.
    async fn phase_execute_tasks(&self, wf: &Arc<RwLock<Workflow>>, cancel: &CancelSignal) -> bool {
        let (workflow_type, payload, priority, assigned_agents, escalation_id, n8n_flow_id) = {
            let mut w = wf.write().await;
            w.current_phase = Phase::TaskExecution;
            (
                w.workflow_type.clone(),
                w.payload.clone(),
                w.priority,
                w.assigned_agents.clone(),
                w.metadata.escalation_id.clone(),
                w.metadata.n8n_workflow_id.clone(),
            )
        };

        if let Some(flow_id) = n8n_flow_id {
            return self.execute_external_flow(wf, &flow_id, &payload).await;
        }

        if escalation_id.is_some() {
            let mut w = wf.write().await;
            w.status = WorkflowStatus::Failed;
            w.error = Some("no executor available".to_string());
            w.completed_at = Some(Utc::now());
            return true;
        }

        if assigned_agents.is_empty() {
            let mut w = wf.write().await;
            w.status = WorkflowStatus::Failed;
            w.error = Some("no executor available".to_string());
            w.completed_at = Some(Utc::now());
            return true;
        }

        self.execute_agent_tasks(wf, &workflow_type, &payload, priority, &assigned_agents, cancel)
            .await
    }

    async fn execute_external_flow(&self, wf: &Arc<RwLock<Workflow>>, flow_id: &str, payload: &Value) -> bool {
        let Some(client) = self.inner.automation_client.clone() else {
            let mut w = wf.write().await;
            w.status = WorkflowStatus::Failed;
            w.error = Some("automation client not configured".to_string());
            w.completed_at = Some(Utc::now());
            return true;
        };

        if self.inner.config.dry_run {
            let mut w = wf.write().await;
            w.results.insert("n8n_execution".to_string(), serde_json::json!({"dry_run": true}));
            w.status = WorkflowStatus::Completed;
            return false;
        }

        let flow_id = flow_id.to_string();
        let payload = payload.clone();
        let request_start = std::time::Instant::now();
        let outcome = with_retry(
            &self.inner.automation_breaker,
            self.inner.config.retry_attempts,
            self.inner.config.retry_delay,
            || {
                let client = client.clone();
                let flow_id = flow_id.clone();
                let payload = payload.clone();
                async move { client.execute(&flow_id, &payload).await }
            },
        )
        .await;
        self.inner
            .metrics
            .record_request(request_start.elapsed(), outcome.is_ok());

        let mut w = wf.write().await;
        match outcome {
            Ok(execution) => {
                w.metadata.external_execution_id = Some(execution.execution_id.clone());
                let completed = execution.status == crate::adapters::ExecutionStatus::Completed;
                w.results.insert(
                    "n8n_execution".to_string(),
                    serde_json::json!({
                        "execution_id": execution.execution_id,
                        "status": format!("{:?}", execution.status).to_lowercase(),
                        "result_data": execution.result_data,
                        "error_message": execution.error_message,
                    }),
                );
                if completed {
                    w.status = WorkflowStatus::Completed;
                    false
                } else {
                    w.status = WorkflowStatus::Failed;
                    w.error = execution.error_message.clone();
                    w.completed_at = Some(Utc::now());
                    true
                }
            }
            Err(err) => {
                w.status = WorkflowStatus::Failed;
                w.error = Some(err.to_string());
                w.completed_at = Some(Utc::now());
                true
            }
        }
    }

    fn dispatch_task(&self, task_id: &str, agent_id: &str) {
        if self.inner.config.dry_run {
            info!(task_id = %task_id, agent_id = %agent_id, "dry run: skipping task dispatch");
            return;
        }
        if self.inner.queue.assign(task_id, agent_id).is_err() {
            return;
        }
        if self.inner.queue.start(task_id).is_err() {
            return;
        }
        let Some(task) = self.inner.queue.status(task_id) else { return };
        let engine = self.clone();
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let adapter = engine.inner.agent_adapters.read().await.get(&agent_id).cloned();
            if let Some(adapter) = adapter {
                let (result, error) = adapter.execute(&task.task_type, &task.payload).await;
                let _ = engine.inner.queue.complete(&task_id, result, error);
            }
        });
    }

    async fn wait_for_terminal(&self, task_id: &str, cancel: &CancelSignal) -> Option<Task> {
        loop {
            if cancel.is_set() {
                return self.inner.queue.status(task_id);
            }
            let snapshot = self.inner.queue.status(task_id)?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            cancel.sleep_or_cancelled(self.inner.config.task_poll_interval).await;
        }
    }

    async fn execute_agent_tasks(
        &self,
        wf: &Arc<RwLock<Workflow>>,
        workflow_type: &str,
        payload: &Value,
        priority: Priority,
        assigned_agents: &[String],
        cancel: &CancelSignal,
    ) -> bool {
        let template = template_for(workflow_type);
        let mut agent_cursor = 0usize;
        let next_agent = |cursor: &mut usize| {
            let agent = assigned_agents[*cursor % assigned_agents.len()].clone();
            *cursor += 1;
            agent
        };

        if template.parallel {
            let mut pending = Vec::new();
            for step in &template.steps {
                let task = Task::new(step.task_type, build_payload(step, payload, None), priority);
                let id = self.inner.queue.enqueue(task);
                { wf.write().await.tasks.push(id.clone()); }
                self.dispatch_task(&id, &next_agent(&mut agent_cursor));
                pending.push(id);
            }
            // Wait out every step concurrently rather than one at a time,
            // matching the spawned-simulation join pattern used elsewhere in
            // this codebase for independent concurrent work.
            let waits = pending.iter().map(|id| self.wait_for_terminal(id, cancel));
            futures::future::join_all(waits).await;
        } else {
            let mut prev_result: Option<Value> = None;
            for step in &template.steps {
                if cancel.is_set() {
                    break;
                }
                let task_payload = build_payload(step, payload, prev_result.as_ref());
                let task = Task::new(step.task_type, task_payload, priority);
                let id = self.inner.queue.enqueue(task);
                { wf.write().await.tasks.push(id.clone()); }
                self.dispatch_task(&id, &next_agent(&mut agent_cursor));

                let outcome = self.wait_for_terminal(&id, cancel).await;
                if cancel.is_set() {
                    break;
                }
                match outcome {
                    Some(task) if task.status == TaskStatus::Completed => {
                        prev_result = task.result.clone();
                    }
                    Some(task) if task.status == TaskStatus::Failed && template.strict => {
                        let mut w = wf.write().await;
                        w.error = Some(format!(
                            "task {} failed: {}",
                            task.id,
                            task.error.clone().unwrap_or_default()
                        ));
                        drop(w);
                        break;
                    }
                    _ => {}
                }
            }
        }
        false
    }

    async fn phase_process_results(&self, wf: &Arc<RwLock<Workflow>>) {
        let task_ids = {
            let mut w = wf.write().await;
            w.current_phase = Phase::ResultProcessing;
            w.tasks.clone()
        };
        let mut updates = Vec::new();
        for id in task_ids {
            if let Some(task) = self.inner.queue.status(&id) {
                if task.status == TaskStatus::Completed {
                    updates.push((id, task.result.clone().unwrap_or(Value::Null)));
                }
            }
        }
        let mut w = wf.write().await;
        for (id, result) in updates {
            w.results.insert(id, result);
        }
    }

    async fn phase_complete(&self, wf: &Arc<RwLock<Workflow>>) {
        let mut w = wf.write().await;
        w.current_phase = Phase::Completion;
        if !w.status.is_terminal() {
            w.status = if w.error.is_some() { WorkflowStatus::Failed } else { WorkflowStatus::Completed };
        }
        if w.completed_at.is_none() {
            w.completed_at = Some(Utc::now());
        }
        info!(workflow_id = %w.id, status = ?w.status, "workflow reached terminal state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_clamps_and_bumps_for_priority() {
        let mut workflow = Workflow::new("critical", serde_json::json!({}), Priority::Critical, None);
        workflow.id = "w1".to_string();
        assert_eq!(compute_complexity(&workflow), 10);

        let simple = Workflow::new("simple", serde_json::json!({}), Priority::Low, None);
        assert_eq!(compute_complexity(&simple), 2);
    }

    #[test]
    fn business_analysis_template_has_three_sequential_steps() {
        let template = template_for("business_analysis");
        assert_eq!(template.steps.len(), 3);
        assert!(!template.strict);
        assert!(!template.parallel);
        assert_eq!(template.steps[0].task_type, "analyze_portfolio");
    }

    #[test]
    fn unknown_workflow_type_falls_back_to_default_template() {
        let template = template_for("no_such_type");
        assert_eq!(template.steps.len(), 1);
        assert_eq!(template.steps[0].task_type, "execute_workflow");
    }

    #[test]
    fn build_payload_pipes_previous_result_under_named_field() {
        let step = TemplateStep { task_type: "generate_code", source_field: None, prev_field: Some("design") };
        let prev = serde_json::json!({"layout": "grid"});
        let payload = build_payload(&step, &serde_json::json!({}), Some(&prev));
        assert_eq!(payload["design"], prev);
    }
}
