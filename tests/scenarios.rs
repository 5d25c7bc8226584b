//! End-to-end scenarios for the orchestration core, matching the worked
//! examples in the system's design notes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workflow_orchestrator::{
    AgentAdapter, AgentRecord, AgentRegistry, AgentStatus, CircuitBreakerConfig, DecisionPolicy,
    DefaultDecisionPolicy, ExecutionResult, ExecutionStatus, ExternalFlowRegistry,
    MockAutomationClient, OrchestrationError, OrchestratorConfig, Priority, RouteTarget, TaskQueue,
    TaskStatus, Workflow, WorkflowEngine, WorkflowStatus,
};

struct EchoAdapter;

#[async_trait::async_trait]
impl AgentAdapter for EchoAdapter {
    async fn execute(&self, task_type: &str, payload: &serde_json::Value) -> (Option<serde_json::Value>, Option<String>) {
        (Some(json!({ "task_type": task_type, "echo": payload })), None)
    }
}

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.task_poll_interval = Duration::from_millis(10);
    config.default_workflow_timeout = Duration::from_secs(30);
    config
}

async fn wait_terminal(engine: &WorkflowEngine, workflow_id: &str) -> Workflow {
    for _ in 0..500 {
        if let Some(w) = engine.status(workflow_id).await {
            if w.status != WorkflowStatus::Running && w.status != WorkflowStatus::Pending {
                return w;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {workflow_id} did not reach a terminal state in time");
}

#[tokio::test]
async fn s1_happy_path_agent_route() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(
        AgentRecord::new(
            "A1",
            [
                "Portfolio analysis".to_string(),
                "Financial analysis".to_string(),
                "Data analysis".to_string(),
            ],
        )
        .with_performance_score(0.9),
    );
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let engine = WorkflowEngine::new(fast_config(), registry.clone(), queue.clone(), decision, None, None);
    engine.register_adapter("A1", Arc::new(EchoAdapter)).await;

    let workflow = Workflow::new(
        "business_analysis",
        json!({"businesses": [{"id": 1}]}),
        Priority::Normal,
        None,
    );
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(final_state.assigned_agents, vec!["A1".to_string()]);
    assert_eq!(final_state.tasks.len(), 3);
    assert_eq!(final_state.results.len(), 3);

    for task_id in &final_state.tasks {
        let task = queue.status(task_id).unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("A1"));
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn s2_external_flow_route() {
    let registry = Arc::new(AgentRegistry::new());
    let queue = Arc::new(TaskQueue::new());
    let mut flows = ExternalFlowRegistry::new();
    flows.register("automation", "n8n-42");
    let decision = Arc::new(DefaultDecisionPolicy::new(flows));

    let client = Arc::new(MockAutomationClient::new());
    client.stub(
        "n8n-42",
        ExecutionResult {
            execution_id: "exec-1".to_string(),
            status: ExecutionStatus::Completed,
            result_data: Some(json!({"ok": true})),
            error_message: None,
        },
    );

    let engine = WorkflowEngine::new(
        fast_config(),
        registry,
        queue,
        decision,
        Some(client),
        None,
    );

    let workflow = Workflow::new("automation", json!({"target": "example.com"}), Priority::Normal, None);
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;

    assert!(final_state.assigned_agents.is_empty());
    assert_eq!(final_state.metadata.n8n_workflow_id.as_deref(), Some("n8n-42"));
    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(
        final_state.results["n8n_execution"]["status"],
        json!("completed")
    );
}

#[tokio::test]
async fn s3_human_escalation() {
    let registry = Arc::new(AgentRegistry::new());
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let engine = WorkflowEngine::new(fast_config(), registry, queue, decision, None, None);

    let workflow = Workflow::new("business_analysis", json!({}), Priority::Normal, None);
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;

    assert!(final_state.metadata.escalation_id.is_some());
    assert_eq!(final_state.status, WorkflowStatus::Failed);
    assert_eq!(final_state.error.as_deref(), Some("no executor available"));
}

struct SlowAdapter {
    delay: Duration,
}

#[async_trait::async_trait]
impl AgentAdapter for SlowAdapter {
    async fn execute(&self, task_type: &str, payload: &serde_json::Value) -> (Option<serde_json::Value>, Option<String>) {
        tokio::time::sleep(self.delay).await;
        (Some(json!({ "task_type": task_type, "echo": payload })), None)
    }
}

#[tokio::test]
async fn s4_cancellation_mid_execution() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(
        AgentRecord::new(
            "A1",
            [
                "Portfolio analysis".to_string(),
                "Financial analysis".to_string(),
                "Data analysis".to_string(),
            ],
        )
        .with_performance_score(0.9),
    );
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let engine = WorkflowEngine::new(fast_config(), registry, queue.clone(), decision, None, None);
    engine
        .register_adapter("A1", Arc::new(SlowAdapter { delay: Duration::from_millis(50) }))
        .await;

    let workflow = Workflow::new(
        "business_analysis",
        json!({"businesses": [{"id": 1}]}),
        Priority::Normal,
        None,
    );
    let id = engine.start(workflow).await.unwrap();

    // Wait for the first task to complete, then cancel.
    loop {
        if let Some(w) = engine.status(&id).await {
            if !w.tasks.is_empty() {
                if let Some(first) = queue.status(&w.tasks[0]) {
                    if first.status == TaskStatus::Completed {
                        break;
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(engine.cancel(&id).await);

    let final_state = wait_terminal(&engine, &id).await;
    assert_eq!(final_state.status, WorkflowStatus::Cancelled);

    let first_task = queue.status(&final_state.tasks[0]).unwrap();
    assert_eq!(first_task.status, TaskStatus::Completed);

    let has_cancelled_remainder = final_state.tasks[1..]
        .iter()
        .filter_map(|id| queue.status(id))
        .any(|t| t.status == TaskStatus::Cancelled);
    assert!(has_cancelled_remainder);
}

#[tokio::test]
async fn s5_circuit_opens_then_recovers() {
    use workflow_orchestrator::{with_retry, CircuitBreaker};

    let breaker = CircuitBreaker::new(
        "external",
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(50),
        },
    );

    for _ in 0..5 {
        let result: workflow_orchestrator::Result<()> =
            with_retry(&breaker, 1, Duration::from_millis(1), || async {
                Err(OrchestrationError::Dependency("external failure".to_string()))
            })
            .await;
        assert!(result.is_err());
    }

    let rejected: workflow_orchestrator::Result<()> =
        with_retry(&breaker, 1, Duration::from_millis(1), || async { Ok(()) }).await;
    assert!(matches!(rejected, Err(OrchestrationError::CircuitOpen(_))));

    tokio::time::sleep(Duration::from_millis(60)).await;

    let admitted: workflow_orchestrator::Result<()> =
        with_retry(&breaker, 1, Duration::from_millis(1), || async { Ok(()) }).await;
    assert!(admitted.is_ok());
}

#[tokio::test]
async fn s6_priority_ordering_for_same_agent() {
    let queue = TaskQueue::new();
    let t1 = workflow_orchestrator::Task::new("noop", json!({}), Priority::Normal);
    let t1_id = queue.enqueue(t1);
    let t2 = workflow_orchestrator::Task::new("noop", json!({}), Priority::Critical);
    let t2_id = queue.enqueue(t2);

    queue.assign(&t1_id, "agent-1").unwrap();
    queue.assign(&t2_id, "agent-1").unwrap();

    let next = queue.next_for_agent("agent-1").unwrap();
    assert_eq!(next.id, t2_id);
}

#[tokio::test]
async fn decision_layer_failure_falls_back_to_capability_selection() {
    struct FailingPolicy;
    impl DecisionPolicy for FailingPolicy {
        fn decide(
            &self,
            _workflow: &Workflow,
            _candidates: &[AgentRecord],
            _memory_context: Option<&workflow_orchestrator::MemoryContext>,
        ) -> workflow_orchestrator::Result<workflow_orchestrator::DecisionResult> {
            Err(OrchestrationError::Dependency("decision engine unreachable".to_string()))
        }
    }

    let registry = Arc::new(AgentRegistry::new());
    registry.register(AgentRecord::new(
        "A1",
        [
            "Portfolio analysis".to_string(),
            "Financial analysis".to_string(),
            "Data analysis".to_string(),
        ],
    ));
    let queue = Arc::new(TaskQueue::new());
    let engine = WorkflowEngine::new(fast_config(), registry, queue, Arc::new(FailingPolicy), None, None);
    engine.register_adapter("A1", Arc::new(EchoAdapter)).await;

    let workflow = Workflow::new("business_analysis", json!({"businesses": []}), Priority::Normal, None);
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(final_state.assigned_agents, vec!["A1".to_string()]);
}

struct FailOnTaskType {
    failing_task_type: &'static str,
}

#[async_trait::async_trait]
impl AgentAdapter for FailOnTaskType {
    async fn execute(&self, task_type: &str, payload: &serde_json::Value) -> (Option<serde_json::Value>, Option<String>) {
        if task_type == self.failing_task_type {
            (None, Some("boom".to_string()))
        } else {
            (Some(json!({ "task_type": task_type, "echo": payload })), None)
        }
    }
}

#[tokio::test]
async fn strict_template_aggregates_completed_results_before_failing() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(
        AgentRecord::new(
            "A1",
            [
                "Project management".to_string(),
                "Interface design".to_string(),
                "Code generation".to_string(),
                "Quality assurance".to_string(),
            ],
        )
        .with_performance_score(0.9),
    );
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let engine = WorkflowEngine::new(fast_config(), registry, queue.clone(), decision, None, None);
    engine
        .register_adapter("A1", Arc::new(FailOnTaskType { failing_task_type: "design_interface" }))
        .await;

    let workflow = Workflow::new(
        "site_recreation",
        json!({"url": "example.com", "requirements": {}}),
        Priority::Normal,
        None,
    );
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;

    assert_eq!(final_state.status, WorkflowStatus::Failed);
    assert!(final_state.error.as_deref().unwrap_or_default().contains("failed"));
    // Only the first (analyze_site) step ran to completion before the
    // strict template stopped at the second step's failure.
    assert_eq!(final_state.tasks.len(), 2);
    assert_eq!(final_state.results.len(), 1);
}

#[tokio::test]
async fn max_concurrent_operations_rejects_once_saturated() {
    let registry = Arc::new(AgentRegistry::new());
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let mut config = fast_config();
    config.max_concurrent_operations = 1;
    let engine = WorkflowEngine::new(config, registry, queue, decision, None, None);

    let first = Workflow::new("business_analysis", json!({}), Priority::Normal, None);
    engine.start(first).await.unwrap();

    let second = Workflow::new("business_analysis", json!({}), Priority::Normal, None);
    let err = engine.start(second).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));
}

#[tokio::test]
async fn missing_agent_without_flow_ends_failed_not_stuck_pending() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(
        AgentRecord::new("A1", ["Unrelated capability".to_string()]).with_performance_score(0.2),
    );
    registry.update_status("A1", AgentStatus::Draining).unwrap();
    let queue = Arc::new(TaskQueue::new());
    let decision = Arc::new(DefaultDecisionPolicy::new(ExternalFlowRegistry::new()));
    let engine = WorkflowEngine::new(fast_config(), registry, queue, decision, None, None);

    let workflow = Workflow::new("content_creation", json!({}), Priority::Low, None);
    let id = engine.start(workflow).await.unwrap();
    let final_state = wait_terminal(&engine, &id).await;
    assert_eq!(final_state.status, WorkflowStatus::Failed);
}
