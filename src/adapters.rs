//! External interfaces consumed by the core.
//!
//! These traits are the entirety of what the core depends on from the
//! outside world; concrete transports (HTTP, gRPC, an in-process mock) are
//! implementation details left to whoever wires the engine together.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
}

/// The external automation platform, addressed by flow id. Expected to be
/// idempotent on `(flow_id, payload)`; the core assumes at-most-once
/// semantics and records whatever status comes back.
#[async_trait]
pub trait AutomationClient: Send + Sync {
    async fn execute(&self, flow_id: &str, payload: &Value) -> Result<ExecutionResult>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRetrieval {
    pub short_term: Option<String>,
    pub long_term: Vec<String>,
}

/// Optional memory/context store consulted only by the decision layer.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn retrieve(
        &self,
        agent_id: &str,
        context_keys: &[String],
        semantic_query: &str,
    ) -> Result<MemoryRetrieval>;
}

/// An executor. The core reads only `id`/`capabilities`/`status`/
/// `performance_score` off the corresponding [`crate::registry::AgentRecord`];
/// this trait is the separate, weakly-referenced execute call the task
/// queue's assignment mechanism invokes; actual transport (in-process,
/// RPC, subprocess) is implementation-defined.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn execute(&self, task_type: &str, payload: &Value) -> (Option<Value>, Option<String>);
}

/// Agent adapter that echoes a canned result for any task type. Useful for
/// tests and for wiring up an agent before its real execution logic lands.
pub struct MockAgentAdapter {
    result: Value,
}

impl MockAgentAdapter {
    pub fn new(result: Value) -> Self {
        Self { result }
    }
}

#[async_trait]
impl AgentAdapter for MockAgentAdapter {
    async fn execute(&self, _task_type: &str, _payload: &Value) -> (Option<Value>, Option<String>) {
        (Some(self.result.clone()), None)
    }
}

/// HTTP-backed [`AutomationClient`] for a platform exposing a
/// `POST {base_url}/flows/{flow_id}/execute` endpoint. One of several
/// possible transports; callers needing a different wire protocol implement
/// the trait directly.
pub struct HttpAutomationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAutomationClient {
    pub fn new(base_url: impl Into<String>, request_timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AutomationClient for HttpAutomationClient {
    async fn execute(&self, flow_id: &str, payload: &Value) -> Result<ExecutionResult> {
        let url = format!("{}/flows/{}/execute", self.base_url, flow_id);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| crate::error::OrchestrationError::Dependency(e.to_string()))?;

        response
            .json::<ExecutionResult>()
            .await
            .map_err(|e| crate::error::OrchestrationError::Dependency(e.to_string()))
    }
}

/// Deterministic in-memory automation client for tests and local
/// development: returns a canned [`ExecutionResult`] per flow id.
#[derive(Default)]
pub struct MockAutomationClient {
    responses: parking_lot::Mutex<HashMap<String, ExecutionResult>>,
}

impl MockAutomationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub(&self, flow_id: impl Into<String>, result: ExecutionResult) {
        self.responses.lock().insert(flow_id.into(), result);
    }
}

#[async_trait]
impl AutomationClient for MockAutomationClient {
    async fn execute(&self, flow_id: &str, _payload: &Value) -> Result<ExecutionResult> {
        Ok(self
            .responses
            .lock()
            .get(flow_id)
            .cloned()
            .unwrap_or(ExecutionResult {
                execution_id: uuid::Uuid::new_v4().to_string(),
                status: ExecutionStatus::Completed,
                result_data: None,
                error_message: None,
            }))
    }
}

/// Memory store that always reports no context. The default when no
/// external memory/context service is attached.
#[derive(Default)]
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn retrieve(
        &self,
        _agent_id: &str,
        _context_keys: &[String],
        _semantic_query: &str,
    ) -> Result<MemoryRetrieval> {
        Ok(MemoryRetrieval::default())
    }
}
