//! Decision / Routing Layer
//!
//! Chooses between an internal agent, an external automation flow, or human
//! escalation. The layer is pure: it never mutates the registry or queue,
//! only reads the candidates handed to it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::AgentRecord;
use crate::workflow::Workflow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RouteTarget {
    Agent(String),
    Workflow(String),
    Human(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub target: RouteTarget,
    pub reasoning: String,
    pub confidence: f64,
}

/// Optional context retrieved from the memory/context store, consulted by
/// the decision layer only; absence is tolerated.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub short_term: Option<String>,
    pub long_term: Vec<String>,
}

pub trait DecisionPolicy: Send + Sync {
    /// Evaluates a route for `workflow`. An `Err` here (an attached external
    /// decision engine failing) is not surfaced to the caller of
    /// `WorkflowEngine::start`; the engine falls back to the simple
    /// capability-based selector instead.
    fn decide(
        &self,
        workflow: &Workflow,
        candidates: &[AgentRecord],
        memory_context: Option<&MemoryContext>,
    ) -> Result<DecisionResult>;
}

/// Registered external automation flows, keyed by `workflow_type`. Looked up
/// by the default policy when no active agent candidates exist.
#[derive(Default, Clone)]
pub struct ExternalFlowRegistry {
    flows: std::collections::HashMap<String, String>,
}

impl ExternalFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow_type: impl Into<String>, flow_id: impl Into<String>) {
        self.flows.insert(workflow_type.into(), flow_id.into());
    }

    pub fn get(&self, workflow_type: &str) -> Option<&str> {
        self.flows.get(workflow_type).map(|s| s.as_str())
    }
}

/// Default routing policy used when no external decision engine is
/// attached:
/// 1. No active candidates + a registered external flow for this
///    `workflow_type` -> route to that flow.
/// 2. Candidates exist -> highest `performance_score`, ties broken by
///    lowest id -> route to that agent.
/// 3. Otherwise -> human escalation with a fresh escalation id.
pub struct DefaultDecisionPolicy {
    pub external_flows: ExternalFlowRegistry,
}

impl DefaultDecisionPolicy {
    pub fn new(external_flows: ExternalFlowRegistry) -> Self {
        Self { external_flows }
    }
}

impl DecisionPolicy for DefaultDecisionPolicy {
    fn decide(
        &self,
        workflow: &Workflow,
        candidates: &[AgentRecord],
        _memory_context: Option<&MemoryContext>,
    ) -> Result<DecisionResult> {
        if candidates.is_empty() {
            if let Some(flow_id) = self.external_flows.get(&workflow.workflow_type) {
                return Ok(DecisionResult {
                    target: RouteTarget::Workflow(flow_id.to_string()),
                    reasoning: format!(
                        "no active agent candidates; routing to external flow {flow_id} for workflow type {}",
                        workflow.workflow_type
                    ),
                    confidence: 0.7,
                });
            }

            let escalation_id = Uuid::new_v4().to_string();
            return Ok(DecisionResult {
                target: RouteTarget::Human(escalation_id),
                reasoning: "no active agent candidates and no external flow registered".to_string(),
                confidence: 0.0,
            });
        }

        let best = candidates
            .iter()
            .max_by(|a, b| {
                a.performance_score
                    .partial_cmp(&b.performance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .expect("candidates is non-empty");

        Ok(DecisionResult {
            target: RouteTarget::Agent(best.id.clone()),
            reasoning: format!(
                "selected agent {} with performance score {:.2}",
                best.id, best.performance_score
            ),
            confidence: best.performance_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use crate::registry::AgentRecord;

    fn workflow(workflow_type: &str) -> Workflow {
        Workflow::new(workflow_type, serde_json::json!({}), Priority::Normal, None)
    }

    #[test]
    fn picks_highest_performance_ties_broken_by_lowest_id() {
        let policy = DefaultDecisionPolicy::new(ExternalFlowRegistry::new());
        let candidates = vec![
            AgentRecord::new("b", ["x".to_string()]).with_performance_score(0.9),
            AgentRecord::new("a", ["x".to_string()]).with_performance_score(0.9),
        ];
        let decision = policy
            .decide(&workflow("business_analysis"), &candidates, None)
            .unwrap();
        assert_eq!(decision.target, RouteTarget::Agent("a".to_string()));
    }

    #[test]
    fn routes_to_external_flow_when_no_candidates() {
        let mut flows = ExternalFlowRegistry::new();
        flows.register("automation", "n8n-42");
        let policy = DefaultDecisionPolicy::new(flows);
        let decision = policy.decide(&workflow("automation"), &[], None).unwrap();
        assert_eq!(decision.target, RouteTarget::Workflow("n8n-42".to_string()));
        assert_eq!(decision.confidence, 0.7);
    }

    #[test]
    fn escalates_to_human_when_no_candidates_and_no_flow() {
        let policy = DefaultDecisionPolicy::new(ExternalFlowRegistry::new());
        let decision = policy
            .decide(&workflow("business_analysis"), &[], None)
            .unwrap();
        match decision.target {
            RouteTarget::Human(id) => assert!(!id.is_empty()),
            other => panic!("expected human escalation, got {other:?}"),
        }
        assert_eq!(decision.confidence, 0.0);
    }
}
