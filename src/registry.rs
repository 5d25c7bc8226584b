//! Agent Registry
//!
//! Tracks executor identity, declared capabilities, status and a rolling
//! performance score. Guarded by a single reader-writer lock; reads
//! (capability lookups, listings) dominate and writes are short, so
//! `parking_lot::RwLock` is used directly rather than an async lock:
//! registry methods never hold the lock across an `.await`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::error::{OrchestrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Inactive,
    Draining,
}

/// An executor identity as tracked by the registry. Mirrors the four fields
/// the rest of the core actually reads off an agent adapter (`id`,
/// `capabilities`, `status`, `performance_score`); how an adapter routes the
/// corresponding execute call is implementation-defined and lives outside
/// this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: HashSet<String>,
    pub status: AgentStatus,
    pub performance_score: f64,
    pub specialization: Option<String>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Active,
            performance_score: 0.5,
            specialization: None,
        }
    }

    pub fn with_performance_score(mut self, score: f64) -> Self {
        self.performance_score = score;
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specialization = Some(specialization.into());
        self
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    /// capability -> ids of agents declaring it, kept in lockstep with
    /// `agents` so `find_by_capability` stays O(k) in the number of matches
    /// rather than O(n) over every registered agent.
    capability_index: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct AgentRegistry {
    state: parking_lot::RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an agent by id. Double-registration replaces
    /// silently (and is logged) rather than erroring.
    pub fn register(&self, agent: AgentRecord) {
        let mut state = self.state.write();
        if let Some(previous) = state.agents.get(&agent.id) {
            for cap in &previous.capabilities {
                if let Some(ids) = state.capability_index.get_mut(cap) {
                    ids.remove(&agent.id);
                }
            }
            info!(agent_id = %agent.id, "replacing existing agent registration");
        }
        for cap in &agent.capabilities {
            state
                .capability_index
                .entry(cap.clone())
                .or_default()
                .insert(agent.id.clone());
        }
        state.agents.insert(agent.id.clone(), agent);
    }

    /// Removes the agent and every capability-index entry for it. Any
    /// outstanding task assignment to this agent is left untouched; the
    /// scheduler is responsible for skipping reassignment to a gone agent.
    pub fn deregister(&self, id: &str) -> bool {
        let mut state = self.state.write();
        match state.agents.remove(id) {
            Some(agent) => {
                for cap in &agent.capabilities {
                    if let Some(ids) = state.capability_index.get_mut(cap) {
                        ids.remove(id);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.state.read().agents.get(id).cloned()
    }

    /// Snapshot of registered agents, optionally filtered by status. Order
    /// is unspecified.
    pub fn list(&self, status_filter: Option<AgentStatus>) -> Vec<AgentRecord> {
        self.state
            .read()
            .agents
            .values()
            .filter(|a| status_filter.map(|s| a.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Agents declaring `capability` whose status is Active. O(k) in the
    /// number of matches via the capability index.
    pub fn find_by_capability(&self, capability: &str) -> Vec<AgentRecord> {
        let state = self.state.read();
        let Some(ids) = state.capability_index.get(capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.agents.get(id))
            .filter(|a| a.status == AgentStatus::Active)
            .cloned()
            .collect()
    }

    pub fn update_status(&self, id: &str, new_status: AgentStatus) -> Result<()> {
        let mut state = self.state.write();
        match state.agents.get_mut(id) {
            Some(agent) => {
                agent.status = new_status;
                Ok(())
            }
            None => Err(OrchestrationError::NotFound(format!("agent {id}"))),
        }
    }

    pub fn update_performance(&self, id: &str, score: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(OrchestrationError::Validation(format!(
                "performance score {score} out of range [0,1]"
            )));
        }
        let mut state = self.state.write();
        match state.agents.get_mut(id) {
            Some(agent) => {
                agent.performance_score = score;
                Ok(())
            }
            None => {
                warn!(agent_id = id, "update_performance on unknown agent");
                Err(OrchestrationError::NotFound(format!("agent {id}")))
            }
        }
    }
}
