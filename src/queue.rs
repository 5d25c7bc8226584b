//! Task Queue
//!
//! Owns tasks exclusively; workflows reference them by id only. A single
//! lock guards the status map and the priority index, matching the "single
//! reader-writer lock" resource policy: operations other than the ordered
//! snapshot are O(1) map lookups.

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Ordering key for the pending-task priority index: higher priority class
/// first, then earlier `created_at` (FIFO within a class), then
/// lexicographically smaller id to make ties deterministic in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderKey {
    priority: Priority,
    created_at: DateTime<Utc>,
    id: String,
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    pending_order: PriorityQueue<String, OrderKey>,
}

#[derive(Default)]
pub struct TaskQueue {
    state: parking_lot::RwLock<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an id if unset, places the task PENDING in its priority
    /// bucket, and returns the id.
    pub fn enqueue(&self, mut task: Task) -> String {
        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        task.status = TaskStatus::Pending;
        let key = OrderKey {
            priority: task.priority,
            created_at: task.created_at,
            id: task.id.clone(),
        };
        let id = task.id.clone();
        let mut state = self.state.write();
        state.pending_order.push(id.clone(), key);
        state.tasks.insert(id.clone(), task);
        info!(task_id = %id, "task enqueued");
        id
    }

    pub fn assign(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestrationError::IllegalTransition(format!(
                "cannot assign task {task_id} in status {:?}",
                task.status
            )));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id.to_string());
        state.pending_order.remove(task_id);
        Ok(())
    }

    pub fn start(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Assigned {
            return Err(OrchestrationError::IllegalTransition(format!(
                "cannot start task {task_id} in status {:?}",
                task.status
            )));
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transitions RUNNING -> COMPLETED if `error` is `None`, else -> FAILED.
    /// Idempotent-reject on a task already in a terminal state.
    pub fn complete(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("task {task_id}")))?;
        if task.status.is_terminal() {
            return Err(OrchestrationError::IllegalTransition(format!(
                "task {task_id} already terminal ({:?})",
                task.status
            )));
        }
        if task.status != TaskStatus::Running {
            return Err(OrchestrationError::IllegalTransition(format!(
                "cannot complete task {task_id} in status {:?}",
                task.status
            )));
        }
        task.status = match &error {
            Some(_) => TaskStatus::Failed,
            None => TaskStatus::Completed,
        };
        task.result = result;
        task.error = error;
        task.completed_at = Some(Utc::now());
        if task.status == TaskStatus::Failed {
            warn!(task_id = %task_id, "task failed");
        }
        Ok(())
    }

    /// Cancels any non-terminal task. Returns false if already terminal or
    /// unknown.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.state.write();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        state.pending_order.remove(task_id);
        true
    }

    pub fn status(&self, task_id: &str) -> Option<Task> {
        self.state.read().tasks.get(task_id).cloned()
    }

    /// Highest-priority task currently ASSIGNED to `agent_id`.
    pub fn next_for_agent(&self, agent_id: &str) -> Option<Task> {
        self.state
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Assigned && t.assigned_agent.as_deref() == Some(agent_id))
            .max_by(|a, b| {
                let ka = OrderKey {
                    priority: a.priority,
                    created_at: a.created_at,
                    id: a.id.clone(),
                };
                let kb = OrderKey {
                    priority: b.priority,
                    created_at: b.created_at,
                    id: b.id.clone(),
                };
                ka.cmp(&kb)
            })
            .cloned()
    }

    /// Highest-priority PENDING task without removing it from the index.
    pub fn peek_next_pending(&self) -> Option<Task> {
        let state = self.state.read();
        let (id, _) = state.pending_order.peek()?;
        state.tasks.get(id).cloned()
    }

    pub fn list(&self, status_filter: Option<TaskStatus>) -> Vec<Task> {
        self.state
            .read()
            .tasks
            .values()
            .filter(|t| status_filter.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority) -> Task {
        Task::new("noop", serde_json::json!({}), priority)
    }

    #[test]
    fn priority_law_critical_before_normal() {
        let queue = TaskQueue::new();
        let t1 = task(Priority::Normal);
        queue.enqueue(t1);
        let t2 = task(Priority::Critical);
        let t2_id = t2.id.clone();
        queue.enqueue(t2);

        let next = queue.peek_next_pending().unwrap();
        assert_eq!(next.id, t2_id);
    }

    #[test]
    fn state_machine_happy_path() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(task(Priority::Normal));
        queue.assign(&id, "agent-1").unwrap();
        queue.start(&id).unwrap();
        queue.complete(&id, Some(serde_json::json!("ok")), None).unwrap();

        let snapshot = queue.status(&id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_rejected() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(task(Priority::Normal));
        assert!(queue.start(&id).is_err());
    }

    #[test]
    fn terminal_state_is_immutable_to_further_completion() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(task(Priority::Normal));
        queue.assign(&id, "agent-1").unwrap();
        queue.start(&id).unwrap();
        queue.complete(&id, None, Some("boom".into())).unwrap();
        assert!(queue.complete(&id, None, None).is_err());
        assert!(!queue.cancel(&id));
    }

    #[test]
    fn cancel_from_pending_succeeds_once() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(task(Priority::Low));
        assert!(queue.cancel(&id));
        assert!(!queue.cancel(&id));
        assert_eq!(queue.status(&id).unwrap().status, TaskStatus::Cancelled);
    }
}
