//! Graph-wide registry of live execution attempts.
//!
//! The registry maps attempt ids to the [`Execution`]s that have not reached
//! a terminal state yet. Executions insert themselves when the graph creates
//! them and remove themselves on the transition into `FINISHED`, `CANCELED`
//! or `FAILED`, so its size is always the number of live attempts.
//!
//! Inserts happen on the scheduling path while removals happen on arbitrary
//! completion callbacks; the map is a sharded concurrent map so neither side
//! has to take a graph-wide lock.
//!
//! The registry also carries the graph's event channel: every state change of
//! every execution is published as an [`ExecutionEvent`].

use super::execution::Execution;
use super::state::ExecutionState;
use crate::ids::{ExecutionAttemptId, JobId, JobVertexId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A state change of one execution attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
  /// Job of the attempt.
  pub job_id: JobId,
  /// Vertex of the attempt.
  pub vertex_id: JobVertexId,
  /// Subtask index of the attempt.
  pub subtask_index: usize,
  /// The attempt.
  pub attempt_id: ExecutionAttemptId,
  /// State before the change.
  pub previous: ExecutionState,
  /// State after the change.
  pub current: ExecutionState,
  /// Failure cause, for transitions into `FAILED`.
  pub cause: Option<String>,
  /// When the change happened.
  pub timestamp: DateTime<Utc>,
}

/// Live attempts of one job, keyed by attempt id.
pub struct ExecutionRegistry {
  job_id: JobId,
  executions: DashMap<ExecutionAttemptId, Arc<Execution>>,
  events: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionRegistry {
  pub(crate) fn new(job_id: JobId, event_buffer: usize) -> Arc<Self> {
    let (events, _) = broadcast::channel(event_buffer.max(1));
    Arc::new(Self {
      job_id,
      executions: DashMap::new(),
      events,
    })
  }

  /// Job the registry belongs to.
  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  pub(crate) fn register(&self, execution: Arc<Execution>) -> bool {
    match self.executions.entry(execution.attempt_id()) {
      Entry::Occupied(_) => false,
      Entry::Vacant(slot) => {
        slot.insert(execution);
        true
      }
    }
  }

  pub(crate) fn deregister(&self, attempt_id: ExecutionAttemptId) -> Option<Arc<Execution>> {
    self.executions.remove(&attempt_id).map(|(_, execution)| execution)
  }

  /// Looks up a live attempt.
  pub fn get(&self, attempt_id: ExecutionAttemptId) -> Option<Arc<Execution>> {
    self
      .executions
      .get(&attempt_id)
      .map(|entry| Arc::clone(entry.value()))
  }

  /// Whether the attempt is live.
  pub fn contains(&self, attempt_id: ExecutionAttemptId) -> bool {
    self.executions.contains_key(&attempt_id)
  }

  /// Number of live attempts.
  pub fn len(&self) -> usize {
    self.executions.len()
  }

  /// True when no attempt is live.
  pub fn is_empty(&self) -> bool {
    self.executions.is_empty()
  }

  /// Snapshot of all live attempts.
  pub fn live_executions(&self) -> Vec<Arc<Execution>> {
    self
      .executions
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect()
  }

  /// Ids of all live attempts.
  pub fn attempt_ids(&self) -> Vec<ExecutionAttemptId> {
    self.executions.iter().map(|entry| *entry.key()).collect()
  }

  /// Subscribes to execution state changes published after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
    self.events.subscribe()
  }

  pub(crate) fn publish(&self, event: ExecutionEvent) {
    // no subscribers is fine
    let _ = self.events.send(event);
  }
}

impl std::fmt::Debug for ExecutionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionRegistry")
      .field("job_id", &self.job_id)
      .field("live", &self.executions.len())
      .finish()
  }
}
