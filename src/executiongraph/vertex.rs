use super::execution::{AttemptTimeouts, Execution};
use super::job_vertex::VertexTopology;
use super::registry::ExecutionRegistry;
use super::state::ExecutionState;
use crate::error::{ExecutionGraphError, Result};
use crate::ids::{JobId, JobVertexId};
use crate::instance::AllocatedSlot;
use crate::scheduler::ScheduledUnit;
use crate::sync::lock;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One parallel subtask of a job vertex.
///
/// The vertex lives as long as the graph. It always has exactly one current
/// [`Execution`]; a finished attempt can be replaced with a fresh one through
/// [`reset_for_new_execution`](Self::reset_for_new_execution).
pub struct ExecutionVertex {
  topology: Arc<VertexTopology>,
  subtask_index: usize,
  current: Mutex<Arc<Execution>>,
  prior_attempts: Mutex<Vec<Arc<Execution>>>,
  timeouts: AttemptTimeouts,
  registry: Arc<ExecutionRegistry>,
}

impl ExecutionVertex {
  pub(crate) fn new(
    topology: Arc<VertexTopology>,
    subtask_index: usize,
    timeouts: AttemptTimeouts,
    registry: Arc<ExecutionRegistry>,
  ) -> Arc<Self> {
    let first = Execution::new(Arc::clone(&topology), subtask_index, 0, timeouts, &registry);
    Arc::new(Self {
      topology,
      subtask_index,
      current: Mutex::new(first),
      prior_attempts: Mutex::new(Vec::new()),
      timeouts,
      registry,
    })
  }

  /// Job of the subtask.
  pub fn job_id(&self) -> JobId {
    self.topology.job_id
  }

  /// Vertex of the subtask.
  pub fn job_vertex_id(&self) -> JobVertexId {
    self.topology.vertex_id
  }

  /// 0-based subtask index.
  pub fn subtask_index(&self) -> usize {
    self.subtask_index
  }

  /// Parallelism of the job vertex.
  pub fn total_number_of_subtasks(&self) -> usize {
    self.topology.parallelism
  }

  /// Task name including the subtask position.
  pub fn task_name_with_subtask(&self) -> String {
    self.topology.task_name_with_subtask(self.subtask_index)
  }

  /// The current attempt.
  pub fn current_execution(&self) -> Arc<Execution> {
    Arc::clone(&lock(&self.current))
  }

  /// State of the current attempt.
  pub fn execution_state(&self) -> ExecutionState {
    self.current_execution().state()
  }

  /// Slot of the current attempt.
  pub fn current_assigned_slot(&self) -> Option<Arc<AllocatedSlot>> {
    self.current_execution().assigned_slot()
  }

  /// Failure cause of the current attempt.
  pub fn failure_cause(&self) -> Option<ExecutionGraphError> {
    self.current_execution().failure_cause()
  }

  /// Attempts that were replaced, oldest first.
  pub fn prior_executions(&self) -> Vec<Arc<Execution>> {
    lock(&self.prior_attempts).clone()
  }

  pub(crate) fn scheduled_unit(&self) -> ScheduledUnit {
    ScheduledUnit {
      job_id: self.topology.job_id,
      vertex_id: self.topology.vertex_id,
      subtask_index: self.subtask_index,
      task_name: self.task_name_with_subtask(),
    }
  }

  /// Deploys the current attempt to `slot`.
  pub async fn deploy_to_slot(&self, slot: Arc<AllocatedSlot>) -> Result<()> {
    self.current_execution().deploy_to_slot(slot).await
  }

  /// Cancels the current attempt.
  pub async fn cancel(&self) -> Result<()> {
    self.current_execution().cancel().await
  }

  /// Replaces a terminal attempt with a fresh `CREATED` one under a new
  /// attempt id and registers it.
  pub fn reset_for_new_execution(&self) -> Result<Arc<Execution>> {
    let mut current = lock(&self.current);
    let state = current.state();
    if !state.is_terminal() {
      return Err(ExecutionGraphError::illegal_transition(
        self.task_name_with_subtask(),
        state,
        ExecutionState::Created,
      ));
    }

    let next = Execution::new(
      Arc::clone(&self.topology),
      self.subtask_index,
      current.attempt_number() + 1,
      self.timeouts,
      &self.registry,
    );
    self.registry.register(Arc::clone(&next));
    let previous = std::mem::replace(&mut *current, Arc::clone(&next));
    debug!(
      task = %self.task_name_with_subtask(),
      previous = %previous.attempt_id(),
      attempt = %next.attempt_id(),
      "subtask reset for a new attempt"
    );
    lock(&self.prior_attempts).push(previous);
    Ok(next)
  }
}

impl fmt::Debug for ExecutionVertex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionVertex")
      .field("task", &self.task_name_with_subtask())
      .field("state", &self.execution_state())
      .finish()
  }
}
