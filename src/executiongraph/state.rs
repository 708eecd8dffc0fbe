//! Execution and job states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one execution attempt.
///
/// ```text
/// CREATED -> SCHEDULED -> DEPLOYING -> RUNNING -> FINISHED
///                 \            \          \
///                  +------------+----------+--> CANCELING -> CANCELED
///
/// any non-terminal state --> FAILED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ExecutionState {
  /// Attempt allocated, no slot bound.
  Created = 0,
  /// Slot bound, deployment not yet sent.
  Scheduled = 1,
  /// Deployment sent, awaiting the worker's acknowledgement.
  Deploying = 2,
  /// Acknowledged by the worker.
  Running = 3,
  /// Completed normally.
  Finished = 4,
  /// Cancellation requested, awaiting confirmation.
  Canceling = 5,
  /// Cancellation confirmed.
  Canceled = 6,
  /// Failed locally or on the worker.
  Failed = 7,
}

impl ExecutionState {
  /// All states, in discriminant order.
  pub const ALL: [ExecutionState; 8] = [
    ExecutionState::Created,
    ExecutionState::Scheduled,
    ExecutionState::Deploying,
    ExecutionState::Running,
    ExecutionState::Finished,
    ExecutionState::Canceling,
    ExecutionState::Canceled,
    ExecutionState::Failed,
  ];

  /// Terminal states are never left again.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      ExecutionState::Finished | ExecutionState::Canceled | ExecutionState::Failed
    )
  }

  pub(crate) const fn as_u8(self) -> u8 {
    self as u8
  }

  pub(crate) fn from_u8(raw: u8) -> Self {
    Self::ALL[usize::from(raw) % Self::ALL.len()]
  }
}

impl fmt::Display for ExecutionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ExecutionState::Created => "CREATED",
      ExecutionState::Scheduled => "SCHEDULED",
      ExecutionState::Deploying => "DEPLOYING",
      ExecutionState::Running => "RUNNING",
      ExecutionState::Finished => "FINISHED",
      ExecutionState::Canceling => "CANCELING",
      ExecutionState::Canceled => "CANCELED",
      ExecutionState::Failed => "FAILED",
    };
    f.write_str(name)
  }
}

/// Aggregated status of a whole job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  /// Attached but never scheduled.
  Created,
  /// At least one scheduling pass has started.
  Running,
  /// Every subtask finished.
  Finished,
  /// Cancellation requested, some subtasks still live.
  Canceling,
  /// Cancellation requested and every subtask reached a terminal state.
  Canceled,
  /// A subtask failed and others are still live.
  Failing,
  /// A subtask failed and every subtask reached a terminal state.
  Failed,
}

impl JobStatus {
  /// Terminal job states.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed
    )
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      JobStatus::Created => "CREATED",
      JobStatus::Running => "RUNNING",
      JobStatus::Finished => "FINISHED",
      JobStatus::Canceling => "CANCELING",
      JobStatus::Canceled => "CANCELED",
      JobStatus::Failing => "FAILING",
      JobStatus::Failed => "FAILED",
    };
    f.write_str(name)
  }
}
