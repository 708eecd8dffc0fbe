//! # Deployment Protocol
//!
//! Messages exchanged between the job side and a worker to start, cancel and
//! report on a task.
//!
//! A [`TaskDeploymentDescriptor`] carries everything a worker needs to start
//! one subtask: which job and vertex it belongs to, which subtask it is, what
//! code to run, and its channel wiring. Wiring is expressed as gates: one
//! output gate per produced data set and one input gate per consumed data set,
//! each holding the ordered channels of that edge.
//!
//! All messages are serde-serializable so a transport can put them on the
//! wire as JSON.

use crate::error::{ExecutionGraphError, Result};
use crate::executiongraph::ExecutionState;
use crate::ids::{ChannelId, ExecutionAttemptId, IntermediateResultId, JobId, JobVertexId};
use crate::jobgraph::DistributionPattern;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinates of one subtask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskRef {
  /// Vertex the subtask belongs to.
  pub vertex_id: JobVertexId,
  /// 0-based subtask index.
  pub subtask_index: usize,
}

impl fmt::Display for SubtaskRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.vertex_id, self.subtask_index)
  }
}

/// One virtual wire between a producer subtask and a consumer subtask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDeploymentDescriptor {
  /// Identity shared by both ends.
  pub channel_id: ChannelId,
  /// Producing end.
  pub producer: SubtaskRef,
  /// Consuming end.
  pub consumer: SubtaskRef,
}

/// The ordered channels of one edge on one side of a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDeploymentDescriptor {
  /// Data set the gate reads or writes.
  pub result_id: IntermediateResultId,
  /// Wiring of the edge.
  pub pattern: DistributionPattern,
  /// Channels in partner subtask order.
  pub channels: Vec<ChannelDeploymentDescriptor>,
}

impl GateDeploymentDescriptor {
  /// The channels of this gate.
  pub fn channels(&self) -> &[ChannelDeploymentDescriptor] {
    &self.channels
  }

  /// Number of channels.
  pub fn number_of_channels(&self) -> usize {
    self.channels.len()
  }
}

/// Everything a worker needs to start one subtask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
  /// Job the task belongs to.
  pub job_id: JobId,
  /// Vertex the task is a subtask of.
  pub vertex_id: JobVertexId,
  /// Attempt being deployed.
  pub attempt_id: ExecutionAttemptId,
  /// Name of the vertex.
  pub task_name: String,
  /// 0-based index of this subtask.
  pub index_in_subtask_group: usize,
  /// Parallelism of the vertex.
  pub current_number_of_subtasks: usize,
  /// Identifier of the code to run.
  pub invokable_id: Option<String>,
  /// Output gates in edge declaration order.
  pub output_gates: Vec<GateDeploymentDescriptor>,
  /// Input gates in edge declaration order.
  pub input_gates: Vec<GateDeploymentDescriptor>,
}

impl TaskDeploymentDescriptor {
  /// Name of the task including its subtask position, e.g. `map (4/10)`.
  pub fn task_name_with_subtask(&self) -> String {
    format!(
      "{} ({}/{})",
      self.task_name,
      self.index_in_subtask_group + 1,
      self.current_number_of_subtasks
    )
  }

  /// Total number of output channels over all output gates.
  pub fn number_of_output_channels(&self) -> usize {
    self
      .output_gates
      .iter()
      .map(GateDeploymentDescriptor::number_of_channels)
      .sum()
  }

  /// Total number of input channels over all input gates.
  pub fn number_of_input_channels(&self) -> usize {
    self
      .input_gates
      .iter()
      .map(GateDeploymentDescriptor::number_of_channels)
      .sum()
  }

  /// Encodes the descriptor for the wire.
  pub fn to_json(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(self).map_err(|e| ExecutionGraphError::DeploymentFailed {
      task: self.task_name_with_subtask(),
      reason: format!("descriptor serialization failed: {}", e),
    })
  }

  /// Decodes a descriptor received from the wire.
  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| ExecutionGraphError::DeploymentFailed {
      task: "<undecodable>".to_string(),
      reason: format!("descriptor deserialization failed: {}", e),
    })
  }
}

/// A worker's answer to a submit or cancel request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOperationResult {
  /// Attempt the request referred to.
  pub attempt_id: ExecutionAttemptId,
  /// Whether the worker performed the operation.
  pub success: bool,
  /// Reason for a refusal.
  pub description: Option<String>,
}

impl TaskOperationResult {
  /// A positive acknowledgement.
  pub fn success(attempt_id: ExecutionAttemptId) -> Self {
    Self {
      attempt_id,
      success: true,
      description: None,
    }
  }

  /// A refusal with a reason.
  pub fn failure(attempt_id: ExecutionAttemptId, description: impl Into<String>) -> Self {
    Self {
      attempt_id,
      success: false,
      description: Some(description.into()),
    }
  }
}

/// A state report sent by a worker about one of its tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionState {
  /// Job of the task.
  pub job_id: JobId,
  /// Attempt the report is about.
  pub attempt_id: ExecutionAttemptId,
  /// State the task reached on the worker.
  pub state: ExecutionState,
  /// Failure description, for `FAILED` reports.
  pub error: Option<String>,
}

impl TaskExecutionState {
  /// Creates a report without an error.
  pub fn new(job_id: JobId, attempt_id: ExecutionAttemptId, state: ExecutionState) -> Self {
    Self {
      job_id,
      attempt_id,
      state,
      error: None,
    }
  }

  /// Creates a `FAILED` report.
  pub fn failed(job_id: JobId, attempt_id: ExecutionAttemptId, error: impl Into<String>) -> Self {
    Self {
      job_id,
      attempt_id,
      state: ExecutionState::Failed,
      error: Some(error.into()),
    }
  }
}
