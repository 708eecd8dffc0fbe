//! Per-vertex topology and deployment descriptor construction.

use super::execution::Execution;
use super::intermediate_result::{IntermediateResult, consumer_indices, producer_indices};
use super::state::ExecutionState;
use super::vertex::ExecutionVertex;
use crate::deployment::{
  ChannelDeploymentDescriptor, GateDeploymentDescriptor, SubtaskRef, TaskDeploymentDescriptor,
};
use crate::ids::{ChannelId, ExecutionAttemptId, JobId, JobVertexId};
use crate::sync::read;
use std::sync::{Arc, RwLock};

/// The part of a job vertex every subtask and attempt needs to see.
///
/// Inputs are fixed when the vertex is attached. Produced results grow when
/// later attach calls add consumers.
#[derive(Debug)]
pub(crate) struct VertexTopology {
  pub(crate) job_id: JobId,
  pub(crate) vertex_id: JobVertexId,
  pub(crate) name: String,
  pub(crate) invokable_id: Option<String>,
  pub(crate) parallelism: usize,
  pub(crate) inputs: Vec<Arc<IntermediateResult>>,
  pub(crate) produced: RwLock<Vec<Arc<IntermediateResult>>>,
}

impl VertexTopology {
  pub(crate) fn task_name_with_subtask(&self, subtask_index: usize) -> String {
    format!("{} ({}/{})", self.name, subtask_index + 1, self.parallelism)
  }

  pub(crate) fn deployment_descriptor(
    &self,
    subtask_index: usize,
    attempt_id: ExecutionAttemptId,
  ) -> TaskDeploymentDescriptor {
    let output_gates = read(&self.produced)
      .iter()
      .map(|result| self.output_gate(result, subtask_index))
      .collect();
    let input_gates = self
      .inputs
      .iter()
      .map(|result| self.input_gate(result, subtask_index))
      .collect();

    TaskDeploymentDescriptor {
      job_id: self.job_id,
      vertex_id: self.vertex_id,
      attempt_id,
      task_name: self.name.clone(),
      index_in_subtask_group: subtask_index,
      current_number_of_subtasks: self.parallelism,
      invokable_id: self.invokable_id.clone(),
      output_gates,
      input_gates,
    }
  }

  fn output_gate(&self, result: &IntermediateResult, producer_index: usize) -> GateDeploymentDescriptor {
    let channels = consumer_indices(
      result.pattern(),
      producer_index,
      result.producer_parallelism(),
      result.consumer_parallelism(),
    )
    .map(|consumer_index| channel(result, producer_index, consumer_index))
    .collect();
    GateDeploymentDescriptor {
      result_id: result.id(),
      pattern: result.pattern(),
      channels,
    }
  }

  fn input_gate(&self, result: &IntermediateResult, consumer_index: usize) -> GateDeploymentDescriptor {
    let channels = producer_indices(
      result.pattern(),
      consumer_index,
      result.producer_parallelism(),
      result.consumer_parallelism(),
    )
    .map(|producer_index| channel(result, producer_index, consumer_index))
    .collect();
    GateDeploymentDescriptor {
      result_id: result.id(),
      pattern: result.pattern(),
      channels,
    }
  }
}

fn channel(
  result: &IntermediateResult,
  producer_index: usize,
  consumer_index: usize,
) -> ChannelDeploymentDescriptor {
  ChannelDeploymentDescriptor {
    channel_id: ChannelId {
      result: result.id(),
      producer_index,
      consumer_index,
    },
    producer: SubtaskRef {
      vertex_id: result.producer(),
      subtask_index: producer_index,
    },
    consumer: SubtaskRef {
      vertex_id: result.consumer(),
      subtask_index: consumer_index,
    },
  }
}

/// All parallel subtasks of one job vertex.
#[derive(Debug)]
pub struct ExecutionJobVertex {
  topology: Arc<VertexTopology>,
  task_vertices: Vec<Arc<ExecutionVertex>>,
}

impl ExecutionJobVertex {
  pub(crate) fn new(topology: Arc<VertexTopology>, task_vertices: Vec<Arc<ExecutionVertex>>) -> Self {
    Self {
      topology,
      task_vertices,
    }
  }

  pub(crate) fn topology(&self) -> &Arc<VertexTopology> {
    &self.topology
  }

  /// Id of the job vertex.
  pub fn id(&self) -> JobVertexId {
    self.topology.vertex_id
  }

  /// Name of the job vertex.
  pub fn name(&self) -> &str {
    &self.topology.name
  }

  /// Number of parallel subtasks.
  pub fn parallelism(&self) -> usize {
    self.topology.parallelism
  }

  /// Identifier of the code the subtasks run.
  pub fn invokable_id(&self) -> Option<&str> {
    self.topology.invokable_id.as_deref()
  }

  /// Subtasks in index order.
  pub fn task_vertices(&self) -> &[Arc<ExecutionVertex>] {
    &self.task_vertices
  }

  /// Results consumed by this vertex, in edge declaration order.
  pub fn inputs(&self) -> &[Arc<IntermediateResult>] {
    &self.topology.inputs
  }

  /// Results produced by this vertex, in the order consumers were attached.
  pub fn produced_data_sets(&self) -> Vec<Arc<IntermediateResult>> {
    read(&self.topology.produced).clone()
  }

  /// Current attempts of all subtasks.
  pub fn current_executions(&self) -> Vec<Arc<Execution>> {
    self
      .task_vertices
      .iter()
      .map(|vertex| vertex.current_execution())
      .collect()
  }

  /// States of all subtasks in index order.
  pub fn subtask_states(&self) -> Vec<ExecutionState> {
    self
      .task_vertices
      .iter()
      .map(|vertex| vertex.execution_state())
      .collect()
  }
}
