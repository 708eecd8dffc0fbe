//! # Error Handling
//!
//! Error types for building, scheduling, deploying and tracking an execution
//! graph.
//!
//! Errors fall into three groups, each with its own propagation scope:
//!
//! - **Build errors** ([`InvalidTopology`](ExecutionGraphError::InvalidTopology),
//!   [`DuplicateVertex`](ExecutionGraphError::DuplicateVertex),
//!   [`IncompatibleParallelism`](ExecutionGraphError::IncompatibleParallelism))
//!   abort `attach_job_graph` as a whole. Nothing of the failed call is left
//!   attached.
//! - **Scheduling errors** ([`NotEnoughSlots`](ExecutionGraphError::NotEnoughSlots))
//!   abort the current scheduling pass. Slots bound during the pass are
//!   returned to the pool and the graph can be scheduled again. A queued
//!   request that is withdrawn resolves with
//!   [`SlotRequestWithdrawn`](ExecutionGraphError::SlotRequestWithdrawn).
//! - **Execution errors** ([`DeploymentFailed`](ExecutionGraphError::DeploymentFailed),
//!   [`RemoteExecutionFailure`](ExecutionGraphError::RemoteExecutionFailure))
//!   move only the affected execution to `FAILED` and are kept as that
//!   execution's failure cause.
//!
//! A caller that loses a race on an execution's state observes
//! [`IllegalStateTransition`](ExecutionGraphError::IllegalStateTransition) and
//! has to re-read the current state before doing anything else.

use crate::ids::{InstanceId, JobId, JobVertexId};
use crate::instance::GatewayError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExecutionGraphError>;

/// Errors raised by the execution graph, the scheduler and the job manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionGraphError {
  /// The job description cannot be turned into a topology (ordering
  /// violation, cycle, parallelism below one, late attach).
  #[error("invalid job topology: {0}")]
  InvalidTopology(String),

  /// A job vertex with this id is already attached to the graph.
  #[error("job vertex {0} is already attached")]
  DuplicateVertex(JobVertexId),

  /// An instance with this id is already known to the scheduler.
  #[error("instance {0} is already registered")]
  DuplicateInstance(InstanceId),

  /// No free slot was available and queued scheduling is disabled.
  #[error("not enough free slots to schedule {task}: {available} of {total} slots available")]
  NotEnoughSlots {
    /// Task whose slot request could not be served.
    task: String,
    /// Free slots at the time of the request.
    available: usize,
    /// Total slots known to the scheduler.
    total: usize,
  },

  /// A queued slot request was withdrawn before a slot became free, because
  /// its job was canceled or the scheduler queue was cleared.
  #[error("slot request for {task} was withdrawn")]
  SlotRequestWithdrawn {
    /// Task whose slot request was withdrawn.
    task: String,
  },

  /// A pointwise edge connects parallelisms that are neither multiples nor
  /// divisors of each other.
  #[error(
    "incompatible parallelism on pointwise edge {producer} ({producer_parallelism}) -> {consumer} ({consumer_parallelism})"
  )]
  IncompatibleParallelism {
    /// Producing vertex.
    producer: JobVertexId,
    /// Parallelism of the producing vertex.
    producer_parallelism: usize,
    /// Consuming vertex.
    consumer: JobVertexId,
    /// Parallelism of the consuming vertex.
    consumer_parallelism: usize,
  },

  /// The requested transition does not start from the current state.
  #[error("illegal state transition of {entity}: {from} -> {to}")]
  IllegalStateTransition {
    /// The execution or job that rejected the transition.
    entity: String,
    /// State observed when the transition was attempted.
    from: String,
    /// State that was requested.
    to: String,
  },

  /// The worker rejected the deployment, or it did not answer in time.
  #[error("deployment of {task} failed: {reason}")]
  DeploymentFailed {
    /// Task that was being deployed.
    task: String,
    /// Rejection message or timeout description.
    reason: String,
  },

  /// The worker reported a failure after the task had been deployed.
  #[error("task {task} failed on the worker: {reason}")]
  RemoteExecutionFailure {
    /// Task that failed.
    task: String,
    /// Failure description reported by the worker.
    reason: String,
  },

  /// No graph is registered under this job id.
  #[error("unknown job {0}")]
  UnknownJob(JobId),

  /// No task body factory is registered under this invokable identifier.
  #[error("no invokable registered under '{0}'")]
  UnknownInvokable(String),

  /// The transport to a worker failed.
  #[error(transparent)]
  Gateway(#[from] GatewayError),

  /// A configuration document could not be read.
  #[error("configuration error: {0}")]
  Config(String),
}

impl ExecutionGraphError {
  pub(crate) fn illegal_transition(
    entity: impl Into<String>,
    from: impl ToString,
    to: impl ToString,
  ) -> Self {
    ExecutionGraphError::IllegalStateTransition {
      entity: entity.into(),
      from: from.to_string(),
      to: to.to_string(),
    }
  }

  /// Returns true for errors that abort graph construction.
  pub fn is_build_error(&self) -> bool {
    matches!(
      self,
      ExecutionGraphError::InvalidTopology(_)
        | ExecutionGraphError::DuplicateVertex(_)
        | ExecutionGraphError::IncompatibleParallelism { .. }
    )
  }
}
