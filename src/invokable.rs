//! # Invokables
//!
//! What a deployed task actually runs. A descriptor only names its code by
//! an invokable identifier; the worker resolves that identifier through an
//! [`InvokableRegistry`], which maps identifiers to factories producing a
//! fresh [`TaskBody`] per task.
//!
//! ```rust
//! use weaveflow::invokable::{InvokableRegistry, TaskContext, TaskResult};
//!
//! let registry = InvokableRegistry::new();
//! registry.register_fn("noop", |_context: TaskContext| async { TaskResult::Ok(()) });
//! assert!(registry.contains("noop"));
//! ```

use crate::deployment::TaskDeploymentDescriptor;
use crate::error::{ExecutionGraphError, Result};
use crate::ids::{ExecutionAttemptId, JobId, JobVertexId};
use crate::sync::{read, write};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Error type returned by task bodies.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of running a task body.
pub type TaskResult = std::result::Result<(), TaskError>;

/// What a task body can see about the task it runs in.
#[derive(Clone, Debug)]
pub struct TaskContext {
  descriptor: Arc<TaskDeploymentDescriptor>,
  cancellation: CancellationToken,
}

impl TaskContext {
  /// Creates a context for the described task.
  pub fn new(descriptor: Arc<TaskDeploymentDescriptor>, cancellation: CancellationToken) -> Self {
    Self {
      descriptor,
      cancellation,
    }
  }

  /// The full deployment descriptor.
  pub fn descriptor(&self) -> &TaskDeploymentDescriptor {
    &self.descriptor
  }

  /// Job of the task.
  pub fn job_id(&self) -> JobId {
    self.descriptor.job_id
  }

  /// Vertex of the task.
  pub fn vertex_id(&self) -> JobVertexId {
    self.descriptor.vertex_id
  }

  /// Attempt being run.
  pub fn attempt_id(&self) -> ExecutionAttemptId {
    self.descriptor.attempt_id
  }

  /// 0-based subtask index.
  pub fn subtask_index(&self) -> usize {
    self.descriptor.index_in_subtask_group
  }

  /// Parallelism of the vertex.
  pub fn number_of_subtasks(&self) -> usize {
    self.descriptor.current_number_of_subtasks
  }

  /// Task name including the subtask position.
  pub fn task_name(&self) -> String {
    self.descriptor.task_name_with_subtask()
  }

  /// Whether the task was asked to stop.
  pub fn is_canceled(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  /// Completes once the task is asked to stop.
  pub async fn canceled(&self) {
    self.cancellation.cancelled().await
  }
}

/// The code a task runs.
///
/// Bodies should return soon after [`TaskContext::canceled`] completes; the
/// task manager also drops a body that keeps running after cancellation.
#[async_trait]
pub trait TaskBody: Send {
  /// Runs the task to completion.
  async fn invoke(&mut self, context: TaskContext) -> TaskResult;
}

struct FnTaskBody<F> {
  body: Arc<F>,
}

#[async_trait]
impl<F, Fut> TaskBody for FnTaskBody<F>
where
  F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = TaskResult> + Send + 'static,
{
  async fn invoke(&mut self, context: TaskContext) -> TaskResult {
    (self.body)(context).await
  }
}

type Factory = Arc<dyn Fn() -> Box<dyn TaskBody> + Send + Sync>;

/// Maps invokable identifiers to task body factories.
#[derive(Default)]
pub struct InvokableRegistry {
  factories: RwLock<HashMap<String, Factory>>,
}

impl InvokableRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a factory. Returns false if it replaced an existing one.
  pub fn register<F>(&self, invokable_id: impl Into<String>, factory: F) -> bool
  where
    F: Fn() -> Box<dyn TaskBody> + Send + Sync + 'static,
  {
    write(&self.factories)
      .insert(invokable_id.into(), Arc::new(factory))
      .is_none()
  }

  /// Registers an async function as task body.
  pub fn register_fn<F, Fut>(&self, invokable_id: impl Into<String>, body: F) -> bool
  where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
  {
    let body = Arc::new(body);
    self.register(invokable_id, move || {
      let task: Box<dyn TaskBody> = Box::new(FnTaskBody {
        body: Arc::clone(&body),
      });
      task
    })
  }

  /// Whether a factory is registered under `invokable_id`.
  pub fn contains(&self, invokable_id: &str) -> bool {
    read(&self.factories).contains_key(invokable_id)
  }

  /// Number of registered factories.
  pub fn len(&self) -> usize {
    read(&self.factories).len()
  }

  /// True when nothing is registered.
  pub fn is_empty(&self) -> bool {
    read(&self.factories).is_empty()
  }

  /// Creates a fresh body for `invokable_id`.
  pub fn instantiate(&self, invokable_id: &str) -> Result<Box<dyn TaskBody>> {
    let factory = read(&self.factories)
      .get(invokable_id)
      .cloned()
      .ok_or_else(|| ExecutionGraphError::UnknownInvokable(invokable_id.to_string()))?;
    Ok(factory())
  }
}

impl std::fmt::Debug for InvokableRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut ids: Vec<String> = read(&self.factories).keys().cloned().collect();
    ids.sort();
    f.debug_struct("InvokableRegistry")
      .field("invokables", &ids)
      .finish()
  }
}

