//! Transport to a worker's task manager.
//!
//! The job side only needs two remote operations: submit a task and cancel
//! it. [`TaskManagerGateway`] abstracts the transport; [`ActorGateway`] is
//! the in-process implementation that talks to a task manager actor over a
//! mailbox and waits for a reply on a oneshot channel.

use crate::deployment::{TaskDeploymentDescriptor, TaskOperationResult};
use crate::ids::ExecutionAttemptId;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
  /// The task manager's mailbox is closed.
  #[error("task manager at {0} is not reachable")]
  Disconnected(String),

  /// The task manager dropped the request without answering.
  #[error("task manager at {0} dropped the request")]
  NoReply(String),

  /// The transport gave up waiting.
  #[error("request to task manager at {0} timed out")]
  Timeout(String),

  /// Any other transport failure.
  #[error("transport error: {0}")]
  Transport(String),
}

/// Remote operations offered by a worker.
#[async_trait]
pub trait TaskManagerGateway: Send + Sync {
  /// Address of the worker, for diagnostics.
  fn address(&self) -> &str;

  /// Asks the worker to start a task.
  async fn submit_task(
    &self,
    descriptor: TaskDeploymentDescriptor,
  ) -> Result<TaskOperationResult, GatewayError>;

  /// Asks the worker to cancel a task.
  async fn cancel_task(
    &self,
    attempt_id: ExecutionAttemptId,
  ) -> Result<TaskOperationResult, GatewayError>;
}

/// Requests understood by a task manager actor.
#[derive(Debug)]
pub enum TaskManagerMessage {
  /// Start a task and acknowledge.
  SubmitTask {
    /// Task to start.
    descriptor: Box<TaskDeploymentDescriptor>,
    /// Where to send the acknowledgement.
    reply: oneshot::Sender<TaskOperationResult>,
  },
  /// Cancel a task and acknowledge.
  CancelTask {
    /// Attempt to cancel.
    attempt_id: ExecutionAttemptId,
    /// Where to send the acknowledgement.
    reply: oneshot::Sender<TaskOperationResult>,
  },
}

/// Gateway that sends requests to a task manager actor's mailbox.
#[derive(Clone, Debug)]
pub struct ActorGateway {
  address: String,
  mailbox: mpsc::Sender<TaskManagerMessage>,
}

impl ActorGateway {
  /// Wraps an existing mailbox.
  pub fn new(address: impl Into<String>, mailbox: mpsc::Sender<TaskManagerMessage>) -> Self {
    Self {
      address: address.into(),
      mailbox,
    }
  }

  /// Creates a gateway together with the receiving end of its mailbox.
  pub fn channel(
    address: impl Into<String>,
    capacity: usize,
  ) -> (Self, mpsc::Receiver<TaskManagerMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Self::new(address, tx), rx)
  }

  async fn ask(
    &self,
    message: TaskManagerMessage,
    reply: oneshot::Receiver<TaskOperationResult>,
  ) -> Result<TaskOperationResult, GatewayError> {
    self
      .mailbox
      .send(message)
      .await
      .map_err(|_| GatewayError::Disconnected(self.address.clone()))?;
    reply
      .await
      .map_err(|_| GatewayError::NoReply(self.address.clone()))
  }
}

#[async_trait]
impl TaskManagerGateway for ActorGateway {
  fn address(&self) -> &str {
    &self.address
  }

  async fn submit_task(
    &self,
    descriptor: TaskDeploymentDescriptor,
  ) -> Result<TaskOperationResult, GatewayError> {
    let (reply, rx) = oneshot::channel();
    self
      .ask(
        TaskManagerMessage::SubmitTask {
          descriptor: Box::new(descriptor),
          reply,
        },
        rx,
      )
      .await
  }

  async fn cancel_task(
    &self,
    attempt_id: ExecutionAttemptId,
  ) -> Result<TaskOperationResult, GatewayError> {
    let (reply, rx) = oneshot::channel();
    self
      .ask(TaskManagerMessage::CancelTask { attempt_id, reply }, rx)
      .await
  }
}
