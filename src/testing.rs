//! Test doubles for the worker side.
//!
//! [`RecordingGateway`] stands in for a worker's task manager: it answers
//! submit and cancel requests according to a configurable
//! [`GatewayBehavior`] and records every request it receives.

use crate::deployment::{TaskDeploymentDescriptor, TaskOperationResult};
use crate::ids::ExecutionAttemptId;
use crate::instance::{GatewayError, Instance, TaskManagerGateway};
use crate::sync::lock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// How a [`RecordingGateway`] answers requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayBehavior {
  /// Acknowledge every request.
  Acknowledge,
  /// Refuse every request with the given reason.
  Reject(String),
  /// Never answer.
  Hang,
  /// Fail every request at the transport level.
  Disconnected,
}

/// A gateway that records requests and answers them as configured.
#[derive(Debug)]
pub struct RecordingGateway {
  address: String,
  behavior: Mutex<GatewayBehavior>,
  submitted: Mutex<Vec<TaskDeploymentDescriptor>>,
  canceled: Mutex<Vec<ExecutionAttemptId>>,
}

impl RecordingGateway {
  /// Creates a gateway with the given behavior.
  pub fn new(behavior: GatewayBehavior) -> Arc<Self> {
    Arc::new(Self {
      address: "recording-gateway".to_string(),
      behavior: Mutex::new(behavior),
      submitted: Mutex::new(Vec::new()),
      canceled: Mutex::new(Vec::new()),
    })
  }

  /// A gateway that acknowledges everything.
  pub fn acknowledging() -> Arc<Self> {
    Self::new(GatewayBehavior::Acknowledge)
  }

  /// Changes how later requests are answered.
  pub fn set_behavior(&self, behavior: GatewayBehavior) {
    *lock(&self.behavior) = behavior;
  }

  /// Descriptors received so far, in arrival order.
  pub fn submitted_descriptors(&self) -> Vec<TaskDeploymentDescriptor> {
    lock(&self.submitted).clone()
  }

  /// Attempts whose cancellation was requested, in arrival order.
  pub fn canceled_attempts(&self) -> Vec<ExecutionAttemptId> {
    lock(&self.canceled).clone()
  }

  async fn answer(
    &self,
    attempt_id: ExecutionAttemptId,
  ) -> Result<TaskOperationResult, GatewayError> {
    let behavior = lock(&self.behavior).clone();
    match behavior {
      GatewayBehavior::Acknowledge => Ok(TaskOperationResult::success(attempt_id)),
      GatewayBehavior::Reject(reason) => Ok(TaskOperationResult::failure(attempt_id, reason)),
      GatewayBehavior::Hang => futures::future::pending().await,
      GatewayBehavior::Disconnected => Err(GatewayError::Disconnected(self.address.clone())),
    }
  }
}

#[async_trait]
impl TaskManagerGateway for RecordingGateway {
  fn address(&self) -> &str {
    &self.address
  }

  async fn submit_task(
    &self,
    descriptor: TaskDeploymentDescriptor,
  ) -> Result<TaskOperationResult, GatewayError> {
    let attempt_id = descriptor.attempt_id;
    lock(&self.submitted).push(descriptor);
    self.answer(attempt_id).await
  }

  async fn cancel_task(
    &self,
    attempt_id: ExecutionAttemptId,
  ) -> Result<TaskOperationResult, GatewayError> {
    lock(&self.canceled).push(attempt_id);
    self.answer(attempt_id).await
  }
}

/// Creates an instance with `slots` slots backed by `gateway`.
pub fn instance_with_slots(gateway: Arc<RecordingGateway>, slots: usize) -> Arc<Instance> {
  Instance::new("test-instance", gateway, slots)
}
