//! # Execution Attempts
//!
//! An [`Execution`] is one deployment attempt of one subtask. Its state lives
//! in an atomic byte and every transition is a compare-and-exchange from the
//! state the caller observed, so concurrent callers (a deployment
//! acknowledgement, a cancel request, a worker report) can never both win.
//! A caller that loses gets `IllegalStateTransition` and has to re-read the
//! state.
//!
//! On the transition into a terminal state the attempt hands its slot back,
//! removes itself from the graph's [`ExecutionRegistry`] and records the
//! entry time. Every transition is published as an
//! [`ExecutionEvent`](super::ExecutionEvent).

use super::job_vertex::VertexTopology;
use super::registry::{ExecutionEvent, ExecutionRegistry};
use super::state::ExecutionState;
use crate::config::ExecutionConfig;
use crate::deployment::TaskDeploymentDescriptor;
use crate::error::{ExecutionGraphError, Result};
use crate::ids::{ExecutionAttemptId, JobId, JobVertexId};
use crate::instance::{AllocatedSlot, TaskManagerGateway};
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug)]
pub(crate) struct AttemptTimeouts {
  pub(crate) deployment: Duration,
  pub(crate) cancel: Duration,
}

impl From<&ExecutionConfig> for AttemptTimeouts {
  fn from(config: &ExecutionConfig) -> Self {
    Self {
      deployment: config.deployment_timeout,
      cancel: config.cancel_timeout,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailureOrigin {
  /// Detected on the job side.
  Local,
  /// Reported by the worker.
  Remote,
}

/// One deployment attempt of a subtask.
pub struct Execution {
  attempt_id: ExecutionAttemptId,
  attempt_number: u32,
  subtask_index: usize,
  vertex: Arc<VertexTopology>,
  state: AtomicU8,
  assigned_slot: Mutex<Option<Arc<AllocatedSlot>>>,
  failure_cause: Mutex<Option<ExecutionGraphError>>,
  state_timestamps: Mutex<[Option<DateTime<Utc>>; ExecutionState::ALL.len()]>,
  timeouts: AttemptTimeouts,
  registry: Weak<ExecutionRegistry>,
}

impl Execution {
  pub(crate) fn new(
    vertex: Arc<VertexTopology>,
    subtask_index: usize,
    attempt_number: u32,
    timeouts: AttemptTimeouts,
    registry: &Arc<ExecutionRegistry>,
  ) -> Arc<Self> {
    let mut state_timestamps = [None; ExecutionState::ALL.len()];
    state_timestamps[usize::from(ExecutionState::Created.as_u8())] = Some(Utc::now());
    Arc::new(Self {
      attempt_id: ExecutionAttemptId::generate(),
      attempt_number,
      subtask_index,
      vertex,
      state: AtomicU8::new(ExecutionState::Created.as_u8()),
      assigned_slot: Mutex::new(None),
      failure_cause: Mutex::new(None),
      state_timestamps: Mutex::new(state_timestamps),
      timeouts,
      registry: Arc::downgrade(registry),
    })
  }

  /// Globally unique id of this attempt.
  pub fn attempt_id(&self) -> ExecutionAttemptId {
    self.attempt_id
  }

  /// 0 for the first attempt of a subtask, counting up with each reset.
  pub fn attempt_number(&self) -> u32 {
    self.attempt_number
  }

  /// Job the attempt belongs to.
  pub fn job_id(&self) -> JobId {
    self.vertex.job_id
  }

  /// Vertex the attempt belongs to.
  pub fn vertex_id(&self) -> JobVertexId {
    self.vertex.vertex_id
  }

  /// Subtask index of the attempt.
  pub fn subtask_index(&self) -> usize {
    self.subtask_index
  }

  /// Task name including the subtask position, e.g. `map (4/10)`.
  pub fn task_name_with_subtask(&self) -> String {
    self.vertex.task_name_with_subtask(self.subtask_index)
  }

  /// Current state.
  pub fn state(&self) -> ExecutionState {
    ExecutionState::from_u8(self.state.load(Ordering::Acquire))
  }

  /// Whether the attempt reached `FINISHED`, `CANCELED` or `FAILED`.
  pub fn is_finished(&self) -> bool {
    self.state().is_terminal()
  }

  /// Slot the attempt was bound to, if any. Stays set after the slot is
  /// released.
  pub fn assigned_slot(&self) -> Option<Arc<AllocatedSlot>> {
    lock(&self.assigned_slot).clone()
  }

  /// Why the attempt failed, if it did and a cause is known.
  pub fn failure_cause(&self) -> Option<ExecutionGraphError> {
    lock(&self.failure_cause).clone()
  }

  /// When the attempt entered `state`, if it ever did.
  pub fn state_timestamp(&self, state: ExecutionState) -> Option<DateTime<Utc>> {
    lock(&self.state_timestamps)[usize::from(state.as_u8())]
  }

  /// Builds the descriptor a worker needs to run this attempt.
  pub fn deployment_descriptor(&self) -> TaskDeploymentDescriptor {
    self
      .vertex
      .deployment_descriptor(self.subtask_index, self.attempt_id)
  }

  /// Binds the attempt to `slot` and deploys it to the slot's instance.
  ///
  /// The attempt must be `CREATED`, or `SCHEDULED` to this same slot. It
  /// moves to `DEPLOYING` while the submit call is outstanding and to
  /// `RUNNING` on a positive acknowledgement. A refusal, a transport error or
  /// a missing acknowledgement within the deployment timeout fails the
  /// attempt and is returned as `DeploymentFailed`.
  pub async fn deploy_to_slot(&self, slot: Arc<AllocatedSlot>) -> Result<()> {
    self.bind_slot(&slot)?;

    let descriptor = self.deployment_descriptor();
    if !self.transition_state(ExecutionState::Scheduled, ExecutionState::Deploying) {
      return Err(self.illegal(self.state(), ExecutionState::Deploying));
    }

    info!(
      task = %self.task_name_with_subtask(),
      attempt = %self.attempt_id,
      slot = %slot,
      "deploying task"
    );
    let gateway = Arc::clone(slot.instance().gateway());
    let outcome =
      tokio::time::timeout(self.timeouts.deployment, gateway.submit_task(descriptor)).await;

    let (reason, timed_out) = match outcome {
      Ok(Ok(result)) if result.success => {
        if self.transition_state(ExecutionState::Deploying, ExecutionState::Running) {
          return Ok(());
        }
        let current = self.state();
        if current == ExecutionState::Canceling {
          debug!(
            task = %self.task_name_with_subtask(),
            "deployment acknowledged while canceling, repeating cancel call"
          );
          self.send_cancel_call().await;
        } else if current.is_terminal() {
          debug!(
            task = %self.task_name_with_subtask(),
            state = %current,
            "deployment acknowledged after the attempt ended"
          );
        } else {
          warn!(
            task = %self.task_name_with_subtask(),
            state = %current,
            "deployment acknowledged after the attempt left DEPLOYING"
          );
        }
        return Ok(());
      }
      Ok(Ok(result)) => (
        result
          .description
          .unwrap_or_else(|| "deployment refused by the worker".to_string()),
        false,
      ),
      Ok(Err(e)) => (e.to_string(), false),
      Err(_) => (
        format!(
          "no acknowledgement within {} ms",
          self.timeouts.deployment.as_millis()
        ),
        true,
      ),
    };

    let cause = ExecutionGraphError::DeploymentFailed {
      task: self.task_name_with_subtask(),
      reason,
    };
    if let Err(e) = self.process_fail(Some(cause.clone()), FailureOrigin::Local, timed_out) {
      debug!(error = %e, "deployment failure arrived after the attempt ended");
    }
    Err(cause)
  }

  fn bind_slot(&self, slot: &Arc<AllocatedSlot>) -> Result<()> {
    match self.state() {
      ExecutionState::Created => {
        if !slot.set_occupant(self.attempt_id) {
          return Err(ExecutionGraphError::DeploymentFailed {
            task: self.task_name_with_subtask(),
            reason: format!("slot {} is released or hosts another attempt", slot),
          });
        }
        *lock(&self.assigned_slot) = Some(Arc::clone(slot));
        if self.transition_state(ExecutionState::Created, ExecutionState::Scheduled) {
          return Ok(());
        }
        // lost against a concurrent cancel or failure
        slot.release();
        Err(self.illegal(self.state(), ExecutionState::Scheduled))
      }
      ExecutionState::Scheduled => match self.assigned_slot() {
        Some(assigned) if Arc::ptr_eq(&assigned, slot) => Ok(()),
        _ => Err(ExecutionGraphError::DeploymentFailed {
          task: self.task_name_with_subtask(),
          reason: "attempt is already scheduled to a different slot".to_string(),
        }),
      },
      other => Err(self.illegal(other, ExecutionState::Deploying)),
    }
  }

  /// Moves a deployed attempt to `RUNNING` without waiting for the submit
  /// acknowledgement. Used when a worker report overtakes the ack.
  pub(crate) fn switch_to_running(&self) -> bool {
    self.transition_state(ExecutionState::Deploying, ExecutionState::Running)
  }

  /// `RUNNING -> FINISHED`.
  pub fn mark_finished(&self) -> Result<()> {
    if self.transition_state(ExecutionState::Running, ExecutionState::Finished) {
      Ok(())
    } else {
      Err(self.illegal(self.state(), ExecutionState::Finished))
    }
  }

  /// Fails the attempt because of a problem detected on the job side.
  ///
  /// Allowed from every non-terminal state. Failing an attempt that already
  /// failed is a no-op; failing one that finished or was canceled is an
  /// illegal transition. A deployed attempt also gets a best-effort cancel
  /// call so the worker stops running it.
  pub fn mark_failed(&self, cause: Option<ExecutionGraphError>) -> Result<()> {
    self.process_fail(cause, FailureOrigin::Local, true)
  }

  /// Fails the attempt because the worker reported a failure.
  ///
  /// Same transition as [`mark_failed`](Self::mark_failed); the reason is
  /// kept as a `RemoteExecutionFailure`.
  pub fn fail(&self, reason: Option<String>) -> Result<()> {
    let cause = reason.map(|reason| ExecutionGraphError::RemoteExecutionFailure {
      task: self.task_name_with_subtask(),
      reason,
    });
    self.process_fail(cause, FailureOrigin::Remote, false)
  }

  fn process_fail(
    &self,
    cause: Option<ExecutionGraphError>,
    origin: FailureOrigin,
    cancel_remote: bool,
  ) -> Result<()> {
    loop {
      let current = self.state();
      if current == ExecutionState::Failed {
        return Ok(());
      }
      if current.is_terminal() {
        return Err(self.illegal(current, ExecutionState::Failed));
      }
      if self
        .state
        .compare_exchange(
          current.as_u8(),
          ExecutionState::Failed.as_u8(),
          Ordering::AcqRel,
          Ordering::Acquire,
        )
        .is_err()
      {
        continue;
      }

      *lock(&self.failure_cause) = cause.clone();
      let description = cause.as_ref().map(ToString::to_string);
      match origin {
        FailureOrigin::Local => error!(
          task = %self.task_name_with_subtask(),
          attempt = %self.attempt_id,
          cause = description.as_deref().unwrap_or("unknown"),
          "task failed"
        ),
        FailureOrigin::Remote => error!(
          task = %self.task_name_with_subtask(),
          attempt = %self.attempt_id,
          cause = description.as_deref().unwrap_or("unknown"),
          "worker reported task failure"
        ),
      }
      let deployed = matches!(
        current,
        ExecutionState::Deploying | ExecutionState::Running | ExecutionState::Canceling
      );
      let slot = self.assigned_slot();
      self.on_transition(current, ExecutionState::Failed, description);
      if cancel_remote && deployed {
        if let Some(slot) = slot {
          self.spawn_cancel_call(Arc::clone(slot.instance().gateway()));
        }
      }
      return Ok(());
    }
  }

  /// Cancels the attempt.
  ///
  /// A `CREATED` attempt is canceled right away. A `SCHEDULED` one goes
  /// through `CANCELING` to `CANCELED` without contacting a worker. A
  /// deploying or running attempt moves to `CANCELING` and the worker gets a
  /// cancel call; it reaches `CANCELED` through
  /// [`canceling_complete`](Self::canceling_complete) once the worker
  /// confirms. Canceling an attempt that is already canceling or terminal is
  /// a no-op.
  pub async fn cancel(&self) -> Result<()> {
    loop {
      let current = self.state();
      match current {
        ExecutionState::Canceling
        | ExecutionState::Finished
        | ExecutionState::Canceled
        | ExecutionState::Failed => return Ok(()),
        ExecutionState::Created => {
          if self.transition_state(ExecutionState::Created, ExecutionState::Canceled) {
            return Ok(());
          }
        }
        ExecutionState::Scheduled => {
          if self.transition_state(ExecutionState::Scheduled, ExecutionState::Canceling) {
            return self.canceling_complete();
          }
        }
        ExecutionState::Deploying | ExecutionState::Running => {
          if self.transition_state(current, ExecutionState::Canceling) {
            self.send_cancel_call().await;
            return Ok(());
          }
        }
      }
    }
  }

  /// `CANCELING -> CANCELED`. A no-op on an attempt that is already
  /// canceled.
  pub fn canceling_complete(&self) -> Result<()> {
    loop {
      match self.state() {
        ExecutionState::Canceled => return Ok(()),
        ExecutionState::Canceling => {
          if self.transition_state(ExecutionState::Canceling, ExecutionState::Canceled) {
            return Ok(());
          }
        }
        other => return Err(self.illegal(other, ExecutionState::Canceled)),
      }
    }
  }

  async fn send_cancel_call(&self) {
    let Some(slot) = self.assigned_slot() else {
      return;
    };
    let gateway = Arc::clone(slot.instance().gateway());
    let failure = match tokio::time::timeout(
      self.timeouts.cancel,
      gateway.cancel_task(self.attempt_id),
    )
    .await
    {
      Ok(Ok(result)) if result.success => {
        debug!(task = %self.task_name_with_subtask(), "cancel call acknowledged");
        return;
      }
      Ok(Ok(result)) => {
        // the task is already gone on the worker; its final report settles the state
        warn!(
          task = %self.task_name_with_subtask(),
          reason = result.description.as_deref().unwrap_or("unknown"),
          "cancel call did not find the task"
        );
        return;
      }
      Ok(Err(e)) => e.to_string(),
      Err(_) => format!(
        "no cancel acknowledgement within {} ms",
        self.timeouts.cancel.as_millis()
      ),
    };

    let cause = ExecutionGraphError::RemoteExecutionFailure {
      task: self.task_name_with_subtask(),
      reason: format!("task could not be canceled: {}", failure),
    };
    if let Err(e) = self.process_fail(Some(cause), FailureOrigin::Local, false) {
      debug!(error = %e, "cancel failure arrived after the attempt ended");
    }
  }

  fn spawn_cancel_call(&self, gateway: Arc<dyn TaskManagerGateway>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!(
        task = %self.task_name_with_subtask(),
        "no runtime to cancel the failed task on its worker"
      );
      return;
    };
    let attempt_id = self.attempt_id;
    let task = self.task_name_with_subtask();
    let cancel_timeout = self.timeouts.cancel;
    runtime.spawn(async move {
      match tokio::time::timeout(cancel_timeout, gateway.cancel_task(attempt_id)).await {
        Ok(Ok(_)) => debug!(task = %task, "failed task canceled on its worker"),
        Ok(Err(e)) => warn!(task = %task, error = %e, "could not cancel failed task"),
        Err(_) => warn!(task = %task, "cancel call for failed task timed out"),
      }
    });
  }

  fn transition_state(&self, from: ExecutionState, to: ExecutionState) -> bool {
    if self
      .state
      .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }
    self.on_transition(from, to, None);
    true
  }

  fn on_transition(&self, from: ExecutionState, to: ExecutionState, cause: Option<String>) {
    let now = Utc::now();
    lock(&self.state_timestamps)[usize::from(to.as_u8())] = Some(now);
    debug!(
      task = %self.task_name_with_subtask(),
      attempt = %self.attempt_id,
      from = %from,
      to = %to,
      "execution state changed"
    );

    let registry = self.registry.upgrade();
    if to.is_terminal() {
      if let Some(slot) = self.assigned_slot() {
        slot.release();
      }
      if let Some(registry) = &registry {
        registry.deregister(self.attempt_id);
      }
    }
    if let Some(registry) = registry {
      registry.publish(ExecutionEvent {
        job_id: self.vertex.job_id,
        vertex_id: self.vertex.vertex_id,
        subtask_index: self.subtask_index,
        attempt_id: self.attempt_id,
        previous: from,
        current: to,
        cause,
        timestamp: now,
      });
    }
  }

  fn illegal(&self, from: ExecutionState, to: ExecutionState) -> ExecutionGraphError {
    ExecutionGraphError::illegal_transition(
      format!("{} attempt {}", self.task_name_with_subtask(), self.attempt_id),
      from,
      to,
    )
  }
}

impl fmt::Debug for Execution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Execution")
      .field("attempt_id", &self.attempt_id)
      .field("task", &self.task_name_with_subtask())
      .field("attempt_number", &self.attempt_number)
      .field("state", &self.state())
      .finish()
  }
}

impl fmt::Display for Execution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Attempt #{} ({}) @ {} - [{}]",
      self.attempt_number,
      self.task_name_with_subtask(),
      self
        .assigned_slot()
        .map(|slot| slot.to_string())
        .unwrap_or_else(|| "(unassigned)".to_string()),
      self.state()
    )
  }
}
