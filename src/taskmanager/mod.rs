//! # Local Task Manager
//!
//! An in-process worker. The task manager is an actor: it owns a mailbox of
//! [`TaskManagerMessage`]s, reached through an [`ActorGateway`], and handles
//! one message at a time. Submitted tasks are resolved through an
//! [`InvokableRegistry`] and run as tokio tasks, each with its own
//! cancellation token. When a task ends, the task manager sends its final
//! state (`FINISHED`, `FAILED` or `CANCELED`) on the update channel given at
//! spawn time.
//!
//! ```text
//!  job side                       task manager actor
//!  ────────                       ──────────────────
//!  submit_task ── mailbox ──────▶ resolve invokable, spawn body
//!              ◀── oneshot ack ──
//!  cancel_task ── mailbox ──────▶ cancel token
//!              ◀── oneshot ack ──
//!  updates     ◀── mpsc ──────── FINISHED / FAILED / CANCELED
//! ```

use crate::config::LocalTaskManagerConfig;
use crate::deployment::{TaskDeploymentDescriptor, TaskExecutionState, TaskOperationResult};
use crate::error::Result;
use crate::executiongraph::ExecutionState;
use crate::ids::{ExecutionAttemptId, JobId};
use crate::instance::{ActorGateway, Instance, TaskManagerMessage};
use crate::invokable::{InvokableRegistry, TaskContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunningTask {
  job_id: JobId,
  task_name: String,
  cancellation: CancellationToken,
}

/// The actor behind a local worker.
pub struct LocalTaskManager {
  address: String,
  number_of_slots: usize,
  cancellation_grace: Duration,
  invokables: Arc<InvokableRegistry>,
  updates: mpsc::Sender<TaskExecutionState>,
  running: HashMap<ExecutionAttemptId, RunningTask>,
  ended_tx: mpsc::UnboundedSender<ExecutionAttemptId>,
  ended_rx: mpsc::UnboundedReceiver<ExecutionAttemptId>,
  shutdown: CancellationToken,
}

/// Handle to a spawned [`LocalTaskManager`].
#[derive(Debug)]
pub struct LocalTaskManagerHandle {
  instance: Arc<Instance>,
  gateway: ActorGateway,
  shutdown: CancellationToken,
  join: JoinHandle<()>,
}

impl LocalTaskManagerHandle {
  /// The resource offer of this worker, ready to be handed to a scheduler.
  pub fn instance(&self) -> &Arc<Instance> {
    &self.instance
  }

  /// A gateway to the worker's mailbox.
  pub fn gateway(&self) -> &ActorGateway {
    &self.gateway
  }

  /// Stops the actor and cancels every task still running on it.
  pub async fn shutdown(self) {
    self.shutdown.cancel();
    if let Err(e) = self.join.await {
      warn!(error = %e, "task manager actor ended abnormally");
    }
  }
}

impl LocalTaskManager {
  /// Starts a task manager on the current tokio runtime.
  ///
  /// Final task states are sent on `updates`.
  pub fn spawn(
    config: LocalTaskManagerConfig,
    invokables: Arc<InvokableRegistry>,
    updates: mpsc::Sender<TaskExecutionState>,
  ) -> Result<LocalTaskManagerHandle> {
    config.validate()?;
    let (gateway, mailbox) = ActorGateway::channel(config.address.clone(), config.mailbox_capacity);
    let instance = Instance::new(
      config.address.clone(),
      Arc::new(gateway.clone()),
      config.number_of_slots,
    );
    let shutdown = CancellationToken::new();
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    let actor = LocalTaskManager {
      address: config.address,
      number_of_slots: config.number_of_slots,
      cancellation_grace: config.cancellation_grace,
      invokables,
      updates,
      running: HashMap::new(),
      ended_tx,
      ended_rx,
      shutdown: shutdown.clone(),
    };
    info!(
      address = %actor.address,
      slots = actor.number_of_slots,
      "local task manager started"
    );
    let join = tokio::spawn(actor.run(mailbox));

    Ok(LocalTaskManagerHandle {
      instance,
      gateway,
      shutdown,
      join,
    })
  }

  async fn run(mut self, mut mailbox: mpsc::Receiver<TaskManagerMessage>) {
    loop {
      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        Some(attempt_id) = self.ended_rx.recv() => {
          self.running.remove(&attempt_id);
        }
        message = mailbox.recv() => match message {
          Some(message) => self.handle(message),
          None => break,
        },
      }
    }

    for (attempt_id, task) in self.running.drain() {
      debug!(attempt = %attempt_id, job = %task.job_id, "canceling task on shutdown");
      task.cancellation.cancel();
    }
    info!(address = %self.address, "local task manager stopped");
  }

  fn reap_ended(&mut self) {
    while let Ok(attempt_id) = self.ended_rx.try_recv() {
      self.running.remove(&attempt_id);
    }
  }

  fn handle(&mut self, message: TaskManagerMessage) {
    // a slot freed by a task that just ended must be usable by the next request
    self.reap_ended();
    match message {
      TaskManagerMessage::SubmitTask { descriptor, reply } => {
        let attempt_id = descriptor.attempt_id;
        let result = match self.submit(*descriptor) {
          Ok(()) => TaskOperationResult::success(attempt_id),
          Err(reason) => {
            warn!(attempt = %attempt_id, reason = %reason, "task submission refused");
            TaskOperationResult::failure(attempt_id, reason)
          }
        };
        if reply.send(result).is_err() {
          debug!(attempt = %attempt_id, "submitter stopped waiting for the acknowledgement");
        }
      }
      TaskManagerMessage::CancelTask { attempt_id, reply } => {
        let result = match self.running.get(&attempt_id) {
          Some(task) => {
            debug!(task = %task.task_name, attempt = %attempt_id, "canceling task");
            task.cancellation.cancel();
            TaskOperationResult::success(attempt_id)
          }
          None => TaskOperationResult::failure(attempt_id, "no such task running"),
        };
        let _ = reply.send(result);
      }
    }
  }

  fn submit(&mut self, descriptor: TaskDeploymentDescriptor) -> std::result::Result<(), String> {
    if self.running.contains_key(&descriptor.attempt_id) {
      return Err(format!("attempt {} is already running", descriptor.attempt_id));
    }
    if self.running.len() >= self.number_of_slots {
      return Err(format!(
        "all {} slots of {} are busy",
        self.number_of_slots, self.address
      ));
    }
    let invokable_id = descriptor
      .invokable_id
      .as_deref()
      .ok_or_else(|| "the descriptor names no invokable".to_string())?;
    let mut body = self
      .invokables
      .instantiate(invokable_id)
      .map_err(|e| e.to_string())?;

    let attempt_id = descriptor.attempt_id;
    let job_id = descriptor.job_id;
    let task_name = descriptor.task_name_with_subtask();
    let cancellation = self.shutdown.child_token();
    let context = TaskContext::new(Arc::new(descriptor), cancellation.clone());
    self.running.insert(
      attempt_id,
      RunningTask {
        job_id,
        task_name: task_name.clone(),
        cancellation: cancellation.clone(),
      },
    );

    let updates = self.updates.clone();
    let ended = self.ended_tx.clone();
    let grace = self.cancellation_grace;
    tokio::spawn(async move {
      debug!(task = %task_name, attempt = %attempt_id, "task started");
      let outcome = tokio::select! {
        result = body.invoke(context) => Some(result),
        _ = async {
          cancellation.cancelled().await;
          tokio::time::sleep(grace).await;
        } => None,
      };

      let report = if cancellation.is_cancelled() {
        if outcome.is_none() {
          warn!(task = %task_name, "task body ignored cancellation and was dropped");
        }
        TaskExecutionState::new(job_id, attempt_id, ExecutionState::Canceled)
      } else {
        match outcome {
          Some(Ok(())) => TaskExecutionState::new(job_id, attempt_id, ExecutionState::Finished),
          Some(Err(e)) => TaskExecutionState::failed(job_id, attempt_id, e.to_string()),
          None => TaskExecutionState::failed(job_id, attempt_id, "task body was dropped"),
        }
      };
      debug!(task = %task_name, state = %report.state, "task ended");
      let _ = ended.send(attempt_id);
      if updates.send(report).await.is_err() {
        debug!(task = %task_name, "nobody listens for task updates");
      }
    });
    Ok(())
  }
}
