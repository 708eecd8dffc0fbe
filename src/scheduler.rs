//! # Slot Scheduler
//!
//! Keeps the pool of registered [`Instance`]s and hands out their slots to
//! subtasks that want to run.
//!
//! A slot request is either served immediately, queued until a slot frees
//! up, or refused with `NotEnoughSlots`, depending on whether the caller
//! allows queueing. Queued requests are served in arrival order as soon as
//! any instance returns a slot.
//!
//! All pool bookkeeping happens under one scheduler lock, so
//! [`Scheduler::number_of_available_slots`] never disagrees with the slots
//! that are handed out. Instances report returned slots through
//! [`SlotAvailabilityListener`], which the scheduler implements.

use crate::error::{ExecutionGraphError, Result};
use crate::ids::{InstanceId, JobId, JobVertexId};
use crate::instance::{AllocatedSlot, Instance, SlotAvailabilityListener};
use crate::sync::lock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a slot request is for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledUnit {
  /// Job the slot is for.
  pub job_id: JobId,
  /// Vertex of the subtask.
  pub vertex_id: JobVertexId,
  /// Subtask index.
  pub subtask_index: usize,
  /// Task name including the subtask position.
  pub task_name: String,
}

impl fmt::Display for ScheduledUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.task_name)
  }
}

/// Outcome of a slot request.
#[derive(Debug)]
pub enum SlotAllocation {
  /// A slot was free and is now bound to the request.
  Immediate(Arc<AllocatedSlot>),
  /// The request waits in the queue.
  Queued(SlotAllocationFuture),
}

/// A queued slot request that completes once a slot frees up.
#[derive(Debug)]
pub struct SlotAllocationFuture {
  unit: ScheduledUnit,
  receiver: oneshot::Receiver<Arc<AllocatedSlot>>,
}

impl SlotAllocationFuture {
  /// The request this future belongs to.
  pub fn unit(&self) -> &ScheduledUnit {
    &self.unit
  }

  /// Waits for the slot.
  ///
  /// Fails with `SlotRequestWithdrawn` if the request was dropped from the
  /// queue before a slot became available.
  pub async fn wait(self) -> Result<Arc<AllocatedSlot>> {
    let task = self.unit.task_name;
    self
      .receiver
      .await
      .map_err(|_| ExecutionGraphError::SlotRequestWithdrawn { task })
  }

  /// Waits for the slot until `cancel` fires.
  ///
  /// Returns `None` when canceled, even if a slot is ready. A slot that was
  /// handed over while the request was being abandoned goes straight back
  /// to its instance.
  pub async fn wait_or_cancel(
    mut self,
    cancel: &CancellationToken,
  ) -> Result<Option<Arc<AllocatedSlot>>> {
    let received = tokio::select! {
      biased;
      _ = cancel.cancelled() => None,
      received = &mut self.receiver => Some(received),
    };
    match received {
      Some(Ok(slot)) => Ok(Some(slot)),
      Some(Err(_)) => Err(ExecutionGraphError::SlotRequestWithdrawn {
        task: self.unit.task_name,
      }),
      None => {
        self.receiver.close();
        if let Ok(slot) = self.receiver.try_recv() {
          slot.release();
        }
        Ok(None)
      }
    }
  }
}

struct QueuedRequest {
  unit: ScheduledUnit,
  sender: oneshot::Sender<Arc<AllocatedSlot>>,
}

#[derive(Default)]
struct SchedulerState {
  instances: HashMap<InstanceId, Arc<Instance>>,
  /// Instances with free slots, in round-robin order.
  with_available: VecDeque<InstanceId>,
  queued: VecDeque<QueuedRequest>,
}

impl SchedulerState {
  fn available_slots(&self) -> usize {
    self
      .instances
      .values()
      .filter(|i| i.is_alive())
      .map(|i| i.number_of_available_slots())
      .sum()
  }

  fn total_slots(&self) -> usize {
    self
      .instances
      .values()
      .filter(|i| i.is_alive())
      .map(|i| i.total_number_of_slots())
      .sum()
  }

  fn mark_available(&mut self, id: InstanceId) {
    if !self.with_available.contains(&id) {
      self.with_available.push_back(id);
    }
  }

  /// Takes a slot from the next instance that has one.
  fn take_slot(&mut self, job_id: JobId) -> Option<Arc<AllocatedSlot>> {
    while let Some(id) = self.with_available.pop_front() {
      let Some(instance) = self.instances.get(&id) else {
        continue;
      };
      let Some(slot) = instance.allocate_slot(job_id) else {
        continue;
      };
      if instance.has_resources_available() {
        self.with_available.push_back(id);
      }
      return Some(slot);
    }
    None
  }

  /// Serves queued requests from `instance` while it has free slots.
  fn serve_queued(&mut self, instance: &Arc<Instance>) {
    while let Some(request) = self.queued.pop_front() {
      if request.sender.is_closed() {
        debug!(task = %request.unit, "dropping abandoned slot request");
        continue;
      }
      let Some(slot) = instance.allocate_slot(request.unit.job_id) else {
        self.queued.push_front(request);
        return;
      };
      debug!(task = %request.unit, slot = %slot, "serving queued slot request");
      if let Err(slot) = request.sender.send(slot) {
        slot.release_without_notification();
      }
    }
  }
}

/// Slot pool shared by all jobs.
pub struct Scheduler {
  state: Mutex<SchedulerState>,
  self_ref: Weak<Scheduler>,
}

impl Scheduler {
  /// Creates an empty scheduler.
  pub fn new() -> Arc<Self> {
    Arc::new_cyclic(|self_ref| Self {
      state: Mutex::new(SchedulerState::default()),
      self_ref: self_ref.clone(),
    })
  }

  /// Adds all slots of `instance` to the pool.
  pub fn new_instance_available(&self, instance: Arc<Instance>) -> Result<()> {
    let mut state = lock(&self.state);
    if state.instances.contains_key(&instance.id()) {
      return Err(ExecutionGraphError::DuplicateInstance(instance.id()));
    }

    let listener: Weak<dyn SlotAvailabilityListener> = self.self_ref.clone();
    instance.set_slot_availability_listener(listener);
    state.instances.insert(instance.id(), Arc::clone(&instance));
    info!(
      instance = %instance.id(),
      address = instance.address(),
      slots = instance.total_number_of_slots(),
      "instance registered"
    );

    state.serve_queued(&instance);
    if instance.has_resources_available() {
      state.mark_available(instance.id());
    }
    Ok(())
  }

  /// Removes an instance from the pool and marks it dead. Slots it still
  /// has handed out stay with their executions but never return.
  pub fn instance_died(&self, instance_id: InstanceId) -> Option<Arc<Instance>> {
    let mut state = lock(&self.state);
    let instance = state.instances.remove(&instance_id)?;
    state.with_available.retain(|id| *id != instance_id);
    instance.remove_slot_availability_listener();
    instance.mark_dead();
    warn!(instance = %instance_id, "instance removed from scheduler");
    Some(instance)
  }

  /// Requests a slot for `unit`.
  ///
  /// With `queue_if_unavailable` the request waits for a slot when none is
  /// free; otherwise it fails with `NotEnoughSlots`.
  pub fn schedule(&self, unit: ScheduledUnit, queue_if_unavailable: bool) -> Result<SlotAllocation> {
    if !queue_if_unavailable {
      return self.schedule_immediately(unit).map(SlotAllocation::Immediate);
    }

    let mut state = lock(&self.state);
    if let Some(slot) = state.take_slot(unit.job_id) {
      debug!(task = %unit, slot = %slot, "slot assigned");
      return Ok(SlotAllocation::Immediate(slot));
    }

    let (sender, receiver) = oneshot::channel();
    debug!(task = %unit, queued = state.queued.len() + 1, "no free slot, queueing request");
    state.queued.push_back(QueuedRequest {
      unit: unit.clone(),
      sender,
    });
    Ok(SlotAllocation::Queued(SlotAllocationFuture { unit, receiver }))
  }

  /// Requests a slot and fails with `NotEnoughSlots` if none is free.
  pub fn schedule_immediately(&self, unit: ScheduledUnit) -> Result<Arc<AllocatedSlot>> {
    let mut state = lock(&self.state);
    match state.take_slot(unit.job_id) {
      Some(slot) => {
        debug!(task = %unit, slot = %slot, "slot assigned");
        Ok(slot)
      }
      None => Err(ExecutionGraphError::NotEnoughSlots {
        task: unit.task_name,
        available: state.available_slots(),
        total: state.total_slots(),
      }),
    }
  }

  /// Drops the queued requests of one job; their futures resolve with
  /// `SlotRequestWithdrawn`. Returns how many were dropped.
  pub fn cancel_requests(&self, job_id: JobId) -> usize {
    let mut state = lock(&self.state);
    let before = state.queued.len();
    state.queued.retain(|request| request.unit.job_id != job_id);
    let dropped = before - state.queued.len();
    if dropped > 0 {
      debug!(job = %job_id, dropped, "withdrew queued slot requests");
    }
    dropped
  }

  pub(crate) fn downgrade(&self) -> Weak<Scheduler> {
    self.self_ref.clone()
  }

  /// Drops all queued requests; their futures resolve with
  /// `SlotRequestWithdrawn`.
  pub fn clear_queue(&self) -> usize {
    let mut state = lock(&self.state);
    let dropped = state.queued.len();
    state.queued.clear();
    dropped
  }

  /// Free slots over all live instances.
  pub fn number_of_available_slots(&self) -> usize {
    lock(&self.state).available_slots()
  }

  /// Slots over all live instances.
  pub fn total_number_of_slots(&self) -> usize {
    lock(&self.state).total_slots()
  }

  /// Number of registered instances.
  pub fn number_of_instances(&self) -> usize {
    lock(&self.state).instances.len()
  }

  /// Number of requests waiting for a slot.
  pub fn number_of_queued_requests(&self) -> usize {
    lock(&self.state).queued.len()
  }
}

impl SlotAvailabilityListener for Scheduler {
  fn new_slot_available(&self, instance: &Arc<Instance>) {
    let mut state = lock(&self.state);
    if !state.instances.contains_key(&instance.id()) {
      return;
    }
    state.serve_queued(instance);
    if instance.has_resources_available() {
      state.mark_available(instance.id());
    }
  }
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = lock(&self.state);
    f.debug_struct("Scheduler")
      .field("instances", &state.instances.len())
      .field("available_slots", &state.available_slots())
      .field("queued_requests", &state.queued.len())
      .finish()
  }
}
