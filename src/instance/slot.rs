use super::Instance;
use crate::ids::{ExecutionAttemptId, JobId};
use crate::sync::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One unit of capacity taken from an [`Instance`] for one job.
pub struct AllocatedSlot {
  job_id: JobId,
  instance: Arc<Instance>,
  slot_number: usize,
  occupant: Mutex<Option<ExecutionAttemptId>>,
  released: AtomicBool,
}

impl AllocatedSlot {
  pub(crate) fn new(job_id: JobId, instance: Arc<Instance>, slot_number: usize) -> Self {
    Self {
      job_id,
      instance,
      slot_number,
      occupant: Mutex::new(None),
      released: AtomicBool::new(false),
    }
  }

  /// Job the slot was allocated for.
  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  /// Instance the slot belongs to.
  pub fn instance(&self) -> &Arc<Instance> {
    &self.instance
  }

  /// Index of the slot within its instance.
  pub fn slot_number(&self) -> usize {
    self.slot_number
  }

  /// Attempt currently hosted by the slot.
  pub fn occupant(&self) -> Option<ExecutionAttemptId> {
    *lock(&self.occupant)
  }

  /// True once the capacity went back to the instance.
  pub fn is_released(&self) -> bool {
    self.released.load(Ordering::Acquire)
  }

  /// Binds an attempt to the slot.
  ///
  /// Fails if the slot is released or already hosts a different attempt.
  /// Binding the same attempt twice succeeds.
  pub fn set_occupant(&self, attempt_id: ExecutionAttemptId) -> bool {
    let mut occupant = lock(&self.occupant);
    if self.is_released() {
      return false;
    }
    match *occupant {
      Some(current) => current == attempt_id,
      None => {
        *occupant = Some(attempt_id);
        true
      }
    }
  }

  /// Hands the capacity back to the instance. Only the first call has an
  /// effect; it returns true.
  pub fn release(&self) -> bool {
    self.release_inner(true)
  }

  /// Like [`release`](Self::release) but without telling the scheduler.
  /// Used by the scheduler itself while it holds its own lock.
  pub(crate) fn release_without_notification(&self) -> bool {
    self.release_inner(false)
  }

  fn release_inner(&self, notify: bool) -> bool {
    {
      let mut occupant = lock(&self.occupant);
      if self
        .released
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return false;
      }
      *occupant = None;
    }
    self.instance.return_slot(self.slot_number, notify);
    true
  }
}

impl fmt::Debug for AllocatedSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AllocatedSlot")
      .field("job_id", &self.job_id)
      .field("instance", &self.instance.id())
      .field("slot_number", &self.slot_number)
      .field("occupant", &self.occupant())
      .field("released", &self.is_released())
      .finish()
  }
}

impl fmt::Display for AllocatedSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} - {}", self.instance.address(), self.slot_number)
  }
}
