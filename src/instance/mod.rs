//! # Resource Model
//!
//! An [`Instance`] is a worker's resource offer: a fixed number of slots and a
//! gateway to the worker's task manager. An [`AllocatedSlot`] is one unit of
//! that capacity, carved out for one job and hosting at most one execution at
//! a time.
//!
//! Releasing a slot hands the capacity back to its instance, which then tells
//! its [`SlotAvailabilityListener`] (the scheduler) that a slot became free.

mod gateway;
mod slot;

pub use gateway::{ActorGateway, GatewayError, TaskManagerGateway, TaskManagerMessage};
pub use slot::AllocatedSlot;

use crate::ids::{InstanceId, JobId};
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Receives notifications when an instance gets a slot back.
pub trait SlotAvailabilityListener: Send + Sync {
  /// Called after `instance` returned a slot to its free pool.
  fn new_slot_available(&self, instance: &Arc<Instance>);
}

#[derive(Debug, Default)]
struct SlotBook {
  free: BTreeSet<usize>,
  allocated: HashSet<usize>,
}

/// A worker's resource offer.
pub struct Instance {
  id: InstanceId,
  address: String,
  gateway: Arc<dyn TaskManagerGateway>,
  total_slots: usize,
  slots: Mutex<SlotBook>,
  alive: AtomicBool,
  listener: Mutex<Option<Weak<dyn SlotAvailabilityListener>>>,
  registered_at: DateTime<Utc>,
  self_ref: Weak<Instance>,
}

impl Instance {
  /// Creates an instance with a fresh id.
  pub fn new(
    address: impl Into<String>,
    gateway: Arc<dyn TaskManagerGateway>,
    total_slots: usize,
  ) -> Arc<Self> {
    Self::with_id(InstanceId::generate(), address, gateway, total_slots)
  }

  /// Creates an instance with the given id.
  pub fn with_id(
    id: InstanceId,
    address: impl Into<String>,
    gateway: Arc<dyn TaskManagerGateway>,
    total_slots: usize,
  ) -> Arc<Self> {
    Arc::new_cyclic(|self_ref| Self {
      id,
      address: address.into(),
      gateway,
      total_slots,
      slots: Mutex::new(SlotBook {
        free: (0..total_slots).collect(),
        allocated: HashSet::new(),
      }),
      alive: AtomicBool::new(true),
      listener: Mutex::new(None),
      registered_at: Utc::now(),
      self_ref: self_ref.clone(),
    })
  }

  /// The instance id.
  pub fn id(&self) -> InstanceId {
    self.id
  }

  /// The worker's address.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Gateway to the worker's task manager.
  pub fn gateway(&self) -> &Arc<dyn TaskManagerGateway> {
    &self.gateway
  }

  /// When the instance object was created.
  pub fn registered_at(&self) -> DateTime<Utc> {
    self.registered_at
  }

  /// Number of slots the worker offers.
  pub fn total_number_of_slots(&self) -> usize {
    self.total_slots
  }

  /// Number of slots currently free.
  pub fn number_of_available_slots(&self) -> usize {
    lock(&self.slots).free.len()
  }

  /// Number of slots currently handed out.
  pub fn number_of_allocated_slots(&self) -> usize {
    lock(&self.slots).allocated.len()
  }

  /// Whether a slot could be allocated right now.
  pub fn has_resources_available(&self) -> bool {
    self.is_alive() && !lock(&self.slots).free.is_empty()
  }

  /// False once the instance has been marked dead.
  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::Acquire)
  }

  /// Takes the lowest free slot for `job_id`, if any.
  pub fn allocate_slot(&self, job_id: JobId) -> Option<Arc<AllocatedSlot>> {
    if !self.is_alive() {
      return None;
    }
    let instance = self.self_ref.upgrade()?;
    let slot_number = {
      let mut slots = lock(&self.slots);
      let slot_number = slots.free.pop_first()?;
      slots.allocated.insert(slot_number);
      slot_number
    };
    debug!(instance = %self.id, slot = slot_number, job = %job_id, "allocated slot");
    Some(Arc::new(AllocatedSlot::new(job_id, instance, slot_number)))
  }

  /// Marks the instance as dead. Its free slots are no longer handed out and
  /// returned slots are not announced.
  pub fn mark_dead(&self) {
    self.alive.store(false, Ordering::Release);
    *lock(&self.listener) = None;
  }

  pub(crate) fn set_slot_availability_listener(&self, listener: Weak<dyn SlotAvailabilityListener>) {
    *lock(&self.listener) = Some(listener);
  }

  pub(crate) fn remove_slot_availability_listener(&self) {
    *lock(&self.listener) = None;
  }

  /// Puts a slot back into the free pool. Returns false if it was not
  /// allocated.
  pub(crate) fn return_slot(&self, slot_number: usize, notify: bool) -> bool {
    let returned = {
      let mut slots = lock(&self.slots);
      if slots.allocated.remove(&slot_number) {
        slots.free.insert(slot_number);
        true
      } else {
        false
      }
    };
    if !returned {
      return false;
    }
    debug!(instance = %self.id, slot = slot_number, "slot returned");

    if notify && self.is_alive() {
      let listener = lock(&self.listener).as_ref().and_then(Weak::upgrade);
      if let (Some(listener), Some(instance)) = (listener, self.self_ref.upgrade()) {
        listener.new_slot_available(&instance);
      }
    }
    true
  }
}

impl fmt::Debug for Instance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Instance")
      .field("id", &self.id)
      .field("address", &self.address)
      .field("total_slots", &self.total_slots)
      .field("available_slots", &self.number_of_available_slots())
      .field("alive", &self.is_alive())
      .finish()
  }
}
