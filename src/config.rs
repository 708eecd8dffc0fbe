//! Configuration for execution graphs and in-process task managers.
//!
//! Both configuration types follow the same shape: a `Default` impl with
//! production defaults, `with_*` setters for programmatic use, and serde
//! support so they can be read from a JSON document. Durations are written
//! as milliseconds.

use crate::error::{ExecutionGraphError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings that govern how an execution graph is scheduled and deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
  /// Whether slot requests that cannot be served immediately wait for a
  /// slot to free up. When false, a scheduling pass fails with
  /// `NotEnoughSlots` and releases every slot it already bound.
  pub queued_scheduling_allowed: bool,
  /// How long a deployment may wait for the worker's acknowledgement before
  /// the attempt is failed.
  #[serde(with = "duration_ms")]
  pub deployment_timeout: Duration,
  /// How long a cancel request may wait for the worker's acknowledgement.
  #[serde(with = "duration_ms")]
  pub cancel_timeout: Duration,
  /// Capacity of the graph's execution event channel.
  pub event_buffer: usize,
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    Self {
      queued_scheduling_allowed: true,
      deployment_timeout: Duration::from_secs(10),
      cancel_timeout: Duration::from_secs(10),
      event_buffer: 1024,
    }
  }
}

impl ExecutionConfig {
  /// Reads a configuration from a JSON document. Missing fields keep their
  /// defaults.
  pub fn from_json_str(json: &str) -> Result<Self> {
    let config: Self =
      serde_json::from_str(json).map_err(|e| ExecutionGraphError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Checks that the values can be used.
  pub fn validate(&self) -> Result<()> {
    if self.deployment_timeout.is_zero() {
      return Err(ExecutionGraphError::Config(
        "deployment_timeout must be greater than zero".to_string(),
      ));
    }
    if self.cancel_timeout.is_zero() {
      return Err(ExecutionGraphError::Config(
        "cancel_timeout must be greater than zero".to_string(),
      ));
    }
    if self.event_buffer == 0 {
      return Err(ExecutionGraphError::Config(
        "event_buffer must be at least 1".to_string(),
      ));
    }
    Ok(())
  }

  /// Sets whether slot requests may be queued.
  #[must_use]
  pub fn with_queued_scheduling(mut self, allowed: bool) -> Self {
    self.queued_scheduling_allowed = allowed;
    self
  }

  /// Sets the deployment acknowledgement timeout.
  #[must_use]
  pub fn with_deployment_timeout(mut self, timeout: Duration) -> Self {
    self.deployment_timeout = timeout;
    self
  }

  /// Sets the cancel acknowledgement timeout.
  #[must_use]
  pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
    self.cancel_timeout = timeout;
    self
  }

  /// Sets the capacity of the execution event channel.
  #[must_use]
  pub fn with_event_buffer(mut self, capacity: usize) -> Self {
    self.event_buffer = capacity;
    self
  }
}

/// Settings for an in-process task manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTaskManagerConfig {
  /// Address reported for the task manager's instance.
  pub address: String,
  /// Number of slots the task manager offers.
  pub number_of_slots: usize,
  /// Capacity of the task manager's mailbox.
  pub mailbox_capacity: usize,
  /// How long a canceled task body may keep running before it is dropped.
  #[serde(with = "duration_ms")]
  pub cancellation_grace: Duration,
}

impl Default for LocalTaskManagerConfig {
  fn default() -> Self {
    Self {
      address: "local".to_string(),
      number_of_slots: 1,
      mailbox_capacity: 64,
      cancellation_grace: Duration::from_secs(1),
    }
  }
}

impl LocalTaskManagerConfig {
  /// Sets the reported address.
  #[must_use]
  pub fn with_address(mut self, address: impl Into<String>) -> Self {
    self.address = address.into();
    self
  }

  /// Sets the number of offered slots.
  #[must_use]
  pub fn with_slots(mut self, slots: usize) -> Self {
    self.number_of_slots = slots;
    self
  }

  /// Sets the mailbox capacity.
  #[must_use]
  pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
    self.mailbox_capacity = capacity;
    self
  }

  /// Sets how long canceled task bodies may keep running.
  #[must_use]
  pub fn with_cancellation_grace(mut self, grace: Duration) -> Self {
    self.cancellation_grace = grace;
    self
  }

  /// Checks that the values can be used.
  pub fn validate(&self) -> Result<()> {
    if self.number_of_slots == 0 {
      return Err(ExecutionGraphError::Config(
        "number_of_slots must be at least 1".to_string(),
      ));
    }
    if self.mailbox_capacity == 0 {
      return Err(ExecutionGraphError::Config(
        "mailbox_capacity must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
