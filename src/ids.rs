//! Identifiers for jobs, vertices, results, attempts and instances.
//!
//! All identifiers are random 128-bit values. They are cheap to copy, hash
//! and compare, and are rendered as 32 lower-case hex digits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! define_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct $name(u128);

    impl $name {
      /// Generates a new random identifier.
      #[must_use]
      pub fn generate() -> Self {
        Self(rand::random::<u128>())
      }

      /// Wraps a raw value.
      #[must_use]
      pub const fn from_u128(raw: u128) -> Self {
        Self(raw)
      }

      /// Returns the raw value.
      pub const fn as_u128(self) -> u128 {
        self.0
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
      }
    }
  };
}

define_id!(
  /// Identity of a submitted job.
  JobId
);

define_id!(
  /// Identity of a logical vertex in a job description.
  JobVertexId
);

define_id!(
  /// Identity of the data set produced by one job vertex for one consumer.
  IntermediateResultId
);

define_id!(
  /// Identity of one deployment attempt of a subtask. Never reused.
  ExecutionAttemptId
);

define_id!(
  /// Identity of a worker's resource offer.
  InstanceId
);

impl JobVertexId {
  /// Derives a stable vertex id from a name.
  ///
  /// The same name always yields the same id, which keeps job descriptions
  /// written by hand readable.
  #[must_use]
  pub fn from_name(name: &str) -> Self {
    let digest = Sha256::digest(name.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    Self(u128::from_be_bytes(raw))
  }
}

/// Identity of one wire between a producer subtask and a consumer subtask.
///
/// Both ends of a channel compute the same id from the result they share and
/// their subtask indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
  /// Result the channel carries.
  pub result: IntermediateResultId,
  /// Subtask index of the producer.
  pub producer_index: usize,
  /// Subtask index of the consumer.
  pub consumer_index: usize,
}

impl fmt::Display for ChannelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}[{}->{}]",
      self.result, self.producer_index, self.consumer_index
    )
  }
}
