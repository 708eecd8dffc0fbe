//! Intermediate results and channel fan-out.
//!
//! Each input edge of a job vertex creates one [`IntermediateResult`] on the
//! producing vertex, with one partition per producing subtask. Which consumer
//! subtasks read a partition is not stored per edge; it is computed from the
//! distribution pattern and the two parallelisms.
//!
//! Pointwise wiring for producer parallelism `p` and consumer parallelism `q`:
//!
//! | ratio       | producer `i` writes to         | consumer `j` reads from       |
//! |-------------|--------------------------------|-------------------------------|
//! | `p == q`    | `i`                            | `j`                           |
//! | `p == k*q`  | `i / k`                        | `j*k .. (j+1)*k`              |
//! | `q == k*p`  | `i*k .. (i+1)*k`               | `j / k`                       |

use crate::ids::{IntermediateResultId, JobVertexId};
use crate::jobgraph::DistributionPattern;
use std::ops::Range;

/// Whether a pointwise edge can connect the two parallelisms.
pub fn is_pointwise_compatible(producer_parallelism: usize, consumer_parallelism: usize) -> bool {
  producer_parallelism > 0
    && consumer_parallelism > 0
    && (producer_parallelism % consumer_parallelism == 0
      || consumer_parallelism % producer_parallelism == 0)
}

/// Consumer subtasks that producer subtask `producer_index` writes to.
pub fn consumer_indices(
  pattern: DistributionPattern,
  producer_index: usize,
  producer_parallelism: usize,
  consumer_parallelism: usize,
) -> Range<usize> {
  match pattern {
    DistributionPattern::Bipartite => 0..consumer_parallelism,
    DistributionPattern::Pointwise => {
      if producer_parallelism >= consumer_parallelism {
        let factor = producer_parallelism / consumer_parallelism;
        let target = producer_index / factor;
        target..target + 1
      } else {
        let factor = consumer_parallelism / producer_parallelism;
        producer_index * factor..(producer_index + 1) * factor
      }
    }
  }
}

/// Producer subtasks that consumer subtask `consumer_index` reads from.
pub fn producer_indices(
  pattern: DistributionPattern,
  consumer_index: usize,
  producer_parallelism: usize,
  consumer_parallelism: usize,
) -> Range<usize> {
  match pattern {
    DistributionPattern::Bipartite => 0..producer_parallelism,
    DistributionPattern::Pointwise => {
      if producer_parallelism >= consumer_parallelism {
        let factor = producer_parallelism / consumer_parallelism;
        consumer_index * factor..(consumer_index + 1) * factor
      } else {
        let factor = consumer_parallelism / producer_parallelism;
        let source = consumer_index / factor;
        source..source + 1
      }
    }
  }
}

/// The data set one vertex produces for one consumer edge.
#[derive(Debug, Clone)]
pub struct IntermediateResult {
  id: IntermediateResultId,
  producer: JobVertexId,
  producer_parallelism: usize,
  consumer: JobVertexId,
  consumer_parallelism: usize,
  pattern: DistributionPattern,
  partitions: Vec<IntermediateResultPartition>,
}

impl IntermediateResult {
  pub(crate) fn new(
    producer: JobVertexId,
    producer_parallelism: usize,
    consumer: JobVertexId,
    consumer_parallelism: usize,
    pattern: DistributionPattern,
  ) -> Self {
    let id = IntermediateResultId::generate();
    let partitions = (0..producer_parallelism)
      .map(|partition_number| IntermediateResultPartition {
        result_id: id,
        partition_number,
        pattern,
        producer_parallelism,
        consumer_parallelism,
      })
      .collect();
    Self {
      id,
      producer,
      producer_parallelism,
      consumer,
      consumer_parallelism,
      pattern,
      partitions,
    }
  }

  /// The result id.
  pub fn id(&self) -> IntermediateResultId {
    self.id
  }

  /// Vertex that produces the result.
  pub fn producer(&self) -> JobVertexId {
    self.producer
  }

  /// Vertex that consumes the result.
  pub fn consumer(&self) -> JobVertexId {
    self.consumer
  }

  /// Parallelism of the producer.
  pub fn producer_parallelism(&self) -> usize {
    self.producer_parallelism
  }

  /// Parallelism of the consumer.
  pub fn consumer_parallelism(&self) -> usize {
    self.consumer_parallelism
  }

  /// Wiring of the edge.
  pub fn pattern(&self) -> DistributionPattern {
    self.pattern
  }

  /// One partition per producing subtask.
  pub fn partitions(&self) -> &[IntermediateResultPartition] {
    &self.partitions
  }

  /// Number of partitions.
  pub fn number_of_partitions(&self) -> usize {
    self.partitions.len()
  }
}

/// The part of a result written by one producing subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateResultPartition {
  result_id: IntermediateResultId,
  partition_number: usize,
  pattern: DistributionPattern,
  producer_parallelism: usize,
  consumer_parallelism: usize,
}

impl IntermediateResultPartition {
  /// Result the partition belongs to.
  pub fn result_id(&self) -> IntermediateResultId {
    self.result_id
  }

  /// Index of the producing subtask.
  pub fn partition_number(&self) -> usize {
    self.partition_number
  }

  /// Consumer subtasks that read this partition.
  pub fn consumer_subtasks(&self) -> Range<usize> {
    consumer_indices(
      self.pattern,
      self.partition_number,
      self.producer_parallelism,
      self.consumer_parallelism,
    )
  }
}
