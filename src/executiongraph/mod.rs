//! # Execution Graph
//!
//! Physical topology and attempt bookkeeping of a job.
//!
//! ```text
//! ExecutionGraph
//!  ├── ExecutionJobVertex (one per job vertex)
//!  │    ├── ExecutionVertex (one per subtask)
//!  │    │    └── Execution (current attempt)
//!  │    └── IntermediateResult (one per consumer edge)
//!  └── ExecutionRegistry (live attempts by attempt id)
//! ```

mod execution;
mod graph;
mod intermediate_result;
mod job_vertex;
mod registry;
mod state;
mod vertex;

pub use execution::Execution;
pub use graph::{ExecutionGraph, TopologySnapshot, VertexSnapshot};
pub use intermediate_result::{
  IntermediateResult, IntermediateResultPartition, consumer_indices, is_pointwise_compatible,
  producer_indices,
};
pub use job_vertex::ExecutionJobVertex;
pub use registry::{ExecutionEvent, ExecutionRegistry};
pub use state::{ExecutionState, JobStatus};
pub use vertex::ExecutionVertex;

#[cfg(test)]
mod graph_test;
