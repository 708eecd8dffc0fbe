//! # Job Description
//!
//! The logical job graph a user submits: vertices that name the code they
//! run and how many parallel subtasks they want, and edges that state where
//! a vertex reads its input from and how that input is distributed.
//!
//! A [`JobGraph`] is consumed once by
//! [`ExecutionGraph::attach_job_graph`](crate::executiongraph::ExecutionGraph::attach_job_graph)
//! and is never modified by the engine.
//!
//! ```rust
//! use weaveflow::jobgraph::{DistributionPattern, JobGraph, JobVertex};
//!
//! let mut source = JobVertex::new("source");
//! source.set_parallelism(4);
//! let mut sink = JobVertex::new("sink");
//! sink.set_parallelism(2);
//! sink.connect_new_data_set_as_input(&source, DistributionPattern::Pointwise);
//!
//! let mut job = JobGraph::new("example");
//! job.add_vertex(source).unwrap();
//! job.add_vertex(sink).unwrap();
//! assert_eq!(job.topologically_sorted().unwrap().len(), 2);
//! ```

use crate::error::{ExecutionGraphError, Result};
use crate::ids::{JobId, JobVertexId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// How the subtasks of a producer are wired to the subtasks of a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionPattern {
  /// Index-aligned wiring: one-to-one, or a fixed fan-in/fan-out ratio when
  /// one parallelism is a multiple of the other.
  Pointwise,
  /// All-to-all wiring: every producer subtask talks to every consumer
  /// subtask.
  Bipartite,
}

impl fmt::Display for DistributionPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DistributionPattern::Pointwise => write!(f, "POINTWISE"),
      DistributionPattern::Bipartite => write!(f, "BIPARTITE"),
    }
  }
}

/// An input edge of a job vertex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEdge {
  /// Vertex that produces the data.
  pub source: JobVertexId,
  /// How producer subtasks are wired to consumer subtasks.
  pub pattern: DistributionPattern,
}

/// A logical operator in a job description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVertex {
  id: JobVertexId,
  name: String,
  parallelism: usize,
  #[serde(default)]
  invokable_id: Option<String>,
  #[serde(default)]
  inputs: Vec<JobEdge>,
}

impl JobVertex {
  /// Creates a vertex whose id is derived from its name.
  pub fn new(name: impl Into<String>) -> Self {
    let name = name.into();
    let id = JobVertexId::from_name(&name);
    Self::with_id(name, id)
  }

  /// Creates a vertex with an explicit id.
  pub fn with_id(name: impl Into<String>, id: JobVertexId) -> Self {
    Self {
      id,
      name: name.into(),
      parallelism: 1,
      invokable_id: None,
      inputs: Vec::new(),
    }
  }

  /// The vertex id.
  pub fn id(&self) -> JobVertexId {
    self.id
  }

  /// The display name, also used as the task name of its subtasks.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of parallel subtasks requested.
  pub fn parallelism(&self) -> usize {
    self.parallelism
  }

  /// Sets the number of parallel subtasks. Values below one are rejected
  /// when the vertex is attached.
  pub fn set_parallelism(&mut self, parallelism: usize) {
    self.parallelism = parallelism;
  }

  /// Identifier of the code the subtasks run.
  pub fn invokable_id(&self) -> Option<&str> {
    self.invokable_id.as_deref()
  }

  /// Sets the identifier of the code the subtasks run.
  pub fn set_invokable(&mut self, invokable_id: impl Into<String>) {
    self.invokable_id = Some(invokable_id.into());
  }

  /// Input edges in declaration order.
  pub fn inputs(&self) -> &[JobEdge] {
    &self.inputs
  }

  /// Declares that this vertex consumes a new data set produced by `source`.
  pub fn connect_new_data_set_as_input(
    &mut self,
    source: &JobVertex,
    pattern: DistributionPattern,
  ) {
    self.connect_to(source.id(), pattern);
  }

  /// Declares an input edge by the producer's id.
  pub fn connect_to(&mut self, source: JobVertexId, pattern: DistributionPattern) {
    self.inputs.push(JobEdge { source, pattern });
  }
}

/// A complete job description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobGraph {
  job_id: JobId,
  name: String,
  vertices: Vec<JobVertex>,
}

impl JobGraph {
  /// Creates an empty job with a fresh id.
  pub fn new(name: impl Into<String>) -> Self {
    Self::with_job_id(JobId::generate(), name)
  }

  /// Creates an empty job with the given id.
  pub fn with_job_id(job_id: JobId, name: impl Into<String>) -> Self {
    Self {
      job_id,
      name: name.into(),
      vertices: Vec::new(),
    }
  }

  /// The job id.
  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  /// The job name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Adds a vertex. Vertex ids must be unique within the job.
  pub fn add_vertex(&mut self, vertex: JobVertex) -> Result<()> {
    if self.vertex(vertex.id()).is_some() {
      return Err(ExecutionGraphError::DuplicateVertex(vertex.id()));
    }
    self.vertices.push(vertex);
    Ok(())
  }

  /// Looks up a vertex by id.
  pub fn vertex(&self, id: JobVertexId) -> Option<&JobVertex> {
    self.vertices.iter().find(|v| v.id() == id)
  }

  /// All vertices in insertion order.
  pub fn vertices(&self) -> &[JobVertex] {
    &self.vertices
  }

  /// Number of vertices.
  pub fn number_of_vertices(&self) -> usize {
    self.vertices.len()
  }

  /// Returns the vertices ordered so that every producer precedes its
  /// consumers.
  ///
  /// Ties keep insertion order. Edges to vertices outside the job and cycles
  /// are rejected with `InvalidTopology`.
  pub fn topologically_sorted(&self) -> Result<Vec<&JobVertex>> {
    let position: HashMap<JobVertexId, usize> = self
      .vertices
      .iter()
      .enumerate()
      .map(|(i, v)| (v.id(), i))
      .collect();

    let mut in_degree = vec![0usize; self.vertices.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); self.vertices.len()];

    for (target, vertex) in self.vertices.iter().enumerate() {
      for edge in vertex.inputs() {
        let source = *position.get(&edge.source).ok_or_else(|| {
          ExecutionGraphError::InvalidTopology(format!(
            "vertex '{}' reads from {} which is not part of job '{}'",
            vertex.name(),
            edge.source,
            self.name
          ))
        })?;
        consumers[source].push(target);
        in_degree[target] += 1;
      }
    }

    // Kahn's algorithm
    let mut queue: VecDeque<usize> = (0..self.vertices.len())
      .filter(|&i| in_degree[i] == 0)
      .collect();
    let mut ordered = Vec::with_capacity(self.vertices.len());
    while let Some(next) = queue.pop_front() {
      ordered.push(&self.vertices[next]);
      for &consumer in &consumers[next] {
        in_degree[consumer] -= 1;
        if in_degree[consumer] == 0 {
          queue.push_back(consumer);
        }
      }
    }

    if ordered.len() != self.vertices.len() {
      return Err(ExecutionGraphError::InvalidTopology(format!(
        "job '{}' contains a cycle",
        self.name
      )));
    }
    Ok(ordered)
  }
}
