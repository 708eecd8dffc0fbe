//! # Execution Graph
//!
//! The physical topology of one job: an [`ExecutionJobVertex`] per attached
//! job vertex, an [`ExecutionVertex`] per subtask, and the graph-wide
//! [`ExecutionRegistry`] of live attempts.
//!
//! ## Building
//!
//! [`ExecutionGraph::attach_job_graph`] takes job vertices in topological
//! order. Each input edge creates an [`IntermediateResult`] on its producer.
//! The whole call is validated before anything is committed, so a failing
//! attach leaves the graph exactly as it was.
//!
//! ## Scheduling
//!
//! [`ExecutionGraph::schedule_for_execution`] requests one slot per subtask
//! in vertex creation order. Without queued scheduling the pass is
//! all-or-nothing: every slot is bound before the first deployment is sent,
//! and a shortage returns every slot bound so far. With queued scheduling,
//! subtasks that get no slot right away are deployed in the background once
//! their slot arrives. Only one pass runs at a time.

use super::execution::{AttemptTimeouts, Execution};
use super::intermediate_result::{IntermediateResult, is_pointwise_compatible};
use super::job_vertex::{ExecutionJobVertex, VertexTopology};
use super::registry::{ExecutionEvent, ExecutionRegistry};
use super::state::{ExecutionState, JobStatus};
use super::vertex::ExecutionVertex;
use crate::config::ExecutionConfig;
use crate::deployment::TaskExecutionState;
use crate::error::{ExecutionGraphError, Result};
use crate::ids::{ExecutionAttemptId, JobId, JobVertexId};
use crate::instance::AllocatedSlot;
use crate::jobgraph::{DistributionPattern, JobVertex};
use crate::scheduler::{Scheduler, SlotAllocation};
use crate::sync::{lock, read, write};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LIFECYCLE_CREATED: u8 = 0;
const LIFECYCLE_SCHEDULING: u8 = 1;
const LIFECYCLE_RUNNING: u8 = 2;
const LIFECYCLE_CANCELING: u8 = 3;

#[derive(Default)]
struct Topology {
  tasks: HashMap<JobVertexId, Arc<ExecutionJobVertex>>,
  in_creation_order: Vec<Arc<ExecutionJobVertex>>,
}

/// States of all subtasks of one vertex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexSnapshot {
  /// The vertex.
  pub vertex_id: JobVertexId,
  /// Name of the vertex.
  pub name: String,
  /// Current attempt state per subtask index.
  pub subtask_states: Vec<ExecutionState>,
}

/// Point-in-time view of a job's topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
  /// The job.
  pub job_id: JobId,
  /// Aggregated job status.
  pub status: JobStatus,
  /// Vertices in creation order.
  pub vertices: Vec<VertexSnapshot>,
  /// When the snapshot was taken.
  pub taken_at: DateTime<Utc>,
}

impl TopologySnapshot {
  /// Subtask states of one vertex.
  pub fn states_of(&self, vertex_id: JobVertexId) -> Option<&[ExecutionState]> {
    self
      .vertices
      .iter()
      .find(|vertex| vertex.vertex_id == vertex_id)
      .map(|vertex| vertex.subtask_states.as_slice())
  }

  /// Number of subtasks in `state` over all vertices.
  pub fn count_in_state(&self, state: ExecutionState) -> usize {
    self
      .vertices
      .iter()
      .flat_map(|vertex| vertex.subtask_states.iter())
      .filter(|s| **s == state)
      .count()
  }
}

/// The physical execution topology of one job.
pub struct ExecutionGraph {
  job_id: JobId,
  job_name: String,
  config: ExecutionConfig,
  timeouts: AttemptTimeouts,
  registry: Arc<ExecutionRegistry>,
  topology: RwLock<Topology>,
  lifecycle: AtomicU8,
  created_at: DateTime<Utc>,
  /// Scheduler of the last scheduling pass, for withdrawing queued requests.
  scheduler: Mutex<Option<Weak<Scheduler>>>,
  queued_work: CancellationToken,
}

impl ExecutionGraph {
  /// Creates an empty graph.
  pub fn new(job_id: JobId, job_name: impl Into<String>, config: ExecutionConfig) -> Self {
    let registry = ExecutionRegistry::new(job_id, config.event_buffer);
    Self {
      job_id,
      job_name: job_name.into(),
      timeouts: AttemptTimeouts::from(&config),
      config,
      registry,
      topology: RwLock::new(Topology::default()),
      lifecycle: AtomicU8::new(LIFECYCLE_CREATED),
      created_at: Utc::now(),
      scheduler: Mutex::new(None),
      queued_work: CancellationToken::new(),
    }
  }

  /// The job id.
  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  /// The job name.
  pub fn job_name(&self) -> &str {
    &self.job_name
  }

  /// Settings the graph was created with.
  pub fn config(&self) -> &ExecutionConfig {
    &self.config
  }

  /// When the graph was created.
  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  /// Registry of live attempts.
  pub fn registry(&self) -> &Arc<ExecutionRegistry> {
    &self.registry
  }

  /// Number of live attempts.
  pub fn registered_executions(&self) -> usize {
    self.registry.len()
  }

  /// Subscribes to the state changes of all attempts of this graph.
  pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
    self.registry.subscribe()
  }

  /// Attaches job vertices given in topological order.
  ///
  /// Fails without changing the graph if a vertex is attached twice, has a
  /// parallelism below one, consumes a vertex that is not attached before
  /// it, or is connected pointwise to a vertex with an incompatible
  /// parallelism. Vertices can only be attached before the first scheduling
  /// pass.
  pub fn attach_job_graph(&self, vertices: &[&JobVertex]) -> Result<()> {
    let mut topology = write(&self.topology);
    if self.lifecycle.load(Ordering::Acquire) != LIFECYCLE_CREATED {
      return Err(ExecutionGraphError::InvalidTopology(format!(
        "cannot attach vertices to job {} after scheduling started",
        self.job_id
      )));
    }

    let mut attached: Vec<Arc<ExecutionJobVertex>> = Vec::with_capacity(vertices.len());
    let mut attached_ids: HashSet<JobVertexId> = HashSet::with_capacity(vertices.len());
    let mut produced: Vec<(Arc<VertexTopology>, Arc<IntermediateResult>)> = Vec::new();

    for job_vertex in vertices {
      let id = job_vertex.id();
      if topology.tasks.contains_key(&id) || attached_ids.contains(&id) {
        return Err(ExecutionGraphError::DuplicateVertex(id));
      }
      let parallelism = job_vertex.parallelism();
      if parallelism < 1 {
        return Err(ExecutionGraphError::InvalidTopology(format!(
          "vertex '{}' ({}) has parallelism {}",
          job_vertex.name(),
          id,
          parallelism
        )));
      }

      let mut inputs = Vec::with_capacity(job_vertex.inputs().len());
      for edge in job_vertex.inputs() {
        let producer = attached
          .iter()
          .find(|v| v.id() == edge.source)
          .or_else(|| topology.tasks.get(&edge.source))
          .ok_or_else(|| {
            ExecutionGraphError::InvalidTopology(format!(
              "vertex '{}' ({}) consumes {} which is not attached before it",
              job_vertex.name(),
              id,
              edge.source
            ))
          })?;

        if edge.pattern == DistributionPattern::Pointwise
          && !is_pointwise_compatible(producer.parallelism(), parallelism)
        {
          return Err(ExecutionGraphError::IncompatibleParallelism {
            producer: producer.id(),
            producer_parallelism: producer.parallelism(),
            consumer: id,
            consumer_parallelism: parallelism,
          });
        }

        let result = Arc::new(IntermediateResult::new(
          producer.id(),
          producer.parallelism(),
          id,
          parallelism,
          edge.pattern,
        ));
        produced.push((Arc::clone(producer.topology()), Arc::clone(&result)));
        inputs.push(result);
      }

      let vertex_topology = Arc::new(VertexTopology {
        job_id: self.job_id,
        vertex_id: id,
        name: job_vertex.name().to_string(),
        invokable_id: job_vertex.invokable_id().map(str::to_string),
        parallelism,
        inputs,
        produced: RwLock::new(Vec::new()),
      });
      let task_vertices = (0..parallelism)
        .map(|index| {
          ExecutionVertex::new(
            Arc::clone(&vertex_topology),
            index,
            self.timeouts,
            Arc::clone(&self.registry),
          )
        })
        .collect();
      attached_ids.insert(id);
      attached.push(Arc::new(ExecutionJobVertex::new(
        vertex_topology,
        task_vertices,
      )));
    }

    for (producer, result) in produced {
      write(&producer.produced).push(result);
    }
    let mut subtasks = 0;
    for job_vertex in attached {
      for vertex in job_vertex.task_vertices() {
        self.registry.register(vertex.current_execution());
      }
      subtasks += job_vertex.parallelism();
      debug!(
        job = %self.job_id,
        vertex = %job_vertex.id(),
        name = job_vertex.name(),
        parallelism = job_vertex.parallelism(),
        "job vertex attached"
      );
      topology.tasks.insert(job_vertex.id(), Arc::clone(&job_vertex));
      topology.in_creation_order.push(job_vertex);
    }
    info!(
      job = %self.job_id,
      name = %self.job_name,
      vertices = vertices.len(),
      subtasks,
      "job graph attached"
    );
    Ok(())
  }

  /// Looks up an attached vertex.
  pub fn job_vertex(&self, vertex_id: JobVertexId) -> Option<Arc<ExecutionJobVertex>> {
    read(&self.topology).tasks.get(&vertex_id).cloned()
  }

  /// Attached vertices in creation order.
  pub fn vertices_in_creation_order(&self) -> Vec<Arc<ExecutionJobVertex>> {
    read(&self.topology).in_creation_order.clone()
  }

  /// All subtasks, vertex by vertex in creation order.
  pub fn all_execution_vertices(&self) -> Vec<Arc<ExecutionVertex>> {
    read(&self.topology)
      .in_creation_order
      .iter()
      .flat_map(|job_vertex| job_vertex.task_vertices().iter().cloned())
      .collect()
  }

  /// Total number of subtasks.
  pub fn number_of_execution_vertices(&self) -> usize {
    read(&self.topology)
      .in_creation_order
      .iter()
      .map(|job_vertex| job_vertex.parallelism())
      .sum()
  }

  /// Requests slots for all subtasks and deploys them.
  ///
  /// Deployment failures of single attempts do not fail the pass; they show
  /// up as `FAILED` attempts. A pass that fails with `NotEnoughSlots` leaves
  /// the graph ready to be scheduled again.
  pub async fn schedule_for_execution(&self, scheduler: &Scheduler) -> Result<()> {
    if let Err(current) = self.lifecycle.compare_exchange(
      LIFECYCLE_CREATED,
      LIFECYCLE_SCHEDULING,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      let from = if current == LIFECYCLE_SCHEDULING {
        "SCHEDULING".to_string()
      } else {
        self.job_status().to_string()
      };
      return Err(ExecutionGraphError::illegal_transition(
        format!("job {}", self.job_id),
        from,
        JobStatus::Running,
      ));
    }

    *lock(&self.scheduler) = Some(scheduler.downgrade());
    let vertices: Vec<Arc<ExecutionVertex>> = self
      .all_execution_vertices()
      .into_iter()
      .filter(|vertex| vertex.execution_state() == ExecutionState::Created)
      .collect();
    info!(
      job = %self.job_id,
      subtasks = vertices.len(),
      queued = self.config.queued_scheduling_allowed,
      "scheduling job"
    );

    let outcome = if self.config.queued_scheduling_allowed {
      self.schedule_queued(scheduler, vertices).await
    } else {
      self.schedule_all_or_nothing(scheduler, vertices).await
    };

    match outcome {
      Ok(()) => {
        let _ = self.lifecycle.compare_exchange(
          LIFECYCLE_SCHEDULING,
          LIFECYCLE_RUNNING,
          Ordering::AcqRel,
          Ordering::Acquire,
        );
        info!(job = %self.job_id, "scheduling pass complete");
        Ok(())
      }
      Err(e) => {
        let _ = self.lifecycle.compare_exchange(
          LIFECYCLE_SCHEDULING,
          LIFECYCLE_CREATED,
          Ordering::AcqRel,
          Ordering::Acquire,
        );
        warn!(job = %self.job_id, error = %e, "scheduling pass failed");
        Err(e)
      }
    }
  }

  async fn schedule_all_or_nothing(
    &self,
    scheduler: &Scheduler,
    vertices: Vec<Arc<ExecutionVertex>>,
  ) -> Result<()> {
    let mut bound: Vec<(Arc<ExecutionVertex>, Arc<AllocatedSlot>)> =
      Vec::with_capacity(vertices.len());
    for vertex in vertices {
      match scheduler.schedule_immediately(vertex.scheduled_unit()) {
        Ok(slot) => bound.push((vertex, slot)),
        Err(e) => {
          debug!(
            job = %self.job_id,
            returned = bound.len(),
            "returning slots bound in failed scheduling pass"
          );
          for (_, slot) in bound {
            slot.release();
          }
          return Err(e);
        }
      }
    }

    join_all(
      bound
        .into_iter()
        .map(|(vertex, slot)| deploy_or_return_slot(vertex, slot)),
    )
    .await;
    Ok(())
  }

  async fn schedule_queued(
    &self,
    scheduler: &Scheduler,
    vertices: Vec<Arc<ExecutionVertex>>,
  ) -> Result<()> {
    let mut immediate: Vec<(Arc<ExecutionVertex>, Arc<AllocatedSlot>)> = Vec::new();
    for vertex in vertices {
      let allocation = match scheduler.schedule(vertex.scheduled_unit(), true) {
        Ok(allocation) => allocation,
        Err(e) => {
          for (_, slot) in immediate {
            slot.release();
          }
          return Err(e);
        }
      };
      match allocation {
        SlotAllocation::Immediate(slot) => immediate.push((vertex, slot)),
        SlotAllocation::Queued(pending) => {
          let cancel = self.queued_work.clone();
          tokio::spawn(async move {
            match pending.wait_or_cancel(&cancel).await {
              Ok(Some(slot)) => deploy_or_return_slot(vertex, slot).await,
              Ok(None) => debug!(
                task = %vertex.task_name_with_subtask(),
                "queued slot request abandoned"
              ),
              Err(e) => debug!(
                task = %vertex.task_name_with_subtask(),
                error = %e,
                "queued slot request ended without a slot"
              ),
            }
          });
        }
      }
    }
    join_all(
      immediate
        .into_iter()
        .map(|(vertex, slot)| deploy_or_return_slot(vertex, slot)),
    )
    .await;
    Ok(())
  }

  /// Cancels every live attempt of the job.
  ///
  /// Slot requests still waiting in the scheduler are withdrawn first, so
  /// slots freed by the canceled attempts go to other jobs.
  pub async fn cancel(&self) -> Result<()> {
    self.lifecycle.store(LIFECYCLE_CANCELING, Ordering::Release);
    self.withdraw_queued_requests();
    let live = self.registry.live_executions();
    info!(job = %self.job_id, live = live.len(), "canceling job");

    let results = join_all(live.iter().map(|execution| execution.cancel())).await;
    for (execution, result) in live.iter().zip(results) {
      if let Err(e) = result {
        debug!(attempt = %execution.attempt_id(), error = %e, "attempt ended before it was canceled");
      }
    }
    Ok(())
  }

  fn withdraw_queued_requests(&self) {
    self.queued_work.cancel();
    let scheduler = lock(&self.scheduler).as_ref().and_then(Weak::upgrade);
    if let Some(scheduler) = scheduler {
      scheduler.cancel_requests(self.job_id);
    }
  }

  /// Aggregated status of the job.
  pub fn job_status(&self) -> JobStatus {
    let states: Vec<ExecutionState> = self
      .all_execution_vertices()
      .iter()
      .map(|vertex| vertex.execution_state())
      .collect();
    let lifecycle = self.lifecycle.load(Ordering::Acquire);
    let all_terminal = states.iter().all(|s| s.is_terminal());

    if states.contains(&ExecutionState::Failed) {
      return if all_terminal {
        JobStatus::Failed
      } else {
        JobStatus::Failing
      };
    }
    if lifecycle == LIFECYCLE_CANCELING {
      return if all_terminal {
        JobStatus::Canceled
      } else {
        JobStatus::Canceling
      };
    }
    if lifecycle == LIFECYCLE_CREATED {
      return JobStatus::Created;
    }
    if all_terminal {
      if states.iter().all(|s| *s == ExecutionState::Finished) {
        return JobStatus::Finished;
      }
      return JobStatus::Canceled;
    }
    JobStatus::Running
  }

  /// Current state of every subtask.
  pub fn topology_snapshot(&self) -> TopologySnapshot {
    let vertices = self
      .vertices_in_creation_order()
      .iter()
      .map(|job_vertex| VertexSnapshot {
        vertex_id: job_vertex.id(),
        name: job_vertex.name().to_string(),
        subtask_states: job_vertex.subtask_states(),
      })
      .collect();
    TopologySnapshot {
      job_id: self.job_id,
      status: self.job_status(),
      vertices,
      taken_at: Utc::now(),
    }
  }

  /// Finds an attempt of this job, live or not.
  pub fn find_execution(&self, attempt_id: ExecutionAttemptId) -> Option<Arc<Execution>> {
    if let Some(execution) = self.registry.get(attempt_id) {
      return Some(execution);
    }
    self.all_execution_vertices().iter().find_map(|vertex| {
      let current = vertex.current_execution();
      if current.attempt_id() == attempt_id {
        return Some(current);
      }
      vertex
        .prior_executions()
        .into_iter()
        .find(|prior| prior.attempt_id() == attempt_id)
    })
  }

  /// State of an attempt of this job.
  pub fn execution_state(&self, attempt_id: ExecutionAttemptId) -> Option<ExecutionState> {
    self
      .find_execution(attempt_id)
      .map(|execution| execution.state())
  }

  /// Applies a state report from a worker.
  ///
  /// Returns false if the attempt is not live in this graph, which happens
  /// for late reports about attempts that already ended.
  pub fn update_state(&self, update: &TaskExecutionState) -> Result<bool> {
    let Some(execution) = self.registry.get(update.attempt_id) else {
      debug!(
        job = %self.job_id,
        attempt = %update.attempt_id,
        state = %update.state,
        "report for an attempt that is not live"
      );
      return Ok(false);
    };

    match update.state {
      ExecutionState::Running => {
        execution.switch_to_running();
      }
      ExecutionState::Finished => {
        if execution.state() == ExecutionState::Canceling {
          execution.canceling_complete()?;
        } else {
          execution.switch_to_running();
          execution.mark_finished()?;
        }
      }
      ExecutionState::Canceled => {
        if execution.state() == ExecutionState::Canceling {
          execution.canceling_complete()?;
        } else {
          execution.fail(Some(
            "task was canceled on the worker without a cancel request".to_string(),
          ))?;
        }
      }
      ExecutionState::Failed => execution.fail(update.error.clone())?,
      other => {
        debug!(
          attempt = %update.attempt_id,
          state = %other,
          "ignoring report of a non-final worker state"
        );
      }
    }
    Ok(true)
  }
}

async fn deploy_or_return_slot(vertex: Arc<ExecutionVertex>, slot: Arc<AllocatedSlot>) {
  let execution = vertex.current_execution();
  if let Err(e) = execution.deploy_to_slot(Arc::clone(&slot)).await {
    if slot.occupant().is_none() {
      slot.release();
    }
    debug!(
      task = %vertex.task_name_with_subtask(),
      error = %e,
      "subtask was not deployed"
    );
  }
}

impl Drop for ExecutionGraph {
  fn drop(&mut self) {
    self.withdraw_queued_requests();
  }
}

impl fmt::Debug for ExecutionGraph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionGraph")
      .field("job_id", &self.job_id)
      .field("job_name", &self.job_name)
      .field("vertices", &read(&self.topology).in_creation_order.len())
      .field("live_executions", &self.registry.len())
      .finish()
  }
}
