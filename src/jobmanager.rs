//! # Job Manager
//!
//! Front door of the engine. The job manager turns submitted [`JobGraph`]s
//! into [`ExecutionGraph`]s, schedules them on a shared [`Scheduler`], and
//! routes task state reports from workers to the graph they belong to.
//!
//! Graphs stay registered after they end (or fail to schedule) so their
//! final state can still be queried; [`JobManager::remove_job`] drops them.

use crate::config::ExecutionConfig;
use crate::deployment::TaskExecutionState;
use crate::error::{ExecutionGraphError, Result};
use crate::executiongraph::{ExecutionGraph, ExecutionState, TopologySnapshot};
use crate::ids::{ExecutionAttemptId, JobId};
use crate::jobgraph::JobGraph;
use crate::scheduler::Scheduler;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Submits, tracks and cancels jobs.
pub struct JobManager {
  scheduler: Arc<Scheduler>,
  graphs: DashMap<JobId, Arc<ExecutionGraph>>,
  default_config: ExecutionConfig,
}

impl JobManager {
  /// Creates a job manager with the default execution settings.
  pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
    Self::with_config(scheduler, ExecutionConfig::default())
  }

  /// Creates a job manager whose jobs use `config` unless told otherwise.
  pub fn with_config(scheduler: Arc<Scheduler>, config: ExecutionConfig) -> Arc<Self> {
    Arc::new(Self {
      scheduler,
      graphs: DashMap::new(),
      default_config: config,
    })
  }

  /// The shared scheduler.
  pub fn scheduler(&self) -> &Arc<Scheduler> {
    &self.scheduler
  }

  /// Submits a job with the default settings.
  pub async fn submit_job(&self, job: &JobGraph) -> Result<Arc<ExecutionGraph>> {
    self
      .submit_job_with_config(job, self.default_config.clone())
      .await
  }

  /// Builds the execution graph of `job` and schedules it.
  ///
  /// Build errors leave nothing registered. A graph that fails to schedule
  /// stays registered in `CREATED` so that its state can be inspected.
  pub async fn submit_job_with_config(
    &self,
    job: &JobGraph,
    config: ExecutionConfig,
  ) -> Result<Arc<ExecutionGraph>> {
    config.validate()?;
    let job_id = job.job_id();
    let ordered = job.topologically_sorted()?;
    let graph = Arc::new(ExecutionGraph::new(job_id, job.name(), config));
    graph.attach_job_graph(&ordered)?;

    match self.graphs.entry(job_id) {
      Entry::Occupied(_) => {
        return Err(ExecutionGraphError::InvalidTopology(format!(
          "job {} was already submitted",
          job_id
        )));
      }
      Entry::Vacant(vacant) => {
        vacant.insert(Arc::clone(&graph));
      }
    }
    info!(job = %job_id, name = job.name(), "job submitted");

    graph.schedule_for_execution(&self.scheduler).await?;
    Ok(graph)
  }

  /// The graph of a submitted job.
  pub fn graph(&self, job_id: JobId) -> Option<Arc<ExecutionGraph>> {
    self.graphs.get(&job_id).map(|entry| Arc::clone(entry.value()))
  }

  /// Ids of all registered jobs.
  pub fn job_ids(&self) -> Vec<JobId> {
    self.graphs.iter().map(|entry| *entry.key()).collect()
  }

  /// Number of registered jobs.
  pub fn number_of_jobs(&self) -> usize {
    self.graphs.len()
  }

  /// Topology snapshot of a job.
  pub fn job_status(&self, job_id: JobId) -> Result<TopologySnapshot> {
    self
      .graph(job_id)
      .map(|graph| graph.topology_snapshot())
      .ok_or(ExecutionGraphError::UnknownJob(job_id))
  }

  /// State of an attempt of any registered job.
  pub fn execution_state(&self, attempt_id: ExecutionAttemptId) -> Option<ExecutionState> {
    let graphs: Vec<Arc<ExecutionGraph>> = self
      .graphs
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    graphs
      .iter()
      .find_map(|graph| graph.execution_state(attempt_id))
  }

  /// Cancels every live attempt of a job.
  pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
    let graph = self
      .graph(job_id)
      .ok_or(ExecutionGraphError::UnknownJob(job_id))?;
    graph.cancel().await
  }

  /// Drops a job from the registry and withdraws its queued slot requests.
  /// Its attempts are not touched.
  pub fn remove_job(&self, job_id: JobId) -> Option<Arc<ExecutionGraph>> {
    let (_, graph) = self.graphs.remove(&job_id)?;
    self.scheduler.cancel_requests(job_id);
    Some(graph)
  }

  /// Applies a state report from a worker to the graph of its job.
  ///
  /// Returns false for reports about attempts that are no longer live.
  pub fn update_task_execution_state(&self, update: &TaskExecutionState) -> Result<bool> {
    let graph = self
      .graph(update.job_id)
      .ok_or(ExecutionGraphError::UnknownJob(update.job_id))?;
    graph.update_state(update)
  }

  /// Feeds every report received on `updates` into
  /// [`update_task_execution_state`](Self::update_task_execution_state)
  /// until the channel closes.
  pub fn spawn_update_listener(
    self: &Arc<Self>,
    mut updates: mpsc::Receiver<TaskExecutionState>,
  ) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      while let Some(update) = updates.recv().await {
        match manager.update_task_execution_state(&update) {
          Ok(true) => {}
          Ok(false) => debug!(attempt = %update.attempt_id, "stale task report ignored"),
          Err(e) => warn!(
            attempt = %update.attempt_id,
            state = %update.state,
            error = %e,
            "task report could not be applied"
          ),
        }
      }
      debug!("task update channel closed");
    })
  }
}

impl std::fmt::Debug for JobManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobManager")
      .field("jobs", &self.graphs.len())
      .field("scheduler", &self.scheduler)
      .finish()
  }
}
