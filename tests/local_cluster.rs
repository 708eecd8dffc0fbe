//! End-to-end runs of jobs on in-process task managers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use weaveflow::config::{ExecutionConfig, LocalTaskManagerConfig};
use weaveflow::executiongraph::{ExecutionState, JobStatus};
use weaveflow::ids::JobId;
use weaveflow::invokable::{InvokableRegistry, TaskContext, TaskResult};
use weaveflow::jobgraph::{DistributionPattern, JobGraph, JobVertex};
use weaveflow::jobmanager::JobManager;
use weaveflow::scheduler::Scheduler;
use weaveflow::taskmanager::{LocalTaskManager, LocalTaskManagerHandle};

struct Cluster {
  manager: Arc<JobManager>,
  workers: Vec<LocalTaskManagerHandle>,
}

impl Cluster {
  async fn start(workers: usize, slots: usize, invokables: InvokableRegistry) -> Self {
    weaveflow::logging::init_tracing(tracing::Level::DEBUG);
    let invokables = Arc::new(invokables);
    let (updates_tx, updates_rx) = mpsc::channel(256);
    let scheduler = Scheduler::new();
    let mut handles = Vec::new();
    for i in 0..workers {
      let config = LocalTaskManagerConfig::default()
        .with_address(format!("worker-{}", i))
        .with_slots(slots)
        .with_cancellation_grace(Duration::from_millis(50));
      let handle = LocalTaskManager::spawn(config, invokables.clone(), updates_tx.clone()).unwrap();
      scheduler
        .new_instance_available(handle.instance().clone())
        .unwrap();
      handles.push(handle);
    }
    let manager = JobManager::with_config(
      scheduler,
      ExecutionConfig::default().with_deployment_timeout(Duration::from_secs(2)),
    );
    manager.spawn_update_listener(updates_rx);
    Cluster {
      manager,
      workers: handles,
    }
  }

  async fn wait_for_status(&self, job_id: JobId, expected: JobStatus) {
    for _ in 0..400 {
      if self.manager.job_status(job_id).unwrap().status == expected {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snapshot = self.manager.job_status(job_id).unwrap();
    panic!("job is {} instead of {}: {:?}", snapshot.status, expected, snapshot);
  }

  async fn stop(self) {
    for worker in self.workers {
      worker.shutdown().await;
    }
  }
}

fn vertex(name: &str, parallelism: usize, invokable: &str) -> JobVertex {
  let mut vertex = JobVertex::new(name);
  vertex.set_parallelism(parallelism);
  vertex.set_invokable(invokable);
  vertex
}

#[tokio::test]
async fn test_pipeline_runs_to_completion() {
  let wired = Arc::new(AtomicUsize::new(0));
  let invokables = InvokableRegistry::new();
  let counter = wired.clone();
  invokables.register_fn("count-channels", move |context: TaskContext| {
    let counter = counter.clone();
    async move {
      let descriptor = context.descriptor();
      counter.fetch_add(
        descriptor.number_of_input_channels() + descriptor.number_of_output_channels(),
        Ordering::SeqCst,
      );
      TaskResult::Ok(())
    }
  });
  let cluster = Cluster::start(2, 4, invokables).await;

  let source = vertex("source", 2, "count-channels");
  let mut map = vertex("map", 4, "count-channels");
  let mut sink = vertex("sink", 1, "count-channels");
  map.connect_new_data_set_as_input(&source, DistributionPattern::Pointwise);
  sink.connect_new_data_set_as_input(&map, DistributionPattern::Bipartite);
  let mut job = JobGraph::new("pipeline");
  job.add_vertex(source).unwrap();
  job.add_vertex(map).unwrap();
  job.add_vertex(sink).unwrap();

  cluster.manager.submit_job(&job).await.unwrap();
  cluster.wait_for_status(job.job_id(), JobStatus::Finished).await;

  // 4 pointwise and 4 bipartite channels, each counted at both ends
  assert_eq!(wired.load(Ordering::SeqCst), 16);
  let snapshot = cluster.manager.job_status(job.job_id()).unwrap();
  assert_eq!(snapshot.count_in_state(ExecutionState::Finished), 7);
  assert_eq!(cluster.manager.scheduler().number_of_available_slots(), 8);
  cluster.stop().await;
}

#[tokio::test]
async fn test_more_subtasks_than_slots_are_queued() {
  let invokables = InvokableRegistry::new();
  invokables.register_fn("nap", |_context: TaskContext| async {
    tokio::time::sleep(Duration::from_millis(10)).await;
    TaskResult::Ok(())
  });
  let cluster = Cluster::start(1, 2, invokables).await;

  let mut job = JobGraph::new("queued");
  job.add_vertex(vertex("wide", 6, "nap")).unwrap();
  cluster.manager.submit_job(&job).await.unwrap();
  cluster.wait_for_status(job.job_id(), JobStatus::Finished).await;
  assert_eq!(cluster.manager.scheduler().number_of_queued_requests(), 0);
  cluster.stop().await;
}

#[tokio::test]
async fn test_failing_subtask_fails_the_job() {
  let invokables = InvokableRegistry::new();
  invokables.register_fn("fail-odd", |context: TaskContext| async move {
    if context.subtask_index() % 2 == 1 {
      return TaskResult::Err(format!("subtask {} refuses", context.subtask_index()).into());
    }
    TaskResult::Ok(())
  });
  let cluster = Cluster::start(1, 4, invokables).await;

  let mut job = JobGraph::new("failing");
  job.add_vertex(vertex("flaky", 4, "fail-odd")).unwrap();
  let graph = cluster.manager.submit_job(&job).await.unwrap();
  cluster.wait_for_status(job.job_id(), JobStatus::Failed).await;

  let snapshot = cluster.manager.job_status(job.job_id()).unwrap();
  assert_eq!(snapshot.count_in_state(ExecutionState::Failed), 2);
  assert_eq!(snapshot.count_in_state(ExecutionState::Finished), 2);
  let failed = graph
    .all_execution_vertices()
    .into_iter()
    .find(|v| v.subtask_index() == 1)
    .unwrap();
  let cause = failed.failure_cause().unwrap().to_string();
  assert!(cause.contains("subtask 1 refuses"), "{}", cause);
  cluster.stop().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
  let invokables = InvokableRegistry::new();
  invokables.register_fn("wait-for-cancel", |context: TaskContext| async move {
    context.canceled().await;
    TaskResult::Ok(())
  });
  let cluster = Cluster::start(2, 2, invokables).await;

  let mut job = JobGraph::new("endless");
  job.add_vertex(vertex("endless", 3, "wait-for-cancel")).unwrap();
  cluster.manager.submit_job(&job).await.unwrap();
  cluster.wait_for_status(job.job_id(), JobStatus::Running).await;

  cluster.manager.cancel_job(job.job_id()).await.unwrap();
  cluster.wait_for_status(job.job_id(), JobStatus::Canceled).await;
  assert_eq!(cluster.manager.scheduler().number_of_available_slots(), 4);
  cluster.stop().await;
}
