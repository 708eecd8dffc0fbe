use crate::config::ExecutionConfig;
use crate::deployment::TaskExecutionState;
use crate::error::ExecutionGraphError;
use crate::executiongraph::{ExecutionState, JobStatus};
use crate::ids::{ExecutionAttemptId, JobId};
use crate::jobgraph::{DistributionPattern, JobGraph, JobVertex};
use crate::jobmanager::JobManager;
use crate::scheduler::Scheduler;
use crate::testing::{RecordingGateway, instance_with_slots};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn vertex(name: &str, parallelism: usize) -> JobVertex {
  let mut vertex = JobVertex::new(name);
  vertex.set_parallelism(parallelism);
  vertex.set_invokable("noop");
  vertex
}

/// source (2) -> map (4, pointwise) -> sink (1, bipartite), added in reverse.
fn three_stage_job() -> JobGraph {
  let source = vertex("source", 2);
  let mut map = vertex("map", 4);
  let mut sink = vertex("sink", 1);
  map.connect_new_data_set_as_input(&source, DistributionPattern::Pointwise);
  sink.connect_new_data_set_as_input(&map, DistributionPattern::Bipartite);

  let mut job = JobGraph::new("three stages");
  job.add_vertex(sink).unwrap();
  job.add_vertex(map).unwrap();
  job.add_vertex(source).unwrap();
  job
}

fn manager_with_slots(slots: usize) -> (Arc<JobManager>, Arc<RecordingGateway>) {
  let scheduler = Scheduler::new();
  let gateway = RecordingGateway::acknowledging();
  scheduler
    .new_instance_available(instance_with_slots(gateway.clone(), slots))
    .unwrap();
  (JobManager::new(scheduler), gateway)
}

fn report(job_id: JobId, attempt_id: ExecutionAttemptId, state: ExecutionState) -> TaskExecutionState {
  TaskExecutionState::new(job_id, attempt_id, state)
}

#[tokio::test]
async fn test_submitted_job_runs_to_completion() {
  let (manager, gateway) = manager_with_slots(7);
  let job = three_stage_job();
  let graph = manager.submit_job(&job).await.unwrap();
  assert_eq!(graph.number_of_execution_vertices(), 7);
  assert_eq!(manager.number_of_jobs(), 1);
  assert_eq!(manager.job_ids(), vec![job.job_id()]);

  let submitted = gateway.submitted_descriptors();
  assert_eq!(submitted.len(), 7);
  for descriptor in &submitted {
    assert_eq!(
      manager.execution_state(descriptor.attempt_id),
      Some(ExecutionState::Running)
    );
  }
  assert_eq!(manager.job_status(job.job_id()).unwrap().status, JobStatus::Running);

  for descriptor in &submitted {
    let applied = manager
      .update_task_execution_state(&report(
        job.job_id(),
        descriptor.attempt_id,
        ExecutionState::Finished,
      ))
      .unwrap();
    assert!(applied);
  }
  let snapshot = manager.job_status(job.job_id()).unwrap();
  assert_eq!(snapshot.status, JobStatus::Finished);
  assert_eq!(snapshot.count_in_state(ExecutionState::Finished), 7);
  assert_eq!(manager.scheduler().number_of_available_slots(), 7);
}

#[tokio::test]
async fn test_invalid_job_registers_nothing() {
  let (manager, gateway) = manager_with_slots(4);
  let orphan_source = vertex("elsewhere", 1);
  let mut consumer = vertex("consumer", 1);
  consumer.connect_new_data_set_as_input(&orphan_source, DistributionPattern::Bipartite);
  let mut job = JobGraph::new("dangling edge");
  job.add_vertex(consumer).unwrap();

  let err = manager.submit_job(&job).await.unwrap_err();
  assert!(err.is_build_error());
  assert_eq!(manager.number_of_jobs(), 0);
  assert!(gateway.submitted_descriptors().is_empty());
}

#[tokio::test]
async fn test_job_without_enough_slots_stays_registered() {
  let scheduler = Scheduler::new();
  scheduler
    .new_instance_available(instance_with_slots(RecordingGateway::acknowledging(), 3))
    .unwrap();
  let manager =
    JobManager::with_config(scheduler, ExecutionConfig::default().with_queued_scheduling(false));

  let job = three_stage_job();
  match manager.submit_job(&job).await {
    Err(ExecutionGraphError::NotEnoughSlots { total, .. }) => assert_eq!(total, 3),
    Err(other) => panic!("unexpected error {:?}", other),
    Ok(_) => panic!("7 subtasks cannot fit into 3 slots"),
  }

  let snapshot = manager.job_status(job.job_id()).unwrap();
  assert_eq!(snapshot.status, JobStatus::Created);
  assert_eq!(snapshot.count_in_state(ExecutionState::Created), 7);
  assert_eq!(manager.scheduler().number_of_available_slots(), 3);
}

#[tokio::test]
async fn test_duplicate_submission_is_refused() {
  let (manager, _gateway) = manager_with_slots(16);
  let job = three_stage_job();
  manager.submit_job(&job).await.unwrap();
  match manager.submit_job(&job).await {
    Err(ExecutionGraphError::InvalidTopology(message)) => {
      assert!(message.contains("already submitted"))
    }
    Err(other) => panic!("unexpected error {:?}", other),
    Ok(_) => panic!("a job id can only be submitted once"),
  }
  assert_eq!(manager.number_of_jobs(), 1);
}

#[tokio::test]
async fn test_unknown_job_is_reported() {
  let (manager, _gateway) = manager_with_slots(1);
  let job_id = JobId::generate();
  assert_eq!(
    manager.job_status(job_id).unwrap_err(),
    ExecutionGraphError::UnknownJob(job_id)
  );
  assert_eq!(
    manager.cancel_job(job_id).await.unwrap_err(),
    ExecutionGraphError::UnknownJob(job_id)
  );
  let update = report(job_id, ExecutionAttemptId::generate(), ExecutionState::Finished);
  assert_eq!(
    manager.update_task_execution_state(&update).unwrap_err(),
    ExecutionGraphError::UnknownJob(job_id)
  );
  assert!(manager.execution_state(update.attempt_id).is_none());
}

#[tokio::test]
async fn test_cancel_job() {
  let (manager, gateway) = manager_with_slots(7);
  let job = three_stage_job();
  manager.submit_job(&job).await.unwrap();

  manager.cancel_job(job.job_id()).await.unwrap();
  assert_eq!(gateway.canceled_attempts().len(), 7);
  assert_eq!(manager.job_status(job.job_id()).unwrap().status, JobStatus::Canceling);

  for descriptor in gateway.submitted_descriptors() {
    manager
      .update_task_execution_state(&report(
        job.job_id(),
        descriptor.attempt_id,
        ExecutionState::Canceled,
      ))
      .unwrap();
  }
  assert_eq!(manager.job_status(job.job_id()).unwrap().status, JobStatus::Canceled);

  let removed = manager.remove_job(job.job_id()).unwrap();
  assert_eq!(removed.job_id(), job.job_id());
  assert_eq!(manager.number_of_jobs(), 0);
}

#[tokio::test]
async fn test_update_listener_applies_reports() {
  let (manager, gateway) = manager_with_slots(7);
  let job = three_stage_job();
  manager.submit_job(&job).await.unwrap();

  let (tx, rx) = mpsc::channel(16);
  let listener = manager.spawn_update_listener(rx);
  let submitted = gateway.submitted_descriptors();
  for descriptor in &submitted {
    tx.send(report(job.job_id(), descriptor.attempt_id, ExecutionState::Finished))
      .await
      .unwrap();
  }
  // reports for unknown jobs are logged and skipped
  tx.send(report(
    JobId::generate(),
    ExecutionAttemptId::generate(),
    ExecutionState::Failed,
  ))
  .await
  .unwrap();
  drop(tx);

  tokio::time::timeout(Duration::from_secs(2), listener)
    .await
    .expect("listener did not stop")
    .unwrap();
  assert_eq!(manager.job_status(job.job_id()).unwrap().status, JobStatus::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_submissions_register_once() {
  let (manager, gateway) = manager_with_slots(7);
  let job = Arc::new(three_stage_job());

  let submissions: Vec<_> = (0..8)
    .map(|_| {
      let manager = Arc::clone(&manager);
      let job = Arc::clone(&job);
      tokio::spawn(async move { manager.submit_job(&job).await })
    })
    .collect();

  let mut accepted = 0;
  for submission in submissions {
    match submission.await.unwrap() {
      Ok(_) => accepted += 1,
      Err(ExecutionGraphError::InvalidTopology(message)) => {
        assert!(message.contains("already submitted"))
      }
      Err(other) => panic!("unexpected error {:?}", other),
    }
  }
  assert_eq!(accepted, 1);
  assert_eq!(manager.number_of_jobs(), 1);
  assert_eq!(gateway.submitted_descriptors().len(), 7);
}

#[tokio::test]
async fn test_removed_job_withdraws_queued_requests() {
  let (manager, _gateway) = manager_with_slots(3);
  let job = three_stage_job();
  manager.submit_job(&job).await.unwrap();
  assert_eq!(manager.scheduler().number_of_queued_requests(), 4);

  let removed = manager.remove_job(job.job_id()).unwrap();
  assert_eq!(manager.scheduler().number_of_queued_requests(), 0);
  assert_eq!(removed.job_status(), JobStatus::Running);
}
