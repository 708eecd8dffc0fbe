//! Tests for building, scheduling and tracking an execution graph.

use crate::config::ExecutionConfig;
use crate::deployment::TaskExecutionState;
use crate::error::ExecutionGraphError;
use crate::executiongraph::{ExecutionGraph, ExecutionState, JobStatus};
use crate::ids::{ExecutionAttemptId, JobId};
use crate::jobgraph::{DistributionPattern, JobVertex};
use crate::scheduler::Scheduler;
use crate::testing::{RecordingGateway, instance_with_slots};
use std::sync::Arc;
use std::time::Duration;

fn vertex(name: &str, parallelism: usize) -> JobVertex {
  let mut vertex = JobVertex::new(name);
  vertex.set_parallelism(parallelism);
  vertex.set_invokable(format!("{}-invokable", name));
  vertex
}

fn immediate_config() -> ExecutionConfig {
  ExecutionConfig::default().with_queued_scheduling(false)
}

fn scheduler_with_single_slot_instances(count: usize) -> (Arc<Scheduler>, Arc<RecordingGateway>) {
  let scheduler = Scheduler::new();
  let gateway = RecordingGateway::acknowledging();
  for _ in 0..count {
    scheduler
      .new_instance_available(instance_with_slots(gateway.clone(), 1))
      .unwrap();
  }
  (scheduler, gateway)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert!(condition(), "condition not reached in time");
}

#[tokio::test]
async fn test_deployment_descriptor_of_bipartite_topology() {
  let v1 = vertex("v1", 10);
  let mut v2 = vertex("v2", 10);
  let mut v3 = vertex("v3", 10);
  let mut v4 = vertex("v4", 10);
  v2.connect_new_data_set_as_input(&v1, DistributionPattern::Bipartite);
  v3.connect_new_data_set_as_input(&v2, DistributionPattern::Bipartite);
  v4.connect_new_data_set_as_input(&v2, DistributionPattern::Bipartite);

  let job_id = JobId::generate();
  let graph = ExecutionGraph::new(job_id, "deployment test", ExecutionConfig::default());
  graph.attach_job_graph(&[&v1, &v2, &v3, &v4]).unwrap();

  let ejv = graph.job_vertex(v2.id()).unwrap();
  let vertex = ejv.task_vertices()[3].clone();
  assert_eq!(vertex.execution_state(), ExecutionState::Created);

  let gateway = RecordingGateway::acknowledging();
  let instance = instance_with_slots(gateway.clone(), 1);
  let slot = instance.allocate_slot(job_id).unwrap();
  vertex.deploy_to_slot(slot).await.unwrap();
  assert_eq!(vertex.execution_state(), ExecutionState::Running);

  let submitted = gateway.submitted_descriptors();
  assert_eq!(submitted.len(), 1);
  let descriptor = &submitted[0];
  assert_eq!(descriptor.job_id, job_id);
  assert_eq!(descriptor.vertex_id, v2.id());
  assert_eq!(descriptor.task_name, "v2");
  assert_eq!(descriptor.task_name_with_subtask(), "v2 (4/10)");
  assert_eq!(descriptor.index_in_subtask_group, 3);
  assert_eq!(descriptor.current_number_of_subtasks, 10);
  assert_eq!(descriptor.invokable_id.as_deref(), Some("v2-invokable"));

  assert_eq!(descriptor.output_gates.len(), 2);
  for gate in &descriptor.output_gates {
    assert_eq!(gate.number_of_channels(), 10);
    assert_eq!(gate.pattern, DistributionPattern::Bipartite);
  }
  assert_eq!(descriptor.output_gates[0].channels[0].consumer.vertex_id, v3.id());
  assert_eq!(descriptor.output_gates[1].channels[0].consumer.vertex_id, v4.id());

  assert_eq!(descriptor.input_gates.len(), 1);
  assert_eq!(descriptor.input_gates[0].number_of_channels(), 10);
  assert!(
    descriptor.input_gates[0]
      .channels()
      .iter()
      .all(|c| c.producer.vertex_id == v1.id() && c.consumer.subtask_index == 3)
  );
}

#[test]
fn test_every_subtask_gets_a_vertex() {
  let a = vertex("a", 3);
  let mut b = vertex("b", 5);
  let mut c = vertex("c", 15);
  b.connect_new_data_set_as_input(&a, DistributionPattern::Bipartite);
  c.connect_new_data_set_as_input(&b, DistributionPattern::Pointwise);

  let graph = ExecutionGraph::new(JobId::generate(), "count", ExecutionConfig::default());
  graph.attach_job_graph(&[&a, &b]).unwrap();
  graph.attach_job_graph(&[&c]).unwrap();

  assert_eq!(graph.number_of_execution_vertices(), 23);
  assert_eq!(graph.all_execution_vertices().len(), 23);
  assert_eq!(graph.registered_executions(), 23);
  let order: Vec<_> = graph
    .vertices_in_creation_order()
    .iter()
    .map(|v| v.name().to_string())
    .collect();
  assert_eq!(order, vec!["a", "b", "c"]);

  let b_vertex = graph.job_vertex(b.id()).unwrap();
  assert_eq!(b_vertex.inputs().len(), 1);
  assert_eq!(b_vertex.produced_data_sets().len(), 1);
  assert_eq!(b_vertex.produced_data_sets()[0].consumer(), c.id());
  for (index, subtask) in b_vertex.task_vertices().iter().enumerate() {
    let descriptor = subtask.current_execution().deployment_descriptor();
    assert_eq!(descriptor.index_in_subtask_group, index);
    assert_eq!(descriptor.current_number_of_subtasks, 5);
  }
}

#[test]
fn test_pointwise_channels_match_on_both_ends() {
  let producer = vertex("producer", 6);
  let mut consumer = vertex("consumer", 2);
  consumer.connect_new_data_set_as_input(&producer, DistributionPattern::Pointwise);

  let graph = ExecutionGraph::new(JobId::generate(), "pointwise", ExecutionConfig::default());
  graph.attach_job_graph(&[&producer, &consumer]).unwrap();

  let producers = graph.job_vertex(producer.id()).unwrap();
  let consumers = graph.job_vertex(consumer.id()).unwrap();

  let mut written = Vec::new();
  for subtask in producers.task_vertices() {
    let descriptor = subtask.current_execution().deployment_descriptor();
    assert_eq!(descriptor.output_gates.len(), 1);
    assert_eq!(descriptor.output_gates[0].number_of_channels(), 1);
    written.extend(descriptor.output_gates[0].channels.iter().map(|c| c.channel_id));
  }
  let mut read = Vec::new();
  for subtask in consumers.task_vertices() {
    let descriptor = subtask.current_execution().deployment_descriptor();
    assert!(descriptor.output_gates.is_empty());
    assert_eq!(descriptor.input_gates[0].number_of_channels(), 3);
    read.extend(descriptor.input_gates[0].channels.iter().map(|c| c.channel_id));
  }

  written.sort_by_key(|id| (id.producer_index, id.consumer_index));
  read.sort_by_key(|id| (id.producer_index, id.consumer_index));
  assert_eq!(written, read);
  assert_eq!(written[4].consumer_index, 1);
}

#[test]
fn test_edge_to_unattached_vertex_is_rejected() {
  let upstream = vertex("upstream", 2);
  let mut downstream = vertex("downstream", 2);
  downstream.connect_new_data_set_as_input(&upstream, DistributionPattern::Bipartite);

  let graph = ExecutionGraph::new(JobId::generate(), "order", ExecutionConfig::default());
  let err = graph.attach_job_graph(&[&downstream, &upstream]).unwrap_err();
  assert!(matches!(err, ExecutionGraphError::InvalidTopology(_)));
  assert!(err.is_build_error());
  assert_eq!(graph.number_of_execution_vertices(), 0);
  assert_eq!(graph.registered_executions(), 0);
}

#[test]
fn test_self_loop_is_rejected() {
  let mut looping = vertex("loop", 2);
  let id = looping.id();
  looping.connect_to(id, DistributionPattern::Pointwise);

  let graph = ExecutionGraph::new(JobId::generate(), "cycle", ExecutionConfig::default());
  assert!(matches!(
    graph.attach_job_graph(&[&looping]),
    Err(ExecutionGraphError::InvalidTopology(_))
  ));
}

#[test]
fn test_zero_parallelism_is_rejected() {
  let empty = vertex("empty", 0);
  let graph = ExecutionGraph::new(JobId::generate(), "zero", ExecutionConfig::default());
  assert!(matches!(
    graph.attach_job_graph(&[&empty]),
    Err(ExecutionGraphError::InvalidTopology(_))
  ));
}

#[test]
fn test_duplicate_vertex_leaves_graph_unchanged() {
  let first = vertex("first", 2);
  let second = vertex("second", 3);
  let graph = ExecutionGraph::new(JobId::generate(), "duplicate", ExecutionConfig::default());
  graph.attach_job_graph(&[&first]).unwrap();

  let err = graph.attach_job_graph(&[&second, &first]).unwrap_err();
  assert_eq!(err, ExecutionGraphError::DuplicateVertex(first.id()));
  assert!(graph.job_vertex(second.id()).is_none());
  assert_eq!(graph.number_of_execution_vertices(), 2);
  assert_eq!(graph.registered_executions(), 2);

  let err = graph.attach_job_graph(&[&second, &second]).unwrap_err();
  assert_eq!(err, ExecutionGraphError::DuplicateVertex(second.id()));
}

#[test]
fn test_incompatible_pointwise_parallelism_is_rejected() {
  let producer = vertex("seven", 7);
  let mut consumer = vertex("six", 6);
  consumer.connect_new_data_set_as_input(&producer, DistributionPattern::Pointwise);

  let graph = ExecutionGraph::new(JobId::generate(), "ratio", ExecutionConfig::default());
  match graph.attach_job_graph(&[&producer, &consumer]) {
    Err(ExecutionGraphError::IncompatibleParallelism {
      producer_parallelism,
      consumer_parallelism,
      ..
    }) => {
      assert_eq!(producer_parallelism, 7);
      assert_eq!(consumer_parallelism, 6);
    }
    other => panic!("expected IncompatibleParallelism, got {:?}", other),
  }
  // nothing of the failed call stays attached, not even the valid producer
  assert!(graph.job_vertex(producer.id()).is_none());
  let producers = graph.vertices_in_creation_order();
  assert!(producers.is_empty());
}

async fn registration_scenario(dop1: usize, dop2: usize) {
  let v1 = vertex("vertex1", dop1);
  let v2 = vertex("vertex2", dop2);
  let (scheduler, _gateway) = scheduler_with_single_slot_instances(dop1 + dop2);
  assert_eq!(scheduler.number_of_available_slots(), dop1 + dop2);

  let graph = ExecutionGraph::new(JobId::generate(), "registration", immediate_config());
  graph.attach_job_graph(&[&v1, &v2]).unwrap();
  graph.schedule_for_execution(&scheduler).await.unwrap();

  assert_eq!(graph.registered_executions(), dop1 + dop2);
  assert_eq!(scheduler.number_of_available_slots(), 0);
  assert_eq!(graph.job_status(), JobStatus::Running);

  let executions = graph.registry().live_executions();
  for execution in &executions {
    assert_eq!(execution.state(), ExecutionState::Running);
  }
  let mut remaining = dop1 + dop2;
  for execution in executions {
    execution.mark_finished().unwrap();
    remaining -= 1;
    assert_eq!(graph.registered_executions(), remaining);
  }

  assert!(graph.registry().is_empty());
  assert_eq!(scheduler.number_of_available_slots(), dop1 + dop2);
  assert_eq!(graph.job_status(), JobStatus::Finished);
}

#[tokio::test]
async fn test_registration_of_executions_finishing() {
  registration_scenario(7, 6).await;
  registration_scenario(19, 37).await;
  registration_scenario(765, 235).await;
}

#[tokio::test]
async fn test_not_enough_slots_returns_bound_slots() {
  let v1 = vertex("wide", 4);
  let v2 = vertex("wider", 3);
  let (scheduler, gateway) = scheduler_with_single_slot_instances(5);

  let graph = ExecutionGraph::new(JobId::generate(), "shortage", immediate_config());
  graph.attach_job_graph(&[&v1, &v2]).unwrap();

  match graph.schedule_for_execution(&scheduler).await {
    Err(ExecutionGraphError::NotEnoughSlots { total, .. }) => assert_eq!(total, 5),
    other => panic!("expected NotEnoughSlots, got {:?}", other),
  }
  assert_eq!(scheduler.number_of_available_slots(), 5);
  assert!(gateway.submitted_descriptors().is_empty());
  assert_eq!(graph.job_status(), JobStatus::Created);
  assert!(
    graph
      .all_execution_vertices()
      .iter()
      .all(|v| v.execution_state() == ExecutionState::Created)
  );

  // the graph can be scheduled again once capacity arrives
  scheduler
    .new_instance_available(instance_with_slots(gateway.clone(), 2))
    .unwrap();
  graph.schedule_for_execution(&scheduler).await.unwrap();
  assert_eq!(gateway.submitted_descriptors().len(), 7);
  assert_eq!(scheduler.number_of_available_slots(), 0);
}

#[tokio::test]
async fn test_queued_subtasks_deploy_when_slots_free_up() {
  let wide = vertex("queued", 4);
  let scheduler = Scheduler::new();
  let gateway = RecordingGateway::acknowledging();
  scheduler
    .new_instance_available(instance_with_slots(gateway.clone(), 2))
    .unwrap();

  let graph = ExecutionGraph::new(JobId::generate(), "queued", ExecutionConfig::default());
  graph.attach_job_graph(&[&wide]).unwrap();
  graph.schedule_for_execution(&scheduler).await.unwrap();

  let snapshot = graph.topology_snapshot();
  assert_eq!(snapshot.count_in_state(ExecutionState::Running), 2);
  assert_eq!(snapshot.count_in_state(ExecutionState::Created), 2);
  assert_eq!(scheduler.number_of_queued_requests(), 2);

  for execution in graph.registry().live_executions() {
    if execution.state() == ExecutionState::Running {
      execution.mark_finished().unwrap();
    }
  }
  wait_for(|| graph.topology_snapshot().count_in_state(ExecutionState::Running) == 2).await;
  assert_eq!(gateway.submitted_descriptors().len(), 4);
  assert_eq!(scheduler.number_of_queued_requests(), 0);
}

#[tokio::test]
async fn test_second_scheduling_pass_is_refused() {
  let single = vertex("single", 1);
  let (scheduler, _gateway) = scheduler_with_single_slot_instances(2);
  let graph = ExecutionGraph::new(JobId::generate(), "twice", immediate_config());
  graph.attach_job_graph(&[&single]).unwrap();
  graph.schedule_for_execution(&scheduler).await.unwrap();

  assert!(matches!(
    graph.schedule_for_execution(&scheduler).await,
    Err(ExecutionGraphError::IllegalStateTransition { .. })
  ));
  assert!(matches!(
    graph.attach_job_graph(&[&vertex("late", 1)]),
    Err(ExecutionGraphError::InvalidTopology(_))
  ));
  assert_eq!(scheduler.number_of_available_slots(), 1);
}

#[tokio::test]
async fn test_cancel_job() {
  let source = vertex("source", 2);
  let mut sink = vertex("sink", 2);
  sink.connect_new_data_set_as_input(&source, DistributionPattern::Pointwise);
  let (scheduler, gateway) = scheduler_with_single_slot_instances(3);

  let graph = ExecutionGraph::new(JobId::generate(), "cancel", ExecutionConfig::default());
  graph.attach_job_graph(&[&source, &sink]).unwrap();
  graph.schedule_for_execution(&scheduler).await.unwrap();
  // three subtasks run, one waits for a slot
  assert_eq!(scheduler.number_of_queued_requests(), 1);

  graph.cancel().await.unwrap();
  assert_eq!(scheduler.number_of_queued_requests(), 0);
  assert_eq!(graph.job_status(), JobStatus::Canceling);
  assert_eq!(gateway.canceled_attempts().len(), 3);
  assert_eq!(graph.registered_executions(), 3);

  for attempt in gateway.canceled_attempts() {
    let report = TaskExecutionState::new(graph.job_id(), attempt, ExecutionState::Canceled);
    assert!(graph.update_state(&report).unwrap());
  }
  assert_eq!(graph.job_status(), JobStatus::Canceled);
  assert!(graph.registry().is_empty());

  wait_for(|| scheduler.number_of_available_slots() == 3).await;
  assert_eq!(gateway.submitted_descriptors().len(), 3);
}

#[tokio::test]
async fn test_worker_reports_drive_job_status() {
  let only = vertex("only", 2);
  let (scheduler, _gateway) = scheduler_with_single_slot_instances(2);
  let graph = ExecutionGraph::new(JobId::generate(), "reports", immediate_config());
  graph.attach_job_graph(&[&only]).unwrap();
  assert_eq!(graph.job_status(), JobStatus::Created);
  graph.schedule_for_execution(&scheduler).await.unwrap();

  let attempts: Vec<ExecutionAttemptId> = graph.registry().attempt_ids();
  let failed = TaskExecutionState::failed(graph.job_id(), attempts[0], "division by zero");
  assert!(graph.update_state(&failed).unwrap());
  assert_eq!(graph.job_status(), JobStatus::Failing);
  assert_eq!(graph.execution_state(attempts[0]), Some(ExecutionState::Failed));

  // late reports about ended attempts are ignored
  assert!(!graph.update_state(&failed).unwrap());
  let unknown = TaskExecutionState::new(
    graph.job_id(),
    ExecutionAttemptId::generate(),
    ExecutionState::Finished,
  );
  assert!(!graph.update_state(&unknown).unwrap());
  assert_eq!(graph.execution_state(unknown.attempt_id), None);

  let finished = TaskExecutionState::new(graph.job_id(), attempts[1], ExecutionState::Finished);
  assert!(graph.update_state(&finished).unwrap());
  assert_eq!(graph.job_status(), JobStatus::Failed);

  let snapshot = graph.topology_snapshot();
  assert_eq!(snapshot.status, JobStatus::Failed);
  let states = snapshot.states_of(only.id()).unwrap();
  assert_eq!(states.len(), 2);
  assert!(states.contains(&ExecutionState::Failed));
  assert!(states.contains(&ExecutionState::Finished));
}

#[tokio::test]
async fn test_cancel_withdraws_queued_slot_requests() {
  let (scheduler, gateway) = scheduler_with_single_slot_instances(1);
  let holder = vertex("holder", 1);
  let graph_a = ExecutionGraph::new(JobId::generate(), "holder", immediate_config());
  graph_a.attach_job_graph(&[&holder]).unwrap();
  graph_a.schedule_for_execution(&scheduler).await.unwrap();

  let waiter = vertex("waiter", 2);
  let graph_b = ExecutionGraph::new(JobId::generate(), "waiter", ExecutionConfig::default());
  graph_b.attach_job_graph(&[&waiter]).unwrap();
  graph_b.schedule_for_execution(&scheduler).await.unwrap();
  assert_eq!(scheduler.number_of_queued_requests(), 2);

  graph_b.cancel().await.unwrap();
  assert_eq!(scheduler.number_of_queued_requests(), 0);
  assert_eq!(graph_b.job_status(), JobStatus::Canceled);
  assert!(graph_b.registry().is_empty());

  // the freed slot goes back to the pool instead of to the canceled job
  for execution in graph_a.registry().live_executions() {
    execution.mark_finished().unwrap();
  }
  assert_eq!(scheduler.number_of_available_slots(), 1);
  assert_eq!(gateway.submitted_descriptors().len(), 1);
}

#[tokio::test]
async fn test_dropped_graph_withdraws_queued_slot_requests() {
  let (scheduler, _gateway) = scheduler_with_single_slot_instances(1);
  let holder = vertex("holder", 1);
  let graph_a = ExecutionGraph::new(JobId::generate(), "holder", immediate_config());
  graph_a.attach_job_graph(&[&holder]).unwrap();
  graph_a.schedule_for_execution(&scheduler).await.unwrap();

  let waiter = vertex("waiter", 3);
  let graph_b = ExecutionGraph::new(JobId::generate(), "waiter", ExecutionConfig::default());
  graph_b.attach_job_graph(&[&waiter]).unwrap();
  graph_b.schedule_for_execution(&scheduler).await.unwrap();
  assert_eq!(scheduler.number_of_queued_requests(), 3);

  drop(graph_b);
  assert_eq!(scheduler.number_of_queued_requests(), 0);

  for execution in graph_a.registry().live_executions() {
    execution.mark_finished().unwrap();
  }
  assert_eq!(scheduler.number_of_available_slots(), 1);
}
