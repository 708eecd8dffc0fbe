use crate::deployment::TaskDeploymentDescriptor;
use crate::error::ExecutionGraphError;
use crate::ids::{ExecutionAttemptId, JobId, JobVertexId};
use crate::invokable::{InvokableRegistry, TaskBody, TaskContext, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

fn context(index: usize) -> (TaskContext, CancellationToken) {
  let descriptor = TaskDeploymentDescriptor {
    job_id: JobId::generate(),
    vertex_id: JobVertexId::from_name("counter"),
    attempt_id: ExecutionAttemptId::generate(),
    task_name: "counter".to_string(),
    index_in_subtask_group: index,
    current_number_of_subtasks: 4,
    invokable_id: Some("counter".to_string()),
    output_gates: Vec::new(),
    input_gates: Vec::new(),
  };
  let token = CancellationToken::new();
  (TaskContext::new(Arc::new(descriptor), token.clone()), token)
}

struct Counter {
  invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskBody for Counter {
  async fn invoke(&mut self, context: TaskContext) -> TaskResult {
    self
      .invocations
      .fetch_add(context.subtask_index() + 1, Ordering::SeqCst);
    Ok(())
  }
}

#[tokio::test]
async fn test_factory_creates_fresh_bodies() {
  let registry = InvokableRegistry::new();
  let invocations = Arc::new(AtomicUsize::new(0));
  let shared = invocations.clone();
  assert!(registry.register("counter", move || {
    let body: Box<dyn TaskBody> = Box::new(Counter {
      invocations: shared.clone(),
    });
    body
  }));

  let mut first = registry.instantiate("counter").unwrap();
  let mut second = registry.instantiate("counter").unwrap();
  first.invoke(context(0).0).await.unwrap();
  second.invoke(context(2).0).await.unwrap();
  assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[test]
fn test_unknown_invokable() {
  let registry = InvokableRegistry::new();
  assert!(registry.is_empty());
  match registry.instantiate("missing") {
    Err(ExecutionGraphError::UnknownInvokable(id)) => assert_eq!(id, "missing"),
    Err(other) => panic!("unexpected error {:?}", other),
    Ok(_) => panic!("nothing is registered"),
  }
}

#[test]
fn test_registering_twice_replaces() {
  let registry = InvokableRegistry::new();
  assert!(registry.register_fn("noop", |_context: TaskContext| async { TaskResult::Ok(()) }));
  assert!(!registry.register_fn("noop", |_context: TaskContext| async {
    TaskResult::Err("replaced".into())
  }));
  assert_eq!(registry.len(), 1);
  assert!(registry.contains("noop"));
}

#[tokio::test]
async fn test_function_body_sees_cancellation() {
  let registry = InvokableRegistry::new();
  registry.register_fn("waiter", |context: TaskContext| async move {
    context.canceled().await;
    let result: TaskResult = if context.is_canceled() {
      Ok(())
    } else {
      Err("woke up without cancellation".into())
    };
    result
  });

  let (context, token) = context(1);
  assert_eq!(context.task_name(), "counter (2/4)");
  assert_eq!(context.number_of_subtasks(), 4);
  let mut body = registry.instantiate("waiter").unwrap();
  let running = tokio::spawn(async move { body.invoke(context).await });
  token.cancel();
  assert!(running.await.unwrap().is_ok());
}
