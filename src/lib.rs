//! # WeaveFlow
//!
//! Execution graph and slot scheduler for a distributed dataflow engine.
//!
//! A user describes a job as a [`JobGraph`](jobgraph::JobGraph): logical
//! vertices with a parallelism and the code they run, connected by
//! pointwise or bipartite edges. WeaveFlow expands that description into an
//! [`ExecutionGraph`](executiongraph::ExecutionGraph) with one execution
//! vertex per parallel subtask, binds every subtask to a worker slot through
//! the [`Scheduler`](scheduler::Scheduler), deploys it, and tracks each
//! deployment attempt through its lifecycle:
//!
//! ```text
//! CREATED ─▶ SCHEDULED ─▶ DEPLOYING ─▶ RUNNING ─▶ FINISHED
//!    │           │            │           │
//!    │           └────────────┴───────────┴──▶ CANCELING ─▶ CANCELED
//!    └──────────────────────────────────────────────────────▶ FAILED
//! ```
//!
//! ## Key Features
//!
//! - **Lock-free lifecycle**: attempt states change by compare-and-swap, so
//!   racing deploy, cancel and failure reports resolve deterministically
//! - **Slot accounting**: every slot is returned exactly once, including on
//!   failed or aborted scheduling passes
//! - **Pluggable workers**: deployment goes through the
//!   [`TaskManagerGateway`](instance::TaskManagerGateway) trait; an
//!   in-process [`LocalTaskManager`](taskmanager::LocalTaskManager) is
//!   included
//! - **Observable**: every state change is logged with `tracing` and
//!   published as an [`ExecutionEvent`](executiongraph::ExecutionEvent)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use weaveflow::config::LocalTaskManagerConfig;
//! use weaveflow::invokable::{InvokableRegistry, TaskContext, TaskResult};
//! use weaveflow::jobgraph::{DistributionPattern, JobGraph, JobVertex};
//! use weaveflow::jobmanager::JobManager;
//! use weaveflow::scheduler::Scheduler;
//! use weaveflow::taskmanager::LocalTaskManager;
//!
//! # async fn run() -> weaveflow::error::Result<()> {
//! let invokables = InvokableRegistry::new();
//! invokables.register_fn("noop", |_context: TaskContext| async { TaskResult::Ok(()) });
//!
//! let (updates_tx, updates_rx) = mpsc::channel(64);
//! let worker = LocalTaskManager::spawn(
//!   LocalTaskManagerConfig::default().with_slots(4),
//!   Arc::new(invokables),
//!   updates_tx,
//! )?;
//!
//! let scheduler = Scheduler::new();
//! scheduler.new_instance_available(worker.instance().clone())?;
//! let manager = JobManager::new(scheduler);
//! manager.spawn_update_listener(updates_rx);
//!
//! let mut source = JobVertex::new("source");
//! source.set_parallelism(2);
//! source.set_invokable("noop");
//! let mut sink = JobVertex::new("sink");
//! sink.set_parallelism(2);
//! sink.set_invokable("noop");
//! sink.connect_new_data_set_as_input(&source, DistributionPattern::Pointwise);
//!
//! let mut job = JobGraph::new("quick start");
//! job.add_vertex(source)?;
//! job.add_vertex(sink)?;
//! manager.submit_job(&job).await?;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Configuration for execution graphs and local task managers.
pub mod config;
/// Task deployment descriptors, acknowledgements and state reports.
pub mod deployment;
/// Error types.
pub mod error;
/// Execution graph, execution vertices and deployment attempts.
pub mod executiongraph;
/// Identifiers.
pub mod ids;
/// Worker resource offers, slots and task manager gateways.
pub mod instance;
/// Task bodies and the registry that resolves them.
pub mod invokable;
/// Logical job description.
pub mod jobgraph;
/// Job submission and state report routing.
pub mod jobmanager;
/// Tracing subscriber setup.
pub mod logging;
/// Slot scheduler.
pub mod scheduler;
/// In-process worker.
pub mod taskmanager;
/// Test doubles for the worker side. Not part of the stable API.
#[doc(hidden)]
pub mod testing;

mod sync;

#[cfg(test)]
mod invokable_test;
#[cfg(test)]
mod jobmanager_test;
