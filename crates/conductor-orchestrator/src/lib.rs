//! In-process task orchestration: a bounded priority queue drained by a
//! concurrency-limited dispatcher, worker routing, retries with backoff,
//! single-step workflow execution and an orchestrator facade tying them
//! together.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade owning the dispatcher, registry, step executor and event bus.
//! - [`Dispatcher`] — Priority queue plus the dispatch loop that runs tasks on workers.
//! - [`Worker`] — Trait implemented by anything that can process tasks.
//! - [`WorkerRegistry`] — Registration-ordered worker collection with health tracking.
//! - [`Router`] — Picks one eligible worker per the configured [`RoutingStrategy`].
//! - [`RetryPolicy`] — Attempt limits and backoff, shared by tasks and steps.
//! - [`StepExecutor`] — Runs one workflow step with substitution, retries and hooks.
//! - [`EventBus`] — Broadcast of every [`OrchestratorEvent`].

/// Orchestrator, dispatcher, step and checkpoint configuration.
pub mod config;
/// Child task creation with depth and fan-out limits.
pub mod delegation;
/// Concurrency-limited dispatch loop.
pub mod dispatcher;
/// Event types and the broadcast bus.
pub mod events;
/// Event journaling to a checkpoint log.
pub mod journal;
/// Engine-side worker metrics and health.
pub mod monitor;
/// Top-level facade.
pub mod orchestrator;
/// Priority queue with retry scheduling and result history.
pub mod queue;
/// Worker registry.
pub mod registry;
/// Backoff calculation and retry decisions.
pub mod retry;
/// Worker selection strategies.
pub mod routing;
/// Task status state machine.
pub mod state;
/// Workflow step execution.
pub mod step;
/// Tasks, priorities and results.
pub mod types;
/// The worker trait and invocation helper.
pub mod worker;

pub use config::{
    CheckpointConfig, DelegationConfig, DispatcherConfig, GoalsConfig, OrchestratorConfig,
    StepsConfig,
};
pub use delegation::{Delegator, SubtaskSpec};
pub use dispatcher::{Dispatcher, DispatcherStats, DispatcherStatus, QueueSnapshot};
pub use events::{EventBus, OrchestratorEvent};
pub use journal::EventJournal;
pub use monitor::{WorkerMonitor, WorkerState};
pub use orchestrator::{
    GoalOptions, Orchestrator, OrchestratorStats, OrchestratorStatus, TaskRequest,
};
pub use queue::{CancelOutcome, TaskQueue};
pub use registry::WorkerRegistry;
pub use retry::{
    backoff_delay, backoff_delay_with_jitter, base_delay, should_retry, BackoffStrategy,
    RetryPolicy, JITTER_RATIO,
};
pub use routing::{Router, RoutingStrategy};
pub use state::{QueuedTask, TaskStatus};
pub use step::{
    substitute, StepExecutionContext, StepExecutor, StepExecutorConfig, StepHook,
    StepHookChain, StepKind, StepResult, WorkflowStep,
};
pub use types::{Priority, ResultMetadata, Task, TaskId, TaskMetadata, TaskResult};
pub use worker::{Worker, WorkerDescriptor, WorkerMetrics, WorkerProfile};

pub use conductor_core::{ConductorError, ConductorResult, ErrorCode, TaskError};
