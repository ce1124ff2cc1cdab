use async_trait::async_trait;
use conductor_core::TaskError;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StepsConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::registry::WorkerRegistry;
use crate::retry::{should_retry, RetryPolicy};
use crate::routing::{Router, RoutingStrategy};
use crate::types::{duration_ms, option_duration_ms, Priority, Task};
use crate::worker::{invoke_with_timeout, WorkerDescriptor};

/// What a workflow step does. Only `WorkerInvocation` is executed here;
/// every other kind belongs to a higher-level workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    WorkerInvocation { worker_type: String },
    Parallel,
    Conditional,
    Loop,
    SubWorkflow,
    Custom { name: String },
}

impl StepKind {
    fn label(&self) -> &str {
        match self {
            StepKind::WorkerInvocation { .. } => "worker_invocation",
            StepKind::Parallel => "parallel",
            StepKind::Conditional => "conditional",
            StepKind::Loop => "loop",
            StepKind::SubWorkflow => "sub_workflow",
            StepKind::Custom { name } => name,
        }
    }
}

/// One unit of a workflow, executed on a worker of `worker_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(
        default,
        rename = "timeout_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub priority: Priority,
}

impl WorkflowStep {
    /// A step that runs `payload` on a worker of `worker_type`.
    pub fn invoke(id: impl Into<String>, worker_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::WorkerInvocation {
                worker_type: worker_type.into(),
            },
            payload,
            timeout: None,
            depends_on: Vec::new(),
            retry: None,
            priority: Priority::Normal,
        }
    }

    /// Defaults to `Invoke`.
    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    /// Per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the executor's retry policy for this step.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Priority of the task built for each attempt.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Record that this step runs after `step_id`.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}

/// Values a step can reference through `${...}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepExecutionContext {
    pub workflow_id: String,
    pub execution_depth: u32,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub loop_variables: HashMap<String, Value>,
}

impl StepExecutionContext {
    /// Top-level context (depth 0).
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }

    /// Workflow input, resolvable as `${inputs.key}`.
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Workflow variable, resolvable as `${key}`.
    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Loop variables shadow every other source.
    pub fn with_loop_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.loop_variables.insert(key.into(), value);
        self
    }

    /// Make a step's output visible to later steps.
    pub fn record_output(&mut self, step_id: impl Into<String>, output: Value) {
        self.step_outputs.insert(step_id.into(), output);
    }

    /// Child context for a nested workflow, one level deeper.
    pub fn nested(&self, workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_depth: self.execution_depth.saturating_add(1),
            ..self.clone()
        }
    }

    /// Look up a placeholder path.
    ///
    /// Order: loop variables, step outputs (`steps.<id>.output.x`,
    /// `steps.<id>.x` or `<id>.x`), `inputs.x`, then context variables.
    /// Segments may index arrays (`items.0` or `items[0]`).
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let normalized = path.trim().replace('[', ".").replace(']', "");
        let segments: Vec<&str> = normalized.split('.').filter(|s| !s.is_empty()).collect();
        let (head, rest) = segments.split_first()?;

        if let Some(v) = self.loop_variables.get(*head) {
            return descend(v, rest);
        }
        if *head == "steps" {
            let (id, rest) = rest.split_first()?;
            let output = self.step_outputs.get(*id)?;
            let rest = match rest.split_first() {
                Some((&"output", tail)) => tail,
                _ => rest,
            };
            return descend(output, rest);
        }
        if let Some(v) = self.step_outputs.get(*head) {
            return descend(v, rest);
        }
        if *head == "inputs" {
            let (key, rest) = rest.split_first()?;
            return descend(self.inputs.get(*key)?, rest);
        }
        descend(self.variables.get(*head)?, rest)
    }
}

fn descend(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok()).as_ref()
}

/// Replace `${...}` placeholders throughout `value`.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its JSON type. Embedded placeholders are stringified. Unresolved ones are
/// left as written.
pub fn substitute(value: &Value, ctx: &StepExecutionContext) -> Value {
    match value {
        Value::String(s) => substitute_str(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, ctx: &StepExecutionContext) -> Value {
    let Some(re) = placeholder_re() else {
        return Value::String(s.to_string());
    };
    if let Some(caps) = re.captures(s) {
        let whole = caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len());
        if whole {
            if let Some(v) = ctx.resolve(&caps[1]) {
                return v;
            }
            return Value::String(s.to_string());
        }
    }
    let replaced = re.replace_all(s, |caps: &Captures| match ctx.resolve(&caps[1]) {
        Some(Value::String(v)) => v,
        Some(v) => v.to_string(),
        None => caps[0].to_string(),
    });
    Value::String(replaced.into_owned())
}

/// Outcome of one step. Failure is data, never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// Failed attempts, including the final one when the step failed.
    pub retry_count: u32,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepResult {
    fn success(step_id: &str, output: Value, duration: Duration, retry_count: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            output: Some(output),
            error: None,
            duration,
            retry_count,
            skipped: false,
            skip_reason: None,
        }
    }

    fn failure(step_id: &str, error: TaskError, duration: Duration, retry_count: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            output: None,
            error: Some(error),
            duration,
            retry_count,
            skipped: false,
            skip_reason: None,
        }
    }

    fn skipped(step_id: &str, reason: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            output: None,
            error: None,
            duration: Duration::ZERO,
            retry_count: 0,
            skipped: true,
            skip_reason: Some(reason.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Observer of step execution. Errors returned by a hook are logged and
/// otherwise ignored.
#[async_trait]
pub trait StepHook: Send + Sync {
    async fn before_step(
        &self,
        _step: &WorkflowStep,
        _ctx: &StepExecutionContext,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn after_step(
        &self,
        _step: &WorkflowStep,
        _ctx: &StepExecutionContext,
        _result: &StepResult,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn on_error(
        &self,
        _step: &WorkflowStep,
        _ctx: &StepExecutionContext,
        _error: &TaskError,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn on_retry(
        &self,
        _step: &WorkflowStep,
        _ctx: &StepExecutionContext,
        _error: &TaskError,
        _attempt: u32,
    ) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Runs hooks in registration order.
#[derive(Default, Clone)]
pub struct StepHookChain {
    hooks: Vec<Arc<dyn StepHook>>,
}

impl StepHookChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks run in insertion order.
    pub fn add(&mut self, hook: Arc<dyn StepHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks in the chain.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    async fn before_step(&self, step: &WorkflowStep, ctx: &StepExecutionContext) {
        for hook in &self.hooks {
            if let Err(e) = hook.before_step(step, ctx).await {
                warn!(step_id = %step.id, error = %e, "before_step hook failed");
            }
        }
    }

    async fn after_step(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
        result: &StepResult,
    ) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_step(step, ctx, result).await {
                warn!(step_id = %step.id, error = %e, "after_step hook failed");
            }
        }
    }

    async fn on_error(&self, step: &WorkflowStep, ctx: &StepExecutionContext, error: &TaskError) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_error(step, ctx, error).await {
                warn!(step_id = %step.id, error = %e, "on_error hook failed");
            }
        }
    }

    async fn on_retry(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
        error: &TaskError,
        attempt: u32,
    ) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_retry(step, ctx, error, attempt).await {
                warn!(step_id = %step.id, error = %e, "on_retry hook failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Limits and defaults for [`StepExecutor`].
#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    pub max_execution_depth: u32,
    pub default_timeout: Duration,
    /// Used when a step carries no policy of its own.
    pub default_retry: RetryPolicy,
    pub routing_strategy: RoutingStrategy,
}

impl StepExecutorConfig {
    /// Build from the `[steps]` section, falling back to `fallback_retry`
    /// when the section has no retry policy.
    pub fn from_config(
        steps: &StepsConfig,
        fallback_retry: &RetryPolicy,
        routing_strategy: RoutingStrategy,
    ) -> Self {
        Self {
            max_execution_depth: steps.max_execution_depth,
            default_timeout: steps.default_timeout(),
            default_retry: steps
                .retry
                .clone()
                .unwrap_or_else(|| fallback_retry.clone()),
            routing_strategy,
        }
    }
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self::from_config(
            &StepsConfig::default(),
            &RetryPolicy::default(),
            RoutingStrategy::default(),
        )
    }
}

/// Executes single `WorkerInvocation` steps with retries, timeouts and
/// placeholder substitution.
pub struct StepExecutor {
    config: StepExecutorConfig,
    registry: Arc<WorkerRegistry>,
    router: Router,
    events: EventBus,
    hooks: StepHookChain,
}

impl StepExecutor {
    /// Executor over `registry`, emitting step events on `events`.
    pub fn new(
        config: StepExecutorConfig,
        registry: Arc<WorkerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            router: Router::new(config.routing_strategy),
            config,
            registry,
            events,
            hooks: StepHookChain::new(),
        }
    }

    /// Append a hook to the chain.
    pub fn add_hook(&mut self, hook: Arc<dyn StepHook>) {
        self.hooks.add(hook);
    }

    /// Active limits and defaults.
    pub fn config(&self) -> &StepExecutorConfig {
        &self.config
    }

    /// Run a step with retries. Never returns an error; failures are in the result.
    pub async fn execute(&self, step: &WorkflowStep, ctx: &StepExecutionContext) -> StepResult {
        self.events.emit(OrchestratorEvent::StepStarting {
            step_id: step.id.clone(),
            workflow_id: ctx.workflow_id.clone(),
        });
        self.hooks.before_step(step, ctx).await;
        let clock = Instant::now();

        let result = match self.run(step, ctx, clock).await {
            Ok(result) => result,
            Err(error) => {
                self.hooks.on_error(step, ctx, &error).await;
                StepResult::failure(&step.id, error, clock.elapsed(), 0)
            }
        };

        if result.success {
            info!(
                step_id = %step.id,
                workflow_id = %ctx.workflow_id,
                retries = result.retry_count,
                "Step completed"
            );
            self.events.emit(OrchestratorEvent::StepCompleted {
                step_id: step.id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                result: result.clone(),
            });
        } else {
            warn!(
                step_id = %step.id,
                workflow_id = %ctx.workflow_id,
                error = ?result.error,
                "Step failed"
            );
            self.events.emit(OrchestratorEvent::StepFailed {
                step_id: step.id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                result: result.clone(),
            });
        }
        self.hooks.after_step(step, ctx, &result).await;
        result
    }

    /// Mark a step skipped without touching any worker.
    pub fn skip(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
        reason: &str,
    ) -> StepResult {
        debug!(step_id = %step.id, reason, "Step skipped");
        self.events.emit(OrchestratorEvent::StepSkipped {
            step_id: step.id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            reason: reason.to_string(),
        });
        StepResult::skipped(&step.id, reason)
    }

    /// Pre-flight checks. An `Err` here fails the step before any attempt.
    fn prepare(&self, step: &WorkflowStep, ctx: &StepExecutionContext) -> Result<Task, TaskError> {
        if ctx.execution_depth > self.config.max_execution_depth {
            return Err(TaskError::max_depth_exceeded(
                ctx.execution_depth,
                self.config.max_execution_depth,
            ));
        }
        let StepKind::WorkerInvocation { worker_type } = &step.kind else {
            return Err(TaskError::validation(format!(
                "step '{}' has kind '{}', only worker_invocation steps can be executed",
                step.id,
                step.kind.label()
            )));
        };
        if worker_type.trim().is_empty() {
            return Err(TaskError::validation(format!(
                "step '{}' has an empty worker type",
                step.id
            )));
        }
        let mut task = Task::new(worker_type.clone(), substitute(&step.payload, ctx))
            .with_priority(step.priority)
            .with_correlation_id(ctx.workflow_id.clone())
            .with_label("step_id", Value::String(step.id.clone()));
        task.metadata.depth = ctx.execution_depth;
        Ok(task)
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
        clock: Instant,
    ) -> Result<StepResult, TaskError> {
        let task = self.prepare(step, ctx)?;
        let policy = step
            .retry
            .as_ref()
            .unwrap_or(&self.config.default_retry);
        let timeout = step.timeout.unwrap_or(self.config.default_timeout);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match self.route(&task) {
                Some(worker) => invoke_with_timeout(worker, task.clone(), timeout).await,
                None => Err(TaskError::no_worker(&task.worker_type)),
            };
            let error = match outcome {
                Ok(output) => {
                    return Ok(StepResult::success(
                        &step.id,
                        output,
                        clock.elapsed(),
                        attempt - 1,
                    ))
                }
                Err(error) => error,
            };

            self.hooks.on_error(step, ctx, &error).await;
            if error.is_timeout() || !should_retry(&error, attempt, policy) {
                return Ok(StepResult::failure(&step.id, error, clock.elapsed(), attempt));
            }

            let delay = policy.next_delay(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(step_id = %step.id, attempt, delay_ms, error = %error, "Step failed, retrying");
            self.hooks.on_retry(step, ctx, &error, attempt).await;
            self.events.emit(OrchestratorEvent::StepRetrying {
                step_id: step.id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                attempt,
                delay_ms,
                error,
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn route(&self, task: &Task) -> Option<Arc<dyn crate::worker::Worker>> {
        let candidates = self.registry.eligible(task);
        let descriptors: Vec<WorkerDescriptor> = candidates
            .iter()
            .map(|w| WorkerDescriptor::of(w.as_ref()))
            .collect();
        let index = self.router.select(
            &task.worker_type,
            &task.metadata.required_capabilities,
            &descriptors,
        )?;
        candidates.get(index).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::worker::{Worker, WorkerProfile};
    use conductor_core::ErrorCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoWorker {
        profile: WorkerProfile,
        calls: AtomicU32,
        fail_first: u32,
        delay: Duration,
    }

    impl EchoWorker {
        fn new(fail_first: u32, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                profile: WorkerProfile::new("echo-1", "echo"),
                calls: AtomicU32::new(0),
                fail_first,
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn profile(&self) -> &WorkerProfile {
            &self.profile
        }

        async fn process_task(&self, task: &Task) -> Result<Value, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if call <= self.fail_first {
                return Err(TaskError::execution("transient"));
            }
            Ok(task.payload.clone())
        }
    }

    fn executor(worker: Option<Arc<EchoWorker>>) -> StepExecutor {
        let registry = Arc::new(WorkerRegistry::new());
        if let Some(worker) = worker {
            registry.register(worker).unwrap();
        }
        let config = StepExecutorConfig {
            default_retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
            ..StepExecutorConfig::default()
        };
        StepExecutor::new(config, registry, EventBus::new(32))
    }

    #[test]
    fn test_resolve_lookup_order() {
        let mut ctx = StepExecutionContext::new("wf")
            .with_input("user", json!({"name": "ada", "tags": ["a", "b"]}))
            .with_variable("region", json!("eu"))
            .with_loop_variable("item", json!(7));
        ctx.record_output("fetch", json!({"rows": [1, 2, 3]}));

        assert_eq!(ctx.resolve("item"), Some(json!(7)));
        assert_eq!(ctx.resolve("steps.fetch.output.rows.1"), Some(json!(2)));
        assert_eq!(ctx.resolve("steps.fetch.rows"), Some(json!([1, 2, 3])));
        assert_eq!(ctx.resolve("fetch.rows[2]"), Some(json!(3)));
        assert_eq!(ctx.resolve("inputs.user.name"), Some(json!("ada")));
        assert_eq!(ctx.resolve("inputs.user.tags.0"), Some(json!("a")));
        assert_eq!(ctx.resolve("region"), Some(json!("eu")));
        assert_eq!(ctx.resolve("missing"), None);
        assert_eq!(ctx.resolve("inputs.user.age"), None);
    }

    #[test]
    fn test_substitute_keeps_types_and_unresolved() {
        let mut ctx = StepExecutionContext::new("wf").with_input("n", json!(42));
        ctx.record_output("prev", json!({"ok": true}));
        let payload = json!({
            "count": "${inputs.n}",
            "flag": "${steps.prev.output.ok}",
            "label": "n=${inputs.n}!",
            "nested": ["${prev}", {"x": "${nope}"}],
            "plain": 5
        });
        let out = substitute(&payload, &ctx);
        assert_eq!(out["count"], json!(42));
        assert_eq!(out["flag"], json!(true));
        assert_eq!(out["label"], json!("n=42!"));
        assert_eq!(out["nested"][0], json!({"ok": true}));
        assert_eq!(out["nested"][1]["x"], json!("${nope}"));
        assert_eq!(out["plain"], json!(5));
    }

    #[test]
    fn test_nested_context_increments_depth() {
        let ctx = StepExecutionContext::new("outer").with_variable("k", json!(1));
        let child = ctx.nested("inner");
        assert_eq!(child.execution_depth, 1);
        assert_eq!(child.workflow_id, "inner");
        assert_eq!(child.resolve("k"), Some(json!(1)));
        assert_eq!(child.nested("deeper").execution_depth, 2);
    }

    #[tokio::test]
    async fn test_execute_substitutes_payload() {
        let worker = EchoWorker::new(0, 0);
        let exec = executor(Some(worker.clone()));
        let ctx = StepExecutionContext::new("wf").with_input("city", json!("Lima"));
        let step = WorkflowStep::invoke("s1", "echo", json!({"q": "weather in ${inputs.city}"}));

        let result = exec.execute(&step, &ctx).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.output, Some(json!({"q": "weather in Lima"})));
    }

    #[tokio::test]
    async fn test_execute_retries_transient_failures() {
        let worker = EchoWorker::new(2, 0);
        let exec = executor(Some(worker.clone()));
        let step = WorkflowStep::invoke("s1", "echo", json!(1));
        let result = exec.execute(&step, &StepExecutionContext::new("wf")).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let worker = EchoWorker::new(0, 1_000);
        let exec = executor(Some(worker.clone()));
        let step = WorkflowStep::invoke("slow", "echo", json!(null))
            .with_timeout(Duration::from_millis(20))
            .with_retry(RetryPolicy::default().with_retry_on_timeout(true));
        let result = exec.execute(&step, &StepExecutionContext::new("wf")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::Timeout);
        assert_eq!(result.retry_count, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_depth_and_kind_checks_fail_fast() {
        let worker = EchoWorker::new(0, 0);
        let exec = executor(Some(worker.clone()));

        let mut ctx = StepExecutionContext::new("wf");
        ctx.execution_depth = 11;
        let step = WorkflowStep::invoke("deep", "echo", json!(null));
        let result = exec.execute(&step, &ctx).await;
        assert_eq!(
            result.error.as_ref().unwrap().code,
            ErrorCode::MaxDepthExceeded
        );

        let step = WorkflowStep::invoke("par", "echo", json!(null)).with_kind(StepKind::Parallel);
        let result = exec.execute(&step, &StepExecutionContext::new("wf")).await;
        assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::Validation);
        assert!(!result.error.as_ref().unwrap().retryable);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_worker_available_exhausts_retries() {
        let exec = executor(None);
        let step = WorkflowStep::invoke("s1", "ghost", json!(null));
        let result = exec.execute(&step, &StepExecutionContext::new("wf")).await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_ref().unwrap().code,
            ErrorCode::NoWorkerAvailable
        );
        assert_eq!(result.retry_count, 3);
    }

    #[tokio::test]
    async fn test_skip_touches_no_worker() {
        let worker = EchoWorker::new(0, 0);
        let exec = executor(Some(worker.clone()));
        let mut rx = exec.events.subscribe();
        let step = WorkflowStep::invoke("s1", "echo", json!(null));
        let result = exec.skip(&step, &StepExecutionContext::new("wf"), "condition false");
        assert!(result.skipped);
        assert_eq!(result.duration, Duration::ZERO);
        assert_eq!(result.skip_reason.as_deref(), Some("condition false"));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rx.recv().await.unwrap().name(), "step:skipped");
    }

    struct FailingHook {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepHook for FailingHook {
        async fn before_step(
            &self,
            _step: &WorkflowStep,
            _ctx: &StepExecutionContext,
        ) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::execution("hook exploded"))
        }

        async fn after_step(
            &self,
            _step: &WorkflowStep,
            _ctx: &StepExecutionContext,
            _result: &StepResult,
        ) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hook_failures_are_swallowed() {
        let worker = EchoWorker::new(0, 0);
        let mut exec = executor(Some(worker));
        let hook = Arc::new(FailingHook {
            calls: AtomicU32::new(0),
        });
        exec.add_hook(hook.clone());
        let step = WorkflowStep::invoke("s1", "echo", json!("hi"));
        let result = exec.execute(&step, &StepExecutionContext::new("wf")).await;
        assert!(result.success);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_step_wire_shape() {
        let step = WorkflowStep::invoke("s1", "echo", json!({"a": 1}))
            .with_timeout(Duration::from_millis(250))
            .depends_on("s0");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"]["type"], "worker_invocation");
        assert_eq!(json["kind"]["worker_type"], "echo");
        assert_eq!(json["timeout_ms"], 250);
        let back: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
