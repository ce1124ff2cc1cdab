use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::DelegationConfig;
use crate::types::{option_duration_ms, Priority, Task, TaskId};

/// One child task requested by a parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Explicit target type. When absent, resolved from `required_capabilities`.
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to the parent's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, rename = "timeout_ms", with = "option_duration_ms")]
    pub timeout: Option<Duration>,
}

impl SubtaskSpec {
    /// Child for an explicit worker type.
    pub fn new(worker_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            worker_type: Some(worker_type.into()),
            payload,
            ..Self::default()
        }
    }

    /// Child whose worker type is resolved from `capabilities`.
    pub fn for_capabilities(capabilities: Vec<String>, payload: serde_json::Value) -> Self {
        Self {
            required_capabilities: capabilities,
            payload,
            ..Self::default()
        }
    }

    /// Override the inherited priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Per-attempt timeout for the child.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Parent to children links, bounded to the most recent `limit` parents.
struct Lineage {
    limit: usize,
    children: HashMap<TaskId, Vec<TaskId>>,
    order: VecDeque<TaskId>,
}

impl Lineage {
    fn record(&mut self, parent: TaskId, ids: &[TaskId]) {
        if !self.children.contains_key(&parent) {
            self.order.push_back(parent);
        }
        self.children
            .entry(parent)
            .or_default()
            .extend(ids.iter().copied());
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.children.remove(&oldest);
            }
        }
    }
}

/// Creates child tasks under a parent, enforcing depth and fan-out limits so
/// delegation cannot recurse without bound.
///
/// Only the most recent delegating parents are remembered. Once a parent is
/// forgotten its fan-out count starts again from zero.
pub struct Delegator {
    /// Deepest allowed child (root tasks are depth 0).
    max_depth: u32,
    max_children: u32,
    lineage: Mutex<Lineage>,
}

impl Delegator {
    /// Limits as given; remembers up to 1000 parents.
    pub fn new(max_depth: u32, max_children: u32) -> Self {
        Self {
            max_depth,
            max_children,
            lineage: Mutex::new(Lineage {
                limit: 1000,
                children: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Number of delegating parents whose children are kept.
    pub fn with_lineage_limit(mut self, limit: usize) -> Self {
        self.lineage.get_mut().limit = limit;
        self
    }

    /// Limits from the `[delegation]` config section.
    pub fn from_config(config: &DelegationConfig) -> Self {
        Self::new(config.max_delegation_depth, config.max_children_per_task)
            .with_lineage_limit(config.lineage_limit)
    }

    /// Validate limits, build the child tasks and hand them to `submit`.
    ///
    /// `resolve` maps an optional explicit worker type and the required
    /// capabilities to a concrete type. The children are only recorded if
    /// `submit` succeeds; the limit check and the submission happen under one
    /// lock so concurrent delegations cannot overshoot `max_children`.
    pub fn delegate<R, S>(
        &self,
        parent: &Task,
        specs: Vec<SubtaskSpec>,
        resolve: R,
        submit: S,
    ) -> ConductorResult<Vec<TaskId>>
    where
        R: Fn(Option<&str>, &[String]) -> Option<String>,
        S: FnOnce(Vec<Task>) -> ConductorResult<Vec<TaskId>>,
    {
        let depth = parent.metadata.depth + 1;
        if depth > self.max_depth {
            return Err(ConductorError::Delegation(format!(
                "maximum delegation depth {} exceeded (parent {} is at depth {})",
                self.max_depth, parent.id, parent.metadata.depth
            )));
        }

        let mut lineage = self.lineage.lock();
        let existing = lineage.children.get(&parent.id).map_or(0, Vec::len);
        if existing + specs.len() > self.max_children as usize {
            return Err(ConductorError::Delegation(format!(
                "parent task {} would have {} children (max {})",
                parent.id,
                existing + specs.len(),
                self.max_children
            )));
        }

        let root = parent.metadata.root_task_id.unwrap_or(parent.id);
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let worker_type = resolve(spec.worker_type.as_deref(), &spec.required_capabilities)
                .ok_or_else(|| {
                    ConductorError::Routing(format!(
                        "no worker type satisfies capabilities {:?}",
                        spec.required_capabilities
                    ))
                })?;
            let mut task = Task::new(worker_type, spec.payload)
                .with_priority(spec.priority.unwrap_or(parent.priority))
                .with_capabilities(spec.required_capabilities);
            task.metadata.timeout = spec.timeout;
            task.metadata.parent_task_id = Some(parent.id);
            task.metadata.root_task_id = Some(root);
            task.metadata.depth = depth;
            task.metadata
                .correlation_id
                .clone_from(&parent.metadata.correlation_id);
            tasks.push(task);
        }

        let ids = submit(tasks)?;
        lineage.record(parent.id, &ids);
        Ok(ids)
    }

    /// Direct children of `parent`, in delegation order.
    pub fn children_of(&self, parent: TaskId) -> Vec<TaskId> {
        self.lineage
            .lock()
            .children
            .get(&parent)
            .cloned()
            .unwrap_or_default()
    }
}
