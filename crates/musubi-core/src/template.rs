//! Declarative flow blueprints and their DAG validation.

use crate::action::{ActionId, ActionName};
use crate::error::{EngineError, Result};
use crate::retry::TaskRetry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// One node of a flow blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Local id, unique within the flow.
    pub action_id: ActionId,
    /// Registered action this task runs.
    pub action_name: ActionName,
    /// Local ids that must succeed before this task starts.
    #[serde(default)]
    pub depend_on: Vec<ActionId>,
    /// Default payload; a flow request may override it.
    #[serde(default)]
    pub params: Option<Value>,
    /// Opt-in re-execution after failure.
    #[serde(default)]
    pub retry: TaskRetry,
    /// Per-attempt timeout; the engine default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskTemplate {
    /// Creates a task with no dependencies and no payload.
    pub fn new(action_id: impl Into<ActionId>, action_name: impl Into<ActionName>) -> Self {
        Self {
            action_id: action_id.into(),
            action_name: action_name.into(),
            depend_on: Vec::new(),
            params: None,
            retry: TaskRetry::default(),
            timeout_secs: None,
        }
    }

    /// Adds dependencies.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionId>,
    {
        self.depend_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sets the default payload.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Enables task retry.
    pub fn with_retry(mut self, retry: TaskRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A named blueprint: seed ShareData plus a DAG of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    /// Unique template name.
    pub name: String,
    /// Initial ShareData for every flow created from this template.
    #[serde(default)]
    pub share_data: BTreeMap<String, String>,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskTemplate>,
}

impl FlowTemplate {
    /// Creates an empty template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            share_data: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Appends a task.
    pub fn task(mut self, task: TaskTemplate) -> Self {
        self.tasks.push(task);
        self
    }

    /// Seeds a ShareData entry.
    pub fn share(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.share_data.insert(key.into(), value.into());
        self
    }

    /// Checks the template forms a closed DAG.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidParameter(
                "template name is required".to_string(),
            ));
        }
        topological_order(&self.tasks).map(|_| ())
    }
}

/// Orders tasks so that every task follows all of its dependencies.
///
/// Fails with [`EngineError::InvalidParameter`] on an empty list, a duplicated
/// action id, a dependency on an unknown id, or a cycle.
pub fn topological_order(tasks: &[TaskTemplate]) -> Result<Vec<ActionId>> {
    if tasks.is_empty() {
        return Err(EngineError::InvalidParameter(
            "flow requires at least one task".to_string(),
        ));
    }

    let mut indegree: HashMap<&ActionId, usize> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        if indegree.insert(&task.action_id, 0).is_some() {
            return Err(EngineError::InvalidParameter(format!(
                "action id {} is duplicated",
                task.action_id
            )));
        }
    }

    let mut dependents: HashMap<&ActionId, Vec<&ActionId>> = HashMap::new();
    for task in tasks {
        let mut seen = HashSet::new();
        for dep in &task.depend_on {
            if !indegree.contains_key(dep) {
                return Err(EngineError::InvalidParameter(format!(
                    "task {} depends on unknown action id {}",
                    task.action_id, dep
                )));
            }
            if dep == &task.action_id {
                return Err(EngineError::InvalidParameter(format!(
                    "task {} depends on itself",
                    task.action_id
                )));
            }
            if seen.insert(dep) {
                dependents.entry(dep).or_default().push(&task.action_id);
                *indegree.entry(&task.action_id).or_default() += 1;
            }
        }
    }

    // Kahn's algorithm, seeded in declaration order so the result is stable.
    let mut queue: VecDeque<&ActionId> = tasks
        .iter()
        .map(|t| &t.action_id)
        .filter(|id| indegree.get(id).copied() == Some(0))
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        for next in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = indegree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck: Vec<String> = tasks
            .iter()
            .filter(|t| !order.contains(&t.action_id))
            .map(|t| t.action_id.to_string())
            .collect();
        return Err(EngineError::InvalidParameter(format!(
            "dependency cycle among tasks [{}]",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
