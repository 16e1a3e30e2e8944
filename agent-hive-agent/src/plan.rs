//! Composite tasks: a DAG of subtasks dispatched as dependencies complete

use crate::coordinator::{Coordinator, TaskAssignment, TaskOutcome};
use agent_hive_core::protocol::Task;
use agent_hive_core::{Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

/// One node of a composite task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub required_capability: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Subtask ids that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-subtask deadline; the coordinator default applies when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Subtask {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        required_capability: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required_capability: required_capability.into(),
            parameters: Map::new(),
            depends_on: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// A task split into dependent subtasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeTask {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl CompositeTask {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            subtasks: Vec::new(),
        }
    }

    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.subtasks.push(subtask);
        self
    }

    /// Coordinator task id for one of the subtasks
    pub fn subtask_task_id(&self, subtask_id: &str) -> String {
        format!("{}/{}", self.task_id, subtask_id)
    }

    /// Check ids and dependencies; returns subtask ids in a valid run order
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.task_id.trim().is_empty() {
            return Err(Error::Validation("composite task id must not be empty".into()));
        }

        let mut known = HashSet::new();
        for subtask in &self.subtasks {
            if subtask.id.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "composite '{}' has a subtask with an empty id",
                    self.task_id
                )));
            }
            if subtask.required_capability.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "subtask '{}' names no capability",
                    subtask.id
                )));
            }
            if !known.insert(subtask.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate subtask id '{}'",
                    subtask.id
                )));
            }
        }

        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for subtask in &self.subtasks {
            indegree.entry(subtask.id.as_str()).or_insert(0);
            for dependency in &subtask.depends_on {
                if !known.contains(dependency.as_str()) {
                    return Err(Error::Validation(format!(
                        "subtask '{}' depends on unknown subtask '{}'",
                        subtask.id, dependency
                    )));
                }
                *indegree.entry(subtask.id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(subtask.id.as_str());
            }
        }

        // Kahn's algorithm, seeded in declaration order
        let mut ready: VecDeque<&str> = self
            .subtasks
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.subtasks.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.subtasks.len() {
            let mut cyclic: Vec<&str> = indegree
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(id, _)| id)
                .collect();
            cyclic.sort_unstable();
            return Err(Error::Validation(format!(
                "dependency cycle among subtasks: {}",
                cyclic.join(", ")
            )));
        }
        Ok(order)
    }
}

/// Per-subtask outcomes of a composite task
#[derive(Debug, Clone, Serialize)]
pub struct CompositeOutcome {
    pub task_id: String,
    pub outcomes: BTreeMap<String, TaskOutcome>,
}

impl CompositeOutcome {
    pub fn get(&self, subtask_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.get(subtask_id)
    }

    /// True when every subtask completed
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(TaskOutcome::is_completed)
    }

    /// Subtask ids that did not complete
    pub fn unfinished(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_completed())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

impl Coordinator {
    /// Run a composite task to completion
    ///
    /// Subtasks whose dependencies have all completed are assigned
    /// concurrently; each receives its dependencies' results under
    /// `parameters.dependencies`. A dependency that ends in any other way
    /// fails its dependents without assigning them.
    pub async fn decompose_and_dispatch(&self, composite: CompositeTask) -> Result<CompositeOutcome> {
        let order = composite.validate()?;
        let subtasks: HashMap<&str, &Subtask> = composite
            .subtasks
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();

        self.track_pending(
            order
                .iter()
                .map(|id| {
                    let subtask = subtasks[id.as_str()];
                    TaskAssignment::pending(
                        composite.subtask_task_id(id),
                        subtask.description.clone(),
                        subtask.required_capability.clone(),
                    )
                })
                .collect(),
        )?;
        info!(
            "Dispatching composite task {} ({} subtasks)",
            composite.task_id,
            order.len()
        );

        let mut outcomes: HashMap<String, TaskOutcome> = HashMap::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                for id in &order {
                    if outcomes.contains_key(id) || dispatched.contains(id) {
                        continue;
                    }
                    let subtask = subtasks[id.as_str()];
                    let task_id = composite.subtask_task_id(id);

                    if let Some(failed) = subtask
                        .depends_on
                        .iter()
                        .find(|dep| outcomes.get(*dep).is_some_and(|o| !o.is_completed()))
                    {
                        let reason = format!("dependency '{}' did not complete", failed);
                        self.fail_task(&task_id, &reason);
                        outcomes.insert(id.clone(), TaskOutcome::Failed(reason));
                        progressed = true;
                        continue;
                    }
                    if !subtask
                        .depends_on
                        .iter()
                        .all(|dep| outcomes.get(dep).is_some_and(TaskOutcome::is_completed))
                    {
                        continue;
                    }

                    let timeout = subtask
                        .timeout_ms
                        .map_or_else(|| self.config().default_timeout(), Duration::from_millis);
                    let task = self.subtask_task(&task_id, &composite, subtask, &outcomes);
                    match self.assign_task(task, &subtask.required_capability, timeout) {
                        Ok(_) => {
                            dispatched.insert(id.clone());
                            let subtask_id = id.clone();
                            in_flight.push(async move {
                                let outcome = self.await_result(&task_id, timeout).await;
                                (subtask_id, outcome)
                            });
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            self.fail_task(&task_id, &reason);
                            outcomes.insert(id.clone(), TaskOutcome::Failed(reason));
                            progressed = true;
                        }
                    }
                }
            }

            match in_flight.next().await {
                Some((subtask_id, outcome)) => {
                    if !outcome.is_completed() {
                        warn!(
                            "Subtask {} of {} ended {}",
                            subtask_id,
                            composite.task_id,
                            outcome.status()
                        );
                    }
                    outcomes.insert(subtask_id, outcome);
                }
                None => break,
            }
        }

        Ok(CompositeOutcome {
            task_id: composite.task_id.clone(),
            outcomes: outcomes.into_iter().collect(),
        })
    }

    fn subtask_task(
        &self,
        task_id: &str,
        composite: &CompositeTask,
        subtask: &Subtask,
        outcomes: &HashMap<String, TaskOutcome>,
    ) -> Task {
        let mut task = Task::new(subtask.description.as_str(), subtask.required_capability.as_str())
            .with_id(task_id)
            .with_parameter("composite_task", composite.task_id.as_str())
            .requires(subtask.required_capability.as_str());
        task.parameters.extend(subtask.parameters.clone());

        if !subtask.depends_on.is_empty() {
            let dependencies: Map<String, Value> = subtask
                .depends_on
                .iter()
                .filter_map(|dep| {
                    outcomes
                        .get(dep)
                        .and_then(TaskOutcome::payload)
                        .map(|payload| (dep.clone(), payload.clone()))
                })
                .collect();
            task.parameters
                .insert("dependencies".to_string(), Value::Object(dependencies));
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hive_core::bus::MessageBus;
    use agent_hive_core::config::CoordinatorConfig;
    use agent_hive_core::protocol::{MessageKind, TaskStatus};
    use serde_json::json;

    fn pipeline() -> CompositeTask {
        CompositeTask::new("report", "Write a report")
            .with_subtask(Subtask::new("research", "Collect sources", "research"))
            .with_subtask(Subtask::new("analyze", "Find trends", "analysis"))
            .with_subtask(
                Subtask::new("write", "Draft the report", "writing")
                    .after("research")
                    .after("analyze"),
            )
    }

    #[test]
    fn test_validate_orders_dependencies_last() {
        let order = pipeline().validate().unwrap();
        assert_eq!(order, vec!["research", "analyze", "write"]);
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        let duplicate = CompositeTask::new("c", "")
            .with_subtask(Subtask::new("a", "", "research"))
            .with_subtask(Subtask::new("a", "", "research"));
        assert!(duplicate.validate().is_err());

        let unknown = CompositeTask::new("c", "")
            .with_subtask(Subtask::new("a", "", "research").after("ghost"));
        assert!(unknown.validate().is_err());

        let cycle = CompositeTask::new("c", "")
            .with_subtask(Subtask::new("a", "", "research").after("b"))
            .with_subtask(Subtask::new("b", "", "research").after("a"))
            .with_subtask(Subtask::new("c", "", "research"));
        let err = cycle.validate().unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("a, b")));
    }

    #[tokio::test]
    async fn test_invalid_graph_dispatches_nothing() {
        let bus = MessageBus::default();
        let coordinator = Coordinator::start(bus.clone(), CoordinatorConfig::default()).unwrap();
        let mut researcher = bus.register("researcher", ["research"]).unwrap();

        let composite = CompositeTask::new("c", "")
            .with_subtask(Subtask::new("a", "", "research"))
            .with_subtask(Subtask::new("b", "", "research").after("b"));
        assert!(coordinator.decompose_and_dispatch(composite).await.is_err());
        assert!(researcher.try_recv().is_none());
        assert!(coordinator.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_missing_capability_fails_dependents() {
        let bus = MessageBus::default();
        let coordinator = Coordinator::start(bus.clone(), CoordinatorConfig::default()).unwrap();

        let composite = CompositeTask::new("c", "")
            .with_subtask(Subtask::new("a", "", "research"))
            .with_subtask(Subtask::new("b", "", "writing").after("a"));
        let outcome = coordinator.decompose_and_dispatch(composite).await.unwrap();

        assert!(matches!(outcome.get("a"), Some(TaskOutcome::Failed(e)) if e.contains("research")));
        assert!(matches!(outcome.get("b"), Some(TaskOutcome::Failed(e)) if e.contains("'a'")));
        assert_eq!(outcome.unfinished(), vec!["a", "b"]);
        assert_eq!(coordinator.task_status("c/b"), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_dependency_results_forwarded() {
        let bus = MessageBus::default();
        let coordinator = Coordinator::start(bus.clone(), CoordinatorConfig::default()).unwrap();
        let mut worker = bus.register("worker", ["research", "writing"]).unwrap();

        let composite = CompositeTask::new("doc", "")
            .with_subtask(Subtask::new("facts", "", "research"))
            .with_subtask(Subtask::new("draft", "", "writing").after("facts"));

        let answering = async {
            for reply in [json!("fact list"), json!("final draft")] {
                let task = worker.recv().await.unwrap();
                if task.correlation_id() == Some("doc/draft") {
                    let params = &task.payload()["parameters"];
                    assert_eq!(params["dependencies"]["facts"], json!("fact list"));
                }
                bus.send(task.reply(MessageKind::Result, reply).unwrap()).unwrap();
            }
        };
        let (outcome, ()) = tokio::join!(coordinator.decompose_and_dispatch(composite), answering);

        let outcome = outcome.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.get("draft"), Some(&TaskOutcome::Completed(json!("final draft"))));
    }
}
