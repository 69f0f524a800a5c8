use std::collections::HashMap;

use fwbuild_core::{CoordinatorError, CoordinatorResult};
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::DiGraph;

use crate::models::{PackageSpec, PackageStage, PackageTask};

/// Tracks every package task and answers which are ready to download: a task
/// is ready only when all of its dependencies are done.
#[derive(Debug, Default)]
pub struct DependencyScheduler {
    tasks: HashMap<String, PackageTask>,
}

impl DependencyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, spec: PackageSpec) -> CoordinatorResult<()> {
        if self.tasks.contains_key(&spec.name) {
            return Err(CoordinatorError::Configuration(format!(
                "duplicate package task: {}",
                spec.name
            )));
        }
        self.tasks.insert(spec.name.clone(), PackageTask::new(spec));
        Ok(())
    }

    /// Reject unknown dependency references and cycles before any stage runs.
    pub fn validate(&self) -> CoordinatorResult<()> {
        for task in self.tasks.values() {
            for dep in &task.spec.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(CoordinatorError::Configuration(format!(
                        "package {} depends on unknown task {dep}",
                        task.name()
                    )));
                }
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for name in self.tasks.keys() {
            indices.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for task in self.tasks.values() {
            for dep in &task.spec.dependencies {
                graph.add_edge(indices[dep.as_str()], indices[task.name()], ());
            }
        }

        if toposort(&graph, None).is_err() {
            let cycle = kosaraju_scc(&graph)
                .into_iter()
                .find(|component| component.len() > 1)
                .map(|component| {
                    let mut names: Vec<&str> =
                        component.iter().map(|index| graph[*index]).collect();
                    names.sort_unstable();
                    names.join(" -> ")
                })
                .unwrap_or_else(|| "self-dependency".to_owned());
            return Err(CoordinatorError::DependencyCycle { path: cycle });
        }
        Ok(())
    }

    /// Pending tasks whose dependencies are all done.
    pub fn ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .tasks
            .values()
            .filter(|task| task.stage == PackageStage::Pending)
            .filter(|task| {
                task.spec.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|dep_task| dep_task.stage == PackageStage::Done)
                        .unwrap_or(false)
                })
            })
            .map(|task| task.name().to_owned())
            .collect();
        ready.sort();
        ready
    }

    pub fn task(&self, name: &str) -> Option<&PackageTask> {
        self.tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut PackageTask> {
        self.tasks.get_mut(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &PackageTask> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|task| task.stage.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.tasks
            .values()
            .any(|task| task.stage == PackageStage::Failed)
    }

    /// Mark every transitive dependent of `failed_name` as failed; they are
    /// never dispatched.
    pub fn poison_dependents(&mut self, failed_name: &str) {
        loop {
            let next: Vec<String> = self
                .tasks
                .values()
                .filter(|task| !task.stage.is_terminal())
                .filter(|task| {
                    task.spec.dependencies.iter().any(|dep| {
                        self.tasks
                            .get(dep)
                            .map(|dep_task| dep_task.stage == PackageStage::Failed)
                            .unwrap_or(false)
                    })
                })
                .map(|task| task.name().to_owned())
                .collect();
            if next.is_empty() {
                break;
            }
            for name in next {
                let failed_dep = self
                    .tasks
                    .get(&name)
                    .and_then(|task| {
                        task.spec.dependencies.iter().find(|dep| {
                            self.tasks
                                .get(dep.as_str())
                                .map(|dep_task| dep_task.stage == PackageStage::Failed)
                                .unwrap_or(false)
                        })
                    })
                    .cloned()
                    .unwrap_or_else(|| failed_name.to_owned());
                if let Some(task) = self.tasks.get_mut(&name) {
                    task.fail(format!("depends on failed task {failed_dep}"));
                }
            }
        }
    }

    /// Pending tasks become cancelled; in-flight stages keep running to their
    /// safe drop point and report through the normal event path.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for task in self.tasks.values_mut() {
            if task.stage == PackageStage::Pending {
                task.mark_finished(PackageStage::Cancelled);
                cancelled.push(task.name().to_owned());
            }
        }
        cancelled.sort();
        cancelled
    }
}
