use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Platform,
    Toolchain,
    Framework,
    Library,
}

impl PackageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Toolchain => "toolchain",
            Self::Framework => "framework",
            Self::Library => "library",
        }
    }
}

/// What to install: everything the pipeline needs before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub url: String,
    pub kind: PackageKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Registry-provided content fingerprint; verified at install when set.
    #[serde(default)]
    pub expected_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStage {
    Pending,
    Downloading,
    Unpacking,
    Installing,
    Done,
    Failed,
    Cancelled,
}

impl PackageStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Unpacking => "unpacking",
            Self::Installing => "installing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A node in the install DAG, tracked by the scheduler for its whole life.
#[derive(Debug, Clone)]
pub struct PackageTask {
    pub spec: PackageSpec,
    pub stage: PackageStage,
    pub error: Option<String>,
    pub download_attempts: u32,
    pub unpack_attempts: u32,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl PackageTask {
    pub fn new(spec: PackageSpec) -> Self {
        Self {
            spec,
            stage: PackageStage::Pending,
            error: None,
            download_attempts: 0,
            unpack_attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn mark_finished(&mut self, stage: PackageStage) {
        self.stage = stage;
        if self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    pub fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.mark_finished(PackageStage::Failed);
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            (Some(start), None) => Some(start.elapsed()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub name: String,
    pub version: String,
    pub stage: PackageStage,
    #[serde(default)]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub tasks: Vec<TaskSummary>,
    pub total_elapsed_ms: u64,
    pub success: bool,
}

impl PipelineReport {
    pub fn done_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.stage == PackageStage::Done)
            .count()
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskSummary> {
        self.tasks
            .iter()
            .filter(|task| task.stage == PackageStage::Failed)
    }
}
