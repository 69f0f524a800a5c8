use std::path::PathBuf;
use std::time::Duration;

use fwbuild_core::{BuildContext, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One translation unit. The owning request's build context is captured into
/// the job so a shared worker reinstates the caller's output state, never its
/// own or another request's.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub job_id: String,
    pub request_id: RequestId,
    pub source: PathBuf,
    pub object: PathBuf,
    pub command: Vec<String>,
    pub context: BuildContext,
}

impl CompileJob {
    /// The incremental check: an object at least as new as its source means
    /// no compiler runs for this unit.
    pub fn is_up_to_date(&self) -> bool {
        let Ok(object_meta) = std::fs::metadata(&self.object) else {
            return false;
        };
        let Ok(source_meta) = std::fs::metadata(&self.source) else {
            return false;
        };
        match (object_meta.modified(), source_meta.modified()) {
            (Ok(object_mtime), Ok(source_mtime)) => object_mtime >= source_mtime,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Short-circuited by the mtime comparison; no child process ran.
    pub skipped: bool,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Done
    }
}
