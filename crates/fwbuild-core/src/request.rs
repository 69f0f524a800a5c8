use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub pid: u32,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Observed cancellation aborts the operation.
    Cancellable,
    /// Cancellation is reported but the operation runs to completion.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    pub project_dir: PathBuf,
    pub environment: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    pub project_dir: PathBuf,
    pub environment: String,
    pub port: String,
    #[serde(default)]
    pub use_cached_firmware: bool,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorParams {
    pub port: String,
    pub baud: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallDepsParams {
    pub project_dir: PathBuf,
    pub environment: String,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Build(BuildParams),
    Deploy(DeployParams),
    Monitor(MonitorParams),
    InstallDeps(InstallDepsParams),
    Status,
    Shutdown,
}

impl RequestKind {
    pub fn cancel_policy(&self) -> CancelPolicy {
        match self {
            Self::InstallDeps(_) => CancelPolicy::Continue,
            _ => CancelPolicy::Cancellable,
        }
    }

    /// Named locks the dispatcher must hold for the whole request.
    pub fn required_locks(&self) -> Vec<String> {
        match self {
            Self::Build(params) => vec![format!("env:{}", params.environment)],
            Self::Deploy(params) => vec![
                format!("env:{}", params.environment),
                format!("device:{}", params.port),
            ],
            Self::Monitor(params) => vec![format!("monitor:{}", params.port)],
            Self::InstallDeps(params) => vec![format!("env:{}", params.environment)],
            Self::Status | Self::Shutdown => Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Deploy(_) => "deploy",
            Self::Monitor(_) => "monitor",
            Self::InstallDeps(_) => "install-deps",
            Self::Status => "status",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub client: ClientIdentity,
    pub kind: RequestKind,
    pub created_at: SystemTime,
    pub status: RequestStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RequestRecord {
    pub fn new(client: ClientIdentity, kind: RequestKind) -> Self {
        Self {
            id: RequestId::generate(),
            client,
            kind,
            created_at: SystemTime::now(),
            status: RequestStatus::Queued,
            detail: None,
        }
    }
}
