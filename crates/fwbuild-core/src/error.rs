use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    #[error("permanent remote failure: {0}")]
    PermanentRemote(String),
    #[error("depends on failed task {task}")]
    DependencyFailure { task: String },
    #[error("cyclic dependency detected: {path}")]
    DependencyCycle { path: String },
    #[error("lock {name} held by pid {holder_pid}")]
    LockContended { name: String, holder_pid: u32 },
    #[error("preempted by a higher-priority request")]
    Preempted,
    #[error("operation cancelled")]
    OperationCancelled,
    #[error("child process produced no output for {secs}s")]
    ChildInactivity { secs: u64 },
    #[error("child process exited with status {status}: {stderr}")]
    ChildNonzero { status: i32, stderr: String },
    #[error("manifest missing required field: {field}")]
    DefectiveManifest { field: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::CoordinatorError;

    #[test]
    fn cancellation_is_distinguished_from_other_failures() {
        assert!(CoordinatorError::OperationCancelled.is_cancellation());
        assert!(!CoordinatorError::Preempted.is_cancellation());
        assert!(!CoordinatorError::TransientIo("reset".to_owned()).is_cancellation());
    }

    #[test]
    fn io_errors_convert_into_io_variant() {
        let error: CoordinatorError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(matches!(error, CoordinatorError::Io(message) if message.contains("reset")));
    }
}
