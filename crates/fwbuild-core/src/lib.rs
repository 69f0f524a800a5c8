//! Shared identifiers, request model, and error types for the coordinator.

pub mod context;
pub mod error;
pub mod ids;
pub mod request;

pub use context::{BuildContext, Verbosity};
pub use error::{CoordinatorError, CoordinatorResult};
pub use ids::{LeaseId, RequestId};
pub use request::{
    BuildParams, CancelPolicy, ClientIdentity, DeployParams, InstallDepsParams, MonitorParams,
    RequestKind, RequestRecord, RequestStatus,
};
