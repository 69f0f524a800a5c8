//! The coordinator process: request dispatcher, endpoint server, and the
//! state files that make singleton bootstrap race-tolerant.

pub mod dispatcher;
pub mod events;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod state;

pub use events::{RequestEvent, RequestEventBus, RequestEventEnvelope};
pub use fwbuild_protocol as protocol;
pub use registry::RequestRegistry;
pub use runtime::run_daemon;
pub use state::CoordinatorState;
