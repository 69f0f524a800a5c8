//! Client-side access to the coordinator: locate-or-spawn bootstrap,
//! interruptible HTTP calls, and status streaming.

pub mod api;
pub mod bootstrap;
pub mod http;

pub use api::CoordinatorClient;
pub use bootstrap::{ensure_coordinator, health_probe, BootstrapOptions};
pub use http::{Interrupt, InterruptibleHttp};
