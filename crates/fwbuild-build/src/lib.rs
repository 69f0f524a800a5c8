//! Build orchestration: source discovery, translation-unit planning, the
//! compile/link/image phases, and the per-platform command registry.

pub mod discovery;
pub mod ledger;
pub mod manifest;
pub mod orchestrator;
pub mod platform;

pub use discovery::{discover_sources, plan_units, UnitPlan};
pub use ledger::{FirmwareLedger, FirmwareRecord};
pub use manifest::{EnvironmentConfig, LibraryDependency, ProjectManifest};
pub use orchestrator::{BuildInputs, BuildOrchestrator, BuildOutcome, BuildProfile};
pub use platform::{CommandTables, PlatformBackend, PlatformRegistry};
