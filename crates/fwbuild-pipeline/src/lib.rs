//! Parallel package-install pipeline: a DAG scheduler feeding three bounded
//! worker pools (download, unpack, install) over a content-addressed cache.

pub mod adapters;
pub mod cache;
pub mod models;
pub mod pipeline;
pub mod pools;
pub mod progress;
pub mod scheduler;
pub mod stages;

pub use adapters::{EnvironmentPackages, environment_task_graph};
pub use cache::{CacheEntryManifest, PackageCache};
pub use models::{PackageKind, PackageSpec, PackageStage, PackageTask, PipelineReport};
pub use pipeline::{InstallPipeline, PipelineOptions};
pub use progress::{stderr_sink, PlainProgress, ProgressAggregator, ProgressSink};
pub use scheduler::DependencyScheduler;
