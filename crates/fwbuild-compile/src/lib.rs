//! Process-wide compilation pool: parallel translation-unit compiles with
//! incremental mtime skipping and per-request cancellation.

pub mod job;
pub mod pool;
pub mod spawn;

pub use job::{CompileJob, JobOutcome, JobState};
pub use pool::{CompilationPool, Parallelism};
pub use spawn::run_child_captured;
