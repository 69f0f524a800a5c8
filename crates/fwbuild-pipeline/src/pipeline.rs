use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fwbuild_config::PipelineTuning;
use fwbuild_core::{CoordinatorError, CoordinatorResult, LeaseId};
use fwbuild_coordination::{AcquireOutcome, CancelToken, LockManager, LockPolicy};

use crate::cache::PackageCache;
use crate::models::{PackageSpec, PackageStage, PipelineReport, TaskSummary};
use crate::pools::{StageEvent, StageOutcome, StagePools, StageShared};
use crate::progress::ProgressSink;
use crate::scheduler::DependencyScheduler;
use crate::stages::StageTuning;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub tuning: PipelineTuning,
    /// `true` for install-dependencies: cancellation is reported but the
    /// pipeline runs to completion so the shared cache still fills.
    pub continue_on_cancel: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tuning: PipelineTuning::default(),
            continue_on_cancel: false,
        }
    }
}

/// Drives the three-stage DAG pipeline to completion for one request. Runs on
/// a blocking thread; the per-request output context travels inside the
/// progress sink.
pub struct InstallPipeline {
    cache: Arc<PackageCache>,
    locks: Option<Arc<LockManager>>,
    owner_pid: u32,
}

impl InstallPipeline {
    pub fn new(cache: Arc<PackageCache>) -> Self {
        Self {
            cache,
            locks: None,
            owner_pid: std::process::id(),
        }
    }

    /// Serialize per-package installs across concurrent requests through
    /// `install:<name>@<version>` locks.
    pub fn with_lock_manager(mut self, locks: Arc<LockManager>, owner_pid: u32) -> Self {
        self.locks = Some(locks);
        self.owner_pid = owner_pid;
        self
    }

    pub fn run(
        &self,
        specs: Vec<PackageSpec>,
        options: &PipelineOptions,
        progress: Arc<dyn ProgressSink>,
        token: CancelToken,
    ) -> CoordinatorResult<PipelineReport> {
        let started = Instant::now();
        let mut scheduler = DependencyScheduler::new();
        for spec in specs {
            scheduler.add_task(spec)?;
        }
        scheduler.validate()?;

        let stage_token = if options.continue_on_cancel {
            token.disabled()
        } else {
            token.clone()
        };
        let shared = Arc::new(StageShared {
            cache: Arc::clone(&self.cache),
            tuning: StageTuning::from(&options.tuning),
            progress: Arc::clone(&progress),
            token: stage_token,
        });
        let (pools, events) = StagePools::start(
            options.tuning.download_workers,
            options.tuning.unpack_workers,
            options.tuning.install_workers,
            shared,
        );

        let mut run = PipelineRun {
            cache: self.cache.as_ref(),
            locks: self.locks.as_deref(),
            owner_pid: self.owner_pid,
            scheduler,
            pools: &pools,
            progress: progress.as_ref(),
            install_leases: HashMap::new(),
            cancelling: false,
            cancel_reported: false,
        };

        run.dispatch_ready();
        run.publish_summary();

        while !run.scheduler.all_terminal() {
            match events.recv_timeout(EVENT_POLL_INTERVAL) {
                Ok(event) => run.handle_event(event, options),
                // Re-check readiness on idle ticks: a package held under a
                // foreign install lock becomes a cache hit once that install
                // commits, without any event on our channel.
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => run.dispatch_ready(),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            // Cancellation checkpoint between stage events.
            if token.is_cancelled() {
                if options.continue_on_cancel {
                    if !run.cancel_reported {
                        run.cancel_reported = true;
                        tracing::info!(
                            "cancellation observed; install continues to populate the cache"
                        );
                    }
                } else if !run.cancelling {
                    run.begin_cancel();
                }
            }
        }

        let report = run.into_report(started);
        pools.shutdown();

        if !options.continue_on_cancel && token.is_cancelled() {
            return Err(CoordinatorError::OperationCancelled);
        }
        Ok(report)
    }
}

struct PipelineRun<'a> {
    cache: &'a PackageCache,
    locks: Option<&'a LockManager>,
    owner_pid: u32,
    scheduler: DependencyScheduler,
    pools: &'a StagePools,
    progress: &'a dyn ProgressSink,
    install_leases: HashMap<String, LeaseId>,
    cancelling: bool,
    cancel_reported: bool,
}

impl PipelineRun<'_> {
    /// Move every ready task into the download pool, short-circuiting tasks
    /// whose cache entry is already committed.
    fn dispatch_ready(&mut self) {
        if self.cancelling {
            return;
        }
        loop {
            let ready = self.scheduler.ready_tasks();
            if ready.is_empty() {
                break;
            }
            let mut advanced = false;
            for name in ready {
                let spec = match self.scheduler.task(&name) {
                    Some(task) => task.spec.clone(),
                    None => continue,
                };

                if self.cache.is_installed(&spec) {
                    let elapsed = {
                        let task = self.scheduler.task_mut(&name).expect("ready task exists");
                        task.mark_started();
                        task.mark_finished(PackageStage::Done);
                        task.elapsed().unwrap_or_default()
                    };
                    self.release_install_lock(&spec);
                    self.progress.on_finished(&name, PackageStage::Done, elapsed);
                    advanced = true;
                    continue;
                }

                if !self.try_install_lock(&spec) {
                    // Another request is installing this package; it becomes
                    // a cache hit once that install commits.
                    continue;
                }

                let task = self.scheduler.task_mut(&name).expect("ready task exists");
                task.mark_started();
                task.download_attempts += 1;
                task.stage = PackageStage::Downloading;
                self.pools.submit_download(spec);
            }
            if !advanced {
                break;
            }
        }
    }

    fn try_install_lock(&mut self, spec: &PackageSpec) -> bool {
        let Some(locks) = self.locks else { return true };
        let name = install_lock_name(spec);
        match locks.acquire(&name, self.owner_pid, LockPolicy::Fail) {
            AcquireOutcome::Acquired(lease) => {
                self.install_leases.insert(name, lease);
                true
            }
            _ => false,
        }
    }

    fn release_install_lock(&mut self, spec: &PackageSpec) {
        let Some(locks) = self.locks else { return };
        if let Some(lease) = self.install_leases.remove(&install_lock_name(spec)) {
            locks.release(&install_lock_name(spec), &lease);
        }
    }

    fn handle_event(&mut self, event: StageEvent, options: &PipelineOptions) {
        let name = event.task.clone();
        let spec = match self.scheduler.task(&name) {
            Some(task) => task.spec.clone(),
            None => return,
        };

        match event.outcome {
            StageOutcome::Downloaded(archive) => {
                if let Some(task) = self.scheduler.task_mut(&name) {
                    task.stage = PackageStage::Unpacking;
                    task.unpack_attempts += 1;
                }
                self.pools.submit_unpack(spec, archive);
            }
            StageOutcome::Unpacked(_content) => {
                if let Some(task) = self.scheduler.task_mut(&name) {
                    task.stage = PackageStage::Installing;
                }
                self.pools.submit_install(spec);
            }
            StageOutcome::Installed(_manifest) => {
                if let Some(task) = self.scheduler.task_mut(&name) {
                    task.mark_finished(PackageStage::Done);
                    self.progress.on_finished(
                        &name,
                        PackageStage::Done,
                        task.elapsed().unwrap_or_default(),
                    );
                }
                self.release_install_lock(&spec);
                self.dispatch_ready();
            }
            StageOutcome::Failed(error) => {
                if let Some(task) = self.scheduler.task_mut(&name) {
                    task.fail(error.to_string());
                    self.progress.on_finished(
                        &name,
                        PackageStage::Failed,
                        task.elapsed().unwrap_or_default(),
                    );
                }
                let _ = self.cache.cleanup_partial(&spec);
                self.release_install_lock(&spec);
                self.poison_after_failure(&name);
            }
            StageOutcome::Cancelled => {
                if let Some(task) = self.scheduler.task_mut(&name) {
                    task.mark_finished(PackageStage::Cancelled);
                    self.progress.on_finished(
                        &name,
                        PackageStage::Cancelled,
                        task.elapsed().unwrap_or_default(),
                    );
                }
                let _ = self.cache.cleanup_partial(&spec);
                self.release_install_lock(&spec);
                if !options.continue_on_cancel && !self.cancelling {
                    self.begin_cancel();
                }
            }
        }
        self.publish_summary();
    }

    fn poison_after_failure(&mut self, failed: &str) {
        self.scheduler.poison_dependents(failed);
        let poisoned: Vec<(String, Duration)> = self
            .scheduler
            .tasks()
            .filter(|task| task.stage == PackageStage::Failed && task.name() != failed)
            .filter(|task| task.error.as_deref().map(|e| e.starts_with("depends on")) == Some(true))
            .map(|task| (task.name().to_owned(), task.elapsed().unwrap_or_default()))
            .collect();
        for (name, elapsed) in poisoned {
            self.progress.on_finished(&name, PackageStage::Failed, elapsed);
        }
    }

    fn begin_cancel(&mut self) {
        self.cancelling = true;
        let cancelled = self.scheduler.cancel_pending();
        for name in cancelled {
            let spec = self
                .scheduler
                .task(&name)
                .map(|task| task.spec.clone());
            if let Some(spec) = spec {
                let _ = self.cache.cleanup_partial(&spec);
                self.release_install_lock(&spec);
            }
            self.progress
                .on_finished(&name, PackageStage::Cancelled, Duration::ZERO);
        }
        self.publish_summary();
    }

    fn publish_summary(&self) {
        let total = self.scheduler.task_count();
        let done = self
            .scheduler
            .tasks()
            .filter(|task| task.stage == PackageStage::Done)
            .count();
        let active = self
            .scheduler
            .tasks()
            .filter(|task| {
                matches!(
                    task.stage,
                    PackageStage::Downloading
                        | PackageStage::Unpacking
                        | PackageStage::Installing
                )
            })
            .count();
        self.progress.on_summary(total, active, done);
    }

    fn into_report(self, started: Instant) -> PipelineReport {
        let mut tasks: Vec<TaskSummary> = self
            .scheduler
            .tasks()
            .map(|task| TaskSummary {
                name: task.name().to_owned(),
                version: task.spec.version.clone(),
                stage: task.stage,
                error: task.error.clone(),
                elapsed_ms: task
                    .elapsed()
                    .map(|elapsed| elapsed.as_millis() as u64)
                    .unwrap_or(0),
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        let success = tasks.iter().all(|task| task.stage == PackageStage::Done);
        PipelineReport {
            tasks,
            total_elapsed_ms: started.elapsed().as_millis() as u64,
            success,
        }
    }
}

fn install_lock_name(spec: &PackageSpec) -> String {
    format!("install:{}@{}", spec.name, spec.version)
}
