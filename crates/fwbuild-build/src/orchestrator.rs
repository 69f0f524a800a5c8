use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fwbuild_compile::{CompilationPool, CompileJob, JobOutcome, Parallelism};
use fwbuild_core::{BuildContext, CoordinatorError, CoordinatorResult, RequestId};
use fwbuild_coordination::CancelToken;
use fwbuild_pipeline::{
    environment_task_graph, InstallPipeline, PackageCache, PackageStage, PipelineOptions,
    PipelineReport, ProgressSink,
};

use crate::discovery::{discover_sources, plan_units, UnitPlan};
use crate::ledger::FirmwareLedger;
use crate::manifest::ProjectManifest;
use crate::platform::PlatformRegistry;

const LINK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildProfile {
    Release,
    Quick,
}

impl BuildProfile {
    pub fn from_name(name: Option<&str>) -> CoordinatorResult<Self> {
        match name {
            None | Some("release") => Ok(Self::Release),
            Some("quick") => Ok(Self::Quick),
            Some(other) => Err(CoordinatorError::Configuration(format!(
                "unknown build profile: {other}"
            ))),
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Quick => "quick",
        }
    }

    fn extra_flags(self) -> Vec<String> {
        match self {
            Self::Release => Vec::new(),
            Self::Quick => vec!["-O0".to_owned()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub request_id: RequestId,
    pub project_dir: PathBuf,
    pub manifest: ProjectManifest,
    pub environment: String,
    pub profile: BuildProfile,
    pub parallelism: Parallelism,
    pub context: BuildContext,
    pub pipeline_options: PipelineOptions,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub elf_path: PathBuf,
    pub image_path: PathBuf,
    pub compiled_units: usize,
    pub skipped_units: usize,
    pub pipeline: PipelineReport,
}

/// Runs the totally-ordered build phases for one request: install packages,
/// discover sources, compile, link, post-process. Cancellation is observed
/// between phases and inside the pool wait loops.
pub struct BuildOrchestrator {
    registry: Arc<PlatformRegistry>,
    cache: Arc<PackageCache>,
    pipeline: InstallPipeline,
    ledger: Arc<FirmwareLedger>,
}

impl BuildOrchestrator {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        cache: Arc<PackageCache>,
        pipeline: InstallPipeline,
        ledger: Arc<FirmwareLedger>,
    ) -> Self {
        Self {
            registry,
            cache,
            pipeline,
            ledger,
        }
    }

    /// Install only the environment's packages (the install-deps request).
    pub fn install_dependencies(
        &self,
        inputs: &BuildInputs,
        progress: Arc<dyn ProgressSink>,
        token: &CancelToken,
    ) -> CoordinatorResult<PipelineReport> {
        let env = inputs.manifest.environment(&inputs.environment)?;
        let backend = self.registry.get(&env.platform)?;
        let specs = environment_task_graph(backend.required_packages(env));
        inputs.context.emit(&format!(
            "installing {} packages for {}",
            specs.len(),
            inputs.environment
        ));
        self.pipeline
            .run(specs, &inputs.pipeline_options, progress, token.clone())
    }

    pub fn run(
        &self,
        pool: &CompilationPool,
        compile_timeout: Duration,
        inputs: &BuildInputs,
        progress: Arc<dyn ProgressSink>,
        token: &CancelToken,
    ) -> CoordinatorResult<BuildOutcome> {
        let context = &inputs.context;
        let env = inputs.manifest.environment(&inputs.environment)?;
        let backend = self.registry.get(&env.platform)?;

        // Phase: package install.
        token.checkpoint()?;
        let report = self.install_dependencies(inputs, progress, token)?;
        if !report.success {
            return Err(install_failure(&report));
        }

        // Phase: source discovery and unit planning.
        token.checkpoint()?;
        let src_root = inputs
            .project_dir
            .join(env.src_dir.as_deref().unwrap_or("src"));
        let sources = discover_sources(&src_root)?;
        context.emit(&format!("discovered {} source files", sources.len()));

        let profile_dir = inputs
            .project_dir
            .join("build")
            .join(&inputs.environment)
            .join(inputs.profile.dir_name());
        let object_dir = profile_dir.join("objects");
        let tables = backend.command_tables(env, &self.cache)?;

        let mut extra_flags = inputs.profile.extra_flags();
        extra_flags.extend(env.build_flags.iter().cloned());
        let plans = plan_units(
            &sources,
            &src_root,
            &object_dir,
            &tables.compiler,
            &tables.compile_flags,
            &extra_flags,
        )?;
        for plan in &plans {
            if let Some(parent) = plan.object.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Phase: compile.
        token.checkpoint()?;
        let outcomes = self.compile(pool, compile_timeout, inputs, &plans, token)?;
        let compiled_units = outcomes.iter().filter(|o| !o.skipped).count();
        let skipped_units = outcomes.iter().filter(|o| o.skipped).count();
        if let Some(failed) = outcomes.iter().find(|outcome| !outcome.succeeded()) {
            return Err(CoordinatorError::ChildNonzero {
                status: failed.exit_code.unwrap_or(-1),
                stderr: failed.stderr.clone(),
            });
        }
        context.emit(&format!(
            "compiled {compiled_units} units, {skipped_units} up to date"
        ));

        // Phase: link.
        token.checkpoint()?;
        let elf_path = profile_dir.join("firmware.elf");
        let mut link_command = Vec::new();
        link_command.push(tables.linker.clone());
        link_command.extend(tables.link_flags.iter().cloned());
        link_command.extend(
            plans
                .iter()
                .map(|plan| plan.object.to_string_lossy().into_owned()),
        );
        link_command.push("-o".to_owned());
        link_command.push(elf_path.to_string_lossy().into_owned());
        run_external(&link_command, context, "link")?;

        // Phase: image post-process.
        token.checkpoint()?;
        let image_path = profile_dir.join(format!("firmware.{}", tables.image_extension));
        let mut image_command = Vec::new();
        image_command.push(tables.objcopy.clone());
        image_command.extend(tables.image_flags.iter().cloned());
        image_command.push(elf_path.to_string_lossy().into_owned());
        image_command.push(image_path.to_string_lossy().into_owned());
        run_external(&image_command, context, "image")?;

        if inputs.profile == BuildProfile::Release {
            if let Ok(meta) = std::fs::metadata(&image_path) {
                context.emit(&format!("firmware image: {} bytes", meta.len()));
            }
        }

        let record = self.ledger.record(
            &inputs.project_dir,
            &inputs.environment,
            image_path.clone(),
            inputs.profile.dir_name(),
        )?;
        context.emit(&format!(
            "build complete ({} -> {})",
            record.fingerprint,
            image_path.display()
        ));

        Ok(BuildOutcome {
            elf_path,
            image_path,
            compiled_units,
            skipped_units,
            pipeline: report,
        })
    }

    fn compile(
        &self,
        pool: &CompilationPool,
        compile_timeout: Duration,
        inputs: &BuildInputs,
        plans: &[UnitPlan],
        token: &CancelToken,
    ) -> CoordinatorResult<Vec<JobOutcome>> {
        let jobs: Vec<CompileJob> = plans
            .iter()
            .enumerate()
            .map(|(index, plan)| CompileJob {
                job_id: format!("{}-unit{index}", inputs.request_id.as_str()),
                request_id: inputs.request_id.clone(),
                source: plan.source.clone(),
                object: plan.object.clone(),
                command: plan.command.clone(),
                context: inputs.context.clone(),
            })
            .collect();

        match inputs.parallelism {
            Parallelism::Serial => CompilationPool::run_serial(jobs, compile_timeout, token),
            Parallelism::Shared => {
                let ids: Vec<String> = jobs
                    .into_iter()
                    .map(|job| pool.submit(job))
                    .collect::<CoordinatorResult<_>>()?;
                pool.wait_for(&ids, token)
            }
            Parallelism::Dedicated(workers) => {
                // The dedicated pool must shut down on every exit path; its
                // Drop joins the workers even when waiting errors out.
                let dedicated = CompilationPool::new(workers, compile_timeout);
                let ids: Vec<String> = jobs
                    .into_iter()
                    .map(|job| dedicated.submit(job))
                    .collect::<CoordinatorResult<_>>()?;
                let result = dedicated.wait_for(&ids, token);
                if result.is_err() {
                    dedicated.cancel_all_pending(&inputs.request_id);
                }
                dedicated.shutdown();
                result
            }
        }
    }
}

fn install_failure(report: &PipelineReport) -> CoordinatorError {
    let root_cause = report
        .failed_tasks()
        .find(|task| {
            task.error
                .as_deref()
                .map(|error| !error.starts_with("depends on"))
                .unwrap_or(false)
        })
        .or_else(|| report.failed_tasks().next());
    match root_cause {
        Some(task) => CoordinatorError::PermanentRemote(format!(
            "package install failed: {}: {}",
            task.name,
            task.error.as_deref().unwrap_or("unknown error")
        )),
        None => {
            let cancelled = report
                .tasks
                .iter()
                .any(|task| task.stage == PackageStage::Cancelled);
            if cancelled {
                CoordinatorError::OperationCancelled
            } else {
                CoordinatorError::Internal("package install failed".to_owned())
            }
        }
    }
}

fn run_external(
    command: &[String],
    context: &BuildContext,
    phase: &str,
) -> CoordinatorResult<()> {
    context.emit_verbose(&format!("{phase}: {}", command.join(" ")));
    let output = fwbuild_compile::run_child_captured(command, LINK_TIMEOUT)?;
    if output.exit_code != Some(0) {
        return Err(CoordinatorError::ChildNonzero {
            status: output.exit_code.unwrap_or(-1),
            stderr: output.stderr,
        });
    }
    Ok(())
}
