use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use fwbuild_build::{BuildInputs, BuildProfile};
use fwbuild_compile::Parallelism;
use fwbuild_core::{
    BuildContext, CancelPolicy, CoordinatorError, CoordinatorResult, RequestId, RequestKind,
    RequestRecord, RequestStatus, Verbosity,
};
use fwbuild_coordination::{CancelToken, LockBundle};
use fwbuild_device::{recover_crash_loop, run_upload_watchdog, UploadWatchdog};
use fwbuild_pipeline::PipelineOptions;

use crate::events::{RequestEvent, RequestEventBus};
use crate::state::CoordinatorState;

const MANIFEST_FILE_NAME: &str = "fwbuild.json";

/// Line sink that tees request output to the on-disk log file and the event
/// bus for WebSocket streaming.
struct BusTeeSink {
    request_id: RequestId,
    bus: Arc<RequestEventBus>,
    file: Option<std::fs::File>,
    pending: Vec<u8>,
}

impl Write for BusTeeSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &mut self.file {
            let _ = file.write_all(data);
        }
        self.pending.extend_from_slice(data);
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.bus
                .publish(self.request_id.clone(), RequestEvent::Log(text));
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// Accept a request: record it and run its lifecycle on a worker task
/// distinct from the endpoint's network loop.
pub fn submit(state: &Arc<CoordinatorState>, record: RequestRecord) -> RequestId {
    let id = record.id.clone();
    state.requests.insert(record.clone());
    state.touch_activity();
    let task_state = Arc::clone(state);
    tokio::spawn(async move {
        run_request(task_state, record).await;
    });
    id
}

fn make_context(state: &CoordinatorState, record: &RequestRecord) -> BuildContext {
    let verbosity = match &record.kind {
        RequestKind::Build(params) if params.verbose => Verbosity::Verbose,
        RequestKind::Deploy(params) if params.verbose => Verbosity::Verbose,
        RequestKind::InstallDeps(params) if params.verbose => Verbosity::Verbose,
        _ => Verbosity::Normal,
    };
    let log_path = state.config.request_log_file(record.id.as_str());
    let file = log_path
        .parent()
        .and_then(|parent| std::fs::create_dir_all(parent).ok())
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .ok()
        });
    BuildContext::new(
        record.id.clone(),
        verbosity,
        Box::new(BusTeeSink {
            request_id: record.id.clone(),
            bus: Arc::clone(&state.events),
            file,
            pending: Vec::new(),
        }),
    )
}

fn publish_status(
    state: &CoordinatorState,
    request_id: &RequestId,
    status: RequestStatus,
    detail: Option<String>,
) {
    state.requests.set_status(request_id, status, detail.clone());
    state
        .events
        .publish(request_id.clone(), RequestEvent::Status { status, detail });
}

async fn run_request(state: Arc<CoordinatorState>, record: RequestRecord) {
    let request_id = record.id.clone();
    let owner_pid = record.client.pid;
    let policy = record.kind.cancel_policy();
    let token = state.cancels.token(request_id.clone(), owner_pid);
    let context = make_context(&state, &record);

    publish_status(&state, &request_id, RequestStatus::Running, None);

    // Checkpoint immediately after acceptance.
    if policy == CancelPolicy::Cancellable && token.is_cancelled() {
        finish(&state, &request_id, Err(CoordinatorError::OperationCancelled));
        return;
    }

    let lock_names = record.kind.required_locks();
    let cancelled_probe = {
        let token = token.clone();
        move || policy == CancelPolicy::Cancellable && token.is_cancelled()
    };
    let bundle =
        LockBundle::acquire_waiting(&state.locks, &lock_names, owner_pid, cancelled_probe).await;

    let result = match bundle {
        Err(error) => Err(error),
        Ok(bundle) => {
            let result = context
                .scope(route(&state, &record, &context, &token))
                .await;
            // Locks release before the terminal status is published, so a
            // client resubmitting on failure is never refused by its own
            // stale lease.
            bundle.release();
            result
        }
    };

    finish(&state, &request_id, result);
    state.cancels.clear(&request_id);
    state.compile_pool.clear_finished(&request_id);
    state.touch_activity();
}

/// The single place a cancellation condition becomes a `cancelled` status.
fn finish(
    state: &CoordinatorState,
    request_id: &RequestId,
    result: CoordinatorResult<()>,
) {
    match result {
        Ok(()) => publish_status(state, request_id, RequestStatus::Succeeded, None),
        Err(error) if error.is_cancellation() => {
            state.compile_pool.cancel_all_pending(request_id);
            publish_status(state, request_id, RequestStatus::Cancelled, None);
        }
        Err(error) => {
            tracing::warn!(request = %request_id, error = %error, "request failed");
            publish_status(
                state,
                request_id,
                RequestStatus::Failed,
                Some(error.to_string()),
            );
        }
    }
}

async fn route(
    state: &Arc<CoordinatorState>,
    record: &RequestRecord,
    context: &BuildContext,
    token: &CancelToken,
) -> CoordinatorResult<()> {
    match &record.kind {
        RequestKind::Build(params) => {
            let inputs = build_inputs(
                state,
                record,
                &params.project_dir,
                &params.environment,
                params.profile.as_deref(),
                params.jobs,
                context.clone(),
                false,
            )?;
            let run_state = Arc::clone(state);
            let run_token = token.clone();
            let progress = fwbuild_pipeline::progress::stderr_sink(context.clone());
            run_blocking(move || {
                run_state
                    .orchestrator
                    .run(
                        &run_state.compile_pool,
                        Duration::from_secs(run_state.config.compile_timeout_secs),
                        &inputs,
                        progress,
                        &run_token,
                    )
                    .map(|_| ())
            })
            .await
        }
        RequestKind::InstallDeps(params) => {
            let inputs = build_inputs(
                state,
                record,
                &params.project_dir,
                &params.environment,
                None,
                None,
                context.clone(),
                true,
            )?;
            let run_state = Arc::clone(state);
            let run_token = token.clone();
            let progress = fwbuild_pipeline::progress::stderr_sink(context.clone());
            let report = run_blocking(move || {
                run_state
                    .orchestrator
                    .install_dependencies(&inputs, progress, &run_token)
            })
            .await?;
            if !report.success {
                let failed = report
                    .failed_tasks()
                    .next()
                    .map(|task| {
                        format!(
                            "{}: {}",
                            task.name,
                            task.error.as_deref().unwrap_or("unknown error")
                        )
                    })
                    .unwrap_or_else(|| "package install failed".to_owned());
                return Err(CoordinatorError::PermanentRemote(failed));
            }
            // Continue policy: the cache is populated, but an observed
            // cancellation still surfaces as the terminal status.
            if token.is_cancelled() {
                return Err(CoordinatorError::OperationCancelled);
            }
            Ok(())
        }
        RequestKind::Deploy(params) => {
            let inputs = build_inputs(
                state,
                record,
                &params.project_dir,
                &params.environment,
                None,
                None,
                context.clone(),
                false,
            )?;
            let run_state = Arc::clone(state);
            let run_token = token.clone();
            let run_context = context.clone();
            let port = params.port.clone();
            let use_cached = params.use_cached_firmware;
            let project_dir = params.project_dir.clone();
            let environment = params.environment.clone();
            run_blocking(move || {
                let image = match run_state
                    .ledger
                    .lookup(&project_dir, &environment)
                    .filter(|_| use_cached)
                {
                    Some(record) => {
                        run_context.emit(&format!(
                            "using cached firmware {}",
                            record.image_path.display()
                        ));
                        record.image_path
                    }
                    None => {
                        let progress = fwbuild_pipeline::progress::stderr_sink(run_context.clone());
                        run_state
                            .orchestrator
                            .run(
                                &run_state.compile_pool,
                                Duration::from_secs(run_state.config.compile_timeout_secs),
                                &inputs,
                                progress,
                                &run_token,
                            )?
                            .image_path
                    }
                };

                run_token.checkpoint()?;
                let env = inputs.manifest.environment(&environment)?;
                let backend = run_state.platforms.get(&env.platform)?;
                let upload_command =
                    backend.upload_command(env, &run_state.cache, &port, &image)?;
                let watchdog = UploadWatchdog {
                    total: Duration::from_secs(run_state.config.upload_total_timeout_secs),
                    inactivity: Duration::from_secs(
                        run_state.config.upload_inactivity_timeout_secs,
                    ),
                };
                run_state.devices.with_deploy_preemption(&port, || {
                    recover_crash_loop(&run_context, |_| {
                        run_token.checkpoint()?;
                        run_upload_watchdog(&upload_command, watchdog, &run_context)
                    })
                })
            })
            .await
        }
        RequestKind::Monitor(params) => {
            let run_state = Arc::clone(state);
            let port = params.port.clone();
            let baud = params.baud;
            run_blocking(move || run_state.devices.attach_monitor(&port, baud).map(|_| ())).await
        }
        RequestKind::Status => Ok(()),
        RequestKind::Shutdown => {
            context.emit("shutdown requested");
            state.begin_shutdown();
            Ok(())
        }
    }
}

fn build_inputs(
    state: &CoordinatorState,
    record: &RequestRecord,
    project_dir: &std::path::Path,
    environment: &str,
    profile: Option<&str>,
    jobs: Option<usize>,
    context: BuildContext,
    continue_on_cancel: bool,
) -> CoordinatorResult<BuildInputs> {
    let manifest =
        fwbuild_build::ProjectManifest::from_json_file(&project_dir.join(MANIFEST_FILE_NAME))?;
    let parallelism = match jobs {
        None => Parallelism::Shared,
        Some(1) => Parallelism::Serial,
        Some(count) => Parallelism::Dedicated(count),
    };
    Ok(BuildInputs {
        request_id: record.id.clone(),
        project_dir: project_dir.to_path_buf(),
        manifest,
        environment: environment.to_owned(),
        profile: BuildProfile::from_name(profile)?,
        parallelism,
        context,
        pipeline_options: PipelineOptions {
            tuning: state.config.pipeline.clone(),
            continue_on_cancel,
        },
    })
}

async fn run_blocking<T, F>(work: F) -> CoordinatorResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoordinatorResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| CoordinatorError::Internal(format!("blocking task failed: {error}")))?
}
