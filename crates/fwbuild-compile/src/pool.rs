use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use fwbuild_core::{CoordinatorError, CoordinatorResult, RequestId};
use fwbuild_coordination::CancelToken;

use crate::job::{CompileJob, JobOutcome, JobState};
use crate::spawn::run_child_captured;

const WAIT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(500);

/// How a build request maps onto compile workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// `jobs = 1`: compile inline on the caller's thread. An explicit
    /// debugging mode, not a fallback.
    Serial,
    /// Default: the process-wide pool sized to the host CPU count.
    Shared,
    /// `jobs = N`: a dedicated pool scoped to the request.
    Dedicated(usize),
}

struct JobRecord {
    job: CompileJob,
    state: JobState,
    outcome: Option<JobOutcome>,
}

struct PoolState {
    jobs: HashMap<String, JobRecord>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    completed: Condvar,
    queue_tx: Mutex<Option<Sender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    compile_timeout: Duration,
    invocations: AtomicU64,
}

/// A pool of OS worker threads compiling translation units for any number of
/// concurrent build requests. Submission is non-blocking; waiting is
/// checkpointed for cancellation.
#[derive(Clone)]
pub struct CompilationPool {
    inner: Arc<PoolInner>,
}

impl CompilationPool {
    pub fn new(worker_count: usize, compile_timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = unbounded::<String>();
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                jobs: HashMap::new(),
            }),
            completed: Condvar::new(),
            queue_tx: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(Vec::new()),
            compile_timeout,
            invocations: AtomicU64::new(0),
        });

        let mut workers = inner.workers.lock().expect("pool workers lock poisoned");
        for index in 0..worker_count.max(1) {
            let worker_rx: Receiver<String> = queue_rx.clone();
            let worker_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("compile-{index}"))
                .spawn(move || {
                    for job_id in worker_rx.iter() {
                        execute_job(&worker_inner, &job_id);
                    }
                })
                .expect("spawn compile worker");
            workers.push(handle);
        }
        drop(workers);

        Self { inner }
    }

    /// Pool sized to the host CPU count, the `jobs = default` mode.
    pub fn shared(compile_timeout: Duration) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4);
        Self::new(cpus, compile_timeout)
    }

    /// Non-blocking submit. An up-to-date object short-circuits the job to
    /// done without dispatching any child process.
    pub fn submit(&self, job: CompileJob) -> CoordinatorResult<String> {
        let job_id = job.job_id.clone();
        if job.is_up_to_date() {
            job.context
                .emit_verbose(&format!("skipping {} (up to date)", job.source.display()));
            let outcome = JobOutcome {
                job_id: job_id.clone(),
                state: JobState::Done,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
                skipped: true,
            };
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            state.jobs.insert(
                job_id.clone(),
                JobRecord {
                    job,
                    state: JobState::Done,
                    outcome: Some(outcome),
                },
            );
            drop(state);
            self.inner.completed.notify_all();
            return Ok(job_id);
        }

        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        state.jobs.insert(
            job_id.clone(),
            JobRecord {
                job,
                state: JobState::Pending,
                outcome: None,
            },
        );
        drop(state);

        let queue_tx = self.inner.queue_tx.lock().expect("pool queue lock poisoned");
        match queue_tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(job_id.clone());
                Ok(job_id)
            }
            None => Err(CoordinatorError::Internal(
                "compilation pool is shut down".to_owned(),
            )),
        }
    }

    /// Block until every listed job is terminal, polling the cancellation
    /// token at a bounded interval. The caller handles an observed
    /// cancellation (typically by calling `cancel_all_pending`).
    pub fn wait_for(
        &self,
        job_ids: &[String],
        token: &CancelToken,
    ) -> CoordinatorResult<Vec<JobOutcome>> {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        loop {
            let all_terminal = job_ids.iter().all(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|record| record.state.is_terminal())
                    .unwrap_or(true)
            });
            if all_terminal {
                let outcomes = job_ids
                    .iter()
                    .filter_map(|id| state.jobs.get(id))
                    .filter_map(|record| record.outcome.clone())
                    .collect();
                return Ok(outcomes);
            }

            let (next_state, _timeout) = self
                .inner
                .completed
                .wait_timeout(state, WAIT_CHECKPOINT_INTERVAL)
                .expect("pool state lock poisoned");
            state = next_state;

            if token.is_cancelled() {
                return Err(CoordinatorError::OperationCancelled);
            }
        }
    }

    /// Pending jobs for the request become cancelled and are never
    /// dispatched; jobs already running finish on their own.
    pub fn cancel_all_pending(&self, request_id: &RequestId) -> usize {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        let mut cancelled = 0;
        for record in state.jobs.values_mut() {
            if &record.job.request_id == request_id && record.state == JobState::Pending {
                record.state = JobState::Cancelled;
                record.outcome = Some(JobOutcome {
                    job_id: record.job.job_id.clone(),
                    state: JobState::Cancelled,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::ZERO,
                    skipped: false,
                });
                cancelled += 1;
            }
        }
        drop(state);
        if cancelled > 0 {
            self.inner.completed.notify_all();
        }
        cancelled
    }

    /// Drop every terminal record belonging to the request.
    pub fn clear_finished(&self, request_id: &RequestId) {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        state
            .jobs
            .retain(|_, record| &record.job.request_id != request_id || !record.state.is_terminal());
    }

    /// Number of real compiler child processes this pool has spawned.
    pub fn invocation_count(&self) -> u64 {
        self.inner.invocations.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let mut queue_tx = self.inner.queue_tx.lock().expect("pool queue lock poisoned");
        queue_tx.take();
        drop(queue_tx);
        let mut workers = self.inner.workers.lock().expect("pool workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Compile the jobs inline, one after another, for the serial mode.
    pub fn run_serial(
        jobs: Vec<CompileJob>,
        compile_timeout: Duration,
        token: &CancelToken,
    ) -> CoordinatorResult<Vec<JobOutcome>> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            token.checkpoint()?;
            if job.is_up_to_date() {
                outcomes.push(JobOutcome {
                    job_id: job.job_id,
                    state: JobState::Done,
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::ZERO,
                    skipped: true,
                });
                continue;
            }
            job.context
                .emit(&format!("compiling {}", job.source.display()));
            let started = Instant::now();
            let outcome = match run_child_captured(&job.command, compile_timeout) {
                Ok(output) => {
                    let state = if output.exit_code == Some(0) {
                        JobState::Done
                    } else {
                        JobState::Failed
                    };
                    JobOutcome {
                        job_id: job.job_id,
                        state,
                        exit_code: output.exit_code,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        duration: started.elapsed(),
                        skipped: false,
                    }
                }
                Err(error) => JobOutcome {
                    job_id: job.job_id,
                    state: JobState::Failed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: error.to_string(),
                    duration: started.elapsed(),
                    skipped: false,
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

impl Drop for CompilationPool {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        self.shutdown();
    }
}

fn execute_job(inner: &Arc<PoolInner>, job_id: &str) {
    let job = {
        let mut state = inner.state.lock().expect("pool state lock poisoned");
        let Some(record) = state.jobs.get_mut(job_id) else {
            return;
        };
        if record.state != JobState::Pending {
            return;
        }
        record.state = JobState::Running;
        record.job.clone()
    };

    // Reinstate the submitting request's output context before any output.
    job.context
        .emit(&format!("compiling {}", job.source.display()));

    inner.invocations.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let outcome = match run_child_captured(&job.command, inner.compile_timeout) {
        Ok(output) => {
            let job_state = if output.exit_code == Some(0) {
                JobState::Done
            } else {
                job.context.emit(&format!(
                    "failed {} (exit {:?})",
                    job.source.display(),
                    output.exit_code
                ));
                JobState::Failed
            };
            JobOutcome {
                job_id: job_id.to_owned(),
                state: job_state,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                duration: started.elapsed(),
                skipped: false,
            }
        }
        Err(error) => {
            job.context
                .emit(&format!("failed {}: {error}", job.source.display()));
            JobOutcome {
                job_id: job_id.to_owned(),
                state: JobState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: error.to_string(),
                duration: started.elapsed(),
                skipped: false,
            }
        }
    };

    let mut state = inner.state.lock().expect("pool state lock poisoned");
    if let Some(record) = state.jobs.get_mut(job_id) {
        record.state = outcome.state;
        record.outcome = Some(outcome);
    }
    drop(state);
    inner.completed.notify_all();
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use fwbuild_core::{BuildContext, CoordinatorError, RequestId, Verbosity};
    use fwbuild_coordination::{CancellationRegistry, CancelToken};
    use tempfile::TempDir;

    use crate::job::{CompileJob, JobState};

    use super::CompilationPool;

    fn token(root: &Path, request: &str) -> (Arc<CancellationRegistry>, CancelToken) {
        let registry = Arc::new(CancellationRegistry::new(root.join("state")));
        let token = registry.token(RequestId::new(request), std::process::id());
        (registry, token)
    }

    fn job(
        root: &Path,
        request: &str,
        index: usize,
        command: Vec<String>,
    ) -> CompileJob {
        let source = root.join(format!("unit{index}.cpp"));
        std::fs::write(&source, b"int f();").expect("write source");
        let (context, _buffer) =
            BuildContext::in_memory(RequestId::new(request), Verbosity::Quiet);
        CompileJob {
            job_id: format!("{request}-unit{index}"),
            request_id: RequestId::new(request),
            source,
            object: root.join(format!("unit{index}.o")),
            command,
            context,
        }
    }

    fn touch_command(object: &Path) -> Vec<String> {
        vec!["touch".to_owned(), object.to_string_lossy().into_owned()]
    }

    #[test]
    fn pool_compiles_submitted_units_and_reports_success() {
        let root = TempDir::new().expect("tempdir");
        let pool = CompilationPool::new(2, Duration::from_secs(10));
        let (_registry, cancel) = token(root.path(), "req-ok");

        let mut ids = Vec::new();
        for index in 0..4 {
            let job = job(root.path(), "req-ok", index, {
                let object = root.path().join(format!("unit{index}.o"));
                touch_command(&object)
            });
            ids.push(pool.submit(job).expect("submit"));
        }

        let outcomes = pool.wait_for(&ids, &cancel).expect("wait");
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|outcome| outcome.succeeded()));
        assert_eq!(pool.invocation_count(), 4);
        pool.shutdown();
    }

    #[test]
    fn up_to_date_objects_skip_without_any_invocation() {
        let root = TempDir::new().expect("tempdir");
        let pool = CompilationPool::new(2, Duration::from_secs(10));
        let (_registry, cancel) = token(root.path(), "req-skip");

        // `false` as the compiler would fail the build if it ever ran.
        let unit = job(root.path(), "req-skip", 0, vec!["false".to_owned()]);
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&unit.object, b"obj").expect("write object");

        let id = pool.submit(unit).expect("submit");
        let outcomes = pool.wait_for(&[id], &cancel).expect("wait");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].skipped);
        assert_eq!(outcomes[0].state, JobState::Done);
        assert_eq!(pool.invocation_count(), 0);
        pool.shutdown();
    }

    #[test]
    fn failed_compiles_surface_captured_stderr() {
        let root = TempDir::new().expect("tempdir");
        let pool = CompilationPool::new(1, Duration::from_secs(10));
        let (_registry, cancel) = token(root.path(), "req-fail");

        let unit = job(
            root.path(),
            "req-fail",
            0,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "echo 'unit0.cpp:1: error: boom' >&2; exit 1".to_owned(),
            ],
        );
        let id = pool.submit(unit).expect("submit");
        let outcomes = pool.wait_for(&[id], &cancel).expect("wait");
        assert_eq!(outcomes[0].state, JobState::Failed);
        assert_eq!(outcomes[0].exit_code, Some(1));
        assert!(outcomes[0].stderr.contains("boom"));
        pool.shutdown();
    }

    #[test]
    fn cancel_all_pending_spares_other_requests() {
        let root = TempDir::new().expect("tempdir");
        // One worker so later submissions stay pending while the first runs.
        let pool = CompilationPool::new(1, Duration::from_secs(10));
        let (registry, cancel) = token(root.path(), "req-cancel");

        let slow = job(
            root.path(),
            "req-cancel",
            0,
            vec!["sleep".to_owned(), "2".to_owned()],
        );
        let pending = job(root.path(), "req-cancel", 1, vec!["true".to_owned()]);
        let other = job(root.path(), "req-other", 2, vec!["true".to_owned()]);

        let slow_id = pool.submit(slow).expect("submit slow");
        let pending_id = pool.submit(pending).expect("submit pending");
        let other_id = pool.submit(other).expect("submit other");

        registry
            .deliver(&RequestId::new("req-cancel"))
            .expect("deliver cancel");
        let wait_error = pool
            .wait_for(&[slow_id.clone(), pending_id.clone()], &cancel)
            .expect_err("cancelled wait");
        assert!(matches!(wait_error, CoordinatorError::OperationCancelled));

        let cancelled = pool.cancel_all_pending(&RequestId::new("req-cancel"));
        assert_eq!(cancelled, 1);

        // The other request still completes.
        let (_other_registry, other_token) = token(root.path(), "req-other");
        let outcomes = pool.wait_for(&[other_id], &other_token).expect("other wait");
        assert!(outcomes[0].succeeded());
        pool.shutdown();
    }

    #[test]
    fn concurrent_requests_keep_their_own_output_contexts() {
        let root = TempDir::new().expect("tempdir");
        let pool = CompilationPool::new(2, Duration::from_secs(10));

        let (context_a, buffer_a) =
            BuildContext::in_memory(RequestId::new("req-a"), Verbosity::Normal);
        let (context_b, buffer_b) =
            BuildContext::in_memory(RequestId::new("req-b"), Verbosity::Normal);

        let source_a = root.path().join("alpha.cpp");
        let source_b = root.path().join("beta.cpp");
        std::fs::write(&source_a, b"int a();").expect("write a");
        std::fs::write(&source_b, b"int b();").expect("write b");

        let job_a = CompileJob {
            job_id: "req-a-unit0".to_owned(),
            request_id: RequestId::new("req-a"),
            source: source_a,
            object: root.path().join("alpha.o"),
            command: vec!["true".to_owned()],
            context: context_a,
        };
        let job_b = CompileJob {
            job_id: "req-b-unit0".to_owned(),
            request_id: RequestId::new("req-b"),
            source: source_b,
            object: root.path().join("beta.o"),
            command: vec!["true".to_owned()],
            context: context_b,
        };

        let id_a = pool.submit(job_a).expect("submit a");
        let id_b = pool.submit(job_b).expect("submit b");
        let (_ra, token_a) = token(root.path(), "req-a");
        pool.wait_for(&[id_a, id_b], &token_a).expect("wait");

        let written_a =
            String::from_utf8(buffer_a.lock().expect("buffer a").clone()).expect("utf8");
        let written_b =
            String::from_utf8(buffer_b.lock().expect("buffer b").clone()).expect("utf8");
        assert!(written_a.contains("alpha.cpp"));
        assert!(!written_a.contains("beta.cpp"));
        assert!(written_b.contains("beta.cpp"));
        assert!(!written_b.contains("alpha.cpp"));
        pool.shutdown();
    }

    #[test]
    fn serial_mode_compiles_inline_without_a_pool() {
        let root = TempDir::new().expect("tempdir");
        let (_registry, cancel) = token(root.path(), "req-serial");
        let object = root.path().join("unit0.o");
        let jobs = vec![job(root.path(), "req-serial", 0, touch_command(&object))];
        let outcomes =
            CompilationPool::run_serial(jobs, Duration::from_secs(10), &cancel).expect("serial");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded());
        assert!(object.exists());
    }
}
