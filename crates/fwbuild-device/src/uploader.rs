use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fwbuild_core::{BuildContext, CoordinatorError, CoordinatorResult};
use rand::Rng;

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CRASH_LOOP_MAX_ATTEMPTS: u32 = 20;
const CRASH_LOOP_GAP_MIN_MS: u64 = 100;
const CRASH_LOOP_GAP_MAX_MS: u64 = 1_500;

/// Dual-budget watchdog for uploader children: a total wall-clock budget and
/// an inactivity budget (no output for N seconds forces termination, since
/// the child can be stuck in kernel I/O past any cooperative timeout).
#[derive(Debug, Clone, Copy)]
pub struct UploadWatchdog {
    pub total: Duration,
    pub inactivity: Duration,
}

/// Run the upload tool under the watchdog, streaming its output into the
/// request's context.
pub fn run_upload_watchdog(
    argv: &[String],
    watchdog: UploadWatchdog,
    context: &BuildContext,
) -> CoordinatorResult<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CoordinatorError::Configuration("empty upload command".to_owned()))?;
    context.emit(&format!("uploading with {program}"));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| CoordinatorError::Io(format!("spawn {program}: {error}")))?;

    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stdout = child.stdout.take().map(|pipe| {
        stream_lines(pipe, context.clone(), Arc::clone(&last_activity))
    });
    let stderr_buffer = Arc::new(Mutex::new(String::new()));
    let stderr = child.stderr.take().map(|pipe| {
        collect_stderr(
            pipe,
            context.clone(),
            Arc::clone(&last_activity),
            Arc::clone(&stderr_buffer),
        )
    });

    let started = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {}
            Err(error) => {
                return Err(CoordinatorError::Io(format!("wait for {program}: {error}")))
            }
        }

        let idle = last_activity
            .lock()
            .expect("watchdog activity lock poisoned")
            .elapsed();
        if idle >= watchdog.inactivity {
            force_terminate(&mut child);
            join_streams(stdout, stderr);
            return Err(CoordinatorError::ChildInactivity {
                secs: watchdog.inactivity.as_secs(),
            });
        }
        if started.elapsed() >= watchdog.total {
            force_terminate(&mut child);
            join_streams(stdout, stderr);
            return Err(CoordinatorError::ChildNonzero {
                status: -1,
                stderr: format!(
                    "upload exceeded total budget of {}s",
                    watchdog.total.as_secs()
                ),
            });
        }
        std::thread::sleep(WATCH_POLL_INTERVAL);
    };

    join_streams(stdout, stderr);
    if exit_code != Some(0) {
        let stderr_text = stderr_buffer
            .lock()
            .expect("watchdog stderr lock poisoned")
            .clone();
        return Err(CoordinatorError::ChildNonzero {
            status: exit_code.unwrap_or(-1),
            stderr: stderr_text,
        });
    }
    Ok(())
}

/// Forced termination goes straight to the OS primitive; the cooperative
/// subprocess kill is unreliable for children blocked in kernel I/O.
fn force_terminate(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn stream_lines(
    pipe: impl Read + Send + 'static,
    context: BuildContext,
    last_activity: Arc<Mutex<Instant>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            *last_activity
                .lock()
                .expect("watchdog activity lock poisoned") = Instant::now();
            context.emit(&line);
        }
    })
}

fn collect_stderr(
    pipe: impl Read + Send + 'static,
    context: BuildContext,
    last_activity: Arc<Mutex<Instant>>,
    buffer: Arc<Mutex<String>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            *last_activity
                .lock()
                .expect("watchdog activity lock poisoned") = Instant::now();
            context.emit(&line);
            let mut buffer = buffer.lock().expect("watchdog stderr lock poisoned");
            buffer.push_str(&line);
            buffer.push('\n');
        }
    })
}

fn join_streams(
    stdout: Option<std::thread::JoinHandle<()>>,
    stderr: Option<std::thread::JoinHandle<()>>,
) {
    if let Some(handle) = stdout {
        let _ = handle.join();
    }
    if let Some(handle) = stderr {
        let _ = handle.join();
    }
}

/// Recovery loop for devices stuck in a rapid reboot cycle: retry the
/// connection step with randomized short gaps, reporting every attempt, and
/// exit as soon as one attempt connects.
pub fn recover_crash_loop<T>(
    context: &BuildContext,
    mut attempt: impl FnMut(u32) -> CoordinatorResult<T>,
) -> CoordinatorResult<T> {
    let mut last_error = CoordinatorError::Internal("no connection attempts made".to_owned());
    for attempt_number in 1..=CRASH_LOOP_MAX_ATTEMPTS {
        match attempt(attempt_number) {
            Ok(value) => {
                if attempt_number > 1 {
                    context.emit(&format!("connected on attempt {attempt_number}"));
                }
                return Ok(value);
            }
            Err(error @ CoordinatorError::OperationCancelled) => return Err(error),
            Err(error) => {
                context.emit(&format!(
                    "connect attempt {attempt_number}/{CRASH_LOOP_MAX_ATTEMPTS} failed: {error}"
                ));
                last_error = error;
                if attempt_number < CRASH_LOOP_MAX_ATTEMPTS {
                    let gap_ms = rand::thread_rng()
                        .gen_range(CRASH_LOOP_GAP_MIN_MS..=CRASH_LOOP_GAP_MAX_MS);
                    std::thread::sleep(Duration::from_millis(gap_ms));
                }
            }
        }
    }
    Err(last_error)
}
