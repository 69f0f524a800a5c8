use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use fwbuild_core::{CoordinatorError, CoordinatorResult};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn a child with the hygiene every external tool invocation gets:
/// stdin redirected to a null source so the child cannot steal terminal
/// keystrokes, and no console window on hosts that would otherwise open one.
pub fn hygienic_command(argv: &[String]) -> CoordinatorResult<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CoordinatorError::Configuration("empty command line".to_owned()))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    Ok(command)
}

/// Run a child to completion with captured output and a hard wall-clock
/// budget. Output pipes are drained on side threads so a chatty child can
/// never deadlock against a full pipe.
pub fn run_child_captured(argv: &[String], timeout: Duration) -> CoordinatorResult<CapturedOutput> {
    let mut command = hygienic_command(argv)?;
    let mut child = command
        .spawn()
        .map_err(|error| CoordinatorError::Io(format!("spawn {}: {error}", argv[0])))?;

    let stdout_handle = child.stdout.take().map(drain_pipe);
    let stderr_handle = child.stderr.take().map(drain_pipe);

    let deadline = Instant::now() + timeout;
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.map(join_drain);
                    let _ = stderr_handle.map(join_drain);
                    return Err(CoordinatorError::ChildNonzero {
                        status: -1,
                        stderr: format!(
                            "{} timed out after {}s",
                            argv[0],
                            timeout.as_secs()
                        ),
                    });
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(error) => {
                return Err(CoordinatorError::Io(format!(
                    "wait for {}: {error}",
                    argv[0]
                )))
            }
        }
    };

    let stdout = stdout_handle.map(join_drain).unwrap_or_default();
    let stderr = stderr_handle.map(join_drain).unwrap_or_default();
    Ok(CapturedOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

fn join_drain(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
