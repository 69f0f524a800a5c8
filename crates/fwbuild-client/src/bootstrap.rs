use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use fwbuild_config::CoordinatorConfig;
use fwbuild_core::{CoordinatorError, CoordinatorResult};

use crate::http::wait_until;

const SPAWN_RETRY_DELAYS: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_millis(500),
    Duration::from_secs(2),
];
const WAITER_TIMEOUT: Duration = Duration::from_secs(12);
const STALE_SPAWN_LOCK_AGE: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Command line that starts the coordinator, e.g. the current executable
    /// plus a `daemon` argument.
    pub daemon_argv: Vec<String>,
}

impl BootstrapOptions {
    pub fn from_current_exe() -> CoordinatorResult<Self> {
        let exe = std::env::current_exe()
            .map_err(|error| CoordinatorError::Io(error.to_string()))?;
        Ok(Self {
            daemon_argv: vec![exe.to_string_lossy().into_owned(), "daemon".to_owned()],
        })
    }
}

/// A live coordinator answering on `port`?
pub fn health_probe(port: u16) -> bool {
    let Ok(client) = reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
    else {
        return false;
    };
    client
        .get(format!("http://127.0.0.1:{port}/api/daemon/status"))
        .send()
        .map(|response| response.status().is_success())
        .unwrap_or(false)
}

fn read_port_file(config: &CoordinatorConfig) -> Option<u16> {
    let raw = std::fs::read_to_string(config.port_file()).ok()?;
    raw.trim().parse().ok()
}

/// A probed port from the port file, if the coordinator behind it is alive.
fn probe_published_port(config: &CoordinatorConfig) -> Option<u16> {
    let port = read_port_file(config)?;
    health_probe(port).then_some(port)
}

fn spawn_lock_is_stale(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= STALE_SPAWN_LOCK_AGE)
        .unwrap_or(false)
}

/// Try to become the spawner under the atomic singleton lock. Whoever
/// creates the lock file first wins; everyone else waits.
fn try_claim_spawn_lock(config: &CoordinatorConfig) -> bool {
    let lock_path = config.singleton_lock_file();
    if spawn_lock_is_stale(&lock_path) {
        let _ = std::fs::remove_file(&lock_path);
    }
    if std::fs::create_dir_all(&config.state_dir).is_err() {
        return false;
    }
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
        .map(|mut file| {
            use std::io::Write;
            let _ = writeln!(file, "{}", std::process::id());
            true
        })
        .unwrap_or(false)
}

fn release_spawn_lock(config: &CoordinatorConfig) {
    let _ = std::fs::remove_file(config.singleton_lock_file());
}

fn append_spawn_log(config: &CoordinatorConfig, line: &str) {
    if std::fs::create_dir_all(&config.state_dir).is_err() {
        return;
    }
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.spawn_log_file())
    {
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let _ = writeln!(file, "[{stamp}] {line}");
    }
}

fn spawn_detached(config: &CoordinatorConfig, options: &BootstrapOptions) -> CoordinatorResult<u32> {
    let (program, args) = options
        .daemon_argv
        .split_first()
        .ok_or_else(|| CoordinatorError::Configuration("empty daemon command".to_owned()))?;
    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .current_dir(&config.state_dir);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session: the daemon must not die with the client's terminal.
        unsafe {
            command.pre_exec(|| {
                unsafe {
                    libc::setsid();
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        command.creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS);
    }
    let child = command
        .spawn()
        .map_err(|error| CoordinatorError::Io(format!("spawn coordinator: {error}")))?;
    Ok(child.id())
}

/// Reach *the* coordinator: probe the published port, otherwise race for the
/// spawn lock and wait. Any live coordinator that answers the probe is
/// accepted, not just one this process spawned.
pub fn ensure_coordinator(
    config: &CoordinatorConfig,
    options: &BootstrapOptions,
) -> CoordinatorResult<u16> {
    if let Some(port) = probe_published_port(config) {
        return Ok(port);
    }

    let deadline = Instant::now() + WAITER_TIMEOUT;
    if try_claim_spawn_lock(config) {
        let result = spawn_and_wait(config, options, deadline);
        release_spawn_lock(config);
        return result;
    }

    // Another client is spawning; wait for whichever coordinator appears.
    if wait_until(deadline, || probe_published_port(config).is_some()) {
        probe_published_port(config)
            .ok_or_else(|| CoordinatorError::Internal("coordinator vanished after probe".to_owned()))
    } else {
        Err(CoordinatorError::Io(
            "timed out waiting for the coordinator to start".to_owned(),
        ))
    }
}

fn spawn_and_wait(
    config: &CoordinatorConfig,
    options: &BootstrapOptions,
    deadline: Instant,
) -> CoordinatorResult<u16> {
    let mut last_error = None;
    for (attempt, delay) in SPAWN_RETRY_DELAYS.iter().enumerate() {
        if !delay.is_zero() {
            std::thread::sleep(*delay);
        }
        // A racing client's coordinator is just as good as ours.
        if let Some(port) = probe_published_port(config) {
            return Ok(port);
        }

        match spawn_detached(config, options) {
            Ok(pid) => {
                append_spawn_log(
                    config,
                    &format!("spawn attempt {} started pid {pid}", attempt + 1),
                );
            }
            Err(error) => {
                append_spawn_log(
                    config,
                    &format!("spawn attempt {} failed: {error}", attempt + 1),
                );
                last_error = Some(error);
                continue;
            }
        }

        if wait_until(deadline.min(Instant::now() + Duration::from_secs(4)), || {
            probe_published_port(config).is_some()
        }) {
            if let Some(port) = probe_published_port(config) {
                return Ok(port);
            }
        }
    }

    if wait_until(deadline, || probe_published_port(config).is_some()) {
        if let Some(port) = probe_published_port(config) {
            return Ok(port);
        }
    }
    Err(last_error.unwrap_or_else(|| {
        CoordinatorError::Io("coordinator did not come up within the bootstrap window".to_owned())
    }))
}
