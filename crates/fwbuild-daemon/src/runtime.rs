use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use fwbuild_config::CoordinatorConfig;
use fwbuild_core::{CoordinatorError, CoordinatorResult};

use crate::server;
use crate::state::CoordinatorState;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Publish the bound port through a temp file + rename so a concurrently
/// bootstrapping client never reads a half-written file.
fn write_port_file(config: &CoordinatorConfig, port: u16) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.state_dir)?;
    let temp = config.state_dir.join("daemon.port.tmp");
    std::fs::write(&temp, format!("{port}\n"))?;
    std::fs::rename(&temp, config.port_file())?;
    Ok(())
}

pub fn append_spawn_log(config: &CoordinatorConfig, line: &str) {
    if std::fs::create_dir_all(&config.state_dir).is_err() {
        return;
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.spawn_log_file())
    {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let _ = writeln!(file, "[{stamp}] {line}");
    }
}

/// Dispatcher idle tick: sweep dead-owner locks, stale cancel signals, and
/// aged-out request records; evict the whole process past the idle window.
async fn housekeeping_loop(state: Arc<CoordinatorState>) {
    let mut shutdown_rx = state.shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {}
            _ = shutdown_rx.changed() => return,
        }

        let sweep_state = Arc::clone(&state);
        let _ = tokio::task::spawn_blocking(move || {
            let cancels = Arc::clone(&sweep_state.cancels);
            let swept = sweep_state
                .locks
                .clear_stale(|pid| cancels.pid_alive(pid));
            for name in &swept {
                tracing::info!(lock = %name, "released stale lock");
            }

            // Cancel running requests whose owning client died.
            for record in sweep_state.requests.list() {
                if !record.status.is_terminal()
                    && !sweep_state.cancels.pid_alive(record.client.pid)
                {
                    tracing::info!(
                        request = %record.id,
                        pid = record.client.pid,
                        "owning client died; delivering cancel"
                    );
                    let _ = sweep_state.cancels.deliver(&record.id);
                    sweep_state.devices.release_for_pid(record.client.pid);
                }
            }

            sweep_state
                .cancels
                .sweep_stale_signals(&sweep_state.requests.live_ids());
            for id in sweep_state.requests.prune_terminal() {
                sweep_state.events.remove(&id);
            }
        })
        .await;

        if state.is_evictable() {
            tracing::info!(
                idle_secs = state.idle_for().as_secs(),
                "idle window elapsed with no requests and no locks; evicting"
            );
            state.begin_shutdown();
            return;
        }
    }
}

/// Run the coordinator until shutdown: bind, publish the port file, serve,
/// then release every resource and remove the port file.
pub async fn run_daemon(config: CoordinatorConfig) -> CoordinatorResult<u16> {
    run_daemon_with_state(CoordinatorState::new(config)).await
}

pub async fn run_daemon_with_state(state: Arc<CoordinatorState>) -> CoordinatorResult<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", state.config.port))
        .await
        .map_err(|error| {
            CoordinatorError::Io(format!(
                "bind 127.0.0.1:{}: {error}",
                state.config.port
            ))
        })?;
    let port = listener
        .local_addr()
        .map_err(|error| CoordinatorError::Io(error.to_string()))?
        .port();

    write_port_file(&state.config, port)?;
    append_spawn_log(
        &state.config,
        &format!("daemon listening on {port} (pid {})", std::process::id()),
    );
    tracing::info!(port, pid = std::process::id(), "coordinator ready");

    let housekeeping = tokio::spawn(housekeeping_loop(Arc::clone(&state)));

    let mut shutdown_rx = state.shutdown_rx.clone();
    let app = server::router(Arc::clone(&state));
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await;

    housekeeping.abort();
    let _ = std::fs::remove_file(state.config.port_file());
    state.compile_pool.shutdown();
    append_spawn_log(&state.config, "daemon exited");
    tracing::info!("coordinator shut down");

    serve_result.map_err(|error| CoordinatorError::Io(error.to_string()))?;
    Ok(port)
}
