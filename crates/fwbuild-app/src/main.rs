use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use fwbuild_client::{BootstrapOptions, CoordinatorClient, Interrupt};
use fwbuild_config::CoordinatorConfig;
use fwbuild_core::{CoordinatorResult, RequestStatus};
use fwbuild_protocol::{
    SubmitBuildBody, SubmitDeployBody, SubmitInstallDepsBody, SubmitMonitorBody,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fwbuild", version, about = "Embedded-firmware build coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator process in the foreground.
    Daemon,
    /// Compile an environment into a firmware image.
    Build {
        #[arg(long, short = 'e')]
        env: String,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
        #[arg(long, short = 'v')]
        verbose: bool,
        #[arg(default_value = ".")]
        project_dir: PathBuf,
    },
    /// Build (or reuse a cached image) and upload to a device.
    Deploy {
        #[arg(long, short = 'e')]
        env: String,
        #[arg(long, short = 'p')]
        port: String,
        #[arg(long)]
        cached: bool,
        #[arg(long, short = 'v')]
        verbose: bool,
        #[arg(default_value = ".")]
        project_dir: PathBuf,
    },
    /// Attach a serial monitor to a device.
    Monitor {
        #[arg(long, short = 'p')]
        port: String,
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
    },
    /// Pre-install an environment's packages into the shared cache.
    InstallDeps {
        #[arg(long, short = 'e')]
        env: String,
        #[arg(long, short = 'v')]
        verbose: bool,
        #[arg(default_value = ".")]
        project_dir: PathBuf,
    },
    /// List serial devices known to the coordinator.
    Devices,
    /// Show coordinator status.
    Status,
    /// Ask the coordinator to shut down.
    Shutdown,
    /// Delete installed packages from the cache.
    Purge {
        #[arg(long)]
        name: Option<String>,
    },
}

#[cfg(unix)]
fn install_interrupt_handler(interrupt: Interrupt) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_signal: libc::c_int) {
        SIGINT_SEEN.store(true, Ordering::Relaxed);
    }

    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as usize as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        if SIGINT_SEEN.load(Ordering::Relaxed) {
            interrupt.trigger();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    });
}

#[cfg(not(unix))]
fn install_interrupt_handler(_interrupt: Interrupt) {}

fn init_client_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn init_daemon_tracing(config: &CoordinatorConfig) {
    let _ = std::fs::create_dir_all(&config.state_dir);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.daemon_log_file());
    match log {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .try_init();
        }
        Err(_) => init_client_tracing(),
    }
}

fn connect(config: &CoordinatorConfig, interrupt: &Interrupt) -> CoordinatorResult<CoordinatorClient> {
    let options = BootstrapOptions::from_current_exe()?;
    CoordinatorClient::connect(config, &options, interrupt.clone())
}

fn client_identity() -> (u32, PathBuf) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    (std::process::id(), cwd)
}

fn stream_to_exit_code(
    client: &CoordinatorClient,
    response: fwbuild_protocol::SubmitResponse,
) -> CoordinatorResult<ExitCode> {
    let status = client.stream_request(&response.request_id, |line| println!("{line}"))?;
    Ok(exit_code_for(status))
}

fn exit_code_for(status: RequestStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}

fn run(cli: Cli) -> CoordinatorResult<ExitCode> {
    let config = CoordinatorConfig::from_env()
        .map_err(|error| fwbuild_core::CoordinatorError::Configuration(error.to_string()))?;

    if let Command::Daemon = cli.command {
        init_daemon_tracing(&config);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|error| fwbuild_core::CoordinatorError::Internal(error.to_string()))?;
        runtime.block_on(fwbuild_daemon::run_daemon(config))?;
        return Ok(ExitCode::SUCCESS);
    }

    init_client_tracing();
    let interrupt = Interrupt::new();
    install_interrupt_handler(interrupt.clone());
    let (pid, cwd) = client_identity();

    match cli.command {
        Command::Daemon => unreachable!("handled above"),
        Command::Build {
            env,
            profile,
            jobs,
            verbose,
            project_dir,
        } => {
            let client = connect(&config, &interrupt)?;
            let response = client.submit_build(&SubmitBuildBody {
                pid,
                cwd,
                project_dir: project_dir.canonicalize().unwrap_or(project_dir),
                environment: env,
                profile,
                jobs,
                verbose,
            })?;
            stream_to_exit_code(&client, response)
        }
        Command::Deploy {
            env,
            port,
            cached,
            verbose,
            project_dir,
        } => {
            let client = connect(&config, &interrupt)?;
            let response = client.submit_deploy(&SubmitDeployBody {
                pid,
                cwd,
                project_dir: project_dir.canonicalize().unwrap_or(project_dir),
                environment: env,
                port,
                use_cached_firmware: cached,
                verbose,
            })?;
            stream_to_exit_code(&client, response)
        }
        Command::Monitor { port, baud } => {
            let client = connect(&config, &interrupt)?;
            let _ = client.submit_monitor(&SubmitMonitorBody {
                pid,
                cwd,
                port: port.clone(),
                baud,
            })?;
            client.stream_monitor(&port, baud, |line| println!("{line}"))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::InstallDeps {
            env,
            verbose,
            project_dir,
        } => {
            let client = connect(&config, &interrupt)?;
            let response = client.install_deps(&SubmitInstallDepsBody {
                pid,
                cwd,
                project_dir: project_dir.canonicalize().unwrap_or(project_dir),
                environment: env,
                verbose,
            })?;
            println!("install-deps: {:?}", response.status);
            Ok(exit_code_for(response.status))
        }
        Command::Devices => {
            let client = connect(&config, &interrupt)?;
            for device in client.list_devices()? {
                match device.description {
                    Some(description) => println!("{}\t{description}", device.name),
                    None => println!("{}", device.name),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let client = connect(&config, &interrupt)?;
            let status = client.daemon_status()?;
            println!(
                "coordinator pid {} (v{}), {} active requests, {} held locks",
                status.pid, status.version, status.active_requests, status.held_locks
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Shutdown => {
            let client = connect(&config, &interrupt)?;
            client.shutdown()?;
            println!("shutdown requested");
            Ok(ExitCode::SUCCESS)
        }
        Command::Purge { name } => {
            let cache = fwbuild_pipeline::PackageCache::new(config.cache_dir.clone());
            let removed = cache.purge(name.as_deref())?;
            println!("removed {removed} cache entries");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(error) if error.is_cancellation() => {
            eprintln!("interrupted");
            ExitCode::from(130)
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
