use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fwbuild_build::{BuildOrchestrator, FirmwareLedger, PlatformRegistry};
use fwbuild_compile::CompilationPool;
use fwbuild_config::CoordinatorConfig;
use fwbuild_coordination::{CancellationRegistry, LockManager};
use fwbuild_core::CoordinatorResult;
use fwbuild_device::{
    DeviceCoordinator, OsPortEnumerator, PortEnumerator, SerialConnection, SerialTransport,
};
use fwbuild_pipeline::{InstallPipeline, PackageCache};
use tokio::sync::watch;

use crate::events::RequestEventBus;
use crate::registry::RequestRegistry;

/// Placeholder transport for hosts without a wired serial layer; the real
/// transport is injected by the embedding binary.
struct UnavailableTransport;

impl SerialTransport for UnavailableTransport {
    fn open(&self, port: &str, _baud: u32) -> CoordinatorResult<Box<dyn SerialConnection>> {
        Err(fwbuild_core::CoordinatorError::Configuration(format!(
            "no serial transport configured for {port}"
        )))
    }
}

/// Everything the coordinator owns, shared across the endpoint server and
/// the dispatcher. Capabilities flow downward from here; nothing below holds
/// a reference back up.
pub struct CoordinatorState {
    pub config: CoordinatorConfig,
    pub locks: Arc<LockManager>,
    pub cancels: Arc<CancellationRegistry>,
    pub requests: RequestRegistry,
    pub events: Arc<RequestEventBus>,
    pub compile_pool: CompilationPool,
    pub cache: Arc<PackageCache>,
    pub platforms: Arc<PlatformRegistry>,
    pub orchestrator: BuildOrchestrator,
    pub ledger: Arc<FirmwareLedger>,
    pub devices: Arc<DeviceCoordinator>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    last_activity: Mutex<Instant>,
}

impl CoordinatorState {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Self::with_devices(
            config,
            Arc::new(UnavailableTransport),
            Arc::new(OsPortEnumerator),
        )
    }

    pub fn with_devices(
        config: CoordinatorConfig,
        transport: Arc<dyn SerialTransport>,
        enumerator: Arc<dyn PortEnumerator>,
    ) -> Arc<Self> {
        let locks = Arc::new(LockManager::new());
        let cancels = Arc::new(CancellationRegistry::with_ttl(
            config.state_dir.clone(),
            config.cancel_cache_ttl(),
        ));
        let cache = Arc::new(PackageCache::new(config.cache_dir.clone()));
        let platforms = Arc::new(PlatformRegistry::with_builtin());
        let ledger = Arc::new(FirmwareLedger::new());
        let pipeline = InstallPipeline::new(Arc::clone(&cache))
            .with_lock_manager(Arc::clone(&locks), std::process::id());
        let orchestrator = BuildOrchestrator::new(
            Arc::clone(&platforms),
            Arc::clone(&cache),
            pipeline,
            Arc::clone(&ledger),
        );
        let compile_pool =
            CompilationPool::shared(Duration::from_secs(config.compile_timeout_secs));
        let devices = Arc::new(DeviceCoordinator::new(transport, enumerator));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            config,
            locks,
            cancels,
            requests: RequestRegistry::new(),
            events: Arc::new(RequestEventBus::new()),
            compile_pool,
            cache,
            platforms,
            orchestrator,
            ledger,
            devices,
            shutdown_tx,
            shutdown_rx,
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// True when the coordinator may evict itself: no active requests, no
    /// held locks, and past the idle window.
    pub fn is_evictable(&self) -> bool {
        self.requests.active_count() == 0
            && self.locks.held_count() == 0
            && self.idle_for() >= self.config.idle_timeout()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
