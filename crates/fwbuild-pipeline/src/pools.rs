use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fwbuild_core::CoordinatorError;
use fwbuild_coordination::CancelToken;

use crate::cache::{CacheEntryManifest, PackageCache};
use crate::models::{PackageSpec, PackageStage};
use crate::progress::ProgressSink;
use crate::stages::{self, StageTuning};

#[derive(Debug)]
pub enum StageOutcome {
    Downloaded(PathBuf),
    Unpacked(PathBuf),
    Installed(CacheEntryManifest),
    Failed(CoordinatorError),
    Cancelled,
}

#[derive(Debug)]
pub struct StageEvent {
    pub task: String,
    pub stage: PackageStage,
    pub outcome: StageOutcome,
}

enum StageWork {
    Download { spec: PackageSpec },
    Unpack { spec: PackageSpec, archive: PathBuf },
    Install { spec: PackageSpec },
}

/// Everything a stage worker needs, captured once per pipeline run. The
/// progress sink carries the request's output context so workers never touch
/// another request's streams.
pub struct StageShared {
    pub cache: Arc<PackageCache>,
    pub tuning: StageTuning,
    pub progress: Arc<dyn ProgressSink>,
    pub token: CancelToken,
}

/// The three bounded worker pools. Worker counts are fixed for the lifetime
/// of the pipeline so network and disk contention stay predictable.
pub struct StagePools {
    download_tx: Option<Sender<StageWork>>,
    unpack_tx: Option<Sender<StageWork>>,
    install_tx: Option<Sender<StageWork>>,
    workers: Vec<JoinHandle<()>>,
}

impl StagePools {
    pub fn start(
        download_workers: usize,
        unpack_workers: usize,
        install_workers: usize,
        shared: Arc<StageShared>,
    ) -> (Self, Receiver<StageEvent>) {
        let (events_tx, events_rx) = unbounded();
        let (download_tx, download_rx) = unbounded::<StageWork>();
        let (unpack_tx, unpack_rx) = unbounded::<StageWork>();
        let (install_tx, install_rx) = unbounded::<StageWork>();

        let mut workers = Vec::new();
        for (count, rx, label) in [
            (download_workers.max(1), download_rx, "download"),
            (unpack_workers.max(1), unpack_rx, "unpack"),
            (install_workers.max(1), install_rx, "install"),
        ] {
            for index in 0..count {
                let worker_rx = rx.clone();
                let worker_events = events_tx.clone();
                let worker_shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("{label}-{index}"))
                    .spawn(move || worker_loop(worker_rx, worker_events, worker_shared))
                    .expect("spawn stage worker");
                workers.push(handle);
            }
        }

        (
            Self {
                download_tx: Some(download_tx),
                unpack_tx: Some(unpack_tx),
                install_tx: Some(install_tx),
                workers,
            },
            events_rx,
        )
    }

    pub fn submit_download(&self, spec: PackageSpec) {
        if let Some(tx) = &self.download_tx {
            let _ = tx.send(StageWork::Download { spec });
        }
    }

    pub fn submit_unpack(&self, spec: PackageSpec, archive: PathBuf) {
        if let Some(tx) = &self.unpack_tx {
            let _ = tx.send(StageWork::Unpack { spec, archive });
        }
    }

    pub fn submit_install(&self, spec: PackageSpec) {
        if let Some(tx) = &self.install_tx {
            let _ = tx.send(StageWork::Install { spec });
        }
    }

    /// Close the queues and wait for in-flight stages to reach their safe
    /// drop point.
    pub fn shutdown(mut self) {
        self.download_tx.take();
        self.unpack_tx.take();
        self.install_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: Receiver<StageWork>,
    events: Sender<StageEvent>,
    shared: Arc<StageShared>,
) {
    for work in rx.iter() {
        let event = execute(work, &shared);
        if events.send(event).is_err() {
            break;
        }
    }
}

fn execute(work: StageWork, shared: &StageShared) -> StageEvent {
    match work {
        StageWork::Download { spec } => {
            let outcome = match stages::download_package(
                &spec,
                &shared.cache,
                &shared.tuning,
                shared.progress.as_ref(),
                &shared.token,
            ) {
                Ok(archive) => StageOutcome::Downloaded(archive),
                Err(CoordinatorError::OperationCancelled) => StageOutcome::Cancelled,
                Err(error) => StageOutcome::Failed(error),
            };
            StageEvent {
                task: spec.name,
                stage: PackageStage::Downloading,
                outcome,
            }
        }
        StageWork::Unpack { spec, archive } => {
            let outcome = match stages::unpack_package(
                &spec,
                &shared.cache,
                &archive,
                &shared.tuning,
                shared.progress.as_ref(),
                &shared.token,
            ) {
                Ok(content) => StageOutcome::Unpacked(content),
                Err(CoordinatorError::OperationCancelled) => StageOutcome::Cancelled,
                Err(error) => StageOutcome::Failed(error),
            };
            StageEvent {
                task: spec.name,
                stage: PackageStage::Unpacking,
                outcome,
            }
        }
        StageWork::Install { spec } => {
            let outcome = match stages::install_package(
                &spec,
                &shared.cache,
                shared.progress.as_ref(),
            ) {
                Ok(manifest) => StageOutcome::Installed(manifest),
                Err(error) => StageOutcome::Failed(error),
            };
            StageEvent {
                task: spec.name,
                stage: PackageStage::Installing,
                outcome,
            }
        }
    }
}
