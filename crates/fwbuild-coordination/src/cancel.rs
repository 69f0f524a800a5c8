use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fwbuild_core::{CoordinatorError, CoordinatorResult, RequestId};
use sysinfo::{Pid, ProcessRefreshKind, System};

const DEFAULT_VERDICT_TTL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    cancelled: bool,
    checked_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    explicit: HashSet<RequestId>,
    cache: HashMap<RequestId, CachedVerdict>,
}

/// Dual-channel cancellation: an explicit signal (control message or sentinel
/// file in the state directory) and owner-pid liveness, both polled through a
/// short-TTL verdict cache.
pub struct CancellationRegistry {
    state_dir: PathBuf,
    ttl: Duration,
    state: Mutex<RegistryState>,
    system: Mutex<System>,
}

impl CancellationRegistry {
    pub fn new(state_dir: PathBuf) -> Self {
        Self::with_ttl(state_dir, DEFAULT_VERDICT_TTL)
    }

    pub fn with_ttl(state_dir: PathBuf, ttl: Duration) -> Self {
        Self {
            state_dir,
            ttl,
            state: Mutex::new(RegistryState::default()),
            system: Mutex::new(System::new()),
        }
    }

    fn signal_file(&self, request_id: &RequestId) -> PathBuf {
        self.state_dir
            .join(format!("cancel-{}.signal", request_id.as_str()))
    }

    /// Deliver an explicit cancel for the request. Invalidates any cached
    /// verdict so the next check observes the signal immediately.
    pub fn deliver(&self, request_id: &RequestId) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::write(self.signal_file(request_id), b"cancel")?;
        let mut state = self.state.lock().expect("cancel state poisoned");
        state.explicit.insert(request_id.clone());
        state.cache.remove(request_id);
        Ok(())
    }

    pub fn is_cancelled(&self, request_id: &RequestId, owner_pid: u32) -> bool {
        {
            let state = self.state.lock().expect("cancel state poisoned");
            if state.explicit.contains(request_id) {
                return true;
            }
            if let Some(verdict) = state.cache.get(request_id) {
                if verdict.checked_at.elapsed() < self.ttl {
                    return verdict.cancelled;
                }
            }
        }

        let cancelled = self.signal_file(request_id).exists() || !self.pid_alive(owner_pid);

        let mut state = self.state.lock().expect("cancel state poisoned");
        if cancelled {
            state.explicit.insert(request_id.clone());
        }
        state.cache.insert(
            request_id.clone(),
            CachedVerdict {
                cancelled,
                checked_at: Instant::now(),
            },
        );
        cancelled
    }

    pub fn pid_alive(&self, pid: u32) -> bool {
        let mut system = self.system.lock().expect("cancel system poisoned");
        system.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new())
    }

    /// Remove the signal file and cached state once the request reaches a
    /// terminal status.
    pub fn clear(&self, request_id: &RequestId) {
        let _ = std::fs::remove_file(self.signal_file(request_id));
        let mut state = self.state.lock().expect("cancel state poisoned");
        state.explicit.remove(request_id);
        state.cache.remove(request_id);
    }

    /// Sweep signal files left behind by requests that no longer exist.
    pub fn sweep_stale_signals(&self, live_requests: &HashSet<RequestId>) {
        let Ok(entries) = std::fs::read_dir(&self.state_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("cancel-")
                .and_then(|rest| rest.strip_suffix(".signal"))
            else {
                continue;
            };
            if !live_requests.contains(&RequestId::new(id)) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    pub fn token(
        self: &Arc<Self>,
        request_id: RequestId,
        owner_pid: u32,
    ) -> CancelToken {
        CancelToken {
            registry: Arc::clone(self),
            request_id,
            owner_pid,
        }
    }
}

/// Per-request cancellation token polled at scheduled checkpoints.
#[derive(Clone)]
pub struct CancelToken {
    registry: Arc<CancellationRegistry>,
    request_id: RequestId,
    owner_pid: u32,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.request_id, self.owner_pid)
    }

    /// A scheduled checkpoint: errors with `OperationCancelled` when the
    /// token has resolved.
    pub fn checkpoint(&self) -> CoordinatorResult<()> {
        if self.is_cancelled() {
            Err(CoordinatorError::OperationCancelled)
        } else {
            Ok(())
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// A token that never resolves, for operations with the `continue`
    /// policy: cancellation is still reported by the registry but stops
    /// aborting the work.
    pub fn disabled(&self) -> CancelToken {
        CancelToken {
            registry: Arc::clone(&self.registry),
            request_id: RequestId::new("never"),
            owner_pid: std::process::id(),
        }
    }
}
