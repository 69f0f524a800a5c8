use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fwbuild_core::{RequestId, RequestRecord, RequestStatus};

const TERMINAL_RETENTION: Duration = Duration::from_secs(300);

struct TrackedRequest {
    record: RequestRecord,
    terminal_at: Option<Instant>,
}

/// In-memory request records: discarded once a terminal status has aged out.
#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<RequestId, TrackedRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().expect("request registry poisoned");
        inner.insert(
            record.id.clone(),
            TrackedRequest {
                record,
                terminal_at: None,
            },
        );
    }

    pub fn get(&self, request_id: &RequestId) -> Option<RequestRecord> {
        let inner = self.inner.lock().expect("request registry poisoned");
        inner.get(request_id).map(|tracked| tracked.record.clone())
    }

    pub fn set_status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        detail: Option<String>,
    ) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().expect("request registry poisoned");
        let tracked = inner.get_mut(request_id)?;
        tracked.record.status = status;
        tracked.record.detail = detail;
        if status.is_terminal() && tracked.terminal_at.is_none() {
            tracked.terminal_at = Some(Instant::now());
        }
        Some(tracked.record.clone())
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().expect("request registry poisoned");
        inner
            .values()
            .filter(|tracked| !tracked.record.status.is_terminal())
            .count()
    }

    pub fn live_ids(&self) -> HashSet<RequestId> {
        let inner = self.inner.lock().expect("request registry poisoned");
        inner.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<RequestRecord> {
        let inner = self.inner.lock().expect("request registry poisoned");
        let mut records: Vec<RequestRecord> = inner
            .values()
            .map(|tracked| tracked.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Drop terminal records past the retention window. Returns the ids
    /// removed so callers can clean up event channels.
    pub fn prune_terminal(&self) -> Vec<RequestId> {
        self.prune_terminal_older_than(TERMINAL_RETENTION)
    }

    pub fn prune_terminal_older_than(&self, retention: Duration) -> Vec<RequestId> {
        let mut inner = self.inner.lock().expect("request registry poisoned");
        let stale: Vec<RequestId> = inner
            .iter()
            .filter(|(_, tracked)| {
                tracked
                    .terminal_at
                    .map(|at| at.elapsed() >= retention)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
        }
        stale
    }
}
