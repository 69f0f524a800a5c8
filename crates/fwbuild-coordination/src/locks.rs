use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fwbuild_core::{CoordinatorError, CoordinatorResult, LeaseId};
use tokio::sync::{broadcast, Notify};

const PREEMPTION_BUFFER: usize = 64;
const CONTENTION_RECHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Contended acquisition reports `WouldBlock`.
    Fail,
    /// Contended acquisition reassigns the lock and notifies the holder.
    Preempt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LeaseId),
    WouldBlock { holder_pid: u32 },
    Preempted { lease: LeaseId, previous_owner: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub name: String,
    pub owner_pid: u32,
    pub lease: LeaseId,
    pub age: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptionNotice {
    pub name: String,
    pub previous_owner: u32,
}

#[derive(Debug)]
struct HeldLock {
    owner_pid: u32,
    lease: LeaseId,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<String, HeldLock>,
}

#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
    preemptions: broadcast::Sender<PreemptionNotice>,
}

impl Default for LockManager {
    fn default() -> Self {
        let (preemptions, _) = broadcast::channel(PREEMPTION_BUFFER);
        Self {
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            preemptions,
        }
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, name: &str, owner_pid: u32, policy: LockPolicy) -> AcquireOutcome {
        let mut table = self.table.lock().expect("lock table poisoned");
        match table.held.get(name) {
            None => {
                let lease = LeaseId::generate();
                table.held.insert(
                    name.to_owned(),
                    HeldLock {
                        owner_pid,
                        lease: lease.clone(),
                        acquired_at: Instant::now(),
                    },
                );
                AcquireOutcome::Acquired(lease)
            }
            Some(current) => match policy {
                LockPolicy::Fail => AcquireOutcome::WouldBlock {
                    holder_pid: current.owner_pid,
                },
                LockPolicy::Preempt => {
                    let previous_owner = current.owner_pid;
                    let lease = LeaseId::generate();
                    table.held.insert(
                        name.to_owned(),
                        HeldLock {
                            owner_pid,
                            lease: lease.clone(),
                            acquired_at: Instant::now(),
                        },
                    );
                    drop(table);
                    let _ = self.preemptions.send(PreemptionNotice {
                        name: name.to_owned(),
                        previous_owner,
                    });
                    AcquireOutcome::Preempted {
                        lease,
                        previous_owner,
                    }
                }
            },
        }
    }

    /// Idempotent; a stale lease is a no-op.
    pub fn release(&self, name: &str, lease: &LeaseId) {
        let mut table = self.table.lock().expect("lock table poisoned");
        let matches = table
            .held
            .get(name)
            .map(|held| &held.lease == lease)
            .unwrap_or(false);
        if matches {
            table.held.remove(name);
            drop(table);
            self.released.notify_waiters();
        }
    }

    pub fn status(&self) -> Vec<LockStatus> {
        let table = self.table.lock().expect("lock table poisoned");
        let mut entries: Vec<LockStatus> = table
            .held
            .iter()
            .map(|(name, held)| LockStatus {
                name: name.clone(),
                owner_pid: held.owner_pid,
                lease: held.lease.clone(),
                age: held.acquired_at.elapsed(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn held_count(&self) -> usize {
        self.table.lock().expect("lock table poisoned").held.len()
    }

    /// Release every lock whose owner is no longer alive. Returns the names
    /// that were swept.
    pub fn clear_stale(&self, pid_alive: impl Fn(u32) -> bool) -> Vec<String> {
        let mut table = self.table.lock().expect("lock table poisoned");
        let stale: Vec<String> = table
            .held
            .iter()
            .filter(|(_, held)| !pid_alive(held.owner_pid))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            table.held.remove(name);
        }
        drop(table);
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "released locks held by dead clients");
            self.released.notify_waiters();
        }
        stale
    }

    pub fn subscribe_preemptions(&self) -> broadcast::Receiver<PreemptionNotice> {
        self.preemptions.subscribe()
    }
}

/// Scoped acquisition bundle: every lock acquired for a request is released
/// on every exit path, including panic, when the bundle drops.
#[derive(Debug)]
pub struct LockBundle {
    manager: Arc<LockManager>,
    held: Vec<(String, LeaseId)>,
}

impl LockBundle {
    /// Acquire every name or none. On contention the partial set is released
    /// and `LockContended` reports the holder.
    pub fn try_acquire(
        manager: &Arc<LockManager>,
        names: &[String],
        owner_pid: u32,
    ) -> CoordinatorResult<LockBundle> {
        let mut held = Vec::with_capacity(names.len());
        for name in names {
            match manager.acquire(name, owner_pid, LockPolicy::Fail) {
                AcquireOutcome::Acquired(lease) => held.push((name.clone(), lease)),
                AcquireOutcome::WouldBlock { holder_pid } => {
                    for (acquired_name, lease) in held.drain(..) {
                        manager.release(&acquired_name, &lease);
                    }
                    return Err(CoordinatorError::LockContended {
                        name: name.clone(),
                        holder_pid,
                    });
                }
                AcquireOutcome::Preempted { .. } => {
                    unreachable!("fail policy never preempts")
                }
            }
        }
        Ok(LockBundle {
            manager: Arc::clone(manager),
            held,
        })
    }

    /// Wait for the bundle, polling the cancellation check between attempts.
    /// The later of two requests contending on the same name waits here.
    pub async fn acquire_waiting(
        manager: &Arc<LockManager>,
        names: &[String],
        owner_pid: u32,
        cancelled: impl Fn() -> bool,
    ) -> CoordinatorResult<LockBundle> {
        loop {
            match Self::try_acquire(manager, names, owner_pid) {
                Ok(bundle) => return Ok(bundle),
                Err(CoordinatorError::LockContended { .. }) => {
                    if cancelled() {
                        return Err(CoordinatorError::OperationCancelled);
                    }
                    let released = manager.released.notified();
                    tokio::select! {
                        _ = released => {}
                        _ = tokio::time::sleep(CONTENTION_RECHECK_INTERVAL) => {}
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.held.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for (name, lease) in self.held.drain(..) {
            self.manager.release(&name, &lease);
        }
    }
}

impl Drop for LockBundle {
    fn drop(&mut self) {
        self.release_all();
    }
}
