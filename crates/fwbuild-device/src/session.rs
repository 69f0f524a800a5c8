use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fwbuild_core::{CoordinatorError, CoordinatorResult, LeaseId};
use tokio::sync::broadcast;

use crate::ports::{PortEnumerator, PortInfo};

const RING_CAPACITY: usize = 1_000;
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(50);
const EVENT_BUFFER: usize = 32;

/// Blocking line-oriented connection to one physical port. The real
/// transport is an external collaborator; tests provide in-memory fakes.
pub trait SerialConnection: Send {
    fn read_line(&mut self, timeout: Duration) -> CoordinatorResult<Option<String>>;
    fn write(&mut self, data: &[u8]) -> CoordinatorResult<()>;
}

pub trait SerialTransport: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> CoordinatorResult<Box<dyn SerialConnection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Preempted,
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Non-exclusive; any number of concurrent readers share the port.
    Reader,
    /// Exclusive among writers, coexists with readers.
    Writer,
    /// Exclusive; preempts readers and writers for an upload.
    Deploy,
}

struct RingState {
    lines: VecDeque<(u64, String)>,
    next_index: u64,
}

enum PortCommand {
    Write(Vec<u8>, Sender<CoordinatorResult<()>>),
}

/// One open physical port: a reader thread owns the connection, feeds the
/// bounded line ring, and services write requests. Monitor readers each keep
/// an independent cursor over the ring.
pub struct PortSession {
    port: String,
    baud: u32,
    transport: Arc<dyn SerialTransport>,
    ring: Mutex<RingState>,
    events: broadcast::Sender<MonitorEvent>,
    preempted: AtomicBool,
    command_tx: Mutex<Option<Sender<PortCommand>>>,
    reader_stop: Mutex<Arc<AtomicBool>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PortSession {
    fn open(
        port: String,
        baud: u32,
        transport: Arc<dyn SerialTransport>,
    ) -> CoordinatorResult<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let session = Arc::new(Self {
            port,
            baud,
            transport,
            ring: Mutex::new(RingState {
                lines: VecDeque::with_capacity(RING_CAPACITY),
                next_index: 0,
            }),
            events,
            preempted: AtomicBool::new(false),
            command_tx: Mutex::new(None),
            reader_stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            reader_handle: Mutex::new(None),
        });
        session.start_reader()?;
        Ok(session)
    }

    fn start_reader(self: &Arc<Self>) -> CoordinatorResult<()> {
        let connection = self.transport.open(&self.port, self.baud)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = channel();

        *self.reader_stop.lock().expect("reader stop lock poisoned") = Arc::clone(&stop);
        *self.command_tx.lock().expect("command lock poisoned") = Some(command_tx);

        let session = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("monitor-{}", self.port.replace('/', "_")))
            .spawn(move || session.reader_loop(connection, stop, command_rx))
            .map_err(|error| CoordinatorError::Io(error.to_string()))?;
        *self.reader_handle.lock().expect("reader handle lock poisoned") = Some(handle);
        Ok(())
    }

    fn reader_loop(
        &self,
        mut connection: Box<dyn SerialConnection>,
        stop: Arc<AtomicBool>,
        commands: Receiver<PortCommand>,
    ) {
        while !stop.load(Ordering::Relaxed) {
            while let Ok(PortCommand::Write(data, reply)) = commands.try_recv() {
                let _ = reply.send(connection.write(&data));
            }
            match connection.read_line(READ_POLL_TIMEOUT) {
                Ok(Some(line)) => self.push_line(line),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(port = %self.port, error = %error, "serial read failed");
                    std::thread::sleep(READ_POLL_TIMEOUT);
                }
            }
        }
        // Dropping the connection here closes the physical handle.
    }

    fn push_line(&self, line: String) {
        let mut ring = self.ring.lock().expect("ring lock poisoned");
        let index = ring.next_index;
        ring.next_index += 1;
        if ring.lines.len() == RING_CAPACITY {
            ring.lines.pop_front();
        }
        ring.lines.push_back((index, line));
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Lines at or after `cursor`, plus the next cursor to echo back.
    /// Delivery is at-least-once; callers de-duplicate by index.
    pub fn read_from(&self, cursor: u64) -> (Vec<(u64, String)>, u64) {
        let ring = self.ring.lock().expect("ring lock poisoned");
        let lines: Vec<(u64, String)> = ring
            .lines
            .iter()
            .filter(|(index, _)| *index >= cursor)
            .cloned()
            .collect();
        (lines, ring.next_index)
    }

    pub fn write(&self, data: &[u8]) -> CoordinatorResult<()> {
        if self.is_preempted() {
            return Err(CoordinatorError::Preempted);
        }
        let command_tx = self.command_tx.lock().expect("command lock poisoned");
        let Some(tx) = command_tx.as_ref() else {
            return Err(CoordinatorError::Io(format!(
                "port {} is not open",
                self.port
            )));
        };
        let (reply_tx, reply_rx) = channel();
        tx.send(PortCommand::Write(data.to_vec(), reply_tx))
            .map_err(|_| CoordinatorError::Io(format!("port {} reader gone", self.port)))?;
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| CoordinatorError::Io(format!("write to {} timed out", self.port)))?
    }

    /// Deploy preemption step 1-2: signal the notice and close the shared
    /// handle once the reader thread drains.
    pub fn pause_for_deploy(&self) {
        self.preempted.store(true, Ordering::Relaxed);
        let _ = self.events.send(MonitorEvent::Preempted);
        self.stop_reader();
    }

    /// Deploy preemption step 4: reopen and tell readers to reconnect.
    pub fn resume_after_deploy(self: &Arc<Self>) -> CoordinatorResult<()> {
        self.start_reader()?;
        self.preempted.store(false, Ordering::Relaxed);
        let _ = self.events.send(MonitorEvent::Reconnected);
        Ok(())
    }

    fn stop_reader(&self) {
        let stop = self.reader_stop.lock().expect("reader stop lock poisoned");
        stop.store(true, Ordering::Relaxed);
        drop(stop);
        self.command_tx.lock().expect("command lock poisoned").take();
        let handle = self
            .reader_handle
            .lock()
            .expect("reader handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn close(&self) {
        self.stop_reader();
    }
}

#[derive(Debug, Default)]
struct PortLeases {
    readers: HashMap<LeaseId, u32>,
    writer: Option<(LeaseId, u32)>,
    deploy: Option<(LeaseId, u32)>,
}

/// Owns every open port. Clients never touch a port handle; all interaction
/// is through leases and sessions held here.
pub struct DeviceCoordinator {
    transport: Arc<dyn SerialTransport>,
    enumerator: Arc<dyn PortEnumerator>,
    sessions: Mutex<HashMap<String, Arc<PortSession>>>,
    leases: Mutex<HashMap<String, PortLeases>>,
}

impl DeviceCoordinator {
    pub fn new(transport: Arc<dyn SerialTransport>, enumerator: Arc<dyn PortEnumerator>) -> Self {
        Self {
            transport,
            enumerator,
            sessions: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn list_ports(&self) -> Vec<PortInfo> {
        self.enumerator.list_ports()
    }

    pub fn lease(&self, port: &str, owner_pid: u32, mode: LeaseMode) -> CoordinatorResult<LeaseId> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        let entry = leases.entry(port.to_owned()).or_default();
        let lease = LeaseId::generate();
        match mode {
            LeaseMode::Reader => {
                entry.readers.insert(lease.clone(), owner_pid);
            }
            LeaseMode::Writer => {
                if let Some((_, holder)) = &entry.writer {
                    return Err(CoordinatorError::LockContended {
                        name: format!("device:{port}"),
                        holder_pid: *holder,
                    });
                }
                entry.writer = Some((lease.clone(), owner_pid));
            }
            LeaseMode::Deploy => {
                if let Some((_, holder)) = &entry.deploy {
                    return Err(CoordinatorError::LockContended {
                        name: format!("device:{port}"),
                        holder_pid: *holder,
                    });
                }
                entry.deploy = Some((lease.clone(), owner_pid));
            }
        }
        Ok(lease)
    }

    pub fn release(&self, port: &str, lease: &LeaseId) {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        if let Some(entry) = leases.get_mut(port) {
            entry.readers.remove(lease);
            if entry.writer.as_ref().map(|(id, _)| id == lease) == Some(true) {
                entry.writer = None;
            }
            if entry.deploy.as_ref().map(|(id, _)| id == lease) == Some(true) {
                entry.deploy = None;
            }
        }
    }

    /// Release every lease owned by a dead client.
    pub fn release_for_pid(&self, pid: u32) {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        for entry in leases.values_mut() {
            entry.readers.retain(|_, owner| *owner != pid);
            if entry.writer.as_ref().map(|(_, owner)| *owner == pid) == Some(true) {
                entry.writer = None;
            }
            if entry.deploy.as_ref().map(|(_, owner)| *owner == pid) == Some(true) {
                entry.deploy = None;
            }
        }
    }

    /// The shared monitor session for a port, opened on first attach.
    pub fn attach_monitor(&self, port: &str, baud: u32) -> CoordinatorResult<Arc<PortSession>> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if let Some(session) = sessions.get(port) {
            return Ok(Arc::clone(session));
        }
        let session = PortSession::open(port.to_owned(), baud, Arc::clone(&self.transport))?;
        sessions.insert(port.to_owned(), Arc::clone(&session));
        Ok(session)
    }

    pub fn session(&self, port: &str) -> Option<Arc<PortSession>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(port)
            .cloned()
    }

    /// Run `upload` with the port preempted: readers get `preempted`, the
    /// handle closes, and after the upload the port reopens and readers get
    /// `reconnected`. The reopen runs on every exit path.
    pub fn with_deploy_preemption<T>(
        &self,
        port: &str,
        upload: impl FnOnce() -> CoordinatorResult<T>,
    ) -> CoordinatorResult<T> {
        let session = self.session(port);
        if let Some(session) = &session {
            session.pause_for_deploy();
        }
        let result = upload();
        if let Some(session) = &session {
            if let Err(error) = session.resume_after_deploy() {
                tracing::warn!(port, error = %error, "monitor failed to reconnect after deploy");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use fwbuild_core::CoordinatorError;

    use crate::ports::{PortEnumerator, PortInfo};

    use super::{
        DeviceCoordinator, LeaseMode, MonitorEvent, SerialConnection, SerialTransport,
    };

    #[derive(Default)]
    struct FakeWire {
        pending: Mutex<VecDeque<String>>,
        arrived: Condvar,
        written: Mutex<Vec<Vec<u8>>>,
        opens: AtomicUsize,
    }

    impl FakeWire {
        fn feed(&self, line: &str) {
            self.pending
                .lock()
                .expect("pending lock")
                .push_back(line.to_owned());
            self.arrived.notify_all();
        }
    }

    struct FakeConnection {
        wire: Arc<FakeWire>,
    }

    impl SerialConnection for FakeConnection {
        fn read_line(&mut self, timeout: Duration) -> fwbuild_core::CoordinatorResult<Option<String>> {
            let pending = self.wire.pending.lock().expect("pending lock");
            let (mut pending, _) = self
                .wire
                .arrived
                .wait_timeout_while(pending, timeout, |queue| queue.is_empty())
                .expect("pending lock");
            Ok(pending.pop_front())
        }

        fn write(&mut self, data: &[u8]) -> fwbuild_core::CoordinatorResult<()> {
            self.wire.written.lock().expect("written lock").push(data.to_vec());
            Ok(())
        }
    }

    struct FakeTransport {
        wire: Arc<FakeWire>,
    }

    impl SerialTransport for FakeTransport {
        fn open(
            &self,
            _port: &str,
            _baud: u32,
        ) -> fwbuild_core::CoordinatorResult<Box<dyn SerialConnection>> {
            self.wire.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                wire: Arc::clone(&self.wire),
            }))
        }
    }

    struct NoPorts;

    impl PortEnumerator for NoPorts {
        fn list_ports(&self) -> Vec<PortInfo> {
            Vec::new()
        }
    }

    fn coordinator() -> (DeviceCoordinator, Arc<FakeWire>) {
        let wire = Arc::new(FakeWire::default());
        let transport = FakeTransport {
            wire: Arc::clone(&wire),
        };
        (
            DeviceCoordinator::new(Arc::new(transport), Arc::new(NoPorts)),
            wire,
        )
    }

    fn wait_for_lines(
        session: &super::PortSession,
        cursor: u64,
        expected: usize,
    ) -> Vec<(u64, String)> {
        for _ in 0..100 {
            let (lines, _) = session.read_from(cursor);
            if lines.len() >= expected {
                return lines;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {expected} monitor lines");
    }

    #[test]
    fn readers_keep_independent_cursors_over_the_shared_ring() {
        let (coordinator, wire) = coordinator();
        let session = coordinator
            .attach_monitor("/dev/ttyUSB0", 115_200)
            .expect("attach monitor");

        wire.feed("boot");
        wire.feed("ready");
        let all = wait_for_lines(&session, 0, 2);
        assert_eq!(all[0], (0, "boot".to_owned()));
        assert_eq!(all[1], (1, "ready".to_owned()));

        // A reader that already consumed index 0 polls from its own cursor.
        let (tail, next) = session.read_from(1);
        assert_eq!(tail, vec![(1, "ready".to_owned())]);
        assert_eq!(next, 2);

        // Re-polling from an old cursor redelivers: at-least-once by index.
        let (redelivered, _) = session.read_from(0);
        assert_eq!(redelivered.len(), 2);
        session.close();
    }

    #[test]
    fn writes_reach_the_wire_through_the_session() {
        let (coordinator, wire) = coordinator();
        let session = coordinator
            .attach_monitor("/dev/ttyUSB0", 115_200)
            .expect("attach monitor");

        session.write(b"reset\n").expect("write");
        for _ in 0..100 {
            if !wire.written.lock().expect("written lock").is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            wire.written.lock().expect("written lock").first(),
            Some(&b"reset\n".to_vec())
        );
        session.close();
    }

    #[test]
    fn deploy_preemption_closes_reopens_and_notifies_readers() {
        let (coordinator, wire) = coordinator();
        let session = coordinator
            .attach_monitor("/dev/ttyUSB0", 115_200)
            .expect("attach monitor");
        let mut events = session.subscribe();
        assert_eq!(wire.opens.load(Ordering::SeqCst), 1);

        coordinator
            .with_deploy_preemption("/dev/ttyUSB0", || {
                assert!(session.is_preempted());
                assert!(matches!(session.write(b"x"), Err(CoordinatorError::Preempted)));
                Ok(())
            })
            .expect("deploy");

        assert!(!session.is_preempted());
        assert_eq!(wire.opens.load(Ordering::SeqCst), 2, "port reopened");
        assert_eq!(events.try_recv().expect("first event"), MonitorEvent::Preempted);
        assert_eq!(
            events.try_recv().expect("second event"),
            MonitorEvent::Reconnected
        );

        // New lines still arrive after the reconnect.
        wire.feed("back online");
        let lines = wait_for_lines(&session, 0, 1);
        assert_eq!(lines[0].1, "back online");
        session.close();
    }

    #[test]
    fn port_reopens_even_when_the_upload_fails() {
        let (coordinator, wire) = coordinator();
        let session = coordinator
            .attach_monitor("/dev/ttyUSB0", 115_200)
            .expect("attach monitor");

        let result: fwbuild_core::CoordinatorResult<()> = coordinator
            .with_deploy_preemption("/dev/ttyUSB0", || {
                Err(CoordinatorError::ChildNonzero {
                    status: 2,
                    stderr: "flash failed".to_owned(),
                })
            });
        assert!(result.is_err());
        assert!(!session.is_preempted());
        assert_eq!(wire.opens.load(Ordering::SeqCst), 2);
        session.close();
    }

    #[test]
    fn writer_leases_are_exclusive_but_readers_coexist() {
        let (coordinator, _wire) = coordinator();
        let first_reader = coordinator
            .lease("/dev/ttyUSB0", 100, LeaseMode::Reader)
            .expect("reader 1");
        let _second_reader = coordinator
            .lease("/dev/ttyUSB0", 200, LeaseMode::Reader)
            .expect("reader 2");
        let writer = coordinator
            .lease("/dev/ttyUSB0", 100, LeaseMode::Writer)
            .expect("writer");

        let contended = coordinator.lease("/dev/ttyUSB0", 300, LeaseMode::Writer);
        assert!(matches!(
            contended,
            Err(CoordinatorError::LockContended { holder_pid: 100, .. })
        ));

        coordinator.release("/dev/ttyUSB0", &writer);
        coordinator
            .lease("/dev/ttyUSB0", 300, LeaseMode::Writer)
            .expect("writer after release");
        coordinator.release("/dev/ttyUSB0", &first_reader);
    }

    #[test]
    fn dead_client_leases_are_swept_by_pid() {
        let (coordinator, _wire) = coordinator();
        let _reader = coordinator
            .lease("/dev/ttyUSB0", 4242, LeaseMode::Reader)
            .expect("reader");
        let _writer = coordinator
            .lease("/dev/ttyUSB0", 4242, LeaseMode::Writer)
            .expect("writer");

        coordinator.release_for_pid(4242);
        coordinator
            .lease("/dev/ttyUSB0", 100, LeaseMode::Writer)
            .expect("writer after sweep");
    }
}
