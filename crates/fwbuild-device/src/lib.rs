//! Device coordination: serial port sessions with shared ring buffers,
//! deploy preemption, and watchdog-timed uploader children.

pub mod ports;
pub mod session;
pub mod uploader;

pub use ports::{OsPortEnumerator, PortEnumerator, PortInfo};
pub use session::{
    DeviceCoordinator, LeaseMode, MonitorEvent, PortSession, SerialConnection, SerialTransport,
};
pub use uploader::{recover_crash_loop, run_upload_watchdog, UploadWatchdog};
