//! Wire contract between clients and the coordinator: HTTP bodies and
//! the WebSocket message envelopes for status and monitor streams.

use std::path::PathBuf;

use fwbuild_core::{LeaseId, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBuildBody {
    pub pid: u32,
    pub cwd: PathBuf,
    pub project_dir: PathBuf,
    pub environment: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDeployBody {
    pub pid: u32,
    pub cwd: PathBuf,
    pub project_dir: PathBuf,
    pub environment: String,
    pub port: String,
    #[serde(default)]
    pub use_cached_firmware: bool,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitMonitorBody {
    pub pid: u32,
    pub cwd: PathBuf,
    pub port: String,
    pub baud: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitInstallDepsBody {
    pub pid: u32,
    pub cwd: PathBuf,
    pub project_dir: PathBuf,
    pub environment: String,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: RequestId,
    pub status: RequestStatus,
    #[serde(default)]
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatusResponse {
    pub pid: u32,
    pub version: String,
    pub dev_mode: bool,
    pub active_requests: usize,
    pub held_locks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatusEntry {
    pub name: String,
    pub owner_pid: u32,
    pub lease: LeaseId,
    pub age_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLeaseBody {
    pub pid: u32,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLeaseResponse {
    pub lease: LeaseId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Shape of one enumerated serial port in `/api/devices/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePortInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Client-to-server messages on the monitor WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorClientMessage {
    Attach { baud: u32 },
    Write { data: String },
    /// Echo of the last observed index; requests the batch from there.
    Next { index: u64 },
    Detach,
    Ping,
}

/// Server-to-client messages on the monitor WebSocket. `data` carries an
/// ordered batch with the index of its first line; delivery is
/// at-least-once and readers de-duplicate by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorServerMessage {
    Attached {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Data {
        index: u64,
        lines: Vec<String>,
    },
    Preempted,
    Reconnected,
    WriteAck,
    Error {
        message: String,
    },
    Pong,
}

/// Events on the per-request status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestStreamMessage {
    Status {
        status: RequestStatus,
        #[serde(default)]
        detail: Option<String>,
    },
    Log {
        line: String,
    },
}

/// One frame on the global log-subscription stream: every request's status
/// and log events, tagged with the owning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamMessage {
    pub request_id: RequestId,
    pub sequence: u64,
    #[serde(flatten)]
    pub message: RequestStreamMessage,
}

#[cfg(test)]
mod tests {
    use fwbuild_core::RequestStatus;

    use super::{MonitorClientMessage, MonitorServerMessage, RequestStreamMessage, SubmitResponse};

    #[test]
    fn monitor_messages_use_a_tagged_wire_schema() {
        let attach: MonitorClientMessage =
            serde_json::from_str(r#"{"type":"attach","baud":115200}"#).expect("decode attach");
        assert_eq!(attach, MonitorClientMessage::Attach { baud: 115_200 });

        let encoded = serde_json::to_string(&MonitorServerMessage::Data {
            index: 7,
            lines: vec!["boot".to_owned()],
        })
        .expect("encode data");
        assert!(encoded.contains(r#""type":"data""#));
        assert!(encoded.contains(r#""index":7"#));
    }

    #[test]
    fn every_monitor_client_kind_round_trips() {
        let messages = vec![
            MonitorClientMessage::Attach { baud: 9_600 },
            MonitorClientMessage::Write {
                data: "reset\n".to_owned(),
            },
            MonitorClientMessage::Next { index: 42 },
            MonitorClientMessage::Detach,
            MonitorClientMessage::Ping,
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).expect("encode");
            let decoded: MonitorClientMessage = serde_json::from_str(&encoded).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn request_stream_status_round_trips() {
        let message = RequestStreamMessage::Status {
            status: RequestStatus::Cancelled,
            detail: Some("client died".to_owned()),
        };
        let encoded = serde_json::to_string(&message).expect("encode");
        let decoded: RequestStreamMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn submit_response_carries_the_stream_url() {
        let encoded = serde_json::to_string(&SubmitResponse {
            request_id: "req-9".into(),
            status: RequestStatus::Queued,
            stream_url: Some("/ws/requests/req-9".to_owned()),
        })
        .expect("encode");
        let decoded: SubmitResponse = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.stream_url.as_deref(), Some("/ws/requests/req-9"));
    }
}
