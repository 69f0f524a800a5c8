use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use fwbuild_config::CoordinatorConfig;
use fwbuild_core::{CoordinatorError, CoordinatorResult, RequestId, RequestStatus};
use fwbuild_protocol::{
    DaemonStatusResponse, DevicePortInfo, RequestStreamMessage, SubmitBuildBody, SubmitDeployBody,
    SubmitInstallDepsBody, SubmitMonitorBody, SubmitResponse,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::bootstrap::{ensure_coordinator, BootstrapOptions};
use crate::http::{Interrupt, InterruptibleHttp};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_HTTP_TIMEOUT: Duration = Duration::from_secs(3_600);
const STREAM_IDLE_TICK: Duration = Duration::from_millis(100);

/// Typed access to one coordinator endpoint.
pub struct CoordinatorClient {
    base_url: String,
    port: u16,
    http: InterruptibleHttp,
    install_http: InterruptibleHttp,
    interrupt: Interrupt,
}

impl CoordinatorClient {
    /// Locate or spawn the coordinator, then connect to it.
    pub fn connect(
        config: &CoordinatorConfig,
        options: &BootstrapOptions,
        interrupt: Interrupt,
    ) -> CoordinatorResult<Self> {
        let port = ensure_coordinator(config, options)?;
        Self::for_port(port, interrupt)
    }

    pub fn for_port(port: u16, interrupt: Interrupt) -> CoordinatorResult<Self> {
        Ok(Self {
            base_url: format!("http://127.0.0.1:{port}"),
            port,
            http: InterruptibleHttp::new(interrupt.clone(), HTTP_TIMEOUT)?,
            install_http: InterruptibleHttp::new(interrupt.clone(), INSTALL_HTTP_TIMEOUT)?,
            interrupt,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn submit_build(&self, body: &SubmitBuildBody) -> CoordinatorResult<SubmitResponse> {
        self.post_typed("/api/build", body)
    }

    pub fn submit_deploy(&self, body: &SubmitDeployBody) -> CoordinatorResult<SubmitResponse> {
        self.post_typed("/api/deploy", body)
    }

    pub fn submit_monitor(&self, body: &SubmitMonitorBody) -> CoordinatorResult<SubmitResponse> {
        self.post_typed("/api/monitor", body)
    }

    /// Blocks until the install's terminal status; the pipeline keeps
    /// populating the cache even if this client is interrupted.
    pub fn install_deps(&self, body: &SubmitInstallDepsBody) -> CoordinatorResult<SubmitResponse> {
        let value = self.install_http.post_json(
            &self.url("/api/install-deps"),
            serde_json::to_value(body)?,
        )?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn cancel(&self, request_id: &RequestId) -> CoordinatorResult<()> {
        self.http
            .post_json(
                &self.url(&format!("/api/requests/{request_id}/cancel")),
                serde_json::Value::Null,
            )
            .map(|_| ())
    }

    pub fn daemon_status(&self) -> CoordinatorResult<DaemonStatusResponse> {
        let value = self.http.get_json(&self.url("/api/daemon/status"))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn shutdown(&self) -> CoordinatorResult<()> {
        self.http
            .post_json(&self.url("/api/daemon/shutdown"), serde_json::Value::Null)
            .map(|_| ())
    }

    pub fn list_devices(&self) -> CoordinatorResult<Vec<DevicePortInfo>> {
        let value = self.http.get_json(&self.url("/api/devices/list"))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn request_status(&self, request_id: &RequestId) -> CoordinatorResult<RequestStatus> {
        let value = self
            .http
            .get_json(&self.url(&format!("/api/requests/{request_id}")))?;
        let status = value
            .get("status")
            .cloned()
            .ok_or_else(|| CoordinatorError::Serde("missing status field".to_owned()))?;
        Ok(serde_json::from_value(status)?)
    }

    fn post_typed<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> CoordinatorResult<SubmitResponse> {
        let value = self
            .http
            .post_json(&self.url(path), serde_json::to_value(body)?)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Attach to a serial monitor stream and forward lines until the client
    /// is interrupted. Preemption is reported and the stream resumes on
    /// reconnect.
    pub fn stream_monitor(
        &self,
        port: &str,
        baud: u32,
        mut on_line: impl FnMut(&str),
    ) -> CoordinatorResult<()> {
        let ws_url = format!("ws://127.0.0.1:{}/ws/monitor/{port}", self.port);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| CoordinatorError::Internal(error.to_string()))?;

        let interrupt = self.interrupt.clone();
        runtime.block_on(async move {
            let (socket, _) = tokio_tungstenite::connect_async(&ws_url)
                .await
                .map_err(|error| CoordinatorError::Http(error.to_string()))?;
            let (mut sink, mut stream) = socket.split();
            let attach = serde_json::to_string(&fwbuild_protocol::MonitorClientMessage::Attach {
                baud,
            })?;
            sink.send(WsMessage::Text(attach))
                .await
                .map_err(|error| CoordinatorError::Http(error.to_string()))?;

            let mut last_seen: Option<u64> = None;
            loop {
                tokio::select! {
                    frame = stream.next() => {
                        let Some(frame) = frame else { return Ok(()) };
                        let frame = frame
                            .map_err(|error| CoordinatorError::Http(error.to_string()))?;
                        let WsMessage::Text(text) = frame else { continue };
                        match serde_json::from_str::<fwbuild_protocol::MonitorServerMessage>(&text)
                        {
                            Ok(fwbuild_protocol::MonitorServerMessage::Attached { ok, error }) => {
                                if !ok {
                                    return Err(CoordinatorError::Io(
                                        error.unwrap_or_else(|| "attach failed".to_owned()),
                                    ));
                                }
                            }
                            Ok(fwbuild_protocol::MonitorServerMessage::Data { index, lines }) => {
                                // At-least-once delivery: drop lines already seen.
                                for (offset, line) in lines.iter().enumerate() {
                                    let line_index = index + offset as u64;
                                    if last_seen.map(|seen| line_index <= seen) != Some(true) {
                                        on_line(line);
                                        last_seen = Some(line_index);
                                    }
                                }
                                let next = serde_json::to_string(
                                    &fwbuild_protocol::MonitorClientMessage::Next {
                                        index: last_seen.map(|seen| seen + 1).unwrap_or(0),
                                    },
                                )?;
                                let _ = sink.send(WsMessage::Text(next)).await;
                            }
                            Ok(fwbuild_protocol::MonitorServerMessage::Preempted) => {
                                on_line("-- port preempted for deploy --");
                            }
                            Ok(fwbuild_protocol::MonitorServerMessage::Reconnected) => {
                                on_line("-- monitor reconnected --");
                            }
                            Ok(_) | Err(_) => {}
                        }
                    }
                    _ = tokio::time::sleep(STREAM_IDLE_TICK) => {
                        if interrupt.is_triggered() {
                            let detach = serde_json::to_string(
                                &fwbuild_protocol::MonitorClientMessage::Detach,
                            )?;
                            let _ = sink.send(WsMessage::Text(detach)).await;
                            let _ = sink.close().await;
                            return Ok(());
                        }
                    }
                }
            }
        })
    }

    /// Follow the request's status stream to its terminal status, forwarding
    /// log lines to `on_line`. A client-side interrupt delivers a cancel and
    /// keeps following until the coordinator confirms it.
    pub fn stream_request(
        &self,
        request_id: &RequestId,
        mut on_line: impl FnMut(&str),
    ) -> CoordinatorResult<RequestStatus> {
        let ws_url = format!("ws://127.0.0.1:{}/ws/requests/{request_id}", self.port);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| CoordinatorError::Internal(error.to_string()))?;

        let interrupt = self.interrupt.clone();
        let cancel_url = self.url(&format!("/api/requests/{request_id}/cancel"));
        runtime.block_on(async move {
            let (socket, _) = tokio_tungstenite::connect_async(&ws_url)
                .await
                .map_err(|error| CoordinatorError::Http(error.to_string()))?;
            let (mut sink, mut stream) = socket.split();
            let mut cancel_sent = false;

            loop {
                tokio::select! {
                    frame = stream.next() => {
                        let Some(frame) = frame else {
                            return Err(CoordinatorError::Http(
                                "status stream closed before a terminal status".to_owned(),
                            ));
                        };
                        let frame = frame
                            .map_err(|error| CoordinatorError::Http(error.to_string()))?;
                        let WsMessage::Text(text) = frame else { continue };
                        match serde_json::from_str::<RequestStreamMessage>(&text) {
                            Ok(RequestStreamMessage::Log { line }) => on_line(&line),
                            Ok(RequestStreamMessage::Status { status, detail }) => {
                                if let Some(detail) = detail {
                                    if status == RequestStatus::Failed {
                                        on_line(&detail);
                                    }
                                }
                                if status.is_terminal() {
                                    let _ = sink.close().await;
                                    return Ok(status);
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    _ = tokio::time::sleep(STREAM_IDLE_TICK) => {
                        if interrupt.is_triggered() && !cancel_sent {
                            cancel_sent = true;
                            let cancel_url = cancel_url.clone();
                            std::thread::spawn(move || {
                                let _ = reqwest::blocking::Client::new()
                                    .post(cancel_url)
                                    .timeout(Duration::from_secs(5))
                                    .send();
                            });
                        }
                    }
                }
            }
        })
    }
}
