use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fwbuild_core::{CoordinatorError, CoordinatorResult};

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative interrupt flag shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// HTTP calls that resolve promptly on a client-side interrupt even when the
/// coordinator does not respond: the blocking call runs on a side thread
/// while the caller polls for completion and the interrupt.
pub struct InterruptibleHttp {
    client: reqwest::blocking::Client,
    interrupt: Interrupt,
}

impl InterruptibleHttp {
    pub fn new(interrupt: Interrupt, timeout: Duration) -> CoordinatorResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| CoordinatorError::Http(error.to_string()))?;
        Ok(Self { client, interrupt })
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn get_json(&self, url: &str) -> CoordinatorResult<serde_json::Value> {
        let client = self.client.clone();
        let url = url.to_owned();
        self.run(move || {
            let response = client
                .get(&url)
                .send()
                .map_err(|error| CoordinatorError::Http(error.to_string()))?;
            decode_json(response)
        })
    }

    pub fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> CoordinatorResult<serde_json::Value> {
        let client = self.client.clone();
        let url = url.to_owned();
        self.run(move || {
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .map_err(|error| CoordinatorError::Http(error.to_string()))?;
            decode_json(response)
        })
    }

    fn run<T: Send + 'static>(
        &self,
        work: impl FnOnce() -> CoordinatorResult<T> + Send + 'static,
    ) -> CoordinatorResult<T> {
        let (tx, rx) = channel();
        std::thread::spawn(move || {
            let _ = tx.send(work());
        });

        loop {
            match rx.recv_timeout(COMPLETION_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if self.interrupt.is_triggered() {
                        // The side thread keeps running to its own timeout;
                        // the caller is already free.
                        return Err(CoordinatorError::OperationCancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CoordinatorError::Internal(
                        "http worker thread died".to_owned(),
                    ))
                }
            }
        }
    }
}

fn decode_json(response: reqwest::blocking::Response) -> CoordinatorResult<serde_json::Value> {
    let status = response.status();
    let value: serde_json::Value = response
        .json()
        .unwrap_or_else(|_| serde_json::Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        let message = value
            .get("error")
            .and_then(|error| error.as_str())
            .unwrap_or("request failed")
            .to_owned();
        Err(CoordinatorError::Http(format!("{status}: {message}")))
    }
}

/// Spin until `condition` holds or the deadline passes.
pub(crate) fn wait_until(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}
