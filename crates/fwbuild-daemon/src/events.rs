use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use fwbuild_core::{RequestId, RequestStatus};
use tokio::sync::broadcast;

const REQUEST_BUFFER_CAPACITY: usize = 256;
const GLOBAL_BUFFER_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Status {
        status: RequestStatus,
        detail: Option<String>,
    },
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEventEnvelope {
    pub request_id: RequestId,
    pub sequence: u64,
    pub event: RequestEvent,
}

/// Fan-out of request status and log lines to WebSocket subscribers: one
/// channel per request plus a global channel for log subscription.
#[derive(Debug)]
pub struct RequestEventBus {
    next_sequence: AtomicU64,
    request_senders: RwLock<HashMap<RequestId, broadcast::Sender<RequestEventEnvelope>>>,
    global_sender: broadcast::Sender<RequestEventEnvelope>,
}

impl Default for RequestEventBus {
    fn default() -> Self {
        let (global_sender, _) = broadcast::channel(GLOBAL_BUFFER_CAPACITY);
        Self {
            next_sequence: AtomicU64::new(0),
            request_senders: RwLock::new(HashMap::new()),
            global_sender,
        }
    }
}

impl RequestEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, request_id: RequestId) -> broadcast::Receiver<RequestEventEnvelope> {
        if let Some(sender) = self.request_sender(&request_id) {
            return sender.subscribe();
        }
        let mut senders = self
            .request_senders
            .write()
            .expect("event bus sender lock poisoned");
        let sender = senders.entry(request_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(REQUEST_BUFFER_CAPACITY);
            sender
        });
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<RequestEventEnvelope> {
        self.global_sender.subscribe()
    }

    pub fn publish(&self, request_id: RequestId, event: RequestEvent) -> RequestEventEnvelope {
        let envelope = RequestEventEnvelope {
            request_id,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1,
            event,
        };
        if let Some(sender) = self.request_sender(&envelope.request_id) {
            if sender.receiver_count() > 0 {
                let _ = sender.send(envelope.clone());
            }
        }
        if self.global_sender.receiver_count() > 0 {
            let _ = self.global_sender.send(envelope.clone());
        }
        envelope
    }

    pub fn remove(&self, request_id: &RequestId) -> bool {
        let mut senders = self
            .request_senders
            .write()
            .expect("event bus sender lock poisoned");
        senders.remove(request_id).is_some()
    }

    fn request_sender(
        &self,
        request_id: &RequestId,
    ) -> Option<broadcast::Sender<RequestEventEnvelope>> {
        let senders = self
            .request_senders
            .read()
            .expect("event bus sender lock poisoned");
        senders.get(request_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fwbuild_core::{RequestId, RequestStatus};
    use tokio::time::timeout;

    use super::{RequestEvent, RequestEventBus};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn request_subscribers_only_see_their_request() {
        let bus = RequestEventBus::new();
        let mut first = bus.subscribe(RequestId::new("req-a"));
        let mut second = bus.subscribe(RequestId::new("req-b"));

        let published_a = bus.publish(
            RequestId::new("req-a"),
            RequestEvent::Log("compiling".to_owned()),
        );
        let published_b = bus.publish(
            RequestId::new("req-b"),
            RequestEvent::Status {
                status: RequestStatus::Running,
                detail: None,
            },
        );

        let got_a = timeout(TEST_TIMEOUT, first.recv())
            .await
            .expect("first recv timed out")
            .expect("first recv");
        let got_b = timeout(TEST_TIMEOUT, second.recv())
            .await
            .expect("second recv timed out")
            .expect("second recv");
        assert_eq!(got_a, published_a);
        assert_eq!(got_b, published_b);
    }

    #[tokio::test]
    async fn global_subscribers_observe_every_request() {
        let bus = RequestEventBus::new();
        let mut global = bus.subscribe_all();

        bus.publish(RequestId::new("req-a"), RequestEvent::Log("one".to_owned()));
        bus.publish(RequestId::new("req-b"), RequestEvent::Log("two".to_owned()));

        let first = timeout(TEST_TIMEOUT, global.recv())
            .await
            .expect("recv timed out")
            .expect("recv one");
        let second = timeout(TEST_TIMEOUT, global.recv())
            .await
            .expect("recv timed out")
            .expect("recv two");
        assert_eq!(first.request_id, RequestId::new("req-a"));
        assert_eq!(second.request_id, RequestId::new("req-b"));
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn removing_a_request_closes_its_subscribers() {
        let bus = RequestEventBus::new();
        let mut subscriber = bus.subscribe(RequestId::new("req-done"));
        assert!(bus.remove(&RequestId::new("req-done")));
        assert!(!bus.remove(&RequestId::new("req-done")));

        let closed = timeout(TEST_TIMEOUT, subscriber.recv())
            .await
            .expect("recv timed out");
        assert!(closed.is_err());
    }
}
