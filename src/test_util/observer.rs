use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::signaling::roster::PeerId;
use crate::signaling::signaling_events::{SignalingEvent, SignalingObserver};

/// Records every callback as a [SignalingEvent] so tests can assert on them in order
#[derive(Default)]
pub struct TrackingObserver {
    events: Mutex<VecDeque<SignalingEvent>>,
    event_added: Notify,
}

impl TrackingObserver {
    pub fn new() -> TrackingObserver {
        Default::default()
    }

    fn events(&self) -> MutexGuard<VecDeque<SignalingEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: SignalingEvent) {
        self.events().push_back(event);
        self.event_added.notify_one();
    }

    /// waits for the next event, panicking if none arrives within 30 seconds
    pub async fn next_event(&self) -> SignalingEvent {
        let result = timeout(Duration::from_secs(30), async {
            loop {
                if let Some(event) = self.events().pop_front() {
                    return event;
                }
                self.event_added.notified().await;
            }
        }).await;

        match result {
            Ok(event) => event,
            Err(_) => panic!("no event was received"),
        }
    }

    pub async fn assert_event(&self, expected: SignalingEvent) {
        assert_eq!(self.next_event().await, expected);
    }

    pub fn assert_no_remaining_events(&self) {
        let events = self.events();
        assert!(events.is_empty(), "unexpected events: {:?}", *events);
    }
}

impl SignalingObserver for TrackingObserver {
    fn on_signed_in(&self) {
        self.record(SignalingEvent::SignedIn);
    }

    fn on_disconnected(&self) {
        self.record(SignalingEvent::Disconnected);
    }

    fn on_peer_connected(&self, id: PeerId, name: &str) {
        self.record(SignalingEvent::PeerConnected { id, name: name.to_string() });
    }

    fn on_peer_disconnected(&self, id: PeerId) {
        self.record(SignalingEvent::PeerDisconnected { id });
    }

    fn on_message_from_peer(&self, id: PeerId, message: &str) {
        self.record(SignalingEvent::MessageFromPeer { id, message: message.to_string() });
    }

    fn on_message_sent(&self, status: u16) {
        self.record(SignalingEvent::MessageSent { status });
    }

    fn on_server_connection_failure(&self) {
        self.record(SignalingEvent::ServerConnectionFailure);
    }

    fn on_peer_hang_up(&self, id: PeerId) {
        self.record(SignalingEvent::PeerHangUp { id });
    }
}
