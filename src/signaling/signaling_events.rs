use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::signaling::roster::PeerId;

/// The outward-facing callbacks of a signaling session. All callbacks of a session are invoked
///  from the session's driver task, one at a time, in the order the underlying events happened.
///
/// Implementations must not block: the session does not make progress while a callback runs.
#[cfg_attr(test, automock)]
pub trait SignalingObserver: Send + Sync + 'static {
    fn on_signed_in(&self);
    fn on_disconnected(&self);
    fn on_peer_connected(&self, id: PeerId, name: &str);
    fn on_peer_disconnected(&self, id: PeerId);
    fn on_message_from_peer(&self, id: PeerId, message: &str);
    fn on_message_sent(&self, status: u16);
    fn on_server_connection_failure(&self);

    /// A peer sent the hang-up message. Observers that do not distinguish hang-ups from other
    ///  messages see it as the message `BYE`.
    fn on_peer_hang_up(&self, id: PeerId) {
        self.on_message_from_peer(id, HANG_UP_MESSAGE);
    }
}

/// the body of a hang-up message
pub const HANG_UP_MESSAGE: &str = "BYE";

/// Registered observers, notified in registration order
#[derive(Default, Clone)]
pub struct ObserverList {
    observers: Vec<Arc<dyn SignalingObserver>>,
}

impl ObserverList {
    pub fn new() -> ObserverList {
        Default::default()
    }

    pub fn register(&mut self, observer: Arc<dyn SignalingObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, event: &SignalingEvent) {
        trace!("event: {:?}", event);
        for observer in &self.observers {
            event.dispatch_to(observer.as_ref());
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignalingEvent {
    SignedIn,
    Disconnected,
    PeerConnected { id: PeerId, name: String },
    PeerDisconnected { id: PeerId },
    MessageFromPeer { id: PeerId, message: String },
    PeerHangUp { id: PeerId },
    MessageSent { status: u16 },
    ServerConnectionFailure,
}

impl SignalingEvent {
    pub fn dispatch_to(&self, observer: &dyn SignalingObserver) {
        match self {
            SignalingEvent::SignedIn => observer.on_signed_in(),
            SignalingEvent::Disconnected => observer.on_disconnected(),
            SignalingEvent::PeerConnected { id, name } => observer.on_peer_connected(*id, name),
            SignalingEvent::PeerDisconnected { id } => observer.on_peer_disconnected(*id),
            SignalingEvent::MessageFromPeer { id, message } => observer.on_message_from_peer(*id, message),
            SignalingEvent::PeerHangUp { id } => observer.on_peer_hang_up(*id),
            SignalingEvent::MessageSent { status } => observer.on_message_sent(*status),
            SignalingEvent::ServerConnectionFailure => observer.on_server_connection_failure(),
        }
    }
}

/// Re-publishes a session's callbacks as a stream of [SignalingEvent]s for any number of
///  subscribers. Subscribers that fall behind by more than the channel capacity lose events.
pub struct SignalingEventNotifier {
    sender: broadcast::Sender<SignalingEvent>,
}

impl SignalingEventNotifier {
    pub fn new() -> SignalingEventNotifier {
        let (sender, _) = broadcast::channel(128);

        SignalingEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SignalingEvent) {
        let _ = self.sender.send(event);
    }
}

impl SignalingObserver for SignalingEventNotifier {
    fn on_signed_in(&self) {
        self.send_event(SignalingEvent::SignedIn);
    }

    fn on_disconnected(&self) {
        self.send_event(SignalingEvent::Disconnected);
    }

    fn on_peer_connected(&self, id: PeerId, name: &str) {
        self.send_event(SignalingEvent::PeerConnected { id, name: name.to_string() });
    }

    fn on_peer_disconnected(&self, id: PeerId) {
        self.send_event(SignalingEvent::PeerDisconnected { id });
    }

    fn on_message_from_peer(&self, id: PeerId, message: &str) {
        self.send_event(SignalingEvent::MessageFromPeer { id, message: message.to_string() });
    }

    fn on_message_sent(&self, status: u16) {
        self.send_event(SignalingEvent::MessageSent { status });
    }

    fn on_server_connection_failure(&self) {
        self.send_event(SignalingEvent::ServerConnectionFailure);
    }

    fn on_peer_hang_up(&self, id: PeerId) {
        self.send_event(SignalingEvent::PeerHangUp { id });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use mockall::Sequence;
    use super::*;

    /// only implements the required callbacks, relying on the default for hang-ups
    struct MessageRecorder {
        messages: Mutex<Vec<(PeerId, String)>>,
    }

    impl SignalingObserver for MessageRecorder {
        fn on_signed_in(&self) {}
        fn on_disconnected(&self) {}
        fn on_peer_connected(&self, _id: PeerId, _name: &str) {}
        fn on_peer_disconnected(&self, _id: PeerId) {}
        fn on_message_from_peer(&self, id: PeerId, message: &str) {
            self.messages.lock().unwrap().push((id, message.to_string()));
        }
        fn on_message_sent(&self, _status: u16) {}
        fn on_server_connection_failure(&self) {}
    }

    #[test]
    fn test_hang_up_defaults_to_bye_message() {
        let recorder = Arc::new(MessageRecorder { messages: Default::default() });
        let mut observers = ObserverList::new();
        observers.register(recorder.clone());

        observers.notify(&SignalingEvent::PeerHangUp { id: 2 });
        observers.notify(&SignalingEvent::MessageFromPeer { id: 2, message: "hello".to_string() });

        assert_eq!(*recorder.messages.lock().unwrap(), vec![
            (2, "BYE".to_string()),
            (2, "hello".to_string()),
        ]);
    }

    #[test]
    fn test_observers_notified_in_registration_order() {
        let mut seq = Sequence::new();

        let mut first = MockSignalingObserver::new();
        first.expect_on_peer_connected()
            .withf(|id, name| *id == 1 && name.to_string() == "alice")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let mut second = MockSignalingObserver::new();
        second.expect_on_peer_connected()
            .withf(|id, name| *id == 1 && name.to_string() == "alice")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut observers = ObserverList::new();
        observers.register(Arc::new(first));
        observers.register(Arc::new(second));
        assert_eq!(observers.len(), 2);

        observers.notify(&SignalingEvent::PeerConnected { id: 1, name: "alice".to_string() });
    }

    #[tokio::test]
    async fn test_notifier() {
        let notifier = SignalingEventNotifier::new();
        let mut subscriber = notifier.subscribe();

        SignalingEvent::SignedIn.dispatch_to(&notifier);
        SignalingEvent::PeerHangUp { id: 4 }.dispatch_to(&notifier);
        SignalingEvent::MessageSent { status: 200 }.dispatch_to(&notifier);

        assert_eq!(subscriber.recv().await.unwrap(), SignalingEvent::SignedIn);
        assert_eq!(subscriber.recv().await.unwrap(), SignalingEvent::PeerHangUp { id: 4 });
        assert_eq!(subscriber.recv().await.unwrap(), SignalingEvent::MessageSent { status: 200 });
    }
}
