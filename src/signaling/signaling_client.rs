use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::http::connector::{build_tls_config, Connector, TcpConnector};
use crate::signaling::roster::{PeerId, PeerRecord, NO_PEER_ID};
use crate::signaling::session::{spawn_session, Command, SessionSnapshot, SessionState};
use crate::signaling::signaling_config::SignalingConfig;
use crate::signaling::signaling_events::{ObserverList, SignalingEvent, SignalingEventNotifier, SignalingObserver};

/// Handle to a signaling session. All operations return immediately; outcomes are reported to
///  the registered observers (and to [SignalingClient::subscribe]rs) from the session's driver
///  task.
///
/// A client must be created inside a tokio runtime. Dropping it terminates the session without
///  signing out, see [SignalingClient::shutdown] for a graceful alternative.
pub struct SignalingClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    notifier: Arc<SignalingEventNotifier>,
    driver: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> anyhow::Result<SignalingClient> {
        config.validate()?;

        let tls_config = build_tls_config(config.tls_root_certificates.as_deref())?;
        let connector = TcpConnector::new(config.proxy_addr()?, tls_config, config.connect_timeout);
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: SignalingConfig, connector: Arc<dyn Connector>) -> anyhow::Result<SignalingClient> {
        config.validate()?;

        let notifier = Arc::new(SignalingEventNotifier::new());
        let mut observers = ObserverList::new();
        observers.register(notifier.clone());

        let shutdown_timeout = config.shutdown_timeout;
        let handle = spawn_session(Arc::new(config), connector, observers);

        Ok(SignalingClient {
            commands: handle.commands,
            snapshot: handle.snapshot,
            notifier,
            driver: Some(handle.driver),
            shutdown_timeout,
        })
    }

    fn send_command(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!("session driver is gone - ignoring command");
            return false;
        }
        true
    }

    /// Observers are notified in registration order. An observer registered while the session is
    ///  active receives only events from then on.
    pub fn register_observer(&self, observer: Arc<dyn SignalingObserver>) {
        self.send_command(Command::RegisterObserver(observer));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.notifier.subscribe()
    }

    /// `server` may carry an `http://` or `https://` scheme, the latter selecting TLS. Invalid
    ///  parameters or a session that is not signed out are reported as a server connection
    ///  failure.
    pub fn sign_in(&self, server: &str, port: u16, name: &str) {
        self.send_command(Command::SignIn {
            server: server.to_string(),
            port,
            name: name.to_string(),
        });
    }

    /// Returns `false` if the session is not signed in or the id is invalid. `true` means the
    ///  message was queued: the session may still drop it if it is no longer signed in by the time
    ///  the message is processed, in which case no [SignalingEvent::MessageSent] follows.
    pub fn send_to_peer(&self, peer_id: PeerId, message: &str) -> bool {
        if !self.is_connected() || peer_id == NO_PEER_ID {
            return false;
        }
        self.send_command(Command::SendToPeer { peer_id, message: message.to_string() })
    }

    /// like [SignalingClient::send_to_peer], `true` means queued
    pub fn send_hang_up(&self, peer_id: PeerId) -> bool {
        if !self.is_connected() || peer_id == NO_PEER_ID {
            return false;
        }
        self.send_command(Command::SendHangUp { peer_id })
    }

    /// reports this peer's capacity (e.g. the number of sessions it can still serve) to the server
    pub fn update_capacity(&self, value: i32) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_command(Command::UpdateCapacity { value })
    }

    /// Signing out is idempotent: calling it on a session that is not signed in has no effect. The
    ///  request is always handed to the session in order with previous calls, so a sign-out right
    ///  after [SignalingClient::sign_in] signs out once the sign-in completed.
    pub fn sign_out(&self) -> bool {
        self.send_command(Command::SignOut);
        true
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// the id assigned by the server, [NO_PEER_ID] if not signed in
    pub fn id(&self) -> PeerId {
        self.snapshot.borrow().self_id
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn name(&self) -> String {
        self.snapshot.borrow().name.clone()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.snapshot.borrow().peers.clone()
    }

    /// Signs out if necessary and waits for outstanding control requests to complete, bounded by
    ///  the configured shutdown timeout.
    pub async fn shutdown(mut self) {
        self.sign_out();
        self.send_command(Command::Shutdown);

        if let Some(mut driver) = self.driver.take() {
            match timeout(self.shutdown_timeout, &mut driver).await {
                Ok(_) => debug!("signaling session terminated"),
                Err(_) => {
                    warn!("signaling session did not terminate within {:?} - aborting", self.shutdown_timeout);
                    driver.abort();
                }
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
