use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, trace, warn};

use crate::http::channel::{Channel, ChannelSettings};
use crate::http::connector::{Connector, ServerTarget};
use crate::http::http_codec::{HttpRequest, HttpResponse, RequestEncoder};
use crate::http::http_error::ChannelError;
use crate::http::ordered_queue::{OrderedRequestQueue, PendingResponse};
use crate::signaling::roster::{parse_entry, PeerId, PeerRecord, Roster, RosterEvent, NO_PEER_ID};
use crate::signaling::signaling_config::SignalingConfig;
use crate::signaling::signaling_events::{ObserverList, SignalingEvent, SignalingObserver, HANG_UP_MESSAGE};
use crate::signaling::status_policy::StatusClass;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    NotConnected,
    Resolving,
    SigningIn,
    Connected,
    /// sign-out was requested while control requests were in flight; it is sent once they completed
    SigningOutWaiting,
    SigningOut,
}

/// the session's state as last published by its driver task
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub self_id: PeerId,
    pub name: String,
    pub peers: Vec<PeerRecord>,
}

impl SessionSnapshot {
    fn new() -> SessionSnapshot {
        SessionSnapshot {
            state: SessionState::NotConnected,
            self_id: NO_PEER_ID,
            name: String::new(),
            peers: Vec::new(),
        }
    }
}

pub enum Command {
    RegisterObserver(Arc<dyn SignalingObserver>),
    SignIn { server: String, port: u16, name: String },
    SendToPeer { peer_id: PeerId, message: String },
    SendHangUp { peer_id: PeerId },
    UpdateCapacity { value: i32 },
    SignOut,
    /// finish outstanding control requests and terminate the driver
    Shutdown,
}

/// what a request on the control channel was for, i.e. how to handle its response
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ControlRequest {
    SignIn,
    Message { peer_id: PeerId, hang_up: bool },
    Capacity,
    SignOut,
}

pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub driver: JoinHandle<()>,
}

/// Starts a session's driver task. The session lives until [Command::Shutdown] is sent or the
///  command sender is dropped.
pub fn spawn_session(config: Arc<SignalingConfig>, connector: Arc<dyn Connector>, observers: ObserverList) -> SessionHandle {
    let (commands, command_receiver) = mpsc::unbounded_channel();
    let (snapshot_sender, snapshot) = watch::channel(SessionSnapshot::new());

    let session = Session::new(config, connector, observers, snapshot_sender);
    let driver = tokio::spawn(session.run(command_receiver));

    SessionHandle {
        commands,
        snapshot,
        driver,
    }
}

/// The signaling state machine. It is owned by a single driver task that reacts to commands,
///  responses and timers one at a time, so none of its state needs synchronization.
struct Session {
    config: Arc<SignalingConfig>,
    connector: Arc<dyn Connector>,
    observers: ObserverList,
    snapshot: watch::Sender<SessionSnapshot>,

    state: SessionState,
    self_id: PeerId,
    name: String,
    target: Option<ServerTarget>,
    roster: Roster,

    control: Option<OrderedRequestQueue>,
    notification: Option<OrderedRequestQueue>,
    heartbeat: Option<OrderedRequestQueue>,

    pending_control: VecDeque<(ControlRequest, PendingResponse)>,
    pending_poll: Option<PendingResponse>,
    pending_heartbeat: Option<PendingResponse>,
    heartbeat_timer: Option<Interval>,
    resolving: Option<JoinHandle<io::Result<Vec<SocketAddr>>>>,
    connect_retry: Option<Pin<Box<Sleep>>>,
    has_retried_connect: bool,
    sign_out_pending: bool,
}

impl Session {
    fn new(config: Arc<SignalingConfig>, connector: Arc<dyn Connector>, observers: ObserverList, snapshot: watch::Sender<SessionSnapshot>) -> Session {
        Session {
            config,
            connector,
            observers,
            snapshot,
            state: SessionState::NotConnected,
            self_id: NO_PEER_ID,
            name: String::new(),
            target: None,
            roster: Roster::new(),
            control: None,
            notification: None,
            heartbeat: None,
            pending_control: VecDeque::new(),
            pending_poll: None,
            pending_heartbeat: None,
            heartbeat_timer: None,
            resolving: None,
            connect_retry: None,
            has_retried_connect: false,
            sign_out_pending: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                result = front_response(&mut self.pending_control) => self.on_control_completed(result),
                result = optional_response(&mut self.pending_poll) => {
                    self.pending_poll = None;
                    self.on_poll_response(result);
                }
                result = optional_response(&mut self.pending_heartbeat) => {
                    self.pending_heartbeat = None;
                    self.on_heartbeat_response(result);
                }
                _ = optional_tick(&mut self.heartbeat_timer) => self.on_heartbeat_tick(),
                resolved = optional_join(&mut self.resolving) => {
                    self.resolving = None;
                    self.on_resolved(resolved);
                }
                _ = optional_sleep(&mut self.connect_retry) => {
                    self.connect_retry = None;
                    self.on_connect_retry();
                }
            }
        }

        debug!("session driver shutting down with {} pending control request(s)", self.pending_control.len());
        while !self.pending_control.is_empty() {
            let result = front_response(&mut self.pending_control).await;
            self.on_control_completed(result);
        }
        self.close_all();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::RegisterObserver(observer) => self.observers.register(observer),
            Command::SignIn { server, port, name } => self.sign_in(&server, port, &name),
            Command::SendToPeer { peer_id, message } => self.send_message(peer_id, message, false),
            Command::SendHangUp { peer_id } => self.send_message(peer_id, HANG_UP_MESSAGE.to_string(), true),
            Command::UpdateCapacity { value } => self.update_capacity(value),
            Command::SignOut => self.sign_out(),
            Command::Shutdown => {}
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            self_id: self.self_id,
            name: self.name.clone(),
            peers: self.roster.peers().to_vec(),
        });
    }

    fn notify(&self, event: SignalingEvent) {
        self.publish();
        self.observers.notify(&event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    //---------------------------------- sign in

    fn sign_in(&mut self, server: &str, port: u16, name: &str) {
        if self.state != SessionState::NotConnected {
            warn!("sign-in requested in state {:?} - ignoring", self.state);
            self.notify(SignalingEvent::ServerConnectionFailure);
            return;
        }

        let (host, secure) = match server.strip_prefix("https://") {
            Some(rest) => (rest, true),
            None => (server.strip_prefix("http://").unwrap_or(server), false),
        };
        let host = host.trim_end_matches('/');

        if host.is_empty() || name.is_empty() || port == 0 {
            warn!("invalid sign-in parameters: server {:?}, port {}, name {:?}", server, port, name);
            self.notify(SignalingEvent::ServerConnectionFailure);
            return;
        }

        self.name = name.replace(' ', "-");
        self.has_retried_connect = false;

        let addrs = host.parse::<IpAddr>().ok()
            .map(|ip| vec![SocketAddr::new(ip, port)])
            .unwrap_or_default();
        let needs_resolution = addrs.is_empty() && self.config.proxy.is_none();
        self.target = Some(ServerTarget {
            host: host.to_string(),
            port,
            secure,
            addrs,
        });

        if !needs_resolution {
            self.do_connect();
        }
        else {
            let authority = format!("{}:{}", host, port);
            debug!("resolving {}", authority);
            self.resolving = Some(tokio::spawn(async move {
                tokio::net::lookup_host(authority).await
                    .map(|addrs| addrs.collect())
            }));
            self.set_state(SessionState::Resolving);
        }
    }

    fn on_resolved(&mut self, resolved: Result<io::Result<Vec<SocketAddr>>, tokio::task::JoinError>) {
        if self.state != SessionState::Resolving {
            return;
        }

        let addrs = match resolved {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                warn!("{}", ChannelError::Resolve(e.to_string()));
                Vec::new()
            }
            Err(e) => {
                warn!("{}", ChannelError::Resolve(e.to_string()));
                Vec::new()
            }
        };

        if addrs.is_empty() {
            self.connection_failure();
            return;
        }
        if let Some(target) = self.target.as_mut() {
            debug!("resolved {} to {:?}", target.host, addrs);
            target.addrs = addrs;
        }
        self.do_connect();
    }

    fn do_connect(&mut self) {
        let control = match self.open_channel("control", self.config.request_timeout, true) {
            Some(queue) => queue,
            None => {
                error!("no server target to connect to");
                self.connection_failure();
                return;
            }
        };

        info!("signing in as {:?} at {}", self.name, self.target.as_ref().map(|t| t.to_string()).unwrap_or_default());
        let request = HttpRequest::get(format!("/sign_in?peer_name={}", self.name));
        self.pending_control.push_back((ControlRequest::SignIn, control.submit(request)));
        self.control = Some(control);
        self.set_state(SessionState::SigningIn);
    }

    fn on_connect_retry(&mut self) {
        if self.state == SessionState::SigningIn {
            info!("retrying initial connect");
            self.do_connect();
        }
    }

    fn on_sign_in_response(&mut self, result: Result<HttpResponse, ChannelError>) {
        if !matches!(self.state, SessionState::SigningIn | SessionState::SigningOutWaiting) {
            debug!("ignoring sign-in response in state {:?}", self.state);
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(ChannelError::Cancelled) => return,
            Err(e) if e.is_connect_failure() && !self.has_retried_connect && self.state == SessionState::SigningIn => {
                warn!("initial connect failed: {} - retrying in {:?}", e, self.config.reconnect_delay);
                self.has_retried_connect = true;
                self.control = None;
                self.connect_retry = Some(Box::pin(sleep(self.config.reconnect_delay)));
                return;
            }
            Err(e) => {
                error!("sign-in failed: {}", e);
                self.connection_failure();
                return;
            }
        };

        if self.config.status_policy.classify_control(response.status) != StatusClass::Success {
            error!("sign-in rejected by the server with status {}", response.status);
            self.connection_failure();
            return;
        }

        let self_id = match response.pragma_id() {
            Some(id) if id != NO_PEER_ID => id,
            _ => {
                error!("sign-in response does not contain a peer id");
                self.connection_failure();
                return;
            }
        };

        self.self_id = self_id;
        info!("signed in with peer id {}", self_id);
        let roster_events = self.roster.apply_initial_list(&response.body_text(), self_id);

        if self.state == SessionState::SigningIn {
            self.set_state(SessionState::Connected);
        }
        for event in roster_events {
            self.notify_roster_event(event);
        }
        self.notify(SignalingEvent::SignedIn);

        if self.state == SessionState::Connected {
            self.start_notification();
            self.start_heartbeat();
        }
    }

    fn connection_failure(&mut self) {
        self.close_all();
        self.notify(SignalingEvent::ServerConnectionFailure);
    }

    //---------------------------------- steady state

    fn open_channel(&self, name: &'static str, response_timeout: Duration, with_transient_retries: bool) -> Option<OrderedRequestQueue> {
        let target = self.target.clone()?;

        let encoder = RequestEncoder::new(target.authority())
            .with_authorization(self.config.authorization.clone())
            .with_absolute_uri_prefix(self.connector.absolute_uri_prefix(&target));
        let settings = ChannelSettings {
            response_timeout: Some(response_timeout),
            max_response_size: self.config.max_response_size,
            transient_statuses: if with_transient_retries { self.config.status_policy.transient.clone() } else { FxHashSet::default() },
            transient_retry_limit: self.config.transient_retry_limit,
            transient_retry_initial_delay: self.config.transient_retry_initial_delay,
            transient_retry_max_delay: self.config.transient_retry_max_delay,
        };

        let channel = Channel::new(name, target, self.connector.clone(), encoder, settings);
        Some(OrderedRequestQueue::new(name, Arc::new(channel)))
    }

    fn start_notification(&mut self) {
        self.notification = self.open_channel("notification", self.config.long_poll_timeout, true);
        self.issue_poll();
    }

    fn issue_poll(&mut self) {
        if let Some(notification) = &self.notification {
            trace!("issuing long poll");
            self.pending_poll = Some(notification.submit(HttpRequest::get(format!("/wait?peer_id={}", self.self_id))));
        }
    }

    fn on_poll_response(&mut self, result: Result<HttpResponse, ChannelError>) {
        if !matches!(self.state, SessionState::Connected | SessionState::SigningOutWaiting) {
            return;
        }

        match result {
            Ok(response) => match self.config.status_policy.classify(response.status) {
                StatusClass::Success => {
                    if !self.on_notification(response) {
                        return;
                    }
                }
                StatusClass::Idle | StatusClass::Transient => {
                    trace!("long poll returned {} without news", response.status);
                }
                StatusClass::Fatal => {
                    error!("long poll failed with status {}", response.status);
                    self.fatal_fault();
                    return;
                }
            },
            Err(ChannelError::Cancelled) => return,
            Err(ChannelError::TimedOut) => {
                debug!("long poll timed out - reissuing");
            }
            Err(e) => {
                error!("long poll failed: {}", e);
                self.fatal_fault();
                return;
            }
        }

        self.issue_poll();
    }

    /// returns false if the notification was malformed and the session was torn down
    fn on_notification(&mut self, response: HttpResponse) -> bool {
        let sender = match response.pragma_id() {
            Some(id) => id,
            None => {
                error!("notification without a sender id");
                self.fatal_fault();
                return false;
            }
        };
        let body = response.body_text();

        if sender == self.self_id {
            let line = body.trim_end_matches(['\r', '\n']);
            match parse_entry(line) {
                Some(entry) => {
                    if let Some(event) = self.roster.apply_delta(entry, self.self_id) {
                        self.notify_roster_event(event);
                    }
                }
                None => warn!("skipping malformed roster notification {:?}", line),
            }
        }
        else if body == HANG_UP_MESSAGE {
            debug!("peer {} hung up", sender);
            self.notify(SignalingEvent::PeerHangUp { id: sender });
        }
        else {
            self.notify(SignalingEvent::MessageFromPeer { id: sender, message: body.into_owned() });
        }
        true
    }

    fn notify_roster_event(&self, event: RosterEvent) {
        match event {
            RosterEvent::Joined(peer) => self.notify(SignalingEvent::PeerConnected { id: peer.id, name: peer.name }),
            RosterEvent::Left(id) => self.notify(SignalingEvent::PeerDisconnected { id }),
        }
    }

    fn send_message(&mut self, peer_id: PeerId, message: String, hang_up: bool) {
        if self.state != SessionState::Connected || peer_id == NO_PEER_ID {
            warn!("not sending message to peer {} in state {:?}", peer_id, self.state);
            return;
        }

        let request = HttpRequest::post(format!("/message?peer_id={}&to={}", self.self_id, peer_id), "text/plain", message);
        self.submit_control(ControlRequest::Message { peer_id, hang_up }, request);
    }

    fn on_message_response(&mut self, peer_id: PeerId, hang_up: bool, result: Result<HttpResponse, ChannelError>) {
        match result {
            Ok(response) => {
                debug!("{} to peer {} answered with {}", if hang_up { "hang-up" } else { "message" }, peer_id, response.status);
                self.notify(SignalingEvent::MessageSent { status: response.status });
                if self.config.status_policy.classify_control(response.status) != StatusClass::Success {
                    error!("sending to peer {} failed with status {}", peer_id, response.status);
                    self.fatal_fault();
                }
            }
            Err(ChannelError::Cancelled) => {}
            Err(e) => {
                error!("sending to peer {} failed: {}", peer_id, e);
                self.fatal_fault();
            }
        }
    }

    fn update_capacity(&mut self, value: i32) {
        if self.state != SessionState::Connected {
            warn!("not updating capacity in state {:?}", self.state);
            return;
        }
        let request = HttpRequest::put(format!("/capacity?peer_id={}&value={}", self.self_id, value));
        self.submit_control(ControlRequest::Capacity, request);
    }

    fn submit_control(&mut self, kind: ControlRequest, request: HttpRequest) {
        match &self.control {
            Some(control) => {
                let response = control.submit(request);
                trace!("{} control request(s) pending", control.pending_count());
                self.pending_control.push_back((kind, response));
            }
            None => error!("no control channel for {:?}", kind),
        }
    }

    fn on_control_completed(&mut self, result: Result<HttpResponse, ChannelError>) {
        let kind = match self.pending_control.pop_front() {
            Some((kind, _)) => kind,
            None => return,
        };

        match kind {
            ControlRequest::SignIn => self.on_sign_in_response(result),
            ControlRequest::Message { peer_id, hang_up } => self.on_message_response(peer_id, hang_up, result),
            ControlRequest::Capacity => match result {
                Ok(response) if response.status == 200 => debug!("capacity updated"),
                Ok(response) => warn!("capacity update failed with status {}", response.status),
                Err(e) => warn!("capacity update failed: {}", e),
            },
            ControlRequest::SignOut => self.on_sign_out_response(result),
        }

        if self.sign_out_pending && self.pending_control.is_empty() && self.state == SessionState::SigningOutWaiting {
            self.sign_out_pending = false;
            self.do_sign_out();
        }
    }

    //---------------------------------- heartbeat

    fn start_heartbeat(&mut self) {
        if let Some(period) = self.config.heartbeat_interval {
            debug!("starting heartbeat every {:?}", period);
            self.heartbeat = self.open_channel("heartbeat", self.config.request_timeout, false);
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat_timer = Some(timer);
        }
    }

    fn on_heartbeat_tick(&mut self) {
        if self.pending_heartbeat.is_some() {
            debug!("previous heartbeat still in flight - skipping");
            return;
        }
        if let Some(heartbeat) = &self.heartbeat {
            trace!("sending heartbeat");
            self.pending_heartbeat = Some(heartbeat.submit(HttpRequest::get(format!("/heartbeat?peer_id={}", self.self_id))));
        }
    }

    fn on_heartbeat_response(&mut self, result: Result<HttpResponse, ChannelError>) {
        match result {
            Ok(response) if response.status == 200 => trace!("heartbeat acknowledged"),
            Ok(response) => warn!("heartbeat failed with status {}", response.status),
            Err(ChannelError::Cancelled) => {}
            Err(e) => warn!("heartbeat failed: {} - retrying with the next heartbeat", e),
        }
    }

    //---------------------------------- sign out and teardown

    fn sign_out(&mut self) {
        match self.state {
            SessionState::NotConnected | SessionState::SigningOut | SessionState::SigningOutWaiting => {
                debug!("sign-out requested in state {:?} - nothing to do", self.state);
                return;
            }
            SessionState::Resolving => {
                info!("sign-out during address resolution - aborting sign-in");
                self.close_all();
                return;
            }
            SessionState::SigningIn | SessionState::Connected => {}
        }

        if self.connect_retry.is_some() {
            info!("sign-out while waiting to retry the connect - aborting sign-in");
            self.close_all();
            return;
        }

        if !self.pending_control.is_empty() {
            debug!("control channel busy - signing out once it drained");
            self.sign_out_pending = true;
            self.set_state(SessionState::SigningOutWaiting);
            return;
        }

        self.do_sign_out();
    }

    fn do_sign_out(&mut self) {
        if self.self_id == NO_PEER_ID {
            debug!("no peer id assigned - resetting without sign-out request");
            self.close_all();
            return;
        }

        info!("signing out peer {}", self.self_id);
        self.close_notification_and_heartbeat();
        self.submit_control(ControlRequest::SignOut, HttpRequest::get(format!("/sign_out?peer_id={}", self.self_id)));
        self.set_state(SessionState::SigningOut);
    }

    fn on_sign_out_response(&mut self, result: Result<HttpResponse, ChannelError>) {
        match result {
            Ok(response) if response.status == 200 => debug!("signed out"),
            Ok(response) => warn!("sign-out answered with status {}", response.status),
            Err(e) => warn!("sign-out failed: {}", e),
        }
        self.close_all();
        self.notify(SignalingEvent::Disconnected);
    }

    fn fatal_fault(&mut self) {
        self.close_all();
        self.notify(SignalingEvent::Disconnected);
    }

    fn close_notification_and_heartbeat(&mut self) {
        for queue in [self.notification.take(), self.heartbeat.take()].into_iter().flatten() {
            queue.cancel_all();
        }
        self.pending_poll = None;
        self.pending_heartbeat = None;
        self.heartbeat_timer = None;
    }

    /// closes all channels and returns to the initial state without notifying anybody
    fn close_all(&mut self) {
        self.close_notification_and_heartbeat();
        if let Some(control) = self.control.take() {
            control.cancel_all();
        }
        self.pending_control.clear();

        if let Some(resolving) = self.resolving.take() {
            resolving.abort();
        }
        self.connect_retry = None;
        self.sign_out_pending = false;

        self.roster.clear();
        self.self_id = NO_PEER_ID;
        self.set_state(SessionState::NotConnected);
    }
}

async fn front_response(pending: &mut VecDeque<(ControlRequest, PendingResponse)>) -> Result<HttpResponse, ChannelError> {
    match pending.front_mut() {
        Some((_, response)) => response.await,
        None => std::future::pending().await,
    }
}

async fn optional_response(pending: &mut Option<PendingResponse>) -> Result<HttpResponse, ChannelError> {
    match pending {
        Some(response) => response.await,
        None => std::future::pending().await,
    }
}

async fn optional_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => { timer.tick().await; }
        None => std::future::pending().await,
    }
}

async fn optional_join<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn optional_sleep(delay: &mut Option<Pin<Box<Sleep>>>) {
    match delay {
        Some(delay) => delay.await,
        None => std::future::pending().await,
    }
}
