use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::signaling::roster::PeerId;

/// A request as received by the [FakeSignalingServer]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    /// path including the query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    /// the path without the query string, e.g. `/wait`
    pub fn endpoint(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.path.split_once('?')?;
        query.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub pragma: Option<PeerId>,
    pub body: String,
    /// delay between receiving the request and sending the response
    pub delay: Duration,
}

impl ScriptedResponse {
    pub fn ok(body: &str) -> ScriptedResponse {
        Self::status(200).with_body(body)
    }

    pub fn status(status: u16) -> ScriptedResponse {
        ScriptedResponse {
            status,
            pragma: None,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_body(mut self, body: &str) -> ScriptedResponse {
        self.body = body.to_string();
        self
    }

    pub fn with_pragma(mut self, id: PeerId) -> ScriptedResponse {
        self.pragma = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> ScriptedResponse {
        self.delay = delay;
        self
    }

    fn encode(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            204 => "No Content",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Unknown",
        };

        let mut result = format!("HTTP/1.0 {} {}\r\n", self.status, reason);
        if let Some(pragma) = self.pragma {
            result.push_str(&format!("Pragma: {}\r\n", pragma));
        }
        result.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()));
        result.push_str(&self.body);
        result.into_bytes()
    }
}

struct FakeServerState {
    self_id: PeerId,
    roster: String,
    requests: Mutex<Vec<RecordedRequest>>,
    request_added: Notify,
    scripted: Mutex<FxHashMap<String, VecDeque<ScriptedResponse>>>,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedResponse>>,
}

impl FakeServerState {
    fn requests(&self) -> MutexGuard<Vec<RecordedRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_scripted(&self, endpoint: &str) -> Option<ScriptedResponse> {
        self.scripted.lock().unwrap_or_else(PoisonError::into_inner)
            .get_mut(endpoint)
            .and_then(|responses| responses.pop_front())
    }
}

/// An HTTP/1.0 signaling server on localhost for tests.
///
/// By default, sign-in succeeds with the configured peer id and roster, `/wait` long polls are
///  answered from notifications pushed through [FakeSignalingServer::push_notification], and all
///  other requests are answered with an empty 200. Responses for specific endpoints can be
///  scripted with [FakeSignalingServer::script], including for `/wait`; scripted responses take
///  precedence and are used once each.
pub struct FakeSignalingServer {
    addr: SocketAddr,
    state: Arc<FakeServerState>,
    notification_sender: mpsc::UnboundedSender<ScriptedResponse>,
    accept_loop: JoinHandle<()>,
}

impl FakeSignalingServer {
    pub async fn start(self_id: PeerId, roster: &str) -> anyhow::Result<FakeSignalingServer> {
        Self::start_on("127.0.0.1:0".parse()?, self_id, roster).await
    }

    pub async fn start_on(addr: SocketAddr, self_id: PeerId, roster: &str) -> anyhow::Result<FakeSignalingServer> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        debug!("fake signaling server listening on {}", addr);

        let (notification_sender, notification_receiver) = mpsc::unbounded_channel();
        let state = Arc::new(FakeServerState {
            self_id,
            roster: roster.to_string(),
            requests: Default::default(),
            request_added: Notify::new(),
            scripted: Default::default(),
            notifications: tokio::sync::Mutex::new(notification_receiver),
        });

        let accept_loop = tokio::spawn(accept_connections(listener, state.clone()));

        Ok(FakeSignalingServer {
            addr,
            state,
            notification_sender,
            accept_loop,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn script(&self, endpoint: &str, response: ScriptedResponse) {
        self.state.scripted.lock().unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_notification(&self, response: ScriptedResponse) {
        let _ = self.notification_sender.send(response);
    }

    /// a message from another peer, delivered through the long poll
    pub fn push_message(&self, from: PeerId, message: &str) {
        self.push_notification(ScriptedResponse::ok(message).with_pragma(from));
    }

    /// a roster change, delivered through the long poll
    pub fn push_roster_update(&self, name: &str, id: PeerId, connected: bool) {
        let line = format!("{},{},{}", name, id, if connected { 1 } else { 0 });
        self.push_notification(ScriptedResponse::ok(&line).with_pragma(self.state.self_id));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests().clone()
    }

    pub fn requests_to(&self, endpoint: &str) -> Vec<RecordedRequest> {
        self.state.requests().iter()
            .filter(|r| r.endpoint() == endpoint)
            .cloned()
            .collect()
    }

    /// waits until at least `count` requests to `endpoint` were received, panicking after 30
    ///  seconds
    pub async fn wait_for_requests(&self, endpoint: &str, count: usize) -> Vec<RecordedRequest> {
        let result = timeout(Duration::from_secs(30), async {
            loop {
                let notified = self.state.request_added.notified();
                let requests = self.requests_to(endpoint);
                if requests.len() >= count {
                    return requests;
                }
                notified.await;
            }
        }).await;

        match result {
            Ok(requests) => requests,
            Err(_) => panic!("expected {} requests to {}, got {:?}", count, endpoint, self.requests()),
        }
    }
}

impl Drop for FakeSignalingServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_connections(listener: TcpListener, state: Arc<FakeServerState>) {
    // aborting the accept loop drops the connection tasks with it
    let mut connections = JoinSet::new();
    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => { connections.spawn(handle_connection(stream, state.clone())); }
                Err(e) => debug!("fake signaling server: accept failed: {}", e),
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<FakeServerState>) {
    let request = match read_request(&mut stream).await {
        Some(request) => request,
        None => return,
    };
    trace!("fake signaling server: {} {}", request.method, request.path);

    let endpoint = request.endpoint().to_string();
    state.requests().push(request);
    state.request_added.notify_waiters();

    let response = match state.next_scripted(&endpoint) {
        Some(response) => response,
        None => match endpoint.as_str() {
            "/sign_in" => ScriptedResponse::ok(&state.roster).with_pragma(state.self_id),
            "/wait" => match wait_for_notification(&mut stream, &state).await {
                Some(response) => response,
                None => return,
            },
            _ => ScriptedResponse::status(200),
        },
    };

    if !response.delay.is_zero() {
        sleep(response.delay).await;
    }
    let _ = stream.write_all(&response.encode()).await;
    let _ = stream.shutdown().await;
}

/// returns `None` if the client closed the connection before a notification was available
async fn wait_for_notification(stream: &mut TcpStream, state: &FakeServerState) -> Option<ScriptedResponse> {
    let mut notifications = state.notifications.lock().await;
    let mut probe = [0u8; 1];
    select! {
        biased;
        _ = stream.read(&mut probe) => None,
        notification = notifications.recv() => notification,
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect::<Vec<_>>();

    let content_length = headers.iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&buf[body_start..body_start + content_length]).to_string(),
    })
}
