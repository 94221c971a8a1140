use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rustc_hash::FxHashSet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::http::connector::{Connector, ServerTarget, SignalingStream};
use crate::http::http_codec::{try_parse_response, HttpRequest, HttpResponse, RequestEncoder};
use crate::http::http_error::ChannelError;
use crate::http::ordered_queue::RequestExecutor;
use crate::util::backoff::ExponentialBackoff;

#[derive(Clone, Debug)]
pub struct ChannelSettings {
    /// bound on a complete exchange including connect; `None` waits forever
    pub response_timeout: Option<Duration>,
    pub max_response_size: usize,
    /// statuses on which the channel closes its connection and reissues the same request
    pub transient_statuses: FxHashSet<u16>,
    pub transient_retry_limit: u32,
    pub transient_retry_initial_delay: Duration,
    pub transient_retry_max_delay: Duration,
}

/// One logical connection to the signaling server. HTTP/1.0 closes the connection after each
///  response, so every exchange connects, sends the request, reads until a full response is
///  buffered and closes again. The socket and its read buffer live for exactly one exchange.
///
/// Transient statuses are handled here rather than by the session so that a retried request keeps
///  its place in the channel's [crate::http::ordered_queue::OrderedRequestQueue].
pub struct Channel {
    name: &'static str,
    target: ServerTarget,
    connector: Arc<dyn Connector>,
    encoder: RequestEncoder,
    settings: ChannelSettings,
}

impl Channel {
    pub fn new(name: &'static str, target: ServerTarget, connector: Arc<dyn Connector>, encoder: RequestEncoder, settings: ChannelSettings) -> Channel {
        Channel {
            name,
            target,
            connector,
            encoder,
            settings,
        }
    }

    async fn exchange(&self, request: &HttpRequest) -> Result<HttpResponse, ChannelError> {
        trace!("{} channel: connecting to {}", self.name, self.target);
        let mut connection = Connection {
            channel_name: self.name,
            stream: self.connector.connect(&self.target).await?,
            read_buffer: BytesMut::with_capacity(4096),
        };

        let mut buf = BytesMut::new();
        self.encoder.encode(request, &mut buf);
        trace!("{} channel: sending {} bytes", self.name, buf.len());
        connection.send(&buf).await?;

        connection.read_response(self.settings.max_response_size).await
    }

    async fn exchange_with_timeout(&self, request: &HttpRequest) -> Result<HttpResponse, ChannelError> {
        match self.settings.response_timeout {
            Some(t) => timeout(t, self.exchange(request)).await
                .unwrap_or(Err(ChannelError::TimedOut)),
            None => self.exchange(request).await,
        }
    }
}

#[async_trait]
impl RequestExecutor for Channel {
    #[instrument(skip_all, fields(channel = self.name, path = %request.path))]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ChannelError> {
        let mut backoff = ExponentialBackoff::new(self.settings.transient_retry_initial_delay, self.settings.transient_retry_max_delay);

        loop {
            let response = self.exchange_with_timeout(&request).await?;
            if !self.settings.transient_statuses.contains(&response.status) {
                debug!("{} {} -> {}", request.method, request.path, response.status);
                return Ok(response);
            }

            if backoff.attempts() >= self.settings.transient_retry_limit {
                warn!("{} channel: status {} persists after {} reconnects - giving up", self.name, response.status, backoff.attempts());
                return Err(ChannelError::TransientRetriesExhausted(response.status));
            }

            let delay = backoff.next_delay();
            warn!("{} channel: transient status {} - reconnecting and reissuing the request in {:?}", self.name, response.status, delay);
            sleep(delay).await;
        }
    }
}

/// A socket with its read buffer, closed when dropped - after the response was read, or when the
///  exchange is abandoned because of a timeout or cancellation
struct Connection {
    channel_name: &'static str,
    stream: Box<dyn SignalingStream>,
    read_buffer: BytesMut,
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, max_response_size: usize) -> Result<HttpResponse, ChannelError> {
        let mut eof = false;
        loop {
            if let Some((response, consumed)) = try_parse_response(&self.read_buffer, eof, max_response_size)? {
                self.read_buffer.advance(consumed);
                if !self.read_buffer.is_empty() {
                    debug!("discarding {} bytes after the response", self.read_buffer.len());
                }
                return Ok(response);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            trace!("read {} bytes", n);
            eof = n == 0;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("{} channel: connection closed", self.channel_name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex;

    use super::*;

    /// hands out the server side of an in-memory stream for every connect, answering each request
    ///  with the next scripted response
    struct ScriptedConnector {
        responses: Mutex<Vec<&'static str>>,
        requests: Arc<Mutex<Vec<String>>>,
        num_connects: AtomicUsize,
        /// connections the client closed while the server was still holding the response
        num_abandoned: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn new(responses: Vec<&'static str>) -> ScriptedConnector {
            ScriptedConnector {
                responses: Mutex::new(responses),
                requests: Default::default(),
                num_connects: AtomicUsize::new(0),
                num_abandoned: Default::default(),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _target: &ServerTarget) -> Result<Box<dyn SignalingStream>, ChannelError> {
            self.num_connects.fetch_add(1, Ordering::AcqRel);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(ChannelError::from_connect_error(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)));
            }
            let response = responses.remove(0);

            let (client, server) = duplex(64*1024);
            tokio::spawn(serve_one(server, response, self.requests.clone(), self.num_abandoned.clone()));
            Ok(Box::new(client))
        }
    }

    async fn serve_one(mut server: DuplexStream, response: &'static str, requests: Arc<Mutex<Vec<String>>>, num_abandoned: Arc<AtomicUsize>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match server.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        requests.lock().await.push(String::from_utf8_lossy(&buf).to_string());
        if response == "hang" {
            while let Ok(n) = server.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
            }
            num_abandoned.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let _ = server.write_all(response.as_bytes()).await;
        // dropping the server half closes the connection
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            response_timeout: Some(Duration::from_secs(5)),
            max_response_size: 1024*1024,
            transient_statuses: [500].into_iter().collect(),
            transient_retry_limit: 3,
            transient_retry_initial_delay: Duration::from_millis(10),
            transient_retry_max_delay: Duration::from_millis(100),
        }
    }

    fn channel(connector: Arc<ScriptedConnector>) -> Channel {
        let target = ServerTarget { host: "localhost".to_string(), port: 8888, secure: false, addrs: vec![] };
        Channel::new("test", target, connector, RequestEncoder::new("localhost:8888"), settings())
    }

    #[tokio::test]
    async fn test_exchange() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 200 OK\r\nPragma: 3\r\nContent-Length: 9\r\n\r\nalice,1,1",
        ]));
        let channel = channel(connector.clone());

        let response = channel.execute(HttpRequest::get("/sign_in?peer_name=bob")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.pragma_id(), Some(3));
        assert_eq!(response.body_text(), "alice,1,1");

        let requests = connector.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("GET /sign_in?peer_name=bob HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn test_body_delimited_by_close() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 200 OK\r\nPragma: 2\r\n\r\nhello",
        ]));
        let response = channel(connector).execute(HttpRequest::get("/wait?peer_id=3")).await.unwrap();
        assert_eq!(response.body_text(), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_status_reissues_request() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
            "HTTP/1.0 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
            "HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n",
        ]));
        let channel = channel(connector.clone());

        let response = channel.execute(HttpRequest::get("/wait?peer_id=3")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(connector.num_connects.load(Ordering::Acquire), 3);

        let requests = connector.requests.lock().await;
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.starts_with("GET /wait?peer_id=3 ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_exhausted() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 500 Internal Server Error\r\n\r\n";
            5
        ]));
        match channel(connector.clone()).execute(HttpRequest::get("/wait?peer_id=3")).await {
            Err(ChannelError::TransientRetriesExhausted(500)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(connector.num_connects.load(Ordering::Acquire), 4);
    }

    #[tokio::test]
    async fn test_non_transient_status_is_returned() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
        ]));
        let response = channel(connector).execute(HttpRequest::get("/wait?peer_id=3")).await.unwrap();
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let result = channel(connector).execute(HttpRequest::get("/sign_in?peer_name=a")).await;
        assert!(matches!(result, Err(ChannelError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_truncated_response() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            "HTTP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nabc",
        ]));
        let result = channel(connector).execute(HttpRequest::get("/sign_in?peer_name=a")).await;
        assert!(matches!(result, Err(ChannelError::Protocol(crate::http::http_error::ProtocolError::Truncated))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let connector = Arc::new(ScriptedConnector::new(vec!["hang"]));

        let result = channel(connector.clone()).execute(HttpRequest::get("/wait?peer_id=1")).await;
        assert!(matches!(result, Err(ChannelError::TimedOut)));

        // the abandoned exchange releases its socket
        while connector.num_abandoned.load(Ordering::Acquire) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    }
}
