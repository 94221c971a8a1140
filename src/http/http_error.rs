use std::fmt::{Display, Formatter};
use std::io;

/// A response that can not be framed or parsed
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    MalformedStatusLine(String),
    MalformedHeader(String),
    InvalidContentLength(String),
    /// the connection was closed before a complete response was received
    Truncated,
    ResponseTooLarge(usize),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MalformedStatusLine(line) => write!(f, "malformed status line: {:?}", line),
            ProtocolError::MalformedHeader(line) => write!(f, "malformed header line: {:?}", line),
            ProtocolError::InvalidContentLength(value) => write!(f, "invalid Content-Length: {:?}", value),
            ProtocolError::Truncated => write!(f, "connection closed before the response was complete"),
            ProtocolError::ResponseTooLarge(limit) => write!(f, "response exceeds the maximum size of {} bytes", limit),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Everything that can go wrong with a single exchange on a channel. The session classifies
///  these, so the variants are about *what* failed rather than where.
#[derive(Debug)]
pub enum ChannelError {
    /// the server (or proxy) actively refused the TCP connection
    ConnectionRefused(io::Error),
    /// any other failure to establish the connection, including an unsuccessful proxy CONNECT
    Connect(String),
    Resolve(String),
    Io(io::Error),
    Tls(String),
    Protocol(ProtocolError),
    TimedOut,
    /// the server kept answering with a transient status; carries the last one
    TransientRetriesExhausted(u16),
    /// the request was cancelled through its queue, or its queue was shut down
    Cancelled,
}

impl ChannelError {
    pub fn from_connect_error(e: io::Error) -> ChannelError {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ChannelError::ConnectionRefused(e),
            _ => ChannelError::Connect(e.to_string()),
        }
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self, ChannelError::ConnectionRefused(_))
    }

    /// true if the exchange never reached the server, i.e. connection setup failed
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, ChannelError::ConnectionRefused(_) | ChannelError::Connect(_) | ChannelError::Resolve(_) | ChannelError::Tls(_))
    }
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::ConnectionRefused(e) => write!(f, "connection refused: {}", e),
            ChannelError::Connect(msg) => write!(f, "connect failed: {}", msg),
            ChannelError::Resolve(msg) => write!(f, "could not resolve server address: {}", msg),
            ChannelError::Io(e) => write!(f, "I/O error: {}", e),
            ChannelError::Tls(msg) => write!(f, "TLS error: {}", msg),
            ChannelError::Protocol(e) => write!(f, "protocol error: {}", e),
            ChannelError::TimedOut => write!(f, "timed out waiting for the response"),
            ChannelError::TransientRetriesExhausted(status) => write!(f, "giving up after repeated transient status {}", status),
            ChannelError::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::ConnectionRefused(e) | ChannelError::Io(e) => Some(e),
            ChannelError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(value: ProtocolError) -> Self {
        ChannelError::Protocol(value)
    }
}

impl From<io::Error> for ChannelError {
    fn from(value: io::Error) -> Self {
        ChannelError::Io(value)
    }
}
