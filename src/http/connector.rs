use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::http::http_codec::try_parse_response;
use crate::http::http_error::ChannelError;

/// The byte stream a channel talks HTTP over - plain TCP or TLS
pub trait SignalingStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send> SignalingStream for T {}

/// Where a session's channels connect to
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// resolved addresses, tried in order; empty means the host is passed on to the connector (or
    ///  proxy) as a name
    pub addrs: Vec<SocketAddr>,
}

impl ServerTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for ServerTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Opens a fresh connection to the server for every exchange
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn SignalingStream>, ChannelError>;

    /// the proxy's URI prefix if requests must be sent in absolute form, i.e. the connector
    ///  forwards plain HTTP through a proxy
    fn absolute_uri_prefix(&self, _target: &ServerTarget) -> Option<String> {
        None
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    /// parses `http://host:port`, `host:port` or `host` (port 80)
    pub fn parse(uri: &str) -> anyhow::Result<ProxyAddr> {
        let without_scheme = match uri.split_once("://") {
            Some(("http", rest)) => rest,
            Some((scheme, _)) => bail!("unsupported proxy scheme {:?}", scheme),
            None => uri,
        };
        let authority = without_scheme.trim_end_matches('/');
        if authority.is_empty() {
            bail!("proxy URI {:?} has no host", uri);
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>()
                    .with_context(|| format!("invalid proxy port in {:?}", uri))?;
                if host.is_empty() {
                    bail!("proxy URI {:?} has no host", uri);
                }
                Ok(ProxyAddr { host: host.to_string(), port })
            }
            None => Ok(ProxyAddr { host: authority.to_string(), port: 80 }),
        }
    }
}

pub struct TcpConnector {
    proxy: Option<ProxyAddr>,
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(proxy: Option<ProxyAddr>, tls_config: Arc<ClientConfig>, connect_timeout: Duration) -> TcpConnector {
        TcpConnector {
            proxy,
            tls: TlsConnector::from(tls_config),
            connect_timeout,
        }
    }

    async fn connect_tcp(&self, target: &ServerTarget) -> Result<TcpStream, ChannelError> {
        match &self.proxy {
            Some(proxy) => {
                debug!("connecting to proxy {}:{}", proxy.host, proxy.port);
                let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await
                    .map_err(ChannelError::from_connect_error)?;
                if target.secure {
                    open_tunnel(&mut stream, target).await?;
                }
                Ok(stream)
            }
            None => {
                let result = if target.addrs.is_empty() {
                    TcpStream::connect((target.host.as_str(), target.port)).await
                }
                else {
                    TcpStream::connect(target.addrs.as_slice()).await
                };
                result.map_err(ChannelError::from_connect_error)
            }
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn SignalingStream>, ChannelError> {
        let stream = timeout(self.connect_timeout, self.connect_tcp(target)).await
            .map_err(|_| ChannelError::Connect(format!("timed out connecting to {}", target)))??;
        let _ = stream.set_nodelay(true);

        if !target.secure {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| ChannelError::Tls(format!("invalid server name {:?}: {}", target.host, e)))?;
        let tls_stream = timeout(self.connect_timeout, self.tls.connect(server_name, stream)).await
            .map_err(|_| ChannelError::Tls(format!("timed out in TLS handshake with {}", target)))?
            .map_err(|e| ChannelError::Tls(e.to_string()))?;
        trace!("TLS session established with {}", target);
        Ok(Box::new(tls_stream))
    }

    fn absolute_uri_prefix(&self, target: &ServerTarget) -> Option<String> {
        match (&self.proxy, target.secure) {
            (Some(_), false) => Some(format!("http://{}", target.authority())),
            _ => None,
        }
    }
}

/// asks an HTTP proxy for a raw tunnel to the target
async fn open_tunnel(stream: &mut TcpStream, target: &ServerTarget) -> Result<(), ChannelError> {
    let authority = target.authority();
    let request = format!("CONNECT {} HTTP/1.0\r\nHost: {}\r\n\r\n", authority, authority);
    stream.write_all(request.as_bytes()).await?;

    // the proxy sends nothing after its response until we start the TLS handshake
    let mut buf = BytesMut::with_capacity(512);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let (response, _) = try_parse_response(&buf[..pos+4], true, usize::MAX)?
                .ok_or_else(|| ChannelError::Connect("incomplete proxy response".to_string()))?;
            if response.status != 200 {
                return Err(ChannelError::Connect(format!("proxy refused tunnel to {}: {} {}", authority, response.status, response.reason)));
            }
            return Ok(());
        }
        if buf.len() > 16*1024 {
            return Err(ChannelError::Connect("oversized proxy response".to_string()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ChannelError::Connect("proxy closed the connection during CONNECT".to_string()));
        }
    }
}

/// Builds the TLS client configuration: trusting the roots in a PEM file if one is given, the
///  bundled webpki roots otherwise
pub fn build_tls_config(root_certificates: Option<&Path>) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match root_certificates {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("opening root certificates {:?}", path))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid PEM in {:?}", path))?;
            if certs.is_empty() {
                return Err(anyhow!("{:?} does not contain any certificates", path));
            }
            for cert in certs {
                roots.add(cert)?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    Ok(Arc::new(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()))
}
