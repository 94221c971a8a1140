use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::http::connector::ProxyAddr;
use crate::signaling::status_policy::StatusPolicy;

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// `http://host:port` of an HTTP proxy. Plain requests are forwarded by the proxy, TLS
    ///  connections are tunnelled through it with `CONNECT`.
    pub proxy: Option<String>,
    /// `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// sent verbatim as the `Authorization` header of every request
    pub authorization: Option<String>,

    /// delay before the one retry of a refused initial connect
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// bound on a single long poll, after which the poll is reissued
    pub long_poll_timeout: Duration,
    pub request_timeout: Duration,

    pub status_policy: StatusPolicy,
    pub transient_retry_limit: u32,
    pub transient_retry_initial_delay: Duration,
    pub transient_retry_max_delay: Duration,

    /// PEM file with the root certificates to trust for `https://` servers; `None` trusts the
    ///  bundled webpki roots
    pub tls_root_certificates: Option<PathBuf>,
    pub max_response_size: usize,

    pub shutdown_timeout: Duration,
}

impl SignalingConfig {
    pub fn new() -> SignalingConfig {
        SignalingConfig {
            proxy: None,
            heartbeat_interval: None,
            authorization: None,
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            long_poll_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            status_policy: StatusPolicy::new(),
            transient_retry_limit: 10,
            transient_retry_initial_delay: Duration::from_millis(50),
            transient_retry_max_delay: Duration::from_secs(2),
            tls_root_certificates: None,
            max_response_size: 1024*1024,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the heartbeat interval the way it is usually configured externally: in milliseconds,
    ///  with any negative value disabling heartbeats
    pub fn with_heartbeat_millis(mut self, millis: i64) -> SignalingConfig {
        self.heartbeat_interval = u64::try_from(millis).ok()
            .map(Duration::from_millis);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(proxy) = &self.proxy {
            ProxyAddr::parse(proxy)?;
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            bail!("heartbeat interval must be positive");
        }
        if self.long_poll_timeout.is_zero() || self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.transient_retry_initial_delay > self.transient_retry_max_delay {
            bail!("initial transient retry delay exceeds the maximum delay");
        }
        if self.status_policy.transient.contains(&200) || self.status_policy.idle.contains(&200) {
            bail!("status 200 can not be transient or idle");
        }
        if self.max_response_size < 1024 {
            bail!("maximum response size is too small");
        }
        Ok(())
    }

    pub fn proxy_addr(&self) -> anyhow::Result<Option<ProxyAddr>> {
        self.proxy.as_deref()
            .map(ProxyAddr::parse)
            .transpose()
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self::new()
    }
}
