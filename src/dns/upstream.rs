//! Upstream resolvers
//!
//! Resolvers are tried in configured order, each under the same per-upstream
//! timeout; the first answer wins and no resolver is retried.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::wire::{self, DNS_HEADER_SIZE, MAX_UDP_PACKET_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("I/O error with upstream {upstream}: {source}")]
    Io {
        upstream: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {upstream} timed out")]
    Timeout { upstream: String },

    #[error("malformed reply from upstream {upstream}")]
    Malformed { upstream: String },

    #[error("query has no transaction ID")]
    BadQuery,

    #[error("all {0} upstreams failed")]
    AllFailed(usize),
}

/// One upstream resolver
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Send a raw query and return the raw reply
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError>;

    fn describe(&self) -> String;
}

/// Plain DNS over UDP, retried over TCP when the reply is truncated
pub struct UdpUpstream {
    addr: SocketAddr,
}

impl UdpUpstream {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    fn io_error(&self, source: std::io::Error) -> UpstreamError {
        UpstreamError::Io {
            upstream: self.addr.to_string(),
            source,
        }
    }
}

#[async_trait]
impl Exchange for UdpUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let id = wire::packet_id(query).ok_or(UpstreamError::BadQuery)?;

        let bind: SocketAddr = if self.addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| self.io_error(e))?;
        socket.connect(self.addr).await.map_err(|e| self.io_error(e))?;
        socket.send(query).await.map_err(|e| self.io_error(e))?;

        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let len = socket.recv(&mut buf).await.map_err(|e| self.io_error(e))?;

            // Stray or spoofed datagram; keep waiting until the caller's timeout
            if len < DNS_HEADER_SIZE || wire::packet_id(&buf[..len]) != Some(id) {
                debug!("Ignoring mismatched reply from {}", self.addr);
                continue;
            }

            if wire::is_truncated(&buf[..len]) {
                debug!("Truncated reply from {}, retrying over TCP", self.addr);
                return tcp_exchange(self.addr, query).await;
            }

            buf.truncate(len);
            return Ok(buf);
        }
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.addr)
    }
}

/// One length-prefixed DNS exchange over TCP
pub async fn tcp_exchange(addr: SocketAddr, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let io_error = |source| UpstreamError::Io {
        upstream: addr.to_string(),
        source,
    };

    let len = u16::try_from(query.len()).map_err(|_| UpstreamError::BadQuery)?;

    let mut stream = TcpStream::connect(addr).await.map_err(io_error)?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await.map_err(io_error)?;

    let reply_len = stream.read_u16().await.map_err(io_error)? as usize;
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await.map_err(io_error)?;

    if reply.len() < DNS_HEADER_SIZE || wire::packet_id(&reply) != wire::packet_id(query) {
        return Err(UpstreamError::Malformed {
            upstream: addr.to_string(),
        });
    }

    Ok(reply)
}

/// Ordered list of upstreams with a per-upstream timeout
pub struct Forwarder {
    upstreams: Vec<Arc<dyn Exchange>>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(upstreams: Vec<Arc<dyn Exchange>>, timeout: Duration) -> Self {
        Self { upstreams, timeout }
    }

    pub fn from_addrs(addrs: &[SocketAddr], timeout: Duration) -> Self {
        let upstreams = addrs
            .iter()
            .map(|addr| Arc::new(UdpUpstream::new(*addr)) as Arc<dyn Exchange>)
            .collect();
        Self::new(upstreams, timeout)
    }

    /// Relay `query` to the first upstream that answers
    ///
    /// The reply's ID is rewritten to the query's.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let id = wire::packet_id(query).ok_or(UpstreamError::BadQuery)?;

        for upstream in &self.upstreams {
            match tokio::time::timeout(self.timeout, upstream.exchange(query)).await {
                Ok(Ok(mut reply)) => {
                    wire::set_id(&mut reply, id);
                    return Ok(reply);
                }
                Ok(Err(e)) => debug!("Upstream {} failed: {}", upstream.describe(), e),
                Err(_) => debug!(
                    "{}",
                    UpstreamError::Timeout {
                        upstream: upstream.describe()
                    }
                ),
            }
        }

        Err(UpstreamError::AllFailed(self.upstreams.len()))
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
