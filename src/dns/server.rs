//! DNS listeners
//!
//! One task per UDP datagram and one per TCP connection. On shutdown the
//! listeners stop accepting and wait for in-flight queries to finish; TCP
//! connections close at the next gap between queries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::handler::QueryHandler;
use super::wire::MAX_UDP_PACKET_SIZE;

/// A TCP client gets this long to send its next query
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the DNS server on UDP and TCP at `addr`
pub async fn run_dns_server(
    addr: SocketAddr,
    handler: Arc<QueryHandler>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(addr).await?;
    let listener = TcpListener::bind(addr).await?;

    info!("🌐 DNS server listening on {} (UDP + TCP)", addr);

    tokio::try_join!(
        run_udp(socket, Arc::clone(&handler), shutdown.clone()),
        run_tcp(listener, handler, shutdown),
    )?;

    Ok(())
}

/// Serve queries arriving on a bound UDP socket
pub async fn run_udp(
    socket: UdpSocket,
    handler: Arc<QueryHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut in_flight = JoinSet::new();
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let request = buf[..len].to_vec();
                        let handler = Arc::clone(&handler);
                        let socket = Arc::clone(&socket);

                        in_flight.spawn(async move {
                            let Some(handled) = handler.handle(&request, src.ip()).await else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&handled.response, src).await {
                                debug!("DNS reply to {} failed: {}", src, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("DNS socket error: {}", e);
                    }
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!("UDP listener stopped");
    Ok(())
}

/// Serve length-prefixed queries on accepted TCP connections
pub async fn run_tcp(
    listener: TcpListener,
    handler: Arc<QueryHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, handler, shutdown).await {
                                debug!("DNS TCP connection {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("DNS TCP accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    while connections.join_next().await.is_some() {}
    debug!("TCP listener stopped");
    Ok(())
}

/// Answer queries on one connection until EOF, idle timeout or shutdown
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<QueryHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let read = tokio::select! {
            read = tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_u16()) => read,
            _ = shutdown.changed() => {
                debug!("Closing idle DNS TCP connection {} for shutdown", peer);
                return Ok(());
            }
        };

        let len = match read {
            Ok(Ok(len)) => len as usize,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        };

        let mut request = vec![0u8; len];
        stream.read_exact(&mut request).await?;

        let Some(handled) = handler.handle(&request, peer.ip()).await else {
            continue;
        };

        let Ok(reply_len) = u16::try_from(handled.response.len()) else {
            debug!("Reply to {} exceeds TCP frame size, dropping", peer);
            continue;
        };

        let mut framed = Vec::with_capacity(handled.response.len() + 2);
        framed.extend_from_slice(&reply_len.to_be_bytes());
        framed.extend_from_slice(&handled.response);
        stream.write_all(&framed).await?;
    }
}
