//! L4 router: per-tunnel public TCP/TLS/UDP listeners.
//!
//! The server never parses the carried bytes; it chunks them into frames
//! keyed by conn-id (streams) or source address (datagrams) and pumps them
//! both ways over the control link.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunlink_shared::{Error, Frame, Result, TunnelProtocol};

use crate::ratelimit::RateDecision;
use crate::tunnel::{StreamEvent, TunnelConnection};
use crate::AppState;

/// Stream reads are chunked; one chunk becomes one frame.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Datagram sources with no traffic for this long are forgotten.
pub const UDP_PEER_WINDOW: Duration = Duration::from_secs(30);

/// Bind and start the public side of an L4 tunnel. The returned handle
/// aborts the accept/receive loop at link teardown.
pub async fn spawn(state: AppState, conn: Arc<TunnelConnection>) -> Result<JoinHandle<()>> {
    let port = conn
        .public_port
        .ok_or_else(|| Error::Protocol("l4 tunnel without a public port".into()))?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    match conn.protocol {
        TunnelProtocol::Tcp | TunnelProtocol::Tls => {
            let listener = TcpListener::bind(bind_addr).await.map_err(|err| {
                warn!(%err, port, "public listener bind failed");
                Error::PortExhausted
            })?;
            info!(port, protocol = %conn.protocol, subdomain = %conn.subdomain, "public listener up");
            Ok(tokio::spawn(accept_loop(state, conn, listener)))
        }
        TunnelProtocol::Udp => {
            let socket = UdpSocket::bind(bind_addr).await.map_err(|err| {
                warn!(%err, port, "public socket bind failed");
                Error::PortExhausted
            })?;
            info!(port, subdomain = %conn.subdomain, "public udp socket up");
            Ok(tokio::spawn(udp_loop(state, conn, socket)))
        }
        TunnelProtocol::Http => Err(Error::Protocol("http tunnels are hostname-routed".into())),
    }
}

async fn accept_loop(state: AppState, conn: Arc<TunnelConnection>, listener: TcpListener) {
    let mut done = conn.done_rx();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!(%err, "accept failed");
                        continue;
                    }
                };

                // Rate limit new connections; a denied peer is closed
                // before any byte is relayed.
                if state
                    .limiter
                    .check(&conn.id.to_string(), &conn.limits)
                    .await
                    .is_denied()
                {
                    debug!(%peer, subdomain = %conn.subdomain, "tcp accept rate limited");
                    drop(stream);
                    continue;
                }

                state.metrics.tcp_conn_accepted();
                let conn = conn.clone();
                tokio::spawn(async move {
                    serve_stream(conn, stream, peer).await;
                });
            }
            _ = done.changed() => break,
        }
    }
}

/// One public TCP/TLS connection: a pump pair tied by a fresh conn-id.
async fn serve_stream(conn: Arc<TunnelConnection>, stream: TcpStream, peer: SocketAddr) {
    let conn_id = Uuid::new_v4().to_string();
    debug!(%peer, conn_id = %conn_id, subdomain = %conn.subdomain, "public connection open");

    let events = conn.register_stream(&conn_id);
    let (read_half, write_half) = stream.into_split();

    let inbound = tokio::spawn(pump_public_to_frames(
        conn.clone(),
        conn_id.clone(),
        read_half,
    ));
    pump_frames_to_public(conn.clone(), events, write_half).await;

    inbound.abort();
    conn.remove_stream(&conn_id);
    debug!(conn_id = %conn_id, "public connection closed");
}

/// public socket -> data frames. An EOF becomes an empty close frame so
/// the client can half-close its origin socket.
async fn pump_public_to_frames(
    conn: Arc<TunnelConnection>,
    conn_id: String,
    mut read_half: OwnedReadHalf,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!(%err, conn_id = %conn_id, "public read error");
                let _ = conn
                    .send(frame_error(conn.protocol, &conn_id, "public peer error"))
                    .await;
                return;
            }
        };

        if n == 0 {
            // EOF markers are control, not payload; they always go through.
            let _ = conn.send(frame_data(conn.protocol, &conn_id, vec![], true)).await;
            return;
        }

        match conn
            .send_data(frame_data(conn.protocol, &conn_id, buf[..n].to_vec(), false))
            .await
        {
            // Frame dropped on backpressure: kill the public connection
            // rather than let one slow link wedge the pump.
            Ok(false) => {
                warn!(conn_id = %conn_id, "dropping public connection on backpressure");
                if let Some(tx) = conn.stream_sender(&conn_id) {
                    let _ = tx.try_send(StreamEvent::Close);
                }
                return;
            }
            Ok(true) => {}
            Err(_) => return,
        }
    }
}

/// data frames -> public socket. A close event shuts down the write half,
/// honoring half-close.
async fn pump_frames_to_public(
    conn: Arc<TunnelConnection>,
    mut events: mpsc::Receiver<StreamEvent>,
    mut write_half: OwnedWriteHalf,
) {
    let mut done = conn.done_rx();
    loop {
        tokio::select! {
            maybe = events.recv() => {
                match maybe {
                    Some(StreamEvent::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    Some(StreamEvent::Close) => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                    None => return,
                }
            }
            _ = done.changed() => {
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}

fn frame_data(protocol: TunnelProtocol, conn_id: &str, data: Vec<u8>, close: bool) -> Frame {
    match protocol {
        TunnelProtocol::Tls => Frame::TlsData {
            conn_id: conn_id.to_string(),
            data,
            close,
        },
        _ => Frame::TcpData {
            conn_id: conn_id.to_string(),
            data,
            close,
        },
    }
}

fn frame_error(protocol: TunnelProtocol, conn_id: &str, message: &str) -> Frame {
    match protocol {
        TunnelProtocol::Tls => Frame::TlsError {
            conn_id: conn_id.to_string(),
            message: message.to_string(),
        },
        _ => Frame::TcpError {
            conn_id: conn_id.to_string(),
            message: message.to_string(),
        },
    }
}

/// One socket serves every datagram peer of a UDP tunnel. Replies flow
/// back through a channel the read pump feeds, matched by source address.
async fn udp_loop(state: AppState, conn: Arc<TunnelConnection>, socket: UdpSocket) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(256);
    conn.set_udp_reply(reply_tx).await;

    let mut done = conn.done_rx();
    let mut sweep = tokio::time::interval(Duration::from_secs(10));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!(%err, "udp recv error");
                        continue;
                    }
                };

                // Advisory for datagrams: a denied packet is simply dropped.
                if state
                    .limiter
                    .check(&conn.id.to_string(), &conn.limits)
                    .await
                    .is_denied()
                {
                    continue;
                }

                state.metrics.udp_datagram(n as u64);
                conn.touch_udp_peer(&peer.to_string());
                let frame = Frame::UdpData {
                    addr: peer.ip().to_string(),
                    port: peer.port(),
                    data: buf[..n].to_vec(),
                };
                if conn.send_data(frame).await.is_err() {
                    break;
                }
            }
            maybe = reply_rx.recv() => {
                let Some((peer, data)) = maybe else { break };
                // Replies only reach peers seen within the window.
                if !conn.udp_peer_fresh(&peer.to_string(), UDP_PEER_WINDOW) {
                    debug!(%peer, "udp reply for forgotten peer dropped");
                    continue;
                }
                if let Err(err) = socket.send_to(&data, peer).await {
                    debug!(%err, %peer, "udp reply send failed");
                }
            }
            _ = sweep.tick() => {
                conn.sweep_udp_peers(UDP_PEER_WINDOW);
            }
            _ = done.changed() => break,
        }
    }
}
