//! Control-link lifecycle: admission handshake, read pump, write pump,
//! keepalive, and teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tunlink_shared::{Error, Frame};

use crate::admission::InitRequest;
use crate::l4;
use crate::repository::REPO_BUDGET;
use crate::tunnel::{HttpReply, StreamEvent, TunnelConnection, TunnelStatus, SEND_BUDGET};
use crate::AppState;

/// The init frame must arrive this soon after upgrade.
pub const INIT_DEADLINE: Duration = Duration::from_secs(5);
/// Keepalive cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long after a ping the client has to show life.
pub const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Drive one upgraded control link to completion.
pub async fn handle_socket(mut socket: WebSocket, state: AppState, query_token: Option<String>) {
    let init = match read_init(&mut socket).await {
        Ok(init) => init,
        Err(err) => {
            reject(&mut socket, &err).await;
            return;
        }
    };
    let protocol = init.protocol;

    let grant = match state.admission.admit(init, query_token.as_deref()).await {
        Ok(grant) => grant,
        Err(err) => {
            reject(&mut socket, &err).await;
            return;
        }
    };
    let record = grant.record;

    let (conn, outbound_rx) = TunnelConnection::new(&record, grant.limits);

    if let Err(err) = state.registry.insert(conn.clone()) {
        release_handles(&state, &record);
        reject(&mut socket, &Error::AdmissionRejected(err.to_string())).await;
        return;
    }
    if let Some(domain) = record.custom_domain.as_deref() {
        if let Err(err) = state.registry.assign_custom_domain(domain, &record.subdomain) {
            warn!(%err, "custom domain not aliased");
        }
    }

    // L4 tunnels bind their public listener before the grant is announced,
    // so a bind failure is still a typed init error.
    let l4_handle = if protocol.needs_port() {
        match l4::spawn(state.clone(), conn.clone()).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                state.registry.remove(&record.subdomain);
                release_handles(&state, &record);
                reject(&mut socket, &err).await;
                return;
            }
        }
    } else {
        None
    };

    let created = Frame::TunnelCreated {
        tunnel_id: record.id.to_string(),
        subdomain: record.subdomain.clone(),
        public_url: match record.public_port {
            Some(port) => state.config.public_addr(port),
            None => state.config.public_url(&record.subdomain),
        },
        public_port: record.public_port,
        status: "active".into(),
    };
    let announced = match created.encode() {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    };
    if !announced {
        state.registry.remove(&record.subdomain);
        release_handles(&state, &record);
        if let Some(handle) = l4_handle {
            handle.abort();
        }
        return;
    }

    state.metrics.tunnel_opened();
    info!(
        tunnel_id = %record.id,
        subdomain = %record.subdomain,
        protocol = %protocol,
        reattached = grant.reattached,
        "control link established"
    );

    run_pumps(socket, conn.clone(), outbound_rx).await;

    if let Some(handle) = l4_handle {
        handle.abort();
    }

    // Teardown: the record pauses, its handles go into their cool-downs,
    // and every in-flight request fails with a link-closed error.
    conn.close();
    state.registry.remove(&record.subdomain);
    release_handles(&state, &record);
    state.metrics.tunnel_closed();

    match timeout(
        REPO_BUDGET,
        state.repo.update_status(record.id, TunnelStatus::Paused),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "pause status update failed"),
        Err(_) => warn!("pause status update timed out"),
    }

    info!(tunnel_id = %record.id, subdomain = %record.subdomain, "control link closed");
}

fn release_handles(state: &AppState, record: &crate::tunnel::TunnelRecord) {
    state.pool.release(&record.subdomain);
    if let Some(port) = record.public_port {
        state.ports.release(port);
    }
}

/// First frame, under the admission deadline.
async fn read_init(socket: &mut WebSocket) -> Result<InitRequest, Error> {
    let msg = match timeout(INIT_DEADLINE, socket.recv()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(_) => return Err(Error::LinkClosed),
        Err(_) => return Err(Error::AdmissionRejected("init deadline exceeded".into())),
    };

    let bytes = match &msg {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data.as_slice(),
        _ => return Err(Error::AdmissionRejected("expected an init frame".into())),
    };

    match Frame::decode(bytes)? {
        Frame::Init {
            protocol,
            local_url,
            token,
            api_key,
            subdomain,
            tunnel_id,
            host,
            force_new,
        } => Ok(InitRequest {
            protocol,
            local_url,
            token,
            api_key,
            subdomain,
            tunnel_id,
            host,
            force_new,
        }),
        other => Err(Error::AdmissionRejected(format!(
            "expected init, got {}",
            other.frame_type()
        ))),
    }
}

/// Send a typed error frame and close. Best effort; the peer may be gone.
async fn reject(socket: &mut WebSocket, err: &Error) {
    debug!(%err, "link rejected");
    let frame = Frame::TunnelStatus {
        tunnel_id: None,
        status: "error".into(),
        message: Some(err.to_string()),
    };
    if let Ok(text) = frame.encode() {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// The three cooperating tasks. Returns when the link is finished; the
/// done channel pulls every task down within a second of teardown.
async fn run_pumps(socket: WebSocket, conn: Arc<TunnelConnection>, outbound_rx: mpsc::Receiver<Frame>) {
    let (ws_tx, ws_rx) = socket.split();

    let writer = tokio::spawn(write_pump(ws_tx, outbound_rx, conn.clone()));
    let keeper = tokio::spawn(keepalive(conn.clone()));

    read_pump(ws_rx, conn.clone()).await;

    conn.close();
    let _ = timeout(Duration::from_secs(1), writer).await;
    keeper.abort();
}

/// Single writer over the socket. Everything outbound funnels through the
/// connection's queue; nothing else touches the sink.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    conn: Arc<TunnelConnection>,
) {
    let mut done = conn.done_rx();
    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => {
                let Some(frame) = maybe else { break };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, frame = frame.frame_type(), "outbound frame dropped");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    conn.close();
                    break;
                }
            }
            _ = done.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Ping every 30 s; close the link when the client shows no life within
/// the pong deadline.
async fn keepalive(conn: Arc<TunnelConnection>) {
    let mut done = conn.done_rx();
    let mut tick = tokio::time::interval(PING_INTERVAL);
    tick.tick().await; // immediate first tick; the link just proved itself
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if conn.send(Frame::Ping).await.is_err() {
                    break;
                }
                tokio::time::sleep(PONG_DEADLINE).await;
                if conn.is_closed() {
                    break;
                }
                if conn.idle_for().await > PONG_DEADLINE + Duration::from_secs(1) {
                    warn!(subdomain = %conn.subdomain, "keepalive timeout, closing link");
                    conn.close();
                    break;
                }
            }
            _ = done.changed() => break,
        }
    }
}

/// Receive frames and dispatch by type until the socket or the tunnel dies.
async fn read_pump(mut ws_rx: SplitStream<WebSocket>, conn: Arc<TunnelConnection>) {
    let mut done = conn.done_rx();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(&conn, text.as_bytes()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !dispatch(&conn, &data).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        conn.touch().await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(%err, "control link read error");
                        break;
                    }
                }
            }
            _ = done.changed() => break,
        }
    }
}

/// Handle one inbound frame. Returns false when the link must close.
async fn dispatch(conn: &Arc<TunnelConnection>, bytes: &[u8]) -> bool {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(err) => {
            // Decode failures get a typed error back, then the link dies.
            let _ = conn
                .send(Frame::TunnelStatus {
                    tunnel_id: Some(conn.id.to_string()),
                    status: "error".into(),
                    message: Some(err.to_string()),
                })
                .await;
            return false;
        }
    };

    conn.touch().await;

    let ftype = frame.frame_type();
    match frame {
        Frame::Pong => {}
        Frame::Ping => {
            let _ = conn.send(Frame::Pong).await;
        }

        Frame::HttpResponse {
            request_id,
            status,
            headers,
            body,
        } => {
            // Late or duplicate replies fall out silently here.
            conn.complete_pending(
                &request_id,
                HttpReply::Response {
                    status,
                    headers,
                    body,
                },
            );
        }
        Frame::HttpError {
            request_id,
            message,
        } => {
            conn.complete_pending(&request_id, HttpReply::Error(message));
        }

        Frame::TcpData {
            conn_id,
            data,
            close,
        }
        | Frame::TlsData {
            conn_id,
            data,
            close,
        } => {
            deliver_stream(conn, &conn_id, data, close).await;
        }
        Frame::TcpError { conn_id, message } | Frame::TlsError { conn_id, message } => {
            debug!(%conn_id, %message, "origin stream error");
            if let Some(tx) = conn.stream_sender(&conn_id) {
                let _ = tx.try_send(StreamEvent::Close);
            }
            conn.remove_stream(&conn_id);
        }

        Frame::UdpData { addr, port, data } => {
            let Ok(ip) = addr.parse() else {
                debug!(%addr, "unparseable udp reply address");
                return true;
            };
            let peer = SocketAddr::new(ip, port);
            if let Some(tx) = conn.udp_reply().await {
                // Best-effort: a full reply queue drops the datagram.
                let _ = tx.try_send((peer, data));
            }
        }
        Frame::UdpError { message } => {
            debug!(%message, "origin udp error");
        }

        Frame::UpdateTunnel { local_url } => {
            info!(subdomain = %conn.subdomain, %local_url, "origin url updated");
        }

        Frame::Init { .. } => {
            let _ = conn
                .send(Frame::TunnelStatus {
                    tunnel_id: Some(conn.id.to_string()),
                    status: "error".into(),
                    message: Some("init after admission".into()),
                })
                .await;
            return false;
        }

        // Server-originated types echoing back mean a confused peer; drop.
        Frame::TunnelCreated { .. }
        | Frame::HttpRequest { .. }
        | Frame::TunnelStatus { .. } => {
            debug!(frame = ftype, "unexpected frame from client");
        }
    }

    !conn.is_closed()
}

/// Push a chunk (and/or EOF) to the public socket pump for one conn-id.
async fn deliver_stream(conn: &Arc<TunnelConnection>, conn_id: &str, data: Vec<u8>, close: bool) {
    let Some(tx) = conn.stream_sender(conn_id) else {
        // Public side already went away.
        return;
    };

    if !data.is_empty() {
        match tx.send_timeout(StreamEvent::Data(data), SEND_BUDGET).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                // A wedged public socket must not stall the whole link.
                warn!(conn_id, "public socket blocked, dropping stream");
                conn.remove_stream(conn_id);
                let _ = conn
                    .send(Frame::TcpError {
                        conn_id: conn_id.to_string(),
                        message: "public peer stalled".into(),
                    })
                    .await;
                return;
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                conn.remove_stream(conn_id);
                return;
            }
        }
    }
    if close {
        let _ = tx.try_send(StreamEvent::Close);
    }
}
