//! Tunnel state: the persisted record and the live connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use tunlink_shared::{Frame, RateLimits, TunnelProtocol};

/// Outbound frame queue depth per link. One writer drains it.
pub const OUTBOUND_QUEUE: usize = 256;

/// How long a data-frame sender may block on a full queue before the
/// frame is dropped.
pub const SEND_BUDGET: Duration = Duration::from_secs(1);

/// Tunnel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Active,
    Paused,
    Deleted,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Paused => "paused",
            TunnelStatus::Deleted => "deleted",
        })
    }
}

/// The persisted shape of a tunnel. Outlives any one control link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub subdomain: String,
    pub custom_domain: Option<String>,
    pub protocol: TunnelProtocol,
    pub local_url: String,
    pub public_port: Option<u16>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub request_count: u64,
}

impl TunnelRecord {
    pub fn new(
        user_id: Option<String>,
        subdomain: String,
        protocol: TunnelProtocol,
        local_url: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            subdomain,
            custom_domain: None,
            protocol,
            local_url,
            public_port: None,
            status: TunnelStatus::Active,
            created_at: now,
            last_active_at: now,
            request_count: 0,
        }
    }
}

/// What an HTTP waiter receives on its oneshot.
#[derive(Debug)]
pub enum HttpReply {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    /// `http_error` from the client, or `LinkClosed` at teardown.
    Error(String),
}

/// Events pushed to one public L4 socket.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Close,
}

struct Pending {
    reply: oneshot::Sender<HttpReply>,
    started_at: Instant,
}

/// One live control link and the in-flight state multiplexed over it.
pub struct TunnelConnection {
    pub id: Uuid,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub user_id: Option<String>,
    pub public_port: Option<u16>,
    pub limits: RateLimits,

    outbound: mpsc::Sender<Frame>,
    pending: DashMap<String, Pending>,
    streams: DashMap<String, mpsc::Sender<StreamEvent>>,
    udp_peers: DashMap<String, Instant>,
    udp_reply: Mutex<Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>>,
    last_seen: Mutex<Instant>,
    done_tx: watch::Sender<bool>,
}

impl TunnelConnection {
    /// Build a connection around its outbound queue. The paired receiver
    /// belongs to the link's write pump.
    pub fn new(record: &TunnelRecord, limits: RateLimits) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (done_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: record.id,
            subdomain: record.subdomain.clone(),
            protocol: record.protocol,
            user_id: record.user_id.clone(),
            public_port: record.public_port,
            limits,
            outbound,
            pending: DashMap::new(),
            streams: DashMap::new(),
            udp_peers: DashMap::new(),
            udp_reply: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            done_tx,
        });
        (conn, rx)
    }

    /// Queue a protocol frame. Blocks on a full queue; fails only once the
    /// link is down.
    pub async fn send(&self, frame: Frame) -> Result<(), tunlink_shared::Error> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| tunlink_shared::Error::LinkClosed)
    }

    /// Queue a data frame with the one-second budget. `Ok(false)` means the
    /// frame was dropped on backpressure; protocol frames must not come
    /// through here.
    pub async fn send_data(&self, frame: Frame) -> Result<bool, tunlink_shared::Error> {
        debug_assert!(frame.is_data());
        match self.outbound.send_timeout(frame, SEND_BUDGET).await {
            Ok(()) => Ok(true),
            Err(mpsc::error::SendTimeoutError::Timeout(frame)) => {
                warn!(
                    subdomain = %self.subdomain,
                    frame = frame.frame_type(),
                    "write pump blocked, dropping data frame"
                );
                Ok(false)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(tunlink_shared::Error::LinkClosed)
            }
        }
    }

    /// Register an HTTP waiter under a fresh request id.
    pub fn register_pending(&self, request_id: &str) -> oneshot::Receiver<HttpReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            Pending {
                reply: tx,
                started_at: Instant::now(),
            },
        );
        rx
    }

    /// Deliver a reply to its waiter. Duplicate and late replies return
    /// false and are dropped silently.
    pub fn complete_pending(&self, request_id: &str, reply: HttpReply) -> bool {
        match self.pending.remove(request_id) {
            Some((_, entry)) => entry.reply.send(reply).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter that gave up (timeout or caller cancel).
    pub fn remove_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop entries whose waiter is gone or that outlived `max_age`.
    pub fn sweep_orphans(&self, max_age: Duration) {
        self.pending
            .retain(|_, p| !p.reply.is_closed() && p.started_at.elapsed() < max_age);
    }

    /// Attach one public L4 connection.
    pub fn register_stream(&self, conn_id: &str) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.streams.insert(conn_id.to_string(), tx);
        rx
    }

    pub fn stream_sender(&self, conn_id: &str) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams.get(conn_id).map(|s| s.clone())
    }

    pub fn remove_stream(&self, conn_id: &str) {
        self.streams.remove(conn_id);
    }

    /// Note a datagram source so its replies can be matched back.
    pub fn touch_udp_peer(&self, key: &str) {
        self.udp_peers.insert(key.to_string(), Instant::now());
    }

    /// A peer is addressable while its last datagram is younger than the
    /// sweep window.
    pub fn udp_peer_fresh(&self, key: &str, window: Duration) -> bool {
        self.udp_peers
            .get(key)
            .map(|seen| seen.elapsed() < window)
            .unwrap_or(false)
    }

    pub fn sweep_udp_peers(&self, window: Duration) {
        self.udp_peers.retain(|_, seen| seen.elapsed() < window);
    }

    /// Install the reply path back into the UDP socket task.
    pub async fn set_udp_reply(&self, tx: mpsc::Sender<(SocketAddr, Vec<u8>)>) {
        *self.udp_reply.lock().await = Some(tx);
    }

    pub async fn udp_reply(&self) -> Option<mpsc::Sender<(SocketAddr, Vec<u8>)>> {
        self.udp_reply.lock().await.clone()
    }

    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_seen.lock().await.elapsed()
    }

    /// Subscribe to teardown. The flag flips to true exactly once.
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Tear down: signal every pump, fail every waiter with a link-closed
    /// error, and close every public stream.
    pub fn close(&self) {
        let _ = self.done_tx.send(true);

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, p)) = self.pending.remove(&id) {
                let _ = p.reply.send(HttpReply::Error("control link closed".into()));
            }
        }

        let conns: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for conn_id in conns {
            if let Some((_, tx)) = self.streams.remove(&conn_id) {
                let _ = tx.try_send(StreamEvent::Close);
            }
        }

        self.udp_peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TunnelRecord {
        TunnelRecord::new(None, "ab12cd34".into(), TunnelProtocol::Http, "http://localhost:3000".into())
    }

    #[tokio::test]
    async fn test_pending_roundtrip_and_duplicate_drop() {
        let (conn, _rx) = TunnelConnection::new(&record(), RateLimits::default());
        let waiter = conn.register_pending("r1");

        assert!(conn.complete_pending(
            "r1",
            HttpReply::Response {
                status: 200,
                headers: vec![],
                body: Some(b"pong".to_vec()),
            }
        ));
        // Second delivery for the same id has no waiter left.
        assert!(!conn.complete_pending("r1", HttpReply::Error("dup".into())));

        match waiter.await.unwrap() {
            HttpReply::Response { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body.as_deref(), Some(b"pong".as_ref()));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_drains_pendings_with_error() {
        let (conn, _rx) = TunnelConnection::new(&record(), RateLimits::default());
        let w1 = conn.register_pending("r1");
        let w2 = conn.register_pending("r2");

        conn.close();

        assert_eq!(conn.pending_count(), 0);
        assert!(matches!(w1.await.unwrap(), HttpReply::Error(_)));
        assert!(matches!(w2.await.unwrap(), HttpReply::Error(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_orphan_sweep_keeps_live_waiters() {
        let (conn, _rx) = TunnelConnection::new(&record(), RateLimits::default());
        let live = conn.register_pending("live");
        let dead = conn.register_pending("dead");
        drop(dead);

        conn.sweep_orphans(Duration::from_secs(30));
        assert_eq!(conn.pending_count(), 1);
        drop(live);
    }

    #[tokio::test]
    async fn test_data_frame_dropped_when_queue_wedged() {
        let (conn, rx) = TunnelConnection::new(&record(), RateLimits::default());
        // Nobody drains rx: fill the queue to the brim.
        for i in 0..OUTBOUND_QUEUE {
            conn.send(Frame::TcpData {
                conn_id: format!("c{i}"),
                data: vec![0],
                close: false,
            })
            .await
            .unwrap();
        }

        let delivered = tokio::time::timeout(
            Duration::from_secs(3),
            conn.send_data(Frame::TcpData {
                conn_id: "overflow".into(),
                data: vec![0],
                close: false,
            }),
        )
        .await
        .expect("send_data must give up within its budget")
        .unwrap();
        assert!(!delivered);
        drop(rx);
    }

    #[tokio::test]
    async fn test_udp_peer_window() {
        let (conn, _rx) = TunnelConnection::new(&record(), RateLimits::default());
        conn.touch_udp_peer("203.0.113.9:4242");
        assert!(conn.udp_peer_fresh("203.0.113.9:4242", Duration::from_secs(30)));
        assert!(!conn.udp_peer_fresh("203.0.113.9:9999", Duration::from_secs(30)));

        conn.sweep_udp_peers(Duration::from_secs(0));
        assert!(!conn.udp_peer_fresh("203.0.113.9:4242", Duration::from_secs(30)));
    }
}
