use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use tunlink_shared::{Frame, TunnelProtocol};

mod origin;

/// Stream reads are chunked; one chunk becomes one frame.
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Parser)]
#[command(name = "tunlink")]
#[command(version = "0.1.0")]
#[command(about = "Expose local services through a tunlink server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tunnel server URL
    #[arg(short, long, default_value = "ws://localhost:8055/tunnel")]
    server: String,

    /// JWT for authenticated tunnels
    #[arg(long)]
    token: Option<String>,

    /// API key (takes precedence over --token)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Requested subdomain
        #[arg(long)]
        subdomain: Option<String>,

        /// Requested custom host (must CNAME to the server's base domain)
        #[arg(long)]
        host: Option<String>,

        /// Reattach to a paused tunnel by id
        #[arg(long)]
        reattach: Option<String>,

        /// Skip reattach and mint a fresh tunnel
        #[arg(long)]
        force_new: bool,
    },
    /// Expose a local TCP service
    Tcp {
        port: u16,

        #[arg(long)]
        reattach: Option<String>,
    },
    /// Expose a local TLS service (passthrough, no decryption)
    Tls {
        port: u16,

        #[arg(long)]
        reattach: Option<String>,
    },
    /// Expose a local UDP service
    Udp {
        port: u16,
    },
}

/// Exit codes: 0 success, 1 configuration/auth error, 2 network error on
/// upgrade.
enum RunError {
    Config(String),
    Network(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (protocol, local_port, subdomain, host, reattach, force_new) = match &cli.command {
        Commands::Http {
            port,
            subdomain,
            host,
            reattach,
            force_new,
        } => (
            TunnelProtocol::Http,
            *port,
            subdomain.clone(),
            host.clone(),
            reattach.clone(),
            *force_new,
        ),
        Commands::Tcp { port, reattach } => {
            (TunnelProtocol::Tcp, *port, None, None, reattach.clone(), false)
        }
        Commands::Tls { port, reattach } => {
            (TunnelProtocol::Tls, *port, None, None, reattach.clone(), false)
        }
        Commands::Udp { port } => (TunnelProtocol::Udp, *port, None, None, None, false),
    };

    let init = Frame::Init {
        protocol,
        local_url: format!("{protocol}://localhost:{local_port}"),
        token: cli.token.clone(),
        api_key: cli.api_key.clone(),
        subdomain,
        tunnel_id: reattach,
        host,
        force_new,
    };

    match run(&cli.server, init, protocol, local_port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(msg)) => {
            error!("{msg}");
            ExitCode::from(1)
        }
        Err(RunError::Network(msg)) => {
            error!("{msg}");
            ExitCode::from(2)
        }
    }
}

async fn run(
    server: &str,
    init: Frame,
    protocol: TunnelProtocol,
    local_port: u16,
) -> Result<(), RunError> {
    info!("connecting to {server}");
    let (ws, _) = connect_async(server)
        .await
        .map_err(|e| RunError::Network(format!("upgrade failed: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let text = init
        .encode()
        .map_err(|e| RunError::Config(format!("init frame: {e}")))?;
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|e| RunError::Network(format!("init send failed: {e}")))?;

    // The first server frame decides whether this tunnel exists.
    let created = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => break Frame::decode(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => break Frame::decode(&data),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RunError::Network(format!("upgrade read failed: {e}"))),
            None => return Err(RunError::Network("server closed during admission".into())),
        }
    };

    match created {
        Ok(Frame::TunnelCreated {
            tunnel_id,
            subdomain,
            public_url,
            public_port,
            ..
        }) => {
            println!();
            println!("  Tunnel up");
            println!("  Public:    {public_url}");
            if let Some(port) = public_port {
                println!("  Port:      {port}");
            }
            println!("  Local:     localhost:{local_port}");
            println!("  Subdomain: {subdomain}");
            println!("  Tunnel id: {tunnel_id}  (use --reattach to resume)");
            println!();
            println!("Press Ctrl+C to stop the tunnel");
            println!();
        }
        Ok(Frame::TunnelStatus { status, message, .. }) if status == "error" => {
            return Err(RunError::Config(format!(
                "tunnel refused: {}",
                message.unwrap_or_else(|| "unknown error".into())
            )));
        }
        Ok(other) => {
            return Err(RunError::Config(format!(
                "unexpected admission reply: {}",
                other.frame_type()
            )));
        }
        Err(e) => return Err(RunError::Config(format!("bad admission reply: {e}"))),
    }

    // Single-writer discipline: every task funnels frames through here.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(text) = frame.encode() else { continue };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let tunnel = LocalTunnel {
        protocol,
        local_port,
        frame_tx,
        streams: Arc::new(DashMap::new()),
        udp_peers: Arc::new(DashMap::new()),
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => tunnel.dispatch(text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => tunnel.dispatch(&data).await,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("server closed the link");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("link error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    drop(tunnel);
    writer.abort();
    Ok(())
}

/// Events pushed to one local origin socket.
enum StreamEvent {
    Data(Vec<u8>),
    Close,
}

/// Client-side tunnel state: local fan-out for every multiplexed stream.
struct LocalTunnel {
    protocol: TunnelProtocol,
    local_port: u16,
    frame_tx: mpsc::Sender<Frame>,
    /// conn-id -> sender feeding the local socket for that public conn.
    streams: Arc<DashMap<String, mpsc::Sender<StreamEvent>>>,
    /// public peer key -> sender feeding its local UDP socket.
    udp_peers: Arc<DashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl LocalTunnel {
    async fn dispatch(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable frame: {e}");
                return;
            }
        };

        match frame {
            Frame::Ping => {
                let _ = self.frame_tx.send(Frame::Pong).await;
            }
            Frame::Pong => {}

            Frame::HttpRequest {
                request_id,
                method,
                path,
                query,
                headers,
                body,
            } => {
                let frame_tx = self.frame_tx.clone();
                let local_port = self.local_port;
                tokio::spawn(async move {
                    debug!("{method} {path} -> localhost:{local_port}");
                    let reply = match origin::forward_http(
                        local_port,
                        &method,
                        &path,
                        query.as_deref(),
                        &headers,
                        body.as_deref(),
                    )
                    .await
                    {
                        Ok((status, headers, body)) => Frame::HttpResponse {
                            request_id,
                            status,
                            headers,
                            body: (!body.is_empty()).then_some(body),
                        },
                        Err(e) => Frame::HttpError {
                            request_id,
                            message: e.to_string(),
                        },
                    };
                    let _ = frame_tx.send(reply).await;
                });
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
                self.stream_frame(conn_id, data, close).await;
            }
            Frame::TcpError { conn_id, .. } | Frame::TlsError { conn_id, .. } => {
                if let Some((_, tx)) = self.streams.remove(&conn_id) {
                    let _ = tx.try_send(StreamEvent::Close);
                }
            }

            Frame::UdpData { addr, port, data } => {
                self.udp_frame(addr, port, data).await;
            }
            Frame::UdpError { message } => {
                warn!("udp relay error: {message}");
            }

            Frame::TunnelStatus { status, message, .. } => {
                if status == "error" {
                    warn!(
                        "server error: {}",
                        message.unwrap_or_else(|| "unknown".into())
                    );
                } else {
                    info!("tunnel status: {status}");
                }
            }

            other => {
                debug!("ignoring frame: {}", other.frame_type());
            }
        }
    }

    /// Route one stream chunk to its local socket, opening it on first use.
    async fn stream_frame(&self, conn_id: String, data: Vec<u8>, close: bool) {
        if !self.streams.contains_key(&conn_id) {
            if close && data.is_empty() {
                // EOF for a conn we never opened; nothing to do.
                return;
            }
            self.open_stream(conn_id.clone()).await;
        }
        let Some(tx) = self.streams.get(&conn_id).map(|e| e.clone()) else {
            return;
        };

        if !data.is_empty() && tx.send(StreamEvent::Data(data)).await.is_err() {
            self.streams.remove(&conn_id);
            return;
        }
        if close {
            let _ = tx.send(StreamEvent::Close).await;
        }
    }

    /// Connect to the local origin and start the pump pair for a conn-id.
    async fn open_stream(&self, conn_id: String) {
        let stream = match tokio::net::TcpStream::connect(format!("127.0.0.1:{}", self.local_port))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("origin connect failed: {e}");
                let _ = self
                    .frame_tx
                    .send(error_frame(self.protocol, &conn_id, &e.to_string()))
                    .await;
                return;
            }
        };

        let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(32);
        self.streams.insert(conn_id.clone(), events_tx);

        let (mut read_half, mut write_half) = stream.into_split();
        let frame_tx = self.frame_tx.clone();
        let protocol = self.protocol;
        let streams = self.streams.clone();

        // origin -> frames
        let outbound_conn = conn_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = frame_tx
                            .send(data_frame(protocol, &outbound_conn, vec![], true))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if frame_tx
                            .send(data_frame(protocol, &outbound_conn, buf[..n].to_vec(), false))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frame_tx
                            .send(error_frame(protocol, &outbound_conn, &e.to_string()))
                            .await;
                        break;
                    }
                }
            }
        });

        // frames -> origin
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    StreamEvent::Data(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    StreamEvent::Close => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
            streams.remove(&conn_id);
        });
    }

    /// Relay one public datagram through a per-peer local UDP socket, so
    /// origin replies find their way back to the right public source.
    async fn udp_frame(&self, addr: String, port: u16, data: Vec<u8>) {
        let key = format!("{addr}:{port}");

        if let Some(tx) = self.udp_peers.get(&key).map(|e| e.clone()) {
            let _ = tx.send(data).await;
            return;
        }

        let socket = match tokio::net::UdpSocket::bind("127.0.0.1:0").await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("udp socket bind failed: {e}");
                let _ = self
                    .frame_tx
                    .send(Frame::UdpError {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        if let Err(e) = socket.connect(format!("127.0.0.1:{}", self.local_port)).await {
            warn!("udp origin connect failed: {e}");
            return;
        }

        let (peer_tx, mut peer_rx) = mpsc::channel::<Vec<u8>>(64);
        self.udp_peers.insert(key.clone(), peer_tx.clone());
        let _ = peer_tx.send(data).await;

        let frame_tx = self.frame_tx.clone();
        let udp_peers = self.udp_peers.clone();
        tokio::spawn(async move {
            let socket = Arc::new(socket);
            let reader = socket.clone();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    maybe = peer_rx.recv() => {
                        let Some(datagram) = maybe else { break };
                        if socket.send(&datagram).await.is_err() {
                            break;
                        }
                    }
                    received = reader.recv(&mut buf) => {
                        let Ok(n) = received else { break };
                        let reply = Frame::UdpData {
                            addr: addr.clone(),
                            port,
                            data: buf[..n].to_vec(),
                        };
                        if frame_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            udp_peers.remove(&key);
        });
    }
}

fn data_frame(protocol: TunnelProtocol, conn_id: &str, data: Vec<u8>, close: bool) -> Frame {
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

fn error_frame(protocol: TunnelProtocol, conn_id: &str, message: &str) -> Frame {
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
