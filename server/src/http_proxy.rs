//! Public HTTP router: Host-based tunnel resolution, request framing,
//! and response correlation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use tunlink_shared::Frame;

use crate::ratelimit::RateDecision;
use crate::registry::{normalize_host, subdomain_of};
use crate::repository::{RequestLog, REPO_BUDGET};
use crate::tunnel::{HttpReply, TunnelConnection, TunnelStatus};
use crate::AppState;

/// Largest request body accepted for tunneling.
pub const MAX_BODY: usize = 32 * 1024 * 1024;

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Tunnel not found</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 4em;">
<h1>404</h1>
<p>There is no tunnel at this address. It may have been closed, or it never existed.</p>
</body>
</html>"#;

enum Resolution {
    /// A live connection serves this host.
    Live(Arc<TunnelConnection>),
    /// The tunnel exists but has no usable link right now.
    Unavailable,
    /// Nothing answers to this host.
    Unknown,
}

/// Fallback handler for everything the reserved routes don't take.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let conn = match resolve(&state, &host).await {
        Resolution::Live(conn) => conn,
        Resolution::Unavailable => {
            return (StatusCode::BAD_GATEWAY, "Tunnel is not connected".to_string())
                .into_response();
        }
        Resolution::Unknown => {
            debug!(%host, "no tunnel for host");
            return (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                NOT_FOUND_PAGE.to_string(),
            )
                .into_response();
        }
    };

    if let RateDecision::Deny { retry_after_secs } =
        state.limiter.check(&conn.id.to_string(), &conn.limits).await
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            "Rate limit exceeded".to_string(),
        )
            .into_response();
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);

    // Host goes through as observed; forwarding headers are added on top.
    let mut headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();
    append_forwarded_for(&mut headers, peer.ip().to_string());
    upsert(&mut headers, "X-Forwarded-Proto", "http");

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY).await {
        Ok(b) => b,
        Err(_) => {
            warn!(%host, "request body over limit");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
                .into_response();
        }
    };
    let bytes_in = body_bytes.len() as u64;

    let request_id = Uuid::new_v4().to_string();
    let frame = Frame::HttpRequest {
        request_id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        query,
        headers,
        body: (!body_bytes.is_empty()).then(|| body_bytes.to_vec()),
    };

    let reply_rx = conn.register_pending(&request_id);

    if conn.send(frame).await.is_err() {
        conn.remove_pending(&request_id);
        return finish(
            &state, &conn, &method, &path, StatusCode::BAD_GATEWAY, started, bytes_in, 0,
            "Tunnel link lost".into(),
        )
        .await;
    }

    match timeout(state.config.request_timeout, reply_rx).await {
        Ok(Ok(HttpReply::Response {
            status,
            headers,
            body,
        })) => {
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let body = body.unwrap_or_default();
            let bytes_out = body.len() as u64;

            let mut builder = hyper::Response::builder().status(status_code);
            if let Some(dst) = builder.headers_mut() {
                for (k, v) in &headers {
                    if is_hop_by_hop(k) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) = (
                        hyper::header::HeaderName::from_bytes(k.as_bytes()),
                        hyper::header::HeaderValue::from_str(v),
                    ) {
                        dst.append(name, value);
                    }
                }
            }

            record(&state, &conn, &method, &path, status, started, bytes_in, bytes_out).await;

            match builder.body(Body::from(body)) {
                Ok(resp) => resp.into_response(),
                Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
            }
        }
        Ok(Ok(HttpReply::Error(message))) => {
            finish(
                &state, &conn, &method, &path, StatusCode::BAD_GATEWAY, started, bytes_in, 0,
                format!("Upstream error: {message}"),
            )
            .await
        }
        // The sender vanished without a reply: the link died mid-request.
        Ok(Err(_)) => {
            finish(
                &state, &conn, &method, &path, StatusCode::BAD_GATEWAY, started, bytes_in, 0,
                "Tunnel link lost".into(),
            )
            .await
        }
        Err(_) => {
            conn.remove_pending(&request_id);
            finish(
                &state, &conn, &method, &path, StatusCode::GATEWAY_TIMEOUT, started, bytes_in, 0,
                "Upstream timed out".into(),
            )
            .await
        }
    }
}

/// Error tail: record the outcome and emit a plain-text status body.
#[allow(clippy::too_many_arguments)]
async fn finish(
    state: &AppState,
    conn: &TunnelConnection,
    method: &str,
    path: &str,
    status: StatusCode,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
    body: String,
) -> Response {
    record(state, conn, method, path, status.as_u16(), started, bytes_in, bytes_out).await;
    (status, body).into_response()
}

#[allow(clippy::too_many_arguments)]
async fn record(
    state: &AppState,
    conn: &TunnelConnection,
    method: &str,
    path: &str,
    status: u16,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
) {
    let latency = started.elapsed();
    state
        .metrics
        .record_request(status, latency.as_micros() as u64, bytes_in, bytes_out)
        .await;
    state.logger.push(RequestLog {
        tunnel_id: conn.id,
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms: latency.as_millis() as u64,
        req_size: bytes_in,
        resp_size: bytes_out,
        at: Utc::now(),
    });
}

/// Host resolution: live subdomain, live custom domain, then the cold
/// repository path for domains assigned before this process started.
async fn resolve(state: &AppState, host: &str) -> Resolution {
    let host = normalize_host(host);

    if let Some(conn) = state.registry.resolve_host(&host, &state.config.base_domain) {
        if conn.is_closed() {
            return Resolution::Unavailable;
        }
        return Resolution::Live(conn);
    }

    // A reserved-but-disconnected subdomain is a known tunnel without a link.
    if let Some(sub) = subdomain_of(&host, &state.config.base_domain) {
        if state.pool.is_reserved(sub) {
            return Resolution::Unavailable;
        }
        return Resolution::Unknown;
    }

    // Custom domain not in the index yet: ask the repository and warm it.
    let found = match timeout(REPO_BUDGET, state.repo.get_tunnel_by_custom_domain(&host)).await {
        Ok(Ok(found)) => found,
        Ok(Err(err)) => {
            warn!(%err, %host, "custom domain lookup failed");
            None
        }
        Err(_) => {
            warn!(%host, "custom domain lookup timed out");
            None
        }
    };

    match found {
        Some(record) if record.status == TunnelStatus::Active => {
            let _ = state
                .registry
                .assign_custom_domain(&host, &record.subdomain);
            match state.registry.get(&record.subdomain) {
                Some(conn) if !conn.is_closed() => Resolution::Live(conn),
                _ => Resolution::Unavailable,
            }
        }
        Some(_) => Resolution::Unavailable,
        None => Resolution::Unknown,
    }
}

/// Headers that must not cross the proxy boundary.
pub fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
    ) || name.starts_with("proxy-")
}

/// Append the peer to an existing X-Forwarded-For chain, or start one.
fn append_forwarded_for(headers: &mut Vec<(String, String)>, peer: String) {
    if let Some(existing) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-for"))
    {
        existing.1 = format!("{}, {}", existing.1, peer);
    } else {
        headers.push(("X-Forwarded-For".to_string(), peer));
    }
}

/// Insert or replace a header.
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}
