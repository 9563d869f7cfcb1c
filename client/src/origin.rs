//! Forwarding to the local origin service.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Replay one tunneled HTTP request against the local origin and collect
/// its response.
pub async fn forward_http(
    local_port: u16,
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<(u16, Vec<(String, String)>, Vec<u8>)> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{local_port}"))
        .await
        .context("origin connect failed")?;

    let target = match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    let mut request = format!("{method} {target} HTTP/1.1\r\nHost: localhost:{local_port}\r\n");
    for (key, value) in headers {
        // The request line and framing headers are ours to set.
        if key.eq_ignore_ascii_case("host")
            || key.eq_ignore_ascii_case("content-length")
            || key.eq_ignore_ascii_case("transfer-encoding")
            || key.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        request.push_str(&format!("{key}: {value}\r\n"));
    }
    request.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.map(|b| b.len()).unwrap_or(0)
    ));

    stream.write_all(request.as_bytes()).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }

    read_response(&mut stream).await
}

/// Read a whole HTTP/1.1 response: headers, then content-length bytes or
/// until the origin closes.
async fn read_response(stream: &mut TcpStream) -> Result<(u16, Vec<(String, String)>, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];

    let header_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break find_header_end(&buf);
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break Some(pos);
        }
        if buf.len() > 1024 * 1024 {
            anyhow::bail!("origin response headers too large");
        }
    };

    let Some(header_end) = header_end else {
        anyhow::bail!("origin sent no response headers");
    };

    let header_bytes = &buf[..header_end];
    let mut lines = header_bytes
        .split(|b| *b == b'\r' || *b == b'\n')
        .filter(|l| !l.is_empty());
    let status_line = lines.next().unwrap_or(&[]);
    let status = parse_status_code(status_line).unwrap_or(200);

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut content_len: Option<usize> = None;
    for line in lines {
        if let Some((k, v)) = split_header_kv(line) {
            if k.eq_ignore_ascii_case("content-length") {
                content_len = v.trim().parse::<usize>().ok();
            }
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let mut body = buf[header_end + 4..].to_vec();
    match content_len {
        Some(cl) => {
            while body.len() < cl {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..n]);
            }
            body.truncate(cl);
        }
        None => {
            // No framing: take whatever the origin writes until close.
            loop {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..n]);
            }
        }
    }

    Ok((status, headers, body))
}

pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn parse_status_code(line: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(line).ok()?;
    s.split_whitespace().nth(1)?.parse::<u16>().ok()
}

pub(crate) fn split_header_kv(line: &[u8]) -> Option<(&str, &str)> {
    let s = std::str::from_utf8(line).ok()?;
    let (k, v) = s.split_once(':')?;
    Some((k.trim(), v.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(15));
        assert_eq!(find_header_end(b"partial\r\n"), None);
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code(b"HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_code(b"garbage"), None);
    }

    #[test]
    fn test_split_header_kv() {
        assert_eq!(
            split_header_kv(b"Content-Type: text/html; charset=utf-8"),
            Some(("Content-Type", "text/html; charset=utf-8"))
        );
        assert_eq!(split_header_kv(b"no-colon-here"), None);
    }
}
