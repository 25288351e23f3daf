//! Raw HTTP/1.1 framing for the WebSocket upgrade handshake
//!
//! The tunnel talks to the backend over a bare socket, so the request is
//! serialized by hand and the response head is parsed line by line from a
//! buffered reader. Whatever the reader buffered past the head stays in
//! the reader for the bridge to deliver.

use crate::error::HandshakeError;
use hyper::header::{self, HeaderMap};
use hyper::{Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on the status line plus headers
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Serialize the upgrade request. `Host` comes first; any `Host` in
/// `headers` is skipped. Values that are not visible ASCII are dropped.
pub fn build_upgrade_request(method: &Method, path_and_query: &str, host: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, path_and_query).as_bytes());
    out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());

    for (name, value) in headers {
        if *name == header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");
    out
}

/// Parsed status line and headers of a backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    /// Headers in arrival order, names as sent
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Read a response head up to and including the blank line
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);

    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(HandshakeError::HeadTooLarge(MAX_HEAD_BYTES));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate blank lines before the status line
            if start == 0 {
                head.clear();
                continue;
            }
            break;
        }
    }

    parse_response_head(&head)
}

/// Parse a complete response head
pub fn parse_response_head(data: &[u8]) -> Result<ResponseHead, HandshakeError> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    let reason = parts.next().unwrap_or("").trim().to_string();

    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::BadStatusLine(status_line.to_string()));
    }
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| HandshakeError::BadStatusLine(status_line.to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HandshakeError::BadHeader(line.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(HandshakeError::BadHeader(line.to_string()));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead { status, reason, headers })
}

/// Read the body that follows a non-101 response head, up to `max` bytes.
///
/// Uses `Content-Length` or chunked framing when present and otherwise
/// reads until the backend closes.
pub async fn read_body<R>(reader: &mut R, head: &ResponseHead, max: usize) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(Vec::new());
    }

    if head.is_chunked() {
        return read_chunked(reader, max).await;
    }

    if let Some(len) = head.content_length() {
        if len > max {
            return Err(HandshakeError::BodyTooLarge(max));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => HandshakeError::UnexpectedEof,
            _ => HandshakeError::Io(e),
        })?;
        return Ok(body);
    }

    let mut body = Vec::new();
    let n = reader.take(max as u64 + 1).read_to_end(&mut body).await?;
    if n > max {
        return Err(HandshakeError::BodyTooLarge(max));
    }
    Ok(body)
}

async fn read_chunked<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
        let text = std::str::from_utf8(&line).map_err(|_| HandshakeError::BadChunk)?;
        let size_text = text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| HandshakeError::BadChunk)?;

        if size == 0 {
            // Trailers, then the final blank line
            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 || line == b"\r\n" || line == b"\n" {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > max {
            return Err(HandshakeError::BodyTooLarge(max));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(HandshakeError::BadChunk);
        }
    }
}
