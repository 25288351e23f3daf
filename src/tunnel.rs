//! WebSocket tunnel
//!
//! The pooled client cannot hand over a raw connection, so upgrades go
//! over a dedicated socket: dial the backend, write the handshake by hand,
//! read the response head, and on 101 splice the client and backend
//! streams together. Any other status is relayed as an ordinary response.

use crate::director::ClientInfo;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::handshake::{build_upgrade_request, read_body, read_response_head, ResponseHead};
use crate::route::Route;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Check if a request asks for a WebSocket upgrade.
///
/// `Connection` may list several tokens, so it only has to contain
/// "upgrade"; `Upgrade` must be exactly "websocket". Both ignore case.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

/// Tunnel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    HandshakeSent,
    AwaitingBackendResponse,
    Bridging,
    Rejected,
    Closed,
}

/// Connection to a backend, plain or TLS
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a raw connection to the route's backend, wrapped in TLS for
/// `https`/`wss` targets
pub async fn dial(route: &Route) -> io::Result<BackendStream> {
    let (host, port) = route.dial_addr();
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    if !route.is_secure() {
        return Ok(BackendStream::Plain(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let connector = TlsConnector::from(route.transport().tls_config());
    let tls = connector.connect(server_name, tcp).await?;
    Ok(BackendStream::Tls(Box::new(tls)))
}

/// Copy bytes both ways until both directions finish.
///
/// Each direction shuts down its writer once its reader hits EOF. Bytes a
/// buffered `backend` already holds are delivered before anything newly
/// read from the socket.
pub async fn bridge<C, B>(client: C, backend: B) -> (io::Result<u64>, io::Result<u64>)
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    tokio::join!(upstream, downstream)
}

struct Tunnel {
    slug: String,
    request_id: String,
    state: TunnelState,
}

impl Tunnel {
    fn enter(&mut self, next: TunnelState) {
        debug!(
            slug = %self.slug,
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next,
            "Tunnel state change"
        );
        self.state = next;
    }

    fn fail(&mut self, message: &str, error: &dyn std::fmt::Display) -> Response<BoxBody<Bytes, hyper::Error>> {
        warn!(
            slug = %self.slug,
            request_id = %self.request_id,
            state = ?self.state,
            error = %error,
            "{}",
            message
        );
        self.enter(TunnelState::Closed);
        json_error_response(ProxyErrorCode::ConnectionFailed, message)
    }
}

/// Handle a WebSocket upgrade request for `route`
pub async fn handle_upgrade<B>(
    route: Arc<Route>,
    mut req: Request<B>,
    client: ClientInfo,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!(slug = %route.slug(), request_id, "Connection cannot be upgraded");
        return json_error_response(ProxyErrorCode::WebsocketUnsupported, "WebSocket not supported");
    };

    let mut tunnel = Tunnel {
        slug: route.slug().to_string(),
        request_id: request_id.clone(),
        state: TunnelState::Dialing,
    };

    let mut path_and_query = route.resolve_backend_path(req.uri().path());
    if let Some(query) = req.uri().query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    let headers = route.upgrade_headers(req.headers(), req.uri(), &client, &request_id);
    let raw = build_upgrade_request(req.method(), &path_and_query, route.target_authority(), &headers);

    debug!(slug = %route.slug(), request_id, backend_path = %path_and_query, "Dialing backend for upgrade");

    let mut stream = match dial(&route).await {
        Ok(stream) => stream,
        Err(e) => return tunnel.fail("Failed to connect to backend", &e),
    };

    if let Err(e) = async {
        stream.write_all(&raw).await?;
        stream.flush().await
    }
    .await
    {
        return tunnel.fail("Failed to send upgrade request", &e);
    }
    tunnel.enter(TunnelState::HandshakeSent);

    let mut reader = BufReader::new(stream);
    tunnel.enter(TunnelState::AwaitingBackendResponse);
    let head = match read_response_head(&mut reader).await {
        Ok(head) => head,
        Err(e) => return tunnel.fail("Invalid upgrade response from backend", &e),
    };

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        tunnel.enter(TunnelState::Rejected);
        info!(slug = %route.slug(), request_id, status = %head.status, "Backend refused upgrade");
        let body = match read_body(&mut reader, &head, route.max_body_bytes()).await {
            Ok(body) => body,
            Err(e) => return tunnel.fail("Failed to read backend response", &e),
        };
        tunnel.enter(TunnelState::Closed);
        return relay_rejection(&head, body);
    }

    let response = switching_protocols(&head);
    let lifetime = route.websocket_max_lifetime();
    info!(slug = %route.slug(), request_id, "WebSocket upgrade accepted");

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(slug = %tunnel.slug, request_id = %tunnel.request_id, error = %e, "Client upgrade failed");
                tunnel.enter(TunnelState::Closed);
                return;
            }
        };

        tunnel.enter(TunnelState::Bridging);
        let bridged = bridge(TokioIo::new(upgraded), reader);
        let outcome = match lifetime {
            Some(limit) => match tokio::time::timeout(limit, bridged).await {
                Ok(outcome) => Some(outcome),
                Err(_) => {
                    info!(
                        slug = %tunnel.slug,
                        request_id = %tunnel.request_id,
                        limit_secs = limit.as_secs(),
                        "WebSocket tunnel reached its maximum lifetime"
                    );
                    None
                }
            },
            None => Some(bridged.await),
        };

        if let Some((upstream, downstream)) = outcome {
            match (upstream, downstream) {
                (Ok(client_to_backend), Ok(backend_to_client)) => {
                    debug!(
                        slug = %tunnel.slug,
                        request_id = %tunnel.request_id,
                        client_to_backend,
                        backend_to_client,
                        "WebSocket tunnel closed"
                    );
                }
                (up, down) => {
                    debug!(
                        slug = %tunnel.slug,
                        request_id = %tunnel.request_id,
                        upstream_error = ?up.err(),
                        downstream_error = ?down.err(),
                        "WebSocket tunnel closed with error"
                    );
                }
            }
        }
        tunnel.enter(TunnelState::Closed);
    });

    response
}

/// Response headers that describe the backend connection, not the message
fn is_connection_header(name: &HeaderName) -> bool {
    *name == header::CONTENT_LENGTH
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONNECTION
        || name.as_str() == "keep-alive"
}

/// Parsed head headers that are valid HTTP, in arrival order
fn head_headers(head: &ResponseHead) -> impl Iterator<Item = (HeaderName, HeaderValue)> + '_ {
    head.headers.iter().filter_map(|(name, value)| {
        Some((
            HeaderName::from_bytes(name.as_bytes()).ok()?,
            HeaderValue::from_str(value).ok()?,
        ))
    })
}

fn switching_protocols(head: &ResponseHead) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    for (name, value) in head_headers(head) {
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        headers.append(name, value);
    }
    response
}

/// The backend's non-101 answer as an ordinary response
fn relay_rejection(head: &ResponseHead, body: Vec<u8>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
    *response.status_mut() = head.status;

    let headers = response.headers_mut();
    for (name, value) in head_headers(head) {
        if is_connection_header(&name) {
            continue;
        }
        headers.append(name, value);
    }
    response
}
