use crate::body::modify_response;
use crate::director::{remove_hop_by_hop, ClientInfo};
use crate::error::{json_error_response, ProxyErrorCode, TransportError};
use crate::route::Route;
use crate::slug::PROXY_BASE;
use crate::table::RouteTable;
use crate::tunnel::{handle_upgrade, is_websocket_upgrade};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The path-prefix reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteTable>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, routes: Arc<RouteTable>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            routes,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            let client = ClientInfo { addr, is_tls: true };
                                            if let Err(e) = handle_connection(tls_stream, client, routes).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else {
                                    let client = ClientInfo { addr, is_tls: false };
                                    if let Err(e) = handle_connection(stream, client, routes).await {
                                        debug!(addr = %addr, error = %e, "Connection error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, client: ClientInfo, routes: Arc<RouteTable>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move { handle_request(req, routes, client).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Pull the slug out of `/proxy/<slug>[/...]`
pub fn extract_slug(path: &str) -> Result<&str, ProxyErrorCode> {
    let Some(rest) = path.strip_prefix(PROXY_BASE) else {
        return Err(ProxyErrorCode::NotProxied);
    };

    if rest.is_empty() {
        return Err(ProxyErrorCode::MalformedPath);
    }
    let Some(rest) = rest.strip_prefix('/') else {
        // `/proxyfoo` is not under the proxy base
        return Err(ProxyErrorCode::NotProxied);
    };

    let slug = rest.split('/').next().unwrap_or("");
    if slug.is_empty() {
        return Err(ProxyErrorCode::MalformedPath);
    }
    Ok(slug)
}

async fn handle_request(
    req: Request<Incoming>,
    routes: Arc<RouteTable>,
    client: ClientInfo,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let slug = match extract_slug(&path) {
        Ok(slug) => slug,
        Err(code) => {
            debug!(path, request_id, code = code.as_header_value(), "Rejected request path");
            let message = match code {
                ProxyErrorCode::MalformedPath => "Expected /proxy/<app>/...",
                _ => "Path is not under /proxy/",
            };
            return Ok(json_error_response(code, message));
        }
    };

    let Some(route) = routes.get(slug) else {
        debug!(slug, request_id, "Unknown app");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownApp,
            format!("No proxied app named '{}'", slug),
        ));
    };

    debug!(slug, method = %req.method(), path, request_id, "Incoming request");

    if is_websocket_upgrade(req.headers()) {
        return Ok(handle_upgrade(route, req, client, request_id).await);
    }

    Ok(forward_request(&route, req, &client, &request_id).await)
}

/// Send a request through the route's transport and rewrite the response
async fn forward_request(
    route: &Route,
    req: Request<Incoming>,
    client: &ClientInfo,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let method = req.method().clone();

    let outbound = match route.direct(req, client, request_id) {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(slug = %route.slug(), request_id, error = %e, "Failed to build backend request");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to build backend request");
        }
    };
    let backend_path = outbound.uri().path().to_string();

    let mut response = match route.transport().send(outbound).await {
        Ok(response) => response,
        Err(TransportError::Timeout(timeout)) => {
            warn!(
                slug = %route.slug(),
                backend_path,
                request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            return json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            );
        }
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(slug = %route.slug(), backend_path, request_id, error = %e, "Failed to forward request");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
    };

    debug!(
        slug = %route.slug(),
        backend_path,
        request_id,
        status = response.status().as_u16(),
        "Backend responded"
    );

    remove_hop_by_hop(response.headers_mut());
    modify_response(route.rewriter(), &method, route.max_body_bytes(), response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_slug() {
        assert_eq!(extract_slug("/proxy/pi-hole/admin/index.php"), Ok("pi-hole"));
        assert_eq!(extract_slug("/proxy/grafana"), Ok("grafana"));
        assert_eq!(extract_slug("/proxy/grafana/"), Ok("grafana"));
    }

    #[test]
    fn test_extract_slug_malformed() {
        assert_eq!(extract_slug("/proxy"), Err(ProxyErrorCode::MalformedPath));
        assert_eq!(extract_slug("/proxy/"), Err(ProxyErrorCode::MalformedPath));
        assert_eq!(extract_slug("/proxy//x"), Err(ProxyErrorCode::MalformedPath));
    }

    #[test]
    fn test_extract_slug_outside_base() {
        assert_eq!(extract_slug("/"), Err(ProxyErrorCode::NotProxied));
        assert_eq!(extract_slug("/dashboard"), Err(ProxyErrorCode::NotProxied));
        assert_eq!(extract_slug("/proxyish/x"), Err(ProxyErrorCode::NotProxied));
    }
}
