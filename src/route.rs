//! Routes: one mounted backend app
//!
//! A route is built once from an [`AppDescriptor`] and is immutable
//! afterwards. The route table shares it across requests behind an `Arc`.

use crate::config::{AppDescriptor, ProxySettings};
use crate::error::RouteError;
use crate::rewrite::ContentRewriter;
use crate::slug::{proxy_prefix, slugify, PROXY_BASE};
use crate::transport::Transport;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use url::{Host, Url};

/// A backend app mounted under `/proxy/<slug>`
#[derive(Debug)]
pub struct Route {
    name: String,
    slug: String,
    prefix: String,
    target: Url,
    target_authority: String,
    target_path: String,
    dial_host: String,
    dial_port: u16,
    secure: bool,
    skip_tls_verify: bool,
    headers: HeaderMap,
    transport: Transport,
    rewriter: ContentRewriter,
    max_body_bytes: usize,
    websocket_max_lifetime: Option<Duration>,
}

/// Build a route for one app.
///
/// Fails when the URL does not parse as an absolute http(s)/ws(s) URL with
/// a host, when it points back into the proxy, or when the name leaves
/// nothing to slugify.
pub fn build_route(app: &AppDescriptor, settings: &ProxySettings) -> Result<Route, RouteError> {
    let name = app.name.clone();
    let raw = app.url.trim();

    if raw.starts_with(PROXY_BASE) {
        return Err(RouteError::ProxyLoop {
            name,
            url: app.url.clone(),
        });
    }

    let target = Url::parse(raw).map_err(|source| RouteError::InvalidUrl {
        name: name.clone(),
        url: app.url.clone(),
        source,
    })?;

    let secure = match target.scheme() {
        "http" | "ws" => false,
        "https" | "wss" => true,
        other => {
            return Err(RouteError::UnsupportedScheme {
                name,
                scheme: other.to_string(),
            })
        }
    };

    let (dial_host, authority_host) = match target.host() {
        Some(Host::Ipv6(addr)) => (addr.to_string(), format!("[{}]", addr)),
        Some(host) => (host.to_string(), host.to_string()),
        None => {
            return Err(RouteError::MissingHost {
                name,
                url: app.url.clone(),
            })
        }
    };
    if dial_host.is_empty() {
        return Err(RouteError::MissingHost {
            name,
            url: app.url.clone(),
        });
    }

    let target_authority = match target.port() {
        Some(port) => format!("{}:{}", authority_host, port),
        None => authority_host,
    };
    let dial_port = target
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });

    let slug = slugify(&app.name);
    if slug.is_empty() {
        return Err(RouteError::EmptySlug { name });
    }
    let prefix = proxy_prefix(&slug);
    let target_path = normalize_target_path(target.path());

    let mut headers = HeaderMap::new();
    for (key, value) in &app.headers {
        let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            return Err(RouteError::InvalidHeader {
                name,
                header: key.clone(),
            });
        };
        headers.insert(header_name, header_value);
    }

    let skip_tls_verify = app.skip_tls_verify();
    let transport = Transport::new(settings.transport_config(), skip_tls_verify).map_err(|source| {
        RouteError::Tls {
            name: name.clone(),
            source,
        }
    })?;

    let rewriter = ContentRewriter::new(&prefix, &target_path, &target_authority);

    Ok(Route {
        name,
        slug,
        prefix,
        target,
        target_authority,
        target_path,
        dial_host,
        dial_port,
        secure,
        skip_tls_verify,
        headers,
        transport,
        rewriter,
        max_body_bytes: settings.max_rewrite_body_bytes,
        websocket_max_lifetime: settings.websocket_max_lifetime(),
    })
}

/// `/` for an empty or root path, otherwise the path without trailing slashes
fn normalize_target_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl Route {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// `/proxy/<slug>`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// `host[:port]` as sent in the `Host` header
    pub fn target_authority(&self) -> &str {
        &self.target_authority
    }

    /// Normalized target path: `/` or a path without trailing slash
    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    /// Host and port for raw connections
    pub fn dial_addr(&self) -> (&str, u16) {
        (&self.dial_host, self.dial_port)
    }

    /// Whether the backend speaks TLS
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Scheme for ordinary HTTP requests (`ws`/`wss` targets map to `http`/`https`)
    pub fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn skip_tls_verify(&self) -> bool {
        self.skip_tls_verify
    }

    /// Per-app headers applied last to every backend request
    pub fn custom_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn rewriter(&self) -> &ContentRewriter {
        &self.rewriter
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn websocket_max_lifetime(&self) -> Option<Duration> {
        self.websocket_max_lifetime
    }
}
