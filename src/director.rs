//! Request direction: turning an inbound `/proxy/<slug>/...` request into
//! the request the backend sees

use crate::route::Route;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Uri, Version};
use std::net::SocketAddr;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

/// Encodings the body rewriter can decode
const ACCEPTED_ENCODINGS: &str = "gzip, identity";

/// Headers meaningful only for a single transport-level connection
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The inbound connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub is_tls: bool,
}

impl ClientInfo {
    fn proto(&self) -> &'static str {
        if self.is_tls {
            "https"
        } else {
            "http"
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

impl Route {
    /// Map an inbound path to the path requested from the backend.
    ///
    /// The route prefix is stripped (an empty remainder is `/`), along with
    /// any further copies of the prefix a page may have glued onto its own
    /// URLs. `/api` and `/api/...` go to the backend's root; everything
    /// else lands under the target path.
    pub fn resolve_backend_path(&self, path: &str) -> String {
        let prefix = self.prefix();

        let mut rest = path.strip_prefix(prefix).unwrap_or(path).to_string();
        if rest.is_empty() {
            rest.push('/');
        }
        if rest.contains(prefix) {
            rest = rest.replace(prefix, "");
            if rest.is_empty() {
                rest.push('/');
            }
        }

        let target = self.target_path();
        if target == "/" || rest == "/api" || rest.starts_with("/api/") {
            return rest;
        }

        if rest.starts_with('/') {
            format!("{}{}", target, rest)
        } else {
            format!("{}/{}", target, rest)
        }
    }

    /// Rewrite an inbound request into the backend request
    pub fn direct<B>(
        &self,
        req: Request<B>,
        client: &ClientInfo,
        request_id: &str,
    ) -> Result<Request<B>, hyper::http::Error> {
        let (mut parts, body) = req.into_parts();

        let mut path_and_query = self.resolve_backend_path(parts.uri.path());
        if let Some(query) = parts.uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let original_host = original_host(&parts.headers, &parts.uri);
        parts.uri = Uri::builder()
            .scheme(self.http_scheme())
            .authority(self.target_authority())
            .path_and_query(path_and_query)
            .build()?;
        parts.version = Version::HTTP_11;

        remove_hop_by_hop(&mut parts.headers);
        self.outbound_headers(&mut parts.headers, client, request_id, original_host);
        parts
            .headers
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        self.apply_custom_headers(&mut parts.headers);

        Ok(Request::from_parts(parts, body))
    }

    /// Headers for the raw upgrade request. Hop-by-hop headers stay: the
    /// handshake needs `Connection` and `Upgrade`.
    pub fn upgrade_headers(
        &self,
        inbound: &HeaderMap,
        uri: &Uri,
        client: &ClientInfo,
        request_id: &str,
    ) -> HeaderMap {
        let mut headers = inbound.clone();
        let original_host = original_host(inbound, uri);
        self.outbound_headers(&mut headers, client, request_id, original_host);
        self.apply_custom_headers(&mut headers);
        headers
    }

    /// Backend host, request ID and forwarding headers
    fn outbound_headers(
        &self,
        headers: &mut HeaderMap,
        client: &ClientInfo,
        request_id: &str,
        original_host: Option<HeaderValue>,
    ) {
        if let Ok(host) = HeaderValue::from_str(self.target_authority()) {
            headers.insert(header::HOST, host);
        }

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        let ip = client.addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
            _ => ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if !headers.contains_key(X_FORWARDED_HOST) {
            if let Some(host) = original_host {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }

        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(client.proto()));
        }

        if !headers.contains_key(X_REAL_IP) {
            if let Ok(value) = HeaderValue::from_str(&ip) {
                headers.insert(X_REAL_IP, value);
            }
        }
    }

    fn apply_custom_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in self.custom_headers() {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Host the client addressed: the `Host` header, or the URI authority on HTTP/2
fn original_host(headers: &HeaderMap, uri: &Uri) -> Option<HeaderValue> {
    headers.get(header::HOST).cloned().or_else(|| {
        uri.authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    })
}
