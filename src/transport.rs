//! Outbound HTTP(S) client for one route's backend
//!
//! Each route owns a pooled client so its TLS policy and connection pool
//! are independent of every other route.

use crate::error::TransportError;
use crate::tls;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for a backend transport
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Requests handed to the client
    pub total_requests: AtomicU64,
    /// Requests that got no response headers in time
    pub timeouts: AtomicU64,
    /// Requests that failed before a response arrived
    pub failures: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Configuration for a backend transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// How long to wait for response headers
    pub response_header_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            response_header_timeout: Duration::from_secs(30),
        }
    }
}

/// Pooled HTTP/1.1 client speaking plain HTTP or TLS to one backend
pub struct Transport {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    tls: Arc<ClientConfig>,
    stats: Arc<TransportStats>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig, skip_tls_verify: bool) -> Result<Self, rustls::Error> {
        let tls = tls::client_config(skip_tls_verify)?;

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            skip_tls_verify,
            "Backend transport initialized"
        );

        Ok(Self {
            client,
            tls: Arc::new(tls),
            stats: Arc::new(TransportStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// TLS settings for connections made outside the pooled client
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }

    /// Send a request and wait for the response headers.
    ///
    /// The timeout covers only the wait for headers; the body streams
    /// afterwards without a deadline.
    pub async fn send(&self, req: Request<Incoming>) -> Result<Response<Incoming>, TransportError> {
        self.stats.record_request();

        let timeout = self.config.response_header_timeout;
        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.stats.record_failure();
                Err(TransportError::Client(e))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
