use mountgate::config::Config;
use mountgate::proxy::ProxyServer;
use mountgate::table::{RebuildResult, RouteTable};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mountgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let routes = Arc::new(RouteTable::new(config.proxy.clone()));
    log_rebuild(&routes.rebuild(&config.proxied_apps()));

    if !routes.has_routes() {
        warn!("No proxied apps configured, every request will be rejected");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tls_acceptor = if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };

        let tls_config =
            rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .and_then(|b| b.with_no_client_auth().with_single_cert(certs, key))
                .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    // Create HTTP proxy server (if port > 0)
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    let http_proxy_handle = if http_port > 0 {
        let http_addr = bind_addr(&config.server.bind, http_port, "HTTP")?;
        let http_proxy = ProxyServer::new(http_addr, Arc::clone(&routes), shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = http_proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    // Create HTTPS proxy server (if TLS enabled and port > 0)
    let https_proxy_handle = match tls_acceptor {
        Some(acceptor) if https_port > 0 => {
            let https_addr = bind_addr(&config.server.bind, https_port, "HTTPS")?;
            let https_proxy =
                ProxyServer::new(https_addr, Arc::clone(&routes), shutdown_rx.clone()).with_tls(acceptor);

            Some(tokio::spawn(async move {
                if let Err(e) = https_proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        _ => None,
    };

    if http_proxy_handle.is_none() && https_proxy_handle.is_none() {
        anyhow::bail!("No listener enabled: set server.port or enable TLS");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, rebuilding routes...");
                    match Config::load(&config_path) {
                        Ok(reloaded) => log_rebuild(&routes.rebuild(&reloaded.proxied_apps())),
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration, keeping current routes");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_proxy_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_proxy_handle {
            let _ = handle.await;
        }
    })
    .await;

    log_transport_stats(&routes);

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(bind: &str, port: u16, protocol: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, protocol, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid {} bind address: {}", protocol, e)
    })
}

fn log_rebuild(result: &RebuildResult) {
    if !result.added.is_empty() {
        info!(apps = ?result.added, "Apps mounted");
    }
    if !result.removed.is_empty() {
        info!(apps = ?result.removed, "Apps unmounted");
    }
    for collision in &result.collisions {
        warn!(
            slug = %collision.slug,
            kept = %collision.kept,
            replaced = %collision.replaced,
            "Apps share a slug"
        );
    }
    for exclusion in &result.excluded {
        warn!(app = %exclusion.name, reason = %exclusion.reason, "App not mounted");
    }
}

fn log_transport_stats(routes: &RouteTable) {
    for slug in routes.slugs() {
        let Some(route) = routes.get(&slug) else {
            continue;
        };
        let stats = route.transport().stats();
        info!(
            slug = %slug,
            requests = stats.get_total_requests(),
            timeouts = stats.get_timeouts(),
            failures = stats.get_failures(),
            "Backend transport stats"
        );
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        response_header_timeout_secs = config.proxy.response_header_timeout_secs,
        max_rewrite_body_bytes = config.proxy.max_rewrite_body_bytes,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        websocket_max_lifetime_secs = ?config.proxy.websocket_max_lifetime_secs,
        "Proxy settings"
    );
    info!(
        app_count = config.apps.len(),
        proxied = config.proxied_apps().len(),
        "Configured apps"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
