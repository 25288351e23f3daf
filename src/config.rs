use crate::transport::TransportConfig;
use hyper::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings shared by every proxied route
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Apps in configuration order
    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 8443 when TLS enabled, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(8443)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            tls: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Settings applied to every route. Changing them requires a restart;
/// a reload only rebuilds routes from the app list.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Max time to wait for backend response headers in seconds (default: 30)
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout_secs: u64,

    /// Bodies larger than this are passed through without rewriting (default: 50 MiB)
    #[serde(default = "default_max_rewrite_body_bytes")]
    pub max_rewrite_body_bytes: usize,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound on a WebSocket tunnel's lifetime in seconds (default: unbounded)
    pub websocket_max_lifetime_secs: Option<u64>,
}

impl ProxySettings {
    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout_secs)
    }

    pub fn websocket_max_lifetime(&self) -> Option<Duration> {
        self.websocket_max_lifetime_secs.map(Duration::from_secs)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            response_header_timeout: self.response_header_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_rewrite_body_bytes == 0 {
            return Err("proxy: 'max_rewrite_body_bytes' must be greater than 0".to_string());
        }
        if self.response_header_timeout_secs == 0 {
            return Err("proxy: 'response_header_timeout_secs' must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            response_header_timeout_secs: default_response_header_timeout(),
            max_rewrite_body_bytes: default_max_rewrite_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            websocket_max_lifetime_secs: None,
        }
    }
}

/// One app as supplied by the configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppDescriptor {
    /// Display name, slugified into the proxy path segment
    pub name: String,

    /// Backend URL, e.g. `http://10.0.0.5/admin`
    pub url: String,

    /// Whether the app is enabled at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether the app is served through the proxy (default: false)
    #[serde(default)]
    pub proxy: bool,

    /// Extra request headers sent to the backend, applied last
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Skip backend certificate verification (default: skip)
    pub skip_tls_verify: Option<bool>,
}

impl AppDescriptor {
    /// Create an enabled, proxied app
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
            proxy: true,
            headers: HashMap::new(),
            skip_tls_verify: None,
        }
    }

    /// Add a custom backend header (builder pattern)
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the TLS verification policy (builder pattern)
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = Some(skip);
        self
    }

    /// Whether a route should be built for this app
    pub fn is_proxied(&self) -> bool {
        self.enabled && self.proxy
    }

    /// Skipping verification is the default unless explicitly disabled
    pub fn skip_tls_verify(&self) -> bool {
        self.skip_tls_verify.unwrap_or(true)
    }

    /// Validate the app descriptor
    ///
    /// URL parse failures are not reported here: such apps are excluded
    /// when routes are built.
    pub fn validate(&self, index: usize) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("App #{}: 'name' must not be empty", index));
        }
        if self.url.trim().is_empty() {
            return Err(format!("App '{}': 'url' must not be empty", self.name));
        }
        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(format!("App '{}': invalid header name '{}'", self.name, name));
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(format!("App '{}': invalid value for header '{}'", self.name, name));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_response_header_timeout() -> u64 {
    30
}

fn default_max_rewrite_body_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.proxy.validate() {
            errors.push(e);
        }

        for (index, app) in self.apps.iter().enumerate() {
            if let Err(e) = app.validate(index) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Apps that should get a proxy route, in configuration order
    pub fn proxied_apps(&self) -> Vec<AppDescriptor> {
        self.apps.iter().filter(|a| a.is_proxied()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "127.0.0.1"

[proxy]
response_header_timeout_secs = 10
max_rewrite_body_bytes = 1048576

[[apps]]
name = "Pi-hole"
url = "http://10.0.0.5/admin"
proxy = true

[[apps]]
name = "Grafana"
url = "https://grafana.lan:3000"
proxy = true
skip_tls_verify = false

[apps.headers]
Authorization = "Bearer abc"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.proxy.response_header_timeout_secs, 10);
        assert_eq!(config.proxy.max_rewrite_body_bytes, 1048576);
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.apps[0].name, "Pi-hole");
        assert!(config.apps[0].skip_tls_verify());
        assert!(!config.apps[1].skip_tls_verify());
        assert_eq!(config.apps[1].headers.get("Authorization").unwrap(), "Bearer abc");
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert!(!config.tls_enabled());
        assert_eq!(config.https_port(), 0);
    }

    #[test]
    fn test_default_proxy_settings() {
        let settings = ProxySettings::default();
        assert_eq!(settings.response_header_timeout(), Duration::from_secs(30));
        assert_eq!(settings.max_rewrite_body_bytes, 50 * 1024 * 1024);
        assert_eq!(settings.pool_max_idle_per_host, 10);
        assert_eq!(settings.pool_idle_timeout_secs, 90);
        assert!(settings.websocket_max_lifetime().is_none());

        let transport = settings.transport_config();
        assert_eq!(transport.response_header_timeout, Duration::from_secs(30));
        assert_eq!(transport.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_app_defaults() {
        let app: AppDescriptor = toml::from_str(
            r#"
name = "Sonarr"
url = "http://sonarr:8989"
"#,
        )
        .unwrap();
        assert!(app.enabled);
        assert!(!app.proxy);
        assert!(!app.is_proxied());
        assert!(app.headers.is_empty());
        assert!(app.skip_tls_verify());
    }

    #[test]
    fn test_proxied_apps_filters_disabled_and_unproxied() {
        let mut disabled = AppDescriptor::new("Off", "http://off");
        disabled.enabled = false;
        let mut direct = AppDescriptor::new("Direct", "http://direct");
        direct.proxy = false;

        let config = Config {
            apps: vec![AppDescriptor::new("On", "http://on"), disabled, direct],
            ..Default::default()
        };

        let apps = config.proxied_apps();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "On");
    }

    #[test]
    fn test_tls_port_defaults_when_enabled() {
        let config = ServerConfig {
            tls: true,
            ..Default::default()
        };
        assert!(config.tls_enabled());
        assert_eq!(config.https_port(), 8443);
    }

    #[test]
    fn test_validate_rejects_empty_name_and_bad_header() {
        let config = Config {
            apps: vec![
                AppDescriptor::new("", "http://x"),
                AppDescriptor::new("Bad", "http://y").with_header("bad header", "v"),
            ],
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("App #0"));
        assert!(err.contains("invalid header name"));
    }

    #[test]
    fn test_validate_rejects_zero_body_cap() {
        let config = Config {
            proxy: ProxySettings {
                max_rewrite_body_bytes: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_url_is_not_a_config_error() {
        let config = Config {
            apps: vec![AppDescriptor::new("Odd", "not a url")],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[apps]]
name = "Home Assistant"
url = "http://ha.lan:8123"
proxy = true
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.server.port, 8080);
    }
}
