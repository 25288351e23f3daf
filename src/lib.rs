//! Mountgate - A path-prefix reverse proxy for self-hosted web apps
//!
//! This library mounts configured backend apps under one origin:
//! - Routes `/proxy/<slug>/...` to the app whose name slugifies to `<slug>`
//! - Rewrites HTML, CSS, JavaScript, JSON and XML so absolute paths stay under the prefix
//! - Injects a client-side interceptor into HTML for runtime URL construction
//! - Rewrites redirect, cookie and link headers and strips framing restrictions
//! - Tunnels WebSocket upgrades to the backend
//! - Rebuilds the route table on reload without dropping in-flight requests

pub mod body;
pub mod config;
pub mod director;
pub mod error;
pub mod handshake;
pub mod headers;
pub mod interceptor;
pub mod proxy;
pub mod rewrite;
pub mod route;
pub mod slug;
pub mod table;
pub mod tls;
pub mod transport;
pub mod tunnel;
