//! App name to path segment mapping

/// Base path under which every app is mounted
pub const PROXY_BASE: &str = "/proxy";

/// Convert an app display name into a URL-safe path segment.
///
/// ASCII letters are lowercased, digits pass through, and each space,
/// hyphen or underscore becomes one hyphen. Everything else is dropped.
/// Separators are not collapsed, so `"a  b"` becomes `"a--b"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'A'..='Z' => slug.push(c.to_ascii_lowercase()),
            'a'..='z' | '0'..='9' => slug.push(c),
            ' ' | '-' | '_' => slug.push('-'),
            _ => {}
        }
    }
    slug
}

/// Proxy prefix (`/proxy/<slug>`) for a slug
pub fn proxy_prefix(slug: &str) -> String {
    format!("{}/{}", PROXY_BASE, slug)
}
