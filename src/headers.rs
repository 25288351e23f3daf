//! Response header rewriting
//!
//! Runs on every proxied response, whether or not the body is rewritten.

use crate::rewrite::ContentRewriter;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;
use url::Url;

/// Headers that would stop the app from rendering inside the embedding page
const FRAMING_HEADERS: [HeaderName; 3] = [
    header::X_FRAME_OPTIONS,
    header::CONTENT_SECURITY_POLICY,
    header::CONTENT_SECURITY_POLICY_REPORT_ONLY,
];

static REFRESH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(url\s*=\s*['"]?)([^'";\s]+)"#).expect("valid refresh regex"));
static COOKIE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(;\s*path\s*=\s*)([^;]*)").expect("valid cookie path regex"));
static LINK_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]*)>").expect("valid link regex"));

impl ContentRewriter {
    /// Rewrite a response's headers in place
    pub fn rewrite_response_headers(&self, headers: &mut HeaderMap) {
        for name in FRAMING_HEADERS.iter() {
            headers.remove(name);
        }

        for name in [header::LOCATION, header::CONTENT_LOCATION] {
            self.rewrite_each(headers, name, |value| self.rewrite_location(value));
        }
        self.rewrite_each(headers, header::REFRESH, |value| self.rewrite_refresh(value));
        self.rewrite_each(headers, header::SET_COOKIE, |value| self.rewrite_cookie_path(value));
        self.rewrite_each(headers, header::LINK, |value| self.rewrite_link(value));
    }

    /// Map a redirect target into the proxy. Root-relative paths and
    /// absolute or protocol-relative URLs pointing at the backend become
    /// proxied paths. Anything else is left alone (`None`).
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        let location = location.trim();

        if location.starts_with('/') && !location.starts_with("//") {
            let mapped = self.map_path(location.as_bytes())?;
            return String::from_utf8(mapped).ok();
        }

        let absolute = if location.starts_with("//") {
            Url::parse(&format!("http:{}", location)).ok()?
        } else {
            Url::parse(location).ok()?
        };

        if !matches!(absolute.scheme(), "http" | "https") || !self.is_backend_authority(&absolute) {
            return None;
        }

        let mut path = absolute.path().to_string();
        if let Some(query) = absolute.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(fragment) = absolute.fragment() {
            path.push('#');
            path.push_str(fragment);
        }

        // An absolute URL to an already-proxied path collapses to the path
        if self.is_proxied(path.as_bytes()) {
            return Some(path);
        }
        String::from_utf8(self.map_path(path.as_bytes())?).ok()
    }

    /// Rewrite the `url=` part of a `Refresh` value
    pub fn rewrite_refresh(&self, value: &str) -> Option<String> {
        let caps = REFRESH_URL.captures(value)?;
        let target = caps.get(2)?;
        let mapped = self.rewrite_location(target.as_str())?;
        Some(format!("{}{}{}", &value[..target.start()], mapped, &value[target.end()..]))
    }

    /// Rewrite the `Path` attribute of one `Set-Cookie` value
    pub fn rewrite_cookie_path(&self, cookie: &str) -> Option<String> {
        let caps = COOKIE_PATH.captures(cookie)?;
        let path_match = caps.get(2)?;
        let path = path_match.as_str().trim();

        if !path.starts_with('/') || self.is_proxied(path.as_bytes()) {
            return None;
        }

        let target = self.target_path();
        let rewritten = if target != "/" && crate::rewrite::has_path_prefix(path.as_bytes(), target.as_bytes()) {
            let rest = &path[target.len()..];
            if rest.is_empty() {
                format!("{}/", self.prefix())
            } else {
                format!("{}{}", self.prefix(), rest)
            }
        } else {
            format!("{}{}", self.prefix(), path)
        };

        Some(format!(
            "{}{}{}",
            &cookie[..path_match.start()],
            rewritten,
            &cookie[path_match.end()..]
        ))
    }

    /// Rewrite every `<path>` of a `Link` value
    pub fn rewrite_link(&self, value: &str) -> Option<String> {
        let mut changed = false;
        let out = LINK_TARGET.replace_all(value, |caps: &regex::Captures<'_>| match self.rewrite_location(&caps[1]) {
            Some(mapped) => {
                changed = true;
                format!("<{}>", mapped)
            }
            None => caps[0].to_string(),
        });
        changed.then(|| out.into_owned())
    }

    fn is_backend_authority(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        authority.eq_ignore_ascii_case(self.target_host())
    }

    /// Apply `f` to every value of `name`, keeping values `f` declines or
    /// whose rewrite is not a valid header value
    fn rewrite_each<F>(&self, headers: &mut HeaderMap, name: HeaderName, f: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if !headers.contains_key(&name) {
            return;
        }

        let values: Vec<HeaderValue> = headers
            .get_all(&name)
            .iter()
            .map(|value| {
                let rewritten = value
                    .to_str()
                    .ok()
                    .and_then(&f)
                    .and_then(|s| HeaderValue::from_str(&s).ok());
                match rewritten {
                    Some(new) => {
                        trace!(header = %name, from = ?value, to = ?new, "Rewrote response header");
                        new
                    }
                    None => value.clone(),
                }
            })
            .collect();

        headers.remove(&name);
        for value in values {
            headers.append(name.clone(), value);
        }
    }
}
