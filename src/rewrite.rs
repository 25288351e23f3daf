//! Response body rewriting for apps mounted under a proxy prefix
//!
//! Each route owns one [`ContentRewriter`], compiled once when the route is
//! built. A body runs through an ordered list of [`Pass`]es; each pass reads
//! the previous buffer and yields a new one. Every pass leaves paths already
//! under the route's prefix alone, so rewriting rewritten content is a no-op.

use crate::interceptor;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;

/// An open tag and the attributes before the one being matched. Keeps the
/// attribute patterns from touching script text such as `let integrity = x`.
const TAG_HEAD: &str =
    r#"(?P<tag><[A-Za-z][A-Za-z0-9\-]*(?:\s+[A-Za-z_:][-A-Za-z0-9_:.]*(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>"'=]+))?)*)"#;

/// Bundler-independent patterns. Per-route ones live on [`ContentRewriter`].
static INTEGRITY_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r#"(?i-u){}\s+integrity\s*=\s*(?:"[^"]*"|'[^']*')"#, TAG_HEAD))
        .expect("valid integrity regex")
});
static CROSSORIGIN_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(?i-u){}\s+crossorigin(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>"']+))?(?P<end>[\s/>])"#,
        TAG_HEAD
    ))
    .expect("valid crossorigin regex")
});
static INTEGRITY_ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)(?P<lhs>\.integrity\s*=)\s*[^=\s;,)][^;,)\n]*").expect("valid integrity assignment regex")
});
static SRI_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)(?P<lhs>\bsriHashes\s*=\s*)\{[^}]*\}").expect("valid sri table regex")
});
static SRCSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)(?P<open>\b(?:image)?srcset\s*=\s*)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#)
        .expect("valid srcset regex")
});
static BASE_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)(?P<open><base\b[^>]*?\bhref\s*=\s*["'])(?P<path>/[^"']*)"#).expect("valid base regex")
});
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)(?P<open>url\(\s*["']?)(?P<path>/[^"')\s]*)"#).expect("valid css url regex")
});
static ROOT_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?P<open>\s(?P<name>[A-Za-z_:][-A-Za-z0-9_:.]*)=)(?:"(?P<dq>/[^"]*)"|'(?P<sq>/[^']*)')"#)
        .expect("valid attribute regex")
});
static SPA_BASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?P<key>\b(?:urlBase|basePath|baseUrl|baseHref)["']?\s*[:=]\s*)(?P<empty>""|'')"#)
        .expect("valid spa base regex")
});
static JSON_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?P<open>"[A-Za-z_$][A-Za-z0-9_$.\-]*"\s*:\s*")(?P<path>/[^"]*)""#)
        .expect("valid json value regex")
});
static IMAGE_SET_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i-u)(?:-webkit-)?image-set\(").expect("valid image-set regex"));
static QUOTED_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?P<open>["'])(?P<path>/[^"']*)"#).expect("valid quoted path regex")
});
static JSON_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)\[\s*"/[^"]*"(?:\s*,\s*"[^"]*")*\s*\]"#).expect("valid json array regex")
});
static ARRAY_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?P<open>")(?P<path>/[^"]*)"#).expect("valid array element regex")
});
static CSS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)(?P<open>@import\s+(?:url\(\s*)?["']?)(?P<path>/[^"')\s;]*)"#).expect("valid import regex")
});
static SVG_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)(?P<open><(?:use|image)\b[^>]*?\b(?:xlink:)?href\s*=\s*["'])(?P<path>/[^"']*)"#)
        .expect("valid svg href regex")
});

/// One step of the body rewriting pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Drop `integrity`/`crossorigin` attributes and bundler SRI tables
    StripIntegrity,
    /// `http://<backend-host>/...` to a proxied root-relative path
    AbsoluteUrls,
    /// Target subpath in attributes, `url()` and quoted strings
    TargetSubpath,
    /// Every candidate of `srcset`
    Srcset,
    /// Remaining root-relative attributes, `url()` and `<base href>`
    RootRelative,
    /// Empty SPA base path keys (`urlBase: ""`, ...)
    SpaBasePath,
    /// `"key": "/path"` values
    JsonValues,
    /// Quoted paths inside CSS `image-set(...)`
    ImageSet,
    /// `["/a", "/b"]` arrays
    JsonArrays,
    /// CSS `@import`
    CssImports,
    /// SVG `<use>`/`<image>` hrefs
    SvgHrefs,
}

/// Pipeline for content the browser renders directly.
///
/// `ImageSet` must run before `JsonArrays`: the quoted, comma-separated
/// paths in an image-set list would otherwise be read as array elements.
/// `StripIntegrity` runs first because every later pass invalidates hashes.
pub const FULL_PIPELINE: [Pass; 11] = [
    Pass::StripIntegrity,
    Pass::AbsoluteUrls,
    Pass::TargetSubpath,
    Pass::Srcset,
    Pass::RootRelative,
    Pass::SpaBasePath,
    Pass::JsonValues,
    Pass::ImageSet,
    Pass::JsonArrays,
    Pass::CssImports,
    Pass::SvgHrefs,
];

/// Pipeline for content consumed by program code. Generic root-relative
/// and JSON rewriting is left to the injected interceptor for these.
pub const REDUCED_PIPELINE: [Pass; 4] = [
    Pass::StripIntegrity,
    Pass::AbsoluteUrls,
    Pass::TargetSubpath,
    Pass::SpaBasePath,
];

/// Content types whose bodies are rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    JavaScript,
    Json,
    Xml,
}

impl ContentKind {
    /// Classify a `Content-Type` header value. `None` means "do not rewrite".
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime = value
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "text/html" => Some(ContentKind::Html),
            "text/css" => Some(ContentKind::Css),
            "application/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
            | "text/javascript"
            | "text/x-javascript"
            | "text/ecmascript" => Some(ContentKind::JavaScript),
            "application/json" | "text/json" => Some(ContentKind::Json),
            "application/xml" | "text/xml" => Some(ContentKind::Xml),
            m if m.ends_with("+json") => Some(ContentKind::Json),
            m if m.ends_with("+xml") => Some(ContentKind::Xml),
            _ => None,
        }
    }

    pub fn pipeline(self) -> &'static [Pass] {
        match self {
            ContentKind::Html | ContentKind::Css => &FULL_PIPELINE,
            ContentKind::JavaScript | ContentKind::Json | ContentKind::Xml => &REDUCED_PIPELINE,
        }
    }
}

/// Per-route rewriter. Immutable once built and shared across requests.
#[derive(Debug)]
pub struct ContentRewriter {
    prefix: String,
    target_path: String,
    target_host: String,
    absolute_url: Regex,
    target_subpath: Option<Regex>,
    interceptor: Vec<u8>,
}

impl ContentRewriter {
    /// Compile a rewriter for `prefix` (`/proxy/<slug>`), the backend's
    /// normalized `target_path` (`/` or no trailing slash) and its
    /// `target_host` (`host[:port]`).
    pub fn new(prefix: &str, target_path: &str, target_host: &str) -> Self {
        let absolute_url = Regex::new(&format!(
            r#"(?-u)(?i:(?:https?:)?//{})(?P<path>/[^\s"'<>()`\\]*)?(?P<tail>[^A-Za-z0-9.:_\-]|$)"#,
            regex::escape(target_host)
        ))
        .expect("escaped host yields a valid regex");

        let target_subpath = (target_path != "/").then(|| {
            Regex::new(&format!(
                r#"(?-u)(?P<lead>\b(?:href|src|action|poster|content|data-[A-Za-z0-9_\-]+)\s*=\s*["']?|url\(\s*["']?|["'`])(?P<path>{})(?P<tail>[/?#"'`)\s>]|$)"#,
                regex::escape(target_path)
            ))
            .expect("escaped path yields a valid regex")
        });

        Self {
            prefix: prefix.to_string(),
            target_path: target_path.to_string(),
            target_host: target_host.to_string(),
            absolute_url,
            target_subpath,
            interceptor: interceptor::script_tag(prefix).into_bytes(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// Rewrite a whole body of the given kind. HTML additionally gets the
    /// interceptor script.
    pub fn rewrite(&self, kind: ContentKind, body: &[u8]) -> Vec<u8> {
        let mut buf = Cow::Borrowed(body);
        for pass in kind.pipeline() {
            step(&mut buf, |b| self.apply(*pass, b));
        }

        let out = buf.into_owned();
        if kind == ContentKind::Html {
            interceptor::inject(&out, &self.interceptor)
        } else {
            out
        }
    }

    /// Run a single pass. `None` means the input is unchanged.
    pub fn apply(&self, pass: Pass, input: &[u8]) -> Option<Vec<u8>> {
        match pass {
            Pass::StripIntegrity => self.strip_integrity(input),
            Pass::AbsoluteUrls => self.rewrite_absolute_urls(input),
            Pass::TargetSubpath => self.rewrite_target_subpath(input),
            Pass::Srcset => self.rewrite_srcsets(input),
            Pass::RootRelative => self.rewrite_root_relative(input),
            Pass::SpaBasePath => self.rewrite_spa_base(input),
            Pass::JsonValues => self.rewrite_json_values(input),
            Pass::ImageSet => self.rewrite_image_sets(input),
            Pass::JsonArrays => self.rewrite_json_arrays(input),
            Pass::CssImports => self.map_path_group(&CSS_IMPORT, input),
            Pass::SvgHrefs => self.map_path_group(&SVG_HREF, input),
        }
    }

    /// Whether `path` already sits under this route's prefix
    pub fn is_proxied(&self, path: &[u8]) -> bool {
        has_path_prefix(path, self.prefix.as_bytes())
    }

    /// Map a root-relative path under the proxy prefix, replacing the
    /// target subpath when the path starts with it. `None` for paths that
    /// are already proxied, protocol-relative, or not root-relative.
    pub fn map_path(&self, path: &[u8]) -> Option<Vec<u8>> {
        if !path.starts_with(b"/") || path.starts_with(b"//") || self.is_proxied(path) {
            return None;
        }
        Some([self.prefix.as_bytes(), self.strip_target(path)].concat())
    }

    /// Prepend the proxy prefix without touching the target subpath
    fn prefix_path(&self, path: &[u8]) -> Option<Vec<u8>> {
        if !path.starts_with(b"/") || path.starts_with(b"//") || self.is_proxied(path) {
            return None;
        }
        Some([self.prefix.as_bytes(), path].concat())
    }

    pub(crate) fn strip_target<'p>(&self, path: &'p [u8]) -> &'p [u8] {
        if self.target_path != "/" && has_path_prefix(path, self.target_path.as_bytes()) {
            &path[self.target_path.len()..]
        } else {
            path
        }
    }

    fn strip_integrity(&self, input: &[u8]) -> Option<Vec<u8>> {
        let mut buf = Cow::Borrowed(input);
        step(&mut buf, |b| replace_with(&INTEGRITY_ATTR, b, |caps| caps["tag"].to_vec()));
        step(&mut buf, |b| {
            replace_with(&CROSSORIGIN_ATTR, b, |caps| [&caps["tag"], &caps["end"]].concat())
        });
        step(&mut buf, |b| {
            replace_with(&INTEGRITY_ASSIGN, b, |caps| [&caps["lhs"], &b"\"\""[..]].concat())
        });
        step(&mut buf, |b| {
            replace_with(&SRI_TABLE, b, |caps| [&caps["lhs"], &b"{}"[..]].concat())
        });
        owned(buf)
    }

    fn rewrite_absolute_urls(&self, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(&self.absolute_url, input, |caps| {
            // `//host` inside `ws://host`, `ftp://host` and the like belongs to another scheme
            let start = caps.get(0).map_or(0, |m| m.start());
            if start > 0 && is_scheme_byte(input[start - 1]) {
                return caps[0].to_vec();
            }
            let path = caps.name("path").map_or(&b"/"[..], |m| m.as_bytes());
            let tail = caps.name("tail").map_or(&b""[..], |m| m.as_bytes());
            match self.map_path(path) {
                Some(mapped) => [&mapped[..], tail].concat(),
                None => caps[0].to_vec(),
            }
        })
    }

    fn rewrite_target_subpath(&self, input: &[u8]) -> Option<Vec<u8>> {
        let re = self.target_subpath.as_ref()?;
        replace_with(re, input, |caps| {
            [&caps["lead"], self.prefix.as_bytes(), &caps["tail"]].concat()
        })
    }

    fn rewrite_srcsets(&self, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(&SRCSET, input, |caps| {
            let (quote, value) = quoted_value(caps);
            let mut out = caps["open"].to_vec();
            out.push(quote);
            out.extend_from_slice(&self.rewrite_srcset_value(value));
            out.push(quote);
            out
        })
    }

    /// Rewrite each comma-separated candidate, keeping the original spacing
    pub fn rewrite_srcset_value(&self, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(value.len() + 16);
        for (i, candidate) in value.split(|&b| b == b',').enumerate() {
            if i > 0 {
                out.push(b',');
            }
            let start = candidate
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(candidate.len());
            let (lead, rest) = candidate.split_at(start);
            let end = rest
                .iter()
                .position(|b| b.is_ascii_whitespace())
                .unwrap_or(rest.len());
            let (url, descriptor) = rest.split_at(end);

            out.extend_from_slice(lead);
            match self.map_path(url) {
                Some(mapped) => out.extend_from_slice(&mapped),
                None => out.extend_from_slice(url),
            }
            out.extend_from_slice(descriptor);
        }
        out
    }

    fn rewrite_root_relative(&self, input: &[u8]) -> Option<Vec<u8>> {
        let mut buf = Cow::Borrowed(input);
        step(&mut buf, |b| self.map_path_group(&BASE_HREF, b));
        step(&mut buf, |b| self.map_path_group(&CSS_URL, b));
        step(&mut buf, |b| {
            replace_with(&ROOT_ATTR, b, |caps| {
                let name = &caps["name"];
                if name.eq_ignore_ascii_case(b"srcset") || name.eq_ignore_ascii_case(b"imagesrcset") {
                    return caps[0].to_vec();
                }
                let (quote, path) = quoted_value(caps);
                match self.map_path(path) {
                    Some(mapped) => {
                        let mut out = caps["open"].to_vec();
                        out.push(quote);
                        out.extend_from_slice(&mapped);
                        out.push(quote);
                        out
                    }
                    None => caps[0].to_vec(),
                }
            })
        });
        owned(buf)
    }

    fn rewrite_spa_base(&self, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(&SPA_BASE, input, |caps| {
            let quote = caps["empty"][0];
            let mut out = caps["key"].to_vec();
            out.push(quote);
            out.extend_from_slice(self.prefix.as_bytes());
            out.push(quote);
            out
        })
    }

    fn rewrite_json_values(&self, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(&JSON_VALUE, input, |caps| match self.prefix_path(&caps["path"]) {
            Some(mapped) => [&caps["open"], &mapped[..], &b"\""[..]].concat(),
            None => caps[0].to_vec(),
        })
    }

    fn rewrite_image_sets(&self, input: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut last = 0;

        for open in IMAGE_SET_OPEN.find_iter(input) {
            if open.start() < last {
                continue;
            }
            let Some(close) = matching_paren(input, open.end()) else {
                continue;
            };
            if let Some(args) = self.map_path_group(&QUOTED_ROOT, &input[open.end()..close]) {
                out.extend_from_slice(&input[last..open.end()]);
                out.extend_from_slice(&args);
                last = close;
            }
        }

        if last == 0 {
            return None;
        }
        out.extend_from_slice(&input[last..]);
        Some(out)
    }

    fn rewrite_json_arrays(&self, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(&JSON_ARRAY, input, |caps| {
            replace_with(&ARRAY_ELEMENT, &caps[0], |el| match self.prefix_path(&el["path"]) {
                Some(mapped) => [&el["open"], &mapped[..]].concat(),
                None => el[0].to_vec(),
            })
            .unwrap_or_else(|| caps[0].to_vec())
        })
    }

    /// Rewrite the `path` group of a pattern shaped `(?P<open>..)(?P<path>/..)`
    fn map_path_group(&self, re: &Regex, input: &[u8]) -> Option<Vec<u8>> {
        replace_with(re, input, |caps| match self.map_path(&caps["path"]) {
            Some(mapped) => [&caps["open"], &mapped[..]].concat(),
            None => caps[0].to_vec(),
        })
    }
}

/// Bytes that can end a URL scheme (`ws:`, `svn+ssh:`, ...)
fn is_scheme_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'-' | b':')
}

/// `prefix` matched at a path-segment boundary
pub(crate) fn has_path_prefix(path: &[u8], prefix: &[u8]) -> bool {
    path.starts_with(prefix)
        && matches!(path.get(prefix.len()), None | Some(b'/') | Some(b'?') | Some(b'#'))
}

/// Replace `buf` with the step's output when the step changed something
fn step<'a>(buf: &mut Cow<'a, [u8]>, f: impl FnOnce(&[u8]) -> Option<Vec<u8>>) {
    if let Some(next) = f(buf) {
        *buf = Cow::Owned(next);
    }
}

fn owned(buf: Cow<'_, [u8]>) -> Option<Vec<u8>> {
    match buf {
        Cow::Owned(v) => Some(v),
        Cow::Borrowed(_) => None,
    }
}

fn replace_with<F>(re: &Regex, input: &[u8], rep: F) -> Option<Vec<u8>>
where
    F: FnMut(&Captures<'_>) -> Vec<u8>,
{
    match re.replace_all(input, rep) {
        Cow::Owned(v) => Some(v),
        Cow::Borrowed(_) => None,
    }
}

/// Quote byte and value of a `dq`/`sq` alternation
fn quoted_value<'c>(caps: &Captures<'c>) -> (u8, &'c [u8]) {
    match caps.name("dq") {
        Some(m) => (b'"', m.as_bytes()),
        None => (b'\'', caps.name("sq").map_or(&b""[..], |m| m.as_bytes())),
    }
}

/// Index of the `)` closing a group whose contents start at `from`
fn matching_paren(input: &[u8], from: usize) -> Option<usize> {
    let mut depth = 1usize;
    for (i, &b) in input.iter().enumerate().skip(from) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> ContentRewriter {
        ContentRewriter::new("/proxy/app", "/admin", "10.0.0.5")
    }

    fn root_rewriter() -> ContentRewriter {
        ContentRewriter::new("/proxy/app", "/", "10.0.0.5:8080")
    }

    fn pass(rw: &ContentRewriter, pass: Pass, input: &str) -> String {
        let out = rw.apply(pass, input.as_bytes()).unwrap_or_else(|| input.as_bytes().to_vec());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_content_kind_classification() {
        assert_eq!(ContentKind::from_content_type("text/html; charset=utf-8"), Some(ContentKind::Html));
        assert_eq!(ContentKind::from_content_type("TEXT/CSS"), Some(ContentKind::Css));
        assert_eq!(ContentKind::from_content_type("application/javascript"), Some(ContentKind::JavaScript));
        assert_eq!(ContentKind::from_content_type("text/javascript"), Some(ContentKind::JavaScript));
        assert_eq!(ContentKind::from_content_type("application/manifest+json"), Some(ContentKind::Json));
        assert_eq!(ContentKind::from_content_type("application/xhtml+xml"), Some(ContentKind::Xml));
        assert_eq!(ContentKind::from_content_type("image/png"), None);
        assert_eq!(ContentKind::from_content_type("application/octet-stream"), None);
        assert_eq!(ContentKind::from_content_type(""), None);
    }

    #[test]
    fn test_pipeline_order() {
        let pos = |p: Pass| FULL_PIPELINE.iter().position(|x| *x == p).unwrap();
        assert_eq!(FULL_PIPELINE[0], Pass::StripIntegrity);
        assert!(pos(Pass::ImageSet) < pos(Pass::JsonArrays));
        assert!(pos(Pass::AbsoluteUrls) < pos(Pass::TargetSubpath));
        assert!(pos(Pass::Srcset) < pos(Pass::RootRelative));
        assert_eq!(
            REDUCED_PIPELINE,
            [Pass::StripIntegrity, Pass::AbsoluteUrls, Pass::TargetSubpath, Pass::SpaBasePath]
        );
        assert_eq!(ContentKind::Css.pipeline(), &FULL_PIPELINE[..]);
        assert_eq!(ContentKind::Json.pipeline(), &REDUCED_PIPELINE[..]);
    }

    #[test]
    fn test_map_path() {
        let rw = rewriter();
        assert_eq!(rw.map_path(b"/admin/x").unwrap(), b"/proxy/app/x");
        assert_eq!(rw.map_path(b"/admin").unwrap(), b"/proxy/app");
        assert_eq!(rw.map_path(b"/admin?tab=1").unwrap(), b"/proxy/app?tab=1");
        assert_eq!(rw.map_path(b"/administrator").unwrap(), b"/proxy/app/administrator");
        assert_eq!(rw.map_path(b"/static/a.css").unwrap(), b"/proxy/app/static/a.css");
        assert!(rw.map_path(b"/proxy/app/x").is_none());
        assert!(rw.map_path(b"/proxy/app").is_none());
        assert!(rw.map_path(b"//cdn.example.com/x").is_none());
        assert!(rw.map_path(b"relative/x").is_none());
    }

    #[test]
    fn test_strip_integrity_attributes() {
        let rw = rewriter();
        let out = pass(
            &rw,
            Pass::StripIntegrity,
            r#"<script src="/a.js" integrity="sha384-abc" crossorigin="anonymous"></script><link crossorigin href="/b.css">"#,
        );
        assert_eq!(out, r#"<script src="/a.js"></script><link href="/b.css">"#);
    }

    #[test]
    fn test_strip_integrity_is_case_insensitive() {
        let rw = rewriter();
        let out = pass(
            &rw,
            Pass::StripIntegrity,
            r#"<LINK REL="stylesheet" CROSSORIGIN HREF="/a.css" INTEGRITY="sha384-x"><img crossorigin=anonymous src="/b.png"/>"#,
        );
        assert_eq!(out, r#"<LINK REL="stylesheet" HREF="/a.css"><img src="/b.png"/>"#);
    }

    #[test]
    fn test_strip_integrity_leaves_script_bindings() {
        let rw = rewriter();
        let js = "const crossorigin = opts.crossorigin;\nlet integrity = \"sha384-abc\";\nif (a<b && crossorigin) load(integrity);";
        assert!(rw.apply(Pass::StripIntegrity, js.as_bytes()).is_none());
        assert_eq!(String::from_utf8(rw.rewrite(ContentKind::JavaScript, js.as_bytes())).unwrap(), js);
    }

    #[test]
    fn test_strip_dynamic_sri() {
        let rw = rewriter();
        let out = pass(
            &rw,
            Pass::StripIntegrity,
            r#"n.sriHashes={1:"sha384-x",2:"sha384-y"};s.integrity=n.sriHashes[e],s.src=u;if(a.integrity==b)c()"#,
        );
        assert!(out.contains("n.sriHashes={};"));
        assert!(out.contains(r#"s.integrity="",s.src=u"#));
        assert!(out.contains("a.integrity==b"));
    }

    #[test]
    fn test_absolute_url_to_proxied_path() {
        let rw = rewriter();
        assert_eq!(pass(&rw, Pass::AbsoluteUrls, "http://10.0.0.5/admin/x"), "/proxy/app/x");
        assert_eq!(
            pass(&rw, Pass::AbsoluteUrls, r#"<a href="https://10.0.0.5/other?q=1">"#),
            r#"<a href="/proxy/app/other?q=1">"#
        );
        assert_eq!(
            pass(&rw, Pass::AbsoluteUrls, r#"var u = "//10.0.0.5";"#),
            r#"var u = "/proxy/app/";"#
        );
    }

    #[test]
    fn test_absolute_url_other_hosts_untouched() {
        let rw = rewriter();
        for input in [
            "http://10.0.0.50/admin/x",
            "http://10.0.0.5:9000/admin/x",
            "https://example.com/admin/x",
            "http://10.0.0.5.evil.com/",
        ] {
            assert_eq!(pass(&rw, Pass::AbsoluteUrls, input), input);
        }
    }

    #[test]
    fn test_absolute_url_other_schemes_untouched() {
        let rw = root_rewriter();
        for input in [
            r#"new WebSocket("ws://10.0.0.5:8080/socket")"#,
            r#"new WebSocket("wss://10.0.0.5:8080/socket")"#,
            r#"<a href="ftp://10.0.0.5:8080/pub">"#,
            r#"<a href="svn+ssh://10.0.0.5:8080/repo">"#,
        ] {
            assert_eq!(pass(&rw, Pass::AbsoluteUrls, input), input);
            assert_eq!(String::from_utf8(rw.rewrite(ContentKind::JavaScript, input.as_bytes())).unwrap(), input);
        }

        // A following http URL on the same line is still rewritten
        assert_eq!(
            pass(&rw, Pass::AbsoluteUrls, r#"["ws://10.0.0.5:8080/s", "http://10.0.0.5:8080/a"]"#),
            r#"["ws://10.0.0.5:8080/s", "/proxy/app/a"]"#
        );
    }

    #[test]
    fn test_absolute_url_with_port() {
        let rw = root_rewriter();
        assert_eq!(
            pass(&rw, Pass::AbsoluteUrls, r#"fetch("http://10.0.0.5:8080/api/v1")"#),
            r#"fetch("/proxy/app/api/v1")"#
        );
        assert_eq!(pass(&rw, Pass::AbsoluteUrls, "http://10.0.0.5/x"), "http://10.0.0.5/x");
    }

    #[test]
    fn test_target_subpath() {
        let rw = rewriter();
        assert_eq!(
            pass(&rw, Pass::TargetSubpath, r#"<script src="/admin/app.js"></script>"#),
            r#"<script src="/proxy/app/app.js"></script>"#
        );
        assert_eq!(
            pass(&rw, Pass::TargetSubpath, "fetch('/admin/api.php?x=1')"),
            "fetch('/proxy/app/api.php?x=1')"
        );
        assert_eq!(
            pass(&rw, Pass::TargetSubpath, "background: url(/admin/bg.png)"),
            "background: url(/proxy/app/bg.png)"
        );
        assert_eq!(
            pass(&rw, Pass::TargetSubpath, r#"<form action=/admin/login>"#),
            r#"<form action=/proxy/app/login>"#
        );
        assert_eq!(pass(&rw, Pass::TargetSubpath, r#""/administrator""#), r#""/administrator""#);
        assert_eq!(pass(&rw, Pass::TargetSubpath, r#""/admin""#), r#""/proxy/app""#);
    }

    #[test]
    fn test_target_subpath_skipped_for_root_target() {
        let rw = root_rewriter();
        assert!(rw.apply(Pass::TargetSubpath, br#"<a href="/x">"#).is_none());
    }

    #[test]
    fn test_srcset_preserves_spacing() {
        let rw = root_rewriter();
        assert_eq!(
            pass(
                &rw,
                Pass::Srcset,
                r#"<img srcset="/a.png 1x,  /b.png 2x, https://cdn.example.com/c.png 3x">"#
            ),
            r#"<img srcset="/proxy/app/a.png 1x,  /proxy/app/b.png 2x, https://cdn.example.com/c.png 3x">"#
        );
        assert_eq!(
            pass(&rw, Pass::Srcset, "<img srcset='/a.png'>"),
            "<img srcset='/proxy/app/a.png'>"
        );
    }

    #[test]
    fn test_srcset_strips_target_subpath() {
        let rw = rewriter();
        assert_eq!(
            rw.rewrite_srcset_value(b"/admin/a.png 480w, /proxy/app/b.png 800w"),
            b"/proxy/app/a.png 480w, /proxy/app/b.png 800w".to_vec()
        );
    }

    #[test]
    fn test_root_relative() {
        let rw = root_rewriter();
        assert_eq!(
            pass(&rw, Pass::RootRelative, r#"<link rel="stylesheet" href="/static/site.css">"#),
            r#"<link rel="stylesheet" href="/proxy/app/static/site.css">"#
        );
        assert_eq!(
            pass(&rw, Pass::RootRelative, r#"body { background: url("/img/bg.png") }"#),
            r#"body { background: url("/proxy/app/img/bg.png") }"#
        );
        assert_eq!(
            pass(&rw, Pass::RootRelative, r#"<base href="/">"#),
            r#"<base href="/proxy/app/">"#
        );
        assert_eq!(
            pass(&rw, Pass::RootRelative, r#"<script src="//cdn.example.com/x.js"></script>"#),
            r#"<script src="//cdn.example.com/x.js"></script>"#
        );
    }

    #[test]
    fn test_root_relative_leaves_srcset_to_its_pass() {
        let rw = root_rewriter();
        let input = r#"<img srcset="/a.png 1x">"#;
        assert_eq!(pass(&rw, Pass::RootRelative, input), input);
    }

    #[test]
    fn test_base_href_strips_target_subpath() {
        let rw = rewriter();
        assert_eq!(
            pass(&rw, Pass::RootRelative, r#"<base href="/admin/">"#),
            r#"<base href="/proxy/app/">"#
        );
    }

    #[test]
    fn test_spa_base_path() {
        let rw = rewriter();
        assert_eq!(
            pass(&rw, Pass::SpaBasePath, r#"window.cfg = {urlBase: "", basePath=''};"#),
            r#"window.cfg = {urlBase: "/proxy/app", basePath='/proxy/app'};"#
        );
        assert_eq!(
            pass(&rw, Pass::SpaBasePath, r#"{"baseUrl":""}"#),
            r#"{"baseUrl":"/proxy/app"}"#
        );
        assert_eq!(pass(&rw, Pass::SpaBasePath, r#"{"baseUrl":"/x"}"#), r#"{"baseUrl":"/x"}"#);
    }

    #[test]
    fn test_json_values() {
        let rw = rewriter();
        assert_eq!(
            pass(
                &rw,
                Pass::JsonValues,
                r#"{"apiRoot": "/api/v1", "cdn": "//cdn/x", "home": "/proxy/app/", "name": "x"}"#
            ),
            r#"{"apiRoot": "/proxy/app/api/v1", "cdn": "//cdn/x", "home": "/proxy/app/", "name": "x"}"#
        );
    }

    #[test]
    fn test_image_set() {
        let rw = root_rewriter();
        assert_eq!(
            pass(
                &rw,
                Pass::ImageSet,
                r#"a { background-image: image-set("/img/a.png" 1x, "/img/b.png" 2x); }"#
            ),
            r#"a { background-image: image-set("/proxy/app/img/a.png" 1x, "/proxy/app/img/b.png" 2x); }"#
        );
        assert_eq!(
            pass(&rw, Pass::ImageSet, r#"-webkit-image-set(url("/a.png") 1x)"#),
            r#"-webkit-image-set(url("/proxy/app/a.png") 1x)"#
        );
    }

    #[test]
    fn test_json_arrays() {
        let rw = rewriter();
        assert_eq!(
            pass(&rw, Pass::JsonArrays, r#"{"files": ["/a.js", "/b.js", "c.js"]}"#),
            r#"{"files": ["/proxy/app/a.js", "/proxy/app/b.js", "c.js"]}"#
        );
        assert_eq!(pass(&rw, Pass::JsonArrays, r#"["a", "/b"]"#), r#"["a", "/b"]"#);
    }

    #[test]
    fn test_css_imports() {
        let rw = root_rewriter();
        assert_eq!(
            pass(&rw, Pass::CssImports, r#"@import "/css/base.css"; @import url(/css/x.css);"#),
            r#"@import "/proxy/app/css/base.css"; @import url(/proxy/app/css/x.css);"#
        );
    }

    #[test]
    fn test_svg_hrefs() {
        let rw = root_rewriter();
        assert_eq!(
            pass(
                &rw,
                Pass::SvgHrefs,
                r##"<svg><use xlink:href="/icons.svg#home"></use><use href="#local"/><image href="/img/x.png"/></svg>"##
            ),
            r##"<svg><use xlink:href="/proxy/app/icons.svg#home"></use><use href="#local"/><image href="/proxy/app/img/x.png"/></svg>"##
        );
    }

    #[test]
    fn test_every_pass_ignores_proxied_content() {
        let rw = rewriter();
        let proxied = r#"<base href="/proxy/app/"><a href="/proxy/app/x"></a><img srcset="/proxy/app/a.png 1x">
<style>@import "/proxy/app/c.css"; a { background: url(/proxy/app/b.png); b: image-set("/proxy/app/i.png" 1x); }</style>
<svg><use href="/proxy/app/i.svg#a"/></svg>
<script>var c = {"api": "/proxy/app/api", "list": ["/proxy/app/x.js"], urlBase: "/proxy/app"};</script>"#;

        for p in FULL_PIPELINE {
            if p == Pass::StripIntegrity {
                continue;
            }
            assert_eq!(pass(&rw, p, proxied), proxied, "pass {:?} changed proxied content", p);
        }
    }

    #[test]
    fn test_full_pipeline_is_idempotent() {
        let rw = rewriter();
        let html = r#"<!doctype html><html><head><base href="/admin/">
<link rel="stylesheet" href="/admin/style.css" integrity="sha384-x" crossorigin="anonymous">
<script>window.cfg = {urlBase: "", "api": "/api/v2", assets: ["/static/a.js", "/static/b.js"]};</script>
</head><body>
<a href="http://10.0.0.5/admin/settings">settings</a>
<img src="/logo.png" srcset="/logo.png 1x, /logo@2x.png 2x">
<div style="background: image-set('/bg.png' 1x, '/bg@2x.png' 2x)"></div>
<svg><use xlink:href="/sprite.svg#icon"></use></svg>
</body></html>"#;

        let once = rw.rewrite(ContentKind::Html, html.as_bytes());
        let twice = rw.rewrite(ContentKind::Html, &once);
        assert_eq!(String::from_utf8_lossy(&once), String::from_utf8_lossy(&twice));

        let text = String::from_utf8(once).unwrap();
        assert!(text.contains(r#"<base href="/proxy/app/">"#));
        assert!(text.contains(r#"href="/proxy/app/style.css">"#));
        assert!(!text.contains("integrity="));
        assert!(text.contains(r#"urlBase: "/proxy/app""#));
        assert!(text.contains(r#""api": "/proxy/app/api/v2""#));
        assert!(text.contains(r#"["/proxy/app/static/a.js", "/proxy/app/static/b.js"]"#));
        assert!(text.contains(r#"href="/proxy/app/settings""#));
        assert!(text.contains(r#"src="/proxy/app/logo.png""#));
        assert!(text.contains(r#"srcset="/proxy/app/logo.png 1x, /proxy/app/logo@2x.png 2x""#));
        assert!(text.contains("image-set('/proxy/app/bg.png' 1x, '/proxy/app/bg@2x.png' 2x)"));
        assert!(text.contains(r##"xlink:href="/proxy/app/sprite.svg#icon""##));
        assert!(text.contains("<head><script data-mountgate-interceptor>"));
    }

    #[test]
    fn test_reduced_pipeline_skips_root_relative() {
        let rw = rewriter();
        let js = r#"fetch("/api/status");load("/admin/chunk.js");var u = "http://10.0.0.5/admin/x";n.basePath="";"#;
        let out = String::from_utf8(rw.rewrite(ContentKind::JavaScript, js.as_bytes())).unwrap();
        assert!(out.contains(r#"fetch("/api/status")"#));
        assert!(out.contains(r#"load("/proxy/app/chunk.js")"#));
        assert!(out.contains(r#"var u = "/proxy/app/x""#));
        assert!(out.contains(r#"n.basePath="/proxy/app""#));
        assert!(!out.contains("data-mountgate-interceptor"));
    }

    #[test]
    fn test_reduced_pipeline_json_leaves_values() {
        let rw = rewriter();
        let json = r#"{"redirect": "/login", "list": ["/a"]}"#;
        let out = rw.rewrite(ContentKind::Json, json.as_bytes());
        assert_eq!(out, json.as_bytes());
    }

    #[test]
    fn test_non_utf8_bytes_survive() {
        let rw = root_rewriter();
        let mut body = b"<img src=\"/a.png\">".to_vec();
        body.extend_from_slice(&[0xff, 0xfe, b'x']);
        let out = rw.apply(Pass::RootRelative, &body).unwrap();
        assert!(out.starts_with(b"<img src=\"/proxy/app/a.png\">"));
        assert!(out.ends_with(&[0xff, 0xfe, b'x']));
    }
}
