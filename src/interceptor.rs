//! Client-side URL interceptor injected into proxied HTML pages
//!
//! Static rewriting cannot see URLs that page scripts assemble at runtime.
//! The script below patches the browser APIs those URLs flow through so
//! root-relative and same-origin requests still land under the proxy prefix.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

/// Attribute marking an injected script so a page is never patched twice
pub const MARKER: &str = "data-mountgate-interceptor";

const PREFIX_PLACEHOLDER: &str = "__MOUNTGATE_PREFIX__";

/// How long the stalled-image sweep keeps running
pub const SWEEP_DURATION_MS: u64 = 30_000;

static HEAD_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i-u)<head\b[^>]*>").expect("valid head regex"));
static HTML_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i-u)<html\b[^>]*>").expect("valid html regex"));

// Keep assignments spaced (`a = '/x'`): the body rewriter treats
// `name="/..."` as an HTML attribute.
const SCRIPT_TEMPLATE: &str = r#"(function () {
  var P = "__MOUNTGATE_PREFIX__";
  if (window.__mountgateInterceptor) { return; }
  window.__mountgateInterceptor = true;
  var origin = window.location.origin;

  function proxied(path) {
    return path === P || path.indexOf(P + '/') === 0 || path.indexOf(P + '?') === 0 || path.indexOf(P + '#') === 0;
  }

  function rewrite(url) {
    if (url === null || url === undefined) { return url; }
    if (typeof URL !== 'undefined' && url instanceof URL) {
      var out = rewrite(url.href);
      return out === url.href ? url : out;
    }
    if (typeof url !== 'string') { return url; }
    if (url.indexOf(origin + '/') === 0) {
      var rest = url.slice(origin.length);
      return proxied(rest) ? url : origin + P + rest;
    }
    if (url.charAt(0) === '/' && url.charAt(1) !== '/') {
      return proxied(url) ? url : P + url;
    }
    return url;
  }

  function rewriteSocket(url) {
    var text = String(url);
    var m = /^(wss?:)\/\/([^\/?#]+)(.*)$/.exec(text);
    if (m && m[2] === window.location.host) {
      var path = m[3] || '/';
      if (path.charAt(0) !== '/') { path = '/' + path; }
      return proxied(path) ? text : m[1] + '//' + m[2] + P + path;
    }
    return rewrite(text);
  }

  var nativeFetch = window.fetch;
  if (nativeFetch) {
    window.fetch = function (input, init) {
      if (typeof input === 'string' || (typeof URL !== 'undefined' && input instanceof URL)) {
        input = rewrite(String(input));
      } else if (input && typeof Request !== 'undefined' && input instanceof Request) {
        var target = rewrite(input.url);
        if (target !== input.url) { input = new Request(target, input); }
      }
      return nativeFetch.call(this, input, init);
    };
  }

  if (window.XMLHttpRequest) {
    var nativeOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url) {
      var args = Array.prototype.slice.call(arguments);
      args[1] = rewrite(typeof url === 'string' ? url : String(url));
      return nativeOpen.apply(this, args);
    };
  }

  function wrapConstructor(name, map) {
    var Native = window[name];
    if (!Native) { return; }
    var Wrapped = function (url, options) {
      return arguments.length > 1 ? new Native(map(url), options) : new Native(map(url));
    };
    Wrapped.prototype = Native.prototype;
    ['CONNECTING', 'OPEN', 'CLOSING', 'CLOSED'].forEach(function (key) {
      if (key in Native) {
        try { Object.defineProperty(Wrapped, key, { value: Native[key] }); } catch (e) { }
      }
    });
    window[name] = Wrapped;
  }
  wrapConstructor('WebSocket', rewriteSocket);
  wrapConstructor('EventSource', function (url) { return rewrite(String(url)); });

  function hookSetter(Ctor, prop) {
    if (!Ctor || !Ctor.prototype) { return; }
    var desc = Object.getOwnPropertyDescriptor(Ctor.prototype, prop);
    if (!desc || !desc.set) { return; }
    Object.defineProperty(Ctor.prototype, prop, {
      configurable: true,
      enumerable: desc.enumerable,
      get: desc.get,
      set: function (value) { desc.set.call(this, rewrite(value)); }
    });
  }
  hookSetter(window.HTMLImageElement, 'src');
  hookSetter(window.HTMLScriptElement, 'src');
  hookSetter(window.HTMLSourceElement, 'src');
  hookSetter(window.HTMLMediaElement, 'src');
  hookSetter(window.HTMLVideoElement, 'poster');

  var WATCHED = ['src', 'poster'];
  function fixElement(el) {
    if (!el || el.nodeType !== 1 || !el.getAttribute) { return; }
    WATCHED.forEach(function (attr) {
      var value = el.getAttribute(attr);
      if (value) {
        var next = rewrite(value);
        if (next !== value) { el.setAttribute(attr, next); }
      }
    });
  }
  function fixTree(node) {
    fixElement(node);
    if (node.querySelectorAll) {
      var found = node.querySelectorAll('img,script,source,video,audio');
      for (var i = 0; i < found.length; i++) { fixElement(found[i]); }
    }
  }
  if (window.MutationObserver) {
    new MutationObserver(function (records) {
      records.forEach(function (record) {
        if (record.type === 'attributes') {
          fixElement(record.target);
        } else {
          for (var i = 0; i < record.addedNodes.length; i++) { fixTree(record.addedNodes[i]); }
        }
      });
    }).observe(document.documentElement, { childList: true, subtree: true, attributes: true, attributeFilter: WATCHED });
  }

  var framed = true;
  try { framed = window.top !== window.self; } catch (e) { framed = true; }
  if (framed) {
    var started = Date.now();
    var sweep = setInterval(function () {
      if (Date.now() - started > __MOUNTGATE_SWEEP_MS__) { clearInterval(sweep); return; }
      var images = document.images;
      for (var i = 0; i < images.length; i++) {
        var img = images[i];
        if (!img.complete || !img.naturalWidth) { continue; }
        if (window.getComputedStyle(img).opacity !== '0') { img.__mountgateZero = false; continue; }
        if (!img.__mountgateZero) { img.__mountgateZero = true; continue; }
        if (img.getAnimations) {
          img.getAnimations().forEach(function (anim) {
            if (anim.playState !== 'finished') { anim.cancel(); }
          });
        }
        img.style.transition = 'none';
        img.style.opacity = '1';
      }
    }, 500);
  }
})();"#;

/// Build the `<script>` element for a route's proxy prefix.
///
/// The prefix is `/proxy/` plus a slug of ASCII letters, digits and
/// hyphens, so it can be embedded as a string literal without escaping.
pub fn script_tag(prefix: &str) -> String {
    let body = SCRIPT_TEMPLATE
        .replace(PREFIX_PLACEHOLDER, prefix)
        .replace("__MOUNTGATE_SWEEP_MS__", &SWEEP_DURATION_MS.to_string());
    format!("<script {}>{}</script>", MARKER, body)
}

/// Splice `script` in right after the opening `<head>` tag so it runs
/// before any page script. Falls back to after `<html>`, then to the very
/// start of the document. Pages that already carry the marker are
/// returned unchanged.
pub fn inject(html: &[u8], script: &[u8]) -> Vec<u8> {
    if contains(html, MARKER.as_bytes()) {
        return html.to_vec();
    }

    let at = HEAD_OPEN
        .find(html)
        .or_else(|| HTML_OPEN.find(html))
        .map(|m| m.end())
        .unwrap_or(0);

    let mut out = Vec::with_capacity(html.len() + script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(script);
    out.extend_from_slice(&html[at..]);
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
