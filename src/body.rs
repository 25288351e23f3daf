//! Proxied response modification
//!
//! Headers are always rewritten. Bodies are buffered, decompressed,
//! rewritten and re-emitted uncompressed when the content type is one the
//! rewriter understands and the body fits under the size cap. Everything
//! else streams through untouched.

use crate::rewrite::{ContentKind, ContentRewriter};
use flate2::read::GzDecoder;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Response, StatusCode};
use std::fmt::Display;
use std::io::Read;
use tracing::{debug, warn};

/// Encodings the rewriter can undo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Identity,
    Gzip,
}

impl Encoding {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let Some(value) = headers.get(header::CONTENT_ENCODING) else {
            return Some(Encoding::Identity);
        };
        match value.to_str().ok()?.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Encoding::Identity),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            _ => None,
        }
    }
}

/// Rewrite a backend response for delivery under the route's prefix.
///
/// Never fails: a body that cannot be read, decoded or rewritten is sent
/// on as the backend produced it.
pub async fn modify_response<B>(
    rewriter: &ContentRewriter,
    method: &Method,
    max_bytes: usize,
    response: Response<B>,
) -> Response<BoxBody<Bytes, B::Error>>
where
    B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: Display + Send + Sync + 'static,
{
    let (mut parts, body) = response.into_parts();
    rewriter.rewrite_response_headers(&mut parts.headers);

    let Some((kind, encoding)) = rewrite_plan(method, parts.status, &parts.headers, max_bytes) else {
        return Response::from_parts(parts, body.boxed());
    };

    let raw = match buffer_body(body, max_bytes).await {
        Buffered::Complete(raw) => raw,
        Buffered::Passthrough(body) => return Response::from_parts(parts, body),
    };

    let decoded = match encoding {
        Encoding::Identity => raw,
        Encoding::Gzip => match gunzip(&raw, max_bytes) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!(compressed = raw.len(), max_bytes, "Decoded body exceeds rewrite cap, passing through");
                return Response::from_parts(parts, full(raw));
            }
            Err(e) => {
                debug!(error = %e, "Gzip decode failed, passing body through");
                return Response::from_parts(parts, full(raw));
            }
        },
    };

    let rewritten = rewriter.rewrite(kind, &decoded);

    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

    Response::from_parts(parts, full(rewritten))
}

/// Decide whether a response body gets rewritten, and how it is encoded
fn rewrite_plan(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Option<(ContentKind, Encoding)> {
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return None;
    }

    let kind = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentKind::from_content_type)?;

    let Some(encoding) = Encoding::from_headers(headers) else {
        debug!(encoding = ?headers.get(header::CONTENT_ENCODING), "Unsupported content encoding, not rewriting");
        return None;
    };

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(len) = declared {
        if len > max_bytes as u64 {
            debug!(content_length = len, max_bytes, "Body exceeds rewrite cap, passing through");
            return None;
        }
    }

    Some((kind, encoding))
}

enum Buffered<E> {
    Complete(Vec<u8>),
    Passthrough(BoxBody<Bytes, E>),
}

/// Read the whole body if it fits in `max_bytes`. Otherwise hand back a
/// body that replays what was read and continues with the rest.
async fn buffer_body<B>(mut body: B, max_bytes: usize) -> Buffered<B::Error>
where
    B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: Display + Send + Sync + 'static,
{
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                // Trailers are dropped from rewritten bodies
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                total += data.len();
                chunks.push(data);

                if total > max_bytes {
                    debug!(read = total, max_bytes, "Body exceeds rewrite cap while reading, streaming the rest");
                    let head = futures::stream::iter(chunks.into_iter().map(|c| Ok(Frame::data(c))));
                    let rest = StreamBody::new(head.chain(BodyStream::new(body)));
                    return Buffered::Passthrough(BodyExt::boxed(rest));
                }
            }
            Err(e) => {
                warn!(error = %e, read = total, "Backend body failed while buffering");
                let replay = chunks
                    .into_iter()
                    .map(|c| Ok(Frame::data(c)))
                    .chain(std::iter::once(Err(e)));
                return Buffered::Passthrough(BodyExt::boxed(StreamBody::new(futures::stream::iter(replay))));
            }
        }
    }

    Buffered::Complete(chunks.concat())
}

/// Decode a gzip body. `None` when the decoded size exceeds `max_bytes`.
fn gunzip(raw: &[u8], max_bytes: usize) -> std::io::Result<Option<Vec<u8>>> {
    let limit = max_bytes as u64 + 1;
    let mut decoder = GzDecoder::new(raw).take(limit);
    let mut out = Vec::with_capacity(raw.len().saturating_mul(4).min(max_bytes));
    decoder.read_to_end(&mut out)?;
    if out.len() > max_bytes {
        return Ok(None);
    }
    Ok(Some(out))
}

fn full<E: 'static>(bytes: Vec<u8>) -> BoxBody<Bytes, E> {
    Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::convert::Infallible;
    use std::io::Write;

    fn rewriter() -> ContentRewriter {
        ContentRewriter::new("/proxy/app", "/admin", "10.0.0.5")
    }

    fn response(content_type: &str, body: &'static [u8]) -> Response<Full<Bytes>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_of(response: Response<BoxBody<Bytes, Infallible>>) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_html_is_rewritten_and_length_fixed() {
        let resp = response("text/html; charset=utf-8", b"<html><head></head><a href=\"/admin/x\">x</a></html>");
        let out = modify_response(&rewriter(), &Method::GET, 1024 * 1024, resp).await;

        let len: usize = out.headers()[header::CONTENT_LENGTH].to_str().unwrap().parse().unwrap();
        let body = body_of(out).await;
        assert_eq!(len, body.len());

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#"<a href="/proxy/app/x">"#));
        assert!(text.contains("data-mountgate-interceptor"));
    }

    #[tokio::test]
    async fn test_png_untouched() {
        let resp = response("image/png", b"\x89PNG /admin/x");
        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert_eq!(out.headers()[header::CONTENT_LENGTH], "14");
        assert_eq!(body_of(out).await, b"\x89PNG /admin/x");
    }

    #[tokio::test]
    async fn test_headers_rewritten_even_without_body_rewrite() {
        let resp = Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, "/admin/login")
            .header(header::X_FRAME_OPTIONS, "DENY")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert_eq!(out.headers()[header::LOCATION], "/proxy/app/login");
        assert!(out.headers().get(header::X_FRAME_OPTIONS).is_none());
    }

    #[tokio::test]
    async fn test_declared_oversize_passes_through() {
        let resp = response("text/html", b"<a href=\"/x\">0123456789</a>");
        let out = modify_response(&rewriter(), &Method::GET, 8, resp).await;
        assert_eq!(body_of(out).await, b"<a href=\"/x\">0123456789</a>");
    }

    #[tokio::test]
    async fn test_undeclared_oversize_streams_through() {
        let resp = Response::builder()
            .header(header::CONTENT_TYPE, "text/css")
            .body(Full::new(Bytes::from_static(b"a { background: url(/x.png) }")))
            .unwrap();
        let out = modify_response(&rewriter(), &Method::GET, 8, resp).await;
        assert_eq!(body_of(out).await, b"a { background: url(/x.png) }");
    }

    #[tokio::test]
    async fn test_gzip_is_decoded_and_reemitted_plain() {
        let compressed = gzip(br#"{"redirect": "http://10.0.0.5/admin/home"}"#);
        let resp = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, compressed.len())
            .body(Full::new(Bytes::from(compressed)))
            .unwrap();

        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert!(out.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(body_of(out).await, br#"{"redirect": "/proxy/app/home"}"#);
    }

    #[tokio::test]
    async fn test_gzip_expanding_past_cap_passes_through_compressed() {
        let compressed = gzip(&[b'a'; 64 * 1024]);
        assert!(compressed.len() < 1024);
        let resp = Response::builder()
            .header(header::CONTENT_TYPE, "text/css")
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, compressed.len())
            .body(Full::new(Bytes::from(compressed.clone())))
            .unwrap();

        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert_eq!(out.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(body_of(out).await, compressed);
    }

    #[test]
    fn test_gunzip_respects_cap() {
        let compressed = gzip(b"0123456789");
        assert_eq!(gunzip(&compressed, 10).unwrap().unwrap(), b"0123456789");
        assert!(gunzip(&compressed, 9).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_gzip_passes_through_compressed() {
        let resp = Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Full::new(Bytes::from_static(b"not gzip at all")))
            .unwrap();

        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert_eq!(out.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(body_of(out).await, b"not gzip at all");
    }

    #[tokio::test]
    async fn test_unsupported_encoding_passes_through() {
        let resp = Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::CONTENT_ENCODING, "br")
            .body(Full::new(Bytes::from_static(b"\x0b\x02\x80")))
            .unwrap();

        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert_eq!(out.headers()[header::CONTENT_ENCODING], "br");
        assert_eq!(body_of(out).await, b"\x0b\x02\x80");
    }

    #[tokio::test]
    async fn test_head_and_not_modified_skipped() {
        let resp = response("text/html", b"");
        let out = modify_response(&rewriter(), &Method::HEAD, 1024, resp).await;
        assert!(body_of(out).await.is_empty());

        let resp = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let out = modify_response(&rewriter(), &Method::GET, 1024, resp).await;
        assert!(out.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
