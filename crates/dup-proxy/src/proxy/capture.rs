//! Request snapshot construction and answer-teeing.
//!
//! The engine never streams bodies itself: this module materializes the
//! fully-read inbound request into a [`CapturedRequest`], and — when a
//! location needs the original answer — wraps the upstream response stream
//! in a [`TeedBody`] that passes bytes through to the caller unchanged
//! while accumulating a copy for the pending duplication jobs.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_core::Stream;

use dup_engine::CapturedRequest;

use super::primary::response_builder;

/// Build the immutable request snapshot handed to the engine. Bodies are
/// captured as text (lossy for non-UTF-8 payloads).
pub fn captured_request(
    id: &str,
    conf_path: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> CapturedRequest {
    let mut request = CapturedRequest::new(id, conf_path);
    request.method = method.as_str().to_string();
    request.path = uri.path().to_string();
    request.args = uri.query().unwrap_or_default().to_string();
    request.headers_in = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    request.body = String::from_utf8_lossy(body).into_owned();
    request
}

/// Response headers in the engine's ordered-pair form.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// A stream wrapper that passes through bytes unchanged while accumulating
/// a copy of all data. When the inner stream completes, the accumulated
/// answer is handed to the completion callback exactly once. A mid-stream
/// upstream error abandons the capture: the error propagates to the caller
/// and no duplication is performed for this request.
pub struct TeedBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    on_complete: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

impl Stream for TeedBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.on_complete.take();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(on_complete) = this.on_complete.take() {
                    on_complete(std::mem::take(&mut this.buffer));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Stream the upstream body back while teeing a copy; `on_complete` receives
/// the full answer once the last byte has been passed through.
pub fn teed_response(
    upstream: reqwest::Response,
    correlation_id: &str,
    on_complete: Box<dyn FnOnce(Vec<u8>) + Send>,
) -> Response {
    let builder = response_builder(&upstream, correlation_id);
    let tee = TeedBody {
        inner: Box::pin(upstream.bytes_stream()),
        buffer: Vec::new(),
        on_complete: Some(on_complete),
    };
    builder
        .body(Body::from_stream(tee))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build teed response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_splits_uri_into_path_and_args() {
        let uri: Uri = "http://localhost/spp/main/foo?SID=eightyfour".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-sid", "eightyfour".parse().unwrap());
        let body = Bytes::from_static(b"payload");

        let request = captured_request("42", "/spp/main", &Method::POST, &uri, &headers, &body);
        assert_eq!(request.id, "42");
        assert_eq!(request.conf_path, "/spp/main");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/spp/main/foo");
        assert_eq!(request.args, "SID=eightyfour");
        assert_eq!(request.header_in("X-Sid"), Some("eightyfour"));
        assert_eq!(request.body, "payload");
    }

    #[test]
    fn snapshot_without_query_has_empty_args() {
        let uri: Uri = "/spp/main".parse().unwrap();
        let request = captured_request(
            "1",
            "/spp/main",
            &Method::GET,
            &uri,
            &HeaderMap::new(),
            &Bytes::new(),
        );
        assert_eq!(request.args, "");
        assert_eq!(request.body, "");
    }
}
