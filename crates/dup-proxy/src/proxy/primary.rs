//! Raw byte forwarding to the primary upstream.
//!
//! The primary path streams bytes verbatim: no parsing, no transformation.
//! Duplication never touches it — a failed duplicate costs the caller
//! nothing, and a failed upstream call is reported as a plain gateway error.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::Instrument;

use super::correlation::CORRELATION_HEADER;

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Send the captured request to the upstream and hand back the in-flight
/// response, or a ready gateway-error `Response` when the call fails.
///
/// Extra headers (the correlation id, enrichment context) are appended after
/// the originals.
pub async fn send_upstream(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    extra_headers: &[(String, String)],
    body: Bytes,
    correlation_id: &str,
) -> Result<reqwest::Response, Response> {
    let span = dup_tracing::upstream_span!(correlation_id, url);
    let start = Instant::now();

    async {
        let mut req_builder = client
            .request(method, url)
            .body(body)
            .header(CORRELATION_HEADER, correlation_id);

        // Forward non-hop-by-hop headers from the original request
        for (name, value) in headers.iter() {
            let name_str = name.as_str().to_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) {
                continue;
            }
            if name_str == CORRELATION_HEADER {
                continue;
            }
            // Skip content-length — reqwest sets it from the actual body
            if name_str == "content-length" {
                continue;
            }
            req_builder = req_builder.header(name, value);
        }
        for (name, value) in extra_headers {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }

        match req_builder.send().await {
            Ok(resp) => {
                tracing::Span::current().record("latency_ms", start.elapsed().as_millis() as u64);
                tracing::Span::current().record("status", resp.status().as_u16());
                Ok(resp)
            }
            Err(e) => {
                tracing::Span::current().record("latency_ms", start.elapsed().as_millis() as u64);
                tracing::Span::current().record("status", 502_u16);

                if e.is_timeout() {
                    tracing::error!(error = %e, "Upstream timeout");
                    return Err((StatusCode::GATEWAY_TIMEOUT, "upstream timeout").into_response());
                }
                tracing::error!(error = %e, "Upstream connection error");
                Err((StatusCode::BAD_GATEWAY, "upstream connection error").into_response())
            }
        }
    }
    .instrument(span)
    .await
}

/// Start an axum response from the upstream's status and headers, with the
/// correlation id attached. The caller supplies the body (verbatim stream
/// or a teed capture).
pub fn response_builder(
    upstream: &reqwest::Response,
    correlation_id: &str,
) -> axum::http::response::Builder {
    let status = upstream.status();
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));

    for (name, value) in upstream.headers().iter() {
        let name_str = name.as_str().to_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder.header(
        CORRELATION_HEADER,
        HeaderValue::from_str(correlation_id).unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    )
}

/// Stream the upstream body back verbatim.
pub fn stream_response(upstream: reqwest::Response, correlation_id: &str) -> Response {
    let builder = response_builder(&upstream, correlation_id);
    let body = Body::from_stream(upstream.bytes_stream());
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    })
}
