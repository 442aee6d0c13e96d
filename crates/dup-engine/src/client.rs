//! Outbound duplicate dispatch.
//!
//! Performs the actual HTTP call to a duplication destination. All failures
//! are soft: timeouts and connection errors are counted and the job is
//! dropped, never retried and never surfaced to the primary path. The same
//! client serves both the pool workers (asynchronous mode) and direct
//! invocation from the request-serving path (synchronous mode); either way
//! it is one persistent pooled `reqwest::Client`, not a per-call handle.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::envelope::{serialize_headers, Envelope};
use crate::error::DispatchError;
use crate::pool::JobRunner;
use crate::request::{DuplicationJob, DuplicationType};
use crate::stats::DispatchStats;

/// Marker header identifying how much of the request was duplicated.
pub const DUPLICATION_TYPE_HEADER: &str = "Duplication-Type";

/// Correlation header propagated from the original request to its duplicates.
pub const CORRELATION_HEADER: &str = "x-dup-request-id";

/// Headers that should NOT be forwarded (hop-by-hop headers), plus
/// content-length, which the transport recomputes from the actual body.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "content-length",
];

/// Result of one completed outbound call.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: u16,
    /// The remote answer body, captured only in `RequestWithAnswer` mode.
    pub answer: Option<String>,
}

/// Performs outbound duplicate calls with a per-call deadline.
#[derive(Clone)]
pub struct OutboundClient {
    client: reqwest::Client,
    timeout: Duration,
    stats: DispatchStats,
}

impl OutboundClient {
    pub fn new(client: reqwest::Client, timeout: Duration, stats: DispatchStats) -> Self {
        OutboundClient {
            client,
            timeout,
            stats,
        }
    }

    /// Issue the duplicate call for one job.
    ///
    /// Reproduces method, path, args and headers from the (possibly
    /// substituted) captured request, adds the duplication markers, and
    /// bounds the whole call with the configured timeout. In
    /// `RequestWithAnswer` mode the remote answer body is awaited and
    /// captured; otherwise the call is not awaited beyond response headers.
    pub async fn dispatch(&self, job: &DuplicationJob) -> Result<DispatchOutcome, DispatchError> {
        let url = build_target_url(&job.destination, &job.request.path, &job.request.args)?;
        let method = http::Method::from_bytes(job.request.method.as_bytes())
            .unwrap_or(http::Method::POST);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &job.request.headers_in {
            if !forwardable(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder
            .header(DUPLICATION_TYPE_HEADER, job.duplication_type.as_str())
            .header(CORRELATION_HEADER, job.request.id.as_str());

        if let Some(body) = outbound_body(job) {
            builder = builder.body(body);
        }

        let want_answer = job.duplication_type.wants_answer();
        let call = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let answer = if want_answer {
                Some(response.text().await.unwrap_or_default())
            } else {
                None
            };
            Ok::<_, reqwest::Error>((status, answer))
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok((status, answer))) => {
                self.stats.inc_duplicated();
                if status >= 400 {
                    self.stats.inc_errors();
                }
                Ok(DispatchOutcome { status, answer })
            }
            Ok(Err(e)) => {
                self.stats.inc_errors();
                Err(DispatchError::Connect {
                    destination: job.destination.clone(),
                    source: e,
                })
            }
            Err(_) => {
                self.stats.inc_timeouts();
                Err(DispatchError::Timeout {
                    destination: job.destination.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Pool adapter: runs jobs through the outbound client and logs the outcome.
pub struct RequestRunner {
    client: OutboundClient,
}

impl RequestRunner {
    pub fn new(client: OutboundClient) -> Self {
        RequestRunner { client }
    }
}

#[async_trait]
impl JobRunner for RequestRunner {
    async fn run(&self, job: DuplicationJob) {
        let started = Instant::now();
        match self.client.dispatch(&job).await {
            Ok(outcome) => {
                tracing::debug!(
                    request_id = %job.request.id,
                    destination = %job.destination,
                    status = outcome.status,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "duplicate dispatched"
                );
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %job.request.id,
                    destination = %job.destination,
                    error = %e,
                    "duplicate dispatch failed"
                );
            }
        }
    }
}

/// The outbound URL for a destination in `host[:port]` form (a scheme may
/// be given explicitly).
fn build_target_url(destination: &str, path: &str, args: &str) -> Result<String, DispatchError> {
    if destination.is_empty() {
        return Err(DispatchError::InvalidDestination(destination.to_string()));
    }
    let base = if destination.starts_with("http://") || destination.starts_with("https://") {
        destination.to_string()
    } else {
        format!("http://{destination}")
    };
    let mut url = format!("{}{}", base.trim_end_matches('/'), path);
    if !args.is_empty() {
        url.push('?');
        url.push_str(args);
    }
    Ok(url)
}

/// The duplicate's body, per duplication type: none for header-only, the
/// request body for a complete request, the answer envelope when the
/// original answer ships along.
fn outbound_body(job: &DuplicationJob) -> Option<String> {
    match job.duplication_type {
        DuplicationType::None | DuplicationType::HeaderOnly => None,
        DuplicationType::CompleteRequest => Some(job.request.body.clone()),
        DuplicationType::RequestWithAnswer => {
            let envelope = Envelope {
                request_body: job.request.body.clone(),
                response_headers: serialize_headers(&job.request.headers_out),
                response_body: job.request.answer.clone(),
            };
            Some(envelope.encode())
        }
    }
}

fn forwardable(name: &str) -> bool {
    !SKIPPED_HEADERS
        .iter()
        .any(|skip| name.eq_ignore_ascii_case(skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CapturedRequest;

    fn job(duplication_type: DuplicationType) -> DuplicationJob {
        let mut request = CapturedRequest::new("42", "/spp/main");
        request.path = "/spp/main/foo".to_string();
        request.args = "SID=eightyfour".to_string();
        request.body = "abc".to_string();
        request
            .headers_out
            .push(("X-Answer".to_string(), "yes".to_string()));
        request.answer = "hi".to_string();
        DuplicationJob {
            request,
            destination: "localhost:84".to_string(),
            duplication_type,
        }
    }

    #[test]
    fn builds_the_target_url_from_destination_path_and_args() {
        assert_eq!(
            build_target_url("localhost:84", "/spp/main/foo", "SID=eightyfour").unwrap(),
            "http://localhost:84/spp/main/foo?SID=eightyfour"
        );
        assert_eq!(
            build_target_url("https://mirror.example", "/x", "").unwrap(),
            "https://mirror.example/x"
        );
        assert!(build_target_url("", "/x", "").is_err());
    }

    #[test]
    fn body_follows_the_duplication_type() {
        assert_eq!(outbound_body(&job(DuplicationType::HeaderOnly)), None);
        assert_eq!(
            outbound_body(&job(DuplicationType::CompleteRequest)).as_deref(),
            Some("abc")
        );

        let envelope = outbound_body(&job(DuplicationType::RequestWithAnswer)).unwrap();
        assert_eq!(envelope, "00000003abc00000014X-Answer: yes\n00000002hi");
        let parsed = Envelope::parse(&envelope).unwrap();
        assert_eq!(parsed.request_body, "abc");
        assert_eq!(parsed.response_body, "hi");
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwarded() {
        assert!(!forwardable("Connection"));
        assert!(!forwardable("content-length"));
        assert!(forwardable("X-Custom"));
        assert!(forwardable("accept"));
    }
}
