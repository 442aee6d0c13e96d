//! Axum HTTP server: router, capture pipeline, listener, graceful shutdown.
//!
//! Every request is fully read, forwarded to the primary upstream, and
//! streamed back. When it resolves to a configured location, the engine
//! classifies it on the way: enrichment runs synchronously before the
//! forward, duplicates are dispatched through the pool (or inline for
//! synchronous locations), and answer-capturing locations tee the response
//! stream. Duplication failures never change what the caller sees.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use dup_engine::request::DuplicationJob;
use dup_engine::{Classifier, DestinationVerdict, DispatchPool, DispatchStats, OutboundClient, StatsRegistry};

use crate::config::AppConfig;
use crate::mode::{DuplicationMode, RuntimeMode};
use crate::proxy::{capture, correlation, primary};

/// Header prefix under which enrichment variables travel to the upstream.
const CONTEXT_HEADER_PREFIX: &str = "x-dup-ctx-";

/// Shared application state. Engine services are constructed once at
/// startup and injected here; nothing reaches for globals.
pub struct AppState {
    pub config: AppConfig,
    pub primary_client: reqwest::Client,
    pub classifier: Classifier,
    pub pool: DispatchPool,
    pub outbound: OutboundClient,
    pub stats: DispatchStats,
    pub registry: StatsRegistry,
    pub mode: RuntimeMode,
    /// Locations whose duplicates dispatch on the request-serving path.
    pub synchronous_paths: HashSet<String>,
}

/// Build and run the HTTP server. Returns once the listener has shut down
/// and the dispatch pool has drained.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let pool = state.pool.clone();

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/duplication/stats", get(handle_get_stats))
        .route("/duplication/mode", get(handle_get_mode).put(handle_set_mode))
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "dup-proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued duplicates before exiting.
    pool.stop().await;

    tracing::info!("dup-proxy shut down gracefully");
    Ok(())
}

/// Catch-all handler: capture, classify, duplicate, forward.
async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let correlation_id = correlation::generate_id();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), state.config.server.max_body_bytes)
        .await
    {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let path = uri.path().to_string();
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let url = format!(
        "{}{path}{query}",
        state.config.primary.upstream_base_url.trim_end_matches('/')
    );

    let span = dup_tracing::request_span!(&correlation_id, &path);

    async {
        // Resolve the configured location, if any and if duplication is on.
        let location = if state.mode.get() == DuplicationMode::Duplicate {
            state
                .classifier
                .store()
                .match_location(&path)
                .map(|rules| (rules.conf_path.clone(), rules.highest_duplication_type()))
        } else {
            None
        };

        let Some((conf_path, highest)) = location else {
            // Unconfigured path: plain passthrough.
            return match primary::send_upstream(
                &state.primary_client,
                method,
                &url,
                &headers,
                &[],
                body,
                &correlation_id,
            )
            .await
            {
                Ok(upstream) => primary::stream_response(upstream, &correlation_id),
                Err(error_response) => error_response,
            };
        };

        let captured =
            capture::captured_request(&correlation_id, &conf_path, &method, &uri, &headers, &body);

        // Synchronous context enrichment, exposed to the upstream as headers.
        let context = state.classifier.enrich(&captured);
        let extra_headers: Vec<(String, String)> = context
            .into_iter()
            .map(|(name, value)| (format!("{CONTEXT_HEADER_PREFIX}{name}"), value))
            .collect();

        let classification = state.classifier.classify(&captured);
        for (destination, verdict) in &classification.verdicts {
            match verdict {
                DestinationVerdict::Selected => {}
                DestinationVerdict::SampledOut => {
                    state.stats.inc_sampled_out();
                    tracing::debug!(destination = %destination, "matched but sampled out");
                }
                DestinationVerdict::NoFilterMatch => {
                    state.stats.inc_unmatched();
                }
            }
        }
        tracing::Span::current().record(
            "matched_destinations",
            classification.matches.len() as u64,
        );

        let jobs: Vec<DuplicationJob> = classification
            .matches
            .into_iter()
            .map(|m| m.into_job())
            .collect();

        if !highest.wants_answer() {
            // Duplicates need nothing from the answer: dispatch now, then
            // forward and stream the response verbatim.
            dispatch_jobs(&state, &conf_path, jobs).await;
            return match primary::send_upstream(
                &state.primary_client,
                method,
                &url,
                &headers,
                &extra_headers,
                body,
                &correlation_id,
            )
            .await
            {
                Ok(upstream) => primary::stream_response(upstream, &correlation_id),
                Err(error_response) => error_response,
            };
        }

        // Answer capture: tee the response stream and push the jobs once the
        // last byte has been passed through to the caller.
        match primary::send_upstream(
            &state.primary_client,
            method,
            &url,
            &headers,
            &extra_headers,
            body,
            &correlation_id,
        )
        .await
        {
            Ok(upstream) => {
                let response_headers = capture::header_pairs(upstream.headers());
                let pool = state.pool.clone();
                let mut jobs = jobs;
                let on_complete = Box::new(move |answer: Vec<u8>| {
                    let answer = String::from_utf8_lossy(&answer).into_owned();
                    for job in jobs.iter_mut() {
                        job.request.headers_out = response_headers.clone();
                        job.request.answer = answer.clone();
                    }
                    tokio::spawn(async move {
                        for job in jobs {
                            if let Err(e) = pool.push(job).await {
                                tracing::warn!(error = %e, "duplication pool rejected job");
                            }
                        }
                    });
                });
                capture::teed_response(upstream, &correlation_id, on_complete)
            }
            Err(error_response) => error_response,
        }
    }
    .instrument(span)
    .await
}

/// Dispatch jobs for a location without answer capture: synchronous
/// locations call out inline, the rest go through the pool. A rejected push
/// is logged and forgotten — the primary request continues regardless.
async fn dispatch_jobs(state: &AppState, conf_path: &str, jobs: Vec<DuplicationJob>) {
    let synchronous = state.synchronous_paths.contains(conf_path);
    for job in jobs {
        if synchronous {
            let destination = job.destination.clone();
            match state.outbound.dispatch(&job).await {
                Ok(outcome) => tracing::debug!(
                    destination = %destination,
                    status = outcome.status,
                    "synchronous duplicate dispatched"
                ),
                Err(e) => tracing::warn!(
                    destination = %destination,
                    error = %e,
                    "synchronous duplicate failed"
                ),
            }
        } else if let Err(e) = state.pool.push(job).await {
            tracing::warn!(error = %e, "duplication pool rejected job");
        }
    }
}

/// GET /duplication/stats — counters plus the polled named providers.
async fn handle_get_stats(State(state): State<Arc<AppState>>) -> Response {
    let providers: serde_json::Map<String, serde_json::Value> = state
        .registry
        .poll()
        .into_iter()
        .map(|(name, value)| (name, serde_json::Value::String(value)))
        .collect();

    axum::Json(serde_json::json!({
        "counters": state.stats.snapshot(),
        "providers": providers,
    }))
    .into_response()
}

/// GET /duplication/mode — return the current duplication mode.
async fn handle_get_mode(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(serde_json::json!({ "mode": state.mode.get() })).into_response()
}

/// PUT /duplication/mode — toggle duplication at runtime.
async fn handle_set_mode(
    State(state): State<Arc<AppState>>,
    axum::Json(payload): axum::Json<serde_json::Value>,
) -> Response {
    let mode_str = match payload.get("mode").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({ "error": "missing 'mode' field" })),
            )
                .into_response();
        }
    };

    let mode: DuplicationMode =
        match serde_json::from_value(serde_json::Value::String(mode_str.to_string())) {
            Ok(m) => m,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({
                        "error": "invalid mode, expected: duplicate or forward-only"
                    })),
                )
                    .into_response();
            }
        };

    state.mode.set(mode);
    tracing::info!(mode = %mode_str, "Duplication mode changed");
    axum::Json(serde_json::json!({ "mode": mode })).into_response()
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
