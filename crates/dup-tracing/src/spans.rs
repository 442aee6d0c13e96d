//! Span builder helpers for dup-proxy instrumentation.

/// Create a tracing span for the top-level captured request.
///
/// Usage: `let _span = request_span!(request_id, path).entered();`
#[macro_export]
macro_rules! request_span {
    ($request_id:expr, $path:expr) => {
        tracing::info_span!(
            "captured_request",
            request_id = %$request_id,
            path = %$path,
            matched_destinations = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for one outbound duplicate dispatch.
#[macro_export]
macro_rules! duplicate_span {
    ($request_id:expr, $destination:expr) => {
        tracing::info_span!(
            "duplicate_request",
            request_id = %$request_id,
            destination = %$destination,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the primary upstream forward.
#[macro_export]
macro_rules! upstream_span {
    ($request_id:expr, $target:expr) => {
        tracing::info_span!(
            "primary_forward",
            request_id = %$request_id,
            target = %$target,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
