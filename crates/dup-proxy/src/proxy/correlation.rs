//! Correlation ID generation for request tracing.
//!
//! The same id is set on the forwarded primary request, the response to the
//! caller, and every duplicate (the engine adds it to outbound calls), so
//! an original and its duplicates can be joined downstream.

use uuid::Uuid;

pub use dup_engine::client::CORRELATION_HEADER;

/// Generate a new correlation ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
