//! Captured request snapshot and duplication job types.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// How much of a request (and optionally its answer) is copied to a
/// destination. Ordered by amount of information duplicated, so the highest
/// type requested for a path governs whether the answer must be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DuplicationType {
    #[default]
    None,
    HeaderOnly,
    CompleteRequest,
    RequestWithAnswer,
}

impl DuplicationType {
    /// Wire value carried in the `Duplication-Type` marker header.
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicationType::None => "NONE",
            DuplicationType::HeaderOnly => "HEADER_ONLY",
            DuplicationType::CompleteRequest => "COMPLETE_REQUEST",
            DuplicationType::RequestWithAnswer => "REQUEST_WITH_ANSWER",
        }
    }

    /// Whether the original answer must be captured and shipped along.
    pub fn wants_answer(&self) -> bool {
        matches!(self, DuplicationType::RequestWithAnswer)
    }
}

impl fmt::Display for DuplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicationType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NONE" => Ok(DuplicationType::None),
            "HEADER_ONLY" => Ok(DuplicationType::HeaderOnly),
            "COMPLETE_REQUEST" => Ok(DuplicationType::CompleteRequest),
            "REQUEST_WITH_ANSWER" => Ok(DuplicationType::RequestWithAnswer),
            other => Err(ConfigError::InvalidValue {
                what: "duplication type",
                value: other.to_string(),
                supported: "NONE | HEADER_ONLY | COMPLETE_REQUEST | REQUEST_WITH_ANSWER",
            }),
        }
    }
}

/// Ordered header list, preserving duplicates and insertion order.
pub type Headers = Vec<(String, String)>;

/// Immutable snapshot of one inbound request once its body is fully read.
///
/// Created by the host when the request body completes, owned by the
/// pipeline stage processing it, and handed to exactly one dispatch job per
/// selected destination. Body and answer are kept as text: filters and
/// substitutions apply with text semantics, and the capture boundary is
/// lossy for non-UTF-8 payloads.
#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    /// Correlation id, propagated on both the original and the duplicate.
    pub id: String,
    /// The configured location this request resolved to.
    pub conf_path: String,
    /// Original HTTP method.
    pub method: String,
    /// Request path (URI without the query string).
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub args: String,
    /// Request headers in arrival order.
    pub headers_in: Headers,
    /// Response headers, populated only when answer capture is on.
    pub headers_out: Headers,
    /// Request body.
    pub body: String,
    /// Response body, populated only when answer capture is on.
    pub answer: String,
}

impl CapturedRequest {
    pub fn new(id: impl Into<String>, conf_path: impl Into<String>) -> Self {
        CapturedRequest {
            id: id.into(),
            conf_path: conf_path.into(),
            method: "POST".to_string(),
            ..Default::default()
        }
    }

    /// First request header with the given name, case-insensitive.
    pub fn header_in(&self, name: &str) -> Option<&str> {
        self.headers_in
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The undifferentiated request representation used by raw filters:
    /// request line, headers, blank line, body.
    pub fn raw_representation(&self) -> String {
        let mut raw = String::with_capacity(
            self.path.len() + self.args.len() + self.body.len() + self.headers_in.len() * 32,
        );
        raw.push_str(&self.method);
        raw.push(' ');
        raw.push_str(&self.path);
        if !self.args.is_empty() {
            raw.push('?');
            raw.push_str(&self.args);
        }
        raw.push('\n');
        for (name, value) in &self.headers_in {
            raw.push_str(name);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push('\n');
        }
        raw.push('\n');
        raw.push_str(&self.body);
        raw
    }
}

/// The unit submitted to the dispatch pool: one (possibly substituted)
/// request copy bound for one destination. Owned solely by the pool while
/// queued and executing.
#[derive(Debug, Clone)]
pub struct DuplicationJob {
    pub request: CapturedRequest,
    /// Destination in `host[:port]` form.
    pub destination: String,
    /// Governs the marker header and whether the remote answer is awaited.
    pub duplication_type: DuplicationType,
}
