//! Request duplication engine.
//!
//! Duplicates captured HTTP requests to secondary destinations for
//! shadow-testing without touching the primary response path. The host hands
//! the engine a fully-read [`request::CapturedRequest`]; the
//! [`classify::Classifier`] matches it against the registered
//! [`rules::RuleStore`], applies substitutions to the duplicated copy, and
//! samples per destination; matched copies become [`request::DuplicationJob`]s
//! executed by the bounded [`pool::DispatchPool`] through the
//! [`client::OutboundClient`]. Every failure on the duplication path is
//! counted and dropped — never surfaced to the primary request.

pub mod classify;
pub mod client;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod request;
pub mod rules;
pub mod stats;

pub use classify::{Classification, Classifier, DecodeMode, DestinationVerdict};
pub use client::{DispatchOutcome, OutboundClient, RequestRunner};
pub use error::{ConfigError, DispatchError, EnvelopeError, PoolError};
pub use pool::{DispatchPool, JobRunner, PoolSettings};
pub use request::{CapturedRequest, DuplicationJob, DuplicationType};
pub use rules::{ApplicationScope, RuleStore};
pub use stats::{DispatchStats, StatsRegistry};
