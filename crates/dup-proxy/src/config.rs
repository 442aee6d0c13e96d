//! Configuration types and loading logic.
//!
//! Loaded from a TOML file merged with `DUP_`-prefixed environment
//! variables. Each `[[location]]` block declares one path+destination pair
//! with its rules; an invalid directive rejects that directive only and the
//! rest of the configuration still loads.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use dup_engine::classify::DecodeMode;
use dup_engine::request::DuplicationType;
use dup_engine::rules::{ApplicationScope, RuleStore};
use dup_tracing::TracingConfig;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub duplication: DuplicationConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    /// Per-path duplication locations.
    #[serde(default, rename = "location")]
    pub locations: Vec<LocationConfig>,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Maximum inbound body size the proxy will buffer, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Primary upstream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryConfig {
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,

    #[serde(default = "default_primary_timeout")]
    pub timeout_secs: u64,
}

/// Engine-wide duplication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DuplicationConfig {
    /// Name used in the periodic stats report.
    #[serde(default = "default_program_name")]
    pub program_name: String,

    /// Per-call timeout for outgoing duplicates, in milliseconds.
    #[serde(default = "default_outbound_timeout_ms")]
    pub timeout_ms: u64,

    /// Decoding applied to query-argument values before rule evaluation.
    #[serde(default)]
    pub url_codec: DecodeMode,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_min_queue")]
    pub min_queue: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Period of the stats report, in seconds.
    #[serde(default = "default_stats_period")]
    pub stats_period_secs: u64,
}

/// One configured path+destination pair and its rules.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub path: String,
    pub destination: String,

    /// Probability (0-100) that a matched request is duplicated here.
    #[serde(default = "default_percentage")]
    pub percentage: u32,

    /// Default application scope for this location's rules
    /// (`HEADER` | `BODY` | `ALL`).
    #[serde(default = "default_scope")]
    pub scope: String,

    /// `NONE` | `HEADER_ONLY` | `COMPLETE_REQUEST` | `REQUEST_WITH_ANSWER`.
    #[serde(default = "default_duplication_type")]
    pub duplication_type: String,

    /// Dispatch duplicates on the request-serving path instead of the pool.
    #[serde(default)]
    pub synchronous: bool,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterDirective>,
    #[serde(default, rename = "raw_filter")]
    pub raw_filters: Vec<RawFilterDirective>,
    #[serde(default, rename = "substitute")]
    pub substitutions: Vec<SubstituteDirective>,
    #[serde(default, rename = "raw_substitute")]
    pub raw_substitutions: Vec<RawSubstituteDirective>,
    #[serde(default, rename = "enrich")]
    pub enrichments: Vec<EnrichDirective>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDirective {
    pub field: Option<String>,
    pub pattern: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFilterDirective {
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubstituteDirective {
    pub field: String,
    pub pattern: String,
    pub replacement: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSubstituteDirective {
    pub pattern: String,
    pub replacement: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichDirective {
    pub name: String,
    pub pattern: String,
    pub value: String,
    pub scope: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:3080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_upstream_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_primary_timeout() -> u64 {
    300
}

fn default_program_name() -> String {
    "dup-proxy".to_string()
}

fn default_outbound_timeout_ms() -> u64 {
    1500
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    10
}

fn default_min_queue() -> usize {
    1
}

fn default_max_queue() -> usize {
    100
}

fn default_stats_period() -> u64 {
    10
}

fn default_percentage() -> u32 {
    100
}

fn default_scope() -> String {
    "HEADER".to_string()
}

fn default_duplication_type() -> String {
    "COMPLETE_REQUEST".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: default_listen_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        PrimaryConfig {
            upstream_base_url: default_upstream_base_url(),
            timeout_secs: default_primary_timeout(),
        }
    }
}

impl Default for DuplicationConfig {
    fn default() -> Self {
        DuplicationConfig {
            program_name: default_program_name(),
            timeout_ms: default_outbound_timeout_ms(),
            url_codec: DecodeMode::default(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            min_queue: default_min_queue(),
            max_queue: default_max_queue(),
            stats_period_secs: default_stats_period(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (DUP_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("DUP_").split("__"))
            .extract()?;
        Ok(config)
    }
}

/// Translate the `[[location]]` blocks into engine registrations.
///
/// Invalid directives are logged and skipped individually — one bad pattern
/// never takes down the rest of the configuration. Returns the store and the
/// number of rejected directives.
pub fn build_rule_store(config: &AppConfig) -> (RuleStore, usize) {
    let mut store = RuleStore::new();
    let mut rejected = 0usize;

    for location in &config.locations {
        if !location.active {
            tracing::info!(path = %location.path, destination = %location.destination,
                "location inactive, skipping");
            continue;
        }

        let default_scope = match parse_scope(&location.scope, &location.path, &mut rejected) {
            Some(scope) => scope,
            None => ApplicationScope::default(),
        };

        let duplication_type = match location.duplication_type.parse::<DuplicationType>() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(path = %location.path, error = %e, "invalid duplication type");
                rejected += 1;
                continue;
            }
        };

        if let Err(e) = store.register_destination(
            &location.path,
            &location.destination,
            location.percentage,
            duplication_type,
        ) {
            tracing::error!(path = %location.path, destination = %location.destination,
                error = %e, "invalid destination directive");
            rejected += 1;
            continue;
        }

        for directive in &location.filters {
            let scope = directive
                .scope
                .as_deref()
                .and_then(|s| parse_scope(s, &location.path, &mut rejected))
                .unwrap_or(default_scope);
            if let Err(e) = store.register_filter(
                &location.path,
                &location.destination,
                scope,
                directive.field.as_deref(),
                &directive.pattern,
            ) {
                tracing::error!(path = %location.path, error = %e, "invalid filter directive");
                rejected += 1;
            }
        }

        for directive in &location.raw_filters {
            if let Err(e) =
                store.register_raw_filter(&location.path, &location.destination, &directive.pattern)
            {
                tracing::error!(path = %location.path, error = %e, "invalid raw filter directive");
                rejected += 1;
            }
        }

        for directive in &location.substitutions {
            let scope = directive
                .scope
                .as_deref()
                .and_then(|s| parse_scope(s, &location.path, &mut rejected))
                .unwrap_or(default_scope);
            if let Err(e) = store.register_substitution(
                &location.path,
                &location.destination,
                scope,
                &directive.field,
                &directive.pattern,
                &directive.replacement,
            ) {
                tracing::error!(path = %location.path, error = %e, "invalid substitution directive");
                rejected += 1;
            }
        }

        for directive in &location.raw_substitutions {
            let scope = directive
                .scope
                .as_deref()
                .and_then(|s| parse_scope(s, &location.path, &mut rejected))
                .unwrap_or(default_scope);
            if let Err(e) = store.register_raw_substitution(
                &location.path,
                &location.destination,
                scope,
                &directive.pattern,
                &directive.replacement,
            ) {
                tracing::error!(path = %location.path, error = %e,
                    "invalid raw substitution directive");
                rejected += 1;
            }
        }

        for directive in &location.enrichments {
            let scope = directive
                .scope
                .as_deref()
                .and_then(|s| parse_scope(s, &location.path, &mut rejected))
                .unwrap_or(default_scope);
            if let Err(e) = store.register_enrich_context(
                &location.path,
                scope,
                &directive.name,
                &directive.pattern,
                &directive.value,
            ) {
                tracing::error!(path = %location.path, error = %e, "invalid enrich directive");
                rejected += 1;
            }
        }
    }

    (store, rejected)
}

fn parse_scope(value: &str, path: &str, rejected: &mut usize) -> Option<ApplicationScope> {
    match value.parse::<ApplicationScope>() {
        Ok(scope) => Some(scope),
        Err(e) => {
            tracing::error!(path = %path, error = %e, "invalid application scope");
            *rejected += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from_toml(toml: &str) -> AppConfig {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("config should parse")
    }

    const SAMPLE: &str = r#"
        [server]
        listen_address = "127.0.0.1:3080"

        [duplication]
        program_name = "dup-test"
        timeout_ms = 1400

        [[location]]
        path = "/spp/main"
        destination = "localhost:42"
        percentage = 42
        duplication_type = "COMPLETE_REQUEST"

        [[location.filter]]
        field = "SID"
        pattern = "fortytwo"

        [[location]]
        path = "/spp/main"
        destination = "localhost:84"
        percentage = 84
        duplication_type = "COMPLETE_REQUEST"

        [[location.filter]]
        field = "SID"
        pattern = "eightyfour"
    "#;

    #[test]
    fn builds_a_store_that_classifies_the_sample_locations() {
        let config = config_from_toml(SAMPLE);
        assert_eq!(config.duplication.timeout_ms, 1400);

        let (store, rejected) = build_rule_store(&config);
        assert_eq!(rejected, 0);

        let rules = store.resolve("/spp/main").expect("path registered");
        assert_eq!(rules.destinations.len(), 2);
        assert_eq!(rules.destination("localhost:42").unwrap().percentage, 42);
        assert_eq!(rules.destination("localhost:84").unwrap().percentage, 84);
    }

    #[test]
    fn invalid_directives_are_rejected_individually() {
        let config = config_from_toml(
            r#"
            [[location]]
            path = "/spp/main"
            destination = "localhost:42"

            [[location.filter]]
            field = "SID"
            pattern = "*broken("

            [[location.filter]]
            field = "SID"
            pattern = "good"
        "#,
        );

        let (store, rejected) = build_rule_store(&config);
        assert_eq!(rejected, 1);

        let commands = store
            .resolve("/spp/main")
            .unwrap()
            .destination("localhost:42")
            .unwrap();
        assert_eq!(commands.filters.len(), 1);
        assert_eq!(commands.filters[0].pattern.as_str(), "good");
    }

    #[test]
    fn invalid_duplication_type_skips_the_location() {
        let config = config_from_toml(
            r#"
            [[location]]
            path = "/spp/main"
            destination = "localhost:42"
            duplication_type = "EVERYTHING"
        "#,
        );

        let (store, rejected) = build_rule_store(&config);
        assert_eq!(rejected, 1);
        assert!(store.resolve("/spp/main").is_none());
    }

    #[test]
    fn defaults_are_applied() {
        let config = config_from_toml("");
        assert_eq!(config.server.listen_address, "0.0.0.0:3080");
        assert_eq!(config.duplication.program_name, "dup-proxy");
        assert_eq!(config.duplication.max_queue, 100);
        assert!(config.locations.is_empty());
    }
}
