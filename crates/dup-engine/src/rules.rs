//! Rule store: per-path collections of filter, substitution, and enrichment
//! rules, each bound to a destination and a duplication percentage.
//!
//! The store is built single-threaded at configuration time, then shared
//! behind an `Arc` and read without locks for the lifetime of the process.
//! Registration is atomic per directive: an invalid pattern or argument
//! rejects that directive and leaves the store unchanged.

use std::collections::HashMap;
use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigError;
use crate::request::DuplicationType;

/// Which part of a request a rule's pattern is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplicationScope {
    #[default]
    Header,
    Body,
    All,
}

impl ApplicationScope {
    pub fn covers_header(&self) -> bool {
        matches!(self, ApplicationScope::Header | ApplicationScope::All)
    }

    pub fn covers_body(&self) -> bool {
        matches!(self, ApplicationScope::Body | ApplicationScope::All)
    }
}

impl FromStr for ApplicationScope {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "HEADER" => Ok(ApplicationScope::Header),
            "BODY" => Ok(ApplicationScope::Body),
            "ALL" => Ok(ApplicationScope::All),
            other => Err(ConfigError::InvalidValue {
                what: "application scope",
                value: other.to_string(),
                supported: "HEADER | BODY | ALL",
            }),
        }
    }
}

/// A filter rule. At least one filter of a destination must match for that
/// destination to be selected; a destination with no filters matches every
/// request (bare activation).
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub scope: ApplicationScope,
    /// Query-argument key or header name the pattern applies to. `None`
    /// matches the pattern against the whole scoped text.
    pub field: Option<String>,
    pub pattern: Regex,
    /// Raw filters match the undifferentiated request representation
    /// (request line + headers + body) instead of a single field.
    pub raw: bool,
}

/// A substitution rule, applied in registration order to the duplicated copy
/// only. The template may reference capture groups (`$1`, `${name}`).
#[derive(Debug, Clone)]
pub struct SubstitutionRule {
    pub scope: ApplicationScope,
    /// Query-argument key or header name to rewrite. `None` for raw
    /// substitutions, which rewrite the whole scoped text.
    pub field: Option<String>,
    pub pattern: Regex,
    pub template: String,
}

/// A context-enrichment rule: when the pattern matches in scope, a named
/// variable is set for the host's downstream routing/rewriting layer. Runs
/// synchronously, independently of duplication decisions.
#[derive(Debug, Clone)]
pub struct EnrichRule {
    pub name: String,
    pub scope: ApplicationScope,
    pub pattern: Regex,
    /// Value template, expanded against the capture groups of the match.
    pub template: String,
}

/// The ordered rules bound to one destination of a path.
#[derive(Debug, Clone)]
pub struct Commands {
    pub destination: String,
    /// Probability (0-100) that a matched request is actually duplicated.
    pub percentage: u32,
    pub duplication_type: DuplicationType,
    pub filters: Vec<FilterRule>,
    pub substitutions: Vec<SubstitutionRule>,
}

impl Commands {
    fn new(destination: &str) -> Self {
        Commands {
            destination: destination.to_string(),
            percentage: DEFAULT_PERCENTAGE,
            duplication_type: DuplicationType::default(),
            filters: Vec::new(),
            substitutions: Vec::new(),
        }
    }
}

/// Everything registered under one configured path.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    pub conf_path: String,
    /// Destinations in registration order.
    pub destinations: Vec<Commands>,
    /// Path-scoped enrichment rules (destination-independent).
    pub enrich: Vec<EnrichRule>,
    highest: DuplicationType,
}

impl PathRules {
    pub fn highest_duplication_type(&self) -> DuplicationType {
        self.highest
    }

    pub fn destination(&self, destination: &str) -> Option<&Commands> {
        self.destinations
            .iter()
            .find(|c| c.destination == destination)
    }

    fn destination_mut(&mut self, destination: &str) -> &mut Commands {
        if let Some(i) = self
            .destinations
            .iter()
            .position(|c| c.destination == destination)
        {
            &mut self.destinations[i]
        } else {
            self.destinations.push(Commands::new(destination));
            self.destinations.last_mut().expect("just pushed")
        }
    }
}

pub const DEFAULT_PERCENTAGE: u32 = 100;

/// Parse a duplication percentage argument. Absent means the default (100).
pub fn parse_percentage(value: Option<&str>) -> Result<u32, ConfigError> {
    let Some(value) = value else {
        return Ok(DEFAULT_PERCENTAGE);
    };
    let parsed: u32 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPercentage(value.to_string()))?;
    if parsed > 100 {
        return Err(ConfigError::InvalidPercentage(value.to_string()));
    }
    Ok(parsed)
}

/// Per-path rule collections, keyed by configured path.
#[derive(Debug, Default)]
pub struct RuleStore {
    paths: HashMap<String, PathRules>,
}

impl RuleStore {
    pub fn new() -> Self {
        RuleStore::default()
    }

    /// Activate a path+destination pair. With no filters registered
    /// afterwards, the destination matches every request for the path.
    /// Re-registering the same pair overrides the percentage (last one
    /// wins) and raises the path's highest duplication type.
    pub fn register_destination(
        &mut self,
        path: &str,
        destination: &str,
        percentage: u32,
        duplication_type: DuplicationType,
    ) -> Result<(), ConfigError> {
        if destination.is_empty() {
            return Err(ConfigError::Missing("destination argument"));
        }
        if percentage > 100 {
            return Err(ConfigError::InvalidPercentage(percentage.to_string()));
        }
        let rules = self.path_mut(path);
        let commands = rules.destination_mut(destination);
        commands.percentage = percentage;
        commands.duplication_type = duplication_type;
        rules.highest = rules.highest.max(duplication_type);
        Ok(())
    }

    /// Raise the highest duplication type ever requested for a path.
    /// Monotonic: a lower type never lowers the recorded value.
    pub fn raise_duplication_type(&mut self, path: &str, duplication_type: DuplicationType) {
        let rules = self.path_mut(path);
        rules.highest = rules.highest.max(duplication_type);
    }

    pub fn register_filter(
        &mut self,
        path: &str,
        destination: &str,
        scope: ApplicationScope,
        field: Option<&str>,
        pattern: &str,
    ) -> Result<(), ConfigError> {
        let pattern = compile(pattern)?;
        self.path_mut(path)
            .destination_mut(destination)
            .filters
            .push(FilterRule {
                scope,
                field: field.map(str::to_string),
                pattern,
                raw: false,
            });
        Ok(())
    }

    pub fn register_raw_filter(
        &mut self,
        path: &str,
        destination: &str,
        pattern: &str,
    ) -> Result<(), ConfigError> {
        let pattern = compile(pattern)?;
        self.path_mut(path)
            .destination_mut(destination)
            .filters
            .push(FilterRule {
                scope: ApplicationScope::All,
                field: None,
                pattern,
                raw: true,
            });
        Ok(())
    }

    pub fn register_substitution(
        &mut self,
        path: &str,
        destination: &str,
        scope: ApplicationScope,
        field: &str,
        pattern: &str,
        template: &str,
    ) -> Result<(), ConfigError> {
        let pattern = compile(pattern)?;
        self.path_mut(path)
            .destination_mut(destination)
            .substitutions
            .push(SubstitutionRule {
                scope,
                field: Some(field.to_string()),
                pattern,
                template: template.to_string(),
            });
        Ok(())
    }

    pub fn register_raw_substitution(
        &mut self,
        path: &str,
        destination: &str,
        scope: ApplicationScope,
        pattern: &str,
        template: &str,
    ) -> Result<(), ConfigError> {
        let pattern = compile(pattern)?;
        self.path_mut(path)
            .destination_mut(destination)
            .substitutions
            .push(SubstitutionRule {
                scope,
                field: None,
                pattern,
                template: template.to_string(),
            });
        Ok(())
    }

    pub fn register_enrich_context(
        &mut self,
        path: &str,
        scope: ApplicationScope,
        name: &str,
        pattern: &str,
        template: &str,
    ) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::Missing("context variable name"));
        }
        let pattern = compile(pattern)?;
        self.path_mut(path).enrich.push(EnrichRule {
            name: name.to_string(),
            scope,
            pattern,
            template: template.to_string(),
        });
        Ok(())
    }

    /// Highest duplication type ever registered for a path; `None` when the
    /// path is not configured.
    pub fn highest_duplication_type(&self, path: &str) -> DuplicationType {
        self.paths
            .get(path)
            .map(PathRules::highest_duplication_type)
            .unwrap_or_default()
    }

    /// Exact lookup by configured path. Absent means: do not duplicate.
    pub fn resolve(&self, conf_path: &str) -> Option<&PathRules> {
        self.paths.get(conf_path)
    }

    /// Longest-prefix lookup for an incoming request path. Prefixes match at
    /// path-segment boundaries only (`/spp/main` covers `/spp/main/foo` but
    /// not `/spp/mainline`).
    pub fn match_location(&self, request_path: &str) -> Option<&PathRules> {
        self.paths
            .values()
            .filter(|rules| {
                let prefix = rules.conf_path.as_str();
                request_path == prefix
                    || (request_path.starts_with(prefix)
                        && request_path[prefix.len()..].starts_with('/'))
            })
            .max_by_key(|rules| rules.conf_path.len())
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn path_mut(&mut self, path: &str) -> &mut PathRules {
        self.paths
            .entry(path.to_string())
            .or_insert_with(|| PathRules {
                conf_path: path.to_string(),
                ..Default::default()
            })
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::invalid_pattern(pattern, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pattern_leaves_store_unchanged() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "localhost", 100, DuplicationType::CompleteRequest)
            .unwrap();

        assert!(store
            .register_filter("/spp/main", "localhost", ApplicationScope::Header, Some("titi"), "*toto")
            .is_err());
        assert!(store
            .register_raw_filter("/spp/main", "localhost", "InvalidFilter(")
            .is_err());
        assert!(store
            .register_substitution(
                "/spp/main",
                "localhost",
                ApplicationScope::Header,
                "toto",
                "*t(oto",
                "titi",
            )
            .is_err());
        assert!(store
            .register_raw_substitution(
                "/spp/main",
                "localhost",
                ApplicationScope::All,
                "toMatchInvalid(",
                "toReplace",
            )
            .is_err());

        let rules = store.resolve("/spp/main").unwrap();
        let commands = rules.destination("localhost").unwrap();
        assert!(commands.filters.is_empty());
        assert!(commands.substitutions.is_empty());
    }

    #[test]
    fn valid_directives_are_stored_in_order() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "localhost", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_filter("/spp/main", "localhost", ApplicationScope::Header, Some("titi"), "toto")
            .unwrap();
        store
            .register_raw_filter("/spp/main", "localhost", "Filter")
            .unwrap();
        store
            .register_substitution(
                "/spp/main",
                "localhost",
                ApplicationScope::Header,
                "toto",
                "toto",
                "titi",
            )
            .unwrap();
        store
            .register_raw_substitution(
                "/spp/main",
                "localhost",
                ApplicationScope::All,
                "toMatch",
                "toReplace",
            )
            .unwrap();

        let commands = store
            .resolve("/spp/main")
            .unwrap()
            .destination("localhost")
            .unwrap();
        assert_eq!(commands.filters.len(), 2);
        assert!(!commands.filters[0].raw);
        assert!(commands.filters[1].raw);
        assert_eq!(commands.substitutions.len(), 2);
        assert_eq!(commands.substitutions[0].field.as_deref(), Some("toto"));
        assert!(commands.substitutions[1].field.is_none());
    }

    #[test]
    fn destination_percentage_last_one_wins() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "localhost:42", 42, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_destination("/spp/main", "localhost:42", 12, DuplicationType::CompleteRequest)
            .unwrap();

        let commands = store
            .resolve("/spp/main")
            .unwrap()
            .destination("localhost:42")
            .unwrap();
        assert_eq!(commands.percentage, 12);
    }

    #[test]
    fn percentage_validation() {
        assert!(parse_percentage(Some("JeNeSuisPasUnNombre")).is_err());
        assert!(parse_percentage(Some("666")).is_err());
        assert_eq!(parse_percentage(Some("12")).unwrap(), 12);
        assert_eq!(parse_percentage(None).unwrap(), DEFAULT_PERCENTAGE);

        let mut store = RuleStore::new();
        assert!(store
            .register_destination("/spp/main", "localhost", 666, DuplicationType::CompleteRequest)
            .is_err());
        assert!(store
            .register_destination("/spp/main", "", 10, DuplicationType::CompleteRequest)
            .is_err());
    }

    #[test]
    fn highest_duplication_type_never_decreases() {
        let mut store = RuleStore::new();
        assert_eq!(
            store.highest_duplication_type("/spp/main"),
            DuplicationType::None
        );

        store.raise_duplication_type("/spp/main", DuplicationType::HeaderOnly);
        store.raise_duplication_type("/spp/main", DuplicationType::CompleteRequest);
        store.raise_duplication_type("/spp/main", DuplicationType::HeaderOnly);

        assert_eq!(
            store.highest_duplication_type("/spp/main"),
            DuplicationType::CompleteRequest
        );
    }

    #[test]
    fn application_scope_parses_config_strings() {
        assert_eq!(
            "HEADER".parse::<ApplicationScope>().unwrap(),
            ApplicationScope::Header
        );
        assert_eq!(
            "BODY".parse::<ApplicationScope>().unwrap(),
            ApplicationScope::Body
        );
        assert_eq!("ALL".parse::<ApplicationScope>().unwrap(), ApplicationScope::All);
        assert!("incorrect_vALUE".parse::<ApplicationScope>().is_err());
    }

    #[test]
    fn match_location_uses_longest_segment_prefix() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp", "a", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_destination("/spp/main", "b", 100, DuplicationType::CompleteRequest)
            .unwrap();

        assert_eq!(
            store.match_location("/spp/main/foo").unwrap().conf_path,
            "/spp/main"
        );
        assert_eq!(store.match_location("/spp/other").unwrap().conf_path, "/spp");
        assert_eq!(store.match_location("/spp/mainline").unwrap().conf_path, "/spp");
        assert!(store.match_location("/other").is_none());
    }
}
