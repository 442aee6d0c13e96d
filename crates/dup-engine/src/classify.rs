//! Request classifier: matches a captured request against the rule store,
//! samples per destination, and produces the mutated duplicate copies.
//!
//! Classification runs on the request-serving task and never blocks on
//! network I/O. Sampling draws come from a caller-supplied random source so
//! the hot path can use the per-thread generator while tests inject a seeded
//! one.

use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::request::{CapturedRequest, DuplicationJob, DuplicationType};
use crate::rules::{Commands, FilterRule, RuleStore, SubstitutionRule};

/// How query-argument values are decoded before filter evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// No decoding; values are matched as transmitted.
    Raw,
    /// Standard percent-decoding (`%XX`).
    #[default]
    Percent,
    /// Form-style decoding: percent-decoding plus `+` as space.
    Form,
}

impl FromStr for DecodeMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "raw" => Ok(DecodeMode::Raw),
            "percent" => Ok(DecodeMode::Percent),
            "form" => Ok(DecodeMode::Form),
            other => Err(ConfigError::InvalidValue {
                what: "url codec",
                value: other.to_string(),
                supported: "raw | percent | form",
            }),
        }
    }
}

/// Why a destination did or did not receive a duplicate. Sampled-out is kept
/// distinguishable from unmatched for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationVerdict {
    Selected,
    SampledOut,
    NoFilterMatch,
}

/// One destination selected for duplication, with the mutated request copy.
#[derive(Debug, Clone)]
pub struct MatchedDestination {
    pub destination: String,
    pub percentage: u32,
    pub duplication_type: DuplicationType,
    /// The duplicated copy, with substitutions applied. The original request
    /// is never modified.
    pub request: CapturedRequest,
}

impl MatchedDestination {
    pub fn into_job(self) -> DuplicationJob {
        DuplicationJob {
            request: self.request,
            destination: self.destination,
            duplication_type: self.duplication_type,
        }
    }
}

/// Result of classifying one request: the selected destinations and the
/// per-destination verdicts.
#[derive(Debug, Default)]
pub struct Classification {
    pub matches: Vec<MatchedDestination>,
    pub verdicts: Vec<(String, DestinationVerdict)>,
}

/// Matches captured requests against an immutable rule store.
#[derive(Clone)]
pub struct Classifier {
    store: Arc<RuleStore>,
    decode_mode: DecodeMode,
}

impl Classifier {
    pub fn new(store: Arc<RuleStore>, decode_mode: DecodeMode) -> Self {
        Classifier { store, decode_mode }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Classify with the per-thread random source. Each serving thread gets
    /// an independently seeded generator, so sampling never contends on a
    /// shared lock.
    pub fn classify(&self, request: &CapturedRequest) -> Classification {
        self.classify_with(request, &mut rand::thread_rng())
    }

    /// Classify with an explicit random source (injectable for tests).
    pub fn classify_with<R: Rng>(&self, request: &CapturedRequest, rng: &mut R) -> Classification {
        let mut classification = Classification::default();
        let Some(rules) = self.store.resolve(&request.conf_path) else {
            return classification;
        };

        let args = parse_args(&request.args, self.decode_mode);
        let body_args = parse_args(&request.body, self.decode_mode);

        for commands in &rules.destinations {
            if commands.duplication_type == DuplicationType::None {
                continue;
            }
            let matched = commands.filters.is_empty()
                || commands
                    .filters
                    .iter()
                    .any(|f| filter_matches(f, request, &args, &body_args));
            if !matched {
                classification
                    .verdicts
                    .push((commands.destination.clone(), DestinationVerdict::NoFilterMatch));
                continue;
            }

            if !sampled_in(rng, commands.percentage) {
                classification
                    .verdicts
                    .push((commands.destination.clone(), DestinationVerdict::SampledOut));
                continue;
            }

            classification
                .verdicts
                .push((commands.destination.clone(), DestinationVerdict::Selected));
            classification.matches.push(MatchedDestination {
                destination: commands.destination.clone(),
                percentage: commands.percentage,
                duplication_type: commands.duplication_type,
                request: substitute(commands, request),
            });
        }
        classification
    }

    /// Evaluate the path's enrichment rules and return the context variables
    /// to set. Runs synchronously before the primary request continues, since
    /// downstream routing may depend on the result. Independent of the
    /// duplication decision.
    pub fn enrich(&self, request: &CapturedRequest) -> Vec<(String, String)> {
        let Some(rules) = self.store.resolve(&request.conf_path) else {
            return Vec::new();
        };

        let mut variables = Vec::new();
        for rule in &rules.enrich {
            let mut targets: Vec<&str> = Vec::with_capacity(2);
            if rule.scope.covers_header() {
                targets.push(&request.args);
            }
            if rule.scope.covers_body() {
                targets.push(&request.body);
            }
            for text in targets {
                if let Some(caps) = rule.pattern.captures(text) {
                    let mut value = String::new();
                    caps.expand(&rule.template, &mut value);
                    variables.push((rule.name.clone(), value));
                    break;
                }
            }
        }
        variables
    }
}

/// Uniform draw in [0,100); duplicate when the draw falls under the
/// configured percentage. Independent per request per destination.
fn sampled_in<R: Rng>(rng: &mut R, percentage: u32) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage == 0 {
        return false;
    }
    rng.gen_range(0..100u32) < percentage
}

fn filter_matches(
    filter: &FilterRule,
    request: &CapturedRequest,
    args: &[(String, String)],
    body_args: &[(String, String)],
) -> bool {
    if filter.raw {
        return filter.pattern.is_match(&request.raw_representation());
    }

    match &filter.field {
        Some(field) => {
            if filter.scope.covers_header() {
                let arg_hit = args
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(field))
                    .any(|(_, v)| filter.pattern.is_match(v));
                let header_hit = request
                    .headers_in
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(field))
                    .any(|(_, v)| filter.pattern.is_match(v));
                if arg_hit || header_hit {
                    return true;
                }
            }
            if filter.scope.covers_body() {
                if body_args
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(field))
                    .any(|(_, v)| filter.pattern.is_match(v))
                {
                    return true;
                }
            }
            false
        }
        None => {
            // No designated field: match against the whole scoped text.
            (filter.scope.covers_header() && filter.pattern.is_match(&request.args))
                || (filter.scope.covers_body() && filter.pattern.is_match(&request.body))
        }
    }
}

/// Apply the destination's substitutions, in registration order, to a fresh
/// copy of the request. Only the duplicate is mutated.
fn substitute(commands: &Commands, request: &CapturedRequest) -> CapturedRequest {
    let mut copy = request.clone();
    for rule in &commands.substitutions {
        apply_substitution(rule, &mut copy);
    }
    copy
}

fn apply_substitution(rule: &SubstitutionRule, request: &mut CapturedRequest) {
    match &rule.field {
        Some(field) => {
            if rule.scope.covers_header() {
                request.args = rewrite_keyed(&request.args, field, rule);
                for (name, value) in request.headers_in.iter_mut() {
                    if name.eq_ignore_ascii_case(field) {
                        *value = rule.pattern.replace_all(value, rule.template.as_str()).into_owned();
                    }
                }
            }
            if rule.scope.covers_body() {
                request.body = rewrite_keyed(&request.body, field, rule);
            }
        }
        None => {
            if rule.scope.covers_header() {
                request.args = rule
                    .pattern
                    .replace_all(&request.args, rule.template.as_str())
                    .into_owned();
            }
            if rule.scope.covers_body() {
                request.body = rule
                    .pattern
                    .replace_all(&request.body, rule.template.as_str())
                    .into_owned();
            }
        }
    }
}

/// Rewrite the values of `field` inside an `&`/`=`-separated argument
/// string, leaving other pairs untouched.
fn rewrite_keyed(text: &str, field: &str, rule: &SubstitutionRule) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = Vec::new();
    for pair in text.split('&') {
        match pair.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case(field) => {
                let replaced = rule.pattern.replace_all(value, rule.template.as_str());
                out.push(format!("{key}={replaced}"));
            }
            _ => out.push(pair.to_string()),
        }
    }
    out.join("&")
}

/// Split a query (or form body) into ordered key/value pairs. Malformed
/// pairs are skipped, never fatal: empty keys and values that fail to
/// decode drop only that pair.
pub fn parse_args(query: &str, mode: DecodeMode) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if query.is_empty() {
        return pairs;
    }
    for token in query.split('&') {
        if token.is_empty() {
            continue;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, v),
            None => (token, ""),
        };
        if key.is_empty() {
            continue;
        }
        let decoded = match mode {
            DecodeMode::Raw => Some(value.to_string()),
            DecodeMode::Percent => decode_value(value, false),
            DecodeMode::Form => decode_value(value, true),
        };
        match decoded {
            Some(v) => pairs.push((key.to_string(), v)),
            None => continue,
        }
    }
    pairs
}

fn decode_value(value: &str, plus_as_space: bool) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                out.push(hi * 16 + lo);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::rules::{ApplicationScope, RuleStore};

    fn request(conf_path: &str, path: &str, args: &str) -> CapturedRequest {
        let mut req = CapturedRequest::new("42", conf_path);
        req.path = path.to_string();
        req.args = args.to_string();
        req
    }

    /// A draw source that always yields 0, so any non-zero percentage
    /// samples in.
    fn always_in() -> StepRng {
        StepRng::new(0, 0)
    }

    fn store_with_sid_filters() -> Arc<RuleStore> {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "localhost:42", 42, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_filter(
                "/spp/main",
                "localhost:42",
                ApplicationScope::Header,
                Some("SID"),
                "fortytwo",
            )
            .unwrap();
        store
            .register_destination("/spp/main", "localhost:84", 84, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_filter(
                "/spp/main",
                "localhost:84",
                ApplicationScope::Header,
                Some("SID"),
                "eightyfour",
            )
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn classifies_to_the_destination_whose_filter_matches() {
        let classifier = Classifier::new(store_with_sid_filters(), DecodeMode::Percent);

        let req = request("/spp/main", "/spp/main/foo/", "SID=eightyfour");
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].destination, "localhost:84");
        assert_eq!(result.matches[0].percentage, 84);

        let req = request("/spp/main", "/spp/main/foo/", "SID=fortytwo");
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].destination, "localhost:42");
        assert_eq!(result.matches[0].percentage, 42);
    }

    #[test]
    fn unconfigured_path_is_never_duplicated() {
        let classifier = Classifier::new(store_with_sid_filters(), DecodeMode::Percent);
        let req = request("/other", "/other/x", "SID=eightyfour");
        let result = classifier.classify_with(&req, &mut always_in());
        assert!(result.matches.is_empty());
        assert!(result.verdicts.is_empty());
    }

    #[test]
    fn destination_without_filters_matches_every_request() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "localhost:8080", 100, DuplicationType::CompleteRequest)
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let req = request("/spp/main", "/spp/main", "");
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].destination, "localhost:8080");
    }

    #[test]
    fn sampled_out_is_distinguishable_from_unmatched() {
        let mut store = RuleStore::new();
        // percentage 0: always sampled out, never selected
        store
            .register_destination("/spp/main", "never", 0, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_destination("/spp/main", "other", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_filter(
                "/spp/main",
                "other",
                ApplicationScope::Header,
                Some("SID"),
                "nomatch",
            )
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let req = request("/spp/main", "/spp/main", "SID=value");
        let result = classifier.classify_with(&req, &mut always_in());
        assert!(result.matches.is_empty());
        assert_eq!(
            result.verdicts,
            vec![
                ("never".to_string(), DestinationVerdict::SampledOut),
                ("other".to_string(), DestinationVerdict::NoFilterMatch),
            ]
        );
    }

    #[test]
    fn raw_filter_matches_headers_and_body_together() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "raw-dest", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_raw_filter("/spp/main", "raw-dest", "X-Trace: on")
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let mut req = request("/spp/main", "/spp/main", "");
        req.headers_in.push(("X-Trace".to_string(), "on".to_string()));
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches.len(), 1);

        let req = request("/spp/main", "/spp/main", "");
        let result = classifier.classify_with(&req, &mut always_in());
        assert!(result.matches.is_empty());
    }

    #[test]
    fn body_substitution_mutates_only_the_duplicate() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "dest", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_raw_substitution("/spp/main", "dest", ApplicationScope::Body, "foo", "bar")
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let mut req = request("/spp/main", "/spp/main", "");
        req.body = "foobaz".to_string();
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches[0].request.body, "barbaz");
        assert_eq!(req.body, "foobaz");
    }

    #[test]
    fn keyed_substitution_rewrites_only_the_designated_argument() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "dest", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_substitution(
                "/spp/main",
                "dest",
                ApplicationScope::Header,
                "SID",
                "(eighty)four",
                "${1}two",
            )
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let req = request("/spp/main", "/spp/main", "SID=eightyfour&other=eightyfour");
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(
            result.matches[0].request.args,
            "SID=eightytwo&other=eightyfour"
        );
    }

    #[test]
    fn substitutions_apply_in_registration_order() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "dest", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_raw_substitution("/spp/main", "dest", ApplicationScope::Body, "foo", "bar")
            .unwrap();
        store
            .register_raw_substitution("/spp/main", "dest", ApplicationScope::Body, "barbaz", "done")
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let mut req = request("/spp/main", "/spp/main", "");
        req.body = "foobaz".to_string();
        let result = classifier.classify_with(&req, &mut always_in());
        assert_eq!(result.matches[0].request.body, "done");
    }

    #[test]
    fn enrich_sets_variables_from_capture_groups() {
        let mut store = RuleStore::new();
        store
            .register_destination("/spp/main", "dest", 100, DuplicationType::CompleteRequest)
            .unwrap();
        store
            .register_enrich_context(
                "/spp/main",
                ApplicationScope::Header,
                "session",
                "SID=(\\w+)",
                "$1",
            )
            .unwrap();
        let classifier = Classifier::new(Arc::new(store), DecodeMode::Percent);

        let req = request("/spp/main", "/spp/main", "SID=eightyfour");
        let vars = classifier.enrich(&req);
        assert_eq!(vars, vec![("session".to_string(), "eightyfour".to_string())]);

        let req = request("/spp/main", "/spp/main", "other=1");
        assert!(classifier.enrich(&req).is_empty());
    }

    #[test]
    fn parse_args_skips_malformed_pairs() {
        let pairs = parse_args("a=1&&=orphan&b&c=%ZZ&d=ok", DecodeMode::Percent);
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), String::new()),
                ("d".to_string(), "ok".to_string()),
            ]
        );
    }

    #[test]
    fn decode_modes() {
        assert_eq!(
            parse_args("k=a%20b+c", DecodeMode::Raw),
            vec![("k".to_string(), "a%20b+c".to_string())]
        );
        assert_eq!(
            parse_args("k=a%20b+c", DecodeMode::Percent),
            vec![("k".to_string(), "a b+c".to_string())]
        );
        assert_eq!(
            parse_args("k=a%20b+c", DecodeMode::Form),
            vec![("k".to_string(), "a b c".to_string())]
        );
    }

    #[test]
    fn sampling_frequency_approaches_the_configured_percentage() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        const DRAWS: u32 = 100_000;
        for percentage in [42u32, 84] {
            let mut hits = 0u32;
            for _ in 0..DRAWS {
                if sampled_in(&mut rng, percentage) {
                    hits += 1;
                }
            }
            let observed = hits as f64 / DRAWS as f64 * 100.0;
            let expected = percentage as f64;
            assert!(
                (observed - expected).abs() < 1.0,
                "percentage {percentage}: observed {observed:.2}"
            );
        }
    }

    #[test]
    fn sampling_edges_are_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!((0..1000).all(|_| sampled_in(&mut rng, 100)));
        assert!((0..1000).all(|_| !sampled_in(&mut rng, 0)));
    }
}
