//! Content sanitization.
//!
//! Every piece of request content passes through a [`Sanitizer`] before it
//! reaches a channel, a log line or the persisted audit trail. Rules are
//! applied in order; input that matches nothing comes back borrowed and
//! byte-for-byte identical. If sanitizing a field fails (oversized input or
//! a panicking rule) the whole field is replaced with [`REDACTED`].

pub mod rules;

use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;

use regex::Captures;
use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::metrics::{MetricsSink, NoopMetrics};

pub use rules::Rule;

/// Replacement text for redacted content.
pub const REDACTED: &str = "***REDACTED***";

/// Fields larger than this are redacted wholesale instead of scanned.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Rule name reported when a whole field is redacted.
const FALLBACK_RULE: &str = "fallback";

#[derive(Clone)]
pub struct Sanitizer {
    rules: Vec<Rule>,
    max_input_bytes: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl Sanitizer {
    /// Sanitizer with the built-in rule set.
    pub fn new() -> Self {
        Self {
            rules: rules::builtin(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Sanitizer with no rules at all.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            ..Self::new()
        }
    }

    /// Append a rule after the existing ones.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append operator rules from a TOML file.
    pub fn with_rules_file(mut self, path: &Path) -> Result<Self> {
        self.rules.extend(rules::load(path)?);
        Ok(self)
    }

    pub fn with_max_input_bytes(mut self, max: usize) -> Self {
        self.max_input_bytes = max;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(Rule::name)
    }

    /// Sanitize `input`, falling back to full redaction on failure.
    pub fn sanitize<'a>(&self, input: &'a str) -> Cow<'a, str> {
        match self.try_sanitize(input) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, bytes = input.len(), "sanitization failed, redacting field");
                self.metrics.redaction(FALLBACK_RULE);
                Cow::Borrowed(REDACTED)
            }
        }
    }

    /// Sanitize `input`, reporting failure instead of redacting.
    pub fn try_sanitize<'a>(&self, input: &'a str) -> Result<Cow<'a, str>> {
        if input.len() > self.max_input_bytes {
            return Err(Error::Sanitizer(format!(
                "input of {} bytes exceeds limit of {}",
                input.len(),
                self.max_input_bytes
            )));
        }

        catch_unwind(AssertUnwindSafe(|| self.apply_rules(input)))
            .map_err(|_| Error::Sanitizer("rule evaluation panicked".to_string()))
    }

    fn apply_rules<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);

        for rule in &self.rules {
            if !rule.regex().is_match(&result) {
                continue;
            }
            let mut hits = 0u64;
            let replaced = rule
                .regex()
                .replace_all(&result, |caps: &Captures<'_>| {
                    hits += 1;
                    let mut out = String::new();
                    caps.expand(rule.replacement(), &mut out);
                    out
                })
                .into_owned();
            for _ in 0..hits {
                self.metrics.redaction(rule.name());
            }
            result = Cow::Owned(replaced);
        }

        result
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer")
            .field("rules", &self.rule_names().collect::<Vec<_>>())
            .field("max_input_bytes", &self.max_input_bytes)
            .finish()
    }
}
