//! Sanitizer rules: the built-in set and operator-supplied rule files.
//!
//! Rule file format (TOML):
//!
//! ```toml
//! [[rule]]
//! name = "employee_id"
//! pattern = 'EMP-\d{6}'
//! # replacement defaults to "***REDACTED***"
//! ```

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::error;

use super::REDACTED;
use crate::error::{Error, Result};

/// One pattern → replacement rule. The replacement may reference capture
/// groups (`${1}`).
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    regex: Regex,
    replacement: String,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Sanitizer(format!("rule {name}: invalid pattern: {e}")))?;
        Ok(Self {
            name,
            regex,
            replacement: replacement.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }

    pub(crate) fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// Built-in rules, most specific first. Order matters: connection strings and
/// bearer tokens are rewritten before the generic key/value and e-mail rules
/// get a chance to see their pieces.
const BUILTIN: &[(&str, &str, &str)] = &[
    (
        "pem_block",
        r"(?s)-----BEGIN [A-Z0-9 ]*(?:PRIVATE KEY|CERTIFICATE)-----.*?-----END [A-Z0-9 ]*(?:PRIVATE KEY|CERTIFICATE)-----",
        REDACTED,
    ),
    (
        "connection_string",
        r"(?i)\b([a-z][a-z0-9+.\-]*://[^\s:/@]+:)[^\s]*?(@[^\s@/?#]*(?:[/?#\s]|$))",
        "${1}***REDACTED***${2}",
    ),
    (
        "bearer_token",
        r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*",
        "${1} ***REDACTED***",
    ),
    ("github_token", r"\bgh[pousr]_[A-Za-z0-9]{16,}\b", REDACTED),
    ("slack_token", r"\bxox[abposr]-[A-Za-z0-9\-]{10,}", REDACTED),
    ("api_key", r"\bsk-[A-Za-z0-9_\-]{16,}", REDACTED),
    ("aws_access_key", r"\bAKIA[0-9A-Z]{16}\b", REDACTED),
    (
        "credential_pair",
        r#"(?i)([A-Za-z0-9_\-]*?(?:password|passwd|pwd|secret|api[_-]?key|access[_-]?key|auth[_-]?token|access[_-]?token|token))("?\s*[=:]\s*)("?)[^\s"',;&]+"#,
        "${1}${2}${3}***REDACTED***",
    ),
    (
        "email",
        r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b",
        REDACTED,
    ),
    ("national_id", r"\b\d{3}-\d{2}-\d{4}\b", REDACTED),
    (
        "phone",
        r"(?:\+\d{1,3}[\s.\-]?)?\(?\b\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}\b",
        REDACTED,
    ),
];

/// Compile the built-in rule set.
///
/// A rule that fails to compile is logged at `error` and left out.
pub fn builtin() -> Vec<Rule> {
    BUILTIN
        .iter()
        .filter_map(|(name, pattern, replacement)| {
            match Rule::new(*name, pattern, *replacement) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    error!(rule = *name, "built-in sanitizer rule disabled: {e}");
                    None
                }
            }
        })
        .collect()
}

/// Names of the built-in rules, in application order.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(name, _, _)| *name)
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    name: String,
    pattern: String,
    #[serde(default)]
    replacement: Option<String>,
}

/// Parse operator rules from TOML text.
pub fn parse(content: &str) -> Result<Vec<Rule>> {
    let file: RuleFile = toml::from_str(content)
        .map_err(|e| Error::Config(format!("bad sanitizer rules: {e}")))?;

    file.rules
        .into_iter()
        .map(|entry| {
            Rule::new(
                entry.name,
                &entry.pattern,
                entry.replacement.unwrap_or_else(|| REDACTED.to_string()),
            )
        })
        .collect()
}

/// Load operator rules from a TOML file.
pub fn load(path: &Path) -> Result<Vec<Rule>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read sanitizer rules {}: {e}", path.display()))
    })?;
    parse(&content)
}
