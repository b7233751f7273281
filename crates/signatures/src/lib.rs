//! Known-attack signature matching.
//!
//! Signatures are compiled into a single [`RegexSet`] in registration order:
//! built-in categories first (SQL injection, XSS, path traversal, command
//! injection), then operator-supplied signatures. Each inspected field is
//! scanned once, and when several signatures fire the one registered first
//! wins. The `regex` engine guarantees linear-time matching, and every field
//! is truncated to a configured byte budget before scanning.

mod builtin;

use std::fmt;
use std::str::FromStr;

use blockgate_common::{RequestRecord, SignatureConfig};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::builtin::BUILTIN_SIGNATURES;

/// Compiled program size cap for the signature set.
const REGEX_SIZE_LIMIT: usize = 8 * (1 << 20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    Custom,
}

impl SignatureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureCategory::SqlInjection => "sql_injection",
            SignatureCategory::Xss => "xss",
            SignatureCategory::PathTraversal => "path_traversal",
            SignatureCategory::CommandInjection => "command_injection",
            SignatureCategory::Custom => "custom",
        }
    }
}

impl fmt::Display for SignatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sql_injection" | "sqli" => Ok(SignatureCategory::SqlInjection),
            "xss" | "cross_site_scripting" => Ok(SignatureCategory::Xss),
            "path_traversal" => Ok(SignatureCategory::PathTraversal),
            "command_injection" => Ok(SignatureCategory::CommandInjection),
            "custom" => Ok(SignatureCategory::Custom),
            other => Err(anyhow::anyhow!("unknown signature category '{}'", other)),
        }
    }
}

/// Which part of the request a signature fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTarget {
    Url,
    Query,
    Header,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub id: String,
    pub category: SignatureCategory,
    pub description: String,
    pub target: MatchTarget,
}

#[derive(Debug, Clone)]
struct SignatureMeta {
    id: String,
    category: SignatureCategory,
    description: String,
}

pub struct SignatureMatcher {
    set: RegexSet,
    meta: Vec<SignatureMeta>,
    max_inspect_bytes: usize,
}

impl SignatureMatcher {
    /// Build a matcher from configuration.
    ///
    /// Fails if a disabled category name is unknown or a custom pattern does
    /// not compile.
    pub fn new(config: &SignatureConfig) -> anyhow::Result<Self> {
        let disabled = config
            .disabled_categories
            .iter()
            .map(|c| c.parse::<SignatureCategory>())
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut patterns = Vec::new();
        let mut meta = Vec::new();

        for builtin in BUILTIN_SIGNATURES {
            if disabled.contains(&builtin.category) {
                continue;
            }
            patterns.push(builtin.pattern.to_string());
            meta.push(SignatureMeta {
                id: builtin.id.to_string(),
                category: builtin.category,
                description: builtin.description.to_string(),
            });
        }

        for custom in &config.custom {
            let category = custom
                .category
                .parse::<SignatureCategory>()
                .unwrap_or(SignatureCategory::Custom);
            if disabled.contains(&category) {
                continue;
            }
            // Validate individually so the error names the offending signature.
            regex::RegexBuilder::new(&custom.pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| anyhow::anyhow!("custom signature '{}' is invalid: {}", custom.id, e))?;
            patterns.push(custom.pattern.clone());
            meta.push(SignatureMeta {
                id: custom.id.clone(),
                category,
                description: format!("custom signature {}", custom.id),
            });
        }

        let set = RegexSetBuilder::new(&patterns)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to compile signature set: {}", e))?;

        info!(
            signatures = meta.len(),
            disabled = ?disabled,
            "signature matcher initialized"
        );

        Ok(Self {
            set,
            meta,
            max_inspect_bytes: config.max_inspect_bytes,
        })
    }

    /// Matcher with every built-in signature enabled and default limits.
    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(&SignatureConfig::default())
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Scan the request and return the earliest-registered signature that
    /// fires on any inspected field.
    pub fn match_request(&self, request: &RequestRecord) -> Option<SignatureMatch> {
        let mut best: Option<(usize, MatchTarget)> = None;

        let mut consider = |text: &str, target: MatchTarget| {
            if let Some(idx) = self.first_match(text) {
                if best.map_or(true, |(current, _)| idx < current) {
                    best = Some((idx, target));
                }
            }
        };

        consider(&request.url, MatchTarget::Url);

        let decoded_query = request
            .query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        if !decoded_query.is_empty() {
            consider(&decoded_query, MatchTarget::Query);
        }

        for (_, value) in &request.headers {
            consider(value, MatchTarget::Header);
        }

        if let Some(ref body) = request.body {
            consider(body, MatchTarget::Body);
        }

        best.map(|(idx, target)| {
            let meta = &self.meta[idx];
            debug!(
                signature = %meta.id,
                category = %meta.category,
                target = ?target,
                "signature matched"
            );
            SignatureMatch {
                id: meta.id.clone(),
                category: meta.category,
                description: meta.description.clone(),
                target,
            }
        })
    }

    fn first_match(&self, text: &str) -> Option<usize> {
        let text = truncate_at_char_boundary(text, self.max_inspect_bytes);
        self.set.matches(text).iter().next()
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a
/// character.
fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
