use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BlockgateError, BlockgateResult};

/// Identifies which stage of the decision pipeline produced a result.
///
/// Serialized in snake_case (`rate_limit`, `threat_intel`, ...) so the values
/// double as metric labels and as the `matched_check` field of published
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Whitelist,
    Blacklist,
    ActiveBlock,
    RateLimit,
    Geo,
    Signature,
    Anomaly,
    ThreatIntel,
    Rule,
    Default,
    MalformedInput,
}

impl CheckKind {
    pub const ALL: [CheckKind; 11] = [
        CheckKind::Whitelist,
        CheckKind::Blacklist,
        CheckKind::ActiveBlock,
        CheckKind::RateLimit,
        CheckKind::Geo,
        CheckKind::Signature,
        CheckKind::Anomaly,
        CheckKind::ThreatIntel,
        CheckKind::Rule,
        CheckKind::Default,
        CheckKind::MalformedInput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Whitelist => "whitelist",
            CheckKind::Blacklist => "blacklist",
            CheckKind::ActiveBlock => "active_block",
            CheckKind::RateLimit => "rate_limit",
            CheckKind::Geo => "geo",
            CheckKind::Signature => "signature",
            CheckKind::Anomaly => "anomaly",
            CheckKind::ThreatIntel => "threat_intel",
            CheckKind::Rule => "rule",
            CheckKind::Default => "default",
            CheckKind::MalformedInput => "malformed_input",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which IP list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Whitelist => f.write_str("whitelist"),
            ListKind::Blacklist => f.write_str("blacklist"),
        }
    }
}

/// A normalized inbound request as produced by the traffic-ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default)]
    pub request_id: Option<String>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    pub source_ip: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl RequestRecord {
    pub fn new(method: &str, url: &str, source_ip: &str) -> Self {
        Self {
            request_id: None,
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            source_ip: source_ip.to_string(),
            timestamp: Utc::now(),
            api_key: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// Path component of the URL, without the query string or fragment.
    pub fn path(&self) -> &str {
        let end = self.url.find(['?', '#']).unwrap_or(self.url.len());
        &self.url[..end]
    }

    /// Raw (still percent-encoded) query string, if any.
    pub fn query(&self) -> Option<&str> {
        let start = self.url.find('?')? + 1;
        let rest = &self.url[start..];
        let end = rest.find('#').unwrap_or(rest.len());
        Some(&rest[..end])
    }

    /// Query parameters with percent-decoding applied.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match self.query() {
            Some(q) => url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Case-insensitive header lookup returning the first value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse and sanity-check the record before it enters the pipeline.
    ///
    /// Returns the parsed source address. A record that fails here cannot be
    /// evaluated safely and is rejected by the caller.
    pub fn validate(&self) -> BlockgateResult<IpAddr> {
        if self.method.trim().is_empty() {
            return Err(BlockgateError::MalformedRequest("empty method".into()));
        }
        if !self.url.starts_with('/') {
            return Err(BlockgateError::MalformedRequest(format!(
                "url must be origin-form, got {:?}",
                self.url
            )));
        }
        self.source_ip.trim().parse::<IpAddr>().map_err(|e| {
            BlockgateError::MalformedRequest(format!(
                "unparseable source ip {:?}: {}",
                self.source_ip, e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
}

/// The outcome of evaluating one request.
///
/// Fields are private; a decision is built once by the pipeline and only read
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    request_id: String,
    action: Action,
    matched_check: CheckKind,
    rule_id: Option<String>,
    reason: String,
    timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn allow(request_id: String, matched_check: CheckKind, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            action: Action::Allow,
            matched_check,
            rule_id: None,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn block(
        request_id: String,
        matched_check: CheckKind,
        rule_id: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            action: Action::Block,
            matched_check,
            rule_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the id of the rule that allowed the request.
    pub fn with_rule_id(mut self, rule_id: Option<String>) -> Self {
        self.rule_id = rule_id;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_blocked(&self) -> bool {
        self.action == Action::Block
    }

    pub fn matched_check(&self) -> CheckKind {
        self.matched_check
    }

    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_split() {
        let req = RequestRecord::new("GET", "/search?q=a%20b&x=1#frag", "10.0.0.1");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), Some("q=a%20b&x=1"));
        assert_eq!(
            req.query_pairs(),
            vec![("q".to_string(), "a b".to_string()), ("x".to_string(), "1".to_string())]
        );

        let bare = RequestRecord::new("GET", "/health", "10.0.0.1");
        assert_eq!(bare.path(), "/health");
        assert_eq!(bare.query(), None);
        assert!(bare.query_pairs().is_empty());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = RequestRecord::new("GET", "/", "10.0.0.1").with_header("User-Agent", "curl/8.0");
        assert_eq!(req.header("user-agent"), Some("curl/8.0"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn validate_rejects_malformed_records() {
        assert!(RequestRecord::new("GET", "/", "not-an-ip").validate().is_err());
        assert!(RequestRecord::new("", "/", "10.0.0.1").validate().is_err());
        assert!(RequestRecord::new("GET", "http://x/", "10.0.0.1").validate().is_err());

        let addr = RequestRecord::new("GET", "/", " 2001:db8::1 ").validate().unwrap();
        assert_eq!(addr, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn check_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&CheckKind::RateLimit).unwrap(), "\"rate_limit\"");
        for kind in CheckKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.as_str());
        }
    }

    #[test]
    fn decision_accessors() {
        let d = Decision::block("r1".into(), CheckKind::Rule, Some("rule-7".into()), "matched");
        assert!(d.is_blocked());
        assert_eq!(d.matched_check(), CheckKind::Rule);
        assert_eq!(d.rule_id(), Some("rule-7"));
        assert_eq!(d.reason(), "matched");
    }
}
