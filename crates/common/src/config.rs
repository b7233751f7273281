use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::CheckKind;

/// Top-level decision engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ip_lists: IpListsConfig,
    #[serde(default)]
    pub active_blocks: ActiveBlocksConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub threat_intel: ThreatIntelConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub failure_policy: FailurePolicyConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpListsConfig {
    #[serde(default)]
    pub whitelist: Option<PathBuf>,
    #[serde(default)]
    pub blacklist: Option<PathBuf>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for IpListsConfig {
    fn default() -> Self {
        Self {
            whitelist: None,
            blacklist: None,
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveBlocksConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub ttl: BlockTtlConfig,
}

impl Default for ActiveBlocksConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            ttl: BlockTtlConfig::default(),
        }
    }
}

/// Active-block TTL, in seconds, applied when a given check blocks.
///
/// `active_block` defaults to 0 so that a request rejected because of an
/// existing block never pushes that block's expiry further out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTtlConfig {
    #[serde(default = "default_blacklist_ttl")]
    pub blacklist: u64,
    #[serde(default)]
    pub active_block: u64,
    #[serde(default = "default_rate_limit_ttl")]
    pub rate_limit: u64,
    #[serde(default = "default_geo_ttl")]
    pub geo: u64,
    #[serde(default = "default_signature_ttl")]
    pub signature: u64,
    #[serde(default = "default_anomaly_ttl")]
    pub anomaly: u64,
    #[serde(default = "default_threat_intel_ttl")]
    pub threat_intel: u64,
    #[serde(default = "default_rule_ttl")]
    pub rule: u64,
    /// Applied when a check fails closed. 0 blocks the request without
    /// recording an active block.
    #[serde(default)]
    pub failure: u64,
}

impl Default for BlockTtlConfig {
    fn default() -> Self {
        Self {
            blacklist: default_blacklist_ttl(),
            active_block: 0,
            rate_limit: default_rate_limit_ttl(),
            geo: default_geo_ttl(),
            signature: default_signature_ttl(),
            anomaly: default_anomaly_ttl(),
            threat_intel: default_threat_intel_ttl(),
            rule: default_rule_ttl(),
            failure: 0,
        }
    }
}

impl BlockTtlConfig {
    pub fn for_check(&self, kind: CheckKind) -> Duration {
        let secs = match kind {
            CheckKind::Blacklist => self.blacklist,
            CheckKind::ActiveBlock => self.active_block,
            CheckKind::RateLimit => self.rate_limit,
            CheckKind::Geo => self.geo,
            CheckKind::Signature => self.signature,
            CheckKind::Anomaly => self.anomaly,
            CheckKind::ThreatIntel => self.threat_intel,
            CheckKind::Rule => self.rule,
            CheckKind::Whitelist | CheckKind::Default | CheckKind::MalformedInput => 0,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_algorithm")]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    #[serde(default = "default_window")]
    pub default_window_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointLimitConfig>,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: default_rate_limit_algorithm(),
            default_limit: default_limit(),
            default_window_secs: default_window(),
            endpoints: vec![],
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl RateLimitConfig {
    /// Resolve the `(limit, window)` pair for a request path.
    ///
    /// The first endpoint entry whose prefix matches wins; otherwise the
    /// defaults apply.
    pub fn limit_for(&self, path: &str) -> (u64, Duration) {
        self.endpoints
            .iter()
            .find(|e| path.starts_with(&e.path_prefix))
            .map(|e| (e.limit, Duration::from_secs(e.window_secs)))
            .unwrap_or((
                self.default_limit,
                Duration::from_secs(self.default_window_secs),
            ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointLimitConfig {
    pub path_prefix: String,
    pub limit: u64,
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default = "default_geoip_mode")]
    pub mode: GeoIpMode,
    #[serde(default = "default_geoip_default_action")]
    pub default_action: GeoIpDefaultAction,
    /// How often the database file is reopened. 0 disables reloading.
    #[serde(default = "default_geoip_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: None,
            blocked_countries: vec![],
            allowed_countries: vec![],
            mode: GeoIpMode::Block,
            default_action: GeoIpDefaultAction::Allow,
            refresh_interval_secs: default_geoip_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoIpMode {
    Block,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoIpDefaultAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_inspect_bytes")]
    pub max_inspect_bytes: usize,
    #[serde(default)]
    pub disabled_categories: Vec<String>,
    #[serde(default)]
    pub custom: Vec<CustomSignatureConfig>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_inspect_bytes: default_max_inspect_bytes(),
            disabled_categories: vec![],
            custom: vec![],
        }
    }
}

/// An operator-supplied signature appended after the built-in set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSignatureConfig {
    pub id: String,
    pub category: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: f64,
    #[serde(default = "default_collaborator_timeout")]
    pub timeout_ms: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_anomaly_threshold(),
            timeout_ms: default_collaborator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIntelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_collaborator_timeout")]
    pub timeout_ms: u64,
}

impl Default for ThreatIntelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_collaborator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: None,
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// What the pipeline does when a check cannot produce a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Proceed to the next check as if this one passed.
    #[default]
    Open,
    /// Block the request.
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailurePolicyConfig {
    #[serde(default)]
    pub geo: FailurePolicy,
    #[serde(default)]
    pub signature: FailurePolicy,
    #[serde(default)]
    pub anomaly: FailurePolicy,
    #[serde(default)]
    pub threat_intel: FailurePolicy,
    #[serde(default)]
    pub rule: FailurePolicy,
}

impl FailurePolicyConfig {
    /// Policy for a check. Checks backed by engine-local storage are not
    /// configurable and always fail open.
    pub fn for_check(&self, kind: CheckKind) -> FailurePolicy {
        match kind {
            CheckKind::Geo => self.geo,
            CheckKind::Signature => self.signature,
            CheckKind::Anomaly => self.anomaly,
            CheckKind::ThreatIntel => self.threat_intel,
            CheckKind::Rule => self.rule,
            _ => FailurePolicy::Open,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}
fn default_refresh_interval() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_blacklist_ttl() -> u64 {
    300
}
fn default_rate_limit_ttl() -> u64 {
    60
}
fn default_geo_ttl() -> u64 {
    3600
}
fn default_signature_ttl() -> u64 {
    900
}
fn default_anomaly_ttl() -> u64 {
    300
}
fn default_threat_intel_ttl() -> u64 {
    3600
}
fn default_rule_ttl() -> u64 {
    600
}
fn default_rate_limit_algorithm() -> RateLimitAlgorithm {
    RateLimitAlgorithm::FixedWindow
}
fn default_limit() -> u64 {
    100
}
fn default_window() -> u64 {
    60
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_geoip_mode() -> GeoIpMode {
    GeoIpMode::Block
}
fn default_geoip_default_action() -> GeoIpDefaultAction {
    GeoIpDefaultAction::Allow
}
fn default_geoip_refresh_interval() -> u64 {
    3600
}
fn default_max_inspect_bytes() -> usize {
    16 * 1024
}
fn default_anomaly_threshold() -> f64 {
    0.8
}
fn default_collaborator_timeout() -> u64 {
    50
}
fn default_queue_capacity() -> usize {
    1024
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.default_limit == 0 || self.rate_limit.default_window_secs == 0 {
            anyhow::bail!("rate_limit.default_limit and default_window_secs must be positive");
        }

        for endpoint in &self.rate_limit.endpoints {
            if !endpoint.path_prefix.starts_with('/') {
                anyhow::bail!(
                    "rate_limit endpoint prefix '{}' must start with '/'",
                    endpoint.path_prefix
                );
            }
            if endpoint.limit == 0 || endpoint.window_secs == 0 {
                anyhow::bail!(
                    "rate_limit endpoint '{}' needs a positive limit and window",
                    endpoint.path_prefix
                );
            }
        }

        if !(0.0..=1.0).contains(&self.anomaly.threshold) {
            anyhow::bail!(
                "anomaly.threshold must be within [0, 1], got {}",
                self.anomaly.threshold
            );
        }

        if self.anomaly.timeout_ms == 0 || self.threat_intel.timeout_ms == 0 {
            anyhow::bail!("collaborator timeouts must be positive");
        }

        if self.signatures.max_inspect_bytes == 0 {
            anyhow::bail!("signatures.max_inspect_bytes must be positive");
        }

        if self.events.queue_capacity == 0 {
            anyhow::bail!("events.queue_capacity must be positive");
        }

        if self.active_blocks.sweep_interval_secs == 0 {
            anyhow::bail!("active_blocks.sweep_interval_secs must be positive");
        }

        if self.ip_lists.refresh_interval_secs == 0 || self.rules.refresh_interval_secs == 0 {
            anyhow::bail!("refresh intervals must be positive");
        }

        if !self.geoip.allowed_countries.is_empty() && !self.geoip.blocked_countries.is_empty() {
            tracing::warn!("geoip.allowed_countries is set; blocked_countries will be ignored");
        }

        Ok(())
    }
}
