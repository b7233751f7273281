//! External services consulted by the pipeline.
//!
//! Both are async and may be slow or down; the pipeline wraps every call in
//! a timeout and applies the configured failure policy.

use std::net::IpAddr;

use async_trait::async_trait;
use blockgate_common::RequestRecord;

pub use blockgate_geoip::GeoResolver;

/// Scores how unusual a request looks, from 0.0 (normal) to 1.0.
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    async fn score(&self, request: &RequestRecord, ip: IpAddr) -> anyhow::Result<f64>;
}

/// Reputation lookup against a threat-intelligence feed.
///
/// Returns a reason when the address is known to be malicious.
#[async_trait]
pub trait ThreatIntel: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> anyhow::Result<Option<String>>;
}
