use std::sync::Arc;

use async_trait::async_trait;
use blockgate_common::CheckKind;
use blockgate_geoip::{GeoIpAction, GeoIpFilter};
use blockgate_rules::{RuleEngine, RuleVerdict};
use blockgate_signatures::SignatureMatcher;
use tracing::info;

use crate::check::{Check, CheckContext, CheckError, Verdict};
use crate::metrics::EngineMetrics;

pub struct GeoCheck {
    filter: GeoIpFilter,
}

impl GeoCheck {
    pub fn new(filter: GeoIpFilter) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl Check for GeoCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Geo
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        match self.filter.check(ctx.ip).map_err(CheckError::collaborator)? {
            GeoIpAction::Block { country } => {
                Ok(Verdict::block(format!("requests from country {} are blocked", country)))
            }
            GeoIpAction::Detect { country } => {
                info!(client_ip = %ctx.ip, country = %country, "geo policy violation (detect mode)");
                Ok(Verdict::Proceed)
            }
            GeoIpAction::Allow | GeoIpAction::Unknown => Ok(Verdict::Proceed),
        }
    }
}

pub struct SignatureCheck {
    matcher: SignatureMatcher,
}

impl SignatureCheck {
    pub fn new(matcher: SignatureMatcher) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl Check for SignatureCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Signature
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        Ok(match self.matcher.match_request(ctx.request) {
            Some(found) => Verdict::Block {
                reason: format!(
                    "{} signature {} matched in {:?}: {}",
                    found.category, found.id, found.target, found.description
                ),
                rule_id: Some(found.id),
            },
            None => Verdict::Proceed,
        })
    }
}

pub struct RuleCheck {
    rules: Arc<RuleEngine>,
    metrics: Arc<EngineMetrics>,
}

impl RuleCheck {
    pub fn new(rules: Arc<RuleEngine>, metrics: Arc<EngineMetrics>) -> Self {
        Self { rules, metrics }
    }
}

#[async_trait]
impl Check for RuleCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Rule
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        let outcome = self.rules.evaluate(ctx.request, ctx.ip);

        for rule_id in &outcome.flagged {
            info!(client_ip = %ctx.ip, rule_id = %rule_id, "request flagged by rule");
            self.metrics.rule_flags.with_label_values(&[rule_id.as_str()]).inc();
        }

        Ok(match outcome.verdict {
            RuleVerdict::Block { rule_id, name } => Verdict::Block {
                reason: format!("blocked by rule {}", name),
                rule_id: Some(rule_id),
            },
            RuleVerdict::Allow { rule_id } => Verdict::Allow {
                reason: "allowed by rule".to_string(),
                rule_id: Some(rule_id),
            },
            RuleVerdict::NoMatch => Verdict::Proceed,
        })
    }
}
