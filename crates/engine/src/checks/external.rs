use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockgate_common::CheckKind;
use tokio::time::timeout;

use crate::check::{Check, CheckContext, CheckError, Verdict};
use crate::collaborators::{AnomalyScorer, ThreatIntel};

/// Blocks when the anomaly score is strictly above the threshold.
pub struct AnomalyCheck {
    scorer: Arc<dyn AnomalyScorer>,
    threshold: f64,
    timeout: Duration,
}

impl AnomalyCheck {
    pub fn new(scorer: Arc<dyn AnomalyScorer>, threshold: f64, timeout: Duration) -> Self {
        Self {
            scorer,
            threshold,
            timeout,
        }
    }
}

#[async_trait]
impl Check for AnomalyCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Anomaly
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        let score = timeout(self.timeout, self.scorer.score(ctx.request, ctx.ip))
            .await
            .map_err(|_| CheckError::Timeout(self.timeout))?
            .map_err(CheckError::collaborator)?;

        if score.is_nan() {
            return Err(CheckError::CollaboratorUnavailable(
                "anomaly scorer returned NaN".into(),
            ));
        }

        if score > self.threshold {
            Ok(Verdict::block(format!(
                "anomaly score {:.2} exceeds threshold {:.2}",
                score, self.threshold
            )))
        } else {
            Ok(Verdict::Proceed)
        }
    }
}

pub struct ThreatIntelCheck {
    intel: Arc<dyn ThreatIntel>,
    timeout: Duration,
}

impl ThreatIntelCheck {
    pub fn new(intel: Arc<dyn ThreatIntel>, timeout: Duration) -> Self {
        Self { intel, timeout }
    }
}

#[async_trait]
impl Check for ThreatIntelCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::ThreatIntel
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        let listed = timeout(self.timeout, self.intel.lookup(ctx.ip))
            .await
            .map_err(|_| CheckError::Timeout(self.timeout))?
            .map_err(CheckError::collaborator)?;

        Ok(match listed {
            Some(reason) => Verdict::block(format!("threat intelligence: {}", reason)),
            None => Verdict::Proceed,
        })
    }
}
