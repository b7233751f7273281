//! Ordered evaluation of checks for a single request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blockgate_active_blocks::{BlockOutcome, BlockRequest};
use blockgate_common::{
    BlockTtlConfig, CheckKind, Decision, FailurePolicy, FailurePolicyConfig, RequestRecord,
};
use blockgate_events::{BlockEventKind, EngineEvent, EventPublisher};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::check::{Check, CheckContext, CheckError, Verdict};
use crate::metrics::EngineMetrics;
use crate::store::BlockStore;

/// Runs checks in order until one is decisive.
///
/// Never fails: check errors are resolved by policy and the caller always
/// gets a [`Decision`].
pub struct DecisionPipeline {
    checks: Vec<Arc<dyn Check>>,
    blocks: Arc<dyn BlockStore>,
    publisher: EventPublisher,
    metrics: Arc<EngineMetrics>,
    policies: FailurePolicyConfig,
    ttls: BlockTtlConfig,
}

impl DecisionPipeline {
    pub fn new(
        checks: Vec<Arc<dyn Check>>,
        blocks: Arc<dyn BlockStore>,
        publisher: EventPublisher,
        metrics: Arc<EngineMetrics>,
        policies: FailurePolicyConfig,
        ttls: BlockTtlConfig,
    ) -> Self {
        debug!(
            checks = ?checks.iter().map(|c| c.kind()).collect::<Vec<_>>(),
            "decision pipeline assembled"
        );
        Self {
            checks,
            blocks,
            publisher,
            metrics,
            policies,
            ttls,
        }
    }

    /// Check kinds in evaluation order.
    pub fn order(&self) -> Vec<CheckKind> {
        self.checks.iter().map(|c| c.kind()).collect()
    }

    pub async fn evaluate(&self, request: &RequestRecord) -> Decision {
        let started = Instant::now();
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let ip = match request.validate() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(request_id = %request_id, source_ip = %request.source_ip, error = %e, "rejecting malformed request");
                let decision = Decision::block(request_id, CheckKind::MalformedInput, None, e.to_string());
                return self.finish(Some(&request.source_ip), decision, started);
            }
        };

        let ctx = CheckContext {
            request,
            ip,
            now: Utc::now(),
        };

        for check in &self.checks {
            let kind = check.kind();
            let verdict = match check.evaluate(&ctx).await {
                Ok(verdict) => verdict,
                Err(e) => match self.resolve_failure(kind, &ctx, &e) {
                    FailurePolicy::Open => continue,
                    FailurePolicy::Closed => {
                        let reason = format!("{} check failed closed: {}", kind, e);
                        let ttl = Duration::from_secs(self.ttls.failure);
                        self.record_block(&ctx, kind, &reason, None, ttl);
                        let decision = Decision::block(request_id, kind, None, reason);
                        return self.finish(Some(&request.source_ip), decision, started);
                    }
                },
            };

            match verdict {
                Verdict::Proceed => continue,
                Verdict::Allow { reason, rule_id } => {
                    debug!(request_id = %request_id, client_ip = %ip, check = %kind, "request allowed");
                    let decision = Decision::allow(request_id, kind, reason).with_rule_id(rule_id);
                    return self.finish(Some(&request.source_ip), decision, started);
                }
                Verdict::Block { reason, rule_id } => {
                    info!(
                        request_id = %request_id,
                        client_ip = %ip,
                        check = %kind,
                        rule_id = ?rule_id,
                        reason = %reason,
                        "request blocked"
                    );
                    let ttl = self.ttls.for_check(kind);
                    self.record_block(&ctx, kind, &reason, rule_id.as_deref(), ttl);
                    let decision = Decision::block(request_id, kind, rule_id, reason);
                    return self.finish(Some(&request.source_ip), decision, started);
                }
            }
        }

        let decision = Decision::allow(request_id, CheckKind::Default, "no check matched");
        self.finish(Some(&request.source_ip), decision, started)
    }

    /// Block input that never became a [`RequestRecord`], such as a line that
    /// is not valid JSON. Counted and published like any other decision.
    pub fn reject_malformed(&self, reason: impl Into<String>) -> Decision {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let reason = reason.into();
        warn!(request_id = %request_id, error = %reason, "rejecting unparseable request record");
        let decision = Decision::block(request_id, CheckKind::MalformedInput, None, reason);
        self.finish(None, decision, started)
    }

    /// Log and count a failed check, returning the policy to apply. Storage
    /// failures always fail open.
    fn resolve_failure(&self, kind: CheckKind, ctx: &CheckContext<'_>, err: &CheckError) -> FailurePolicy {
        self.metrics
            .check_failures
            .with_label_values(&[kind.as_str(), err.label()])
            .inc();

        if let CheckError::StorageUnavailable(_) = err {
            self.metrics.storage_alerts.inc();
            error!(client_ip = %ctx.ip, check = %kind, error = %err, "storage unavailable, failing open");
            return FailurePolicy::Open;
        }

        let policy = self.policies.for_check(kind);
        warn!(client_ip = %ctx.ip, check = %kind, error = %err, policy = ?policy, "check failed");
        policy
    }

    /// Create or extend the active block for the client and publish the
    /// lifecycle change. A zero `ttl` records nothing.
    fn record_block(
        &self,
        ctx: &CheckContext<'_>,
        kind: CheckKind,
        reason: &str,
        rule_id: Option<&str>,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            return;
        }

        let request = BlockRequest {
            reason,
            matched_check: kind,
            rule_id,
            ttl,
        };
        match self.blocks.create_or_extend(ctx.ip, request, ctx.now) {
            Ok(BlockOutcome::Created(entry)) => self.publish_block(BlockEventKind::Created, entry),
            Ok(BlockOutcome::Extended(entry)) => self.publish_block(BlockEventKind::Extended, entry),
            Ok(BlockOutcome::Unchanged(_)) => {}
            Err(e) => {
                self.metrics.storage_alerts.inc();
                error!(client_ip = %ctx.ip, check = %kind, error = %e, "failed to record active block");
            }
        }
    }

    fn publish_block(&self, kind: BlockEventKind, entry: blockgate_active_blocks::BlockEntry) {
        self.metrics
            .block_events
            .with_label_values(&[block_event_label(kind)])
            .inc();
        self.publisher.publish(EngineEvent::Block { kind, entry });
    }

    fn finish(&self, client_ip: Option<&str>, decision: Decision, started: Instant) -> Decision {
        self.metrics.record_decision(
            decision.action(),
            decision.matched_check(),
            started.elapsed().as_secs_f64(),
        );
        self.publisher.publish(EngineEvent::Decision {
            client_ip: client_ip.map(str::to_string),
            decision: decision.clone(),
        });
        decision
    }
}

pub(crate) fn block_event_label(kind: BlockEventKind) -> &'static str {
    match kind {
        BlockEventKind::Created => "created",
        BlockEventKind::Extended => "extended",
        BlockEventKind::Expired => "expired",
        BlockEventKind::Unblocked => "unblocked",
    }
}
