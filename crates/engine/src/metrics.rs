use blockgate_common::{Action, CheckKind};
use blockgate_events::PublisherCounters;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the decision engine.
pub struct EngineMetrics {
    pub registry: Registry,
    pub decisions_total: IntCounterVec,
    pub decision_duration: HistogramVec,
    pub check_failures: IntCounterVec,
    pub storage_alerts: IntCounter,
    pub rule_flags: IntCounterVec,
    pub active_blocks: IntGauge,
    pub block_events: IntCounterVec,
    pub events: PublisherCounters,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("blockgate_decisions_total", "Decisions by action and deciding check"),
            &["action", "check"],
        )?;
        let decision_duration = HistogramVec::new(
            HistogramOpts::new(
                "blockgate_decision_duration_seconds",
                "Time to reach a decision",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
            &["action"],
        )?;
        let check_failures = IntCounterVec::new(
            Opts::new("blockgate_check_failures_total", "Checks that failed to produce a verdict"),
            &["check", "error"],
        )?;
        let storage_alerts = IntCounter::new(
            "blockgate_storage_alerts_total",
            "Block store operations that failed",
        )?;
        let rule_flags = IntCounterVec::new(
            Opts::new("blockgate_rule_flags_total", "Requests flagged by rules"),
            &["rule_id"],
        )?;
        let active_blocks = IntGauge::new(
            "blockgate_active_blocks",
            "Active blocks after the last sweep",
        )?;
        let block_events = IntCounterVec::new(
            Opts::new("blockgate_block_events_total", "Active block lifecycle changes"),
            &["kind"],
        )?;
        let events = PublisherCounters::new()?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(check_failures.clone()))?;
        registry.register(Box::new(storage_alerts.clone()))?;
        registry.register(Box::new(rule_flags.clone()))?;
        registry.register(Box::new(active_blocks.clone()))?;
        registry.register(Box::new(block_events.clone()))?;
        events.register(&registry)?;

        Ok(Self {
            registry,
            decisions_total,
            decision_duration,
            check_failures,
            storage_alerts,
            rule_flags,
            active_blocks,
            block_events,
            events,
        })
    }

    pub fn record_decision(&self, action: Action, check: CheckKind, seconds: f64) {
        let action = action_label(action);
        self.decisions_total
            .with_label_values(&[action, check.as_str()])
            .inc();
        self.decision_duration
            .with_label_values(&[action])
            .observe(seconds);
    }

    pub fn decisions(&self, action: Action, check: CheckKind) -> u64 {
        self.decisions_total
            .with_label_values(&[action_label(action), check.as_str()])
            .get()
    }

    /// Failures for `check` across all error kinds.
    pub fn failures(&self, check: CheckKind) -> u64 {
        ["unavailable", "timeout", "storage"]
            .iter()
            .map(|error| {
                self.check_failures
                    .with_label_values(&[check.as_str(), error])
                    .get()
            })
            .sum()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Allow => "allow",
        Action::Block => "block",
    }
}
