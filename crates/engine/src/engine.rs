//! The assembled engine: pipeline, shared state, background tasks and the
//! administrative surface.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockgate_active_blocks::{ActiveBlockStore, BlockEntry};
use blockgate_common::{
    Action, BlockgateResult, CheckKind, Decision, EngineConfig, ListKind, RequestRecord,
};
use blockgate_events::{BlockEventKind, EngineEvent, EventPublisher, EventSink, LogSink};
use blockgate_geoip::{GeoIpFilter, GeoResolver, MaxMindResolver};
use blockgate_ip_lists::{IpListStore, ListEntry};
use blockgate_rate_limit::RateLimiter;
use blockgate_rules::RuleEngine;
use blockgate_signatures::SignatureMatcher;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::check::Check;
use crate::checks::{
    ActiveBlockCheck, AnomalyCheck, BlacklistCheck, GeoCheck, RateLimitCheck, RuleCheck,
    SignatureCheck, ThreatIntelCheck, WhitelistCheck,
};
use crate::collaborators::{AnomalyScorer, ThreatIntel};
use crate::metrics::EngineMetrics;
use crate::pipeline::{block_event_label, DecisionPipeline};
use crate::repository::{FileListRepository, FileRuleRepository, ListRepository, RuleRepository};
use crate::store::BlockStore;
use crate::tasks;

/// State shared between the engine handle and its background tasks.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub lists: Arc<IpListStore>,
    pub blocks: Arc<dyn BlockStore>,
    pub limiter: RateLimiter,
    pub rules: Arc<RuleEngine>,
    pub metrics: Arc<EngineMetrics>,
    pub publisher: EventPublisher,
    pub rule_repository: Option<Arc<dyn RuleRepository>>,
    pub list_repository: Option<Arc<dyn ListRepository>>,
    /// MaxMind resolver reopened on a timer, with the file it reads.
    pub geo_reload: Option<(Arc<MaxMindResolver>, PathBuf)>,
}

impl Shared {
    pub async fn refresh_rules(&self) -> anyhow::Result<Option<usize>> {
        let Some(ref repo) = self.rule_repository else {
            return Ok(None);
        };
        let rules = repo.fetch_rules().await?;
        Ok(Some(self.rules.replace(rules)))
    }

    pub async fn refresh_lists(&self) -> anyhow::Result<(Option<usize>, Option<usize>)> {
        let Some(ref repo) = self.list_repository else {
            return Ok((None, None));
        };
        let mut counts = [None, None];
        for (slot, kind) in counts.iter_mut().zip([ListKind::Whitelist, ListKind::Blacklist]) {
            if let Some(entries) = repo.fetch_list(kind).await? {
                *slot = Some(self.lists.replace_snapshot(kind, entries));
            }
        }
        Ok((counts[0], counts[1]))
    }
}

/// Counts reported by [`BlockingEngine::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub allowed: u64,
    pub blocked: u64,
    /// Decisions per deciding check, both actions combined.
    pub by_check: BTreeMap<String, u64>,
    pub check_failures: BTreeMap<String, u64>,
    pub dropped_events: u64,
    pub failed_events: u64,
    pub storage_alerts: u64,
    pub active_blocks: usize,
    pub whitelist_size: usize,
    pub blacklist_size: usize,
    pub rules: usize,
}

/// What [`BlockingEngine::refresh_now`] reloaded. `None` means the source is
/// not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub rules: Option<usize>,
    pub whitelist: Option<usize>,
    pub blacklist: Option<usize>,
}

/// Wires collaborators into a [`BlockingEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    geo_resolver: Option<Arc<dyn GeoResolver>>,
    anomaly_scorer: Option<Arc<dyn AnomalyScorer>>,
    threat_intel: Option<Arc<dyn ThreatIntel>>,
    rule_repository: Option<Arc<dyn RuleRepository>>,
    list_repository: Option<Arc<dyn ListRepository>>,
    event_sink: Option<Arc<dyn EventSink>>,
    block_store: Option<Arc<dyn BlockStore>>,
    extra_checks: Vec<Arc<dyn Check>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            geo_resolver: None,
            anomaly_scorer: None,
            threat_intel: None,
            rule_repository: None,
            list_repository: None,
            event_sink: None,
            block_store: None,
            extra_checks: Vec::new(),
        }
    }

    pub fn geo_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo_resolver = Some(resolver);
        self
    }

    pub fn anomaly_scorer(mut self, scorer: Arc<dyn AnomalyScorer>) -> Self {
        self.anomaly_scorer = Some(scorer);
        self
    }

    pub fn threat_intel(mut self, intel: Arc<dyn ThreatIntel>) -> Self {
        self.threat_intel = Some(intel);
        self
    }

    pub fn rule_repository(mut self, repo: Arc<dyn RuleRepository>) -> Self {
        self.rule_repository = Some(repo);
        self
    }

    pub fn list_repository(mut self, repo: Arc<dyn ListRepository>) -> Self {
        self.list_repository = Some(repo);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn block_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.block_store = Some(store);
        self
    }

    /// Append a check after the rule engine, before the default allow.
    pub fn check(mut self, check: Arc<dyn Check>) -> Self {
        self.extra_checks.push(check);
        self
    }

    /// Assemble the engine, load the initial rules and lists, and start the
    /// background tasks. Must be called inside a Tokio runtime.
    pub async fn build(self) -> anyhow::Result<BlockingEngine> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new()?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink = self.event_sink.unwrap_or_else(|| Arc::new(LogSink));
        let (publisher, drain_handle) = EventPublisher::spawn(
            sink,
            config.events.queue_capacity,
            metrics.events.clone(),
            shutdown_rx.clone(),
        );

        let lists = Arc::new(IpListStore::new());
        let blocks = self
            .block_store
            .unwrap_or_else(|| Arc::new(ActiveBlockStore::new()));
        let limiter = RateLimiter::new(config.rate_limit.algorithm);
        let rules = Arc::new(RuleEngine::new());

        let rule_repository = self.rule_repository.or_else(|| {
            config
                .rules
                .path
                .clone()
                .map(|path| Arc::new(FileRuleRepository::new(path)) as Arc<dyn RuleRepository>)
        });
        let list_repository = self.list_repository.or_else(|| {
            FileListRepository::from_config(&config.ip_lists)
                .map(|repo| Arc::new(repo) as Arc<dyn ListRepository>)
        });

        let mut checks: Vec<Arc<dyn Check>> = vec![
            Arc::new(WhitelistCheck::new(lists.clone())),
            Arc::new(BlacklistCheck::new(lists.clone())),
            Arc::new(ActiveBlockCheck::new(blocks.clone())),
        ];

        if config.rate_limit.enabled {
            checks.push(Arc::new(RateLimitCheck::new(
                limiter.clone(),
                config.rate_limit.clone(),
            )));
        }

        let mut geo_reload = None;
        if config.geoip.enabled {
            let filter = match self.geo_resolver {
                Some(resolver) => GeoIpFilter::new(resolver, config.geoip.clone()),
                None => {
                    let resolver = Arc::new(MaxMindResolver::from_config(&config.geoip)?);
                    if let Some(ref path) = config.geoip.database_path {
                        if config.geoip.refresh_interval_secs > 0 {
                            geo_reload = Some((resolver.clone(), path.clone()));
                        }
                    }
                    GeoIpFilter::new(resolver, config.geoip.clone())
                }
            };
            checks.push(Arc::new(GeoCheck::new(filter)));
        }

        if config.signatures.enabled {
            let matcher = SignatureMatcher::new(&config.signatures)?;
            checks.push(Arc::new(SignatureCheck::new(matcher)));
        }

        match (config.anomaly.enabled, self.anomaly_scorer) {
            (true, Some(scorer)) => checks.push(Arc::new(AnomalyCheck::new(
                scorer,
                config.anomaly.threshold,
                Duration::from_millis(config.anomaly.timeout_ms),
            ))),
            (true, None) => info!("no anomaly scorer configured, skipping anomaly check"),
            (false, _) => {}
        }

        match (config.threat_intel.enabled, self.threat_intel) {
            (true, Some(intel)) => checks.push(Arc::new(ThreatIntelCheck::new(
                intel,
                Duration::from_millis(config.threat_intel.timeout_ms),
            ))),
            (true, None) => info!("no threat intelligence feed configured, skipping check"),
            (false, _) => {}
        }

        checks.push(Arc::new(RuleCheck::new(rules.clone(), metrics.clone())));
        checks.extend(self.extra_checks);

        let pipeline = DecisionPipeline::new(
            checks,
            blocks.clone(),
            publisher.clone(),
            metrics.clone(),
            config.failure_policy.clone(),
            config.active_blocks.ttl.clone(),
        );

        let shared = Arc::new(Shared {
            config,
            lists,
            blocks,
            limiter,
            rules,
            metrics,
            publisher,
            rule_repository,
            list_repository,
            geo_reload,
        });

        if let Err(e) = shared.refresh_rules().await {
            warn!(error = %e, "initial rule load failed, starting with no rules");
        }
        if let Err(e) = shared.refresh_lists().await {
            warn!(error = %e, "initial list load failed, starting with empty lists");
        }

        let mut handles = tasks::spawn_all(shared.clone(), shutdown_rx);
        handles.push(drain_handle);

        info!(checks = ?pipeline.order(), "blocking engine started");

        Ok(BlockingEngine {
            shared,
            pipeline,
            shutdown_tx,
            tasks: handles,
        })
    }
}

/// Real-time allow/block decision engine.
pub struct BlockingEngine {
    shared: Arc<Shared>,
    pipeline: DecisionPipeline,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BlockingEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build an engine from configuration alone, using file-backed
    /// repositories and a log sink.
    pub async fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        EngineBuilder::new(config).build().await
    }

    pub async fn evaluate(&self, request: &RequestRecord) -> Decision {
        self.pipeline.evaluate(request).await
    }

    /// Block input that could not be decoded into a [`RequestRecord`].
    pub fn reject_malformed(&self, reason: impl Into<String>) -> Decision {
        self.pipeline.reject_malformed(reason)
    }

    /// Check kinds in evaluation order.
    pub fn check_order(&self) -> Vec<CheckKind> {
        self.pipeline.order()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Lift the active block on `ip`, if any.
    pub fn unblock(&self, ip: IpAddr) -> BlockgateResult<Option<BlockEntry>> {
        let removed = self.shared.blocks.unblock(ip)?;
        if let Some(ref entry) = removed {
            info!(ip = %ip, "active block lifted by operator");
            self.shared
                .metrics
                .block_events
                .with_label_values(&[block_event_label(BlockEventKind::Unblocked)])
                .inc();
            self.shared.publisher.publish(EngineEvent::Block {
                kind: BlockEventKind::Unblocked,
                entry: entry.clone(),
            });
        }
        Ok(removed)
    }

    pub fn add_whitelist(&self, ip: IpAddr, reason: &str, ttl: Option<Duration>) -> ListEntry {
        self.shared.lists.add_whitelist(ip, reason, ttl)
    }

    pub fn add_blacklist(&self, ip: IpAddr, reason: &str, ttl: Option<Duration>) -> ListEntry {
        self.shared.lists.add_blacklist(ip, reason, ttl)
    }

    pub fn remove_from_list(&self, ip: IpAddr, kind: ListKind) -> bool {
        self.shared.lists.remove(ip, kind)
    }

    pub fn list_entries(&self, kind: ListKind) -> Vec<ListEntry> {
        self.shared.lists.entries(kind)
    }

    pub fn list_active_blocks(&self) -> BlockgateResult<Vec<BlockEntry>> {
        let mut active = self.shared.blocks.list_active(Utc::now())?;
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    pub fn stats(&self) -> EngineStats {
        let metrics = &self.shared.metrics;
        let mut stats = EngineStats::default();

        for kind in CheckKind::ALL {
            let allowed = metrics.decisions(Action::Allow, kind);
            let blocked = metrics.decisions(Action::Block, kind);
            stats.allowed += allowed;
            stats.blocked += blocked;
            if allowed + blocked > 0 {
                stats.by_check.insert(kind.to_string(), allowed + blocked);
            }
            let failures = metrics.failures(kind);
            if failures > 0 {
                stats.check_failures.insert(kind.to_string(), failures);
            }
        }

        stats.dropped_events = metrics.events.dropped.get();
        stats.failed_events = metrics.events.failed.get();
        stats.storage_alerts = metrics.storage_alerts.get();
        stats.active_blocks = self
            .shared
            .blocks
            .list_active(Utc::now())
            .map(|active| active.len())
            .unwrap_or(0);
        stats.whitelist_size = self.shared.lists.len(ListKind::Whitelist);
        stats.blacklist_size = self.shared.lists.len(ListKind::Blacklist);
        stats.rules = self.shared.rules.len();
        stats
    }

    /// Prometheus text exposition.
    pub fn metrics_text(&self) -> String {
        self.shared.metrics.render()
    }

    /// Pull rules and lists from their repositories immediately.
    pub async fn refresh_now(&self) -> anyhow::Result<RefreshReport> {
        let rules = self.shared.refresh_rules().await?;
        let (whitelist, blacklist) = self.shared.refresh_lists().await?;
        Ok(RefreshReport {
            rules,
            whitelist,
            blacklist,
        })
    }

    /// Run one expiry sweep now instead of waiting for the timer.
    pub fn sweep_now(&self) {
        tasks::sweep(&self.shared);
    }

    /// Stop background tasks and flush queued events.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let handles = self.tasks;
        // Drop the pipeline's publisher handles so the drain can finish.
        drop(self.pipeline);
        drop(self.shared);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("blocking engine stopped");
    }
}
