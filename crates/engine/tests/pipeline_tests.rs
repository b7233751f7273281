mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use blockgate_common::{EndpointLimitConfig, FailurePolicy};
use blockgate_engine::{
    Action, BlockEventKind, BlockingEngine, CheckKind, EngineEvent, MemorySink, RequestRecord,
};
use blockgate_geoip::StaticResolver;
use blockgate_rules::{BlockingRule, Condition, ConditionValue, Field, Operator, Predicate, RuleAction, RuleType};

use common::*;

#[tokio::test]
async fn benign_request_is_allowed_by_default() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();
    let decision = engine.evaluate(&get("/api/items?page=2", "192.0.2.10")).await;
    assert_eq!(decision.action(), Action::Allow);
    assert_eq!(decision.matched_check(), CheckKind::Default);
    assert!(!decision.request_id().is_empty());
}

#[tokio::test]
async fn check_order_is_fixed() {
    let engine = BlockingEngine::builder(config())
        .anomaly_scorer(Arc::new(FixedScore(0.0)))
        .threat_intel(Arc::new(DownIntel))
        .geo_resolver(Arc::new(StaticResolver::new()))
        .build()
        .await
        .unwrap();
    let mut cfg = config();
    cfg.geoip.enabled = true;
    let with_geo = BlockingEngine::builder(cfg)
        .geo_resolver(Arc::new(StaticResolver::new()))
        .anomaly_scorer(Arc::new(FixedScore(0.0)))
        .threat_intel(Arc::new(DownIntel))
        .build()
        .await
        .unwrap();

    assert_eq!(
        with_geo.check_order(),
        vec![
            CheckKind::Whitelist,
            CheckKind::Blacklist,
            CheckKind::ActiveBlock,
            CheckKind::RateLimit,
            CheckKind::Geo,
            CheckKind::Signature,
            CheckKind::Anomaly,
            CheckKind::ThreatIntel,
            CheckKind::Rule,
        ]
    );
    assert!(!engine.check_order().contains(&CheckKind::Geo));
}

#[tokio::test]
async fn whitelist_wins_over_everything() {
    let mut cfg = config();
    cfg.rate_limit.default_limit = 1;
    let engine = BlockingEngine::builder(cfg)
        .anomaly_scorer(Arc::new(FixedScore(1.0)))
        .build()
        .await
        .unwrap();

    let addr = ip("192.0.2.50");
    engine.add_blacklist(addr, "abuse", None);
    engine.add_whitelist(addr, "office egress", None);

    for _ in 0..5 {
        let req = RequestRecord::new("POST", "/login", "192.0.2.50").with_body("x' OR '1'='1");
        let decision = engine.evaluate(&req).await;
        assert_eq!(decision.action(), Action::Allow);
        assert_eq!(decision.matched_check(), CheckKind::Whitelist);
    }
    assert!(engine.list_active_blocks().unwrap().is_empty());
}

#[tokio::test]
async fn blacklisted_ip_is_blocked() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();
    engine.add_blacklist(ip("198.51.100.99"), "credential stuffing", None);

    let decision = engine.evaluate(&get("/", "198.51.100.99")).await;
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::Blacklist);
    assert!(decision.reason().contains("credential stuffing"));

    let blocks = engine.list_active_blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].matched_check, CheckKind::Blacklist);

    // Other addresses are unaffected.
    let other = engine.evaluate(&get("/", "198.51.100.98")).await;
    assert_eq!(other.action(), Action::Allow);
}

#[tokio::test]
async fn expired_blacklist_entry_is_ignored() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();
    engine.add_blacklist(ip("198.51.100.42"), "temporary", Some(Duration::from_millis(50)));
    tokio::time::sleep(Duration::from_millis(120)).await;

    let decision = engine.evaluate(&get("/", "198.51.100.42")).await;
    assert_eq!(decision.action(), Action::Allow);
}

#[tokio::test]
async fn sql_injection_blocks_and_creates_active_block() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();

    let attack = RequestRecord::new("POST", "/login", "203.0.113.5").with_body("'; DROP TABLE users;--");
    let decision = engine.evaluate(&attack).await;
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::Signature);
    assert_eq!(decision.rule_id(), Some("sqli-001"));

    let blocks = engine.list_active_blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].ip, ip("203.0.113.5"));
    assert_eq!(blocks[0].matched_check, CheckKind::Signature);
    assert_eq!(
        (blocks[0].expires_at - blocks[0].created_at).num_seconds(),
        engine.config().active_blocks.ttl.signature as i64
    );

    // A clean follow-up from the same address is held by the active block.
    let follow_up = engine.evaluate(&get("/api/items", "203.0.113.5")).await;
    assert!(follow_up.is_blocked());
    assert_eq!(follow_up.matched_check(), CheckKind::ActiveBlock);
}

#[tokio::test]
async fn active_block_hits_do_not_extend_the_block() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();
    let attack = get("/search?q=%3Cscript%3Ealert(1)%3C/script%3E", "203.0.113.9");
    engine.evaluate(&attack).await;
    let before = engine.list_active_blocks().unwrap()[0].expires_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.evaluate(&get("/", "203.0.113.9")).await;
    let after = engine.list_active_blocks().unwrap()[0].expires_at;
    assert_eq!(before, after);
}

#[tokio::test]
async fn login_rate_limit_blocks_the_101st_request() {
    let mut cfg = config();
    cfg.rate_limit.endpoints = vec![EndpointLimitConfig {
        path_prefix: "/login".into(),
        limit: 100,
        window_secs: 60,
    }];
    let engine = BlockingEngine::builder(cfg).build().await.unwrap();

    for i in 0..100 {
        let decision = engine.evaluate(&get("/login", "198.51.100.7")).await;
        assert_eq!(decision.action(), Action::Allow, "request {} should pass", i + 1);
    }

    let decision = engine.evaluate(&get("/login", "198.51.100.7")).await;
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::RateLimit);

    // Another client has its own counter.
    let other = engine.evaluate(&get("/login", "198.51.100.8")).await;
    assert_eq!(other.action(), Action::Allow);
}

#[tokio::test]
async fn rate_limit_window_rolls_over() {
    let mut cfg = config();
    cfg.rate_limit.default_limit = 3;
    cfg.rate_limit.default_window_secs = 1;
    // No active block so rollover is observable.
    cfg.active_blocks.ttl.rate_limit = 0;
    let engine = BlockingEngine::builder(cfg).build().await.unwrap();

    for _ in 0..3 {
        assert_eq!(engine.evaluate(&get("/feed", "192.0.2.33")).await.action(), Action::Allow);
    }
    let limited = engine.evaluate(&get("/feed", "192.0.2.33")).await;
    assert_eq!(limited.matched_check(), CheckKind::RateLimit);
    assert!(engine.list_active_blocks().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let after = engine.evaluate(&get("/feed", "192.0.2.33")).await;
    assert_eq!(after.action(), Action::Allow);
}

#[tokio::test]
async fn api_keys_are_counted_separately() {
    let mut cfg = config();
    cfg.rate_limit.default_limit = 1;
    cfg.active_blocks.ttl.rate_limit = 0;
    let engine = BlockingEngine::builder(cfg).build().await.unwrap();

    let a = get("/v1/data", "192.0.2.60").with_api_key("key-a");
    let b = get("/v1/data", "192.0.2.60").with_api_key("key-b");
    assert_eq!(engine.evaluate(&a).await.action(), Action::Allow);
    assert_eq!(engine.evaluate(&b).await.action(), Action::Allow);
    assert!(engine.evaluate(&a).await.is_blocked());
}

#[tokio::test]
async fn geo_policy_blocks_listed_country() {
    let mut cfg = config();
    cfg.geoip.enabled = true;
    cfg.geoip.blocked_countries = vec!["CN".into()];
    let resolver = StaticResolver::new().with(ip("203.0.113.80"), "CN");
    let engine = BlockingEngine::builder(cfg)
        .geo_resolver(Arc::new(resolver))
        .build()
        .await
        .unwrap();

    let decision = engine.evaluate(&get("/", "203.0.113.80")).await;
    assert_eq!(decision.matched_check(), CheckKind::Geo);
    assert!(decision.is_blocked());

    let unknown = engine.evaluate(&get("/", "192.0.2.1")).await;
    assert_eq!(unknown.action(), Action::Allow);
}

#[tokio::test]
async fn geo_without_database_fails_open() {
    let mut cfg = config();
    cfg.geoip.enabled = true;
    cfg.geoip.blocked_countries = vec!["CN".into()];
    let engine = BlockingEngine::builder(cfg).build().await.unwrap();

    let decision = engine.evaluate(&get("/", "203.0.113.81")).await;
    assert_eq!(decision.action(), Action::Allow);
    assert_eq!(engine.stats().check_failures.get("geo"), Some(&1));
}

#[tokio::test]
async fn anomaly_score_above_threshold_blocks() {
    let engine = BlockingEngine::builder(config())
        .anomaly_scorer(Arc::new(FixedScore(0.95)))
        .build()
        .await
        .unwrap();
    let decision = engine.evaluate(&get("/", "192.0.2.70")).await;
    assert_eq!(decision.matched_check(), CheckKind::Anomaly);
    assert!(decision.is_blocked());

    // Exactly at the threshold is not "above".
    let at_threshold = BlockingEngine::builder(config())
        .anomaly_scorer(Arc::new(FixedScore(0.8)))
        .build()
        .await
        .unwrap();
    assert_eq!(at_threshold.evaluate(&get("/", "192.0.2.71")).await.action(), Action::Allow);
}

#[tokio::test]
async fn anomaly_timeout_fails_open() {
    let mut cfg = config();
    cfg.anomaly.timeout_ms = 20;
    let scorer = Arc::new(SlowScorer::new(Duration::from_millis(500)));
    let engine = BlockingEngine::builder(cfg)
        .anomaly_scorer(scorer.clone())
        .build()
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let decision = engine.evaluate(&get("/", "192.0.2.80")).await;
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(decision.action(), Action::Allow);
    assert_eq!(decision.matched_check(), CheckKind::Default);
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

    let stats = engine.stats();
    assert_eq!(stats.check_failures.get("anomaly"), Some(&1));
}

#[tokio::test]
async fn anomaly_timeout_fails_closed_when_configured() {
    let mut cfg = config();
    cfg.anomaly.timeout_ms = 20;
    cfg.failure_policy.anomaly = FailurePolicy::Closed;
    let engine = BlockingEngine::builder(cfg)
        .anomaly_scorer(Arc::new(SlowScorer::new(Duration::from_millis(500))))
        .build()
        .await
        .unwrap();

    let decision = engine.evaluate(&get("/", "192.0.2.81")).await;
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::Anomaly);
    // Default failure TTL is zero: no active block.
    assert!(engine.list_active_blocks().unwrap().is_empty());
}

#[tokio::test]
async fn fail_closed_records_active_block_with_failure_ttl() {
    let mut cfg = config();
    cfg.anomaly.timeout_ms = 20;
    cfg.failure_policy.anomaly = FailurePolicy::Closed;
    cfg.active_blocks.ttl.failure = 30;
    let engine = BlockingEngine::builder(cfg)
        .anomaly_scorer(Arc::new(SlowScorer::new(Duration::from_millis(500))))
        .build()
        .await
        .unwrap();

    let decision = engine.evaluate(&get("/", "192.0.2.82")).await;
    assert!(decision.is_blocked());

    let blocks = engine.list_active_blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].matched_check, CheckKind::Anomaly);
    assert_eq!((blocks[0].expires_at - blocks[0].created_at).num_seconds(), 30);

    // The follow-up is held by the active block before the scorer runs.
    let follow_up = engine.evaluate(&get("/", "192.0.2.82")).await;
    assert_eq!(follow_up.matched_check(), CheckKind::ActiveBlock);
}

#[tokio::test]
async fn threat_intel_hit_blocks_and_outage_fails_open() {
    let listed = BlockingEngine::builder(config())
        .threat_intel(Arc::new(ListedIntel(ip("198.51.100.66"))))
        .build()
        .await
        .unwrap();
    let decision = listed.evaluate(&get("/", "198.51.100.66")).await;
    assert_eq!(decision.matched_check(), CheckKind::ThreatIntel);
    assert!(decision.reason().contains("botnet"));

    let down = BlockingEngine::builder(config())
        .threat_intel(Arc::new(DownIntel))
        .build()
        .await
        .unwrap();
    assert_eq!(down.evaluate(&get("/", "198.51.100.66")).await.action(), Action::Allow);
    assert_eq!(down.stats().check_failures.get("threat_intel"), Some(&1));
}

#[tokio::test]
async fn storage_outage_fails_open_with_alert() {
    let engine = BlockingEngine::builder(config())
        .block_store(Arc::new(DownStore))
        .build()
        .await
        .unwrap();

    let benign = engine.evaluate(&get("/", "192.0.2.90")).await;
    assert_eq!(benign.action(), Action::Allow);

    // Detection still works; only the block write fails.
    let attack = get("/files?name=../../etc/passwd", "192.0.2.90");
    let decision = engine.evaluate(&attack).await;
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::Signature);

    let stats = engine.stats();
    assert!(stats.storage_alerts >= 3);
    assert_eq!(stats.check_failures.get("active_block"), Some(&2));
    assert!(engine.list_active_blocks().is_err());
}

#[tokio::test]
async fn malformed_input_is_blocked_without_active_block() {
    let engine = BlockingEngine::builder(config()).build().await.unwrap();

    for bad in [
        RequestRecord::new("GET", "/", "999.1.1.1"),
        RequestRecord::new("", "/", "192.0.2.5"),
        RequestRecord::new("GET", "no-slash", "192.0.2.5"),
    ] {
        let decision = engine.evaluate(&bad).await;
        assert!(decision.is_blocked());
        assert_eq!(decision.matched_check(), CheckKind::MalformedInput);
    }
    assert!(engine.list_active_blocks().unwrap().is_empty());
}

#[tokio::test]
async fn undecodable_input_is_rejected_and_published() {
    let sink = Arc::new(MemorySink::new());
    let engine = BlockingEngine::builder(config())
        .event_sink(sink.clone())
        .build()
        .await
        .unwrap();

    let decision = engine.reject_malformed("unparseable request record: EOF");
    assert!(decision.is_blocked());
    assert_eq!(decision.matched_check(), CheckKind::MalformedInput);
    assert!(!decision.request_id().is_empty());
    assert_eq!(engine.stats().by_check.get("malformed_input"), Some(&1));
    assert!(engine.list_active_blocks().unwrap().is_empty());

    engine.shutdown().await;
    let events = sink.events();
    assert!(matches!(
        events.as_slice(),
        [EngineEvent::Decision { client_ip: None, .. }]
    ));
}

struct StaticRules(Vec<BlockingRule>);

#[async_trait::async_trait]
impl blockgate_engine::RuleRepository for StaticRules {
    async fn fetch_rules(&self) -> anyhow::Result<Vec<BlockingRule>> {
        Ok(self.0.clone())
    }
}

fn rule(id: &str, priority: i32, action: RuleAction, field: Field, op: Operator, value: &str) -> BlockingRule {
    BlockingRule {
        id: id.into(),
        name: id.into(),
        rule_type: RuleType::Custom,
        conditions: Condition::Match(Predicate {
            field,
            op,
            value: Some(ConditionValue::Text(value.into())),
        }),
        action,
        priority,
        enabled: true,
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn rules_block_allow_and_flag() {
    let rules = vec![
        rule("watch-admin", 100, RuleAction::Flag, Field::Path, Operator::StartsWith, "/admin"),
        rule("allow-health", 50, RuleAction::Allow, Field::Path, Operator::Equals, "/admin/health"),
        rule("deny-admin", 10, RuleAction::Block, Field::Path, Operator::StartsWith, "/admin"),
    ];
    let engine = BlockingEngine::builder(config())
        .rule_repository(Arc::new(StaticRules(rules)))
        .build()
        .await
        .unwrap();

    let health = engine.evaluate(&get("/admin/health", "192.0.2.120")).await;
    assert_eq!(health.action(), Action::Allow);
    assert_eq!(health.matched_check(), CheckKind::Rule);
    assert_eq!(health.rule_id(), Some("allow-health"));

    let users = engine.evaluate(&get("/admin/users", "192.0.2.121")).await;
    assert!(users.is_blocked());
    assert_eq!(users.rule_id(), Some("deny-admin"));
    let blocks = engine.list_active_blocks().unwrap();
    assert_eq!(blocks[0].rule_id.as_deref(), Some("deny-admin"));

    assert!(engine
        .metrics_text()
        .contains("blockgate_rule_flags_total{rule_id=\"watch-admin\"} 2"));
}

#[tokio::test]
async fn decisions_and_block_changes_are_published() {
    let sink = Arc::new(MemorySink::new());
    let engine = BlockingEngine::builder(config())
        .event_sink(sink.clone())
        .build()
        .await
        .unwrap();

    engine.evaluate(&get("/", "192.0.2.130")).await;
    let attack = RequestRecord::new("POST", "/login", "203.0.113.5").with_body("'; DROP TABLE users;--");
    engine.evaluate(&attack).await;
    engine.shutdown().await;

    let events = sink.events();
    let decisions = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Decision { .. }))
        .count();
    assert_eq!(decisions, 2);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Block { kind: BlockEventKind::Created, entry } if entry.ip == ip("203.0.113.5")
    )));
}

#[tokio::test]
async fn full_event_queue_drops_without_blocking_decisions() {
    let mut cfg = config();
    cfg.events.queue_capacity = 1;
    let engine = BlockingEngine::builder(cfg)
        .event_sink(Arc::new(StuckSink))
        .build()
        .await
        .unwrap();

    for i in 0..10 {
        let decision = engine.evaluate(&get("/", &format!("192.0.2.{}", 140 + i))).await;
        assert_eq!(decision.action(), Action::Allow);
    }
    // One event in the stuck sink, at most one queued.
    assert!(engine.stats().dropped_events >= 8);
}
