//! User-defined blocking rules.
//!
//! Rules arrive from a repository as plain data ([`BlockingRule`]), are
//! compiled into a [`RuleSet`] sorted by descending priority, and published
//! to the hot path through an `ArcSwap` so refreshes never stall evaluation.

mod condition;
pub mod loader;

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use blockgate_common::{BlockgateError, RequestRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use condition::{Condition, ConditionValue, Field, Operator, Predicate};
pub use loader::load_rules_file;

use condition::{CompiledCondition, EvalContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Ip,
    Rate,
    Geo,
    Signature,
    Anomaly,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Allow,
    Flag,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingRule {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_rule_type")]
    pub rule_type: RuleType,
    pub conditions: Condition,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_rule_type() -> RuleType {
    RuleType::Custom
}

struct CompiledRule {
    rule: BlockingRule,
    condition: CompiledCondition,
}

/// Result of running the rule set against one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleVerdict {
    Block { rule_id: String, name: String },
    Allow { rule_id: String },
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub verdict: RuleVerdict,
    /// Ids of `flag` rules that matched before evaluation stopped.
    pub flagged: Vec<String>,
}

/// An immutable, priority-ordered collection of compiled rules.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile `rules`, skipping any that fail to compile.
    pub fn compile(rules: Vec<BlockingRule>) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match compile_rule(&rule) {
                Ok(condition) => compiled.push(CompiledRule { rule, condition }),
                Err(e) => warn!(rule_id = %rule.id, error = %e, "skipping invalid rule"),
            }
        }
        // Stable sort keeps repository order among equal priorities.
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule ids in evaluation order.
    pub fn ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.rule.id.clone()).collect()
    }

    pub fn evaluate(&self, request: &RequestRecord, ip: IpAddr) -> RuleOutcome {
        let ctx = EvalContext { request, ip };
        let mut flagged = Vec::new();

        for compiled in self.rules.iter().filter(|r| r.rule.enabled) {
            if !compiled.condition.eval(&ctx) {
                continue;
            }
            let rule = &compiled.rule;
            match rule.action {
                RuleAction::Block => {
                    return RuleOutcome {
                        verdict: RuleVerdict::Block {
                            rule_id: rule.id.clone(),
                            name: rule.name.clone(),
                        },
                        flagged,
                    };
                }
                RuleAction::Allow => {
                    return RuleOutcome {
                        verdict: RuleVerdict::Allow {
                            rule_id: rule.id.clone(),
                        },
                        flagged,
                    };
                }
                RuleAction::Flag => {
                    debug!(rule_id = %rule.id, client_ip = %ip, "rule flagged request");
                    flagged.push(rule.id.clone());
                }
            }
        }

        RuleOutcome {
            verdict: RuleVerdict::NoMatch,
            flagged,
        }
    }
}

fn compile_rule(rule: &BlockingRule) -> Result<CompiledCondition, BlockgateError> {
    if rule.id.trim().is_empty() {
        return Err(BlockgateError::InvalidRule {
            id: rule.name.clone(),
            message: "rule id must not be empty".into(),
        });
    }
    rule.conditions
        .compile()
        .map_err(|message| BlockgateError::InvalidRule {
            id: rule.id.clone(),
            message,
        })
}

/// Hot-swappable rule set shared by the pipeline and the refresh task.
pub struct RuleEngine {
    current: ArcSwap<RuleSet>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    pub fn with_rules(rules: Vec<BlockingRule>) -> Self {
        let engine = Self::new();
        engine.replace(rules);
        engine
    }

    /// Compile and publish a new rule set. Returns the number of rules that
    /// compiled.
    pub fn replace(&self, rules: Vec<BlockingRule>) -> usize {
        let submitted = rules.len();
        let set = RuleSet::compile(rules);
        let active = set.len();
        self.current.store(Arc::new(set));
        info!(submitted, active, "rule set replaced");
        active
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn evaluate(&self, request: &RequestRecord, ip: IpAddr) -> RuleOutcome {
        self.current.load().evaluate(request, ip)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}
