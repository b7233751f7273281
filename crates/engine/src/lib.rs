//! Real-time attack blocking decisions.
//!
//! A [`BlockingEngine`] takes a normalized [`RequestRecord`] and returns an
//! allow/block [`Decision`]. Checks run in a fixed order and the first
//! decisive one wins:
//!
//! 1. whitelist (allow)
//! 2. blacklist
//! 3. active blocks
//! 4. rate limit
//! 5. geo policy
//! 6. attack signatures
//! 7. anomaly score
//! 8. threat intelligence
//! 9. user-defined rules
//!
//! Anything left over is allowed. Every block creates or extends an active
//! block for the client address, and every decision is published as an
//! [`EngineEvent`] without waiting on the downstream sink.

pub mod check;
pub mod checks;
pub mod collaborators;
mod engine;
pub mod metrics;
pub mod pipeline;
pub mod repository;
pub mod store;
mod tasks;

pub use blockgate_common::{Action, CheckKind, Decision, EngineConfig, ListKind, RequestRecord};
pub use blockgate_events::{BlockEventKind, EngineEvent, EventSink, LogSink, MemorySink};
pub use check::{Check, CheckContext, CheckError, Verdict};
pub use collaborators::{AnomalyScorer, GeoResolver, ThreatIntel};
pub use engine::{BlockingEngine, EngineBuilder, EngineStats, RefreshReport};
pub use metrics::EngineMetrics;
pub use pipeline::DecisionPipeline;
pub use repository::{FileListRepository, FileRuleRepository, ListRepository, RuleRepository};
pub use store::{BlockStore, StoreError};
