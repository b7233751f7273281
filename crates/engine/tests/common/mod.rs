#![allow(dead_code)]

use std::io::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blockgate_active_blocks::{BlockEntry, BlockOutcome, BlockRequest};
use blockgate_engine::{
    AnomalyScorer, BlockStore, EngineConfig, EngineEvent, RequestRecord, StoreError, ThreatIntel,
};
use chrono::{DateTime, Utc};

/// Defaults with geo lookups off so tests do not need a database.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.geoip.enabled = false;
    config
}

pub fn get(url: &str, ip: &str) -> RequestRecord {
    RequestRecord::new("GET", url, ip)
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub struct FixedScore(pub f64);

#[async_trait]
impl AnomalyScorer for FixedScore {
    async fn score(&self, _request: &RequestRecord, _ip: IpAddr) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// Scorer that answers only after `delay`.
pub struct SlowScorer {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowScorer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnomalyScorer for SlowScorer {
    async fn score(&self, _request: &RequestRecord, _ip: IpAddr) -> anyhow::Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(1.0)
    }
}

pub struct ListedIntel(pub IpAddr);

#[async_trait]
impl ThreatIntel for ListedIntel {
    async fn lookup(&self, ip: IpAddr) -> anyhow::Result<Option<String>> {
        Ok((ip == self.0).then(|| "known botnet node".to_string()))
    }
}

pub struct DownIntel;

#[async_trait]
impl ThreatIntel for DownIntel {
    async fn lookup(&self, _ip: IpAddr) -> anyhow::Result<Option<String>> {
        anyhow::bail!("feed unreachable")
    }
}

/// Block store whose backend is always down.
pub struct DownStore;

impl BlockStore for DownStore {
    fn lookup(&self, _ip: IpAddr, _now: DateTime<Utc>) -> Result<Option<BlockEntry>, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    fn create_or_extend(
        &self,
        _ip: IpAddr,
        _request: BlockRequest<'_>,
        _now: DateTime<Utc>,
    ) -> Result<BlockOutcome, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    fn unblock(&self, _ip: IpAddr) -> Result<Option<BlockEntry>, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    fn sweep(&self, _now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    fn list_active(&self, _now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError> {
        Err(StoreError("connection refused".into()))
    }
}

/// Event sink that never finishes delivering.
pub struct StuckSink;

#[async_trait]
impl blockgate_engine::EventSink for StuckSink {
    async fn publish(&self, _event: &EngineEvent) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

pub struct TempFile {
    pub path: PathBuf,
}

impl TempFile {
    pub fn new(name: &str, contents: &str) -> Self {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir()
            .join(format!("blockgate_engine_{}_{}_{}", name, id, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        Self { path }
    }

    pub fn rewrite(&self, contents: &str) {
        std::fs::write(&self.path, contents).unwrap();
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
