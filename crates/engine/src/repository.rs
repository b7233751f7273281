//! Sources of rules and list snapshots, pulled on each refresh.

use std::path::PathBuf;

use async_trait::async_trait;
use blockgate_common::{IpListsConfig, ListKind};
use blockgate_ip_lists::{parse_list_file, ListEntry};
use blockgate_rules::{load_rules_file, BlockingRule};

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn fetch_rules(&self) -> anyhow::Result<Vec<BlockingRule>>;
}

#[async_trait]
pub trait ListRepository: Send + Sync {
    /// Current snapshot of `kind`, or `None` when this repository does not
    /// manage that list.
    async fn fetch_list(&self, kind: ListKind) -> anyhow::Result<Option<Vec<ListEntry>>>;
}

/// Rules read from a YAML file on every refresh.
pub struct FileRuleRepository {
    path: PathBuf,
}

impl FileRuleRepository {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RuleRepository for FileRuleRepository {
    async fn fetch_rules(&self) -> anyhow::Result<Vec<BlockingRule>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_rules_file(&path)).await?
    }
}

/// Whitelist and blacklist read from plain-text files.
pub struct FileListRepository {
    whitelist: Option<PathBuf>,
    blacklist: Option<PathBuf>,
}

impl FileListRepository {
    pub fn new(whitelist: Option<PathBuf>, blacklist: Option<PathBuf>) -> Self {
        Self {
            whitelist,
            blacklist,
        }
    }

    pub fn from_config(config: &IpListsConfig) -> Option<Self> {
        if config.whitelist.is_none() && config.blacklist.is_none() {
            return None;
        }
        Some(Self::new(config.whitelist.clone(), config.blacklist.clone()))
    }
}

#[async_trait]
impl ListRepository for FileListRepository {
    async fn fetch_list(&self, kind: ListKind) -> anyhow::Result<Option<Vec<ListEntry>>> {
        let path = match kind {
            ListKind::Whitelist => self.whitelist.clone(),
            ListKind::Blacklist => self.blacklist.clone(),
        };
        let Some(path) = path else {
            return Ok(None);
        };
        let entries = tokio::task::spawn_blocking(move || parse_list_file(&path)).await??;
        Ok(Some(entries))
    }
}
