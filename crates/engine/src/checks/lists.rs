use std::sync::Arc;

use async_trait::async_trait;
use blockgate_common::{CheckKind, ListKind};
use blockgate_ip_lists::IpListStore;
use tracing::debug;

use crate::check::{Check, CheckContext, CheckError, Verdict};
use crate::store::BlockStore;

pub struct WhitelistCheck {
    lists: Arc<IpListStore>,
}

impl WhitelistCheck {
    pub fn new(lists: Arc<IpListStore>) -> Self {
        Self { lists }
    }
}

#[async_trait]
impl Check for WhitelistCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Whitelist
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        match self.lists.lookup_at(ListKind::Whitelist, ctx.ip, ctx.now) {
            Some(entry) => {
                debug!(client_ip = %ctx.ip, "IP whitelisted, skipping checks");
                Ok(Verdict::allow(format!("whitelisted: {}", entry.reason)))
            }
            None => Ok(Verdict::Proceed),
        }
    }
}

pub struct BlacklistCheck {
    lists: Arc<IpListStore>,
}

impl BlacklistCheck {
    pub fn new(lists: Arc<IpListStore>) -> Self {
        Self { lists }
    }
}

#[async_trait]
impl Check for BlacklistCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Blacklist
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        Ok(match self.lists.is_blacklisted_at(ctx.ip, ctx.now) {
            Some(reason) => Verdict::block(format!("blacklisted: {}", reason)),
            None => Verdict::Proceed,
        })
    }
}

pub struct ActiveBlockCheck {
    blocks: Arc<dyn BlockStore>,
}

impl ActiveBlockCheck {
    pub fn new(blocks: Arc<dyn BlockStore>) -> Self {
        Self { blocks }
    }
}

#[async_trait]
impl Check for ActiveBlockCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::ActiveBlock
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        Ok(match self.blocks.lookup(ctx.ip, ctx.now)? {
            Some(entry) => Verdict::Block {
                reason: format!(
                    "active block until {} ({}: {})",
                    entry.expires_at.to_rfc3339(),
                    entry.matched_check,
                    entry.reason
                ),
                rule_id: entry.rule_id,
            },
            None => Verdict::Proceed,
        })
    }
}
