//! TTL-bounded blocks created as a side effect of blocking decisions.
//!
//! Entries live in a [`DashMap`], which partitions keys across independently
//! locked shards. A sweep walks shard by shard, so a lookup only ever waits on
//! the one shard being swept at that moment.

use std::net::IpAddr;
use std::time::Duration;

use blockgate_common::CheckKind;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A temporary block on one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub ip: IpAddr,
    pub reason: String,
    pub matched_check: CheckKind,
    pub rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlockEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// What [`ActiveBlockStore::create_or_extend_at`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// No live entry existed; a new one was inserted.
    Created(BlockEntry),
    /// A live entry existed and its expiry moved later.
    Extended(BlockEntry),
    /// A live entry existed and already outlasted the requested TTL.
    Unchanged(BlockEntry),
}

impl BlockOutcome {
    pub fn entry(&self) -> &BlockEntry {
        match self {
            BlockOutcome::Created(e) | BlockOutcome::Extended(e) | BlockOutcome::Unchanged(e) => e,
        }
    }

    pub fn into_entry(self) -> BlockEntry {
        match self {
            BlockOutcome::Created(e) | BlockOutcome::Extended(e) | BlockOutcome::Unchanged(e) => e,
        }
    }
}

/// Request to block an address, as issued by a pipeline check.
#[derive(Debug, Clone)]
pub struct BlockRequest<'a> {
    pub reason: &'a str,
    pub matched_check: CheckKind,
    pub rule_id: Option<&'a str>,
    pub ttl: Duration,
}

/// Concurrent store of active blocks, at most one per address.
pub struct ActiveBlockStore {
    blocks: DashMap<IpAddr, BlockEntry>,
}

impl ActiveBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
        }
    }

    /// Returns the live block for `ip`, if any.
    pub fn is_blocked(&self, ip: IpAddr) -> Option<BlockEntry> {
        self.is_blocked_at(ip, Utc::now())
    }

    pub fn is_blocked_at(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<BlockEntry> {
        self.blocks
            .get(&ip)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
    }

    pub fn create_or_extend(&self, ip: IpAddr, request: BlockRequest<'_>) -> BlockOutcome {
        self.create_or_extend_at(ip, request, Utc::now())
    }

    /// Create a block or push an existing one's expiry to
    /// `max(existing, now + ttl)`.
    ///
    /// An entry that has already expired (but not yet been swept) is replaced
    /// as if absent. The original reason and check of a live entry are kept.
    pub fn create_or_extend_at(
        &self,
        ip: IpAddr,
        request: BlockRequest<'_>,
        now: DateTime<Utc>,
    ) -> BlockOutcome {
        let ttl = chrono::Duration::from_std(request.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let candidate = now.checked_add_signed(ttl).unwrap_or(now);

        match self.blocks.entry(ip) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired_at(now) => {
                let entry = occupied.get_mut();
                if candidate > entry.expires_at {
                    entry.expires_at = candidate;
                    debug!(ip = %ip, expires_at = %candidate, "active block extended");
                    BlockOutcome::Extended(entry.clone())
                } else {
                    BlockOutcome::Unchanged(entry.clone())
                }
            }
            Entry::Occupied(mut occupied) => {
                let entry = new_entry(ip, &request, now, candidate);
                occupied.insert(entry.clone());
                BlockOutcome::Created(entry)
            }
            Entry::Vacant(vacant) => {
                let entry = new_entry(ip, &request, now, candidate);
                vacant.insert(entry.clone());
                BlockOutcome::Created(entry)
            }
        }
    }

    /// Remove the block for `ip`, returning it if one was present and live.
    pub fn unblock(&self, ip: IpAddr) -> Option<BlockEntry> {
        let now = Utc::now();
        self.blocks
            .remove(&ip)
            .map(|(_, entry)| entry)
            .filter(|entry| !entry.is_expired_at(now))
    }

    /// Remove every entry expired at `now` and return them.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<BlockEntry> {
        let mut expired = Vec::new();
        self.blocks.retain(|_, entry| {
            if entry.is_expired_at(now) {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            debug!(
                expired = expired.len(),
                remaining = self.blocks.len(),
                "active block sweep complete"
            );
        }
        expired
    }

    /// All blocks still live at `now`.
    pub fn list_active(&self, now: DateTime<Utc>) -> Vec<BlockEntry> {
        self.blocks
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for ActiveBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_entry(
    ip: IpAddr,
    request: &BlockRequest<'_>,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> BlockEntry {
    debug!(ip = %ip, check = %request.matched_check, expires_at = %expires_at, "active block created");
    BlockEntry {
        ip,
        reason: request.reason.to_string(),
        matched_check: request.matched_check,
        rule_id: request.rule_id.map(str::to_string),
        created_at: now,
        expires_at,
    }
}
