//! Whitelist / blacklist membership for the decision engine.
//!
//! Each list is an immutable `HashMap<IpAddr, ListEntry>` snapshot held in an
//! [`ArcSwap`]. Lookups load the current snapshot without taking any lock;
//! writers serialize on a per-list mutex, clone the map, apply their change
//! and swap the new snapshot in. Writes are rare (management operations and
//! periodic refresh) so the copy is an acceptable price for lock-free reads.

mod loader;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use blockgate_common::ListKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use loader::parse_list_file;

/// Where a list entry came from.
///
/// Snapshot entries are owned by the external management store and replaced
/// wholesale on refresh. Runtime entries were added through the engine's
/// administrative operations and survive refreshes until removed or expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Snapshot,
    Runtime,
}

/// Membership of a single address in a whitelist or blacklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub ip: IpAddr,
    pub added_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub source: EntrySource,
}

impl ListEntry {
    pub fn new(ip: IpAddr, reason: &str, ttl: Option<Duration>, source: EntrySource) -> Self {
        Self::new_at(ip, reason, ttl, source, Utc::now())
    }

    pub fn new_at(
        ip: IpAddr,
        reason: &str,
        ttl: Option<Duration>,
        source: EntrySource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ip,
            added_at: now,
            // A TTL too large to represent is treated as permanent.
            expires_at: ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .and_then(|ttl| now.checked_add_signed(ttl)),
            reason: reason.to_string(),
            source,
        }
    }

    /// Entries without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }
}

type Snapshot = HashMap<IpAddr, ListEntry>;

/// One copy-on-write list.
struct IpList {
    entries: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
}

impl IpList {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn get(&self, ip: &IpAddr, now: DateTime<Utc>) -> Option<ListEntry> {
        self.entries
            .load()
            .get(ip)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    fn contains(&self, ip: &IpAddr, now: DateTime<Utc>) -> bool {
        self.entries
            .load()
            .get(ip)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Apply `f` to a private copy of the map and publish the result.
    fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&self.entries.load());
        let result = f(&mut next);
        self.entries.store(Arc::new(next));
        result
    }

    fn len(&self) -> usize {
        self.entries.load().len()
    }

    fn entries(&self) -> Vec<ListEntry> {
        self.entries.load().values().cloned().collect()
    }
}

/// Whitelist and blacklist store.
pub struct IpListStore {
    whitelist: IpList,
    blacklist: IpList,
}

impl IpListStore {
    /// Create a store with both lists empty.
    pub fn new() -> Self {
        Self {
            whitelist: IpList::new(),
            blacklist: IpList::new(),
        }
    }

    fn list(&self, kind: ListKind) -> &IpList {
        match kind {
            ListKind::Whitelist => &self.whitelist,
            ListKind::Blacklist => &self.blacklist,
        }
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.contains(&ip, Utc::now())
    }

    /// Returns the blacklist reason if the address is currently blacklisted.
    pub fn is_blacklisted(&self, ip: IpAddr) -> Option<String> {
        self.is_blacklisted_at(ip, Utc::now())
    }

    pub fn is_blacklisted_at(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<String> {
        self.blacklist.get(&ip, now).map(|entry| entry.reason)
    }

    /// Look up the live entry for `ip` in the given list.
    pub fn lookup_at(&self, kind: ListKind, ip: IpAddr, now: DateTime<Utc>) -> Option<ListEntry> {
        self.list(kind).get(&ip, now)
    }

    pub fn add_whitelist(&self, ip: IpAddr, reason: &str, ttl: Option<Duration>) -> ListEntry {
        self.add(ListKind::Whitelist, ListEntry::new(ip, reason, ttl, EntrySource::Runtime))
    }

    pub fn add_blacklist(&self, ip: IpAddr, reason: &str, ttl: Option<Duration>) -> ListEntry {
        self.add(ListKind::Blacklist, ListEntry::new(ip, reason, ttl, EntrySource::Runtime))
    }

    /// Insert or replace the entry for `entry.ip`.
    ///
    /// A list holds at most one entry per address, so repeated adds are
    /// idempotent apart from refreshing the timestamps and reason.
    pub fn add(&self, kind: ListKind, entry: ListEntry) -> ListEntry {
        info!(
            list = %kind,
            ip = %entry.ip,
            reason = %entry.reason,
            expires_at = ?entry.expires_at,
            "list entry added"
        );
        self.list(kind).update(|map| {
            map.insert(entry.ip, entry.clone());
        });
        entry
    }

    /// Remove `ip` from a list. Returns `true` if an entry was present.
    pub fn remove(&self, ip: IpAddr, kind: ListKind) -> bool {
        let removed = self.list(kind).update(|map| map.remove(&ip).is_some());
        if removed {
            info!(list = %kind, ip = %ip, "list entry removed");
        }
        removed
    }

    /// Replace every snapshot-sourced entry of a list with `entries`.
    ///
    /// Runtime entries are kept unless the snapshot carries an entry for the
    /// same address, in which case the snapshot wins.
    pub fn replace_snapshot(&self, kind: ListKind, entries: Vec<ListEntry>) -> usize {
        let count = entries.len();
        self.list(kind).update(|map| {
            map.retain(|_, entry| entry.source == EntrySource::Runtime);
            for mut entry in entries {
                entry.source = EntrySource::Snapshot;
                map.insert(entry.ip, entry);
            }
        });
        debug!(list = %kind, count, "list snapshot replaced");
        count
    }

    /// Parse a list file and install it as the list's snapshot.
    pub fn load_file(&self, kind: ListKind, path: &std::path::Path) -> anyhow::Result<usize> {
        let entries = parse_list_file(path)?;
        let count = self.replace_snapshot(kind, entries);
        info!(list = %kind, path = %path.display(), count, "loaded list file");
        Ok(count)
    }

    /// Drop expired entries from both lists. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for kind in [ListKind::Whitelist, ListKind::Blacklist] {
            let list = self.list(kind);
            // Skip the copy when nothing is due.
            if !list.entries.load().values().any(|e| e.is_expired_at(now)) {
                continue;
            }
            removed += list.update(|map| {
                let before = map.len();
                map.retain(|_, entry| !entry.is_expired_at(now));
                before - map.len()
            });
        }
        if removed > 0 {
            debug!(removed, "expired list entries purged");
        }
        removed
    }

    pub fn entries(&self, kind: ListKind) -> Vec<ListEntry> {
        self.list(kind).entries()
    }

    pub fn len(&self, kind: ListKind) -> usize {
        self.list(kind).len()
    }

    pub fn is_empty(&self, kind: ListKind) -> bool {
        self.len(kind) == 0
    }
}

impl Default for IpListStore {
    fn default() -> Self {
        Self::new()
    }
}
