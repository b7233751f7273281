//! Storage seam for active blocks.
//!
//! The pipeline talks to blocks through [`BlockStore`] so a shared backend
//! can stand in for the in-process map; any error it returns is treated as
//! storage unavailability and fails open.

use std::net::IpAddr;

use blockgate_active_blocks::{ActiveBlockStore, BlockEntry, BlockOutcome, BlockRequest};
use blockgate_common::BlockgateError;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("block store unavailable: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for BlockgateError {
    fn from(err: StoreError) -> Self {
        BlockgateError::Storage(err.0)
    }
}

pub trait BlockStore: Send + Sync {
    fn lookup(&self, ip: IpAddr, now: DateTime<Utc>) -> Result<Option<BlockEntry>, StoreError>;

    fn create_or_extend(
        &self,
        ip: IpAddr,
        request: BlockRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<BlockOutcome, StoreError>;

    fn unblock(&self, ip: IpAddr) -> Result<Option<BlockEntry>, StoreError>;

    /// Remove expired entries, returning them.
    fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError>;

    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError>;
}

impl BlockStore for ActiveBlockStore {
    fn lookup(&self, ip: IpAddr, now: DateTime<Utc>) -> Result<Option<BlockEntry>, StoreError> {
        Ok(self.is_blocked_at(ip, now))
    }

    fn create_or_extend(
        &self,
        ip: IpAddr,
        request: BlockRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<BlockOutcome, StoreError> {
        Ok(self.create_or_extend_at(ip, request, now))
    }

    fn unblock(&self, ip: IpAddr) -> Result<Option<BlockEntry>, StoreError> {
        Ok(ActiveBlockStore::unblock(self, ip))
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError> {
        Ok(ActiveBlockStore::sweep(self, now))
    }

    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlockEntry>, StoreError> {
        Ok(ActiveBlockStore::list_active(self, now))
    }
}
