use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use blockgate_common::{CheckKind, RequestRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// Everything a check may look at for one request.
pub struct CheckContext<'a> {
    pub request: &'a RequestRecord,
    pub ip: IpAddr,
    pub now: DateTime<Utc>,
}

/// What a single check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not decisive; continue with the next check.
    Proceed,
    Allow {
        reason: String,
        rule_id: Option<String>,
    },
    Block {
        reason: String,
        rule_id: Option<String>,
    },
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Verdict::Allow {
            reason: reason.into(),
            rule_id: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Verdict::Block {
            reason: reason.into(),
            rule_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),
}

impl CheckError {
    pub fn collaborator(err: impl std::fmt::Display) -> Self {
        CheckError::CollaboratorUnavailable(err.to_string())
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckError::CollaboratorUnavailable(_) => "unavailable",
            CheckError::Timeout(_) => "timeout",
            CheckError::StorageUnavailable(_) => "storage",
        }
    }
}

/// One stage of the decision pipeline.
#[async_trait]
pub trait Check: Send + Sync {
    fn kind(&self) -> CheckKind;

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError>;
}
