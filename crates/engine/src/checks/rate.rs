use async_trait::async_trait;
use blockgate_common::{CheckKind, RateLimitConfig};
use blockgate_rate_limit::{rate_key, RateLimiter};
use tracing::info;

use crate::check::{Check, CheckContext, CheckError, Verdict};

/// Counts requests per `ip|path|api_key` and blocks past the endpoint limit.
pub struct RateLimitCheck {
    limiter: RateLimiter,
    config: RateLimitConfig,
}

impl RateLimitCheck {
    pub fn new(limiter: RateLimiter, config: RateLimitConfig) -> Self {
        Self { limiter, config }
    }
}

#[async_trait]
impl Check for RateLimitCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::RateLimit
    }

    async fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<Verdict, CheckError> {
        let path = ctx.request.path();
        let (limit, window) = self.config.limit_for(path);
        let key = rate_key(ctx.ip, path, ctx.request.api_key.as_deref());

        if self.limiter.allow(&key, limit, window) {
            return Ok(Verdict::Proceed);
        }

        info!(client_ip = %ctx.ip, key = %key, limit, "request rate limited");
        Ok(Verdict::block(format!(
            "rate limit exceeded: more than {} requests per {}s on {}",
            limit,
            window.as_secs(),
            path
        )))
    }
}
