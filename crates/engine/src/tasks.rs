//! Background maintenance loops. Each runs on its own interval and exits
//! when the shutdown channel flips to `true`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use blockgate_events::{BlockEventKind, EngineEvent};

use crate::engine::Shared;
use crate::pipeline::block_event_label;

/// Spawn `tick` every `period` until shutdown.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = name, period_secs = period.as_secs(), "background task started");
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "background task stopped");
    })
}

pub(crate) fn spawn_all(shared: Arc<Shared>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let config = &shared.config;
    let mut handles = Vec::new();

    let sweep_period = Duration::from_secs(config.active_blocks.sweep_interval_secs);
    let s = shared.clone();
    handles.push(spawn_periodic("sweep", sweep_period, shutdown.clone(), move || {
        let s = s.clone();
        async move { sweep(&s) }
    }));

    if config.rate_limit.enabled {
        let period = Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1));
        let s = shared.clone();
        handles.push(spawn_periodic("rate-limit-cleanup", period, shutdown.clone(), move || {
            let s = s.clone();
            async move { s.limiter.cleanup() }
        }));
    }

    if shared.list_repository.is_some() {
        let period = Duration::from_secs(config.ip_lists.refresh_interval_secs);
        let s = shared.clone();
        handles.push(spawn_periodic("list-refresh", period, shutdown.clone(), move || {
            let s = s.clone();
            async move {
                if let Err(e) = s.refresh_lists().await {
                    warn!(error = %e, "list refresh failed, keeping previous snapshot");
                }
            }
        }));
    }

    if let Some((resolver, path)) = shared.geo_reload.clone() {
        let period = Duration::from_secs(config.geoip.refresh_interval_secs);
        handles.push(spawn_periodic("geoip-reload", period, shutdown.clone(), move || {
            let resolver = resolver.clone();
            let path = path.clone();
            async move {
                match tokio::task::spawn_blocking(move || resolver.reload(&path)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "GeoIP reload failed, keeping previous database"),
                    Err(e) => error!(error = %e, "GeoIP reload task aborted"),
                }
            }
        }));
    }

    if shared.rule_repository.is_some() {
        let period = Duration::from_secs(config.rules.refresh_interval_secs);
        let s = shared.clone();
        handles.push(spawn_periodic("rule-refresh", period, shutdown, move || {
            let s = s.clone();
            async move {
                if let Err(e) = s.refresh_rules().await {
                    warn!(error = %e, "rule refresh failed, keeping previous rule set");
                }
            }
        }));
    }

    info!(tasks = handles.len(), "background tasks started");
    handles
}

/// Expire active blocks and list entries, publishing one event per expired
/// block.
pub(crate) fn sweep(shared: &Shared) {
    let now = Utc::now();

    match shared.blocks.sweep(now) {
        Ok(expired) => {
            for entry in expired {
                debug!(ip = %entry.ip, check = %entry.matched_check, "active block expired");
                shared
                    .metrics
                    .block_events
                    .with_label_values(&[block_event_label(BlockEventKind::Expired)])
                    .inc();
                shared.publisher.publish(EngineEvent::Block {
                    kind: BlockEventKind::Expired,
                    entry,
                });
            }
        }
        Err(e) => {
            shared.metrics.storage_alerts.inc();
            error!(error = %e, "active block sweep failed");
        }
    }

    match shared.blocks.list_active(now) {
        Ok(active) => shared.metrics.active_blocks.set(active.len() as i64),
        Err(e) => debug!(error = %e, "could not count active blocks"),
    }

    shared.lists.sweep(now);
}
