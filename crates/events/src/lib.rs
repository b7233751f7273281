//! Asynchronous publication of decisions and block lifecycle changes.
//!
//! Callers hand events to [`EventPublisher::publish`], which never waits: the
//! event goes into a bounded queue or, when the queue is full, is dropped and
//! counted. A separate [`EventDrain`] task forwards queued events to an
//! [`EventSink`].

mod sink;

use std::sync::Arc;

use blockgate_active_blocks::BlockEntry;
use blockgate_common::Decision;
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use sink::{EventSink, LogSink, MemorySink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockEventKind {
    Created,
    Extended,
    Expired,
    Unblocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Decision {
        client_ip: Option<String>,
        decision: Decision,
    },
    Block {
        kind: BlockEventKind,
        entry: BlockEntry,
    },
}

/// Counters shared by the publisher and its drain task.
#[derive(Clone)]
pub struct PublisherCounters {
    pub published: IntCounter,
    pub dropped: IntCounter,
    pub failed: IntCounter,
}

impl PublisherCounters {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            published: IntCounter::new(
                "blockgate_events_published_total",
                "Events delivered to the sink",
            )?,
            dropped: IntCounter::new(
                "blockgate_events_dropped_total",
                "Events dropped because the queue was full or closed",
            )?,
            failed: IntCounter::new(
                "blockgate_events_failed_total",
                "Events the sink rejected",
            )?,
        })
    }

    /// Register every counter with `registry`.
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.published.clone()))?;
        registry.register(Box::new(self.dropped.clone()))?;
        registry.register(Box::new(self.failed.clone()))?;
        Ok(())
    }
}

/// Non-blocking handle for enqueueing events. Cheap to clone.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<EngineEvent>,
    counters: PublisherCounters,
}

/// Receiving half; forwards queued events to a sink until shut down.
pub struct EventDrain {
    rx: mpsc::Receiver<EngineEvent>,
    counters: PublisherCounters,
}

/// Create a publisher/drain pair over a queue of `capacity` events.
pub fn channel(capacity: usize, counters: PublisherCounters) -> (EventPublisher, EventDrain) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventPublisher {
            tx,
            counters: counters.clone(),
        },
        EventDrain { rx, counters },
    )
}

impl EventPublisher {
    /// Create a publisher and spawn its drain task on the current runtime.
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        capacity: usize,
        counters: PublisherCounters,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (publisher, drain) = channel(capacity, counters);
        let handle = tokio::spawn(drain.run(sink, shutdown));
        (publisher, handle)
    }

    /// Enqueue `event` without waiting. Returns `false` if it was dropped.
    pub fn publish(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.inc();
                warn!(event = event_name(&event), "event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.inc();
                debug!(event = event_name(&event), "event queue closed, dropping event");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.get()
    }

    pub fn counters(&self) -> &PublisherCounters {
        &self.counters
    }
}

impl EventDrain {
    /// Forward events to `sink` until every publisher is gone or `shutdown`
    /// flips to `true`. Events already queued at shutdown are still delivered.
    pub async fn run(mut self, sink: Arc<dyn EventSink>, mut shutdown: watch::Receiver<bool>) {
        info!("event drain started");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(event) => self.deliver(sink.as_ref(), event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.rx.close();
                        while let Some(event) = self.rx.recv().await {
                            self.deliver(sink.as_ref(), event).await;
                        }
                        break;
                    }
                }
            }
        }
        info!(
            published = self.counters.published.get(),
            failed = self.counters.failed.get(),
            "event drain stopped"
        );
    }

    async fn deliver(&self, sink: &dyn EventSink, event: EngineEvent) {
        match sink.publish(&event).await {
            Ok(()) => self.counters.published.inc(),
            Err(e) => {
                self.counters.failed.inc();
                warn!(event = event_name(&event), error = %e, "event sink rejected event");
            }
        }
    }
}

fn event_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::Decision { .. } => "decision",
        EngineEvent::Block { .. } => "block",
    }
}
