use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::EngineEvent;

/// Downstream consumer of engine events (message bus, audit store, ...).
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, event: &EngineEvent) -> anyhow::Result<()>;
}

/// Writes each event as one structured log line on the `blockgate::events`
/// target.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &EngineEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(target: "blockgate::events", event = %payload, "engine event");
        Ok(())
    }
}

/// Keeps events in memory. Intended for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every event.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &EngineEvent) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event buffer poisoned"))?
            .push(event.clone());
        Ok(())
    }
}
